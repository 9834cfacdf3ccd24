//! Wire envelope shared by clients, the bus and the replicated log.

pub mod command;
pub mod event;
pub mod topics;

pub use command::{CardsQuery, Command, Credentials, MatchAction, MoveRequest, TradeOffer, UserRef};
pub use event::{payload_from, Event, Payload};
pub use topics::{reply_topic, INBOUND_TOPICS};
