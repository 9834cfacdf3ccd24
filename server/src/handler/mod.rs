//! Business handler contract consumed by the replicated state machine.

pub mod auth;
pub mod domain;
pub mod memory;

pub use auth::Authenticator;
pub use memory::MemoryHandler;

use crate::error::HandlerError;
use crate::protocol::{
    CardsQuery, Credentials, Event, MatchAction, MoveRequest, TradeOffer, UserRef,
};

/// Interprets committed commands.
///
/// Every operation receives the original request event (for its timestamp and
/// method) plus the typed payload, and returns the reply event: `<method>_ok`
/// with result fields or `<method>_fail` with `{error}`. Implementations must
/// be deterministic since every replica applies the same log.
pub trait GameHandler: Send + Sync + 'static {
    fn register(&mut self, request: &Event, credentials: &Credentials) -> Event;
    fn login(&mut self, request: &Event, credentials: &Credentials) -> Event;
    fn get_cards(&mut self, request: &Event, query: &CardsQuery) -> Event;
    fn buy_pack(&mut self, request: &Event, user: &UserRef) -> Event;
    fn offer_trade(&mut self, request: &Event, offer: &TradeOffer) -> Event;
    fn accept_trade(&mut self, request: &Event, offer: &TradeOffer) -> Event;
    fn start_match(&mut self, request: &Event, user: &UserRef) -> Event;
    fn join_match(&mut self, request: &Event, action: &MatchAction) -> Event;
    fn surrender_match(&mut self, request: &Event, action: &MatchAction) -> Event;
    fn make_move(&mut self, request: &Event, mv: &MoveRequest) -> Event;

    /// Serialized handler state for raft snapshots. Handlers that keep their
    /// state outside the process can leave this empty.
    fn snapshot(&self) -> Result<Vec<u8>, HandlerError> {
        Ok(Vec::new())
    }

    fn restore(&mut self, _state: &[u8]) -> Result<(), HandlerError> {
        Ok(())
    }
}
