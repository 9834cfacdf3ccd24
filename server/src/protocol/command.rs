use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{Event, Payload};
use crate::error::EnvelopeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardsQuery {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeOffer {
    pub from_user_id: String,
    pub to_user_id: String,
    pub card_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAction {
    pub user_id: String,
    pub match_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub user_id: String,
    pub match_id: String,
    pub card_id: String,
}

/// Typed view of an [`Event`], validated once at the envelope boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register(Credentials),
    Login(Credentials),
    GetCards(CardsQuery),
    BuyPack(UserRef),
    OfferTrade(TradeOffer),
    AcceptTrade(TradeOffer),
    StartMatch(UserRef),
    JoinMatch(MatchAction),
    SurrenderMatch(MatchAction),
    MakeMove(MoveRequest),
    /// A method this node does not know. Kept so newer clients can still be
    /// routed and answered with an error instead of being dropped.
    Other { method: String, payload: Payload },
}

impl Command {
    /// Validate the payload of `event` against the shape its method expects.
    pub fn parse(event: &Event) -> Result<Self, EnvelopeError> {
        let payload = &event.payload;
        let command = match event.method.as_str() {
            "register" => Command::Register(fields(payload)?),
            "login" => Command::Login(fields(payload)?),
            "get_cards" => Command::GetCards(fields(payload)?),
            "buy_pack" => Command::BuyPack(fields(payload)?),
            "offer_trade" => Command::OfferTrade(fields(payload)?),
            "accept_trade" => Command::AcceptTrade(fields(payload)?),
            "start_match" => Command::StartMatch(fields(payload)?),
            "join_match" => Command::JoinMatch(fields(payload)?),
            "surrender_match" => Command::SurrenderMatch(fields(payload)?),
            "make_move" => Command::MakeMove(fields(payload)?),
            other => Command::Other {
                method: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(command)
    }

    pub fn method(&self) -> &str {
        match self {
            Command::Register(_) => "register",
            Command::Login(_) => "login",
            Command::GetCards(_) => "get_cards",
            Command::BuyPack(_) => "buy_pack",
            Command::OfferTrade(_) => "offer_trade",
            Command::AcceptTrade(_) => "accept_trade",
            Command::StartMatch(_) => "start_match",
            Command::JoinMatch(_) => "join_match",
            Command::SurrenderMatch(_) => "surrender_match",
            Command::MakeMove(_) => "make_move",
            Command::Other { method, .. } => method,
        }
    }
}

fn fields<T: DeserializeOwned>(payload: &Payload) -> Result<T, EnvelopeError> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))
}
