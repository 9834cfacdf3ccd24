use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::auth::Authenticator;
use super::domain::{Card, GameError, Match, User, PACK};
use super::GameHandler;
use crate::error::HandlerError;
use crate::protocol::{
    payload_from, CardsQuery, Credentials, Event, MatchAction, MoveRequest, TradeOffer, UserRef,
};

/// Everything the in-memory handler owns. Serialized whole into snapshots.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStore {
    pub users: BTreeMap<String, User>,
    pub cards: BTreeMap<String, Card>,
    pub matches: BTreeMap<String, Match>,
    /// Pending trade offers keyed by card id.
    pub offers: BTreeMap<String, TradeOffer>,
    next_user: u64,
    next_card: u64,
    next_match: u64,
}

impl GameStore {
    fn user(&self, user_id: &str) -> Result<&User, GameError> {
        self.users.get(user_id).ok_or(GameError::UserNotFound)
    }

    fn owned_card(&self, card_id: &str, owner_id: &str) -> Result<&Card, GameError> {
        let card = self.cards.get(card_id).ok_or(GameError::CardNotFound)?;
        if card.owner_id != owner_id {
            return Err(GameError::CardNotOwned);
        }
        Ok(card)
    }

    fn match_mut(&mut self, match_id: &str) -> Result<&mut Match, GameError> {
        self.matches.get_mut(match_id).ok_or(GameError::MatchNotFound)
    }
}

/// Reference [`GameHandler`] keeping users, cards and matches in memory.
pub struct MemoryHandler {
    store: GameStore,
    auth: Authenticator,
}

impl MemoryHandler {
    pub fn new(auth: Authenticator) -> Self {
        Self {
            store: GameStore::default(),
            auth,
        }
    }

    pub fn store(&self) -> &GameStore {
        &self.store
    }

    fn register_user(&mut self, creds: &Credentials) -> Result<String, GameError> {
        if creds.username.trim().is_empty() {
            return Err(GameError::EmptyUsername);
        }
        if self.store.users.values().any(|u| u.username == creds.username) {
            return Err(GameError::UsernameTaken);
        }
        self.store.next_user += 1;
        let id = format!("user-{}", self.store.next_user);
        let user = User {
            id: id.clone(),
            username: creds.username.clone(),
            password_digest: self.auth.password_digest(&creds.username, &creds.password),
        };
        self.store.users.insert(id.clone(), user);
        Ok(id)
    }

    fn authenticate(&self, creds: &Credentials) -> Result<String, GameError> {
        self.store
            .users
            .values()
            .find(|u| {
                u.username == creds.username
                    && self
                        .auth
                        .check_password(&creds.username, &creds.password, &u.password_digest)
            })
            .map(|u| u.id.clone())
            .ok_or(GameError::InvalidCredentials)
    }

    fn cards_of(&self, query: &CardsQuery) -> Result<Vec<Card>, GameError> {
        if !self.auth.verify_token(&query.user_id, &query.token) {
            return Err(GameError::InvalidToken);
        }
        self.store.user(&query.user_id)?;
        Ok(self
            .store
            .cards
            .values()
            .filter(|c| c.owner_id == query.user_id)
            .cloned()
            .collect())
    }

    fn open_pack(&mut self, user_id: &str) -> Result<Vec<String>, GameError> {
        self.store.user(user_id)?;
        let mut ids = Vec::with_capacity(PACK.len());
        for kind in PACK {
            self.store.next_card += 1;
            let id = format!("card-{}", self.store.next_card);
            self.store.cards.insert(
                id.clone(),
                Card {
                    id: id.clone(),
                    owner_id: user_id.to_string(),
                    kind,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn record_offer(&mut self, offer: &TradeOffer) -> Result<(), GameError> {
        if offer.from_user_id == offer.to_user_id {
            return Err(GameError::SelfTrade);
        }
        self.store.user(&offer.from_user_id)?;
        self.store.user(&offer.to_user_id)?;
        self.store.owned_card(&offer.card_id, &offer.from_user_id)?;
        self.store.offers.insert(offer.card_id.clone(), offer.clone());
        Ok(())
    }

    fn complete_trade(&mut self, offer: &TradeOffer) -> Result<(), GameError> {
        match self.store.offers.get(&offer.card_id) {
            Some(pending) if pending == offer => {}
            _ => return Err(GameError::NoPendingOffer),
        }
        self.store.user(&offer.to_user_id)?;
        // Ownership may have moved since the offer was made.
        self.store.owned_card(&offer.card_id, &offer.from_user_id)?;
        self.store.offers.remove(&offer.card_id);
        if let Some(card) = self.store.cards.get_mut(&offer.card_id) {
            card.owner_id = offer.to_user_id.clone();
        }
        Ok(())
    }

    fn open_match(&mut self, user_id: &str) -> Result<Match, GameError> {
        self.store.user(user_id)?;
        self.store.next_match += 1;
        let id = format!("match-{}", self.store.next_match);
        let m = Match::new(id.clone(), user_id.to_string());
        self.store.matches.insert(id, m.clone());
        Ok(m)
    }
}

/// `<method>_ok` with `payload`, or `<method>_fail` with the error.
fn reply<T>(request: &Event, result: Result<T, GameError>, payload: impl FnOnce(T) -> serde_json::Value) -> Event {
    match result {
        Ok(value) => request.reply_ok(payload_from(payload(value))),
        Err(e) => {
            debug!(method = %request.method, error = %e, "command rejected");
            request.reply_fail(e.to_string())
        }
    }
}

impl GameHandler for MemoryHandler {
    fn register(&mut self, request: &Event, credentials: &Credentials) -> Event {
        let result = self.register_user(credentials);
        reply(request, result, |user_id| {
            json!({"user_id": user_id, "username": credentials.username})
        })
    }

    fn login(&mut self, request: &Event, credentials: &Credentials) -> Event {
        let result = self.authenticate(credentials);
        reply(request, result, |user_id| {
            let token = self.auth.issue_token(&user_id);
            json!({"user_id": user_id, "status": "success", "token": token})
        })
    }

    fn get_cards(&mut self, request: &Event, query: &CardsQuery) -> Event {
        let result = self.cards_of(query);
        reply(request, result, |cards| json!({"cards": cards}))
    }

    fn buy_pack(&mut self, request: &Event, user: &UserRef) -> Event {
        let result = self.open_pack(&user.user_id);
        reply(request, result, |cards| json!({"user_id": user.user_id, "cards": cards}))
    }

    fn offer_trade(&mut self, request: &Event, offer: &TradeOffer) -> Event {
        let result = self.record_offer(offer);
        reply(request, result, |()| json!(offer))
    }

    fn accept_trade(&mut self, request: &Event, offer: &TradeOffer) -> Event {
        let result = self.complete_trade(offer);
        reply(request, result, |()| json!(offer))
    }

    fn start_match(&mut self, request: &Event, user: &UserRef) -> Event {
        let result = self.open_match(&user.user_id);
        reply(request, result, |m| json!({"match": m}))
    }

    fn join_match(&mut self, request: &Event, action: &MatchAction) -> Event {
        let result = self.store.user(&action.user_id).map(|_| ()).and_then(|()| {
            self.store.match_mut(&action.match_id)?.add_player(&action.user_id)
        });
        reply(request, result, |()| json!(action))
    }

    fn surrender_match(&mut self, request: &Event, action: &MatchAction) -> Event {
        let result = self
            .store
            .match_mut(&action.match_id)
            .and_then(|m| m.surrender(&action.user_id));
        reply(request, result, |winner| {
            json!({"user_id": action.user_id, "match_id": action.match_id, "winner": winner})
        })
    }

    fn make_move(&mut self, request: &Event, mv: &MoveRequest) -> Event {
        let result = self.store.match_mut(&mv.match_id).map(|_| ()).and_then(|()| {
            let kind = match self.store.owned_card(&mv.card_id, &mv.user_id) {
                Ok(card) => card.kind,
                Err(GameError::CardNotOwned) => return Err(GameError::MoveCardNotOwned),
                Err(e) => return Err(e),
            };
            let m = self.store.match_mut(&mv.match_id)?;
            let outcome = m.make_move(&mv.user_id, kind)?;
            Ok((outcome, m.scores.clone()))
        });
        reply(request, result, |(outcome, scores)| {
            json!({
                "user_id": mv.user_id,
                "match_id": mv.match_id,
                "card_id": mv.card_id,
                "round": outcome.round,
                "round_complete": outcome.round_complete,
                "round_winner": outcome.round_winner,
                "winner": outcome.match_winner,
                "scores": scores,
            })
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>, HandlerError> {
        serde_json::to_vec(&self.store).map_err(HandlerError::Snapshot)
    }

    fn restore(&mut self, state: &[u8]) -> Result<(), HandlerError> {
        self.store = if state.is_empty() {
            GameStore::default()
        } else {
            serde_json::from_slice(state).map_err(HandlerError::Restore)?
        };
        Ok(())
    }
}
