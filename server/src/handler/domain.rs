//! Card, user and match rules used by the in-memory handler.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Round wins needed to take a match (best of three).
pub const ROUNDS_TO_WIN: u32 = 2;

pub const MAX_PLAYERS: usize = 2;

/// Kinds handed out by `buy_pack`, in order.
pub const PACK: [CardKind; 5] = [
    CardKind::Rock,
    CardKind::Paper,
    CardKind::Scissors,
    CardKind::Rock,
    CardKind::Paper,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("username already taken")]
    UsernameTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("user not found")]
    UserNotFound,
    #[error("card not found")]
    CardNotFound,
    #[error("match not found")]
    MatchNotFound,
    #[error("card is not owned by user")]
    CardNotOwned,
    #[error("player does not own this card")]
    MoveCardNotOwned,
    #[error("no pending trade offer for this card")]
    NoPendingOffer,
    #[error("cannot trade with yourself")]
    SelfTrade,
    #[error("match is full")]
    MatchFull,
    #[error("player already in match")]
    AlreadyInMatch,
    #[error("player not in match")]
    NotInMatch,
    #[error("match has already ended")]
    MatchEnded,
    #[error("not enough players to make a move")]
    NotEnoughPlayers,
    #[error("not enough players in the match to determine a winner")]
    NotEnoughToSurrender,
    #[error("player has already made a move this round")]
    AlreadyMoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Rock,
    Paper,
    Scissors,
}

impl CardKind {
    /// Outcome of playing `self` against `other`.
    pub fn against(self, other: CardKind) -> Ordering {
        use CardKind::*;
        match (self, other) {
            (a, b) if a == b => Ordering::Equal,
            (Rock, Scissors) | (Scissors, Paper) | (Paper, Rock) => Ordering::Greater,
            _ => Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub owner_id: String,
    pub kind: CardKind,
}

/// Result of a single accepted move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub round: usize,
    pub round_complete: bool,
    /// Set when a completed round was not a draw.
    pub round_winner: Option<String>,
    pub match_winner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub players: Vec<String>,
    /// One entry per round; a round is complete once both players moved.
    pub rounds: Vec<BTreeMap<String, CardKind>>,
    pub scores: BTreeMap<String, u32>,
    pub winner: Option<String>,
}

impl Match {
    pub fn new(id: String, host: String) -> Self {
        let mut scores = BTreeMap::new();
        scores.insert(host.clone(), 0);
        Self {
            id,
            players: vec![host],
            rounds: Vec::new(),
            scores,
            winner: None,
        }
    }

    pub fn add_player(&mut self, user_id: &str) -> Result<(), GameError> {
        if self.players.iter().any(|p| p == user_id) {
            return Err(GameError::AlreadyInMatch);
        }
        if self.players.len() >= MAX_PLAYERS {
            return Err(GameError::MatchFull);
        }
        self.players.push(user_id.to_string());
        self.scores.insert(user_id.to_string(), 0);
        Ok(())
    }

    pub fn make_move(&mut self, user_id: &str, kind: CardKind) -> Result<MoveOutcome, GameError> {
        if self.winner.is_some() {
            return Err(GameError::MatchEnded);
        }
        if self.players.len() < MAX_PLAYERS {
            return Err(GameError::NotEnoughPlayers);
        }
        if !self.players.iter().any(|p| p == user_id) {
            return Err(GameError::NotInMatch);
        }

        let needs_new_round = self
            .rounds
            .last()
            .map_or(true, |round| round.len() == MAX_PLAYERS);
        if needs_new_round {
            self.rounds.push(BTreeMap::new());
        }
        let round_no = self.rounds.len();
        let Some(round) = self.rounds.last_mut() else {
            return Err(GameError::NotEnoughPlayers);
        };
        if round.contains_key(user_id) {
            return Err(GameError::AlreadyMoved);
        }
        round.insert(user_id.to_string(), kind);

        let mut outcome = MoveOutcome {
            round: round_no,
            round_complete: round.len() == MAX_PLAYERS,
            round_winner: None,
            match_winner: None,
        };
        if !outcome.round_complete {
            return Ok(outcome);
        }

        // Resolve in join order so every replica scores the round the same way.
        let first = &self.players[0];
        let second = &self.players[1];
        let (Some(&a), Some(&b)) = (round.get(first), round.get(second)) else {
            return Ok(outcome);
        };
        let winner = match a.against(b) {
            Ordering::Greater => Some(first.clone()),
            Ordering::Less => Some(second.clone()),
            Ordering::Equal => None,
        };
        if let Some(winner) = &winner {
            let score = self.scores.entry(winner.clone()).or_insert(0);
            *score += 1;
            if *score >= ROUNDS_TO_WIN {
                self.winner = Some(winner.clone());
            }
        }
        outcome.round_winner = winner;
        outcome.match_winner = self.winner.clone();
        Ok(outcome)
    }

    /// Concede the match; the other player wins.
    pub fn surrender(&mut self, user_id: &str) -> Result<String, GameError> {
        if self.winner.is_some() {
            return Err(GameError::MatchEnded);
        }
        if self.players.len() < MAX_PLAYERS {
            return Err(GameError::NotEnoughToSurrender);
        }
        if !self.players.iter().any(|p| p == user_id) {
            return Err(GameError::NotInMatch);
        }
        let winner = self
            .players
            .iter()
            .find(|p| p.as_str() != user_id)
            .cloned()
            .ok_or(GameError::NotEnoughToSurrender)?;
        self.winner = Some(winner.clone());
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_match() -> Match {
        let mut m = Match::new("match-1".into(), "alice".into());
        m.add_player("bob").unwrap();
        m
    }

    #[test]
    fn test_card_rules() {
        assert_eq!(CardKind::Rock.against(CardKind::Scissors), Ordering::Greater);
        assert_eq!(CardKind::Scissors.against(CardKind::Paper), Ordering::Greater);
        assert_eq!(CardKind::Paper.against(CardKind::Rock), Ordering::Greater);
        assert_eq!(CardKind::Rock.against(CardKind::Paper), Ordering::Less);
        assert_eq!(CardKind::Paper.against(CardKind::Paper), Ordering::Equal);
    }

    #[test]
    fn test_match_capacity() {
        let mut m = full_match();
        assert_eq!(m.add_player("bob"), Err(GameError::AlreadyInMatch));
        assert_eq!(m.add_player("carol"), Err(GameError::MatchFull));
    }

    #[test]
    fn test_move_requires_two_players() {
        let mut m = Match::new("match-1".into(), "alice".into());
        assert_eq!(m.make_move("alice", CardKind::Rock), Err(GameError::NotEnoughPlayers));
    }

    #[test]
    fn test_round_completion_and_win() {
        let mut m = full_match();

        let first = m.make_move("alice", CardKind::Rock).unwrap();
        assert!(!first.round_complete);
        assert_eq!(m.make_move("alice", CardKind::Rock), Err(GameError::AlreadyMoved));

        let second = m.make_move("bob", CardKind::Scissors).unwrap();
        assert!(second.round_complete);
        assert_eq!(second.round_winner.as_deref(), Some("alice"));
        assert_eq!(m.scores["alice"], 1);

        m.make_move("bob", CardKind::Paper).unwrap();
        let last = m.make_move("alice", CardKind::Scissors).unwrap();
        assert_eq!(last.round, 2);
        assert_eq!(last.match_winner.as_deref(), Some("alice"));
        assert_eq!(m.make_move("bob", CardKind::Rock), Err(GameError::MatchEnded));
    }

    #[test]
    fn test_draw_scores_nothing() {
        let mut m = full_match();
        m.make_move("alice", CardKind::Paper).unwrap();
        let outcome = m.make_move("bob", CardKind::Paper).unwrap();
        assert!(outcome.round_complete);
        assert_eq!(outcome.round_winner, None);
        assert_eq!(m.scores["alice"] + m.scores["bob"], 0);
    }

    #[test]
    fn test_surrender() {
        let mut m = full_match();
        assert_eq!(m.surrender("carol"), Err(GameError::NotInMatch));
        assert_eq!(m.surrender("alice").unwrap(), "bob");
        assert_eq!(m.surrender("bob"), Err(GameError::MatchEnded));
    }
}
