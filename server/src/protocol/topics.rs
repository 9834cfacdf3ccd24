use super::event::Event;

/// Topic filters a node consumes client commands from. `user/cards` and
/// `trade/+` carry `get_cards` and the trade commands.
pub const INBOUND_TOPICS: &[&str] = &[
    "user/register",
    "user/login",
    "user/cards",
    "chat/room/+",
    "game/start_game",
    "game/join_game",
    "game/+/play_card",
    "game/+/surrender",
    "game/actions",
    "store/buy",
    "cards/+/+",
    "trade/+",
];

const DEFAULT_CHAT_ROOM: &str = "messages";

/// Bus destination for the reply to `request`.
pub fn reply_topic(request: &Event) -> String {
    match request.method.as_str() {
        "register" => "user/register/events".to_string(),
        "login" => "user/login/events".to_string(),
        "chat" => {
            let room = request
                .str_field("room_id")
                .filter(|room| !room.is_empty())
                .unwrap_or(DEFAULT_CHAT_ROOM);
            format!("chat/room/{room}")
        }
        method => format!("responses/{method}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::topic_matches;
    use crate::protocol::event::{payload_from, Payload};
    use serde_json::json;

    #[test]
    fn test_fixed_topics() {
        assert_eq!(reply_topic(&Event::new("register", Payload::new())), "user/register/events");
        assert_eq!(reply_topic(&Event::new("login", Payload::new())), "user/login/events");
    }

    #[test]
    fn test_chat_room_topic() {
        let event = Event::new("chat", payload_from(json!({"room_id": "lobby"})));
        assert_eq!(reply_topic(&event), "chat/room/lobby");

        let no_room = Event::new("chat", Payload::new());
        assert_eq!(reply_topic(&no_room), "chat/room/messages");
    }

    #[test]
    fn test_inbound_topics() {
        let consumed = |topic: &str| INBOUND_TOPICS.iter().any(|filter| topic_matches(filter, topic));

        for topic in [
            "user/register",
            "user/login",
            "user/cards",
            "chat/room/lobby",
            "game/start_game",
            "game/join_game",
            "game/match-1/play_card",
            "game/match-1/surrender",
            "game/actions",
            "store/buy",
            "cards/user-1/exchange",
            "trade/offer",
        ] {
            assert!(consumed(topic), "{topic} is not consumed");
        }
        // Reply topics outside chat are not consumed.
        assert!(!consumed("user/login/events"));
        assert!(!consumed("responses/buy_pack"));
    }

    #[test]
    fn test_default_topic() {
        assert_eq!(reply_topic(&Event::new("buy_pack", Payload::new())), "responses/buy_pack");
        assert_eq!(reply_topic(&Event::new("make_move", Payload::new())), "responses/make_move");
    }
}
