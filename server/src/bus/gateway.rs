//! Websocket access to the bus for external clients.
//!
//! Clients send JSON frames `{"op":"subscribe","topics":[..]}` and
//! `{"op":"publish","topic":..,"event":{..}}`; the server answers with
//! `subscribed`, `message` and `error` frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::MessageBus;
use crate::protocol::Event;

const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topics: Vec<String> },
    Publish { topic: String, event: Event },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed { topics: Vec<String> },
    Message { topic: String, event: Event },
    Error { error: String },
}

pub fn router(bus: Arc<dyn MessageBus>) -> Router {
    Router::new().route("/bus", get(upgrade)).with_state(bus)
}

async fn upgrade(ws: WebSocketUpgrade, State(bus): State<Arc<dyn MessageBus>>) -> Response {
    ws.on_upgrade(move |socket| session(socket, bus))
}

async fn session(socket: WebSocket, bus: Arc<dyn MessageBus>) {
    info!("bus client connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode bus frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_frame(&text, &bus, &tx, &mut forwarders).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    writer.abort();
    info!("bus client disconnected");
}

async fn handle_frame(
    text: &str,
    bus: &Arc<dyn MessageBus>,
    tx: &mpsc::Sender<ServerFrame>,
    forwarders: &mut Vec<JoinHandle<()>>,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = tx.send(ServerFrame::Error { error: format!("invalid frame: {e}") }).await;
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { topics } => match bus.subscribe(topics.clone()).await {
            Ok(mut subscription) => {
                debug!(?topics, "bus client subscribed");
                let tx_forward = tx.clone();
                forwarders.push(tokio::spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        let frame = ServerFrame::Message {
                            topic: message.topic,
                            event: message.event,
                        };
                        if tx_forward.send(frame).await.is_err() {
                            break;
                        }
                    }
                }));
                let _ = tx.send(ServerFrame::Subscribed { topics }).await;
            }
            Err(e) => {
                let _ = tx.send(ServerFrame::Error { error: e.to_string() }).await;
            }
        },
        ClientFrame::Publish { topic, event } => {
            if let Err(e) = bus.publish(&topic, &event).await {
                let _ = tx.send(ServerFrame::Error { error: e.to_string() }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::protocol::{payload_from, Payload};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn test_frame_shapes() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"op":"subscribe","topics":["user/login/events"]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                topics: vec!["user/login/events".to_string()]
            }
        );

        let json = serde_json::to_value(ServerFrame::Error { error: "bad".into() }).unwrap();
        assert_eq!(json, json!({"op": "error", "error": "bad"}));
    }

    async fn next_frame<S>(ws: &mut S) -> ServerFrame
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_subscribe_and_publish() {
        let local = LocalBus::new();
        let bus: Arc<dyn MessageBus> = Arc::new(local.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(bus)).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/bus")).await.unwrap();

        let subscribe = json!({"op": "subscribe", "topics": ["user/login/events"]}).to_string();
        ws.send(WsMessage::Text(subscribe)).await.unwrap();
        assert!(matches!(next_frame(&mut ws).await, ServerFrame::Subscribed { .. }));

        local
            .publish("user/login/events", &Event::new("login_ok", payload_from(json!({"user_id": "user-1"}))))
            .await
            .unwrap();
        match next_frame(&mut ws).await {
            ServerFrame::Message { topic, event } => {
                assert_eq!(topic, "user/login/events");
                assert_eq!(event.method, "login_ok");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Client publishes reach bus subscribers.
        let mut sub = local.subscribe(vec!["user/login".to_string()]).await.unwrap();
        let publish = serde_json::to_string(&ClientFrame::Publish {
            topic: "user/login".into(),
            event: Event::new("login", Payload::new()),
        })
        .unwrap();
        ws.send(WsMessage::Text(publish)).await.unwrap();
        let received = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(received.event.method, "login");

        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        assert!(matches!(next_frame(&mut ws).await, ServerFrame::Error { .. }));
    }
}
