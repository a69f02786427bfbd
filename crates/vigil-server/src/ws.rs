//! The communications socket: registration, heartbeats and call-signaling
//! relay.
//!
//! Each socket gets a writer task draining a bounded frame queue. Once the
//! socket registers, the strong end of that queue lives in the presence
//! registry; the handler keeps only a weak handle for error replies. When the
//! registry drops the entry (replaced by a newer tab, or evicted after a
//! heartbeat timeout) the writer sees its queue close and shuts the socket.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_shared::constants::OUTBOUND_QUEUE_CAPACITY;
use vigil_shared::protocol::Frame;
use vigil_shared::types::UserId;

use crate::api::AppState;
use crate::auth::{bearer_token, resolve_session};
use crate::error::ServerError;
use crate::presence::{broadcast_online_users, ConnectionId};
use crate::rate_limit::TokenBucket;

/// Inbound frames per second per socket. ICE gathering arrives in bursts.
const FRAME_RATE: f64 = 20.0;
const FRAME_BURST: f64 = 60.0;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=...`. The session is checked before the upgrade so an
/// unauthenticated client gets a plain 401.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(ServerError::Unauthorized)?;
    let user = resolve_session(&state, token).await?;

    debug!(user = %user, "Upgrading communications socket");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, state)))
}

async fn handle_socket(socket: WebSocket, user: UserId, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_CAPACITY);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, kind = frame.kind(), "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    let mut session = SocketSession::new(user, tx);
    info!(user = %user, conn = %session.conn, "Socket connected");

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(user = %user, conn = %session.conn, "Outbound queue closed");
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => session.on_text(&text, &state).await,
                Some(Ok(WsMessage::Binary(_))) => session.reply_error("Binary frames are not supported"),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                    session.touch(&state).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    // Errors are followed by the close path; nothing to retry here.
                    debug!(user = %user, error = %e, "Socket error");
                    break;
                }
            }
        }
    }

    writer.abort();

    if session.registered && state.presence.unregister(user, session.conn).await {
        broadcast_online_users(state.presence.as_ref()).await;
    }
    info!(user = %user, conn = %session.conn, "Socket disconnected");
}

struct SocketSession {
    user: UserId,
    conn: ConnectionId,
    registered: bool,
    /// Strong queue handle, handed to the registry on `register`.
    pending: Option<mpsc::Sender<Frame>>,
    reply: mpsc::WeakSender<Frame>,
    throttle: TokenBucket,
}

impl SocketSession {
    fn new(user: UserId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            user,
            conn: ConnectionId::new(),
            registered: false,
            reply: tx.downgrade(),
            pending: Some(tx),
            throttle: TokenBucket::new(FRAME_RATE, FRAME_BURST),
        }
    }

    async fn on_text(&mut self, text: &str, state: &AppState) {
        if !self.throttle.try_consume() {
            warn!(user = %self.user, "Inbound frame rate exceeded");
            self.reply_error("Rate limit exceeded, frame dropped");
            return;
        }

        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply_error(&e.to_string());
                return;
            }
        };

        self.dispatch(frame, state).await;
    }

    async fn dispatch(&mut self, mut frame: Frame, state: &AppState) {
        match frame {
            Frame::Register { user_id } => self.register(user_id, state).await,
            _ if !self.registered => self.reply_error("Send a register frame first"),
            Frame::Heartbeat => self.touch(state).await,
            Frame::CallOffer(_)
            | Frame::CallAnswer(_)
            | Frame::CallCandidate(_)
            | Frame::CallEnd(_)
            | Frame::CallBusy(_) => {
                self.touch(state).await;
                frame.stamp_sender(self.user);
                let Some(target) = frame.relay_target() else {
                    return;
                };
                let kind = frame.kind();
                let delivered = state.presence.send_to_user(target, frame).await;
                debug!(from = %self.user, to = %target, kind, delivered, "Relayed call signal");
            }
            Frame::Users { .. }
            | Frame::Message { .. }
            | Frame::MessageRead { .. }
            | Frame::AllMessagesRead { .. }
            | Frame::Error { .. } => {
                self.reply_error(&format!("Frame type {:?} is server-only", frame.kind()));
            }
        }
    }

    async fn register(&mut self, claimed: UserId, state: &AppState) {
        if claimed != self.user {
            warn!(session = %self.user, claimed = %claimed, "Register with foreign user id");
            self.reply_error("userId does not match the authenticated session");
            return;
        }

        if self.registered {
            self.touch(state).await;
            return;
        }

        let Some(tx) = self.pending.take() else {
            return;
        };
        state.presence.register(self.user, self.conn, tx).await;
        self.registered = true;
        broadcast_online_users(state.presence.as_ref()).await;
    }

    async fn touch(&self, state: &AppState) {
        if self.registered {
            state.presence.touch(self.user, self.conn).await;
        }
    }

    fn reply_error(&self, message: &str) {
        if let Some(tx) = self.reply.upgrade() {
            let _ = tx.try_send(Frame::Error {
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as TMessage, MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    use vigil_shared::protocol::{
        CallBusy, CallOffer, CallCandidate, IceCandidate, SdpKind, SessionDescription,
    };
    use vigil_shared::types::MediaType;

    use crate::api::build_router;
    use crate::api::tests::{seed_user, test_state};

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, token: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .expect("socket should connect");
        ws
    }

    async fn send(ws: &mut Client, frame: &Frame) {
        ws.send(TMessage::Text(frame.to_json().unwrap())).await.unwrap();
    }

    async fn next_frame(ws: &mut Client) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let TMessage::Text(text) = msg {
                return Frame::from_json(&text).unwrap();
            }
        }
    }

    async fn register(ws: &mut Client, user: UserId) {
        send(ws, &Frame::Register { user_id: user }).await;
    }

    #[tokio::test]
    async fn test_rejects_missing_or_bad_token() {
        let state = test_state();
        let addr = spawn_server(state).await;

        assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
        assert!(connect_async(format!("ws://{addr}/ws?token=nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_register_broadcasts_presence() {
        let state = test_state();
        let (a, a_token) = seed_user(&state, "a").await;
        let (b, b_token) = seed_user(&state, "b").await;
        let addr = spawn_server(state.clone()).await;

        let mut ws_a = connect(addr, &a_token).await;
        register(&mut ws_a, a).await;
        assert_eq!(next_frame(&mut ws_a).await, Frame::Users { users: vec![a] });

        let mut ws_b = connect(addr, &b_token).await;
        register(&mut ws_b, b).await;
        let both = Frame::Users { users: vec![a, b] };
        assert_eq!(next_frame(&mut ws_a).await, both);
        assert_eq!(next_frame(&mut ws_b).await, both);

        ws_b.close(None).await.unwrap();
        assert_eq!(next_frame(&mut ws_a).await, Frame::Users { users: vec![a] });
    }

    #[tokio::test]
    async fn test_register_with_foreign_id_is_refused() {
        let state = test_state();
        let (_a, a_token) = seed_user(&state, "a").await;
        let (b, _) = seed_user(&state, "b").await;
        let addr = spawn_server(state.clone()).await;

        let mut ws = connect(addr, &a_token).await;
        register(&mut ws, b).await;
        assert!(matches!(next_frame(&mut ws).await, Frame::Error { .. }));
        assert!(state.presence.active_users().await.is_empty());

        send(&mut ws, &Frame::Heartbeat).await;
        assert!(matches!(next_frame(&mut ws).await, Frame::Error { .. }));
    }

    #[tokio::test]
    async fn test_malformed_and_server_only_frames_get_errors() {
        let state = test_state();
        let (a, a_token) = seed_user(&state, "a").await;
        let addr = spawn_server(state).await;

        let mut ws = connect(addr, &a_token).await;
        register(&mut ws, a).await;
        next_frame(&mut ws).await;

        ws.send(TMessage::Text("{\"type\":\"nope\"}".into())).await.unwrap();
        assert!(matches!(next_frame(&mut ws).await, Frame::Error { .. }));

        send(&mut ws, &Frame::Users { users: vec![] }).await;
        assert!(matches!(next_frame(&mut ws).await, Frame::Error { .. }));
    }

    #[tokio::test]
    async fn test_call_signals_are_relayed_with_stamped_sender() {
        let state = test_state();
        let (a, a_token) = seed_user(&state, "a").await;
        let (b, b_token) = seed_user(&state, "b").await;
        let addr = spawn_server(state).await;

        let mut ws_a = connect(addr, &a_token).await;
        register(&mut ws_a, a).await;
        next_frame(&mut ws_a).await;
        let mut ws_b = connect(addr, &b_token).await;
        register(&mut ws_b, b).await;
        next_frame(&mut ws_a).await;
        next_frame(&mut ws_b).await;

        // Spoofed callerId is overwritten with the socket's user.
        let offer = Frame::CallOffer(CallOffer {
            caller_id: UserId(999),
            receiver_id: b,
            media_type: MediaType::Audio,
            offer: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        });
        send(&mut ws_a, &offer).await;
        let Frame::CallOffer(received) = next_frame(&mut ws_b).await else {
            panic!("expected call-offer");
        };
        assert_eq!(received.caller_id, a);
        assert_eq!(received.offer.sdp, "v=0");

        let candidate = Frame::CallCandidate(CallCandidate {
            sender_id: a,
            receiver_id: b,
            candidate: IceCandidate {
                candidate: "candidate:0 1 UDP 1 10.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            },
        });
        send(&mut ws_a, &candidate).await;
        assert_eq!(next_frame(&mut ws_b).await, candidate);

        send(
            &mut ws_b,
            &Frame::CallBusy(CallBusy {
                sender_id: b,
                receiver_id: a,
            }),
        )
        .await;
        assert_eq!(
            next_frame(&mut ws_a).await,
            Frame::CallBusy(CallBusy {
                sender_id: b,
                receiver_id: a,
            })
        );
    }

    #[tokio::test]
    async fn test_http_message_is_pushed_over_socket() {
        let state = test_state();
        let (a, a_token) = seed_user(&state, "a").await;
        let (b, b_token) = seed_user(&state, "b").await;
        let addr = spawn_server(state.clone()).await;

        let mut ws_b = connect(addr, &b_token).await;
        register(&mut ws_b, b).await;
        next_frame(&mut ws_b).await;

        let req = Request::builder()
            .method(Method::POST)
            .uri("/messages")
            .header("authorization", format!("Bearer {a_token}"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"receiverId": b.0, "content": "hello", "type": "text"})
                    .to_string(),
            ))
            .unwrap();
        let resp = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let Frame::Message { message } = next_frame(&mut ws_b).await else {
            panic!("expected message frame");
        };
        assert_eq!(message.sender_id, a);
        assert_eq!(message.content, "hello");
        assert!(!message.read);
    }

    #[tokio::test]
    async fn test_newer_tab_replaces_older_socket() {
        let state = test_state();
        let (a, a_token) = seed_user(&state, "a").await;
        let addr = spawn_server(state.clone()).await;

        let mut first = connect(addr, &a_token).await;
        register(&mut first, a).await;
        next_frame(&mut first).await;

        let mut second = connect(addr, &a_token).await;
        register(&mut second, a).await;
        assert_eq!(next_frame(&mut second).await, Frame::Users { users: vec![a] });

        // The superseded socket is closed by the server.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    None | Some(Err(_)) | Some(Ok(TMessage::Close(_))) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(state.presence.active_users().await, vec![a]);
    }
}
