//! Socket driver with tokio mpsc command/notification channels.
//!
//! The driver task owns the socket, the connection state machine, and the
//! heartbeat and reconnect timers. The [`CallManager`] runs on a task of its
//! own, since media acquisition can wait on a permission prompt for as long
//! as the user leaves it open; the socket loop only forwards signaling to it
//! and sends back what it produces. Application code talks to the client
//! only through [`ClientCommand`] and [`ClientNotification`].

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use vigil_shared::protocol::{Frame, IceCandidate};
use vigil_shared::types::{MediaType, UserId};

use crate::cache::{self, SharedCache};
use crate::call::{CallManager, CallOutput, MediaEngine};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionMachine, ConnectionState, Effect};
use crate::error::ClientError;
use crate::events::{CallEvent, ClientNotification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectResult = Result<WsStream, tungstenite::Error>;

/// How long shutdown waits for the call task to hang up.
const CALL_DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the client task.
#[derive(Debug)]
pub enum ClientCommand {
    StartCall { receiver: UserId, media_type: MediaType },
    AcceptCall,
    RejectCall,
    EndCall,
    /// A locally gathered ICE candidate for the current call.
    LocalCandidate(IceCandidate),
    /// The app came back to the foreground or the network returned.
    VisibilityRegained,
    GetState(oneshot::Sender<ConnectionState>),
    /// Hang up any call, close the socket and stop the task for good.
    Shutdown,
}

/// Spawn the client task on the current tokio runtime and start connecting.
///
/// When `cache` is given, pushed messages and read receipts are applied to it
/// as they arrive, and it is cleared whenever the socket comes back after an
/// outage.
pub fn spawn_client<E: MediaEngine>(
    config: ClientConfig,
    engine: E,
    cache: Option<SharedCache>,
) -> (mpsc::Sender<ClientCommand>, mpsc::Receiver<ClientNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(config.channel_capacity);
    let (notif_tx, notif_rx) = mpsc::channel::<ClientNotification>(config.channel_capacity);

    let calls = spawn_call_task(
        CallManager::new(config.user_id, engine),
        config.channel_capacity,
    );
    let driver = Driver::new(&config, calls, cache, notif_tx);

    info!(user = %config.user_id, server = %config.http_base(), "Starting client");
    tokio::spawn(driver.run(cmd_rx));

    (cmd_tx, notif_rx)
}

// ---------------------------------------------------------------------------
// Call task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CallInput {
    Start { receiver: UserId, media_type: MediaType },
    Accept,
    Reject,
    End,
    LocalCandidate(IceCandidate),
    Signal(Frame),
}

struct CallLink {
    tx: mpsc::UnboundedSender<CallInput>,
    rx: mpsc::Receiver<CallOutput>,
}

/// Run `calls` on its own task. Inputs are applied strictly in order. When
/// the input side closes, any live call is hung up before the task exits.
fn spawn_call_task<E: MediaEngine>(mut calls: CallManager<E>, capacity: usize) -> CallLink {
    let (tx, mut inputs) = mpsc::unbounded_channel::<CallInput>();
    let (out_tx, rx) = mpsc::channel::<CallOutput>(capacity);

    tokio::spawn(async move {
        while let Some(input) = inputs.recv().await {
            let out = apply_call_input(&mut calls, input).await;
            if !out.is_empty() && out_tx.send(out).await.is_err() {
                break;
            }
        }

        let out = calls.end_call();
        if !out.is_empty() {
            let _ = out_tx.send(out).await;
        }
        debug!("Call task stopped");
    });

    CallLink { tx, rx }
}

async fn apply_call_input<E: MediaEngine>(
    calls: &mut CallManager<E>,
    input: CallInput,
) -> CallOutput {
    match input {
        CallInput::Start { receiver, media_type } => {
            match calls.start_call(receiver, media_type).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(peer = %receiver, error = %e, "Call not started");
                    CallOutput {
                        frames: Vec::new(),
                        events: vec![CallEvent::Failed {
                            peer: receiver,
                            error: e.to_string(),
                        }],
                    }
                }
            }
        }
        CallInput::Accept => calls.accept_call().await.unwrap_or_else(|e| {
            warn!(error = %e, "Nothing to accept");
            CallOutput::default()
        }),
        CallInput::Reject => calls.reject_call().unwrap_or_else(|e| {
            warn!(error = %e, "Nothing to reject");
            CallOutput::default()
        }),
        CallInput::End => calls.end_call(),
        CallInput::LocalCandidate(candidate) => CallOutput {
            frames: calls.local_candidate(candidate).into_iter().collect(),
            events: Vec::new(),
        },
        CallInput::Signal(frame) => calls.handle_frame(frame).await,
    }
}

// ---------------------------------------------------------------------------
// Socket loop
// ---------------------------------------------------------------------------

enum Wake {
    Command(Option<ClientCommand>),
    Connected(Result<ConnectResult, JoinError>),
    Socket(Option<Result<WsMessage, tungstenite::Error>>),
    Call(Option<CallOutput>),
    HeartbeatDue,
    ReconnectDue,
}

struct Driver {
    url: String,
    machine: ConnectionMachine,
    call_tx: Option<mpsc::UnboundedSender<CallInput>>,
    call_rx: Option<mpsc::Receiver<CallOutput>>,
    cache: Option<SharedCache>,
    notif_tx: mpsc::Sender<ClientNotification>,
    socket: Option<WsStream>,
    connecting: Option<JoinHandle<ConnectResult>>,
    heartbeat_every: Duration,
    heartbeat_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Set by the first successful open; every later open is a reconnect.
    opened_before: bool,
}

impl Driver {
    fn new(
        config: &ClientConfig,
        calls: CallLink,
        cache: Option<SharedCache>,
        notif_tx: mpsc::Sender<ClientNotification>,
    ) -> Self {
        Self {
            url: config.socket_url(),
            machine: ConnectionMachine::new(config.user_id, config.heartbeat_interval, config.backoff),
            call_tx: Some(calls.tx),
            call_rx: Some(calls.rx),
            cache,
            notif_tx,
            socket: None,
            connecting: None,
            heartbeat_every: config.heartbeat_interval,
            heartbeat_at: None,
            reconnect_at: None,
            opened_before: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCommand>) {
        self.dispatch(ConnectionEvent::Start).await;

        loop {
            let wake = tokio::select! {
                cmd = cmd_rx.recv() => Wake::Command(cmd),
                res = wait_connect(&mut self.connecting) => Wake::Connected(res),
                msg = next_message(&mut self.socket) => Wake::Socket(msg),
                out = next_call_output(&mut self.call_rx) => Wake::Call(out),
                _ = sleep_until(self.heartbeat_at) => Wake::HeartbeatDue,
                _ = sleep_until(self.reconnect_at) => Wake::ReconnectDue,
            };

            match wake {
                Wake::Command(Some(ClientCommand::Shutdown)) | Wake::Command(None) => {
                    self.shutdown().await;
                    break;
                }
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Connected(result) => {
                    self.connecting = None;
                    self.on_connected(result).await;
                }
                Wake::Socket(msg) => self.on_socket_message(msg).await,
                Wake::Call(Some(out)) => self.send_call_output(out).await,
                Wake::Call(None) => {
                    warn!("Call task exited");
                    self.call_tx = None;
                    self.call_rx = None;
                }
                Wake::HeartbeatDue => self.on_heartbeat_due().await,
                Wake::ReconnectDue => {
                    self.reconnect_at = None;
                    self.dispatch(ConnectionEvent::ReconnectTimerFired).await;
                }
            }
        }

        info!("Client task terminated");
    }

    async fn shutdown(&mut self) {
        info!("Client shutdown requested");
        // Closing the input makes the call task hang up and exit.
        self.call_tx = None;
        if let Some(mut rx) = self.call_rx.take() {
            let drained = timeout(CALL_DRAIN_GRACE, async {
                while let Some(out) = rx.recv().await {
                    self.send_call_output(out).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!("Call task still busy at shutdown");
            }
        }
        self.dispatch(ConnectionEvent::Shutdown).await;
    }

    // -----------------------------------------------------------------------
    // Connection machine plumbing
    // -----------------------------------------------------------------------

    async fn dispatch(&mut self, event: ConnectionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.apply(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn apply(&mut self, effect: Effect) -> Option<ConnectionEvent> {
        match effect {
            Effect::OpenSocket => {
                if let Some(handle) = self.connecting.take() {
                    handle.abort();
                }
                debug!("Opening socket");
                let url = self.url.clone();
                self.connecting = Some(tokio::spawn(async move {
                    connect_async(url).await.map(|(stream, _)| stream)
                }));
            }
            Effect::CloseSocket => {
                if let Some(handle) = self.connecting.take() {
                    handle.abort();
                }
                if let Some(mut socket) = self.socket.take() {
                    let _ = socket.close(None).await;
                }
            }
            Effect::Send(frame) => {
                if let Err(e) = self.send_frame(&frame).await {
                    warn!(kind = frame.kind(), error = %e, "Send failed");
                    self.socket = None;
                    return Some(ConnectionEvent::Closed);
                }
            }
            Effect::StartHeartbeat(every) => {
                self.heartbeat_every = every;
                self.heartbeat_at = Some(Instant::now() + every);
            }
            Effect::CancelHeartbeat => self.heartbeat_at = None,
            Effect::ScheduleReconnect(delay) => {
                info!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
                self.notify(ClientNotification::ReconnectScheduled(delay)).await;
            }
            Effect::CancelReconnect => self.reconnect_at = None,
            Effect::StateChanged(state) => {
                debug!(?state, "Connection state changed");
                self.notify(ClientNotification::ConnectionChanged(state)).await;
            }
        }
        None
    }

    async fn on_connected(&mut self, result: Result<ConnectResult, JoinError>) {
        match result {
            Ok(Ok(stream)) => {
                info!("Socket open");
                self.socket = Some(stream);
                if std::mem::replace(&mut self.opened_before, true) {
                    self.reset_cache();
                }
                self.dispatch(ConnectionEvent::Opened).await;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connect failed");
                self.dispatch(ConnectionEvent::Error).await;
                self.dispatch(ConnectionEvent::Closed).await;
            }
            Err(e) => {
                warn!(error = %e, "Connect task failed");
                self.dispatch(ConnectionEvent::Closed).await;
            }
        }
    }

    async fn on_heartbeat_due(&mut self) {
        self.heartbeat_at = Some(Instant::now() + self.heartbeat_every);
        let socket_open = self.socket.is_some();
        self.dispatch(ConnectionEvent::HeartbeatTick { socket_open })
            .await;
    }

    /// Pushes and receipts sent while the socket was down were missed. The
    /// next read goes to the server.
    fn reset_cache(&self) {
        if let Some(cache) = &self.cache {
            cache::lock(cache).clear();
            debug!("Message cache cleared after reconnect");
        }
    }

    async fn on_socket_message(&mut self, msg: Option<Result<WsMessage, tungstenite::Error>>) {
        match msg {
            Some(Ok(WsMessage::Text(text))) => self.on_frame(&text).await,
            Some(Ok(WsMessage::Close(_))) | None => {
                info!("Socket closed");
                self.socket = None;
                self.dispatch(ConnectionEvent::Closed).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "Socket error");
                self.socket = None;
                self.dispatch(ConnectionEvent::Error).await;
                self.dispatch(ConnectionEvent::Closed).await;
            }
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ClientError::Closed);
        };
        let text = frame.to_json()?;
        socket.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn notify(&mut self, notification: ClientNotification) {
        let _ = self.notif_tx.send(notification).await;
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    async fn on_frame(&mut self, text: &str) {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame");
                return;
            }
        };

        match frame {
            Frame::Users { users } => {
                debug!(count = users.len(), "Online users updated");
                self.notify(ClientNotification::OnlineUsers(users)).await;
            }
            Frame::Message { message } => {
                if let Some(cache) = &self.cache {
                    cache::lock(cache).apply_incoming(&message);
                }
                self.notify(ClientNotification::NewMessage(message)).await;
            }
            Frame::MessageRead { message_id, read_by } => {
                if let Some(cache) = &self.cache {
                    cache::lock(cache).apply_read(&[message_id]);
                }
                self.notify(ClientNotification::MessageRead { message_id, read_by })
                    .await;
            }
            Frame::AllMessagesRead { read_by, count } => {
                if let Some(cache) = &self.cache {
                    cache::lock(cache).apply_all_read(read_by);
                }
                self.notify(ClientNotification::AllMessagesRead { read_by, count })
                    .await;
            }
            Frame::Error { message } => {
                warn!(%message, "Server rejected a frame");
                self.notify(ClientNotification::ServerError(message)).await;
            }
            frame @ (Frame::CallOffer(_)
            | Frame::CallAnswer(_)
            | Frame::CallCandidate(_)
            | Frame::CallEnd(_)
            | Frame::CallBusy(_)) => self.to_calls(CallInput::Signal(frame)),
            other => debug!(kind = other.kind(), "Ignoring unexpected frame"),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::StartCall { receiver, media_type } => {
                self.to_calls(CallInput::Start { receiver, media_type });
            }
            ClientCommand::AcceptCall => self.to_calls(CallInput::Accept),
            ClientCommand::RejectCall => self.to_calls(CallInput::Reject),
            ClientCommand::EndCall => self.to_calls(CallInput::End),
            ClientCommand::LocalCandidate(candidate) => {
                self.to_calls(CallInput::LocalCandidate(candidate));
            }
            ClientCommand::VisibilityRegained => {
                self.dispatch(ConnectionEvent::VisibilityRegained).await;
            }
            ClientCommand::GetState(reply) => {
                let _ = reply.send(self.machine.state());
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn to_calls(&self, input: CallInput) {
        let Some(tx) = &self.call_tx else {
            warn!(?input, "Call task gone, dropping input");
            return;
        };
        if let Err(e) = tx.send(input) {
            warn!(input = ?e.0, "Call task gone, dropping input");
        }
    }

    async fn send_call_output(&mut self, out: CallOutput) {
        for frame in out.frames {
            self.send_signal(frame).await;
        }
        for event in out.events {
            self.notify(ClientNotification::Call(event)).await;
        }
    }

    /// Signaling is best-effort: a frame that cannot be sent is dropped, and
    /// a broken socket goes through the normal reconnect path.
    async fn send_signal(&mut self, frame: Frame) {
        match self.send_frame(&frame).await {
            Ok(()) => {}
            Err(ClientError::Closed) => {
                debug!(kind = frame.kind(), "Dropping signal while offline");
            }
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "Signal send failed");
                self.socket = None;
                self.dispatch(ConnectionEvent::Closed).await;
            }
        }
    }
}

async fn wait_connect(
    pending: &mut Option<JoinHandle<ConnectResult>>,
) -> Result<ConnectResult, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    socket: &mut Option<WsStream>,
) -> Option<Result<WsMessage, tungstenite::Error>> {
    match socket {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_call_output(calls: &mut Option<mpsc::Receiver<CallOutput>>) -> Option<CallOutput> {
    match calls {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use vigil_shared::protocol::{CallEnd, EndReason};
    use vigil_shared::types::{MediaType, Message};

    use super::*;
    use crate::cache::MessageCache;
    use crate::call::testing::{offer_from, FakeEngine};
    use crate::config::BackoffConfig;

    const ME: UserId = UserId(1);
    const PEER: UserId = UserId(2);

    enum Seen {
        Connected,
        Frame(Frame),
        Disconnected,
    }

    enum Control {
        Send(Frame),
        Drop,
    }

    /// A socket server that reports what it receives and sends on request.
    async fn fake_server() -> (
        SocketAddr,
        mpsc::UnboundedReceiver<Seen>,
        mpsc::UnboundedSender<Control>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(tcp).await else {
                    continue;
                };
                let _ = seen_tx.send(Seen::Connected);
                loop {
                    tokio::select! {
                        msg = ws.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = seen_tx.send(Seen::Frame(Frame::from_json(&text).unwrap()));
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                        ctl = control_rx.recv() => match ctl {
                            Some(Control::Send(frame)) => {
                                let _ = ws.send(WsMessage::Text(frame.to_json().unwrap())).await;
                            }
                            Some(Control::Drop) | None => break,
                        },
                    }
                }
                let _ = seen_tx.send(Seen::Disconnected);
            }
        });

        (addr, seen_rx, control_tx)
    }

    fn config(addr: SocketAddr) -> ClientConfig {
        let mut config = ClientConfig::new(format!("http://{addr}"), "token", ME);
        config.heartbeat_interval = Duration::from_millis(100);
        config.backoff = BackoffConfig {
            base: Duration::from_millis(50),
            max: Duration::from_millis(400),
            jitter: Duration::ZERO,
        };
        config
    }

    async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("server saw nothing")
            .expect("server gone")
    }

    async fn next_frame_matching(
        rx: &mut mpsc::UnboundedReceiver<Seen>,
        pred: impl Fn(&Frame) -> bool,
    ) -> Frame {
        loop {
            if let Seen::Frame(frame) = next_seen(rx).await {
                if pred(&frame) {
                    return frame;
                }
            }
        }
    }

    async fn wait_for(
        rx: &mut mpsc::Receiver<ClientNotification>,
        pred: impl Fn(&ClientNotification) -> bool,
    ) -> ClientNotification {
        loop {
            let n = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no notification")
                .expect("client gone");
            if pred(&n) {
                return n;
            }
        }
    }

    fn pushed_message() -> Message {
        serde_json::from_value(serde_json::json!({
            "id": 10,
            "senderId": PEER.0,
            "receiverId": ME.0,
            "content": "hello",
            "type": "text",
            "sentAt": "2026-01-01T00:00:00Z",
            "read": false,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_registers_heartbeats_and_routes_frames() {
        let (addr, mut seen, control) = fake_server().await;
        let cache = MessageCache::shared(ME);
        cache::lock(&cache).store_conversation(PEER, Vec::new());

        let (cmd, mut notes) = spawn_client(config(addr), FakeEngine::default(), Some(cache.clone()));

        let register = next_frame_matching(&mut seen, |_| true).await;
        assert_eq!(register, Frame::Register { user_id: ME });
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Connected)
        })
        .await;
        next_frame_matching(&mut seen, |f| *f == Frame::Heartbeat).await;

        control
            .send(Control::Send(Frame::Users { users: vec![ME, PEER] }))
            .unwrap();
        wait_for(&mut notes, |n| {
            *n == ClientNotification::OnlineUsers(vec![ME, PEER])
        })
        .await;

        control
            .send(Control::Send(Frame::Message { message: pushed_message() }))
            .unwrap();
        wait_for(&mut notes, |n| matches!(n, ClientNotification::NewMessage(_))).await;
        assert_eq!(cache::lock(&cache).conversation(PEER).unwrap().len(), 1);

        control.send(Control::Send(offer_from(PEER, ME))).unwrap();
        wait_for(&mut notes, |n| {
            matches!(n, ClientNotification::Call(CallEvent::Incoming { from: PEER, .. }))
        })
        .await;

        cmd.send(ClientCommand::RejectCall).await.unwrap();
        let end = next_frame_matching(&mut seen, |f| matches!(f, Frame::CallEnd(_))).await;
        assert_eq!(
            end,
            Frame::CallEnd(CallEnd {
                sender_id: ME,
                receiver_id: PEER,
                reason: EndReason::Rejected
            })
        );

        let (tx, rx) = oneshot::channel();
        cmd.send(ClientCommand::GetState(tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), ConnectionState::Connected);

        cmd.send(ClientCommand::Shutdown).await.unwrap();
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::ShutDown)
        })
        .await;
        loop {
            if let Seen::Disconnected = next_seen(&mut seen).await {
                break;
            }
        }
        // Channel closes once the task exits.
        assert!(timeout(Duration::from_secs(5), async {
            while notes.recv().await.is_some() {}
        })
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn test_dropped_connection_reconnects_and_reregisters() {
        let (addr, mut seen, control) = fake_server().await;
        let (cmd, mut notes) = spawn_client(config(addr), FakeEngine::default(), None);

        next_frame_matching(&mut seen, |f| matches!(f, Frame::Register { .. })).await;
        control.send(Control::Drop).unwrap();

        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Disconnected)
        })
        .await;
        wait_for(&mut notes, |n| matches!(n, ClientNotification::ReconnectScheduled(_))).await;

        let again = next_frame_matching(&mut seen, |f| matches!(f, Frame::Register { .. })).await;
        assert_eq!(again, Frame::Register { user_id: ME });
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Connected)
        })
        .await;

        cmd.send(ClientCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_backs_off() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (cmd, mut notes) = spawn_client(config(addr), FakeEngine::default(), None);

        let mut delays = Vec::new();
        while delays.len() < 3 {
            if let ClientNotification::ReconnectScheduled(d) =
                wait_for(&mut notes, |n| matches!(n, ClientNotification::ReconnectScheduled(_)))
                    .await
            {
                delays.push(d);
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200)
            ]
        );

        cmd.send(ClientCommand::Shutdown).await.unwrap();
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::ShutDown)
        })
        .await;
    }

    fn is_register(frame: &Frame) -> bool {
        matches!(frame, Frame::Register { .. })
    }

    async fn connected_client(
        config: ClientConfig,
        cache: Option<SharedCache>,
        seen: &mut mpsc::UnboundedReceiver<Seen>,
    ) -> (mpsc::Sender<ClientCommand>, mpsc::Receiver<ClientNotification>) {
        let (cmd, mut notes) = spawn_client(config, FakeEngine::default(), cache);
        next_frame_matching(seen, is_register).await;
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Connected)
        })
        .await;
        (cmd, notes)
    }

    #[tokio::test]
    async fn test_visibility_while_connected_sends_heartbeat() {
        let (addr, mut seen, _control) = fake_server().await;
        let mut config = config(addr);
        config.heartbeat_interval = Duration::from_secs(60);
        let (cmd, _notes) = connected_client(config, None, &mut seen).await;

        cmd.send(ClientCommand::VisibilityRegained).await.unwrap();
        let sent = next_frame_matching(&mut seen, |_| true).await;
        assert_eq!(sent, Frame::Heartbeat);

        cmd.send(ClientCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_visibility_while_disconnected_reconnects_now() {
        let (addr, mut seen, control) = fake_server().await;
        let mut config = config(addr);
        config.backoff.base = Duration::from_secs(60);
        config.backoff.max = Duration::from_secs(60);
        let (cmd, mut notes) = connected_client(config, None, &mut seen).await;

        control.send(Control::Drop).unwrap();
        let scheduled = wait_for(&mut notes, |n| {
            matches!(n, ClientNotification::ReconnectScheduled(_))
        })
        .await;
        assert_eq!(
            scheduled,
            ClientNotification::ReconnectScheduled(Duration::from_secs(60))
        );

        cmd.send(ClientCommand::VisibilityRegained).await.unwrap();
        let again = next_frame_matching(&mut seen, is_register).await;
        assert_eq!(again, Frame::Register { user_id: ME });
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Connected)
        })
        .await;

        cmd.send(ClientCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_with_socket_gone_reconnects_at_once() {
        let (addr, mut seen, _control) = fake_server().await;
        let config = config(addr);
        let calls = spawn_call_task(CallManager::new(ME, FakeEngine::default()), 16);
        let (notif_tx, _notes) = mpsc::channel(64);
        let mut driver = Driver::new(&config, calls, None, notif_tx);

        driver.dispatch(ConnectionEvent::Start).await;
        let result = wait_connect(&mut driver.connecting).await;
        driver.connecting = None;
        driver.on_connected(result).await;
        assert_eq!(driver.machine.state(), ConnectionState::Connected);
        assert!(driver.heartbeat_at.is_some());
        next_frame_matching(&mut seen, is_register).await;

        // The socket vanished without a close reaching the read half.
        driver.socket = None;
        driver.on_heartbeat_due().await;

        assert_eq!(driver.machine.state(), ConnectionState::Connecting);
        assert!(driver.heartbeat_at.is_none());
        assert!(driver.reconnect_at.is_none());
        assert!(driver.connecting.is_some());

        let result = wait_connect(&mut driver.connecting).await;
        driver.connecting = None;
        driver.on_connected(result).await;
        let again = next_frame_matching(&mut seen, is_register).await;
        assert_eq!(again, Frame::Register { user_id: ME });
        assert_eq!(driver.machine.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_clears_cached_threads() {
        let (addr, mut seen, control) = fake_server().await;
        let cache = MessageCache::shared(ME);
        {
            let mut guard = cache::lock(&cache);
            guard.store_conversation(PEER, vec![pushed_message()]);
            guard.store_summaries(Vec::new());
        }

        let (cmd, mut notes) = connected_client(config(addr), Some(cache.clone()), &mut seen).await;
        // The first open is not a reconnect.
        assert!(cache::lock(&cache).conversation(PEER).is_some());

        control.send(Control::Drop).unwrap();
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Disconnected)
        })
        .await;

        next_frame_matching(&mut seen, is_register).await;
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::Connected)
        })
        .await;
        assert!(cache::lock(&cache).conversation(PEER).is_none());
        assert!(cache::lock(&cache).summaries().is_none());

        cmd.send(ClientCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_media_does_not_stall_the_socket() {
        let (addr, mut seen, _control) = fake_server().await;
        let engine = FakeEngine::default();
        engine.log.lock().unwrap().media_delay = Some(Duration::from_millis(800));

        let (cmd, mut notes) = spawn_client(config(addr), engine.clone(), None);
        next_frame_matching(&mut seen, is_register).await;

        cmd.send(ClientCommand::StartCall {
            receiver: PEER,
            media_type: MediaType::Audio,
        })
        .await
        .unwrap();

        let (tx, rx) = oneshot::channel();
        cmd.send(ClientCommand::GetState(tx)).await.unwrap();
        let state = timeout(Duration::from_millis(300), rx)
            .await
            .expect("state query blocked behind media")
            .unwrap();
        assert_eq!(state, ConnectionState::Connected);

        let mut heartbeats = 0;
        loop {
            match next_seen(&mut seen).await {
                Seen::Frame(Frame::Heartbeat) => heartbeats += 1,
                Seen::Frame(Frame::CallOffer(offer)) => {
                    assert_eq!(offer.receiver_id, PEER);
                    break;
                }
                _ => {}
            }
        }
        assert!(heartbeats >= 3, "{heartbeats} heartbeats while media was pending");

        // Shutdown hangs up the call and releases its media.
        cmd.send(ClientCommand::Shutdown).await.unwrap();
        let end = next_frame_matching(&mut seen, |f| matches!(f, Frame::CallEnd(_))).await;
        assert!(matches!(end, Frame::CallEnd(CallEnd { receiver_id: PEER, .. })));
        wait_for(&mut notes, |n| {
            *n == ClientNotification::ConnectionChanged(ConnectionState::ShutDown)
        })
        .await;
        assert_eq!(engine.live_streams(), 0);
        assert_eq!(engine.live_peers(), 0);
    }
}
