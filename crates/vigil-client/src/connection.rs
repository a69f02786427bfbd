//! Socket lifecycle as an explicit state machine.
//!
//! The machine owns no I/O. Each [`ConnectionEvent`] yields a list of
//! [`Effect`]s for the driver to carry out (open or close the socket, send a
//! frame, arm or cancel a timer). It tracks which timers are armed so that at
//! most one heartbeat timer and one reconnect timer exist at any moment, and
//! never both at once.

use std::time::Duration;

use vigil_shared::protocol::Frame;
use vigil_shared::types::UserId;

use crate::backoff::Backoff;
use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal. Entered on intentional shutdown; nothing reconnects.
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    Opened,
    Closed,
    Error,
    /// The heartbeat timer fired. `socket_open` is the driver's view of the
    /// transport at that moment.
    HeartbeatTick { socket_open: bool },
    ReconnectTimerFired,
    VisibilityRegained,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenSocket,
    CloseSocket,
    Send(Frame),
    StartHeartbeat(Duration),
    CancelHeartbeat,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StateChanged(ConnectionState),
}

#[derive(Debug)]
pub struct ConnectionMachine {
    user_id: UserId,
    state: ConnectionState,
    heartbeat_interval: Duration,
    backoff: Backoff,
    heartbeat_armed: bool,
    reconnect_armed: bool,
}

impl ConnectionMachine {
    pub fn new(user_id: UserId, heartbeat_interval: Duration, backoff: BackoffConfig) -> Self {
        Self {
            user_id,
            state: ConnectionState::Disconnected,
            heartbeat_interval,
            backoff: Backoff::new(backoff),
            heartbeat_armed: false,
            reconnect_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn heartbeat_armed(&self) -> bool {
        self.heartbeat_armed
    }

    pub fn reconnect_armed(&self) -> bool {
        self.reconnect_armed
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        use ConnectionEvent as Ev;
        use ConnectionState as St;

        let mut fx = Vec::new();
        match (self.state, event) {
            (St::ShutDown, Ev::Opened) => fx.push(Effect::CloseSocket),
            (St::ShutDown, _) => {}

            (_, Ev::Shutdown) => {
                self.cancel_heartbeat(&mut fx);
                self.cancel_reconnect(&mut fx);
                if matches!(self.state, St::Connecting | St::Connected) {
                    fx.push(Effect::CloseSocket);
                }
                self.transition(St::ShutDown, &mut fx);
            }

            // Connects are serialized: a second start while one is in flight
            // or established does nothing.
            (St::Disconnected, Ev::Start | Ev::VisibilityRegained) => self.connect(&mut fx),
            (St::Connecting | St::Connected, Ev::Start) => {}

            (St::Disconnected, Ev::ReconnectTimerFired) => {
                self.reconnect_armed = false;
                self.connect(&mut fx);
            }
            (_, Ev::ReconnectTimerFired) => self.reconnect_armed = false,

            (St::Connecting, Ev::Opened) => {
                self.backoff.reset();
                self.transition(St::Connected, &mut fx);
                fx.push(Effect::Send(Frame::Register {
                    user_id: self.user_id,
                }));
                self.cancel_heartbeat(&mut fx);
                fx.push(Effect::StartHeartbeat(self.heartbeat_interval));
                self.heartbeat_armed = true;
            }
            (St::Connected | St::Disconnected, Ev::Opened) => fx.push(Effect::CloseSocket),

            (St::Connecting | St::Connected, Ev::Closed) => {
                self.cancel_heartbeat(&mut fx);
                self.transition(St::Disconnected, &mut fx);
                self.schedule_reconnect(&mut fx);
            }
            (St::Disconnected, Ev::Closed) => {}

            // Errors are always followed by a close; the close drives recovery.
            (_, Ev::Error) => {}

            (St::Connected, Ev::HeartbeatTick { socket_open: true }) => {
                fx.push(Effect::Send(Frame::Heartbeat));
            }
            (St::Connected, Ev::HeartbeatTick { socket_open: false }) => {
                self.cancel_heartbeat(&mut fx);
                fx.push(Effect::CloseSocket);
                self.transition(St::Disconnected, &mut fx);
                self.connect(&mut fx);
            }
            (_, Ev::HeartbeatTick { .. }) => self.cancel_heartbeat(&mut fx),

            // A dead socket fails this send and surfaces as a close.
            (St::Connected, Ev::VisibilityRegained) => fx.push(Effect::Send(Frame::Heartbeat)),
            (St::Connecting, Ev::VisibilityRegained) => {}
        }
        fx
    }

    fn transition(&mut self, next: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state != next {
            self.state = next;
            fx.push(Effect::StateChanged(next));
        }
    }

    fn connect(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_reconnect(fx);
        self.transition(ConnectionState::Connecting, fx);
        fx.push(Effect::OpenSocket);
    }

    fn schedule_reconnect(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_reconnect(fx);
        fx.push(Effect::ScheduleReconnect(self.backoff.next_delay()));
        self.reconnect_armed = true;
    }

    fn cancel_heartbeat(&mut self, fx: &mut Vec<Effect>) {
        if self.heartbeat_armed {
            self.heartbeat_armed = false;
            fx.push(Effect::CancelHeartbeat);
        }
    }

    fn cancel_reconnect(&mut self, fx: &mut Vec<Effect>) {
        if self.reconnect_armed {
            self.reconnect_armed = false;
            fx.push(Effect::CancelReconnect);
        }
    }
}
