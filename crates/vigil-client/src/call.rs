//! Call signaling state machine.
//!
//! One [`CallManager`] per client. It holds at most one call, either
//! outgoing/active or incoming, plus the media resources that belong to it.
//! Media itself lives behind [`MediaEngine`]; the manager only decides when
//! to acquire, negotiate and release.
//!
//! Remote ICE candidates that arrive before the remote description is set are
//! buffered and applied in arrival order once it is.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use vigil_shared::protocol::{
    CallAnswer, CallBusy, CallCandidate, CallEnd, CallOffer, EndReason, Frame, IceCandidate,
    SessionDescription,
};
use vigil_shared::types::{MediaType, UserId};

use crate::error::CallError;
use crate::events::CallEvent;

/// Local media and peer connection operations.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    type Stream: Send + Sync;
    type Peer: Send + Sync;

    /// Acquire microphone (and camera for video). Fails when permission is
    /// denied or no device exists.
    async fn open_local_stream(&self, media_type: MediaType) -> Result<Self::Stream, CallError>;

    async fn create_peer(&self, local: &Self::Stream) -> Result<Self::Peer, CallError>;

    async fn create_offer(&self, peer: &mut Self::Peer) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self, peer: &mut Self::Peer) -> Result<SessionDescription, CallError>;

    async fn set_remote_description(
        &self,
        peer: &mut Self::Peer,
        desc: &SessionDescription,
    ) -> Result<(), CallError>;

    async fn add_ice_candidate(
        &self,
        peer: &mut Self::Peer,
        candidate: &IceCandidate,
    ) -> Result<(), CallError>;

    /// Remote stream, once the peer connection has received tracks.
    fn take_remote_stream(&self, peer: &mut Self::Peer) -> Option<Self::Stream>;

    fn stop_stream(&self, stream: Self::Stream);

    fn close_peer(&self, peer: Self::Peer);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Offer sent, waiting for the callee.
    Offering,
    /// Offer received, waiting for the local user to accept or reject.
    Ringing,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub peer: UserId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media_type: MediaType,
    /// The caller's offer, held while ringing.
    pub remote_offer: Option<SessionDescription>,
}

/// Frames to send and events to surface after a call operation.
#[derive(Debug, Default, PartialEq)]
pub struct CallOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<CallEvent>,
}

impl CallOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty()
    }

    fn frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    fn event(mut self, event: CallEvent) -> Self {
        self.events.push(event);
        self
    }
}

pub struct CallManager<E: MediaEngine> {
    me: UserId,
    engine: E,
    state: CallState,
    session: Option<CallSession>,
    local_stream: Option<E::Stream>,
    remote_stream: Option<E::Stream>,
    peer: Option<E::Peer>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    ringing: bool,
}

impl<E: MediaEngine> CallManager<E> {
    pub fn new(me: UserId, engine: E) -> Self {
        Self {
            me,
            engine,
            state: CallState::Idle,
            session: None,
            local_stream: None,
            remote_stream: None,
            peer: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            ringing: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Outgoing or established call.
    pub fn active_call(&self) -> Option<&CallSession> {
        match self.state {
            CallState::Offering | CallState::Connected => self.session.as_ref(),
            _ => None,
        }
    }

    /// Ringing call awaiting a local decision.
    pub fn incoming_call(&self) -> Option<&CallSession> {
        match self.state {
            CallState::Ringing => self.session.as_ref(),
            _ => None,
        }
    }

    pub fn has_local_stream(&self) -> bool {
        self.local_stream.is_some()
    }

    pub fn has_remote_stream(&self) -> bool {
        self.remote_stream.is_some()
    }

    pub fn has_peer_connection(&self) -> bool {
        self.peer.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Place a call. Guard failures (busy, self-call) change nothing and are
    /// returned as errors; media faults release everything and come back as
    /// a [`CallEvent::Failed`].
    pub async fn start_call(
        &mut self,
        receiver: UserId,
        media_type: MediaType,
    ) -> Result<CallOutput, CallError> {
        if receiver == self.me {
            return Err(CallError::SelfCall);
        }
        if self.state != CallState::Idle {
            return Err(CallError::Busy);
        }

        self.session = Some(CallSession {
            peer: receiver,
            caller_id: self.me,
            receiver_id: receiver,
            media_type,
            remote_offer: None,
        });
        self.state = CallState::Offering;

        match self.prepare_offer(media_type).await {
            Ok(offer) => {
                info!(peer = %receiver, ?media_type, "Placing call");
                Ok(CallOutput::default().frame(Frame::CallOffer(CallOffer {
                    caller_id: self.me,
                    receiver_id: receiver,
                    media_type,
                    offer,
                })))
            }
            Err(e) => Ok(self.fail(e, false)),
        }
    }

    pub async fn accept_call(&mut self) -> Result<CallOutput, CallError> {
        if self.state != CallState::Ringing {
            return Err(CallError::InvalidState);
        }
        let Some(session) = self.session.clone() else {
            return Err(CallError::InvalidState);
        };

        self.ringing = false;
        let mut out = CallOutput::default().event(CallEvent::RingtoneStop);

        let result = match session.remote_offer.as_ref() {
            Some(offer) => self.prepare_answer(session.media_type, offer).await,
            None => Err(CallError::InvalidState),
        };
        match result {
            Ok(answer) => {
                self.state = CallState::Connected;
                self.collect_remote_stream();
                info!(peer = %session.peer, "Call accepted");
                out.frames.push(Frame::CallAnswer(CallAnswer {
                    caller_id: session.caller_id,
                    receiver_id: self.me,
                    answer,
                }));
                out.events.push(CallEvent::Connected { peer: session.peer });
            }
            Err(e) => {
                let failed = self.fail(e, true);
                out.frames.extend(failed.frames);
                out.events.extend(failed.events);
            }
        }
        Ok(out)
    }

    pub fn reject_call(&mut self) -> Result<CallOutput, CallError> {
        if self.state != CallState::Ringing {
            return Err(CallError::InvalidState);
        }
        Ok(self.hang_up(EndReason::Rejected))
    }

    /// Hang up from any state. Idle yields nothing.
    pub fn end_call(&mut self) -> CallOutput {
        match self.state {
            CallState::Idle => CallOutput::default(),
            CallState::Ringing => self.hang_up(EndReason::Rejected),
            _ => self.hang_up(EndReason::Ended),
        }
    }

    /// A locally gathered ICE candidate, to be relayed to the peer.
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<Frame> {
        let session = self.session.as_ref()?;
        Some(Frame::CallCandidate(CallCandidate {
            sender_id: self.me,
            receiver_id: session.peer,
            candidate,
        }))
    }

    /// Apply a signaling frame from the socket. Non-call frames are ignored.
    pub async fn handle_frame(&mut self, frame: Frame) -> CallOutput {
        match frame {
            Frame::CallOffer(offer) => self.on_offer(offer),
            Frame::CallAnswer(answer) => self.on_answer(answer).await,
            Frame::CallCandidate(c) => {
                self.on_candidate(c).await;
                CallOutput::default()
            }
            Frame::CallEnd(end) => self.on_end(end),
            Frame::CallBusy(busy) => self.on_busy(busy),
            _ => CallOutput::default(),
        }
    }

    fn on_offer(&mut self, offer: CallOffer) -> CallOutput {
        let from = offer.caller_id;
        if from == self.me || self.state != CallState::Idle {
            debug!(from = %from, state = ?self.state, "Declining offer: busy");
            return CallOutput::default().frame(Frame::CallBusy(CallBusy {
                sender_id: self.me,
                receiver_id: from,
            }));
        }

        self.session = Some(CallSession {
            peer: from,
            caller_id: from,
            receiver_id: self.me,
            media_type: offer.media_type,
            remote_offer: Some(offer.offer),
        });
        self.state = CallState::Ringing;
        self.ringing = true;
        info!(from = %from, media_type = ?offer.media_type, "Incoming call");

        CallOutput::default()
            .event(CallEvent::Incoming {
                from,
                media_type: offer.media_type,
            })
            .event(CallEvent::RingtoneStart)
    }

    async fn on_answer(&mut self, answer: CallAnswer) -> CallOutput {
        if self.state != CallState::Offering || !self.is_peer(answer.receiver_id) {
            debug!(from = %answer.receiver_id, "Ignoring stale answer");
            return CallOutput::default();
        }

        let result = match self.peer.as_mut() {
            Some(peer) => self.engine.set_remote_description(peer, &answer.answer).await,
            None => Err(CallError::InvalidState),
        };
        if let Err(e) = result {
            return self.fail(e, true);
        }

        self.remote_description_set = true;
        self.flush_candidates().await;
        self.state = CallState::Connected;
        self.collect_remote_stream();
        info!(peer = %answer.receiver_id, "Call connected");

        CallOutput::default().event(CallEvent::Connected {
            peer: answer.receiver_id,
        })
    }

    async fn on_candidate(&mut self, c: CallCandidate) {
        if self.state == CallState::Idle || !self.is_peer(c.sender_id) {
            debug!(from = %c.sender_id, "Ignoring candidate for no call");
            return;
        }

        match self.peer.as_mut() {
            Some(peer) if self.remote_description_set => {
                if let Err(e) = self.engine.add_ice_candidate(peer, &c.candidate).await {
                    warn!(error = %e, "Failed to add ICE candidate");
                }
            }
            _ => self.pending_candidates.push(c.candidate),
        }
    }

    fn on_end(&mut self, end: CallEnd) -> CallOutput {
        if self.state == CallState::Idle || !self.is_peer(end.sender_id) {
            return CallOutput::default();
        }
        info!(peer = %end.sender_id, reason = ?end.reason, "Call ended by peer");
        let mut out = CallOutput::default();
        self.release(&mut out);
        out.event(CallEvent::Ended {
            peer: end.sender_id,
            reason: end.reason,
            by_peer: true,
        })
    }

    fn on_busy(&mut self, busy: CallBusy) -> CallOutput {
        if self.state != CallState::Offering || !self.is_peer(busy.sender_id) {
            return CallOutput::default();
        }
        info!(peer = %busy.sender_id, "Callee is busy");
        let mut out = CallOutput::default();
        self.release(&mut out);
        out.event(CallEvent::Busy {
            peer: busy.sender_id,
        })
    }

    async fn prepare_offer(&mut self, media_type: MediaType) -> Result<SessionDescription, CallError> {
        self.open_media(media_type).await?;
        match self.peer.as_mut() {
            Some(peer) => self.engine.create_offer(peer).await,
            None => Err(CallError::InvalidState),
        }
    }

    async fn prepare_answer(
        &mut self,
        media_type: MediaType,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        self.open_media(media_type).await?;
        let Some(peer) = self.peer.as_mut() else {
            return Err(CallError::InvalidState);
        };
        self.engine.set_remote_description(peer, offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        match self.peer.as_mut() {
            Some(peer) => self.engine.create_answer(peer).await,
            None => Err(CallError::InvalidState),
        }
    }

    async fn open_media(&mut self, media_type: MediaType) -> Result<(), CallError> {
        let local = self.engine.open_local_stream(media_type).await?;
        let peer = self.engine.create_peer(&local).await;
        self.local_stream = Some(local);
        self.peer = Some(peer?);
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in &pending {
            if let Err(e) = self.engine.add_ice_candidate(peer, candidate).await {
                warn!(error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    fn collect_remote_stream(&mut self) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        if let Some(stream) = self.engine.take_remote_stream(peer) {
            if let Some(old) = self.remote_stream.replace(stream) {
                self.engine.stop_stream(old);
            }
        }
    }

    fn hang_up(&mut self, reason: EndReason) -> CallOutput {
        let mut out = CallOutput::default();
        let Some(peer) = self.release(&mut out) else {
            return out;
        };
        info!(peer = %peer, ?reason, "Hanging up");
        out.frame(Frame::CallEnd(CallEnd {
            sender_id: self.me,
            receiver_id: peer,
            reason,
        }))
        .event(CallEvent::Ended {
            peer,
            reason,
            by_peer: false,
        })
    }

    /// Release everything and tell the peer, when it knows about the call.
    fn fail(&mut self, error: CallError, notify_peer: bool) -> CallOutput {
        warn!(error = %error, "Call failed");
        let mut out = CallOutput::default();
        let Some(peer) = self.release(&mut out) else {
            return out;
        };
        if notify_peer {
            out = out.frame(Frame::CallEnd(CallEnd {
                sender_id: self.me,
                receiver_id: peer,
                reason: EndReason::Ended,
            }));
        }
        out.event(CallEvent::Failed {
            peer,
            error: error.to_string(),
        })
    }

    /// Stop both streams, close the peer connection and return to idle.
    /// Returns the peer of the call that was torn down.
    fn release(&mut self, out: &mut CallOutput) -> Option<UserId> {
        if std::mem::take(&mut self.ringing) {
            out.events.push(CallEvent::RingtoneStop);
        }
        if let Some(stream) = self.local_stream.take() {
            self.engine.stop_stream(stream);
        }
        if let Some(stream) = self.remote_stream.take() {
            self.engine.stop_stream(stream);
        }
        if let Some(peer) = self.peer.take() {
            self.engine.close_peer(peer);
        }
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.state = CallState::Idle;
        self.session.take().map(|s| s.peer)
    }

    fn is_peer(&self, user: UserId) -> bool {
        self.session.as_ref().is_some_and(|s| s.peer == user)
    }
}
