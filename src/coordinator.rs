use crate::config::NegotiationConfig;
use crate::error::{BridgeError, ChannelError, NegotiatorError, NegotiatorResult};
use crate::peer::connection::{CapabilityFactory, RemoteTrack, TransportEvent, TransportEventSink};
use crate::peer::data_channel::DataChannelManager;
use crate::peer::ice::{EarlyBatch, EarlyCandidates};
use crate::peer::negotiator::SessionNegotiator;
use crate::peer::state::{ConnectionState, NegotiationState, Role, MAX_EARLY_PEERS};
use crate::peer::types::{IceCandidate, IncomingCallOffer, PeerId, SessionDescription, SessionId};
use crate::signaling::{BridgeEvent, SignalingBridge};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// События сессии для UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Failed(NegotiatorError),
    Closed,
    ChannelOpened,
    ChannelClosed,
    Message(Bytes),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct CallStatus {
    state: Option<NegotiationState>,
    fingerprint: Option<String>,
}

enum Command {
    StartCall {
        peer: Option<PeerId>,
        reply: oneshot::Sender<NegotiatorResult<()>>,
    },
    AcceptCall {
        offer: IncomingCallOffer,
        reply: oneshot::Sender<NegotiatorResult<()>>,
    },
    SendText {
        data: Bytes,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    EndCall,
}

/// Ручка управления звонками; все входы обрабатывает одна задача
#[derive(Clone)]
pub struct SessionCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    incoming: broadcast::Sender<IncomingCallOffer>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<CallStatus>,
    close_signal: Arc<watch::Sender<u64>>,
    bridge: Arc<SignalingBridge>,
}

impl SessionCoordinator {
    /// Запускает задачу координатора и перекачку входящих сигналов
    pub fn spawn(
        config: NegotiationConfig,
        bridge: Arc<SignalingBridge>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        factory: Arc<dyn CapabilityFactory>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        let (incoming, _) = broadcast::channel(16);
        let (events, _) = broadcast::channel(64);
        let (status_tx, status) = watch::channel(CallStatus::default());
        let close_signal = Arc::new(watch::Sender::new(0u64));
        let early = EarlyCandidates::new(config.candidate_queue_limit, MAX_EARLY_PEERS);

        bridge.spawn_pump(inbound, bridge_tx);

        let actor = Actor {
            config,
            bridge: bridge.clone(),
            factory,
            close_signal: close_signal.clone(),
            incoming: incoming.clone(),
            events: events.clone(),
            status: status_tx,
            transport_tx,
            grace_tx,
            active: None,
            epoch: 0,
            early,
        };
        tokio::spawn(actor.run(command_rx, bridge_rx, transport_rx, grace_rx));

        Self {
            commands: command_tx,
            incoming,
            events,
            status,
            close_signal,
            bridge,
        }
    }

    pub async fn start_call(&self, peer_hint: Option<PeerId>) -> NegotiatorResult<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::StartCall {
                peer: peer_hint,
                reply,
            })
            .is_err()
        {
            return Err(NegotiatorError::SessionClosed);
        }
        rx.await.unwrap_or(Err(NegotiatorError::SessionClosed))
    }

    pub fn incoming_calls(&self) -> broadcast::Receiver<IncomingCallOffer> {
        self.incoming.subscribe()
    }

    pub async fn accept_call(&self, offer: IncomingCallOffer) -> NegotiatorResult<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::AcceptCall { offer, reply })
            .is_err()
        {
            return Err(NegotiatorError::SessionClosed);
        }
        rx.await.unwrap_or(Err(NegotiatorError::SessionClosed))
    }

    pub async fn send_text(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        let data = data.into();
        if self.commands.send(Command::SendText { data, reply }).is_err() {
            return Err(ChannelError::NoActiveCall);
        }
        rx.await.unwrap_or(Err(ChannelError::NoActiveCall))
    }

    /// Сначала сигнал закрытия (прерывает операцию в полёте), затем команда
    pub fn end_call(&self) {
        self.close_signal.send_modify(|generation| *generation += 1);
        if self.commands.send(Command::EndCall).is_err() {
            debug!("coordinator already stopped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Состояние текущей или последней сессии
    pub fn call_state(&self) -> Option<NegotiationState> {
        self.status.borrow().state
    }

    pub fn endpoint_id(&self) -> Option<SessionId> {
        self.bridge.endpoint()
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.status.borrow().fingerprint.clone()
    }
}

struct ActiveCall {
    epoch: u64,
    negotiator: SessionNegotiator,
    channel: DataChannelManager,
    grace: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn stop_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
    }
}

struct Actor {
    config: NegotiationConfig,
    bridge: Arc<SignalingBridge>,
    factory: Arc<dyn CapabilityFactory>,
    close_signal: Arc<watch::Sender<u64>>,
    incoming: broadcast::Sender<IncomingCallOffer>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<CallStatus>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    grace_tx: mpsc::UnboundedSender<u64>,
    active: Option<ActiveCall>,
    epoch: u64,
    // кандидаты от peer'ов, с которыми ещё нет сессии
    early: EarlyCandidates,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut bridge_events: mpsc::UnboundedReceiver<BridgeEvent>,
        mut transport_events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        mut grace_expired: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = bridge_events.recv() => self.handle_bridge(event).await,
                Some((epoch, event)) = transport_events.recv() => {
                    self.handle_transport(epoch, event).await
                }
                Some(epoch) = grace_expired.recv() => self.handle_grace_expired(epoch).await,
            }
        }

        if let Some(call) = self.active.as_mut() {
            let before = call.negotiator.state();
            let _ = call.negotiator.close().await;
            self.settle(Some(before));
        }
        debug!("session coordinator stopped");
    }

    fn current_state(&self) -> Option<NegotiationState> {
        self.active.as_ref().map(|call| call.negotiator.state())
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("no session event subscribers");
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartCall { peer, reply } => {
                let result = self.start_call(peer).await;
                let _ = reply.send(result);
            }
            Command::AcceptCall { offer, reply } => {
                let result = self.accept_call(offer).await;
                let _ = reply.send(result);
            }
            Command::SendText { data, reply } => {
                let result = match &self.active {
                    Some(call) => call.channel.send(data).await,
                    None => Err(ChannelError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::EndCall => self.end_call().await,
        }
    }

    fn ensure_free(&self) -> NegotiatorResult<()> {
        match self.current_state() {
            Some(state) if !state.is_terminal() => {
                debug!(%state, "rejecting call, session busy");
                Err(NegotiatorError::SessionBusy)
            }
            _ => Ok(()),
        }
    }

    async fn open_session(&mut self, role: Role) -> NegotiatorResult<()> {
        let id = self.bridge.endpoint().ok_or(BridgeError::Unassigned)?;

        self.epoch += 1;
        let sink = TransportEventSink::new(self.epoch, self.transport_tx.clone());
        let capability = match self.factory.build(&self.config, role, sink).await {
            Ok(capability) => capability,
            Err(err) => {
                let err = NegotiatorError::CapabilityUnavailable(err.to_string());
                warn!(error = %err, "could not create media transport");
                self.status.send_replace(CallStatus {
                    state: Some(NegotiationState::Failed),
                    fingerprint: None,
                });
                self.publish(SessionEvent::Failed(err.clone()));
                return Err(err);
            }
        };

        let negotiator =
            SessionNegotiator::new(id, capability.clone(), self.bridge.clone(), &self.config)
                .with_cancellation(self.close_signal.subscribe());
        let channel = DataChannelManager::new(negotiator.data_channel_label(), capability);
        info!(epoch = self.epoch, ?role, "session created");
        self.active = Some(ActiveCall {
            epoch: self.epoch,
            negotiator,
            channel,
            grace: None,
        });
        Ok(())
    }

    async fn start_call(&mut self, peer: Option<PeerId>) -> NegotiatorResult<()> {
        self.ensure_free()?;
        self.open_session(Role::Caller).await?;
        self.early.clear();

        let Some(call) = self.active.as_mut() else {
            return Err(NegotiatorError::SessionClosed);
        };
        let result = call.negotiator.start_as_caller(peer).await;
        self.finish_guarded(&result).await;
        self.settle(Some(NegotiationState::Idle));
        result
    }

    async fn accept_call(&mut self, offer: IncomingCallOffer) -> NegotiatorResult<()> {
        self.ensure_free()?;
        self.open_session(Role::Callee).await?;
        let early = self.early.take(&offer.from);
        self.early.clear();

        let Some(call) = self.active.as_mut() else {
            return Err(NegotiatorError::SessionClosed);
        };
        let mut result = replay_early(&mut call.negotiator, early).await;
        if result.is_ok() {
            result = call
                .negotiator
                .accept_offer(offer.from, offer.description)
                .await;
        }
        self.finish_guarded(&result).await;
        self.settle(Some(NegotiationState::Idle));
        result
    }

    /// Сессия, отклонённая проверкой, тихо уничтожается
    async fn finish_guarded(&mut self, result: &NegotiatorResult<()>) {
        if result.is_ok() || self.current_state() != Some(NegotiationState::Idle) {
            return;
        }
        if let Some(mut call) = self.active.take() {
            let _ = call.negotiator.close().await;
        }
    }

    async fn end_call(&mut self) {
        let Some(call) = self.active.as_mut() else {
            debug!("end_call without active session");
            return;
        };
        let before = call.negotiator.state();
        let _ = call.negotiator.close().await;
        self.settle(Some(before));
    }

    async fn handle_bridge(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::EndpointAssigned(id) => {
                debug!(%id, "endpoint ready");
            }
            BridgeEvent::Offer { from, description } => {
                info!(%from, busy = self.ensure_free().is_err(), "incoming call");
                let offer = IncomingCallOffer { from, description };
                if self.incoming.send(offer).is_err() {
                    debug!("no one is listening for incoming calls");
                }
            }
            BridgeEvent::Answer { from, description } => self.on_answer(from, description).await,
            BridgeEvent::Candidate { from, candidate } => {
                self.on_remote_candidate(from, candidate).await
            }
        }
    }

    async fn on_answer(&mut self, from: PeerId, description: SessionDescription) {
        let Some(call) = self.active.as_mut() else {
            debug!(%from, "answer without active session");
            return;
        };
        let before = call.negotiator.state();
        let mut result = call
            .negotiator
            .apply_answer(from.clone(), description)
            .await;
        if result.is_ok() {
            let early = self.early.take(&from);
            result = replay_early(&mut call.negotiator, early).await;
        }
        if let Err(err) = result {
            warn!(error = %err, "answer not applied");
        }
        self.settle(Some(before));
    }

    async fn on_remote_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        if let Some(call) = self.active.as_mut() {
            if call.negotiator.peer() == Some(&from) {
                let before = call.negotiator.state();
                if let Err(err) = call.negotiator.note_remote_candidate(candidate).await {
                    warn!(error = %err, "remote candidate rejected");
                }
                self.settle(Some(before));
                return;
            }
        }

        // сессии с этим peer пока нет
        if let Err(err) = self.early.push(&from, candidate) {
            warn!(
                peer = %from,
                error = %err,
                "early candidates overflowed, call with this peer will fail"
            );
        }
    }

    async fn handle_transport(&mut self, epoch: u64, event: TransportEvent) {
        let Some(call) = self.active.as_mut() else {
            debug!(epoch, "transport event without session");
            return;
        };
        if call.epoch != epoch {
            debug!(epoch, current = call.epoch, "stale transport event dropped");
            return;
        }
        let before = call.negotiator.state();

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(err) = call.negotiator.note_local_candidate(candidate).await {
                    warn!(error = %err, "local candidate not delivered");
                }
            }
            TransportEvent::ConnectionState(ConnectionState::Disconnected) => {
                if before == NegotiationState::Connected && call.grace.is_none() {
                    let grace = self.config.disconnect_grace;
                    info!(?grace, "transport disconnected, waiting for recovery");
                    let expired = self.grace_tx.clone();
                    call.grace = Some(tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = expired.send(epoch);
                    }));
                }
            }
            TransportEvent::ConnectionState(state) => {
                if state == ConnectionState::Connected && call.grace.is_some() {
                    info!("transport recovered");
                    call.stop_grace();
                }
                if let Err(err) = call.negotiator.on_transport_state(state).await {
                    warn!(error = %err, "transport failure");
                }
            }
            TransportEvent::DataChannelOpened => {
                if call.channel.on_open() {
                    self.publish(SessionEvent::ChannelOpened);
                }
            }
            TransportEvent::DataChannelClosed => {
                if call.channel.on_close() {
                    self.publish(SessionEvent::ChannelClosed);
                }
            }
            TransportEvent::DataChannelMessage(data) => {
                self.publish(SessionEvent::Message(data));
            }
            TransportEvent::RemoteTrack(track) => {
                self.publish(SessionEvent::RemoteTrack(track));
            }
        }
        self.settle(Some(before));
    }

    async fn handle_grace_expired(&mut self, epoch: u64) {
        let Some(call) = self.active.as_mut() else {
            return;
        };
        if call.epoch != epoch || call.grace.is_none() {
            return;
        }
        call.grace = None;
        warn!("grace period expired, closing session");
        let before = call.negotiator.state();
        let _ = call.negotiator.close().await;
        self.settle(Some(before));
    }

    /// Публикует терминальные переходы и уничтожает завершённую сессию
    fn settle(&mut self, before: Option<NegotiationState>) {
        let Some(call) = self.active.as_mut() else {
            return;
        };
        let now = call.negotiator.state();
        self.status.send_replace(CallStatus {
            state: Some(now),
            fingerprint: call.negotiator.fingerprint(),
        });
        if before == Some(now) {
            return;
        }

        match now {
            NegotiationState::Connected => {
                let _ = self.events.send(SessionEvent::Connected);
            }
            NegotiationState::Failed => {
                let err = call
                    .negotiator
                    .failure()
                    .cloned()
                    .unwrap_or(NegotiatorError::TransportFailed);
                let _ = self.events.send(SessionEvent::Failed(err));
            }
            NegotiationState::Closed => {
                let _ = self.events.send(SessionEvent::Closed);
            }
            _ => {}
        }

        if now.is_terminal() {
            if let Some(mut call) = self.active.take() {
                call.stop_grace();
                if call.channel.on_close() {
                    let _ = self.events.send(SessionEvent::ChannelClosed);
                }
                info!(epoch = call.epoch, state = %now, "session destroyed");
            }
        }
    }
}

/// Переигрывает кандидаты, пришедшие до сессии; переполнение завершает сессию
async fn replay_early(negotiator: &mut SessionNegotiator, early: EarlyBatch) -> NegotiatorResult<()> {
    if let Some(err) = early.overflow {
        return Err(negotiator.fail_with(err).await);
    }
    if !early.candidates.is_empty() {
        debug!(count = early.candidates.len(), "replaying early candidates");
    }
    for candidate in early.candidates {
        negotiator.note_remote_candidate(candidate).await?;
    }
    Ok(())
}
