use crate::config::NegotiationConfig;
use crate::error::{CapabilityError, NegotiatorError, NegotiatorResult};
use crate::logger::analyze_candidates;
use crate::peer::connection::MediaCapability;
use crate::peer::state::{ConnectionState, NegotiationState, Role, DATA_CHANNEL_LABEL};
use crate::peer::types::{IceCandidate, PeerId, SdpKind, SessionDescription, SessionId};
use crate::session::Session;
use crate::signaling::SignalingBridge;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Чем закончилась внешняя асинхронная операция
enum Interrupted {
    Cancelled,
    Failed(CapabilityError),
}

/// Ждёт операцию транспорта, пока не сменилось поколение закрытия
async fn run_guarded<T, F>(
    cancel: &mut watch::Receiver<u64>,
    generation: u64,
    fut: F,
) -> Result<T, Interrupted>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    tokio::select! {
        biased;
        Ok(_) = cancel.wait_for(|current| *current != generation) => Err(Interrupted::Cancelled),
        res = fut => res.map_err(Interrupted::Failed),
    }
}

/// Автомат переговоров одной сессии
pub struct SessionNegotiator {
    session: Session,
    capability: Arc<dyn MediaCapability>,
    bridge: Arc<SignalingBridge>,
    cancel: watch::Receiver<u64>,
    generation: u64,
}

impl SessionNegotiator {
    pub fn new(
        id: SessionId,
        capability: Arc<dyn MediaCapability>,
        bridge: Arc<SignalingBridge>,
        config: &NegotiationConfig,
    ) -> Self {
        let (_, cancel) = watch::channel(0);
        let mut session = Session::new(id, config.candidate_queue_limit);
        session.data_channel = Some(config.data_channel_label.clone());
        Self {
            session,
            capability,
            bridge,
            cancel,
            generation: 0,
        }
    }

    /// Подписка на сигнал закрытия: смена значения прерывает операцию в полёте
    pub fn with_cancellation(mut self, cancel: watch::Receiver<u64>) -> Self {
        self.generation = *cancel.borrow();
        self.cancel = cancel;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.session.state
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.session.peer.as_ref()
    }

    pub fn failure(&self) -> Option<&NegotiatorError> {
        self.session.failure.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.session.pending.len()
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.session.fingerprint()
    }

    pub fn data_channel_label(&self) -> &str {
        self.session.data_channel.as_deref().unwrap_or(DATA_CHANNEL_LABEL)
    }

    fn transition(&mut self, next: NegotiationState) {
        let from = self.session.state;
        debug_assert!(from.can_transition_to(next), "{from} -> {next}");
        info!(%from, to = %next, peer = ?self.session.peer, "session state changed");
        self.session.state = next;
    }

    fn invalid(&self, operation: &'static str) -> NegotiatorError {
        NegotiatorError::InvalidTransition {
            operation,
            state: self.session.state,
        }
    }

    /// A-сторона: создаём OFFER и отправляем его; без подсказки offer уходит всем
    pub async fn start_as_caller(&mut self, peer_hint: Option<PeerId>) -> NegotiatorResult<()> {
        if self.session.state != NegotiationState::Idle {
            return Err(self.invalid("start_as_caller"));
        }
        if !self.capability.has_tracks() {
            return Err(NegotiatorError::NoMediaCapability);
        }

        self.session.peer = peer_hint;
        self.session.role = Role::Caller;
        self.transition(NegotiationState::Offering);

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.create_offer(),
        )
        .await;
        let offer = self.settle(outcome).await?;

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.set_local_description(&offer),
        )
        .await;
        self.settle(outcome).await?;
        self.session.local = Some(offer.clone());

        if let Err(err) = self.bridge.send_offer(self.session.peer.as_ref(), &offer) {
            return Err(self.fail(err.into()).await);
        }
        self.transition(NegotiationState::AwaitingAnswer);
        Ok(())
    }

    /// B-сторона: получает OFFER, делает ANSWER
    pub async fn accept_offer(
        &mut self,
        peer: PeerId,
        remote_offer: SessionDescription,
    ) -> NegotiatorResult<()> {
        if let Some(bound) = &self.session.peer {
            if bound != &peer {
                return Err(NegotiatorError::PeerAlreadyBound {
                    bound: bound.clone(),
                    offered: peer,
                });
            }
        }
        if self.session.state != NegotiationState::Idle {
            return Err(self.invalid("accept_offer"));
        }
        if !self.capability.has_tracks() {
            return Err(NegotiatorError::NoMediaCapability);
        }
        if remote_offer.kind != SdpKind::Offer {
            let err = NegotiatorError::ApplyDescriptionFailed(format!(
                "expected an offer from {peer}, got {:?}",
                remote_offer.kind
            ));
            return Err(self.fail(err).await);
        }

        self.session.peer = Some(peer.clone());
        self.session.role = Role::Callee;
        self.transition(NegotiationState::AnsweringOffer);

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.set_remote_description(&remote_offer),
        )
        .await;
        self.settle(outcome).await?;
        self.session.remote = Some(remote_offer);

        // Применяем отложенные кандидаты
        self.flush_pending().await;

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.create_answer(),
        )
        .await;
        let answer = self.settle(outcome).await?;

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.set_local_description(&answer),
        )
        .await;
        self.settle(outcome).await?;
        self.session.local = Some(answer.clone());

        if let Err(err) = self.bridge.send_answer(&peer, &answer) {
            return Err(self.fail(err.into()).await);
        }
        self.transition(NegotiationState::Connecting);
        Ok(())
    }

    /// A-сторона: получает ANSWER и завершает handshake
    pub async fn apply_answer(
        &mut self,
        from: PeerId,
        remote_answer: SessionDescription,
    ) -> NegotiatorResult<()> {
        if self.session.state != NegotiationState::AwaitingAnswer {
            return Err(NegotiatorError::UnexpectedAnswer(format!(
                "answer from {from} in state {}",
                self.session.state
            )));
        }
        if let Some(bound) = &self.session.peer {
            if bound != &from {
                return Err(NegotiatorError::UnexpectedAnswer(format!(
                    "answer from {from}, expected {bound}"
                )));
            }
        }
        if remote_answer.kind != SdpKind::Answer {
            return Err(NegotiatorError::UnexpectedAnswer(
                "description is not an answer".into(),
            ));
        }

        info!(%from, "got answer");
        self.session.peer = Some(from);

        let outcome = run_guarded(
            &mut self.cancel,
            self.generation,
            self.capability.set_remote_description(&remote_answer),
        )
        .await;
        self.settle(outcome).await?;
        self.session.remote = Some(remote_answer);

        self.flush_pending().await;
        self.transition(NegotiationState::Connecting);
        Ok(())
    }

    /// Локальный кандидат уходит привязанному peer; без peer он теряется
    pub async fn note_local_candidate(&mut self, candidate: IceCandidate) -> NegotiatorResult<()> {
        let state = self.session.state;
        if state.is_terminal() {
            debug!(%state, "session finished, ignoring local candidate");
            return Ok(());
        }
        let Some(peer) = self.session.peer.clone() else {
            debug!(candidate = %candidate.candidate, "no peer bound yet, dropping local candidate");
            return Ok(());
        };

        if let Err(err) = self.bridge.send_candidate(&peer, &candidate) {
            if state == NegotiationState::Connected {
                warn!(error = %err, "late local candidate not delivered");
                return Ok(());
            }
            return Err(self.fail(err.into()).await);
        }
        Ok(())
    }

    /// Если remote description уже установлен, применяем кандидат сразу, иначе в очередь
    pub async fn note_remote_candidate(&mut self, candidate: IceCandidate) -> NegotiatorResult<()> {
        let state = self.session.state;
        if state.is_terminal() {
            debug!(%state, "session finished, ignoring remote candidate");
            return Ok(());
        }

        if self.session.remote.is_some() {
            self.apply_candidate(&candidate).await;
            return Ok(());
        }

        if let Err(err) = self.session.pending.enqueue(candidate) {
            return Err(self.fail(err).await);
        }
        debug!(
            queued = self.session.pending.len(),
            "remote description not set yet, queuing candidate"
        );
        Ok(())
    }

    /// Реакция на состояние транспорта; Disconnected обрабатывает координатор
    pub async fn on_transport_state(&mut self, st: ConnectionState) -> NegotiatorResult<()> {
        let state = self.session.state;
        match (state, st) {
            (NegotiationState::Connecting, ConnectionState::Connected) => {
                info!(peer = ?self.session.peer, "you are connected");
                self.transition(NegotiationState::Connected);
                Ok(())
            }
            (NegotiationState::Connected, ConnectionState::Failed | ConnectionState::Closed) => {
                info!(transport = ?st, "transport ended, closing session");
                self.close().await
            }
            (s, ConnectionState::Failed | ConnectionState::Closed) if !s.is_terminal() => {
                Err(self.fail(NegotiatorError::TransportFailed).await)
            }
            _ => {
                debug!(%state, transport = ?st, "transport state ignored");
                Ok(())
            }
        }
    }

    /// Идемпотентно: повторный вызов и вызов после Failed ничего не делают
    pub async fn close(&mut self) -> NegotiatorResult<()> {
        if self.session.state.is_terminal() {
            return Ok(());
        }
        self.transition(NegotiationState::Closed);
        self.release().await;
        Ok(())
    }

    /// Завершает сессию ошибкой, обнаруженной снаружи (например, в очереди координатора)
    pub async fn fail_with(&mut self, err: NegotiatorError) -> NegotiatorError {
        self.fail(err).await
    }

    async fn settle<T>(&mut self, outcome: Result<T, Interrupted>) -> NegotiatorResult<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(Interrupted::Cancelled) => {
                info!("operation interrupted by close, discarding result");
                self.close().await?;
                Err(NegotiatorError::SessionClosed)
            }
            Err(Interrupted::Failed(err)) => Err(self
                .fail(NegotiatorError::ApplyDescriptionFailed(err.to_string()))
                .await),
        }
    }

    async fn fail(&mut self, err: NegotiatorError) -> NegotiatorError {
        let state = self.session.state;
        if !state.can_transition_to(NegotiationState::Failed) {
            warn!(%state, error = %err, "error after session settled");
            return err;
        }
        warn!(%state, error = %err, "session failed");
        self.transition(NegotiationState::Failed);
        self.session.failure = Some(err.clone());
        self.release().await;
        err
    }

    async fn release(&mut self) {
        self.session.local = None;
        self.session.remote = None;
        self.session.pending.clear();
        self.capability.close().await;
    }

    async fn flush_pending(&mut self) {
        let pending = self.session.pending.flush();
        if pending.is_empty() {
            return;
        }
        analyze_candidates(&pending);
        debug!(count = pending.len(), "applying queued candidates");
        for candidate in &pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        if let Err(err) = self.capability.add_ice_candidate(candidate).await {
            let err = NegotiatorError::ApplyCandidateFailed(err.to_string());
            warn!(error = %err, candidate = %candidate.candidate, "skipping candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::fake::FakeCapability;
    use crate::signaling::{BridgeEvent, LocalSignalingHub, SignalingBridge};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct Endpoint {
        bridge: Arc<SignalingBridge>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Endpoint {
        fn connect(hub: &LocalSignalingHub) -> Self {
            let (transport, mut rx) = hub.connect().expect("connect");
            let bridge = Arc::new(SignalingBridge::new(transport));
            let hello = rx.try_recv().expect("endpoint assigned");
            bridge.handle_inbound(&hello);
            Self { bridge, rx }
        }

        fn id(&self) -> SessionId {
            self.bridge.endpoint().expect("assigned")
        }

        fn peer_id(&self) -> PeerId {
            PeerId::from(self.id())
        }

        fn next_event(&mut self) -> Option<BridgeEvent> {
            let raw = self.rx.try_recv().ok()?;
            self.bridge.handle_inbound(&raw)
        }
    }

    fn negotiator(
        endpoint: &Endpoint,
        capability: Arc<FakeCapability>,
        config: &NegotiationConfig,
    ) -> SessionNegotiator {
        SessionNegotiator::new(endpoint.id(), capability, endpoint.bridge.clone(), config)
    }

    fn cand(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn caller_happy_path_reaches_connected() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let mut bob = Endpoint::connect(&hub);
        let config = NegotiationConfig::default();
        let capability = FakeCapability::with_tracks();
        let mut caller = negotiator(&alice, capability.clone(), &config);

        caller
            .start_as_caller(Some(bob.peer_id()))
            .await
            .expect("offer sent");
        assert_eq!(caller.state(), NegotiationState::AwaitingAnswer);
        assert_eq!(caller.session().role, Role::Caller);

        let Some(BridgeEvent::Offer { from, description }) = bob.next_event() else {
            panic!("bob should receive the offer");
        };
        assert_eq!(from, alice.peer_id());
        assert_eq!(Some(description), capability.local());

        caller
            .apply_answer(bob.peer_id(), SessionDescription::answer("v=0 b"))
            .await
            .expect("answer applied");
        assert_eq!(caller.state(), NegotiationState::Connecting);
        assert_eq!(capability.remote(), Some(SessionDescription::answer("v=0 b")));
        assert!(caller.fingerprint().is_some());

        caller
            .on_transport_state(ConnectionState::Connected)
            .await
            .expect("connected");
        assert_eq!(caller.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn start_without_tracks_is_rejected_without_mutation() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let mut caller = negotiator(
            &alice,
            FakeCapability::without_tracks(),
            &NegotiationConfig::default(),
        );
        let err = caller.start_as_caller(None).await.unwrap_err();
        assert_eq!(err, NegotiatorError::NoMediaCapability);
        assert_eq!(caller.state(), NegotiationState::Idle);
        assert_eq!(caller.session().role, Role::Undetermined);
    }

    #[tokio::test]
    async fn queued_candidates_apply_in_order_when_offer_accepted() {
        let hub = LocalSignalingHub::new();
        let mut alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let mut callee = negotiator(&bob, capability.clone(), &NegotiationConfig::default());

        for n in 1..=3 {
            callee.note_remote_candidate(cand(n)).await.expect("queued");
        }
        assert!(capability.applied().is_empty());
        assert_eq!(callee.pending_candidates(), 3);

        callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0 a"))
            .await
            .expect("answered");

        assert_eq!(capability.applied(), vec![cand(1), cand(2), cand(3)]);
        assert_eq!(callee.pending_candidates(), 0);
        assert_eq!(callee.state(), NegotiationState::Connecting);
        assert!(matches!(
            alice.next_event(),
            Some(BridgeEvent::Answer { from, .. }) if from == bob.peer_id()
        ));

        // после remote description кандидаты применяются сразу
        callee.note_remote_candidate(cand(4)).await.unwrap();
        assert_eq!(capability.applied().len(), 4);
    }

    #[tokio::test]
    async fn bad_candidate_is_skipped() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let mut callee = negotiator(&bob, capability.clone(), &NegotiationConfig::default());

        callee.note_remote_candidate(cand(1)).await.unwrap();
        callee
            .note_remote_candidate(IceCandidate::new("bad candidate"))
            .await
            .unwrap();
        callee.note_remote_candidate(cand(2)).await.unwrap();
        callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .expect("bad candidate does not fail the session");
        assert_eq!(capability.applied(), vec![cand(1), cand(2)]);
        assert_eq!(callee.state(), NegotiationState::Connecting);
    }

    #[tokio::test]
    async fn overflow_fails_session() {
        let hub = LocalSignalingHub::new();
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let config = NegotiationConfig {
            candidate_queue_limit: Some(2),
            ..Default::default()
        };
        let mut callee = negotiator(&bob, capability.clone(), &config);

        callee.note_remote_candidate(cand(1)).await.unwrap();
        callee.note_remote_candidate(cand(2)).await.unwrap();
        let err = callee.note_remote_candidate(cand(3)).await.unwrap_err();

        assert_eq!(err, NegotiatorError::CandidateOverflow { limit: 2 });
        assert_eq!(callee.state(), NegotiationState::Failed);
        assert_eq!(callee.failure(), Some(&err));
        assert!(capability.is_closed());
    }

    #[tokio::test]
    async fn apply_answer_rejected_outside_awaiting_answer() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let config = NegotiationConfig::default();
        let answer = SessionDescription::answer("v=0");

        // Idle
        let mut idle = negotiator(&alice, FakeCapability::with_tracks(), &config);
        assert!(matches!(
            idle.apply_answer(bob.peer_id(), answer.clone()).await,
            Err(NegotiatorError::UnexpectedAnswer(_))
        ));
        assert_eq!(idle.state(), NegotiationState::Idle);

        // Connecting: повторный answer
        let mut caller = negotiator(&alice, FakeCapability::with_tracks(), &config);
        caller.start_as_caller(Some(bob.peer_id())).await.unwrap();
        caller
            .apply_answer(bob.peer_id(), answer.clone())
            .await
            .unwrap();
        assert!(matches!(
            caller.apply_answer(bob.peer_id(), answer.clone()).await,
            Err(NegotiatorError::UnexpectedAnswer(_))
        ));
        assert_eq!(caller.state(), NegotiationState::Connecting);

        // Connected
        caller
            .on_transport_state(ConnectionState::Connected)
            .await
            .unwrap();
        assert!(caller.apply_answer(bob.peer_id(), answer.clone()).await.is_err());

        // Callee side (Connecting after answering)
        let mut callee = negotiator(&bob, FakeCapability::with_tracks(), &config);
        callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(matches!(
            callee.apply_answer(alice.peer_id(), answer.clone()).await,
            Err(NegotiatorError::UnexpectedAnswer(_))
        ));

        // Closed и Failed
        let mut closed = negotiator(&alice, FakeCapability::with_tracks(), &config);
        closed.close().await.unwrap();
        assert!(closed.apply_answer(bob.peer_id(), answer.clone()).await.is_err());

        let failing = FakeCapability::with_tracks();
        failing.fail_remote_descriptions();
        let mut failed = negotiator(&bob, failing, &config);
        assert!(failed
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert_eq!(failed.state(), NegotiationState::Failed);
        assert!(matches!(
            failed.apply_answer(alice.peer_id(), answer).await,
            Err(NegotiatorError::UnexpectedAnswer(_))
        ));
    }

    #[tokio::test]
    async fn answer_from_wrong_peer_is_rejected() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let mut caller = negotiator(
            &alice,
            FakeCapability::with_tracks(),
            &NegotiationConfig::default(),
        );
        caller.start_as_caller(Some(bob.peer_id())).await.unwrap();

        let err = caller
            .apply_answer(PeerId::new("mallory"), SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiatorError::UnexpectedAnswer(_)));
        assert_eq!(caller.state(), NegotiationState::AwaitingAnswer);
        assert_eq!(caller.peer(), Some(&bob.peer_id()));
    }

    #[tokio::test]
    async fn broadcast_offer_binds_first_answering_peer() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let mut bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let mut caller = negotiator(&alice, capability, &NegotiationConfig::default());

        caller.start_as_caller(None).await.unwrap();
        assert!(matches!(bob.next_event(), Some(BridgeEvent::Offer { .. })));

        // до ответа локальные кандидаты некому адресовать
        caller.note_local_candidate(cand(1)).await.unwrap();
        assert!(bob.next_event().is_none());

        caller
            .apply_answer(bob.peer_id(), SessionDescription::answer("v=0 b"))
            .await
            .unwrap();
        assert_eq!(caller.peer(), Some(&bob.peer_id()));

        caller.note_local_candidate(cand(2)).await.unwrap();
        assert_eq!(
            bob.next_event(),
            Some(BridgeEvent::Candidate {
                from: alice.peer_id(),
                candidate: cand(2)
            })
        );
    }

    #[tokio::test]
    async fn second_offer_from_other_peer_keeps_binding() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let mut callee = negotiator(
            &bob,
            FakeCapability::with_tracks(),
            &NegotiationConfig::default(),
        );
        callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let err = callee
            .accept_offer(PeerId::new("carol"), SessionDescription::offer("v=0 c"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NegotiatorError::PeerAlreadyBound {
                bound: alice.peer_id(),
                offered: PeerId::new("carol"),
            }
        );
        assert_eq!(callee.peer(), Some(&alice.peer_id()));
        assert_eq!(callee.state(), NegotiationState::Connecting);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let mut caller = negotiator(&alice, capability.clone(), &NegotiationConfig::default());
        caller.start_as_caller(None).await.unwrap();
        caller.note_remote_candidate(cand(1)).await.unwrap();

        for _ in 0..3 {
            caller.close().await.expect("close never fails");
            assert_eq!(caller.state(), NegotiationState::Closed);
        }
        assert!(capability.is_closed());
        assert_eq!(caller.pending_candidates(), 0);
        assert!(caller.session().local.is_none());
        assert_eq!(caller.failure(), None);
    }

    #[tokio::test]
    async fn rejected_remote_offer_fails_session() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        capability.fail_remote_descriptions();
        let mut callee = negotiator(&bob, capability.clone(), &NegotiationConfig::default());

        let err = callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiatorError::ApplyDescriptionFailed(_)));
        assert_eq!(callee.state(), NegotiationState::Failed);
        assert!(capability.is_closed());
    }

    #[tokio::test]
    async fn undeliverable_offer_fails_session() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let mut caller = negotiator(
            &alice,
            FakeCapability::with_tracks(),
            &NegotiationConfig::default(),
        );
        let err = caller
            .start_as_caller(Some(PeerId::new("gone")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiatorError::BridgeDeliveryFailed(_)));
        assert_eq!(caller.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn cancellation_discards_stalled_offer() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let mut bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        capability.stall_offers();
        let (cancel_tx, cancel_rx) = watch::channel(0u64);
        let mut caller = negotiator(&alice, capability.clone(), &NegotiationConfig::default())
            .with_cancellation(cancel_rx);

        let task = tokio::spawn(async move {
            let result = caller.start_as_caller(None).await;
            (result, caller)
        });
        capability.offer_requested().await;
        cancel_tx.send_modify(|generation| *generation += 1);

        let (result, caller) = task.await.expect("task");
        assert_eq!(result, Err(NegotiatorError::SessionClosed));
        assert_eq!(caller.state(), NegotiationState::Closed);
        assert!(capability.local().is_none());
        assert!(bob.next_event().is_none());
    }

    #[tokio::test]
    async fn cancellation_discards_stalled_answer() {
        let hub = LocalSignalingHub::new();
        let mut alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        capability.stall_answers();
        let (cancel_tx, cancel_rx) = watch::channel(0u64);
        let mut callee = negotiator(&bob, capability.clone(), &NegotiationConfig::default())
            .with_cancellation(cancel_rx);
        callee.note_remote_candidate(cand(1)).await.unwrap();

        let from = alice.peer_id();
        let task = tokio::spawn(async move {
            let result = callee
                .accept_offer(from, SessionDescription::offer("v=0 a"))
                .await;
            (result, callee)
        });
        capability.answer_requested().await;
        cancel_tx.send_modify(|generation| *generation += 1);

        let (result, callee) = task.await.expect("task");
        assert_eq!(result, Err(NegotiatorError::SessionClosed));
        assert_eq!(callee.state(), NegotiationState::Closed);
        assert_eq!(capability.applied(), vec![cand(1)]);
        assert!(capability.is_closed());
        assert!(callee.session().local.is_none());
        // answer так и не ушёл
        assert!(alice.next_event().is_none());
    }

    #[tokio::test]
    async fn offer_of_wrong_kind_fails_session() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let capability = FakeCapability::with_tracks();
        let mut callee = negotiator(&bob, capability.clone(), &NegotiationConfig::default());

        let err = callee
            .accept_offer(alice.peer_id(), SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiatorError::ApplyDescriptionFailed(_)));
        assert_eq!(callee.state(), NegotiationState::Failed);
        assert_eq!(callee.failure(), Some(&err));
        assert!(capability.remote().is_none());
        assert!(capability.is_closed());
    }

    #[test]
    fn data_channel_label_comes_from_config() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let config = NegotiationConfig {
            data_channel_label: "notes".into(),
            ..Default::default()
        };
        let caller = negotiator(&alice, FakeCapability::with_tracks(), &config);
        assert_eq!(caller.data_channel_label(), "notes");
    }

    #[tokio::test]
    async fn transport_failure_while_connecting_fails_session() {
        let hub = LocalSignalingHub::new();
        let alice = Endpoint::connect(&hub);
        let bob = Endpoint::connect(&hub);
        let mut callee = negotiator(
            &bob,
            FakeCapability::with_tracks(),
            &NegotiationConfig::default(),
        );
        callee
            .accept_offer(alice.peer_id(), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let err = callee
            .on_transport_state(ConnectionState::Failed)
            .await
            .unwrap_err();
        assert_eq!(err, NegotiatorError::TransportFailed);
        assert_eq!(callee.state(), NegotiationState::Failed);
    }
}
