//! Поддельный медиа-транспорт для тестов

use crate::config::NegotiationConfig;
use crate::error::CapabilityError;
use crate::peer::connection::{CapabilityFactory, MediaCapability, TransportEventSink};
use crate::peer::state::Role;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    sent: Vec<Bytes>,
    closed: bool,
    fail_remote: bool,
    fail_sends: bool,
    stall_offers: bool,
    stall_answers: bool,
}

#[derive(Default)]
pub(crate) struct FakeCapability {
    tracks: bool,
    state: Mutex<FakeState>,
    offers: AtomicUsize,
    offer_requested: Notify,
    answer_requested: Notify,
    release: Notify,
}

impl FakeCapability {
    pub fn with_tracks() -> Arc<Self> {
        Arc::new(Self {
            tracks: true,
            ..Default::default()
        })
    }

    pub fn without_tracks() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_remote_descriptions(&self) {
        self.state.lock().fail_remote = true;
    }

    pub fn fail_sends(&self) {
        self.state.lock().fail_sends = true;
    }

    /// create_offer будет ждать release_stalled()
    pub fn stall_offers(&self) {
        self.state.lock().stall_offers = true;
    }

    pub fn stall_answers(&self) {
        self.state.lock().stall_answers = true;
    }

    pub fn release_stalled(&self) {
        self.release.notify_waiters();
    }

    pub async fn offer_requested(&self) {
        self.offer_requested.notified().await
    }

    pub async fn answer_requested(&self) {
        self.answer_requested.notified().await
    }

    pub fn applied(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl MediaCapability for FakeCapability {
    fn has_tracks(&self) -> bool {
        self.tracks
    }

    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        let stalled = self.state.lock().stall_offers;
        if stalled {
            let released = self.release.notified();
            self.offer_requested.notify_one();
            released.await;
        }
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        let stalled = self.state.lock().stall_answers;
        if stalled {
            let released = self.release.notified();
            self.answer_requested.notify_one();
            released.await;
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CapabilityError> {
        self.state.lock().local = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        if state.fail_remote {
            return Err(CapabilityError("remote description rejected".into()));
        }
        state.remote = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CapabilityError> {
        if candidate.candidate.contains("bad") {
            return Err(CapabilityError("malformed candidate".into()));
        }
        self.state.lock().applied.push(candidate.clone());
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(CapabilityError("send failed".into()));
        }
        state.sent.push(data);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Фабрика, запоминающая выданные транспорты и их sink'и
#[derive(Default)]
pub(crate) struct FakeFactory {
    built: Mutex<Vec<(Arc<FakeCapability>, TransportEventSink)>>,
    no_tracks: bool,
    stall_offers: bool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_tracks() -> Arc<Self> {
        Arc::new(Self {
            no_tracks: true,
            ..Default::default()
        })
    }

    pub fn stalling_offers() -> Arc<Self> {
        Arc::new(Self {
            stall_offers: true,
            ..Default::default()
        })
    }

    pub fn last(&self) -> Option<(Arc<FakeCapability>, TransportEventSink)> {
        self.built.lock().last().cloned()
    }

    pub fn built(&self) -> usize {
        self.built.lock().len()
    }
}

#[async_trait]
impl CapabilityFactory for FakeFactory {
    async fn build(
        &self,
        _config: &NegotiationConfig,
        _role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaCapability>, CapabilityError> {
        let capability = if self.no_tracks {
            FakeCapability::without_tracks()
        } else {
            FakeCapability::with_tracks()
        };
        if self.stall_offers {
            capability.stall_offers();
        }
        self.built.lock().push((capability.clone(), events));
        Ok(capability as Arc<dyn MediaCapability>)
    }
}
