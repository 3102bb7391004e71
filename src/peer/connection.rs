use crate::config::NegotiationConfig;
use crate::error::CapabilityError;
use crate::logger::dump_candidate;
use crate::peer::data_channel::attach_dc;
use crate::peer::state::{ConnectionState, Role};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// События, которые поднимает медиа-транспорт
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    DataChannelOpened,
    DataChannelClosed,
    DataChannelMessage(Bytes),
    RemoteTrack(RemoteTrack),
}

/// Входящая медиа-дорожка собеседника
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: String,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    /// Описание дорожки без самого медиа-потока
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind: kind.into(),
            track: None,
        }
    }

    fn from_webrtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().to_string(),
            track: Some(track),
        }
    }

    /// RTP-поток для чтения; None только у описаний, созданных через new()
    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

/// Отправитель событий транспорта, помеченных эпохой сессии
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send((self.epoch, event)).is_err() {
            debug!(epoch = self.epoch, "transport event dropped, coordinator gone");
        }
    }
}

/// Внешний медиа-транспорт, которым управляет автомат переговоров
#[async_trait]
pub trait MediaCapability: Send + Sync {
    fn has_tracks(&self) -> bool;
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;
    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CapabilityError>;
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), CapabilityError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CapabilityError>;
    async fn send_data(&self, data: Bytes) -> Result<(), CapabilityError>;
    async fn close(&self);
}

/// Создаёт транспорт под одну сессию
#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    async fn build(
        &self,
        config: &NegotiationConfig,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaCapability>, CapabilityError>;
}

/// Транспорт на webrtc-rs
pub struct WebRtcCapability {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    track_count: usize,
}

/// Локальные дорожки захватываются снаружи и передаются готовыми
#[derive(Default, Clone)]
pub struct WebRtcCapabilityFactory {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl WebRtcCapabilityFactory {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }
}

#[async_trait]
impl CapabilityFactory for WebRtcCapabilityFactory {
    /// создаём Peer; если звоним мы, то сами делаем data-channel
    async fn build(
        &self,
        config: &NegotiationConfig,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaCapability>, CapabilityError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(config)).await?);

        for track in &self.tracks {
            pc.add_track(Arc::clone(track)).await?;
        }

        // Обработчик для локальных кандидатов
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!("ice candidate gathering completed");
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        dump_candidate("LOCAL", &candidate);
                        sink.emit(TransportEvent::LocalCandidate(candidate));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(state = ?st, "peer connection state changed");
            sink.emit(TransportEvent::ConnectionState(map_connection_state(st)));
            Box::pin(async {})
        }));

        // входящие дорожки собеседника
        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack::from_webrtc(track);
                info!(id = %remote.id, kind = %remote.kind, "remote track added");
                sink.emit(TransportEvent::RemoteTrack(remote));
                Box::pin(async {})
            },
        ));

        let data_channel = Arc::new(Mutex::new(None));
        if role == Role::Caller {
            let dc = pc
                .create_data_channel(
                    &config.data_channel_label,
                    Some(RTCDataChannelInit::default()),
                )
                .await?;
            attach_dc(&dc, &data_channel, &events);
        } else {
            let slot = Arc::clone(&data_channel);
            let sink = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                attach_dc(&dc, &slot, &sink);
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(WebRtcCapability {
            pc,
            data_channel,
            track_count: self.tracks.len(),
        }))
    }
}

#[async_trait]
impl MediaCapability for WebRtcCapability {
    fn has_tracks(&self) -> bool {
        self.track_count > 0
    }

    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CapabilityError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CapabilityError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<(), CapabilityError> {
        let dc = self.data_channel.lock().clone();
        match dc {
            Some(dc) => {
                dc.send(&data).await?;
                Ok(())
            }
            None => Err(CapabilityError("no data channel".into())),
        }
    }

    async fn close(&self) {
        let dc = self.data_channel.lock().take();
        if let Some(dc) = dc {
            if let Err(err) = dc.close().await {
                debug!(error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            warn!(error = %err, "peer connection close failed");
        }
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(config: &NegotiationConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.rtc_ice_servers(),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, CapabilityError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}

fn map_connection_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::Other,
    }
}
