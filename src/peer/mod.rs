pub mod connection;
pub mod data_channel;
#[cfg(test)]
pub(crate) mod fake;
pub mod ice;
pub mod negotiator;
pub mod state;
pub mod types;

pub use connection::{
    CapabilityFactory, MediaCapability, RemoteTrack, TransportEvent, TransportEventSink,
    WebRtcCapability, WebRtcCapabilityFactory,
};
pub use data_channel::{ChannelState, DataChannelManager};
pub use ice::{EarlyBatch, EarlyCandidates, IceCandidateQueue};
pub use negotiator::SessionNegotiator;
pub use state::{ConnectionState, NegotiationState, Role, DATA_CHANNEL_LABEL, GRACE_PERIOD};
pub use types::{
    IceCandidate, IncomingCallOffer, PeerId, SdpKind, ServerConfig, SessionDescription, SessionId,
};
