//! Переговоры одного peer-to-peer звонка: offer/answer, trickle ICE и текстовый канал

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::NegotiationConfig;
pub use coordinator::{SessionCoordinator, SessionEvent};
pub use error::{BridgeError, ChannelError, ConfigError, NegotiatorError, NegotiatorResult};
pub use peer::{
    IceCandidate, IncomingCallOffer, NegotiationState, PeerId, RemoteTrack, SessionDescription,
    SessionId, SessionNegotiator,
};
pub use session::Session;
pub use signaling::{LocalSignalingHub, SignalMessage, SignalingBridge, SignalingTransport};
