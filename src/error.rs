use crate::peer::state::NegotiationState;
use crate::peer::types::PeerId;
use thiserror::Error;

/// Ошибки автомата переговоров
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiatorError {
    #[error("no local media tracks attached")]
    NoMediaCapability,
    #[error("session already bound to peer {bound}, rejecting offer from {offered}")]
    PeerAlreadyBound { bound: PeerId, offered: PeerId },
    #[error("unexpected answer: {0}")]
    UnexpectedAnswer(String),
    #[error("pending candidate queue exceeded limit of {limit}")]
    CandidateOverflow { limit: usize },
    #[error("another call is already in progress")]
    SessionBusy,
    #[error("signaling delivery failed: {0}")]
    BridgeDeliveryFailed(String),
    #[error("failed to apply session description: {0}")]
    ApplyDescriptionFailed(String),
    #[error("failed to apply ice candidate: {0}")]
    ApplyCandidateFailed(String),
    #[error("{operation} is not valid in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("session is closed")]
    SessionClosed,
    #[error("transport failed before the session connected")]
    TransportFailed,
    #[error("media capability unavailable: {0}")]
    CapabilityUnavailable(String),
}

/// Ошибки канала данных
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("no active call")]
    NoActiveCall,
    #[error("data channel send failed: {0}")]
    SendFailed(String),
}

/// Ошибки сигнального моста
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("signaling endpoint not assigned yet")]
    Unassigned,
    #[error("unknown signaling endpoint {0}")]
    UnknownEndpoint(String),
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Codec(err.to_string())
    }
}

impl From<BridgeError> for NegotiatorError {
    fn from(err: BridgeError) -> Self {
        NegotiatorError::BridgeDeliveryFailed(err.to_string())
    }
}

/// Ошибки внешнего медиа-транспорта
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CapabilityError(pub String);

impl From<webrtc::Error> for CapabilityError {
    fn from(err: webrtc::Error) -> Self {
        CapabilityError(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server URL cannot be empty")]
    EmptyServerUrl,
    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

pub type NegotiatorResult<T> = Result<T, NegotiatorError>;
