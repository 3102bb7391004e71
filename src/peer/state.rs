use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// ========== STATE MACHINE ==========

/// Состояние переговоров одной сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AnsweringOffer,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Failed и Closed конечны; Connected конечен только как успех, из него ещё можно закрыться
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Проверка перехода по таблице автомата
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Idle, Offering) | (Idle, AnsweringOffer) => true,
            (Offering, AwaitingAnswer) => true,
            (AwaitingAnswer, Connecting) => true,
            (AnsweringOffer, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Closed) => true,
            (Connected, Failed) => false,
            (from, Failed) | (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Роль в звонке
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Undetermined,
    Caller,
    Callee,
}

/// Состояние нижележащего транспорта (упрощённый RTCPeerConnectionState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Failed,
    Closed,
    Other,
}

/// ========== CONSTANTS ==========

/// Метка канала для текстовых сообщений
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Период ожидания перед принудительным отключением
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сколько peer'ов без сессии могут копить кандидаты одновременно
pub const MAX_EARLY_PEERS: usize = 16;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
