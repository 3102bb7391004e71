// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::state::{DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVERS, GRACE_PERIOD};
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

const ENV_STUN_SERVERS: &str = "PEER_SESSION_STUN_SERVERS";
const ENV_QUEUE_LIMIT: &str = "PEER_SESSION_CANDIDATE_QUEUE_LIMIT";
const ENV_DISCONNECT_GRACE_MS: &str = "PEER_SESSION_DISCONNECT_GRACE_MS";

/// Настройки переговоров одной сессии
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiationConfig {
    /// Адреса STUN для обнаружения путей
    pub stun_servers: Vec<String>,
    /// Пользовательские STUN/TURN серверы
    pub ice_servers: Vec<ServerConfig>,
    /// None = без ограничения
    pub candidate_queue_limit: Option<usize>,
    pub data_channel_label: String,
    #[serde(with = "duration_ms")]
    pub disconnect_grace: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_servers: Vec::new(),
            candidate_queue_limit: None,
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            disconnect_grace: GRACE_PERIOD,
        }
    }
}

impl NegotiationConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: "config",
            value: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Значения по умолчанию, поверх которых накладываются переменные окружения
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_STUN_SERVERS).filter(|v| !v.trim().is_empty()) {
            config.stun_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(raw) = lookup(ENV_QUEUE_LIMIT) {
            let limit = raw.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                key: ENV_QUEUE_LIMIT,
                value: raw.clone(),
            })?;
            config.candidate_queue_limit = Some(limit);
        }

        if let Some(raw) = lookup(ENV_DISCONNECT_GRACE_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: ENV_DISCONNECT_GRACE_MS,
                value: raw.clone(),
            })?;
            config.disconnect_grace = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stun_servers.iter().any(|url| url.trim().is_empty()) {
            return Err(ConfigError::EmptyServerUrl);
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyServerUrl);
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }

    /// Список ICE серверов для RTCConfiguration
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::with_capacity(self.ice_servers.len() + 1);
        if !self.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        servers.extend(self.ice_servers.iter().map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        }));
        servers
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
