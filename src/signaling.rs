use crate::error::BridgeError;
use crate::peer::types::{IceCandidate, PeerId, SessionDescription, SessionId};
use crate::utils::random_id;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ограничение распаковки для защиты от zip-bomb
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// Сообщения сигнального канала; session_id всегда отправитель
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    EndpointAssigned {
        session_id: SessionId,
    },
    Offer {
        description: SessionDescription,
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_session_id: Option<SessionId>,
    },
    Answer {
        description: SessionDescription,
        session_id: SessionId,
        target_session_id: SessionId,
    },
    Candidate {
        candidate: IceCandidate,
        session_id: SessionId,
        target_session_id: SessionId,
    },
}

impl SignalMessage {
    pub fn encode(&self) -> Result<Bytes, BridgeError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BridgeError> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn target(&self) -> Option<&SessionId> {
        match self {
            SignalMessage::EndpointAssigned { .. } => None,
            SignalMessage::Offer {
                target_session_id, ..
            } => target_session_id.as_ref(),
            SignalMessage::Answer {
                target_session_id, ..
            }
            | SignalMessage::Candidate {
                target_session_id, ..
            } => Some(target_session_id),
        }
    }
}

/// Компактная строка (JSON → gzip → base64) для ручной передачи через буфер обмена или QR
pub fn encode_compact(msg: &SignalMessage) -> Result<String, BridgeError> {
    let json = serde_json::to_vec(msg)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| BridgeError::Codec(e.to_string()))?;
    let compressed = gz.finish().map_err(|e| BridgeError::Codec(e.to_string()))?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_compact(s: &str) -> Result<SignalMessage, BridgeError> {
    let compressed = general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| BridgeError::Codec(e.to_string()))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut json)
        .map_err(|e| BridgeError::Codec(e.to_string()))?;

    SignalMessage::decode(&json)
}

/// Внешняя шина сигналинга. target = None означает рассылку всем
pub trait SignalingTransport: Send + Sync {
    fn publish(&self, target: Option<&SessionId>, payload: Bytes) -> Result<(), BridgeError>;
}

/// Входящие события для координатора
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    EndpointAssigned(SessionId),
    Offer {
        from: PeerId,
        description: SessionDescription,
    },
    Answer {
        from: PeerId,
        description: SessionDescription,
    },
    Candidate {
        from: PeerId,
        candidate: IceCandidate,
    },
}

/// Переводит намерения автомата в сообщения канала и обратно; состояние сессии не трогает
pub struct SignalingBridge {
    transport: Arc<dyn SignalingTransport>,
    endpoint: RwLock<Option<SessionId>>,
}

impl SignalingBridge {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            endpoint: RwLock::new(None),
        }
    }

    pub fn endpoint(&self) -> Option<SessionId> {
        self.endpoint.read().clone()
    }

    fn require_endpoint(&self) -> Result<SessionId, BridgeError> {
        self.endpoint().ok_or(BridgeError::Unassigned)
    }

    pub fn send_offer(
        &self,
        peer_hint: Option<&PeerId>,
        description: &SessionDescription,
    ) -> Result<(), BridgeError> {
        let target = peer_hint.cloned().map(SessionId::from);
        let msg = SignalMessage::Offer {
            description: description.clone(),
            session_id: self.require_endpoint()?,
            target_session_id: target.clone(),
        };
        debug!(peer = ?peer_hint, "sending offer");
        self.transport.publish(target.as_ref(), msg.encode()?)
    }

    pub fn send_answer(
        &self,
        peer: &PeerId,
        description: &SessionDescription,
    ) -> Result<(), BridgeError> {
        let target = SessionId::from(peer.clone());
        let msg = SignalMessage::Answer {
            description: description.clone(),
            session_id: self.require_endpoint()?,
            target_session_id: target.clone(),
        };
        debug!(%peer, "sending answer");
        self.transport.publish(Some(&target), msg.encode()?)
    }

    pub fn send_candidate(&self, peer: &PeerId, candidate: &IceCandidate) -> Result<(), BridgeError> {
        let target = SessionId::from(peer.clone());
        let msg = SignalMessage::Candidate {
            candidate: candidate.clone(),
            session_id: self.require_endpoint()?,
            target_session_id: target.clone(),
        };
        self.transport.publish(Some(&target), msg.encode()?)
    }

    /// Разбирает входящий пакет; чужие, собственные и битые сообщения отбрасываются
    pub fn handle_inbound(&self, raw: &[u8]) -> Option<BridgeEvent> {
        let msg = match SignalMessage::decode(raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, len = raw.len(), "dropping malformed signaling message");
                return None;
            }
        };

        let own = self.endpoint();
        if let (Some(own), Some(target)) = (own.as_ref(), msg.target()) {
            if own != target {
                debug!(to = %target, "ignoring message addressed to another endpoint");
                return None;
            }
        }

        match msg {
            SignalMessage::EndpointAssigned { session_id } => {
                info!(%session_id, "signaling endpoint assigned");
                *self.endpoint.write() = Some(session_id.clone());
                Some(BridgeEvent::EndpointAssigned(session_id))
            }
            SignalMessage::Offer {
                description,
                session_id,
                ..
            } => Self::from_peer(own.as_ref(), session_id).map(|from| BridgeEvent::Offer {
                from,
                description,
            }),
            SignalMessage::Answer {
                description,
                session_id,
                ..
            } => Self::from_peer(own.as_ref(), session_id).map(|from| BridgeEvent::Answer {
                from,
                description,
            }),
            SignalMessage::Candidate {
                candidate,
                session_id,
                ..
            } => Self::from_peer(own.as_ref(), session_id)
                .map(|from| BridgeEvent::Candidate { from, candidate }),
        }
    }

    fn from_peer(own: Option<&SessionId>, sender: SessionId) -> Option<PeerId> {
        if own == Some(&sender) {
            debug!("ignoring echo of our own message");
            return None;
        }
        Some(PeerId::from(sender))
    }

    /// Перекачивает сырые входящие пакеты в очередь событий координатора
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                if let Some(event) = bridge.handle_inbound(&raw) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("signaling pump stopped");
        })
    }
}

type EndpointMap = Arc<RwLock<HashMap<SessionId, mpsc::UnboundedSender<Bytes>>>>;

/// Простой сигнальный сервер в памяти процесса
#[derive(Debug, Default, Clone)]
pub struct LocalSignalingHub {
    endpoints: EndpointMap,
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Регистрирует новую точку; первым сообщением придёт endpointAssigned
    pub fn connect(&self) -> Result<(Arc<LocalEndpoint>, mpsc::UnboundedReceiver<Bytes>), BridgeError> {
        let id = SessionId::new(random_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let hello = SignalMessage::EndpointAssigned {
            session_id: id.clone(),
        }
        .encode()?;
        tx.send(hello).map_err(|_| BridgeError::Closed)?;
        self.endpoints.write().insert(id.clone(), tx);
        debug!(%id, "endpoint connected to local hub");
        Ok((
            Arc::new(LocalEndpoint {
                id,
                endpoints: Arc::clone(&self.endpoints),
            }),
            rx,
        ))
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

pub struct LocalEndpoint {
    id: SessionId,
    endpoints: EndpointMap,
}

impl LocalEndpoint {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl SignalingTransport for LocalEndpoint {
    fn publish(&self, target: Option<&SessionId>, payload: Bytes) -> Result<(), BridgeError> {
        let endpoints = self.endpoints.read();
        match target {
            Some(target) => endpoints
                .get(target)
                .ok_or_else(|| BridgeError::UnknownEndpoint(target.to_string()))?
                .send(payload)
                .map_err(|_| BridgeError::Closed),
            None => {
                for (id, tx) in endpoints.iter() {
                    if id != &self.id {
                        let _ = tx.send(payload.clone());
                    }
                }
                Ok(())
            }
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.endpoints.write().remove(&self.id);
    }
}
