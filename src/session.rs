use crate::error::NegotiatorError;
use crate::peer::ice::IceCandidateQueue;
use crate::peer::state::{NegotiationState, Role};
use crate::peer::types::{PeerId, SessionDescription, SessionId};
use sha2::{Digest, Sha256};

/// Одна сессия звонка; создаётся на каждый звонок и не переиспользуется
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub peer: Option<PeerId>,
    pub role: Role,
    pub state: NegotiationState,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub pending: IceCandidateQueue,
    pub data_channel: Option<String>,
    pub failure: Option<NegotiatorError>,
}

impl Session {
    pub fn new(id: SessionId, candidate_queue_limit: Option<usize>) -> Self {
        Self {
            id,
            peer: None,
            role: Role::Undetermined,
            state: NegotiationState::Idle,
            local: None,
            remote: None,
            pending: IceCandidateQueue::new(candidate_queue_limit),
            data_channel: None,
            failure: None,
        }
    }

    /// Короткий код для сверки голосом: одинаков у обеих сторон
    pub fn fingerprint(&self) -> Option<String> {
        let (local, remote) = (self.local.as_ref()?, self.remote.as_ref()?);
        let (first, second) = if local.sdp <= remote.sdp {
            (&local.sdp, &remote.sdp)
        } else {
            (&remote.sdp, &local.sdp)
        };

        let mut hasher = Sha256::new();
        hasher.update(first.as_bytes());
        hasher.update([0u8]);
        hasher.update(second.as_bytes());
        let digest = hasher.finalize();

        let code = hex::encode_upper(&digest[..6]);
        Some(format!("{}-{}-{}", &code[..4], &code[4..8], &code[8..]))
    }
}
