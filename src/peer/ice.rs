use crate::error::NegotiatorError;
use crate::peer::types::{IceCandidate, PeerId};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    limit: Option<usize>,
}

impl IceCandidateQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            pending: VecDeque::new(),
            limit,
        }
    }

    /// Добавляет кандидат в конец; при переполнении кандидат не сохраняется
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Result<(), NegotiatorError> {
        if let Some(limit) = self.limit {
            if self.pending.len() >= limit {
                return Err(NegotiatorError::CandidateOverflow { limit });
            }
        }
        self.pending.push_back(candidate);
        Ok(())
    }

    /// Забирает все отложенные кандидаты в порядке поступления
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Кандидаты одного peer, накопленные до появления сессии с ним
#[derive(Debug, Default, PartialEq)]
pub struct EarlyBatch {
    pub candidates: Vec<IceCandidate>,
    /// Очередь переполнилась: сессия с этим peer должна завершиться ошибкой
    pub overflow: Option<NegotiatorError>,
}

#[derive(Debug)]
struct EarlyQueue {
    queue: IceCandidateQueue,
    overflow: Option<NegotiatorError>,
}

/// Очереди кандидатов по peer'ам, для которых сессии ещё нет.
/// Число peer'ов ограничено: самый старый вытесняется.
#[derive(Debug)]
pub struct EarlyCandidates {
    limit: Option<usize>,
    max_peers: usize,
    peers: HashMap<PeerId, EarlyQueue>,
    order: VecDeque<PeerId>,
}

impl EarlyCandidates {
    pub fn new(limit: Option<usize>, max_peers: usize) -> Self {
        Self {
            limit,
            max_peers: max_peers.max(1),
            peers: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// После переполнения очередь peer очищается и помечается
    pub fn push(&mut self, from: &PeerId, candidate: IceCandidate) -> Result<(), NegotiatorError> {
        if !self.peers.contains_key(from) {
            while self.peers.len() >= self.max_peers {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if let Some(evicted) = self.peers.remove(&oldest) {
                    warn!(
                        peer = %oldest,
                        dropped = evicted.queue.len(),
                        "too many peers with early candidates, evicting oldest"
                    );
                }
            }
            self.order.push_back(from.clone());
        }

        let limit = self.limit;
        let entry = self.peers.entry(from.clone()).or_insert_with(|| EarlyQueue {
            queue: IceCandidateQueue::new(limit),
            overflow: None,
        });
        if let Some(err) = &entry.overflow {
            return Err(err.clone());
        }
        if let Err(err) = entry.queue.enqueue(candidate) {
            entry.queue.clear();
            entry.overflow = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Забирает всё накопленное для peer
    pub fn take(&mut self, peer: &PeerId) -> EarlyBatch {
        self.order.retain(|p| p != peer);
        match self.peers.remove(peer) {
            Some(mut entry) => EarlyBatch {
                candidates: entry.queue.flush(),
                overflow: entry.overflow,
            },
            None => EarlyBatch::default(),
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.order.clear();
    }

    /// Число peer'ов с отложенными кандидатами
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
