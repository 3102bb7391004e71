use crate::error::ChannelError;
use crate::peer::connection::{MediaCapability, TransportEvent, TransportEventSink};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// Жизненный цикл текстового канала: Pending → Open → Closed
pub struct DataChannelManager {
    label: String,
    state: ChannelState,
    capability: Arc<dyn MediaCapability>,
}

impl DataChannelManager {
    pub fn new(label: impl Into<String>, capability: Arc<dyn MediaCapability>) -> Self {
        Self {
            label: label.into(),
            state: ChannelState::Pending,
            capability,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// true, если состояние изменилось
    pub fn on_open(&mut self) -> bool {
        if self.state != ChannelState::Pending {
            debug!(label = %self.label, state = ?self.state, "ignoring data channel open");
            return false;
        }
        info!(label = %self.label, "data channel opened");
        self.state = ChannelState::Open;
        true
    }

    pub fn on_close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        info!(label = %self.label, "data channel closed");
        self.state = ChannelState::Closed;
        true
    }

    pub async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.state != ChannelState::Open {
            return Err(ChannelError::ChannelNotOpen);
        }
        debug!(label = %self.label, len = data.len(), "sending over data channel");
        self.capability
            .send_data(data)
            .await
            .map_err(|err| ChannelError::SendFailed(err.to_string()))
    }
}

/// общий обработчик data-channel: события канала уходят в очередь сессии
pub(crate) fn attach_dc(
    dc: &Arc<RTCDataChannel>,
    slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    sink: &TransportEventSink,
) {
    debug!(label = dc.label(), "attaching data channel");
    *slot.lock() = Some(dc.clone());

    dc.on_open(Box::new({
        let sink = sink.clone();
        move || {
            sink.emit(TransportEvent::DataChannelOpened);
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let sink = sink.clone();
        move |msg: DataChannelMessage| {
            sink.emit(TransportEvent::DataChannelMessage(msg.data));
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let sink = sink.clone();
        move || {
            sink.emit(TransportEvent::DataChannelClosed);
            Box::pin(async {})
        }
    }));
}
