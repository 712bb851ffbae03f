//! Where encoded frames go once a pipeline has produced them.

use facewatch_video::EncodedFrame;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame consumer disconnected")]
pub struct ConsumerGone;

/// Receiver of a pipeline's output, one self-contained frame at a time.
pub trait FrameConsumer {
    /// Checked before every frame; `false` closes the pipeline.
    fn is_connected(&self) -> bool;

    fn emit(&mut self, frame: EncodedFrame) -> Result<(), ConsumerGone>;
}

/// Hands frames to an async task over a bounded channel. Blocks the pipeline
/// thread when the reader falls behind; dropping the receiver disconnects.
pub struct ChannelConsumer {
    tx: mpsc::Sender<EncodedFrame>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<EncodedFrame>) -> Self {
        Self { tx }
    }
}

impl FrameConsumer for ChannelConsumer {
    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn emit(&mut self, frame: EncodedFrame) -> Result<(), ConsumerGone> {
        self.tx.blocking_send(frame).map_err(|_| ConsumerGone)
    }
}
