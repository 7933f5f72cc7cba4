use futures::future::BoxFuture;

use crate::{format::VideoFormat, frame::Frame, monitor::State};

/// Resolves to `true` to keep receiving frames, `false` to be removed.
pub type SendFuture = BoxFuture<'static, anyhow::Result<bool>>;

/// An output sink registered on a channel's [`Output`](crate::output::Output).
///
/// Implementations are shared between the caller and the output registry,
/// so every method takes `&self`.
pub trait FrameConsumer: Send + Sync {
    /// (Re)configures the consumer for `format`. Called once when the
    /// consumer is added and again on every format change.
    fn initialize(&self, format: &VideoFormat, channel_index: i32) -> anyhow::Result<()>;

    /// Starts delivering `frame`. An `Err` here means the frame could not
    /// even be submitted; the returned future reports the delivery outcome.
    fn send(&self, frame: Frame) -> anyhow::Result<SendFuture>;

    /// Whether this consumer paces output itself (e.g. a card with a genlocked clock).
    fn has_synchronization_clock(&self) -> bool {
        false
    }

    fn state(&self) -> State {
        State::new()
    }

    /// Preferred slot on the output.
    fn index(&self) -> i32;

    fn name(&self) -> String {
        format!("consumer[{}]", self.index())
    }
}
