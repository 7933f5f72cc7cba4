use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use playout_core::{
    consumer::{FrameConsumer, SendFuture},
    format::VideoFormat,
    frame::Frame,
    monitor::State,
};

/// Counts delivered frames and reports the measured rate. Has no clock of
/// its own, so the output paces the channel while it is the only consumer.
pub struct StatsConsumer {
    index: i32,
    frames: AtomicU64,
    last_ticket: AtomicU64,
    format: Mutex<Option<(VideoFormat, Instant)>>,
}

impl StatsConsumer {
    pub fn new(index: i32) -> Self {
        Self {
            index,
            frames: AtomicU64::new(0),
            last_ticket: AtomicU64::new(0),
            format: Mutex::new(None),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl FrameConsumer for StatsConsumer {
    fn initialize(&self, format: &VideoFormat, channel_index: i32) -> anyhow::Result<()> {
        log::info!("{} initialized on {} for {}", self.name(), channel_index, format);
        let mut current = self
            .format
            .lock()
            .map_err(|_| anyhow::anyhow!("{} state poisoned", self.name()))?;
        *current = Some((format.clone(), Instant::now()));
        self.frames.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn send(&self, frame: Frame) -> anyhow::Result<SendFuture> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Some(ticket) = frame.ticket().id() {
            self.last_ticket.store(ticket, Ordering::Relaxed);
        }
        Ok(futures::future::ready(Ok(true)).boxed())
    }

    fn state(&self) -> State {
        let frames = self.frames();
        let mut state = State::new();
        state.insert_or_assign("type", "stats");
        state.insert_or_assign("frames", frames);
        state.insert_or_assign("ticket", self.last_ticket.load(Ordering::Relaxed));
        if let Ok(format) = self.format.lock() {
            if let Some((format, since)) = format.as_ref() {
                let elapsed = since.elapsed().as_secs_f64();
                let fps = if elapsed > 0.0 { frames as f64 / elapsed } else { 0.0 };
                state.insert_or_assign("format", format.name.as_str());
                state.insert_or_assign("fps", fps);
            }
        }
        state
    }

    fn index(&self) -> i32 {
        self.index
    }

    fn name(&self) -> String {
        format!("stats[{}]", self.index)
    }
}

#[cfg(test)]
#[path = "consumer_test.rs"]
mod consumer_test;
