use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use serde_json::Value;
use tokio::time::Instant;

use crate::{consumer::FrameConsumer, format::VideoFormat, frame::Frame, monitor::State};

type Registry = BTreeMap<i32, Arc<dyn FrameConsumer>>;

/// Output stage of one channel: fans every produced frame out to the
/// registered consumers and holds the channel cadence when none of them
/// has a clock of its own.
///
/// The registry lock is only held to mutate or snapshot the registry,
/// never while a consumer is doing I/O.
pub struct Output {
    channel_index: i32,
    format: Mutex<VideoFormat>,
    consumers: Mutex<Registry>,
    state: Mutex<State>,
    next_tick: Mutex<Option<Instant>>,
}

impl Output {
    pub fn new(format: VideoFormat, channel_index: i32) -> Self {
        Self {
            channel_index,
            format: Mutex::new(format),
            consumers: Mutex::new(BTreeMap::new()),
            state: Mutex::new(State::new()),
            next_tick: Mutex::new(None),
        }
    }

    /// Registers `consumer` at `index`, replacing any previous occupant.
    /// If the consumer fails to initialize it is not registered.
    pub fn add(&self, index: i32, consumer: Arc<dyn FrameConsumer>) -> anyhow::Result<()> {
        self.remove(index);

        let format = self.format();
        consumer
            .initialize(&format, self.channel_index)
            .with_context(|| format!("{} failed to initialize {}", self.print(), consumer.name()))?;

        log::info!("{} {} added at port {}", self.print(), consumer.name(), index);
        lock(&self.consumers).insert(index, consumer);
        Ok(())
    }

    pub fn add_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> anyhow::Result<()> {
        self.add(consumer.index(), consumer)
    }

    pub fn remove(&self, index: i32) {
        if let Some(consumer) = lock(&self.consumers).remove(&index) {
            log::info!("{} {} removed from port {}", self.print(), consumer.name(), index);
        }
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn FrameConsumer>) {
        self.remove(consumer.index());
    }

    /// Dispatches one frame produced for the channel.
    ///
    /// `format` must be the channel's current format. When it differs from
    /// the one held here, the frame only triggers reinitialization of every
    /// consumer and is not delivered.
    pub async fn dispatch(&self, frame: Option<Frame>, format: &VideoFormat) {
        let Some(frame) = frame.filter(|frame| !frame.is_empty()) else {
            return;
        };

        let current = self.format();
        if frame.size() != current.size {
            log::warn!(
                "{} invalid input frame size {} (expected {})",
                self.print(),
                frame.size(),
                current.size
            );
            return;
        }

        if current != *format {
            self.reinitialize(format);
            return;
        }

        self.send_to_all(frame).await;
        self.update_state();
        self.pace(&current).await;
    }

    fn reinitialize(&self, format: &VideoFormat) {
        log::info!("{} format changed to {}", self.print(), format);
        {
            let mut consumers = lock(&self.consumers);
            consumers.retain(|index, consumer| match consumer.initialize(format, *index) {
                Ok(()) => true,
                Err(e) => {
                    log::error!(
                        "{} {} failed to reinitialize, removing: {:#}",
                        self.print(),
                        consumer.name(),
                        e
                    );
                    false
                }
            });
        }
        *lock(&self.format) = format.clone();
        *lock(&self.next_tick) = None;
        self.update_state();
    }

    async fn send_to_all(&self, frame: Frame) {
        let consumers = self.snapshot();

        let mut pending = Vec::with_capacity(consumers.len());
        for (index, consumer) in consumers {
            match consumer.send(frame.clone()) {
                Ok(future) => pending.push((index, consumer, tokio::spawn(future))),
                Err(e) => {
                    log::error!("{} {} send failed: {:#}", self.print(), consumer.name(), e);
                    self.evict(index, &consumer);
                }
            }
        }

        for (index, consumer, handle) in pending {
            match handle.await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    log::info!("{} {} stopped", self.print(), consumer.name());
                    self.evict(index, &consumer);
                }
                Ok(Err(e)) => {
                    log::error!("{} {} send error: {:#}", self.print(), consumer.name(), e);
                    self.evict(index, &consumer);
                }
                Err(e) => {
                    log::error!("{} {} send task failed: {}", self.print(), consumer.name(), e);
                    self.evict(index, &consumer);
                }
            }
        }
    }

    /// Removes `consumer` from `index` unless the slot was taken over by
    /// another consumer in the meantime.
    fn evict(&self, index: i32, consumer: &Arc<dyn FrameConsumer>) {
        let mut consumers = lock(&self.consumers);
        if consumers
            .get(&index)
            .is_some_and(|current| Arc::ptr_eq(current, consumer))
        {
            consumers.remove(&index);
        }
    }

    fn update_state(&self) {
        let state: State = self
            .snapshot()
            .into_iter()
            .map(|(index, consumer)| (format!("port/{}", index), Value::from(consumer.state())))
            .collect();
        *lock(&self.state) = state;
    }

    async fn pace(&self, format: &VideoFormat) {
        let needs_sync = self
            .snapshot()
            .values()
            .all(|consumer| !consumer.has_synchronization_clock());
        if !needs_sync {
            return;
        }

        let scheduled = *lock(&self.next_tick);
        let time = match scheduled {
            Some(time) => {
                tokio::time::sleep_until(time).await;
                time
            }
            None => Instant::now(),
        };
        *lock(&self.next_tick) = Some(time + format.frame_interval());
    }

    fn snapshot(&self) -> Registry {
        lock(&self.consumers).clone()
    }

    /// Monitoring state: `port/<index>` to the state of each active consumer.
    pub fn state(&self) -> State {
        lock(&self.state).clone()
    }

    pub fn format(&self) -> VideoFormat {
        lock(&self.format).clone()
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }

    /// Wake time of the next self-paced frame, if a cadence is established.
    pub fn next_tick(&self) -> Option<Instant> {
        *lock(&self.next_tick)
    }

    pub fn contains(&self, index: i32) -> bool {
        lock(&self.consumers).contains_key(&index)
    }

    pub fn len(&self) -> usize {
        lock(&self.consumers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.consumers).is_empty()
    }

    fn print(&self) -> String {
        format!("output[{}]", self.channel_index)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
