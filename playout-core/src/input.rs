use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    frame::Ticket,
    packet::{PacketElement, PacketSender, RawPacket},
    stream::AvStream,
};

/// Capacity of the packet broadcast channel.
const PACKET_QUEUE: usize = 1024;
/// The reader pauses while this many packets are still queued for the slowest subscriber.
const PACKET_HIGH_WATER: usize = PACKET_QUEUE / 2;

/// Reads packets from an [`AvInput`] on a blocking thread and broadcasts
/// them to every decoder subscribed to this input.
///
/// Each packet gets the next ticket in read order. When the input is
/// exhausted every stream receives an `Eof`, or, when looping, a `Loop`
/// followed by packets from the start of the input again.
pub struct AvInputTask {
    cancel: CancellationToken,
    raw_chan: PacketSender,
}

impl AvInputTask {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let (sender, _) = tokio::sync::broadcast::channel(PACKET_QUEUE);

        Self {
            cancel,
            raw_chan: sender,
        }
    }

    /// The channel decoders subscribe to. Subscribe before calling [`start`](Self::start).
    pub fn sender(&self) -> &PacketSender {
        &self.raw_chan
    }

    pub fn start(&self, mut input: AvInput, looping: bool) {
        let cancel_clone = self.cancel.clone();
        let sender_clone = self.raw_chan.clone();
        tokio::spawn(async move {
            let cancel_inner = cancel_clone.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let mut next_ticket = 0u64;
                let mut read_since_rewind = false;
                loop {
                    if cancel_inner.is_cancelled() {
                        break;
                    }
                    // broadcast never blocks the sender
                    if sender_clone.len() >= PACKET_HIGH_WATER {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    match input.read_packet() {
                        Some(packet) => {
                            next_ticket += 1;
                            read_since_rewind = true;
                            // no subscriber is not an error
                            let _ = sender_clone
                                .send(PacketElement::data(packet, Ticket::new(next_ticket)));
                        }
                        None if looping && read_since_rewind => {
                            read_since_rewind = false;
                            if let Err(e) = input.rewind() {
                                log::error!("input rewind failed: {:#}", e);
                                input.send_eof(&sender_clone);
                                break;
                            }
                            log::debug!("input looped");
                            for index in input.streams.keys() {
                                let _ = sender_clone.send(PacketElement::looped(*index));
                            }
                        }
                        None => {
                            log::info!("end of input");
                            input.send_eof(&sender_clone);
                            break;
                        }
                    }
                }
            });

            tokio::select! {
                _ = handle => {
                    log::debug!("read input packet task finished");
                    cancel_clone.cancel();
                }
                _ = cancel_clone.cancelled() => {
                    log::debug!("read input packet task cancelled");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for AvInputTask {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    streams: HashMap<usize, AvStream>,
}

impl AvInput {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let input = ffmpeg_next::format::input(Path::new(url))?;

        let mut streams = HashMap::new();
        for stream in input.streams() {
            streams.insert(stream.index(), AvStream::from(stream));
        }

        Ok(Self {
            inner: input,
            streams,
        })
    }

    /// Video streams ordered by index.
    pub fn video_streams(&self) -> Vec<AvStream> {
        let mut streams: Vec<_> = self
            .streams
            .values()
            .filter(|s| s.is_video())
            .cloned()
            .collect();
        streams.sort_by_key(AvStream::index);
        streams
    }

    pub fn read_packet(&mut self) -> Option<RawPacket> {
        self.inner
            .packets()
            .next()
            .map(|(stream, packet)| RawPacket::from((packet, stream.time_base())))
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        self.inner.seek(0, ..)?;
        Ok(())
    }

    fn send_eof(&self, sender: &PacketSender) {
        for index in self.streams.keys() {
            let _ = sender.send(PacketElement::eof(*index));
        }
    }
}
