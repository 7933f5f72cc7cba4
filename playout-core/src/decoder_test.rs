use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use ffmpeg_next::{Rational, format::Pixel};

use super::{DecoderTask, PACKET_BUFFER, VideoCodec};
use crate::{
    frame::{DecodedView, FrameCmd, FrameElement, FrameReceiver, PlaneView, Ticket},
    packet::{PacketCmd, PacketElement, PacketSender, RawPacket},
};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 4;
const CORRUPT: u8 = 0xFF;
const INTERLACED: u8 = 0x01;

/// Decodes one-byte packets into a GRAY8 picture filled with that byte.
/// Every picture is written into the same output buffer, and up to `delay`
/// pictures are held back until the codec is drained.
struct ReusingCodec {
    index: usize,
    width: u32,
    delay: usize,
    has_delay: bool,
    pending: VecDeque<Vec<u8>>,
    draining: bool,
    buffer: Vec<u8>,
    flushes: Arc<AtomicUsize>,
}

impl ReusingCodec {
    fn new(index: usize) -> Self {
        Self {
            index,
            width: WIDTH,
            delay: 0,
            has_delay: false,
            pending: VecDeque::new(),
            draining: false,
            buffer: vec![0; (WIDTH * HEIGHT) as usize],
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn delayed(mut self, delay: usize, has_delay: bool) -> Self {
        self.delay = delay;
        self.has_delay = has_delay;
        self
    }
}

impl VideoCodec for ReusingCodec {
    fn name(&self) -> String {
        "reusing test codec".to_string()
    }

    fn stream_index(&self) -> usize {
        self.index
    }

    fn fps(&self) -> f64 {
        25.0
    }

    fn nb_frames(&self) -> i64 {
        250
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        HEIGHT
    }

    fn has_delay(&self) -> bool {
        self.has_delay
    }

    fn send_packet(&mut self, packet: RawPacket) -> anyhow::Result<()> {
        let data = packet.data();
        if data.first() == Some(&CORRUPT) {
            anyhow::bail!("invalid data found when processing input");
        }
        self.pending.push_back(data.to_vec());
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<DecodedView<'_>>> {
        let ready = self.pending.len() > self.delay || (self.draining && !self.pending.is_empty());
        if !ready {
            return Ok(None);
        }
        let Some(data) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.buffer.fill(data[0]);
        Ok(Some(DecodedView {
            width: WIDTH,
            height: HEIGHT,
            format: Pixel::GRAY8,
            interlaced: data.get(1) == Some(&INTERLACED),
            repeat_pict: 0.0,
            planes: vec![PlaneView {
                data: &self.buffer,
                stride: WIDTH as usize,
                height: HEIGHT as usize,
            }],
        }))
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

fn packet(stream: usize, data: &[u8], ticket: u64) -> PacketElement {
    PacketElement::data(
        RawPacket::from_data(stream, data, Rational::new(1, 25)),
        Ticket::new(ticket),
    )
}

fn channels() -> (PacketSender, tokio::sync::mpsc::Sender<FrameElement>, FrameReceiver) {
    let (source, _) = tokio::sync::broadcast::channel(64);
    let (target, frames) = tokio::sync::mpsc::channel(64);
    (source, target, frames)
}

async fn collect(frames: &mut FrameReceiver) -> Vec<FrameElement> {
    let mut out = Vec::new();
    loop {
        let element = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("decoder output timed out")
            .expect("decoder output closed before EOF");
        let eof = element.is_eof();
        out.push(element);
        if eof {
            return out;
        }
    }
}

#[derive(Debug, PartialEq)]
enum Seen {
    Data { value: u8, ticket: Option<u64> },
    Loop,
    Eof,
}

fn seen(elements: &[FrameElement]) -> Vec<Seen> {
    elements
        .iter()
        .map(|element| match &element.cmd {
            FrameCmd::Data(frame) => Seen::Data {
                value: frame.planes()[0].data()[0],
                ticket: element.ticket.id(),
            },
            FrameCmd::Loop => Seen::Loop,
            FrameCmd::Eof => Seen::Eof,
        })
        .collect()
}

#[tokio::test]
async fn test_start_rejects_zero_dimensions() {
    let (source, target, _frames) = channels();
    let mut codec = ReusingCodec::new(0);
    codec.width = 0;
    assert!(DecoderTask::start(codec, &source, target).is_err());
}

#[tokio::test]
async fn test_exposes_stream_properties() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(3), &source, target).unwrap();
    assert_eq!(task.stream_index(), 3);
    assert_eq!(task.fps(), 25.0);
    assert_eq!(task.nb_frames(), 250);
    assert_eq!((task.width(), task.height()), (WIDTH, HEIGHT));
    assert!(task.is_progressive());

    source.send(PacketElement::eof(3)).ok();
    assert_eq!(seen(&collect(&mut frames).await), vec![Seen::Eof]);
    task.wait().await;
}

#[tokio::test]
async fn test_preserves_order_of_frames_and_markers() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    source.send(packet(0, &[1], 1)).ok();
    source.send(packet(1, &[9], 90)).ok();
    source.send(packet(0, &[2], 2)).ok();
    source.send(PacketElement::looped(1)).ok();
    source.send(PacketElement::looped(0)).ok();
    source.send(packet(0, &[3], 3)).ok();
    source.send(PacketElement::eof(1)).ok();
    source.send(PacketElement::eof(0)).ok();

    let out = collect(&mut frames).await;
    assert_eq!(
        seen(&out),
        vec![
            Seen::Data { value: 1, ticket: Some(1) },
            Seen::Data { value: 2, ticket: Some(2) },
            Seen::Loop,
            Seen::Data { value: 3, ticket: Some(3) },
            Seen::Eof,
        ]
    );
    for element in &out {
        if let Some(frame) = element.frame() {
            assert_eq!(frame.ticket(), element.ticket);
        }
    }

    task.wait().await;
    assert!(frames.recv().await.is_none());
}

#[tokio::test]
async fn test_emitted_frames_do_not_alias_codec_buffer() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    for (ticket, value) in [1u8, 2, 3].into_iter().enumerate() {
        source.send(packet(0, &[value], ticket as u64)).ok();
    }
    source.send(PacketElement::eof(0)).ok();

    let out = collect(&mut frames).await;
    let decoded: Vec<_> = out.iter().filter_map(FrameElement::frame).collect();
    assert_eq!(decoded.len(), 3);
    for (frame, value) in decoded.iter().zip([1u8, 2, 3]) {
        assert_eq!(frame.size(), (WIDTH * HEIGHT) as usize);
        assert!(frame.planes()[0].data().iter().all(|b| *b == value));
    }
    assert_ne!(
        decoded[0].planes()[0].data().as_ptr(),
        decoded[1].planes()[0].data().as_ptr()
    );
    task.wait().await;
}

#[tokio::test]
async fn test_loop_drains_delayed_frames_before_marker() {
    let (source, target, mut frames) = channels();
    let codec = ReusingCodec::new(0).delayed(1, true);
    let flushes = codec.flushes.clone();
    let task = DecoderTask::start(codec, &source, target).unwrap();

    source.send(packet(0, &[1], 1)).ok();
    source.send(packet(0, &[2], 2)).ok();
    source
        .send(PacketElement {
            stream: 0,
            cmd: PacketCmd::Loop,
            ticket: Ticket::new(10),
        })
        .ok();
    source.send(packet(0, &[4], 4)).ok();
    source.send(packet(0, &[5], 5)).ok();
    source.send(PacketElement::eof(0)).ok();

    let out = collect(&mut frames).await;
    assert_eq!(
        seen(&out),
        vec![
            Seen::Data { value: 1, ticket: Some(2) },
            Seen::Data { value: 2, ticket: Some(10) },
            Seen::Loop,
            Seen::Data { value: 4, ticket: Some(5) },
            Seen::Eof,
        ]
    );
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    task.wait().await;
}

#[tokio::test]
async fn test_loop_without_delay_capability_only_flushes() {
    let (source, target, mut frames) = channels();
    let codec = ReusingCodec::new(0).delayed(1, false);
    let flushes = codec.flushes.clone();
    let task = DecoderTask::start(codec, &source, target).unwrap();

    source.send(packet(0, &[1], 1)).ok();
    source.send(PacketElement::looped(0)).ok();
    source.send(PacketElement::eof(0)).ok();

    assert_eq!(seen(&collect(&mut frames).await), vec![Seen::Loop, Seen::Eof]);
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    task.wait().await;
}

#[tokio::test]
async fn test_decode_error_terminates_with_single_eof() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    source.send(packet(0, &[1], 1)).ok();
    source.send(packet(0, &[CORRUPT], 2)).ok();
    source.send(packet(0, &[3], 3)).ok();
    source.send(PacketElement::eof(0)).ok();

    assert_eq!(
        seen(&collect(&mut frames).await),
        vec![Seen::Data { value: 1, ticket: Some(1) }, Seen::Eof]
    );

    task.wait().await;
    assert!(frames.recv().await.is_none());
}

#[tokio::test]
async fn test_closed_source_ends_stream() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    source.send(packet(0, &[7], 1)).ok();
    drop(source);

    assert_eq!(
        seen(&collect(&mut frames).await),
        vec![Seen::Data { value: 7, ticket: Some(1) }, Seen::Eof]
    );
    task.wait().await;
}

#[tokio::test]
async fn test_tracks_interlacing() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    source.send(packet(0, &[1, INTERLACED], 1)).ok();
    let first = frames.recv().await.unwrap();
    assert!(first.frame().is_some());
    assert!(!task.is_progressive());

    source.send(packet(0, &[2, 0], 2)).ok();
    frames.recv().await.unwrap();
    assert!(task.is_progressive());

    source.send(PacketElement::eof(0)).ok();
    collect(&mut frames).await;
    task.wait().await;
}

#[tokio::test]
async fn test_finishes_after_decode_error_while_source_stays_open() {
    let (source, target, mut frames) = channels();
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    source.send(packet(0, &[1], 1)).ok();
    source.send(packet(0, &[CORRUPT], 2)).ok();

    assert_eq!(
        seen(&collect(&mut frames).await),
        vec![Seen::Data { value: 1, ticket: Some(1) }, Seen::Eof]
    );
    tokio::time::timeout(Duration::from_secs(5), task.wait())
        .await
        .expect("decoder kept running after its final EOF");
    drop(source);
}

#[tokio::test]
async fn test_slow_target_keeps_packets_queued_upstream() {
    const SENT: usize = 600;

    let (source, _) = tokio::sync::broadcast::channel(1024);
    let (target, frames) = tokio::sync::mpsc::channel(1);
    let task = DecoderTask::start(ReusingCodec::new(0), &source, target).unwrap();

    for ticket in 0..SENT {
        source.send(packet(0, &[(ticket % 200) as u8], ticket as u64)).ok();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // only the handoff buffer and a couple of in-flight packets leave the source
    assert!(
        source.len() > SENT - 4 * PACKET_BUFFER,
        "{} packets still queued upstream",
        source.len()
    );

    drop(frames);
    tokio::time::timeout(Duration::from_secs(5), task.wait())
        .await
        .expect("decoder did not stop after its target closed");
}
