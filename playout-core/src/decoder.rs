use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use ffmpeg_next::Rational;
use tokio::sync::broadcast::error::RecvError;

use crate::{
    frame::{DecodedView, Frame, FrameElement, FrameSender, Ticket},
    packet::{PacketCmd, PacketElement, PacketReceiver, PacketSender, RawPacket},
    stream::AvStream,
};

/// Packets handed to the decode thread ahead of decoding.
const PACKET_BUFFER: usize = 8;

/// A video decoder bound to one elementary stream.
///
/// `receive_frame` hands out a view into the codec's own output buffer,
/// which the codec is free to overwrite on the next call.
pub trait VideoCodec: Send + 'static {
    fn name(&self) -> String;
    fn stream_index(&self) -> usize;
    fn fps(&self) -> f64;
    fn nb_frames(&self) -> i64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// The codec may buffer frames internally that only come out when drained.
    fn has_delay(&self) -> bool;

    fn send_packet(&mut self, packet: RawPacket) -> anyhow::Result<()>;

    /// Enters draining mode: buffered frames become available to `receive_frame`.
    fn send_eof(&mut self) -> anyhow::Result<()>;

    /// `Ok(None)` when more input is needed or the codec is fully drained.
    fn receive_frame(&mut self) -> anyhow::Result<Option<DecodedView<'_>>>;

    /// Drops all buffered state so decoding can restart from a new position.
    fn flush(&mut self);
}

/// FFmpeg-backed [`VideoCodec`].
pub struct Decoder {
    stream: AvStream,
    inner: ffmpeg_next::codec::decoder::Video,
    decoder_time_base: Rational,
    frame: ffmpeg_next::frame::Video,
    name: String,
    has_delay: bool,
    fps: f64,
}

unsafe impl Send for Decoder {}

impl Decoder {
    pub fn new(stream: &AvStream) -> anyhow::Result<Self> {
        if !stream.is_video() {
            return Err(anyhow::anyhow!(
                "stream {} is not a video stream",
                stream.index()
            ));
        }

        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;

        let video_decoder = decoder_ctx.decoder().video()?;
        if video_decoder.format() == ffmpeg_next::format::Pixel::None {
            return Err(anyhow::anyhow!("missing codec parameters"));
        }

        let (name, has_delay) = match video_decoder.codec() {
            Some(codec) => (
                codec.description().to_string(),
                codec
                    .capabilities()
                    .contains(ffmpeg_next::codec::capabilities::Capabilities::DELAY),
            ),
            None => (String::from("unknown"), false),
        };

        let fps = match stream.fps() {
            fps if fps > 0.0 => fps,
            _ => video_decoder
                .frame_rate()
                .filter(|rate| rate.denominator() != 0)
                .map(|rate| f64::from(rate.numerator()) / f64::from(rate.denominator()))
                .unwrap_or(0.0),
        };

        Ok(Self {
            stream: stream.clone(),
            decoder_time_base: video_decoder.time_base(),
            inner: video_decoder,
            frame: ffmpeg_next::frame::Video::empty(),
            name,
            has_delay,
            fps,
        })
    }
}

impl VideoCodec for Decoder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn stream_index(&self) -> usize {
        self.stream.index()
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn nb_frames(&self) -> i64 {
        self.stream.frames()
    }

    fn width(&self) -> u32 {
        self.inner.width()
    }

    fn height(&self) -> u32 {
        self.inner.height()
    }

    fn has_delay(&self) -> bool {
        self.has_delay
    }

    fn send_packet(&mut self, mut packet: RawPacket) -> anyhow::Result<()> {
        let time_base = packet.time_base();
        let packet = packet.get_mut();
        packet.rescale_ts(time_base, self.decoder_time_base);
        self.inner.send_packet(packet)?;
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<DecodedView<'_>>> {
        match self.inner.receive_frame(&mut self.frame) {
            Ok(()) => Ok(Some(DecodedView::from(&self.frame))),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) {
        self.inner.flush();
    }
}

/// Decode actor of one video stream.
///
/// Pulls the elements addressed to its stream from the shared packet
/// channel, decodes them on a blocking thread and sends owned frames plus
/// `Loop`/`Eof` markers to the target. Exactly one trailing `Eof` is sent,
/// whether the stream ended normally or decoding failed.
pub struct DecoderTask {
    stream_index: usize,
    fps: f64,
    nb_frames: i64,
    width: u32,
    height: u32,
    progressive: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl DecoderTask {
    pub fn start<C: VideoCodec>(
        codec: C,
        source: &PacketSender,
        target: FrameSender,
    ) -> anyhow::Result<Self> {
        let stream_index = codec.stream_index();
        let (width, height) = (codec.width(), codec.height());
        if width == 0 || height == 0 {
            anyhow::bail!(
                "[video_decoder] stream {}: invalid video size {}x{}",
                stream_index,
                width,
                height
            );
        }
        log::debug!("[video_decoder] stream {}: {}", stream_index, codec.name());

        let fps = codec.fps();
        let nb_frames = codec.nb_frames();
        let progressive = Arc::new(AtomicBool::new(true));
        let receiver = source.subscribe();
        let handle = tokio::spawn(Self::run(codec, receiver, target, progressive.clone()));

        Ok(Self {
            stream_index,
            fps,
            nb_frames,
            width,
            height,
            progressive,
            handle,
        })
    }

    async fn run<C: VideoCodec>(
        codec: C,
        mut receiver: PacketReceiver,
        target: FrameSender,
        progressive: Arc<AtomicBool>,
    ) {
        let stream_index = codec.stream_index();
        let (packet_tx, packet_rx) = tokio::sync::mpsc::channel::<PacketElement>(PACKET_BUFFER);

        let eof_target = target.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            Self::decoder_loop(codec, packet_rx, target, progressive)
        });

        // The decode thread may finish on its own after a decode error or a
        // closed target, so stop forwarding as soon as it does.
        let mut finished = None;
        loop {
            let received = tokio::select! {
                result = &mut handle => {
                    finished = Some(result);
                    break;
                }
                received = receiver.recv() => received,
            };
            match received {
                Ok(element) => {
                    if element.stream_index() != stream_index {
                        continue;
                    }
                    let eof = matches!(element.cmd, PacketCmd::Eof);
                    // bounded, so a slow decoder keeps packets queued upstream
                    if packet_tx.send(element).await.is_err() || eof {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "[video_decoder] stream {}: lagged behind, {} elements skipped",
                        stream_index,
                        skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
        drop(packet_tx);
        drop(receiver);

        let result = match finished {
            Some(result) => result,
            None => handle.await,
        };
        if let Err(e) = result {
            log::error!("[video_decoder] stream {}: decoder thread failed: {}", stream_index, e);
            let _ = eof_target.send(FrameElement::eof()).await;
        }
    }

    fn decoder_loop<C: VideoCodec>(
        mut codec: C,
        mut packet_rx: tokio::sync::mpsc::Receiver<PacketElement>,
        target: FrameSender,
        progressive: Arc<AtomicBool>,
    ) {
        if let Err(e) = Self::decode_packets(&mut codec, &mut packet_rx, &target, &progressive) {
            log::error!("[video_decoder] stream {}: {:#}", codec.stream_index(), e);
        }
        log::debug!("[video_decoder] stream {}: EOF", codec.stream_index());
        let _ = target.blocking_send(FrameElement::eof());
    }

    fn decode_packets<C: VideoCodec>(
        codec: &mut C,
        packet_rx: &mut tokio::sync::mpsc::Receiver<PacketElement>,
        target: &FrameSender,
        progressive: &AtomicBool,
    ) -> anyhow::Result<()> {
        // A closed input counts as end of stream.
        while let Some(element) = packet_rx.blocking_recv() {
            match element.cmd {
                PacketCmd::Loop => {
                    if codec.has_delay() {
                        codec.send_eof()?;
                        Self::drain(codec, target, progressive, element.ticket)?;
                    }
                    codec.flush();
                    Self::emit(target, FrameElement::looped())?;
                }
                PacketCmd::Eof => break,
                PacketCmd::Data(packet) => {
                    codec.send_packet(packet)?;
                    Self::drain(codec, target, progressive, element.ticket)?;
                }
            }
        }
        Ok(())
    }

    /// Forwards every frame the codec has ready, tagged with `ticket`.
    fn drain<C: VideoCodec>(
        codec: &mut C,
        target: &FrameSender,
        progressive: &AtomicBool,
        ticket: Ticket,
    ) -> anyhow::Result<()> {
        while let Some(view) = codec.receive_frame()? {
            if view.repeat_pict > 0.0 {
                log::warn!("[video_decoder] field repeat_pict not implemented");
            }
            progressive.store(!view.interlaced, Ordering::Relaxed);
            let frame = Frame::duplicate(&view, ticket);
            Self::emit(target, FrameElement::data(frame))?;
        }
        Ok(())
    }

    fn emit(target: &FrameSender, element: FrameElement) -> anyhow::Result<()> {
        target
            .blocking_send(element)
            .map_err(|_| anyhow::anyhow!("frame target closed"))
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn nb_frames(&self) -> i64 {
        self.nb_frames
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the most recently decoded frame was progressive.
    pub fn is_progressive(&self) -> bool {
        self.progressive.load(Ordering::Relaxed)
    }

    /// Waits until the actor has sent its trailing `Eof` and exited.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            log::error!("[video_decoder] stream {}: task failed: {}", self.stream_index, e);
        }
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
