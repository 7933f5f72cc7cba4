use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use crate::{
    format::{CHANNEL_PIXEL_SIZE, VideoFormat},
    frame::Frame,
};

/// Converts decoded frames into packed BGRA frames of a channel's size.
/// The scaling context is rebuilt whenever the source geometry changes.
pub struct Scaler {
    context: Option<scaling::Context>,
    source: (Pixel, u32, u32),
    width: u32,
    height: u32,
}

unsafe impl Send for Scaler {}

impl Scaler {
    pub fn new(format: &VideoFormat) -> Self {
        Self {
            context: None,
            source: (Pixel::None, 0, 0),
            width: format.width,
            height: format.height,
        }
    }

    pub fn run(&mut self, frame: &Frame) -> anyhow::Result<Frame> {
        let source = (frame.format(), frame.width(), frame.height());
        if self.context.is_none() || self.source != source {
            self.context = Some(scaling::Context::get(
                source.0,
                source.1,
                source.2,
                Pixel::BGRA,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )?);
            self.source = source;
        }
        let Some(context) = self.context.as_mut() else {
            anyhow::bail!("scaler not initialized");
        };

        let src = to_video(frame)?;
        let mut dst = ffmpeg_next::frame::Video::empty();
        context.run(&src, &mut dst)?;

        Ok(Frame::packed(
            self.width,
            self.height,
            Pixel::BGRA,
            pack_rows(&dst, self.width as usize * CHANNEL_PIXEL_SIZE, self.height as usize),
            frame.ticket(),
        ))
    }
}

/// Copies an owned frame into an FFmpeg frame, row by row since both sides
/// may pad their lines differently.
fn to_video(frame: &Frame) -> anyhow::Result<ffmpeg_next::frame::Video> {
    let mut video = ffmpeg_next::frame::Video::new(frame.format(), frame.width(), frame.height());
    if video.planes() != frame.planes().len() {
        anyhow::bail!(
            "frame has {} planes, {:?} needs {}",
            frame.planes().len(),
            frame.format(),
            video.planes()
        );
    }
    for (n, plane) in frame.planes().iter().enumerate() {
        let dst_stride = video.stride(n);
        let row = plane.stride().min(dst_stride);
        let rows = plane.height().min(video.plane_height(n) as usize);
        let dst = video.data_mut(n);
        for y in 0..rows {
            let src = &plane.data()[y * plane.stride()..y * plane.stride() + row];
            dst[y * dst_stride..y * dst_stride + row].copy_from_slice(src);
        }
    }
    Ok(video)
}

fn pack_rows(video: &ffmpeg_next::frame::Video, row: usize, rows: usize) -> Bytes {
    let stride = video.stride(0);
    let data = video.data(0);
    let mut packed = Vec::with_capacity(row * rows);
    for y in 0..rows {
        packed.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    Bytes::from(packed)
}
