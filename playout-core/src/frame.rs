use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use rayon::prelude::*;

/// Alignment of every duplicated plane buffer, in bytes.
pub const PLANE_ALIGN: usize = 32;

pub type FrameSender = tokio::sync::mpsc::Sender<FrameElement>;
pub type FrameReceiver = tokio::sync::mpsc::Receiver<FrameElement>;

/// Opaque provenance token. Stages copy it through untouched; only the
/// producer that minted it gives the value any meaning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Ticket(Option<u64>);

impl Ticket {
    pub fn new(id: u64) -> Self {
        Self(Some(id))
    }

    pub fn id(&self) -> Option<u64> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Clone)]
pub enum FrameCmd {
    Data(Frame),
    Loop,
    Eof,
}

/// What a decode stage hands downstream: a frame or a marker, plus its ticket.
#[derive(Clone)]
pub struct FrameElement {
    pub cmd: FrameCmd,
    pub ticket: Ticket,
}

impl FrameElement {
    pub fn data(frame: Frame) -> Self {
        let ticket = frame.ticket();
        Self {
            cmd: FrameCmd::Data(frame),
            ticket,
        }
    }

    pub fn looped() -> Self {
        Self {
            cmd: FrameCmd::Loop,
            ticket: Ticket::default(),
        }
    }

    pub fn eof() -> Self {
        Self {
            cmd: FrameCmd::Eof,
            ticket: Ticket::default(),
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.cmd, FrameCmd::Eof)
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.cmd, FrameCmd::Loop)
    }

    pub fn frame(&self) -> Option<&Frame> {
        match &self.cmd {
            FrameCmd::Data(frame) => Some(frame),
            _ => None,
        }
    }
}

/// A single plane borrowed from a codec's output buffer.
#[derive(Clone, Copy)]
pub struct PlaneView<'a> {
    pub data: &'a [u8],
    pub stride: usize,
    pub height: usize,
}

impl PlaneView<'_> {
    /// Bytes covered by this plane: line stride times plane height.
    pub fn size(&self) -> usize {
        (self.stride * self.height).min(self.data.len())
    }
}

/// A decoded picture that still points into the codec's reused buffers.
/// It is only valid until the next call into the codec and must be
/// turned into a [`Frame`] before it leaves the decoder.
pub struct DecodedView<'a> {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
    pub interlaced: bool,
    pub repeat_pict: f64,
    pub planes: Vec<PlaneView<'a>>,
}

impl<'a> From<&'a ffmpeg_next::frame::Video> for DecodedView<'a> {
    fn from(frame: &'a ffmpeg_next::frame::Video) -> Self {
        let planes = (0..frame.planes())
            .map(|n| PlaneView {
                data: frame.data(n),
                stride: frame.stride(n),
                height: frame.plane_height(n) as usize,
            })
            .collect();
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
            interlaced: frame.is_interlaced(),
            repeat_pict: frame.repeat(),
            planes,
        }
    }
}

/// An owned pixel plane. The bytes start on a [`PLANE_ALIGN`] boundary.
#[derive(Clone, Debug)]
pub struct Plane {
    data: Bytes,
    stride: usize,
    height: usize,
}

impl Plane {
    pub fn new(data: Bytes, stride: usize, height: usize) -> Self {
        Self {
            data,
            stride,
            height,
        }
    }

    /// Copies `view` into a freshly allocated buffer owned by the new plane.
    pub fn copy_from(view: &PlaneView<'_>) -> Self {
        Self {
            data: copy_aligned(&view.data[..view.size()]),
            stride: view.stride,
            height: view.height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Allocates `src.len()` plus an alignment margin and copies `src` to the
/// first aligned offset. The returned bytes keep the whole allocation alive.
fn copy_aligned(src: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(src.len() + PLANE_ALIGN);
    let offset = match buf.as_ptr().align_offset(PLANE_ALIGN) {
        offset if offset < PLANE_ALIGN => offset,
        _ => 0,
    };
    buf.resize(offset, 0);
    buf.extend_from_slice(src);
    Bytes::from(buf).slice(offset..)
}

struct FrameInner {
    width: u32,
    height: u32,
    format: Pixel,
    planes: Vec<Plane>,
    ticket: Ticket,
}

/// Immutable, reference-counted picture. Cloning is cheap; the plane
/// buffers are released when the last clone drops.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: Pixel, planes: Vec<Plane>, ticket: Ticket) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                width,
                height,
                format,
                planes,
                ticket,
            }),
        }
    }

    /// A frame with no pixel data. Dispatching it is a no-op.
    pub fn empty() -> Self {
        Self::new(0, 0, Pixel::None, Vec::new(), Ticket::default())
    }

    /// Single packed plane (e.g. BGRA) with no row padding.
    pub fn packed(width: u32, height: u32, format: Pixel, data: Bytes, ticket: Ticket) -> Self {
        let stride = if height == 0 {
            0
        } else {
            data.len() / height as usize
        };
        let plane = Plane::new(data, stride, height as usize);
        Self::new(width, height, format, vec![plane], ticket)
    }

    /// Deep-copies every plane of `view` so the result no longer aliases the
    /// codec's buffers. Planes are copied in parallel.
    pub fn duplicate(view: &DecodedView<'_>, ticket: Ticket) -> Self {
        let planes = if view.planes.len() > 1 {
            view.planes.par_iter().map(Plane::copy_from).collect()
        } else {
            view.planes.iter().map(Plane::copy_from).collect()
        };
        Self::new(view.width, view.height, view.format, planes, ticket)
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> Pixel {
        self.inner.format
    }

    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.inner.planes.get(index)
    }

    pub fn ticket(&self) -> Ticket {
        self.inner.ticket
    }

    /// Total pixel bytes across all planes.
    pub fn size(&self) -> usize {
        self.inner.planes.iter().map(Plane::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {}x{} {:?} planes: {}, size: {}, ticket: {:?}",
            self.width(),
            self.height(),
            self.format(),
            self.planes().len(),
            self.size(),
            self.ticket().id()
        )
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod frame_test;
