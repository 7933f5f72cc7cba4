use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bytes per pixel of a channel frame (packed BGRA).
pub const CHANNEL_PIXEL_SIZE: usize = 4;

/// Video format of a channel. Every frame dispatched on the channel must be
/// exactly `size` bytes long; `fps` drives the output cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub size: usize,
}

impl VideoFormat {
    pub fn new(name: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            fps,
            size: width as usize * height as usize * CHANNEL_PIXEL_SIZE,
        }
    }

    /// Parses `<width>x<height>@<fps>`, e.g. `1920x1080@50`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (dims, fps) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("invalid video format {:?}: missing '@<fps>'", s))?;
        let (width, height) = dims
            .split_once('x')
            .ok_or_else(|| anyhow::anyhow!("invalid video format {:?}: missing 'x'", s))?;
        let width: u32 = width.trim().parse()?;
        let height: u32 = height.trim().parse()?;
        let fps: f64 = fps.trim().parse()?;
        if width == 0 || height == 0 {
            anyhow::bail!("invalid video size {}x{}", width, height);
        }
        if !(fps.is_finite() && fps > 0.0) {
            anyhow::bail!("invalid frame rate {}", fps);
        }
        Ok(Self::new(s.trim(), width, height, fps))
    }

    /// Time between two output frames, truncated to whole microseconds.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros((1_000_000.0 / self.fps) as u64)
    }
}

impl Display for VideoFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} ({}x{} @ {} fps, {} bytes)",
            self.name, self.width, self.height, self.fps, self.size
        )
    }
}
