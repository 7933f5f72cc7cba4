/// Registers FFmpeg components. Call once at startup before opening inputs.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod consumer;
pub mod decoder;
pub mod format;
pub mod frame;
pub mod input;
pub mod monitor;
pub mod output;
pub mod packet;
pub mod scaler;
pub mod stream;
