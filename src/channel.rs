use std::sync::Arc;

use anyhow::Context;
use playout_core::{
    decoder::{Decoder, DecoderTask},
    format::VideoFormat,
    frame::{FrameCmd, FrameReceiver},
    input::{AvInput, AvInputTask},
    output::Output,
    scaler::Scaler,
};
use tokio_util::sync::CancellationToken;

use crate::config::PlayoutConfig;

/// Frames buffered between the decoder and the output.
const FRAME_QUEUE: usize = 8;

/// Plays the configured input into `output` until the input ends or
/// `cancel` fires.
pub(crate) async fn run(
    config: &PlayoutConfig,
    output: Arc<Output>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let input = AvInput::new(config.input())
        .with_context(|| format!("failed to open input {}", config.input()))?;
    let Some(stream) = input.video_streams().into_iter().next() else {
        anyhow::bail!("input {} has no video stream", config.input());
    };
    let decoder = Decoder::new(&stream)?;

    let input_task = AvInputTask::new();
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(FRAME_QUEUE);
    let decoder_task = DecoderTask::start(decoder, input_task.sender(), frame_tx)?;
    log::info!(
        "playing {} stream {}: {}x{} @ {:.2} fps, {} frames",
        config.input(),
        decoder_task.stream_index(),
        decoder_task.width(),
        decoder_task.height(),
        decoder_task.fps(),
        decoder_task.nb_frames()
    );
    input_task.start(input, config.looping());

    let result = pump(frame_rx, config.format(), &output, &cancel).await;

    input_task.stop();
    // the decoder only sees a closed source once the last sender is gone
    drop(input_task);
    decoder_task.wait().await;
    result
}

async fn pump(
    mut frames: FrameReceiver,
    format: &VideoFormat,
    output: &Output,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut scaler = Scaler::new(format);
    loop {
        let element = tokio::select! {
            _ = cancel.cancelled() => break,
            element = frames.recv() => element,
        };
        let Some(element) = element else {
            break;
        };
        match element.cmd {
            FrameCmd::Data(frame) => {
                let frame = scaler.run(&frame).context("failed to scale frame")?;
                output.dispatch(Some(frame), format).await;
            }
            FrameCmd::Loop => log::debug!("input looped"),
            FrameCmd::Eof => {
                log::info!("end of stream");
                break;
            }
        }
    }
    Ok(())
}
