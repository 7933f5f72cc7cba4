use std::sync::Arc;

use playout_core::output::Output;
use tokio_util::sync::CancellationToken;

use crate::consumer::StatsConsumer;

mod api;
mod channel;
mod config;
mod consumer;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_module("ffmpeg_next", log::LevelFilter::Warn)
        .filter_module("playout_core", log::LevelFilter::Info)
        .filter_module("playout", log::LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    if let Err(e) = playout_core::init() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }

    let config = config::config();
    let output = Arc::new(Output::new(config.format().clone(), config.channel_index()));
    if let Err(e) = output.add(0, Arc::new(StatsConsumer::new(0))) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    api::start_api_server(config.api_addr().to_string(), output.clone(), cancel.clone());

    let channel_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = channel::run(config, output, channel_cancel.clone()).await {
            log::error!("channel stopped: {:#}", e);
        }
        channel_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    std::process::exit(0);
}
