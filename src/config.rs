use std::sync::LazyLock;

use playout_core::format::VideoFormat;

pub struct PlayoutConfig {
    input: String,
    looping: bool,
    channel_index: i32,
    format: VideoFormat,
    api_addr: String,
}

impl PlayoutConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let input = var("PLAYOUT_INPUT").unwrap_or_else(|| "scripts/test.mp4".to_string());
        let looping = matches!(
            var("PLAYOUT_LOOP").as_deref().map(str::trim),
            Some("1") | Some("true") | Some("yes")
        );
        let channel_index = match var("PLAYOUT_CHANNEL") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PLAYOUT_CHANNEL {:?}: {}", v, e))?,
            None => 1,
        };
        let format = VideoFormat::parse(
            var("PLAYOUT_FORMAT")
                .as_deref()
                .unwrap_or("1920x1080@50"),
        )?;
        let api_addr = var("PLAYOUT_API_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        Ok(Self {
            input,
            looping,
            channel_index,
            format,
            api_addr,
        })
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn api_addr(&self) -> &str {
        &self.api_addr
    }
}

pub fn config() -> &'static PlayoutConfig {
    static CONFIG: LazyLock<PlayoutConfig> = LazyLock::new(|| {
        PlayoutConfig::from_env().unwrap_or_else(|e| {
            eprintln!("Error reading configuration: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
