//! Command line configuration.
//!
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use camera::sensors::V4l2Devices;
use clap::Parser;

use crate::nn::ModelConfig;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Classify live webcam frames in the browser")]
pub struct Config {
    /// Address to serve the page on
    #[clap(long, default_value = "127.0.0.1:3000")]
    pub server_address: String,

    /// MobileNet version (1 or 2)
    #[clap(long, default_value_t = 2)]
    pub model_version: u8,

    /// MobileNet width multiplier
    #[clap(long, default_value_t = 1.0)]
    pub model_alpha: f32,

    /// Directory holding the model and label files [default: <cache dir>/webcam_classifier]
    #[clap(long)]
    pub model_dir: Option<PathBuf>,

    /// Number of ranked labels to show
    #[clap(long, default_value_t = 3, value_parser = parse_top_k)]
    pub top_k: usize,

    /// Directory with the video device nodes
    #[clap(long, default_value = "/dev")]
    pub video_dir: PathBuf,

    /// Sysfs directory with the device names
    #[clap(long, default_value = "/sys/class/video4linux")]
    pub sysfs_dir: PathBuf,

    /// Pixel format requested from the camera
    #[clap(long, default_value = "MJPG")]
    pub format: String,

    /// Capture resolution as WIDTHxHEIGHT, the largest supported one if omitted
    #[clap(long, value_parser = parse_resolution)]
    pub resolution: Option<(u32, u32)>,

    /// Give up on a capture after this many milliseconds
    #[clap(long, default_value_t = 5000)]
    pub capture_timeout_ms: u64,
}

impl Config {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            version: self.model_version,
            alpha: self.model_alpha,
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("webcam_classifier")
        })
    }

    pub fn devices(&self) -> V4l2Devices {
        V4l2Devices {
            video_dir: self.video_dir.clone(),
            sysfs_dir: self.sysfs_dir.clone(),
            format: self.format.clone(),
            resolution: self.resolution,
            frame_rate: None,
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server_address.parse()?)
    }
}

fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value}"))?;
    let width = width.trim().parse().map_err(|_| format!("bad width in {value}"))?;
    let height = height.trim().parse().map_err(|_| format!("bad height in {value}"))?;

    Ok((width, height))
}

fn parse_top_k(value: &str) -> Result<usize, String> {
    match value.trim().parse() {
        Ok(0) => Err("at least one label has to be shown".to_owned()),
        Ok(top_k) => Ok(top_k),
        Err(_) => Err(format!("expected a positive number, got {value}")),
    }
}
