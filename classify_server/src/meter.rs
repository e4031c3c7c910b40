//! Throughput counters, logged every two seconds.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Counters for served preview frames and finished classifications.
#[derive(Default)]
pub struct Meter {
    preview_frames: AtomicU64,
    classifications: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            preview_frames: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
        }
    }

    pub fn tick_preview(&self) {
        self.preview_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_classified(&self) {
        self.classifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_preview(&self) -> u64 {
        self.preview_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_classified(&self) -> u64 {
        self.classifications.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let preview_frames = METER.get_reset_preview();
            let classifications = METER.get_reset_classified();
            let elapsed = start.elapsed().as_secs_f32();
            let fps_preview = preview_frames as f32 / elapsed;

            if preview_frames > 0 {
                log::info!("Preview frames per second: {fps_preview:.2}")
            }
            if classifications > 0 {
                log::info!("Classifications in the last {elapsed:.1}s: {classifications}")
            }
        }
    })
}
