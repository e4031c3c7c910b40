//! Live capture stream bound to one device.
//!
//! The camera is opened and read on a dedicated thread. The most recent frame
//! is published into a `watch` channel for single-frame captures and every
//! frame is broadcast as a multipart item for live previews.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::{
    sensors::{CaptureFn, MediaDevices},
    CameraError,
};

/// Give up on a camera after this many failed reads in a row.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// How long a release waits for the capture thread before detaching it.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

pub type PreviewSender = broadcast::Sender<Bytes>;

/// Encoded frame taken from a stream.
#[derive(Debug)]
pub struct CapturedFrame {
    data: Bytes,
}

impl CapturedFrame {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Handle to a running camera stream.
///
/// Dropping the handle releases the camera as well, `release` makes it explicit.
/// A capture thread stuck in a blocking read is detached after `RELEASE_TIMEOUT`
/// so that the caller can move on to another device.
pub struct CameraStream {
    device_id: String,
    frames: watch::Receiver<Option<Bytes>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CameraStream {
    /// Open `device_id` and start capturing.
    ///
    /// Blocks until the device is opened so that open errors reach the caller.
    pub fn open(
        devices: Arc<dyn MediaDevices>,
        device_id: &str,
        preview_tx: PreviewSender,
    ) -> Result<Self, CameraError> {
        let (frames_tx, frames_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let device_id = device_id.to_owned();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("capture {device_id}"))
                .spawn(move || {
                    let capture_fn = match devices.open(&device_id) {
                        Ok(capture_fn) => {
                            ready_tx.send(Ok(())).ok();
                            capture_fn
                        }
                        Err(err) => {
                            ready_tx.send(Err(err)).ok();
                            return;
                        }
                    };
                    capture_loop(&device_id, capture_fn, &stop, frames_tx, preview_tx);
                })?
        };

        let mut stream = Self {
            device_id: device_id.to_owned(),
            frames: frames_rx,
            stop,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Opened stream for {}", device_id);
                Ok(stream)
            }
            Ok(Err(err)) => {
                stream.shutdown();
                Err(err)
            }
            Err(_) => {
                stream.shutdown();
                Err(CameraError::StreamEnded)
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wait for the next frame and take it.
    pub async fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        self.frames
            .changed()
            .await
            .map_err(|_| CameraError::StreamEnded)?;

        let frame = self.frames.borrow_and_update().clone();
        frame.map(CapturedFrame::new).ok_or(CameraError::StreamEnded)
    }

    /// Like `capture`, but fail if no frame arrives within `timeout`.
    pub async fn capture_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<CapturedFrame, CameraError> {
        tokio::time::timeout(timeout, self.capture())
            .await
            .map_err(|_| CameraError::Timeout(timeout))?
    }

    /// Stop the capture thread and close the device.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + RELEASE_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Capture thread of {} did not stop within {:?}, detaching it",
                    &self.device_id,
                    RELEASE_TIMEOUT
                );
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if handle.join().is_err() {
            log::error!("Capture thread of {} panicked", &self.device_id);
        }
        log::info!("Released stream for {}", &self.device_id);
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    device_id: &str,
    mut capture_fn: CaptureFn,
    stop: &AtomicBool,
    frames_tx: watch::Sender<Option<Bytes>>,
    preview_tx: PreviewSender,
) {
    let mut failures = 0;

    while !stop.load(Ordering::Relaxed) {
        let frame = capture_fn();
        // Released while blocked in the read
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match frame {
            Some(frame) => {
                failures = 0;
                // No preview listener is fine
                preview_tx.send(as_jpeg_stream_item(&frame)).ok();
                if frames_tx.send(Some(frame)).is_err() {
                    break;
                }
            }
            None => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!("Giving up on {} after {} failed captures", device_id, failures);
                    break;
                }
                log::warn!("Unable to capture frame from {}, trying again...", device_id);
            }
        }
    }
}

/// Wrap an encoded JPEG frame as a `multipart/x-mixed-replace` item.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
