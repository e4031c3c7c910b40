//! Capture/inference loop.
//!
//! The controller task owns the application state: device list, selection,
//! model, stream and results. HTTP handlers never touch it directly. They send
//! commands through a `ControllerComm` and read the snapshots it publishes.
//!
//! Phases:
//! - `Idle` until `run` starts, then `AwaitingPrerequisites` while the device
//!   enumeration and the model load are joined.
//! - `Streaming` once a stream is open for the selected device. Opening a
//!   stream captures and classifies one frame right away.
//! - `Classifying` while a frame is captured and classified.
//! - `Failed` when a fault left no stream to work with.
use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use camera::{
    sensors::MediaDevices,
    stream::{CameraStream, CapturedFrame, PreviewSender},
    CameraError,
};
use common::protocol::{Device, Fault, Phase, Prediction, ViewState};
use image::RgbImage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{meter::METER, nn::InferModel};

/// Reply of a classification request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Classified,
    /// Nothing to classify with yet.
    Skipped,
}

pub enum Command {
    SelectDevice {
        id: String,
        reply: oneshot::Sender<Result<(), Fault>>,
    },
    Classify {
        reply: oneshot::Sender<Result<Outcome, Fault>>,
    },
}

/// Cloneable handle used by the HTTP handlers.
#[derive(Clone)]
pub struct ControllerComm {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ViewState>,
    preview_tx: PreviewSender,
}

impl ControllerComm {
    /// Current snapshot of the view state.
    pub fn state(&self) -> ViewState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ViewState> {
        self.state_rx.clone()
    }

    pub fn subscribe_preview(&self) -> broadcast::Receiver<Bytes> {
        self.preview_tx.subscribe()
    }

    /// Classify one more frame of the current stream.
    ///
    /// Without a stream and a model this is a no-op.
    pub async fn classify(&self) -> Result<Outcome, Fault> {
        let streaming = self.state_rx.borrow().is_streaming();
        if !streaming {
            log::debug!("Classification requested before streaming, ignoring");
            return Ok(Outcome::Skipped);
        }

        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Classify { reply })
            .await
            .map_err(|_| Fault::Stopped)?;
        rx.await.map_err(|_| Fault::Stopped)?
    }

    /// Select the device to stream from.
    pub async fn select_device(&self, id: &str) -> Result<(), Fault> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::SelectDevice {
                id: id.to_owned(),
                reply,
            })
            .await
            .map_err(|_| Fault::Stopped)?;
        rx.await.map_err(|_| Fault::Stopped)?
    }
}

pub struct Controller {
    devices: Arc<dyn MediaDevices>,
    model: Option<Arc<dyn InferModel>>,
    stream: Option<CameraStream>,
    state: ViewState,
    state_tx: watch::Sender<ViewState>,
    preview_tx: PreviewSender,
    command_rx: mpsc::Receiver<Command>,
    capture_timeout: Duration,
}

impl Controller {
    pub fn new(devices: Arc<dyn MediaDevices>, capture_timeout: Duration) -> (Self, ControllerComm) {
        let (command_tx, command_rx) = mpsc::channel(20);
        let (state_tx, state_rx) = watch::channel(ViewState::default());
        let (preview_tx, _) = broadcast::channel(20);

        let comm = ControllerComm {
            command_tx,
            state_rx,
            preview_tx: preview_tx.clone(),
        };
        let controller = Self {
            devices,
            model: None,
            stream: None,
            state: ViewState::default(),
            state_tx,
            preview_tx,
            command_rx,
            capture_timeout,
        };

        (controller, comm)
    }

    /// Run until every `ControllerComm` is dropped.
    ///
    /// `load_model` runs concurrently with the device enumeration. Streaming
    /// starts only after both have finished.
    pub async fn run<F>(mut self, load_model: F)
    where
        F: Future<Output = anyhow::Result<Arc<dyn InferModel>>>,
    {
        self.set_phase(Phase::AwaitingPrerequisites);

        let (devices, model) = tokio::join!(self.enumerate(), load_model);

        match model {
            Ok(model) => self.model = Some(model),
            Err(err) => {
                self.fail(Fault::ModelUnavailable(format!("{err:#}")));
            }
        }
        if let Err(fault) = devices {
            self.fail(fault);
        }

        if self.state.fault.is_none() {
            if let Some(id) = self.state.selected.clone() {
                self.bind(&id).await.ok();
            }
        }

        while let Some(command) = self.command_rx.recv().await {
            match command {
                Command::SelectDevice { id, reply } => {
                    reply.send(self.select_device(id).await).ok();
                }
                Command::Classify { reply } => {
                    reply.send(self.classify().await).ok();
                }
            }
        }

        self.release_stream().await;
        log::info!("Controller stopped");
    }

    /// List the devices and select the first one.
    async fn enumerate(&mut self) -> Result<Vec<Device>, Fault> {
        let devices = Arc::clone(&self.devices);
        let listed = tokio::task::spawn_blocking(move || devices.enumerate())
            .await
            .map_err(|err| Fault::DeviceUnavailable(err.to_string()))?
            .map_err(camera_fault)?;

        log::info!("Devices: {:?}", &listed);
        self.state.selected = listed.first().map(|device| device.id.clone());
        self.state.devices = listed.clone();
        self.publish();

        Ok(listed)
    }

    async fn select_device(&mut self, id: String) -> Result<(), Fault> {
        if !self.state.devices.iter().any(|device| device.id == id) {
            return Err(Fault::DeviceUnavailable(format!("unknown device {id}")));
        }

        if self.state.selected.as_deref() == Some(id.as_str()) && self.stream.is_some() {
            return Ok(());
        }

        self.state.selected = Some(id.clone());
        if self.model.is_none() {
            // Streaming waits for the model
            self.publish();
            return Ok(());
        }

        self.bind(&id).await
    }

    /// Replace the stream by one for `id`, then classify its first frame.
    async fn bind(&mut self, id: &str) -> Result<(), Fault> {
        self.release_stream().await;

        let devices = Arc::clone(&self.devices);
        let preview_tx = self.preview_tx.clone();
        let device_id = id.to_owned();
        let opened = tokio::task::spawn_blocking(move || {
            CameraStream::open(devices, &device_id, preview_tx)
        })
        .await;

        match opened {
            Ok(Ok(stream)) => self.stream = Some(stream),
            Ok(Err(err)) => return Err(self.fail(camera_fault(err))),
            Err(err) => return Err(self.fail(Fault::DeviceUnavailable(err.to_string()))),
        }

        // `classify` publishes the next phase
        self.state.fault = None;
        self.classify().await.map(|_| ())
    }

    async fn classify(&mut self) -> Result<Outcome, Fault> {
        if self.stream.is_none() || self.model.is_none() {
            return Ok(Outcome::Skipped);
        }

        self.set_phase(Phase::Classifying);
        match self.capture_and_classify().await {
            Ok(results) => {
                METER.tick_classified();
                log::debug!("Results: {:?}", &results);
                self.state.results = results;
                self.state.fault = None;
                self.set_phase(Phase::Streaming);
                Ok(Outcome::Classified)
            }
            Err(fault) => Err(self.fail(fault)),
        }
    }

    async fn capture_and_classify(&mut self) -> Result<Vec<Prediction>, Fault> {
        let (Some(stream), Some(model)) = (self.stream.as_mut(), self.model.as_ref()) else {
            return Err(Fault::Capture("no stream".into()));
        };
        let model = Arc::clone(model);

        let frame = stream
            .capture_timeout(self.capture_timeout)
            .await
            .map_err(camera_fault)?;

        tokio::task::spawn_blocking(move || {
            let image = decode_frame(frame)?;
            model
                .classify(&image)
                .map_err(|err| Fault::Inference(format!("{err:#}")))
        })
        .await
        .map_err(|err| Fault::Inference(err.to_string()))?
    }

    async fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            tokio::task::spawn_blocking(move || stream.release()).await.ok();
        }
    }

    /// Record a fault, log it and publish it.
    fn fail(&mut self, fault: Fault) -> Fault {
        log::error!("{}", &fault);
        self.state.fault = Some(fault.clone());
        self.state.phase = match self.stream {
            Some(_) => Phase::Streaming,
            None => Phase::Failed,
        };
        self.publish();
        fault
    }

    fn set_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

/// Decode a captured JPEG frame, consuming it.
fn decode_frame(frame: CapturedFrame) -> Result<RgbImage, Fault> {
    turbojpeg::decompress_image(frame.as_bytes()).map_err(|err| Fault::Capture(err.to_string()))
}

fn camera_fault(err: CameraError) -> Fault {
    match err {
        CameraError::NoDevices => Fault::NoDevices,
        CameraError::PermissionDenied(device) => Fault::PermissionDenied(device),
        CameraError::StreamEnded | CameraError::Timeout(_) => Fault::Capture(err.to_string()),
        err => Fault::DeviceUnavailable(err.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn camera_errors_map_to_visible_faults() {
        assert_eq!(camera_fault(CameraError::NoDevices), Fault::NoDevices);
        assert_eq!(
            camera_fault(CameraError::PermissionDenied("/dev/video0".into())),
            Fault::PermissionDenied("/dev/video0".into())
        );
        assert!(matches!(
            camera_fault(CameraError::Timeout(Duration::from_secs(1))),
            Fault::Capture(_)
        ));
        assert!(matches!(
            camera_fault(CameraError::NotSupported("resolution")),
            Fault::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn undecodable_frames_are_capture_faults() {
        let frame = CapturedFrame::new(Bytes::from_static(b"not a jpeg"));
        assert!(matches!(decode_frame(frame), Err(Fault::Capture(_))));
    }
}
