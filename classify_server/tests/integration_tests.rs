use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use camera::{
    sensors::{CaptureFn, MediaDevices},
    CameraError,
};
use clap::Parser;
use classify_server::{
    config::Config,
    controller::{Controller, ControllerComm, Outcome},
    nn::{InferModel, MobileNetModel, ModelConfig, LABELS_FILE},
    render::render_page,
};
use common::protocol::{Device, Fault, Phase, Prediction, ViewState};
use futures::future;
use image::{Rgb, RgbImage};

/// Decrements the live stream counter when a capture function is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeDevices {
    devices: Vec<Device>,
    jpeg: Bytes,
    opens: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    /// Frames delivered before the cameras freeze.
    frames_left: Arc<AtomicUsize>,
    /// Device whose reads never return.
    stalled: Option<String>,
}

impl FakeDevices {
    fn new(devices: Vec<Device>) -> Result<Self> {
        let image = RgbImage::from_pixel(32, 24, Rgb([120, 80, 40]));
        let jpeg = turbojpeg::compress_image(&image, 90, turbojpeg::Subsamp::Sub2x2)?;

        Ok(Self {
            devices,
            jpeg: Bytes::copy_from_slice(&jpeg),
            opens: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            frames_left: Arc::new(AtomicUsize::new(usize::MAX)),
            stalled: None,
        })
    }
}

impl MediaDevices for FakeDevices {
    fn enumerate(&self) -> Result<Vec<Device>, CameraError> {
        match self.devices.is_empty() {
            true => Err(CameraError::NoDevices),
            false => Ok(self.devices.clone()),
        }
    }

    fn open(&self, device_id: &str) -> Result<CaptureFn, CameraError> {
        if !self.devices.iter().any(|device| device.id == device_id) {
            return Err(CameraError::PermissionDenied(device_id.to_owned()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let guard = LiveGuard(Arc::clone(&self.live));
        let jpeg = self.jpeg.clone();
        let frames_left = Arc::clone(&self.frames_left);
        let stalled = self.stalled.as_deref() == Some(device_id);
        Ok(Box::new(move || {
            let _alive = &guard;
            if stalled {
                std::thread::sleep(Duration::from_secs(3600));
            }
            while frames_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err()
            {
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(5));
            Some(jpeg.clone())
        }))
    }
}

/// Returns a fresh ranking on every call.
#[derive(Default)]
struct FakeModel {
    calls: Arc<AtomicUsize>,
    /// Call that fails instead of ranking.
    fail_on: Option<usize>,
    delay: Duration,
}

impl InferModel for FakeModel {
    fn classify(&self, image: &RgbImage) -> Result<Vec<Prediction>> {
        assert_eq!(image.dimensions(), (32, 24));
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::sleep(self.delay);
        if self.fail_on == Some(call) {
            return Err(anyhow!("tensor shape mismatch"));
        }

        Ok(vec![
            Prediction::new(format!("tabby, call {call}"), 0.7),
            Prediction::new("tench, Tinca tinca", 0.2),
            Prediction::new("goldfish", 0.1),
        ])
    }
}

struct Harness {
    comm: ControllerComm,
    opens: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

fn cameras() -> Vec<Device> {
    vec![Device::new("cam1", "Front"), Device::new("cam2", "Back")]
}

/// Start a controller whose model load ends with `model_load`.
fn start(devices: Vec<Device>, model_load: Result<()>) -> Result<Harness> {
    let devices = FakeDevices::new(devices)?;
    match model_load {
        Ok(()) => start_with(devices, Ok(FakeModel::default()), Duration::from_secs(2)),
        Err(err) => start_with(devices, Err(err), Duration::from_secs(2)),
    }
}

fn start_with(
    devices: FakeDevices,
    model: Result<FakeModel>,
    capture_timeout: Duration,
) -> Result<Harness> {
    let opens = Arc::clone(&devices.opens);
    let live = Arc::clone(&devices.live);
    let calls = match &model {
        Ok(model) => Arc::clone(&model.calls),
        Err(_) => Arc::new(AtomicUsize::new(0)),
    };
    let model = model.map(|model| Arc::new(model) as Arc<dyn InferModel>);

    let (controller, comm) = Controller::new(Arc::new(devices), capture_timeout);
    let handle = tokio::spawn(controller.run(future::ready(model)));

    Ok(Harness {
        comm,
        opens,
        live,
        calls,
        handle,
    })
}

async fn wait_for(comm: &ControllerComm, pred: impl Fn(&ViewState) -> bool) -> Result<ViewState> {
    let mut rx = comm.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = rx.borrow_and_update().clone();
            if pred(&state) {
                return Ok::<_, anyhow::Error>(state);
            }
            rx.changed().await.map_err(|_| anyhow!("controller stopped"))?;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out, last state {:?}", comm.state()))?
}

fn classified(state: &ViewState) -> bool {
    state.phase == Phase::Streaming && !state.results.is_empty()
}

#[tokio::test]
async fn streams_first_device_once_model_is_loaded() -> Result<()> {
    let harness = start(cameras(), Ok(()))?;

    let state = wait_for(&harness.comm, classified).await?;

    assert_eq!(state.selected.as_deref(), Some("cam1"));
    assert_eq!(state.devices, cameras());
    assert_eq!(state.results.len(), 3);
    assert_eq!(state.results[0].label, "tabby, call 1");
    assert_eq!(state.fault, None);
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);
    assert_eq!(harness.calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn single_front_camera_yields_ranked_results() -> Result<()> {
    let harness = start(vec![Device::new("cam1", "Front")], Ok(()))?;
    wait_for(&harness.comm, classified).await?;

    harness.comm.select_device("cam1").await?;
    let state = harness.comm.state();

    assert_eq!(state.selected.as_deref(), Some("cam1"));
    assert!(!state.results.is_empty());
    let confidences: Vec<_> = state.results.iter().map(|row| row.confidence).collect();
    assert!(confidences.windows(2).all(|pair| pair[0] >= pair[1]));

    Ok(())
}

#[tokio::test]
async fn device_change_opens_and_classifies_exactly_once() -> Result<()> {
    let harness = start(cameras(), Ok(()))?;
    wait_for(&harness.comm, classified).await?;

    harness.comm.select_device("cam2").await?;

    let state = harness.comm.state();
    assert_eq!(state.selected.as_deref(), Some("cam2"));
    assert_eq!(state.phase, Phase::Streaming);
    assert_eq!(state.results[0].label, "tabby, call 2");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);
    assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
    // The previous stream was released before the new one was opened
    assert_eq!(harness.live.load(Ordering::SeqCst), 1);

    // Selecting the current device again changes nothing
    harness.comm.select_device("cam2").await?;
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);
    assert_eq!(harness.calls.load(Ordering::SeqCst), 2);

    Ok(())
}

#[tokio::test]
async fn click_reclassifies_and_replaces_results() -> Result<()> {
    let harness = start(cameras(), Ok(()))?;
    wait_for(&harness.comm, classified).await?;

    let outcome = harness.comm.classify().await?;

    assert_eq!(outcome, Outcome::Classified);
    let state = harness.comm.state();
    assert_eq!(state.results.len(), 3);
    assert_eq!(state.results[0].label, "tabby, call 2");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn click_before_streaming_is_a_no_op() -> Result<()> {
    let devices = FakeDevices::new(cameras())?;
    let opens = Arc::clone(&devices.opens);
    let (controller, comm) = Controller::new(Arc::new(devices), Duration::from_secs(2));

    // Not running yet
    assert_eq!(comm.classify().await?, Outcome::Skipped);
    assert_eq!(comm.state(), ViewState::default());

    // Model never finishes loading
    let _handle = tokio::spawn(
        controller.run(future::pending::<Result<Arc<dyn InferModel>>>()),
    );
    let waiting = wait_for(&comm, |state| !state.devices.is_empty()).await?;

    assert_eq!(waiting.phase, Phase::AwaitingPrerequisites);
    assert_eq!(comm.classify().await?, Outcome::Skipped);
    assert_eq!(comm.state(), waiting);
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn empty_device_list_fails_visibly() -> Result<()> {
    let harness = start(vec![], Ok(()))?;

    let state = wait_for(&harness.comm, |state| state.phase == Phase::Failed).await?;

    assert_eq!(state.fault, Some(Fault::NoDevices));
    assert_eq!(state.selected, None);
    assert!(state.devices.is_empty());
    assert_eq!(harness.opens.load(Ordering::SeqCst), 0);

    let html = render_page(&state);
    assert!(!html.contains("<option"));
    assert!(html.contains("no camera found"));

    Ok(())
}

#[tokio::test]
async fn model_failure_never_opens_a_stream() -> Result<()> {
    let harness = start(cameras(), Err(anyhow!("offline")))?;

    let state = wait_for(&harness.comm, |state| state.phase == Phase::Failed).await?;

    assert!(matches!(state.fault, Some(Fault::ModelUnavailable(_))));
    assert_eq!(state.selected.as_deref(), Some("cam1"));

    // Selection is recorded but streaming waits for a model
    harness.comm.select_device("cam2").await?;
    assert_eq!(harness.comm.state().selected.as_deref(), Some("cam2"));
    assert_eq!(harness.comm.classify().await?, Outcome::Skipped);
    assert_eq!(harness.opens.load(Ordering::SeqCst), 0);
    assert_eq!(harness.calls.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn unknown_device_is_rejected() -> Result<()> {
    let harness = start(cameras(), Ok(()))?;
    wait_for(&harness.comm, classified).await?;

    let res = harness.comm.select_device("cam9").await;

    assert!(matches!(res, Err(Fault::DeviceUnavailable(_))));
    assert_eq!(harness.comm.state().selected.as_deref(), Some("cam1"));

    Ok(())
}

#[tokio::test]
async fn stopping_the_controller_releases_the_stream() -> Result<()> {
    let Harness {
        comm, live, handle, ..
    } = start(cameras(), Ok(()))?;
    wait_for(&comm, classified).await?;
    assert_eq!(live.load(Ordering::SeqCst), 1);

    drop(comm);
    tokio::time::timeout(Duration::from_secs(5), handle).await??;

    assert_eq!(live.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn first_frame_is_classified_without_an_empty_streaming_view() -> Result<()> {
    let model = FakeModel {
        delay: Duration::from_millis(300),
        ..Default::default()
    };
    let harness = start_with(FakeDevices::new(cameras())?, Ok(model), Duration::from_secs(2))?;

    let state = wait_for(&harness.comm, |_| harness.opens.load(Ordering::SeqCst) == 1).await?;
    assert_ne!(state.phase, Phase::Streaming);

    let classifying = wait_for(&harness.comm, |state| state.phase == Phase::Classifying).await?;
    assert!(classifying.results.is_empty());
    // The page keeps refreshing until the results are in
    assert!(render_page(&classifying).contains("http-equiv=\"refresh\""));

    let state = wait_for(&harness.comm, classified).await?;
    assert_eq!(state.results[0].label, "tabby, call 1");

    Ok(())
}

#[tokio::test]
async fn inference_error_keeps_stream_and_results() -> Result<()> {
    let model = FakeModel {
        fail_on: Some(2),
        ..Default::default()
    };
    let harness = start_with(FakeDevices::new(cameras())?, Ok(model), Duration::from_secs(2))?;
    let before = wait_for(&harness.comm, classified).await?;

    let res = harness.comm.classify().await;

    assert!(matches!(res, Err(Fault::Inference(_))));
    let state = harness.comm.state();
    assert_eq!(state.phase, Phase::Streaming);
    assert!(matches!(state.fault, Some(Fault::Inference(_))));
    assert_eq!(state.results, before.results);
    assert!(render_page(&state).contains("classification failed"));

    // The next click works again and clears the fault
    assert_eq!(harness.comm.classify().await?, Outcome::Classified);
    let state = harness.comm.state();
    assert_eq!(state.fault, None);
    assert_eq!(state.results[0].label, "tabby, call 3");

    Ok(())
}

#[tokio::test]
async fn frozen_camera_times_out_then_recovers() -> Result<()> {
    let devices = FakeDevices::new(cameras())?;
    let frames_left = Arc::clone(&devices.frames_left);
    frames_left.store(0, Ordering::SeqCst);
    let harness = start_with(devices, Ok(FakeModel::default()), Duration::from_millis(300))?;

    let state = wait_for(&harness.comm, |state| state.fault.is_some()).await?;

    assert!(matches!(state.fault, Some(Fault::Capture(_))));
    assert_eq!(state.phase, Phase::Streaming);
    assert!(state.results.is_empty());
    assert_eq!(harness.calls.load(Ordering::SeqCst), 0);

    // Frames flow again
    frames_left.store(usize::MAX, Ordering::SeqCst);
    assert_eq!(harness.comm.classify().await?, Outcome::Classified);

    let state = harness.comm.state();
    assert_eq!(state.fault, None);
    assert_eq!(state.phase, Phase::Streaming);
    assert_eq!(state.results[0].label, "tabby, call 1");

    Ok(())
}

#[tokio::test]
async fn stalled_camera_does_not_block_device_change() -> Result<()> {
    let mut devices = FakeDevices::new(cameras())?;
    devices.stalled = Some("cam1".into());
    let harness = start_with(devices, Ok(FakeModel::default()), Duration::from_millis(300))?;

    let state = wait_for(&harness.comm, |state| state.fault.is_some()).await?;
    assert!(matches!(state.fault, Some(Fault::Capture(_))));

    tokio::time::timeout(Duration::from_secs(5), harness.comm.select_device("cam2")).await??;

    let state = harness.comm.state();
    assert_eq!(state.selected.as_deref(), Some("cam2"));
    assert_eq!(state.fault, None);
    assert_eq!(state.results[0].label, "tabby, call 1");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);

    // The controller still answers
    assert_eq!(harness.comm.classify().await?, Outcome::Classified);

    Ok(())
}

/// Runs the real network if it was downloaded before.
#[test]
fn test_mobilenet_if_available() -> Result<()> {
    let model_dir = Config::try_parse_from(["classify_server"])?.model_dir();
    let config = ModelConfig::default();
    let model_path = model_dir.join(config.file_name());
    let labels_path = model_dir.join(LABELS_FILE);

    if !model_path.exists() || !labels_path.exists() {
        println!("No model in {}, skipping", model_dir.display());
        return Ok(());
    }

    let model = MobileNetModel::from_files(&model_path, &labels_path, 5)?;
    let results = model.classify(&RgbImage::from_pixel(320, 240, Rgb([200, 30, 30])))?;

    assert_eq!(results.len(), 5);
    assert!(results
        .iter()
        .all(|row| !row.label.is_empty() && (0.0..=1.0).contains(&row.confidence)));
    assert!(results
        .windows(2)
        .all(|pair| pair[0].confidence >= pair[1].confidence));

    Ok(())
}
