//! Data model shared between the camera layer, the controller and the view.
//!
use std::fmt;

use serde::{Deserialize, Serialize};

/// A video input device as listed by the enumerator.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub label: String,
}

impl Device {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// One ranked classification row.
///
/// `label` may contain several sub-labels joined with `", "`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// Split the label into its sub-labels.
    pub fn sub_labels(&self) -> impl Iterator<Item = &str> {
        self.label.split(", ").filter(|name| !name.is_empty())
    }

    /// Whether the row has everything it needs to be shown.
    ///
    /// A confidence of exactly zero counts as not loaded.
    pub fn is_loaded(&self) -> bool {
        !self.label.is_empty() && self.confidence != 0.0
    }
}

/// Phase of the capture/inference loop.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Phase {
    #[default]
    Idle,
    AwaitingPrerequisites,
    Streaming,
    Classifying,
    Failed,
}

/// Failure shown to the user instead of being swallowed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Fault {
    NoDevices,
    PermissionDenied(String),
    DeviceUnavailable(String),
    ModelUnavailable(String),
    Capture(String),
    Inference(String),
    Stopped,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::NoDevices => write!(f, "no camera found"),
            Fault::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Fault::DeviceUnavailable(msg) => write!(f, "camera unavailable: {msg}"),
            Fault::ModelUnavailable(msg) => write!(f, "model unavailable: {msg}"),
            Fault::Capture(msg) => write!(f, "capture failed: {msg}"),
            Fault::Inference(msg) => write!(f, "classification failed: {msg}"),
            Fault::Stopped => write!(f, "classifier stopped"),
        }
    }
}

impl std::error::Error for Fault {}

/// Snapshot of everything the view renders.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ViewState {
    pub phase: Phase,
    pub devices: Vec<Device>,
    pub selected: Option<String>,
    pub results: Vec<Prediction>,
    pub fault: Option<Fault>,
}

impl ViewState {
    /// Whether a click on the video may trigger a classification.
    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }
}
