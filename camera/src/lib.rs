//! Video input devices: enumeration and live capture streams.
pub mod sensors;
pub mod stream;

use std::{io, time::Duration};

/// Errors raised while listing or streaming from cameras.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("no video input device found")]
    NoDevices,

    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("{device}: {source}")]
    Device {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("no {0} found")]
    NotSupported(&'static str),

    #[error(transparent)]
    Rscam(#[from] rscam::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("capture stream ended")]
    StreamEnded,

    #[error("no frame captured within {0:?}")]
    Timeout(Duration),
}

impl CameraError {
    /// Classify an error raised while opening `device`.
    pub fn opening(device: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device.to_owned()),
            _ => CameraError::Device {
                device: device.to_owned(),
                source,
            },
        }
    }
}
