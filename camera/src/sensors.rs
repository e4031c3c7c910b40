//! Sensors module.
//!
//! Lists V4L2 video input nodes and opens them for capturing.
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use common::protocol::Device;
use rscam::{Camera, Config};

use crate::CameraError;

/// Capture function of an opened camera, one encoded frame per call.
pub type CaptureFn = Box<dyn FnMut() -> Option<Bytes>>;

/// Access to the platform's video input devices.
pub trait MediaDevices: Send + Sync {
    /// List the video input devices, replacing any previous listing.
    fn enumerate(&self) -> Result<Vec<Device>, CameraError>;

    /// Open the device with the given id and start capturing.
    fn open(&self, device_id: &str) -> Result<CaptureFn, CameraError>;
}

/// Video4Linux devices found in a device directory.
#[derive(Clone, Debug)]
pub struct V4l2Devices {
    pub video_dir: PathBuf,
    pub sysfs_dir: PathBuf,
    pub format: String,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
}

impl Default for V4l2Devices {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("/dev"),
            sysfs_dir: PathBuf::from("/sys/class/video4linux"),
            format: "MJPG".into(),
            resolution: None,
            frame_rate: None,
        }
    }
}

impl MediaDevices for V4l2Devices {
    fn enumerate(&self) -> Result<Vec<Device>, CameraError> {
        let mut devices = Vec::new();
        let mut denied = 0;

        for (_index, path) in list_video_nodes(&self.video_dir)? {
            let id = path.to_string_lossy().into_owned();
            match Camera::new(&id) {
                Ok(cam) => {
                    // Metadata nodes of UVC cameras have no capture format
                    if !has_capture_format(&cam) {
                        log::debug!("Skipping {}, not a video input", &id);
                        continue;
                    }
                    let label = path
                        .file_name()
                        .and_then(|name| device_label(&self.sysfs_dir, &name.to_string_lossy()))
                        .unwrap_or_else(|| id.clone());
                    devices.push(Device::new(id, label));
                }
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    log::warn!("Permission denied for {}", &id);
                    denied += 1;
                }
                Err(err) => log::debug!("Skipping {}: {}", &id, err),
            }
        }

        match (devices.is_empty(), denied) {
            (true, 0) => Err(CameraError::NoDevices),
            (true, _) => Err(CameraError::PermissionDenied(
                self.video_dir.to_string_lossy().into_owned(),
            )),
            (false, _) => {
                log::info!("Found {} video input device(s)", devices.len());
                Ok(devices)
            }
        }
    }

    fn open(&self, device_id: &str) -> Result<CaptureFn, CameraError> {
        get_capture_fn_linux(device_id, &self.format, self.resolution, self.frame_rate)
    }
}

/// List `video<N>` nodes of a directory, sorted by `N`.
pub fn list_video_nodes(dir: &Path) -> Result<Vec<(u32, PathBuf)>, CameraError> {
    let entries = fs::read_dir(dir).map_err(|err| CameraError::opening(&dir.to_string_lossy(), err))?;

    let mut nodes: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = name.to_str()?.strip_prefix("video")?.parse::<u32>().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    nodes.sort_by_key(|(index, _)| *index);

    Ok(nodes)
}

/// Read the card name of a node from sysfs.
pub fn device_label(sysfs_dir: &Path, node_name: &str) -> Option<String> {
    let name = fs::read_to_string(sysfs_dir.join(node_name).join("name")).ok()?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

fn has_capture_format(cam: &Camera) -> bool {
    matches!(cam.formats().next(), Some(Ok(_)))
}

/// Get a capture function to a video device on a Linux machine.
pub fn get_capture_fn_linux(
    device_name: &str,
    format: &str,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<(u32, u32)>,
) -> Result<CaptureFn, CameraError> {
    let mut cam = Camera::new(device_name).map_err(|err| CameraError::opening(device_name, err))?;
    log_supported_formats(&cam, format);
    let format = format.as_bytes();

    log::info!("Using camera {}", device_name);

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, format))?;

    let frame_rate = frame_rate
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format,
        ..Default::default()
    })?;

    // Copying out of the driver buffer hands it back to the driver right away
    let callback = move || {
        cam.capture()
            .ok()
            .map(|frame| Bytes::copy_from_slice(&frame[..]))
    };
    Ok(Box::new(callback))
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), CameraError> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Map to iterator over ((width, height) num_pixels)
            .map(|res| (res, res.0 * res.1))
            // Get the highest resolution in terms of number of pixels
            .max_by(|a, b| a.1.cmp(&b.1))
            // Extract width and height values
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or(CameraError::NotSupported("resolution"))
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), CameraError> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            // Intervals are (numerator, denominator) in seconds per frame
            .filter(|(numerator, _)| *numerator > 0)
            .max_by(|a, b| (a.1 * b.0).cmp(&(b.1 * a.0)))
            .copied(),
        rscam::IntervalInfo::Stepwise {
            min,
            max: _,
            step: _,
        } => Some(min),
    }
    .ok_or(CameraError::NotSupported("frame rate"))
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().map_while(Result::ok).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn get_cam_info_if_available() -> Result<(), CameraError> {
        let cam_name = "/dev/video0";
        let cam = Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let formats: Vec<_> = cam.formats().map_while(Result::ok).collect();
                println!("Supported formats: {formats:?}");

                let format = b"MJPG";
                if !formats.iter().any(|fmt| &fmt.format == format) {
                    println!("Camera does not support MJPG");
                    return Ok(());
                }

                let resolutions = cam.resolutions(format)?;
                println!("Supported resolutions: {resolutions:?}");

                let selected_resolution = get_max_resolution(&cam, format)?;
                let frame_rates = cam.intervals(format, selected_resolution)?;
                println!("Supported frame rates: {frame_rates:?}");
            }
        }

        Ok(())
    }

    #[test]
    fn lists_video_nodes_in_numeric_order() -> Result<(), CameraError> {
        let dir = tempfile::tempdir()?;
        for name in ["video10", "video2", "video0", "videoX", "vbi0", "media0"] {
            fs::write(dir.path().join(name), b"")?;
        }

        let nodes = list_video_nodes(dir.path())?;
        let indices: Vec<_> = nodes.iter().map(|(index, _)| *index).collect();

        assert_eq!(indices, vec![0, 2, 10]);
        assert_eq!(nodes[0].1, dir.path().join("video0"));

        Ok(())
    }

    #[test]
    fn reads_label_from_sysfs() -> Result<(), CameraError> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("video0"))?;
        fs::write(dir.path().join("video0").join("name"), "Integrated Camera\n")?;
        fs::create_dir(dir.path().join("video1"))?;
        fs::write(dir.path().join("video1").join("name"), "  \n")?;

        assert_eq!(
            device_label(dir.path(), "video0").as_deref(),
            Some("Integrated Camera")
        );
        assert_eq!(device_label(dir.path(), "video1"), None);
        assert_eq!(device_label(dir.path(), "video7"), None);

        Ok(())
    }

    #[test]
    fn enumerating_without_video_inputs_fails() -> Result<(), CameraError> {
        let dir = tempfile::tempdir()?;
        // Regular files expose no capture format
        fs::write(dir.path().join("video0"), b"")?;

        let devices = V4l2Devices {
            video_dir: dir.path().to_owned(),
            sysfs_dir: dir.path().to_owned(),
            ..Default::default()
        };

        assert!(matches!(devices.enumerate(), Err(CameraError::NoDevices)));

        Ok(())
    }

    #[test]
    fn enumerating_missing_directory_fails() {
        let devices = V4l2Devices {
            video_dir: PathBuf::from("/nonexistent/video/dir"),
            ..Default::default()
        };

        assert!(devices.enumerate().is_err());
    }
}
