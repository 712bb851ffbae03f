//! Video source descriptors and the frame source abstraction.
//!
//! A [`VideoSource`] names where frames come from; [`open_source`] turns it
//! into a [`FrameSource`] that yields frames until end of stream. Devices are
//! probed for a first frame before being committed to, with fallback to
//! alternate indices.

use crate::camera::V4lOpener;
use crate::frame::Frame;
use crate::images::ImageSequence;
use crate::lease::{DeviceLease, DeviceLeases};
use crate::stream::FfmpegStream;
use facewatch_core::SourceKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Kind of video origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    Device,
    NetworkStream,
}

impl SourceType {
    /// Map a registry camera type (`device`, `file`, `rtsp`, `rtmp`, `ip`,
    /// `http`, `cctv`, ...) to a source type. Anything that is not a device
    /// or a file is treated as a network stream.
    pub fn from_registry(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "device" | "webcam" | "usb" => SourceType::Device,
            "file" | "video" => SourceType::File,
            _ => SourceType::NetworkStream,
        }
    }

    /// Event source kind recorded for identifications from this source.
    pub fn event_kind(&self) -> SourceKind {
        match self {
            SourceType::File => SourceKind::Video,
            SourceType::Device => SourceKind::Live,
            SourceType::NetworkStream => SourceKind::Network,
        }
    }
}

/// Where a pipeline reads frames from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSource {
    pub kind: SourceType,
    /// File path, device index, or stream URL.
    pub locator: String,
    pub active: bool,
}

impl VideoSource {
    pub fn file(path: impl Into<String>) -> Self {
        Self { kind: SourceType::File, locator: path.into(), active: true }
    }

    pub fn device(index: u32) -> Self {
        Self { kind: SourceType::Device, locator: index.to_string(), active: true }
    }

    /// A device source with no usable index: scan for any working device.
    pub fn any_device() -> Self {
        Self { kind: SourceType::Device, locator: String::new(), active: true }
    }

    pub fn network(url: impl Into<String>) -> Self {
        Self { kind: SourceType::NetworkStream, locator: url.into(), active: true }
    }

    /// Requested device index; `None` when the locator is not an integer.
    pub fn device_index(&self) -> Option<u32> {
        self.locator.trim().parse().ok()
    }
}

/// Why a source stopped yielding frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Normal end of a file.
    Exhausted,
    /// Transport closed or a read failed; not retried.
    ReadFailed(String),
    /// No frame arrived within the read timeout.
    TimedOut,
}

/// Outcome of one read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    EndOfStream(EndReason),
}

/// An open video origin. Owns its handle exclusively; dropping the source
/// releases it.
pub trait FrameSource {
    fn next_frame(&mut self) -> FrameRead;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source is inactive")]
    Inactive,
    #[error("video file not found: {0}")]
    NotFound(String),
    #[error("camera device {0} not found")]
    DeviceNotFound(String),
    #[error("camera device {0} is in use by another stream")]
    DeviceBusy(u32),
    #[error("camera device {index} opened but delivered no frame: {reason}")]
    NoSignal { index: u32, reason: String },
    #[error("no usable camera device (tried {tried:?})")]
    NoUsableDevice { tried: Vec<u32> },
    #[error("failed to open {locator}: {reason}")]
    OpenFailed { locator: String, reason: String },
    #[error("timed out opening {0}")]
    OpenTimeout(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for opening and reading sources.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Device indices tried when the requested device is unusable.
    pub device_attempts: u32,
    /// Longest wait for a single frame before treating the stream as ended.
    pub read_timeout: Duration,
    /// Longest wait for a network transport to open.
    pub network_open_timeout: Duration,
    /// Force RTSP over TCP.
    pub rtsp_tcp: bool,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            device_attempts: 4,
            read_timeout: Duration::from_secs(10),
            network_open_timeout: Duration::from_secs(10),
            rtsp_tcp: true,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

/// Opens capture devices by index.
pub trait DeviceOpener {
    fn open_device(&self, index: u32) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Open a video origin.
pub fn open_source(
    source: &VideoSource,
    settings: &SourceSettings,
    leases: &DeviceLeases,
) -> Result<Box<dyn FrameSource>, SourceError> {
    if !source.active {
        return Err(SourceError::Inactive);
    }
    match source.kind {
        SourceType::Device => {
            let device = open_device_with_fallback(&V4lOpener, leases, source.device_index(), settings.device_attempts)?;
            Ok(Box::new(device))
        }
        SourceType::File => open_file(&source.locator, settings),
        SourceType::NetworkStream => Ok(Box::new(FfmpegStream::open_network(&source.locator, settings)?)),
    }
}

fn open_file(locator: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>, SourceError> {
    let path = Path::new(locator);
    if !path.exists() {
        return Err(SourceError::NotFound(locator.to_string()));
    }
    if ImageSequence::handles(path) {
        return Ok(Box::new(ImageSequence::open(path)?));
    }
    Ok(Box::new(FfmpegStream::open_file(path, settings)?))
}

/// Candidate device indices: the requested one first, then `0..attempts`.
fn device_candidates(requested: Option<u32>, attempts: u32) -> Vec<u32> {
    let mut candidates: Vec<u32> = requested.into_iter().collect();
    candidates.extend((0..attempts).filter(|i| Some(*i) != requested));
    candidates
}

/// Open the requested device, falling back to alternates.
///
/// A device is only committed to once it has delivered a frame; that frame
/// is replayed as the first frame of the returned source. A requested index
/// that another pipeline holds is refused outright rather than silently
/// swapped for a different camera; busy alternates are skipped.
pub fn open_device_with_fallback(
    opener: &dyn DeviceOpener,
    leases: &DeviceLeases,
    requested: Option<u32>,
    attempts: u32,
) -> Result<ProbedDevice, SourceError> {
    let mut tried = Vec::new();

    for index in device_candidates(requested, attempts) {
        let Some(lease) = leases.try_acquire(index) else {
            if Some(index) == requested {
                return Err(SourceError::DeviceBusy(index));
            }
            tracing::debug!(index, "device leased by another pipeline, skipping");
            continue;
        };
        tried.push(index);

        match probe(opener, index) {
            Ok((source, first)) => {
                if Some(index) != requested {
                    tracing::warn!(?requested, index, "requested device unusable, using alternate");
                }
                return Ok(ProbedDevice { index, first: Some(first), inner: source, _lease: lease });
            }
            Err(e) => tracing::warn!(index, error = %e, "device probe failed"),
        }
    }

    Err(SourceError::NoUsableDevice { tried })
}

fn probe(opener: &dyn DeviceOpener, index: u32) -> Result<(Box<dyn FrameSource>, Frame), SourceError> {
    let mut source = opener.open_device(index)?;
    match source.next_frame() {
        FrameRead::Frame(frame) => Ok((source, frame)),
        FrameRead::EndOfStream(reason) => Err(SourceError::NoSignal {
            index,
            reason: format!("{reason:?}"),
        }),
    }
}

/// A device that passed its probe read.
pub struct ProbedDevice {
    index: u32,
    first: Option<Frame>,
    inner: Box<dyn FrameSource>,
    _lease: DeviceLease,
}

impl ProbedDevice {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FrameSource for ProbedDevice {
    fn next_frame(&mut self) -> FrameRead {
        match self.first.take() {
            Some(frame) => FrameRead::Frame(frame),
            None => self.inner.next_frame(),
        }
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Open a source and read exactly one frame to check that it works.
///
/// Returns the frame dimensions on success.
pub fn check_source(
    source: &VideoSource,
    settings: &SourceSettings,
    leases: &DeviceLeases,
) -> Result<(u32, u32), SourceError> {
    let mut opened = open_source(source, settings, leases)?;
    match opened.next_frame() {
        FrameRead::Frame(frame) => Ok((frame.width, frame.height)),
        FrameRead::EndOfStream(reason) => Err(SourceError::Capture(format!(
            "{} is not delivering video: {reason:?}",
            opened.describe()
        ))),
    }
}
