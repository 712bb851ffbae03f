//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{DeviceOpener, EndReason, FrameRead, FrameSource, SourceError};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_BUFFERS: u32 = 4;
/// Upper bound on a single dequeue; a stalled device ends the stream.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit grayscale (IR cameras).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

/// A streaming V4L2 capture device.
pub struct Camera {
    stream: MmapStream<'static>,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    sequence: u64,
}

impl Camera {
    /// Open `/dev/video{index}`, negotiate a format and start streaming.
    pub fn open(index: u32) -> Result<Self, SourceError> {
        let path = device_path(index);
        if !Path::new(&path).exists() {
            return Err(SourceError::DeviceNotFound(path));
        }

        let device = Device::with_path(&path).map_err(|e| {
            if e.raw_os_error() == Some(16) {
                SourceError::DeviceBusy(index)
            } else {
                SourceError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::Capture(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::Capture(format!("{path} is not a capture device")));
        }
        tracing::info!(device = %path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::Capture(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::Capture(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SourceError::Capture(format!(
                "unsupported pixel format {:?} (need YUYV, MJPG, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, CAPTURE_BUFFERS)
            .map_err(|e| SourceError::Capture(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        Ok(Self {
            stream,
            index,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            sequence: 0,
        })
    }

    /// Dequeue one buffer and convert it to RGB24.
    pub fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| SourceError::Capture(format!("failed to dequeue buffer: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };

        let (width, height) = (self.width, self.height);
        let rgb = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(payload, width, height)
                .map_err(|e| SourceError::Capture(e.to_string()))?,
            PixelFormat::Grey => frame::grey_to_rgb(payload, width, height)
                .map_err(|e| SourceError::Capture(e.to_string()))?,
            PixelFormat::Rgb24 => {
                let expected = (width * height * 3) as usize;
                if payload.len() < expected {
                    return Err(SourceError::Capture(format!(
                        "RGB3 buffer too short: expected {expected}, got {}",
                        payload.len()
                    )));
                }
                payload[..expected].to_vec()
            }
            PixelFormat::Mjpeg => {
                let decoded = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
                    .map_err(|e| SourceError::Capture(format!("MJPEG decode failed: {e}")))?
                    .to_rgb8();
                let frame = Frame::from_image(decoded, Utc::now(), self.sequence);
                self.sequence += 1;
                return Ok(frame);
            }
        };

        let frame = Frame {
            data: rgb,
            width,
            height,
            timestamp: Utc::now(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(frame)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for index in 0..16 {
            let path = device_path(index);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                index,
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> FrameRead {
        match self.capture_frame() {
            Ok(frame) => FrameRead::Frame(frame),
            Err(e) => {
                tracing::debug!(index = self.index, error = %e, "camera read failed");
                FrameRead::EndOfStream(EndReason::ReadFailed(e.to_string()))
            }
        }
    }

    fn describe(&self) -> String {
        device_path(self.index)
    }
}

/// Opens real V4L2 devices.
pub struct V4lOpener;

impl DeviceOpener for V4lOpener {
    fn open_device(&self, index: u32) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(Camera::open(index)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_missing_device() {
        let err = Camera::open(250).err().unwrap();
        assert!(matches!(err, SourceError::DeviceNotFound(_)));
    }
}
