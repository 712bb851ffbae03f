//! facewatch-video: frame sources and frame output.
//!
//! Opens V4L2 devices, video files, network streams and still images behind
//! one [`FrameSource`] trait, and turns analysed frames into annotated JPEGs.

pub mod annotate;
pub mod camera;
pub mod frame;
pub mod images;
pub mod lease;
pub mod source;
pub mod stream;

pub use annotate::{Annotator, EncodeError, EncodedFrame, Label, PLACEHOLDER_HINT};
pub use camera::{Camera, DeviceInfo, PixelFormat, V4lOpener};
pub use frame::Frame;
pub use images::ImageSequence;
pub use lease::{DeviceLease, DeviceLeases};
pub use source::{
    check_source, open_device_with_fallback, open_source, DeviceOpener, EndReason, FrameRead, FrameSource,
    ProbedDevice, SourceError, SourceSettings, SourceType, VideoSource,
};
pub use stream::{FfmpegStream, StreamInfo};
