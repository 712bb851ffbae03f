//! Face box overlays, JPEG encoding, and the error placeholder frame.

use crate::frame::Frame;
use ab_glyph::{FontArc, PxScale};
use facewatch_core::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;
pub const PLACEHOLDER_HINT: &str = "Check camera connection or try video upload";

const MATCHED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const HINT_COLOR: Rgb<u8> = Rgb([160, 160, 160]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const MESSAGE_SCALE: f32 = 24.0;
const HINT_SCALE: f32 = 16.0;

/// DejaVu Sans Mono, used when no font is configured or the configured one
/// cannot be loaded.
const BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame buffer does not match {width}x{height}")]
    BadFrame { width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// One face overlay.
#[derive(Debug, Clone)]
pub struct Label {
    pub bbox: BoundingBox,
    pub text: String,
    pub matched: bool,
}

impl Label {
    pub fn matched(bbox: BoundingBox, name: &str, confidence: f32) -> Self {
        Self {
            bbox,
            text: format!("{name} ({confidence:.2})"),
            matched: true,
        }
    }

    pub fn unknown(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            text: "Unknown".to_string(),
            matched: false,
        }
    }
}

/// A frame ready for the consumer.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    /// Set when this is an error placeholder; carries the message shown.
    pub placeholder: Option<String>,
}

impl EncodedFrame {
    pub fn is_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }
}

/// Draws overlays and encodes frames.
pub struct Annotator {
    font: Option<FontArc>,
    jpeg_quality: u8,
}

impl Annotator {
    /// Load the label font from `font_path`, falling back to the bundled
    /// font when none is given or it cannot be read.
    pub fn new(font_path: Option<&Path>, jpeg_quality: u8) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid font, using bundled font");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "font not readable, using bundled font");
                None
            }
        });
        Self::with_font(font, jpeg_quality)
    }

    /// `None` selects the bundled font.
    pub fn with_font(font: Option<FontArc>, jpeg_quality: u8) -> Self {
        Self {
            font: font.or_else(bundled_font),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every label onto the frame and encode it.
    pub fn annotate(&self, frame: &Frame, labels: &[Label]) -> Result<EncodedFrame, EncodeError> {
        let mut canvas = frame.to_image().ok_or(EncodeError::BadFrame {
            width: frame.width,
            height: frame.height,
        })?;
        for label in labels {
            self.draw_label(&mut canvas, label);
        }
        self.encode(&canvas, frame.sequence, None)
    }

    fn draw_label(&self, canvas: &mut RgbImage, label: &Label) {
        let color = if label.matched { MATCHED_COLOR } else { UNKNOWN_COLOR };
        let (img_w, img_h) = canvas.dimensions();

        let x = label.bbox.x.round().max(0.0) as i32;
        let y = label.bbox.y.round().max(0.0) as i32;
        let w = (label.bbox.width.round() as i32).min(img_w as i32 - x);
        let h = (label.bbox.height.round() as i32).min(img_h as i32 - y);
        if w <= 0 || h <= 0 {
            return;
        }

        for inset in 0..BOX_THICKNESS {
            let (iw, ih) = (w - 2 * inset, h - 2 * inset);
            if iw <= 0 || ih <= 0 {
                break;
            }
            let rect = Rect::at(x + inset, y + inset).of_size(iw as u32, ih as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(LABEL_SCALE);
        let (text_w, text_h) = text_size(scale, font, &label.text);
        // Above the box when there is room, otherwise inside its top edge.
        let text_y = if y >= text_h as i32 + 4 { y - text_h as i32 - 4 } else { y + 2 };
        let band = Rect::at(x, text_y).of_size(text_w + 4, text_h + 4);
        draw_filled_rect_mut(canvas, band, color);
        draw_text_mut(canvas, TEXT_COLOR, x + 2, text_y + 2, scale, font, &label.text);
    }

    /// A 640x480 black frame with `message` centred and a hint line below.
    pub fn placeholder(&self, message: &str, sequence: u64) -> Result<EncodedFrame, EncodeError> {
        let mut canvas = RgbImage::new(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
        if let Some(font) = &self.font {
            let centre_y = PLACEHOLDER_HEIGHT as i32 / 2;
            self.draw_centred(&mut canvas, font, message, MESSAGE_SCALE, TEXT_COLOR, centre_y - 20);
            self.draw_centred(&mut canvas, font, PLACEHOLDER_HINT, HINT_SCALE, HINT_COLOR, centre_y + 20);
        }
        self.encode(&canvas, sequence, Some(message.to_string()))
    }

    fn draw_centred(&self, canvas: &mut RgbImage, font: &FontArc, text: &str, size: f32, color: Rgb<u8>, y: i32) {
        let scale = PxScale::from(size);
        let (w, h) = text_size(scale, font, text);
        let x = (canvas.width() as i32 - w as i32).max(0) / 2;
        draw_text_mut(canvas, color, x, y - h as i32 / 2, scale, font, text);
    }

    fn encode(&self, canvas: &RgbImage, sequence: u64, placeholder: Option<String>) -> Result<EncodedFrame, EncodeError> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality).encode_image(canvas)?;
        Ok(EncodedFrame {
            jpeg,
            width: canvas.width(),
            height: canvas.height(),
            sequence,
            placeholder,
        })
    }
}

fn bundled_font() -> Option<FontArc> {
    match FontArc::try_from_slice(BUNDLED_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::error!(error = %e, "bundled font unusable, text disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn decode(frame: &EncodedFrame) -> RgbImage {
        image::load_from_memory(&frame.jpeg).unwrap().to_rgb8()
    }

    #[test]
    fn test_label_text() {
        assert_eq!(Label::matched(bbox(0.0, 0.0, 1.0, 1.0), "Alice", 0.8123).text, "Alice (0.81)");
        let unknown = Label::unknown(bbox(0.0, 0.0, 1.0, 1.0));
        assert_eq!(unknown.text, "Unknown");
        assert!(!unknown.matched);
    }

    #[test]
    fn test_annotate_draws_box_colours() {
        let annotator = Annotator::with_font(None, 95);
        let frame = Frame::solid(160, 128, [0, 0, 0], Utc::now(), 7);
        // Boxes low enough that the label bands sit above them.
        let labels = vec![
            Label::matched(bbox(4.0, 60.0, 40.0, 40.0), "Alice", 0.9),
            Label::unknown(bbox(90.0, 60.0, 40.0, 40.0)),
        ];
        let encoded = annotator.annotate(&frame, &labels).unwrap();
        assert_eq!((encoded.width, encoded.height, encoded.sequence), (160, 128, 7));
        assert!(!encoded.is_placeholder());

        let img = decode(&encoded);
        let red = img.get_pixel(4, 80);
        assert!(red[0] as i32 > red[1] as i32 + 60, "expected red edge, got {red:?}");
        let green = img.get_pixel(90, 80);
        assert!(green[1] as i32 > green[0] as i32 + 60, "expected green edge, got {green:?}");
        // Interior untouched.
        assert!(img.get_pixel(24, 84)[0] < 40);
        // Label band above the matched box is filled.
        let band = img.get_pixel(6, 52);
        assert!(band[0] > 150, "expected label band, got {band:?}");
    }

    #[test]
    fn test_box_outside_frame_ignored() {
        let annotator = Annotator::with_font(None, 80);
        let frame = Frame::solid(16, 16, [0, 0, 0], Utc::now(), 0);
        let encoded = annotator.annotate(&frame, &[Label::unknown(bbox(40.0, 40.0, 10.0, 10.0))]);
        assert!(encoded.is_ok());
    }

    #[test]
    fn test_bad_frame_rejected() {
        let annotator = Annotator::with_font(None, 80);
        let mut frame = Frame::solid(4, 4, [0, 0, 0], Utc::now(), 0);
        frame.data.truncate(5);
        assert!(matches!(annotator.annotate(&frame, &[]), Err(EncodeError::BadFrame { .. })));
    }

    #[test]
    fn test_placeholder_renders_text_with_missing_font() {
        let annotator = Annotator::new(Some(Path::new("/nonexistent/font.ttf")), 80);
        assert!(annotator.has_font());
        let frame = annotator.placeholder("Camera not available", 3).unwrap();
        assert_eq!((frame.width, frame.height), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
        assert_eq!(frame.placeholder.as_deref(), Some("Camera not available"));

        let img = decode(&frame);
        let bright_in_rows = |top: u32, bottom: u32| {
            (top..bottom)
                .flat_map(|y| (0..PLACEHOLDER_WIDTH).map(move |x| (x, y)))
                .filter(|&(x, y)| img.get_pixel(x, y)[0] > 100)
                .count()
        };
        let centre = PLACEHOLDER_HEIGHT / 2;
        assert!(bright_in_rows(centre - 36, centre - 4) > 50, "message not drawn");
        assert!(bright_in_rows(centre + 8, centre + 32) > 30, "hint not drawn");
        // Corners stay black.
        assert!(img.get_pixel(2, 2)[0] < 20);
    }

    #[test]
    fn test_unconfigured_font_uses_bundled() {
        let annotator = Annotator::new(None, 80);
        assert!(annotator.has_font());
    }
}
