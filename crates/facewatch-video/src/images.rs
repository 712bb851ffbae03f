//! Still images as a frame source: a single image file, or a directory of
//! images read in file-name order.

use crate::frame::Frame;
use crate::source::{EndReason, FrameRead, FrameSource, SourceError};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct ImageSequence {
    pending: VecDeque<PathBuf>,
    label: String,
    start: DateTime<Utc>,
    sequence: u64,
    finished: bool,
}

impl ImageSequence {
    /// Whether `path` is something this source reads: a directory, or a
    /// file with an image extension.
    pub fn handles(path: &Path) -> bool {
        path.is_dir() || is_image(path)
    }

    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let pending: VecDeque<PathBuf> = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            files.sort();
            files.into()
        } else {
            VecDeque::from([path.to_path_buf()])
        };

        if pending.is_empty() {
            return Err(SourceError::OpenFailed {
                locator: path.display().to_string(),
                reason: "directory contains no images".to_string(),
            });
        }
        tracing::debug!(path = %path.display(), images = pending.len(), "opened image sequence");

        Ok(Self {
            pending,
            label: path.display().to_string(),
            start: Utc::now(),
            sequence: 0,
            finished: false,
        })
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> FrameRead {
        if self.finished {
            return FrameRead::EndOfStream(EndReason::Exhausted);
        }
        let Some(path) = self.pending.pop_front() else {
            self.finished = true;
            return FrameRead::EndOfStream(EndReason::Exhausted);
        };
        match image::open(&path) {
            Ok(img) => {
                // One image per second of media time.
                let timestamp = self.start + chrono::Duration::seconds(self.sequence as i64);
                let frame = Frame::from_image(img.to_rgb8(), timestamp, self.sequence);
                self.sequence += 1;
                FrameRead::Frame(frame)
            }
            Err(e) => {
                self.finished = true;
                FrameRead::EndOfStream(EndReason::ReadFailed(format!("{}: {e}", path.display())))
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
