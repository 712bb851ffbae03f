//! Video files and network streams decoded by an `ffmpeg` child process.
//!
//! `ffprobe` reports the stream geometry, then `ffmpeg` writes raw RGB24
//! frames to a pipe. A reader thread hands complete frames over a bounded
//! channel so that every read can be bounded by a timeout.

use crate::frame::Frame;
use crate::source::{EndReason, FrameRead, FrameSource, SourceError, SourceSettings};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

const FALLBACK_FPS: f64 = 25.0;
const CHANNEL_DEPTH: usize = 2;

/// Geometry of the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Parse an ffprobe rational such as "30000/1001". "0/0" yields `None`.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if num > 0.0 && den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

fn parse_probe(json: &[u8]) -> Result<StreamInfo, String> {
    let probe: ProbeOutput = serde_json::from_slice(json).map_err(|e| format!("unreadable ffprobe output: {e}"))?;
    let stream = probe.streams.into_iter().next().ok_or("no video stream")?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no dimensions".to_string()),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(FALLBACK_FPS);
    Ok(StreamInfo { width, height, fps })
}

/// Protocol options placed before `-i` for network locators.
fn network_input_args(locator: &str, settings: &SourceSettings) -> Vec<String> {
    let micros = settings.network_open_timeout.as_micros().to_string();
    let mut args = Vec::new();
    if locator.starts_with("rtsp://") || locator.starts_with("rtsps://") {
        if settings.rtsp_tcp {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend(["-timeout".to_string(), micros]);
    } else {
        args.extend(["-rw_timeout".to_string(), micros]);
    }
    args
}

/// Wait for a child to exit, killing it past `deadline`.
fn wait_with_deadline(mut child: Child, timeout: Duration) -> Result<std::process::Output, SourceError> {
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::OpenTimeout(String::new()));
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn probe(locator: &str, input_args: &[String], settings: &SourceSettings, timeout: Duration) -> Result<StreamInfo, SourceError> {
    let child = Command::new(&settings.ffprobe_bin)
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height,avg_frame_rate,r_frame_rate", "-of", "json"])
        .args(input_args)
        .arg(locator)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SourceError::OpenFailed {
            locator: locator.to_string(),
            reason: format!("cannot run {}: {e}", settings.ffprobe_bin),
        })?;

    let output = wait_with_deadline(child, timeout).map_err(|e| match e {
        SourceError::OpenTimeout(_) => SourceError::OpenTimeout(locator.to_string()),
        other => other,
    })?;

    if !output.status.success() {
        return Err(SourceError::OpenFailed {
            locator: locator.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_probe(&output.stdout).map_err(|reason| SourceError::OpenFailed {
        locator: locator.to_string(),
        reason,
    })
}

/// How frame timestamps are assigned.
#[derive(Debug, Clone, Copy)]
enum Clock {
    /// Wall clock at arrival.
    Live,
    /// `start + sequence / fps`, so a file replays with the same timeline.
    Media { start: DateTime<Utc>, frame_interval_us: i64 },
}

type Chunk = Result<Vec<u8>, EndReason>;

/// A decoded file or network stream.
pub struct FfmpegStream {
    child: Child,
    frames: Receiver<Chunk>,
    info: StreamInfo,
    clock: Clock,
    read_timeout: Duration,
    sequence: u64,
    label: String,
    finished: bool,
}

impl FfmpegStream {
    pub fn open_file(path: &Path, settings: &SourceSettings) -> Result<Self, SourceError> {
        let locator = path.to_string_lossy().into_owned();
        // Local files have no transport to stall on; the read timeout bounds the probe.
        let info = probe(&locator, &[], settings, settings.read_timeout)?;
        let frame_interval_us = (1_000_000.0 / info.fps).round() as i64;
        let clock = Clock::Media { start: Utc::now(), frame_interval_us };
        Self::spawn(&locator, Vec::new(), info, clock, settings)
    }

    pub fn open_network(url: &str, settings: &SourceSettings) -> Result<Self, SourceError> {
        let input_args = network_input_args(url, settings);
        let info = probe(url, &input_args, settings, settings.network_open_timeout)?;
        Self::spawn(url, input_args, info, Clock::Live, settings)
    }

    fn spawn(
        locator: &str,
        input_args: Vec<String>,
        info: StreamInfo,
        clock: Clock,
        settings: &SourceSettings,
    ) -> Result<Self, SourceError> {
        let mut child = Command::new(&settings.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(&input_args)
            .arg("-i")
            .arg(locator)
            .args(["-an", "-vsync", "0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceError::OpenFailed {
                locator: locator.to_string(),
                reason: format!("cannot run {}: {e}", settings.ffmpeg_bin),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| SourceError::OpenFailed {
            locator: locator.to_string(),
            reason: "ffmpeg stdout not captured".to_string(),
        })?;

        let frame_len = info.width as usize * info.height as usize * 3;
        let (tx, rx) = mpsc::sync_channel::<Chunk>(CHANNEL_DEPTH);
        let reader = thread::Builder::new()
            .name("facewatch-ffmpeg-reader".into())
            .spawn(move || read_frames(stdout, frame_len, tx));
        if let Err(e) = reader {
            reap(&mut child);
            return Err(e.into());
        }

        tracing::info!(
            locator,
            width = info.width,
            height = info.height,
            fps = info.fps,
            "ffmpeg stream opened"
        );

        Ok(Self {
            child,
            frames: rx,
            info,
            clock,
            read_timeout: settings.read_timeout,
            sequence: 0,
            label: locator.to_string(),
            finished: false,
        })
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    fn timestamp(&self) -> DateTime<Utc> {
        match self.clock {
            Clock::Live => Utc::now(),
            Clock::Media { start, frame_interval_us } => media_timestamp(start, frame_interval_us, self.sequence),
        }
    }
}

/// `start + sequence * interval`, saturating at the latest representable
/// instant.
fn media_timestamp(start: DateTime<Utc>, frame_interval_us: i64, sequence: u64) -> DateTime<Utc> {
    i64::try_from(sequence)
        .ok()
        .and_then(|seq| seq.checked_mul(frame_interval_us))
        .map(ChronoDuration::microseconds)
        .and_then(|offset| start.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Kill the child and collect its exit status.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Reader thread body: forward whole frames until EOF, error, or the
/// receiving side hangs up.
fn read_frames(mut stdout: impl Read, frame_len: usize, tx: SyncSender<Chunk>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        let chunk = match read_full(&mut stdout, &mut buf) {
            Ok(true) => Ok(buf),
            Ok(false) => Err(EndReason::Exhausted),
            Err(e) => Err(EndReason::ReadFailed(e.to_string())),
        };
        let last = chunk.is_err();
        if tx.send(chunk).is_err() || last {
            return;
        }
    }
}

/// Fill `buf` completely. `Ok(false)` on a clean EOF before the first byte;
/// a partial trailing frame also counts as EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled > 0 {
                    tracing::debug!(filled, expected = buf.len(), "discarding partial trailing frame");
                }
                return Ok(false);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl FrameSource for FfmpegStream {
    fn next_frame(&mut self) -> FrameRead {
        if self.finished {
            return FrameRead::EndOfStream(EndReason::Exhausted);
        }
        let reason = match self.frames.recv_timeout(self.read_timeout) {
            Ok(Ok(data)) => {
                let frame = Frame {
                    data,
                    width: self.info.width,
                    height: self.info.height,
                    timestamp: self.timestamp(),
                    sequence: self.sequence,
                };
                self.sequence += 1;
                return FrameRead::Frame(frame);
            }
            Ok(Err(reason)) => reason,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(source = %self.label, timeout = ?self.read_timeout, "no frame within read timeout");
                EndReason::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => EndReason::Exhausted,
        };
        self.finished = true;
        FrameRead::EndOfStream(reason)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        reap(&mut self.child);
        tracing::debug!(source = %self.label, frames = self.sequence, "ffmpeg stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt;

    const STUB_FFPROBE_JSON: &str = r#"{"streams":[{"width":4,"height":2,"avg_frame_rate":"25/1"}]}"#;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Settings whose ffprobe reports a 4x2 stream and whose ffmpeg runs `ffmpeg_body`.
    fn stub_settings(dir: &Path, ffmpeg_body: &str) -> SourceSettings {
        SourceSettings {
            ffprobe_bin: write_script(dir, "ffprobe", &format!("echo '{STUB_FFPROBE_JSON}'")),
            ffmpeg_bin: write_script(dir, "ffmpeg", ffmpeg_body),
            read_timeout: Duration::from_millis(300),
            network_open_timeout: Duration::from_secs(5),
            ..SourceSettings::default()
        }
    }

    fn process_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("12"), Some(12.0));
        assert_eq!(parse_rate("n/a"), None);
    }

    #[test]
    fn test_parse_probe() {
        let json = br#"{"streams":[{"width":1280,"height":720,"avg_frame_rate":"0/0","r_frame_rate":"30/1"}]}"#;
        assert_eq!(parse_probe(json).unwrap(), StreamInfo { width: 1280, height: 720, fps: 30.0 });

        let no_rate = br#"{"streams":[{"width":640,"height":480}]}"#;
        assert_eq!(parse_probe(no_rate).unwrap().fps, FALLBACK_FPS);

        assert!(parse_probe(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe(br#"{}"#).is_err());
        assert!(parse_probe(b"garbage").is_err());
    }

    #[test]
    fn test_network_args() {
        let settings = SourceSettings {
            network_open_timeout: Duration::from_secs(3),
            ..SourceSettings::default()
        };
        assert_eq!(
            network_input_args("rtsp://cam/stream", &settings),
            vec!["-rtsp_transport", "tcp", "-timeout", "3000000"]
        );
        assert_eq!(network_input_args("rtmp://host/live", &settings), vec!["-rw_timeout", "3000000"]);

        let udp = SourceSettings { rtsp_tcp: false, ..settings };
        assert_eq!(network_input_args("rtsp://cam/stream", &udp), vec!["-timeout", "3000000"]);
    }

    #[test]
    fn test_reader_splits_frames_and_drops_partial_tail() {
        // Three whole 6-byte frames plus 4 trailing bytes.
        let data: Vec<u8> = (0..22).collect();
        let (tx, rx) = mpsc::sync_channel(8);
        read_frames(Cursor::new(data), 6, tx);

        let chunks: Vec<Chunk> = rx.iter().collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].as_ref().unwrap(), &vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(chunks[2].as_ref().unwrap(), &vec![12, 13, 14, 15, 16, 17]);
        assert_eq!(chunks[3], Err(EndReason::Exhausted));
    }

    #[test]
    fn test_stalled_stream_times_out_and_child_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = stub_settings(dir.path(), "exec sleep 30");
        let mut stream = FfmpegStream::open_network("rtsp://camera.local/stream", &settings).unwrap();
        assert_eq!(stream.info(), StreamInfo { width: 4, height: 2, fps: 25.0 });
        let pid = stream.child.id();
        assert!(process_alive(pid));

        let started = Instant::now();
        assert!(matches!(stream.next_frame(), FrameRead::EndOfStream(EndReason::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(5));
        // Stays ended.
        assert!(matches!(stream.next_frame(), FrameRead::EndOfStream(_)));

        drop(stream);
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_file_frames_carry_media_time() {
        let dir = tempfile::tempdir().unwrap();
        // Two whole 4x2 RGB frames, then exit.
        let settings = stub_settings(dir.path(), "head -c 48 /dev/zero");
        let mut stream = FfmpegStream::open_file(Path::new("clip.mp4"), &settings).unwrap();

        let first = match stream.next_frame() {
            FrameRead::Frame(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        };
        let second = match stream.next_frame() {
            FrameRead::Frame(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        };
        assert_eq!((first.width, first.height, first.data.len()), (4, 2, 24));
        assert_eq!(second.sequence, 1);
        assert_eq!(second.timestamp - first.timestamp, ChronoDuration::milliseconds(40));
        assert!(matches!(stream.next_frame(), FrameRead::EndOfStream(EndReason::Exhausted)));
    }

    #[test]
    fn test_media_timestamp_past_i32_frames() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(media_timestamp(start, 40_000, 3), start + ChronoDuration::milliseconds(120));
        let far = media_timestamp(start, 40_000, 3_000_000_000);
        assert_eq!(far, start + ChronoDuration::seconds(120_000_000));
        assert_eq!(media_timestamp(start, 40_000, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_reap_kills_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        reap(&mut child);
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_missing_ffprobe_reported_as_open_failure() {
        let settings = SourceSettings {
            ffprobe_bin: "/nonexistent/ffprobe".to_string(),
            ..SourceSettings::default()
        };
        let err = FfmpegStream::open_network("rtsp://127.0.0.1:1/none", &settings).err().unwrap();
        assert!(matches!(err, SourceError::OpenFailed { .. }));
    }
}
