//! Pipeline driver: frame in, annotated JPEG out, identification events on
//! the side.
//!
//! One run owns one frame source, one face analyzer and one gallery
//! snapshot, and walks `Starting → Streaming → Draining → Closed`. A run
//! that cannot start, or fails for a reason other than a bad frame, emits a
//! single placeholder frame and closes. Each run executes synchronously on
//! its caller's thread; [`Pipeline::spawn`] gives it a dedicated one.

use crate::consumer::FrameConsumer;
use facewatch_core::{
    AnalysisError, CooldownGate, DetectorSettings, EuclideanMatcher, FaceAnalyzer, GallerySnapshot,
    IdentificationEvent, MatchOutcome, Matcher, OnnxFaceAnalyzer, SourceKind,
};
use facewatch_store::{EventLog, GalleryStore, StoreError};
use facewatch_video::{
    open_source, Annotator, DeviceLeases, EncodeError, EncodedFrame, EndReason, Frame, FrameRead, FrameSource, Label,
    SourceError, SourceSettings, VideoSource,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const INTERNAL_ERROR_MESSAGE: &str = "Internal error";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("gallery unavailable: {0}")]
    Gallery(#[source] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("face analyzer unavailable: {0}")]
    Analyzer(#[from] AnalysisError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl PipelineError {
    /// Short operator-facing text for the placeholder frame.
    pub fn placeholder_message(&self) -> String {
        match self {
            PipelineError::Source(SourceError::Inactive) => "Video source is inactive".to_string(),
            PipelineError::Source(SourceError::NotFound(_)) => "Video file not found".to_string(),
            PipelineError::Source(SourceError::DeviceBusy(index)) => format!("Camera {index} is in use"),
            PipelineError::Source(
                SourceError::DeviceNotFound(_) | SourceError::NoSignal { .. } | SourceError::NoUsableDevice { .. },
            ) => "Camera not available".to_string(),
            PipelineError::Source(SourceError::OpenTimeout(_)) => "Video stream timed out".to_string(),
            PipelineError::Source(_) => "Unable to open video source".to_string(),
            PipelineError::Gallery(_) => "Identity gallery unavailable".to_string(),
            PipelineError::Analyzer(_) => "Face models unavailable".to_string(),
            PipelineError::Encode(_) => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Streaming,
    Draining,
    Closed,
    /// The run could not even report its failure: the placeholder could not
    /// be produced.
    Errored,
}

/// Opens frame sources for a run.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Opens real devices, files and streams, sharing device leases between
/// runs.
pub struct SystemSources {
    settings: SourceSettings,
    leases: DeviceLeases,
}

impl SystemSources {
    pub fn new(settings: SourceSettings, leases: DeviceLeases) -> Self {
        Self { settings, leases }
    }
}

impl SourceOpener for SystemSources {
    fn open(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SourceError> {
        open_source(source, &self.settings, &self.leases)
    }
}

/// Creates the face analyzer for a run.
pub trait AnalyzerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>, AnalysisError>;
}

/// Loads the SCRFD + ArcFace pair from disk for every run.
pub struct OnnxModels {
    pub detector_path: String,
    pub recognizer_path: String,
    pub settings: DetectorSettings,
}

impl AnalyzerFactory for OnnxModels {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>, AnalysisError> {
        let analyzer = OnnxFaceAnalyzer::load(&self.detector_path, &self.recognizer_path, self.settings)?;
        tracing::debug!(detector = %self.detector_path, recognizer = %self.recognizer_path, "face models loaded");
        Ok(Box::new(analyzer))
    }
}

/// Per-request parameters.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub source: VideoSource,
    /// Recorded on events; defaults to the opened source's description.
    pub source_ref: Option<String>,
    pub cooldown_window: Duration,
    pub match_tolerance: f32,
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: Uuid,
    /// Every state entered, in order.
    pub states: Vec<PipelineState>,
    pub frames_emitted: u64,
    pub placeholders_emitted: u64,
    /// Frames dropped because detection failed on them.
    pub frames_skipped: u64,
    pub events_logged: u64,
    /// Events the gate allowed but the event log refused.
    pub events_dropped: u64,
    pub end_reason: Option<EndReason>,
}

impl PipelineReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            states: Vec::new(),
            frames_emitted: 0,
            placeholders_emitted: 0,
            frames_skipped: 0,
            events_logged: 0,
            events_dropped: 0,
            end_reason: None,
        }
    }

    pub fn final_state(&self) -> Option<PipelineState> {
        self.states.last().copied()
    }

    fn enter(&mut self, state: PipelineState) {
        tracing::debug!(?state, "pipeline state");
        self.states.push(state);
    }
}

/// Shared dependencies of every run. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    gallery: Arc<dyn GalleryStore>,
    events: Arc<dyn EventLog>,
    sources: Arc<dyn SourceOpener>,
    analyzers: Arc<dyn AnalyzerFactory>,
    annotator: Arc<Annotator>,
    shared_gate: Option<Arc<CooldownGate>>,
}

/// State held for the duration of `Streaming`.
struct Run<'p> {
    params: &'p PipelineParams,
    gallery: GallerySnapshot,
    gate: Arc<CooldownGate>,
    source_kind: SourceKind,
    source_ref: String,
}

impl Pipeline {
    pub fn new(
        gallery: Arc<dyn GalleryStore>,
        events: Arc<dyn EventLog>,
        sources: Arc<dyn SourceOpener>,
        analyzers: Arc<dyn AnalyzerFactory>,
        annotator: Arc<Annotator>,
    ) -> Self {
        Self {
            gallery,
            events,
            sources,
            analyzers,
            annotator,
            shared_gate: None,
        }
    }

    /// Use one cooldown gate for every run instead of a fresh gate per run.
    pub fn with_shared_gate(mut self, gate: Arc<CooldownGate>) -> Self {
        self.shared_gate = Some(gate);
        self
    }

    /// Run on a dedicated thread.
    pub fn spawn<C>(&self, params: PipelineParams, mut consumer: C) -> std::io::Result<JoinHandle<PipelineReport>>
    where
        C: FrameConsumer + Send + 'static,
    {
        let pipeline = self.clone();
        std::thread::Builder::new()
            .name("facewatch-pipeline".into())
            .spawn(move || pipeline.run(&params, &mut consumer))
    }

    /// Drive one run to completion.
    pub fn run(&self, params: &PipelineParams, consumer: &mut dyn FrameConsumer) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline", run_id = %run_id, kind = ?params.source.kind, locator = %params.source.locator);
        let _guard = span.enter();

        let mut report = PipelineReport::new(run_id);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.drive(params, consumer, &mut report)));
        if outcome.is_err() {
            tracing::error!("pipeline panicked");
            if report.placeholders_emitted == 0 {
                let fallback = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    self.emit_placeholder(INTERNAL_ERROR_MESSAGE, consumer, &mut report)
                }));
                if fallback.is_err() {
                    report.enter(PipelineState::Errored);
                }
            } else {
                report.enter(PipelineState::Closed);
            }
        }

        tracing::info!(
            state = ?report.final_state(),
            frames = report.frames_emitted,
            events = report.events_logged,
            dropped_events = report.events_dropped,
            skipped_frames = report.frames_skipped,
            "pipeline finished"
        );
        report
    }

    /// Refuse a request that could not be turned into parameters: one
    /// placeholder carrying `message`, then close.
    pub fn reject(&self, message: &str, consumer: &mut dyn FrameConsumer) -> PipelineReport {
        let mut report = PipelineReport::new(Uuid::new_v4());
        report.enter(PipelineState::Starting);
        tracing::warn!(run_id = %report.run_id, message, "pipeline request rejected");
        self.emit_placeholder(message, consumer, &mut report);
        report
    }

    fn drive(&self, params: &PipelineParams, consumer: &mut dyn FrameConsumer, report: &mut PipelineReport) {
        report.enter(PipelineState::Starting);
        let (mut source, mut analyzer, gallery) = match self.start(params) {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline failed to start");
                self.emit_placeholder(&e.placeholder_message(), consumer, report);
                return;
            }
        };

        let run = Run {
            params,
            gallery,
            gate: self.shared_gate.clone().unwrap_or_default(),
            source_kind: params.source.kind.event_kind(),
            source_ref: params.source_ref.clone().unwrap_or_else(|| source.describe()),
        };
        tracing::info!(source = %source.describe(), gallery = run.gallery.len(), "streaming");
        report.enter(PipelineState::Streaming);

        loop {
            if !consumer.is_connected() {
                tracing::info!("consumer disconnected, closing");
                report.enter(PipelineState::Closed);
                return;
            }

            let frame = match source.next_frame() {
                FrameRead::Frame(frame) => frame,
                FrameRead::EndOfStream(reason) => {
                    tracing::info!(?reason, "end of stream");
                    report.end_reason = Some(reason);
                    break;
                }
            };

            let encoded = match self.process_frame(&frame, analyzer.as_mut(), &run, report) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, sequence = frame.sequence, "pipeline failed mid-stream");
                    drop(source);
                    self.emit_placeholder(&e.placeholder_message(), consumer, report);
                    return;
                }
            };

            if consumer.emit(encoded).is_err() {
                tracing::info!("consumer went away during emit, closing");
                report.enter(PipelineState::Closed);
                return;
            }
            report.frames_emitted += 1;
        }

        report.enter(PipelineState::Draining);
        drop(source);
        tracing::debug!("source released");
        report.enter(PipelineState::Closed);
    }

    fn start(
        &self,
        params: &PipelineParams,
    ) -> Result<(Box<dyn FrameSource>, Box<dyn FaceAnalyzer>, GallerySnapshot), PipelineError> {
        let identities = self.gallery.load_all_identities().map_err(PipelineError::Gallery)?;
        let gallery = GallerySnapshot::from_identities(identities);
        let analyzer = self.analyzers.create()?;
        let source = self.sources.open(&params.source)?;
        Ok((source, analyzer, gallery))
    }

    /// Analyse, match, gate, log and annotate one frame. `Ok(None)` skips
    /// the frame.
    fn process_frame(
        &self,
        frame: &Frame,
        analyzer: &mut dyn FaceAnalyzer,
        run: &Run<'_>,
        report: &mut PipelineReport,
    ) -> Result<Option<EncodedFrame>, PipelineError> {
        let detections = match analyzer.analyze(&frame.data, frame.width, frame.height) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "detection failed, frame skipped");
                report.frames_skipped += 1;
                return Ok(None);
            }
        };

        let mut labels = Vec::with_capacity(detections.len());
        for detection in detections {
            match EuclideanMatcher.compare(&detection.embedding, &run.gallery, run.params.match_tolerance) {
                MatchOutcome::Matched {
                    name, confidence, distance, ..
                } => {
                    tracing::debug!(sequence = frame.sequence, identity = %name, distance, "face matched");
                    if run.gate.should_emit(&name, frame.timestamp, run.params.cooldown_window) {
                        self.log_event(&name, confidence, frame, run, report);
                    }
                    labels.push(Label::matched(detection.bbox, &name, confidence));
                }
                MatchOutcome::NoMatch { best_distance } => {
                    tracing::debug!(sequence = frame.sequence, ?best_distance, "face unknown");
                    labels.push(Label::unknown(detection.bbox));
                }
            }
        }

        Ok(Some(self.annotator.annotate(frame, &labels)?))
    }

    fn log_event(&self, name: &str, confidence: f32, frame: &Frame, run: &Run<'_>, report: &mut PipelineReport) {
        let event = IdentificationEvent {
            identity_name: name.to_string(),
            timestamp: frame.timestamp,
            source_kind: run.source_kind,
            source_ref: Some(run.source_ref.clone()),
            confidence,
        };
        match self.events.append(&event) {
            Ok(id) => {
                report.events_logged += 1;
                tracing::info!(event_id = id, identity = %name, confidence, "identification logged");
            }
            Err(e) => {
                report.events_dropped += 1;
                tracing::warn!(identity = %name, error = %e, "event log append failed, event dropped");
            }
        }
    }

    /// Emit exactly one placeholder and close. Errored if the placeholder
    /// itself cannot be produced.
    fn emit_placeholder(&self, message: &str, consumer: &mut dyn FrameConsumer, report: &mut PipelineReport) {
        match self.annotator.placeholder(message, 0) {
            Ok(frame) => {
                if consumer.emit(frame).is_ok() {
                    report.placeholders_emitted += 1;
                } else {
                    tracing::debug!("consumer gone before placeholder");
                }
                report.enter(PipelineState::Closed);
            }
            Err(e) => {
                tracing::error!(error = %e, "placeholder frame could not be encoded");
                report.enter(PipelineState::Errored);
            }
        }
    }
}
