//! One transcode job: source, decoder, effect engine, encoder and sink wired
//! together and driven from a single event loop.

use std::{
    path::PathBuf,
    sync::{Arc, mpsc},
};

use futures::StreamExt;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    codec::{CodecCallback, CodecEvent, CodecRole, MediaBackend, PipelineEvent},
    decoder::{DecodedOutput, DecoderStage},
    encoder::EncoderStage,
    engine::{Effect, EngineAdapter, FrameTransformEngine},
    error::{TranscodeError, TranscodeResult},
    geometry::MediaGeometry,
    input::{SourceReader, TrackSelector},
    output::SinkWriter,
    surface::Surface,
    timestamp::TimestampQueue,
};

pub const DEFAULT_VIDEO_MIME: &str = "video/avc";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobConfig {
    pub input: String,
    pub output: PathBuf,
    pub effect: Effect,
    /// Mime of the source track to pick; also the output codec.
    pub video_mime: String,
}

impl JobConfig {
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct JobConfigBuilder {
    input: Option<String>,
    output: Option<PathBuf>,
    effect: Option<Effect>,
    video_mime: Option<String>,
}

impl JobConfigBuilder {
    pub fn input(mut self, uri: impl Into<String>) -> Self {
        self.input = Some(uri.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Effect asset for the engine's mask slot.
    pub fn mask(self, path: impl Into<String>) -> Self {
        self.effect(Effect::mask(path))
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn video_mime(mut self, mime: impl Into<String>) -> Self {
        self.video_mime = Some(mime.into());
        self
    }

    pub fn build(self) -> anyhow::Result<JobConfig> {
        Ok(JobConfig {
            input: self
                .input
                .ok_or_else(|| anyhow::anyhow!("input is required"))?,
            output: self
                .output
                .ok_or_else(|| anyhow::anyhow!("output path is required"))?,
            effect: self
                .effect
                .ok_or_else(|| anyhow::anyhow!("effect is required"))?,
            video_mime: self
                .video_mime
                .unwrap_or_else(|| DEFAULT_VIDEO_MIME.to_string()),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// Percentage in [0, 100], never lower than the previous one.
    Progress(f64),
    Completed { output: PathBuf },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobReport {
    pub frames_in: u64,
    pub frames_written: u64,
    pub timestamps_pushed: u64,
    pub timestamps_popped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Running,
    Draining,
    Finished,
    Failed,
}

/// Percentage of `duration_us` covered at `presentation_time_us`, in tenths
/// of a percent. Zero when the duration is unknown.
pub fn progress_percent(presentation_time_us: i64, duration_us: i64) -> f64 {
    if duration_us <= 0 {
        return 0.0;
    }
    let per_mille = presentation_time_us.max(0).saturating_mul(1000) / duration_us;
    (per_mille as f64 / 10.0).clamp(0.0, 100.0)
}

#[derive(Clone, Copy, Debug)]
pub struct ProgressTracker {
    duration_us: i64,
    last: Option<f64>,
}

impl ProgressTracker {
    pub fn new(duration_us: i64) -> Self {
        Self {
            duration_us,
            last: None,
        }
    }

    /// New value to report for a written unit, if it moved.
    pub fn update(&mut self, presentation_time_us: i64) -> Option<f64> {
        let value = progress_percent(presentation_time_us, self.duration_us);
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }

    pub fn finish(&mut self) -> f64 {
        self.last = Some(100.0);
        100.0
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

/// Runs one job on the calling thread. Every resource it acquires sits in an
/// `Option` so teardown works from any point and any number of times.
pub struct Transcoder {
    backend: Arc<dyn MediaBackend>,
    config: JobConfig,
    pending_engine: Option<Box<dyn FrameTransformEngine>>,
    events: UnboundedSender<JobEvent>,
    state: PipelineState,
    reader: Option<SourceReader>,
    decoder: Option<DecoderStage>,
    encoder: Option<EncoderStage>,
    writer: Option<SinkWriter>,
    surface: Option<Surface>,
    engine: Option<EngineAdapter>,
    geometry: Option<MediaGeometry>,
    timestamps: TimestampQueue,
    progress: ProgressTracker,
    frames_in: u64,
    frames_written: u64,
}

fn stage<'a, T>(slot: &'a mut Option<T>, what: &str) -> TranscodeResult<&'a mut T> {
    slot.as_mut()
        .ok_or_else(|| TranscodeError::Aborted(format!("{} not available", what)))
}

impl Transcoder {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        config: JobConfig,
        engine: Box<dyn FrameTransformEngine>,
        events: UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            backend,
            config,
            pending_engine: Some(engine),
            events,
            state: PipelineState::Idle,
            reader: None,
            decoder: None,
            encoder: None,
            writer: None,
            surface: None,
            engine: None,
            geometry: None,
            timestamps: TimestampQueue::new(),
            progress: ProgressTracker::new(0),
            frames_in: 0,
            frames_written: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn geometry(&self) -> Option<MediaGeometry> {
        self.geometry
    }

    pub fn run(mut self) -> TranscodeResult<JobReport> {
        let result = self.execute();
        match &result {
            Ok(report) => {
                self.state = PipelineState::Finished;
                self.release_all();
                log::info!(
                    "job {} -> {} finished: {} frames in, {} written",
                    self.config.input,
                    self.config.output.display(),
                    report.frames_in,
                    report.frames_written
                );
                self.dispatch(JobEvent::Completed {
                    output: self.config.output.clone(),
                });
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                log::error!("job {} failed: {}", self.config.input, e);
                self.release_all();
            }
        }
        result
    }

    fn dispatch(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            log::debug!("job event dropped, caller gone");
        }
    }

    fn execute(&mut self) -> TranscodeResult<JobReport> {
        self.state = PipelineState::Configuring;
        let (tx, rx) = mpsc::channel();
        self.configure(tx)?;

        stage(&mut self.encoder, "encoder")?.start()?;
        stage(&mut self.decoder, "decoder")?.start()?;
        self.state = PipelineState::Running;
        log::info!("job {} running", self.config.input);

        loop {
            let event = rx
                .recv()
                .map_err(|_| TranscodeError::Aborted("codec event channel closed".into()))?;
            if self.handle(event)? {
                break;
            }
        }

        // Engine and codecs go first so nothing reaches the container after
        // its trailer.
        self.release_engine();
        if let Some(mut decoder) = self.decoder.take() {
            decoder.release();
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
        }
        if let Some(mut writer) = self.writer.take() {
            self.frames_written = writer.units_written();
            writer.finalize()?;
        }
        Ok(JobReport {
            frames_in: self.frames_in,
            frames_written: self.frames_written,
            timestamps_pushed: self.timestamps.pushed(),
            timestamps_popped: self.timestamps.popped(),
        })
    }

    fn configure(&mut self, tx: mpsc::Sender<PipelineEvent>) -> TranscodeResult<()> {
        let backend = self.backend.clone();
        let selector = TrackSelector::Mime(self.config.video_mime.clone());
        let (reader, geometry) = SourceReader::open(&*backend, &self.config.input, &selector)?;
        let format = reader.format().clone();
        self.reader = Some(reader);
        self.geometry = Some(geometry);
        self.progress = ProgressTracker::new(geometry.duration_us);

        let mut decoder = DecoderStage::new();
        let configured =
            decoder.configure(&*backend, &format, CodecCallback::new(CodecRole::Decoder, tx.clone()));
        self.decoder = Some(decoder);
        configured?;

        let encoder = EncoderStage::configure(
            &*backend,
            &self.config.video_mime,
            &geometry,
            CodecCallback::new(CodecRole::Encoder, tx),
        )?;
        let encoder = self.encoder.insert(encoder);
        self.surface = Some(encoder.create_input_surface()?);

        self.writer = Some(SinkWriter::open(&*backend, &self.config.output)?);

        let engine = self
            .pending_engine
            .take()
            .ok_or_else(|| TranscodeError::EngineInitFailure("engine already used".into()))?;
        let surface = self
            .surface
            .take()
            .ok_or_else(|| TranscodeError::EngineInitFailure("no encoder surface".into()))?;
        self.engine = Some(EngineAdapter::bind(
            engine,
            &self.config.effect,
            surface,
            &geometry,
        )?);
        Ok(())
    }

    /// Returns true once the encoder has delivered end of stream.
    fn handle(&mut self, event: PipelineEvent) -> TranscodeResult<bool> {
        match event {
            PipelineEvent::Decoder(event) => {
                self.on_decoder_event(event)?;
                Ok(false)
            }
            PipelineEvent::Encoder(event) => self.on_encoder_event(event),
        }
    }

    fn on_decoder_event(&mut self, event: CodecEvent) -> TranscodeResult<()> {
        match event {
            CodecEvent::InputAvailable(index) => {
                let reader = stage(&mut self.reader, "source reader")?;
                stage(&mut self.decoder, "decoder")?.on_input_available(index, reader)
            }
            CodecEvent::OutputAvailable { index, info } => {
                let decoder = stage(&mut self.decoder, "decoder")?;
                match decoder.on_output_available(index, info)? {
                    DecodedOutput::Frame(frame) => {
                        self.timestamps.push(frame.presentation_time_us);
                        self.frames_in += 1;
                        let submitted = stage(&mut self.engine, "engine")?.submit(&frame);
                        stage(&mut self.decoder, "decoder")?.release_output(index)?;
                        submitted
                    }
                    DecodedOutput::EndOfStream => {
                        self.state = PipelineState::Draining;
                        stage(&mut self.encoder, "encoder")?.signal_end_of_input()
                    }
                    DecodedOutput::Empty => Ok(()),
                }
            }
            CodecEvent::OutputFormatChanged(format) => {
                log::debug!("decoder output format {:?}", format);
                Ok(())
            }
            CodecEvent::Error(message) => {
                Err(stage(&mut self.decoder, "decoder")?.on_error(message))
            }
        }
    }

    fn on_encoder_event(&mut self, event: CodecEvent) -> TranscodeResult<bool> {
        match event {
            CodecEvent::OutputFormatChanged(format) => {
                let writer = stage(&mut self.writer, "sink writer")?;
                stage(&mut self.encoder, "encoder")?.on_output_format_changed(format, writer)?;
                Ok(false)
            }
            CodecEvent::OutputAvailable { index, info } => {
                let writer = stage(&mut self.writer, "sink writer")?;
                let outcome = stage(&mut self.encoder, "encoder")?.on_output_available(
                    index,
                    info,
                    &mut self.timestamps,
                    writer,
                )?;
                if outcome.end_of_stream {
                    self.check_drained()?;
                    let done = self.progress.finish();
                    self.dispatch(JobEvent::Progress(done));
                    return Ok(true);
                }
                if outcome.written {
                    if let Some(progress) = self.progress.update(outcome.presentation_time_us) {
                        self.dispatch(JobEvent::Progress(progress));
                    }
                }
                Ok(false)
            }
            CodecEvent::InputAvailable(index) => {
                log::debug!("encoder input slot {} ignored, input is the surface", index);
                Ok(false)
            }
            CodecEvent::Error(message) => {
                Err(stage(&mut self.encoder, "encoder")?.on_error(message))
            }
        }
    }

    /// Every frame that entered the engine must have come back as exactly one
    /// encoded unit by the time the encoder reports end of stream.
    fn check_drained(&mut self) -> TranscodeResult<()> {
        let units_out = stage(&mut self.encoder, "encoder")?.units_out();
        if !self.timestamps.is_empty() || units_out != self.frames_in {
            return Err(TranscodeError::Desync(format!(
                "encoder ended with {} of {} frames encoded, {} timestamps pending",
                units_out,
                self.frames_in,
                self.timestamps.len()
            )));
        }
        Ok(())
    }

    fn release_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.release();
        }
    }

    /// Releases whatever is still held. On failure the container finalize is
    /// attempted first.
    pub fn release_all(&mut self) {
        if self.state == PipelineState::Failed {
            if let Some(mut writer) = self.writer.take() {
                if let Err(e) = writer.finalize() {
                    log::warn!("finalize after failure: {}", e);
                }
            }
        }
        self.release_engine();
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        if let Some(mut decoder) = self.decoder.take() {
            decoder.release();
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::warn!("finalize on release: {}", e);
            }
        }
        if let Some(mut reader) = self.reader.take() {
            reader.release();
        }
        self.timestamps.clear();
        self.pending_engine = None;
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Entry point for running jobs on the tokio blocking pool.
#[derive(Clone)]
pub struct VideoProcessor {
    backend: Arc<dyn MediaBackend>,
}

impl VideoProcessor {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }

    /// Starts a job on its own thread. Must be called inside a tokio runtime.
    pub fn process_video(
        &self,
        config: JobConfig,
        engine: Box<dyn FrameTransformEngine>,
    ) -> JobHandle {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        log::info!(
            "job {} -> {} with effect {}={}",
            config.input,
            config.output.display(),
            config.effect.slot,
            config.effect.path
        );
        let transcoder = Transcoder::new(self.backend.clone(), config, engine, tx);
        let task = tokio::task::spawn_blocking(move || transcoder.run());
        JobHandle {
            events: UnboundedReceiverStream::new(rx),
            task,
        }
    }
}

pub struct JobHandle {
    events: UnboundedReceiverStream<JobEvent>,
    task: JoinHandle<TranscodeResult<JobReport>>,
}

impl JobHandle {
    /// Next progress or completion event; `None` once the job thread is done.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.next().await
    }

    pub async fn wait(self) -> TranscodeResult<JobReport> {
        self.task
            .await
            .map_err(|e| TranscodeError::Aborted(format!("job task: {}", e)))?
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
