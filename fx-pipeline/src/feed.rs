//! Standalone frame feed: decode a file and push every frame through the
//! effect engine, no encoder involved.

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecCallback, CodecEvent, CodecRole, MediaBackend, PipelineEvent},
    decoder::{DecodedOutput, DecoderStage},
    engine::{Effect, EngineAdapter, FrameTransformEngine, pack_yvu},
    error::{TranscodeError, TranscodeResult},
    frame::RawFrame,
    geometry::MediaGeometry,
    input::{SourceReader, TrackSelector},
    surface::Surface,
};

pub const FEED_BUFFERS: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed set of owned frame buffers, filled round-robin and addressed by
/// position. A slot is only overwritten after every other slot was filled.
pub struct FrameRing<const N: usize> {
    slots: [Vec<u8>; N],
    next: usize,
    filled: u64,
}

impl<const N: usize> FrameRing<N> {
    pub fn new() -> Self {
        const { assert!(N > 0, "ring needs at least one slot") };
        Self {
            slots: std::array::from_fn(|_| Vec::new()),
            next: 0,
            filled: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Packs `frame` into the next slot and returns that slot's position.
    pub fn fill(&mut self, frame: &RawFrame) -> usize {
        let pos = self.next;
        pack_yvu(frame, &mut self.slots[pos]);
        self.next = (pos + 1) % N;
        self.filled += 1;
        pos
    }

    pub fn slot(&self, pos: usize) -> Option<&[u8]> {
        self.slots.get(pos).map(Vec::as_slice)
    }

    pub fn filled(&self) -> u64 {
        self.filled
    }
}

impl<const N: usize> Default for FrameRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedConfig {
    pub input: String,
    pub effect: Effect,
    /// Fixed clockwise rotation applied to every frame, whatever the source says.
    pub rotation: i32,
    pub video_mime: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub frames: u64,
    pub cancelled: bool,
}

/// Decodes one source and hands its frames to an engine rendering onto
/// `surface`.
pub struct FrameFeeder {
    backend: Arc<dyn MediaBackend>,
    config: FeedConfig,
    engine: Box<dyn FrameTransformEngine>,
    surface: Surface,
}

impl FrameFeeder {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        config: FeedConfig,
        engine: Box<dyn FrameTransformEngine>,
        surface: Surface,
    ) -> Self {
        Self {
            backend,
            config,
            engine,
            surface,
        }
    }

    pub fn run(self, cancel: &CancellationToken) -> TranscodeResult<FeedReport> {
        let Self {
            backend,
            config,
            engine,
            surface,
        } = self;
        let selector = TrackSelector::Mime(config.video_mime.clone());
        let (mut reader, source) = SourceReader::open(&*backend, &config.input, &selector)?;
        let geometry = MediaGeometry::new(
            source.width,
            source.height,
            config.rotation,
            source.frame_rate,
            source.duration_us,
        );

        let (tx, rx) = mpsc::channel();
        let mut decoder = DecoderStage::new();
        decoder.configure(
            &*backend,
            reader.format(),
            CodecCallback::new(CodecRole::Decoder, tx),
        )?;
        let mut engine = EngineAdapter::bind(engine, &config.effect, surface, &geometry)?;
        decoder.start()?;
        log::info!(
            "feed {} started, rotation {}",
            config.input,
            geometry.rotation_degrees
        );

        let mut ring = FrameRing::<FEED_BUFFERS>::new();
        let mut report = FeedReport::default();
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let event = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(PipelineEvent::Decoder(event)) => event,
                Ok(PipelineEvent::Encoder(_)) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(TranscodeError::Aborted(
                        "decoder event channel closed".into(),
                    ));
                }
            };
            match event {
                CodecEvent::InputAvailable(index) => {
                    decoder.on_input_available(index, &mut reader)?
                }
                CodecEvent::OutputAvailable { index, info } => {
                    match decoder.on_output_available(index, info)? {
                        DecodedOutput::Frame(frame) => {
                            let pos = ring.fill(&frame);
                            decoder.release_output(index)?;
                            let data = ring.slot(pos).unwrap_or_default();
                            engine.submit_packed(data, &frame)?;
                        }
                        DecodedOutput::EndOfStream => break,
                        DecodedOutput::Empty => {}
                    }
                }
                CodecEvent::OutputFormatChanged(_) => {}
                CodecEvent::Error(message) => return Err(decoder.on_error(message)),
            }
        }

        report.frames = engine.submitted();
        engine.release();
        decoder.release();
        reader.release();
        log::info!(
            "feed {} stopped after {} frames{}",
            config.input,
            report.frames,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }
}

/// Runs at most one feed at a time on the blocking pool.
pub struct FeedTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<TranscodeResult<FeedReport>>>,
}

impl FeedTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Starts `feeder`, stopping the running feed first. Returns how the
    /// previous feed ended, if there was one.
    pub async fn start(&mut self, feeder: FrameFeeder) -> Option<TranscodeResult<FeedReport>> {
        let previous = self.stop().await;
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        self.handle = Some(tokio::task::spawn_blocking(move || feeder.run(&cancel)));
        previous
    }

    pub async fn stop(&mut self) -> Option<TranscodeResult<FeedReport>> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the running feed to end on its own.
    pub async fn wait(&mut self) -> Option<TranscodeResult<FeedReport>> {
        let handle = self.handle.as_mut()?;
        let joined = handle.await;
        self.handle = None;
        Some(
            joined
                .map_err(|e| TranscodeError::Aborted(format!("feed task: {}", e)))
                .and_then(|r| r),
        )
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for FeedTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::frame::Plane;
    use crate::testing::{FakeBackend, FakeEngine, FakeSource};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn frame(luma: u8) -> RawFrame {
        RawFrame {
            planes: [
                Plane::new(vec![luma; 4], 2, 1),
                Plane::new(vec![1u8], 1, 1),
                Plane::new(vec![2u8], 1, 1),
            ],
            width: 2,
            height: 2,
            presentation_time_us: 0,
        }
    }

    fn config(rotation: i32) -> FeedConfig {
        FeedConfig {
            input: "clip.mp4".into(),
            effect: Effect::mask("effects/sepia"),
            rotation,
            video_mime: "video/avc".into(),
        }
    }

    fn counting_surface() -> (Surface, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let surface = Surface::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (surface, count)
    }

    #[test]
    fn ring_cycles_positions_without_aliasing() {
        let mut ring = FrameRing::<2>::new();
        assert_eq!(ring.capacity(), 2);
        assert_eq!(ring.fill(&frame(10)), 0);
        assert_eq!(ring.fill(&frame(20)), 1);
        assert_eq!(ring.slot(0), Some(&[10, 10, 10, 10, 2, 1][..]));
        assert_eq!(ring.fill(&frame(30)), 0);
        assert_eq!(ring.slot(1), Some(&[20, 20, 20, 20, 2, 1][..]));
        assert_eq!(ring.slot(0).map(|s| s[0]), Some(30));
        assert!(ring.slot(2).is_none());
        assert_eq!(ring.filled(), 3);
    }

    #[test]
    fn feeds_every_frame_with_fixed_rotation() -> anyhow::Result<()> {
        let backend = Arc::new(FakeBackend::new(
            FakeSource::new(12).video_track(640, 480, 30.0),
        ));
        let engine = FakeEngine::new();
        let log = engine.log();
        let (surface, presented) = counting_surface();
        let feeder = FrameFeeder::new(backend.clone(), config(270), Box::new(engine), surface);
        let report = feeder.run(&CancellationToken::new())?;

        assert_eq!(report, FeedReport { frames: 12, cancelled: false });
        assert_eq!(presented.load(Ordering::SeqCst), 12);
        let log = log.lock().unwrap();
        assert_eq!(log.surface, Some((480, 640)));
        assert!(log.frames.iter().all(|f| f.orientation == 270));
        assert_eq!(log.released, 1);
        assert_eq!(backend.counters().writers_created(), 0);
        assert_eq!(backend.counters().decoder_released(), 1);
        Ok(())
    }

    #[test]
    fn cancelled_feed_stops_early() -> anyhow::Result<()> {
        let backend = Arc::new(FakeBackend::new(
            FakeSource::new(12).video_track(64, 64, 30.0),
        ));
        let (surface, presented) = counting_surface();
        let feeder = FrameFeeder::new(backend, config(0), Box::new(FakeEngine::new()), surface);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = feeder.run(&cancel)?;
        assert!(report.cancelled);
        assert_eq!(report.frames, 0);
        assert_eq!(presented.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn missing_track_fails_the_feed() {
        let backend = Arc::new(FakeBackend::new(FakeSource::new(0)));
        let (surface, _) = counting_surface();
        let feeder = FrameFeeder::new(backend, config(0), Box::new(FakeEngine::new()), surface);
        let err = feeder.run(&CancellationToken::new()).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::NoVideoTrack));
    }

    #[tokio::test]
    async fn starting_a_feed_stops_the_previous_one() -> anyhow::Result<()> {
        let backend = Arc::new(FakeBackend::new(
            FakeSource::new(30).video_track(64, 64, 30.0),
        ));
        let mut task = FeedTask::new();
        let (surface, _) = counting_surface();
        let first = FrameFeeder::new(backend.clone(), config(0), Box::new(FakeEngine::new()), surface);
        assert!(task.start(first).await.is_none());

        let (surface, _) = counting_surface();
        let second = FrameFeeder::new(backend, config(90), Box::new(FakeEngine::new()), surface);
        let previous = task.start(second).await;
        assert!(matches!(previous, Some(Ok(_))));

        let last = task.wait().await;
        assert!(matches!(last, Some(Ok(FeedReport { frames: 30, cancelled: false }))));
        assert!(!task.is_running());
        assert!(task.wait().await.is_none());
        Ok(())
    }
}
