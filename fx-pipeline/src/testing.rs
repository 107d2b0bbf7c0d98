//! Scripted media backend and engine for driving the pipeline without ffmpeg.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;

use crate::{
    codec::{
        BufferFlags, BufferInfo, CodecCallback, ContainerWriter, DecoderCodec, Demuxer,
        EncoderCodec, EncoderFormat, FormatValue, MediaBackend, OutputFormat, TrackFormat,
    },
    engine::{EngineFrame, FrameTransformEngine},
    frame::{Plane, RawFrame, SurfaceFrame},
    surface::Surface,
};

#[derive(Default, Debug)]
pub struct Counters {
    demuxer_released: AtomicUsize,
    decoder_released: AtomicUsize,
    encoder_released: AtomicUsize,
    writer_released: AtomicUsize,
    writers_created: AtomicUsize,
    decoder_inputs: AtomicUsize,
    decoder_eos_inputs: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn demuxer_released(&self) -> usize {
        self.demuxer_released.load(Ordering::SeqCst)
    }

    pub fn decoder_released(&self) -> usize {
        self.decoder_released.load(Ordering::SeqCst)
    }

    pub fn encoder_released(&self) -> usize {
        self.encoder_released.load(Ordering::SeqCst)
    }

    pub fn writer_released(&self) -> usize {
        self.writer_released.load(Ordering::SeqCst)
    }

    pub fn writers_created(&self) -> usize {
        self.writers_created.load(Ordering::SeqCst)
    }

    pub fn decoder_inputs(&self) -> usize {
        self.decoder_inputs.load(Ordering::SeqCst)
    }

    pub fn decoder_eos_inputs(&self) -> usize {
        self.decoder_eos_inputs.load(Ordering::SeqCst)
    }
}

/// Tracks of a scripted source. The selected track yields `frames` samples.
#[derive(Clone, Debug, Default)]
pub struct FakeSource {
    tracks: Vec<TrackFormat>,
    frames: usize,
    unreadable: bool,
}

impl FakeSource {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            ..Default::default()
        }
    }

    pub fn track(mut self, format: TrackFormat) -> Self {
        self.tracks.push(format);
        self
    }

    /// An avc track with a float frame rate and a duration covering every frame.
    pub fn video_track(self, width: u32, height: u32, fps: f32) -> Self {
        let duration_us = (self.frames as f64 * 1_000_000.0 / fps as f64) as i64;
        self.track(
            TrackFormat::video("video/avc", width, height)
                .with_frame_rate(FormatValue::Float(fps as f64))
                .with_duration_us(duration_us),
        )
    }

    pub fn unreadable(mut self) -> Self {
        self.unreadable = true;
        self
    }
}

pub fn sample_time(index: usize, fps: f32) -> i64 {
    (index as f64 * 1_000_000.0 / fps as f64) as i64
}

struct FakeDemuxer {
    source: FakeSource,
    selected: Option<usize>,
    fps: f32,
    pos: usize,
    counters: Arc<Counters>,
}

impl Demuxer for FakeDemuxer {
    fn track_count(&self) -> usize {
        self.source.tracks.len()
    }

    fn track_format(&self, index: usize) -> anyhow::Result<TrackFormat> {
        self.source
            .tracks
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no track {}", index))
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        let format = self.track_format(index)?;
        self.fps = format.frame_rate.map(|r| r.as_f32()).unwrap_or(30.0);
        self.selected = Some(index);
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<Option<usize>> {
        if self.selected.is_none() || self.pos >= self.source.frames {
            return Ok(None);
        }
        buf.clear();
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(&(self.pos as u32).to_le_bytes());
        Ok(Some(buf.len()))
    }

    fn sample_time(&self) -> Option<i64> {
        (self.pos < self.source.frames).then(|| sample_time(self.pos, self.fps))
    }

    fn advance(&mut self) -> bool {
        self.pos += 1;
        self.pos < self.source.frames
    }

    fn release(&mut self) {
        Counters::bump(&self.counters.demuxer_released);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FakeDecoderScript {
    /// Frames held back before output starts flowing.
    pub latency: usize,
    /// Post a codec error instead of accepting this input unit.
    pub fail_at: Option<u64>,
}

struct FakeDecoder {
    script: FakeDecoderScript,
    callback: Option<CodecCallback>,
    width: u32,
    height: u32,
    inputs: Vec<Vec<u8>>,
    pending: VecDeque<i64>,
    outputs: HashMap<usize, Option<i64>>,
    next_output: usize,
    queued: u64,
    counters: Arc<Counters>,
}

impl FakeDecoder {
    fn emit(&mut self, pts: Option<i64>) {
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.insert(index, pts);
        let info = match pts {
            Some(pts) => BufferInfo::new(16, pts, BufferFlags::NONE),
            None => BufferInfo::end_of_stream(0),
        };
        if let Some(callback) = &self.callback {
            callback.output_available(index, info);
        }
    }
}

impl DecoderCodec for FakeDecoder {
    fn name(&self) -> &str {
        "fake.decoder"
    }

    fn configure(&mut self, format: &TrackFormat, callback: CodecCallback) -> anyhow::Result<()> {
        self.width = format.width.ok_or_else(|| anyhow::anyhow!("no width"))?;
        self.height = format.height.ok_or_else(|| anyhow::anyhow!("no height"))?;
        self.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if let Some(callback) = &self.callback {
            for index in 0..self.inputs.len() {
                callback.input_available(index);
            }
        }
        Ok(())
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.inputs.get_mut(index)
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> anyhow::Result<()> {
        if self.script.fail_at == Some(self.queued) {
            if let Some(callback) = &self.callback {
                callback.error("scripted decode error");
            }
            return Ok(());
        }
        if info.size > 0 {
            Counters::bump(&self.counters.decoder_inputs);
            self.queued += 1;
            self.pending.push_back(info.presentation_time_us);
        }
        while self.pending.len() > self.script.latency {
            let pts = self.pending.pop_front();
            self.emit(pts);
        }
        if info.flags.is_end_of_stream() {
            Counters::bump(&self.counters.decoder_eos_inputs);
            while let Some(pts) = self.pending.pop_front() {
                self.emit(Some(pts));
            }
            self.emit(None);
        } else if let Some(callback) = &self.callback {
            callback.input_available(index);
        }
        Ok(())
    }

    fn output_frame(&mut self, index: usize) -> anyhow::Result<Option<RawFrame>> {
        let Some(Some(pts)) = self.outputs.get(&index) else {
            return Ok(None);
        };
        Ok(Some(RawFrame {
            planes: [
                Plane::new(vec![b'Y'; 4], 2, 1),
                Plane::new(vec![b'U'], 1, 1),
                Plane::new(vec![b'V'], 1, 1),
            ],
            width: self.width,
            height: self.height,
            presentation_time_us: *pts,
        }))
    }

    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()> {
        self.outputs.remove(&index);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release(&mut self) {
        Counters::bump(&self.counters.decoder_released);
        self.callback = None;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FakeEncoderScript {
    /// Frames buffered inside the encoder before output starts flowing.
    pub latency: usize,
    /// Emit a codec-config unit right after the format change.
    pub codec_config_first: bool,
    /// Emit one data unit on start, before any frame was rendered.
    pub spurious_output: bool,
    /// Post a codec error when this frame (0-based) reaches the surface.
    pub fail_on_frame: Option<u64>,
    /// Swallow this frame (0-based) without ever producing a unit for it.
    pub drop_frame: Option<u64>,
}

#[derive(Default)]
struct EncoderShared {
    callback: Option<CodecCallback>,
    format: Option<EncoderFormat>,
    started: bool,
    format_posted: bool,
    pending: usize,
    outputs: HashMap<usize, Bytes>,
    next_output: usize,
    frames_in: u64,
    surface_sizes: Vec<(u32, u32)>,
}

impl EncoderShared {
    fn emit(&mut self, payload: Bytes, flags: BufferFlags) {
        let index = self.next_output;
        self.next_output += 1;
        let info = BufferInfo::new(payload.len(), -1, flags);
        self.outputs.insert(index, payload);
        if let Some(callback) = &self.callback {
            callback.output_available(index, info);
        }
    }

    fn ensure_format(&mut self, script: &FakeEncoderScript) {
        if self.format_posted {
            return;
        }
        self.format_posted = true;
        if let (Some(callback), Some(format)) = (&self.callback, &self.format) {
            callback.output_format_changed(OutputFormat::new(
                format.mime.clone(),
                format.width,
                format.height,
                format.frame_rate,
            ));
        }
        if script.codec_config_first {
            self.emit(
                Bytes::from_static(&[0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68]),
                BufferFlags::CODEC_CONFIG,
            );
        }
    }
}

struct FakeEncoder {
    script: FakeEncoderScript,
    shared: Arc<Mutex<EncoderShared>>,
    formats: Arc<Mutex<Vec<EncoderFormat>>>,
    counters: Arc<Counters>,
}

impl EncoderCodec for FakeEncoder {
    fn name(&self) -> &str {
        "fake.encoder"
    }

    fn configure(&mut self, format: &EncoderFormat, callback: CodecCallback) -> anyhow::Result<()> {
        self.formats.lock().unwrap().push(format.clone());
        let mut shared = self.shared.lock().unwrap();
        shared.format = Some(format.clone());
        shared.callback = Some(callback);
        Ok(())
    }

    fn create_input_surface(&mut self) -> anyhow::Result<Surface> {
        let shared = self.shared.clone();
        let script = self.script;
        Ok(Surface::new(move |frame: SurfaceFrame| {
            let mut shared = shared.lock().unwrap();
            if !shared.started {
                anyhow::bail!("encoder not started");
            }
            let n = shared.frames_in;
            shared.frames_in += 1;
            shared.surface_sizes.push((frame.width, frame.height));
            if script.fail_on_frame == Some(n) {
                if let Some(callback) = &shared.callback {
                    callback.error("scripted encode error");
                }
                return Ok(());
            }
            shared.ensure_format(&script);
            if script.drop_frame == Some(n) {
                return Ok(());
            }
            shared.pending += 1;
            while shared.pending > script.latency {
                shared.pending -= 1;
                shared.emit(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]), BufferFlags::KEY_FRAME);
            }
            Ok(())
        }))
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.started = true;
        if self.script.spurious_output {
            shared.ensure_format(&self.script);
            shared.emit(Bytes::from_static(&[0, 0, 0, 1, 0x41]), BufferFlags::NONE);
        }
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        while shared.pending > 0 {
            shared.pending -= 1;
            shared.emit(Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9a]), BufferFlags::NONE);
        }
        shared.emit(Bytes::new(), BufferFlags::END_OF_STREAM);
        Ok(())
    }

    fn output_buffer(&mut self, index: usize) -> Option<Bytes> {
        self.shared.lock().unwrap().outputs.get(&index).cloned()
    }

    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()> {
        self.shared.lock().unwrap().outputs.remove(&index);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.shared.lock().unwrap().started = false;
        Ok(())
    }

    fn release(&mut self) {
        Counters::bump(&self.counters.encoder_released);
        self.shared.lock().unwrap().callback = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenSample {
    pub track: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

#[derive(Default, Debug)]
pub struct WriterLog {
    pub tracks: Vec<(String, u32, u32)>,
    pub started: usize,
    pub samples: Vec<WrittenSample>,
    pub stopped: usize,
    pub released: usize,
}

impl WriterLog {
    /// Data samples only, codec-config excluded.
    pub fn frames(&self) -> Vec<&WrittenSample> {
        self.samples
            .iter()
            .filter(|s| !s.flags.is_codec_config())
            .collect()
    }
}

struct FakeWriter {
    log: Arc<Mutex<WriterLog>>,
    counters: Arc<Counters>,
}

impl ContainerWriter for FakeWriter {
    fn add_track(&mut self, format: &OutputFormat) -> anyhow::Result<usize> {
        let mut log = self.log.lock().unwrap();
        log.tracks
            .push((format.mime.clone(), format.width, format.height));
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().started += 1;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> anyhow::Result<()> {
        self.log.lock().unwrap().samples.push(WrittenSample {
            track,
            size: data.len(),
            presentation_time_us: info.presentation_time_us,
            flags: info.flags,
        });
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().stopped += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
        Counters::bump(&self.counters.writer_released);
    }
}

/// Backend whose every primitive is scripted and observable.
pub struct FakeBackend {
    source: FakeSource,
    decoder: FakeDecoderScript,
    encoder: FakeEncoderScript,
    counters: Arc<Counters>,
    writer_log: Arc<Mutex<WriterLog>>,
    encoder_formats: Arc<Mutex<Vec<EncoderFormat>>>,
    encoder_shared: Mutex<Option<Arc<Mutex<EncoderShared>>>>,
}

impl FakeBackend {
    pub fn new(source: FakeSource) -> Self {
        Self {
            source,
            decoder: FakeDecoderScript::default(),
            encoder: FakeEncoderScript::default(),
            counters: Arc::new(Counters::default()),
            writer_log: Arc::new(Mutex::new(WriterLog::default())),
            encoder_formats: Arc::new(Mutex::new(Vec::new())),
            encoder_shared: Mutex::new(None),
        }
    }

    pub fn decoder_script(mut self, script: FakeDecoderScript) -> Self {
        self.decoder = script;
        self
    }

    pub fn encoder_script(mut self, script: FakeEncoderScript) -> Self {
        self.encoder = script;
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn writer_log(&self) -> MutexGuard<'_, WriterLog> {
        self.writer_log.lock().unwrap()
    }

    pub fn encoder_format(&self) -> Option<EncoderFormat> {
        self.encoder_formats.lock().unwrap().last().cloned()
    }

    /// Sizes of the pictures presented on the encoder surface.
    pub fn surface_sizes(&self) -> Vec<(u32, u32)> {
        self.encoder_shared
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.lock().unwrap().surface_sizes.clone())
            .unwrap_or_default()
    }
}

impl MediaBackend for FakeBackend {
    fn open_demuxer(&self, uri: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        if self.source.unreadable {
            anyhow::bail!("cannot open {}", uri);
        }
        Ok(Box::new(FakeDemuxer {
            source: self.source.clone(),
            selected: None,
            fps: 30.0,
            pos: 0,
            counters: self.counters.clone(),
        }))
    }

    fn decoder_names(&self, format: &TrackFormat) -> Vec<String> {
        if format.is_video() {
            vec!["fake.decoder".to_string()]
        } else {
            Vec::new()
        }
    }

    fn create_decoder_for(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn DecoderCodec>> {
        if !format.is_video() {
            anyhow::bail!("no decoder for {}", format.mime);
        }
        Ok(Box::new(FakeDecoder {
            script: self.decoder,
            callback: None,
            width: 0,
            height: 0,
            inputs: vec![Vec::new(); 2],
            pending: VecDeque::new(),
            outputs: HashMap::new(),
            next_output: 0,
            queued: 0,
            counters: self.counters.clone(),
        }))
    }

    fn create_encoder_by_type(&self, _mime: &str) -> anyhow::Result<Box<dyn EncoderCodec>> {
        let shared = Arc::new(Mutex::new(EncoderShared::default()));
        *self.encoder_shared.lock().unwrap() = Some(shared.clone());
        Ok(Box::new(FakeEncoder {
            script: self.encoder,
            shared,
            formats: self.encoder_formats.clone(),
            counters: self.counters.clone(),
        }))
    }

    fn create_writer(&self, _path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Counters::bump(&self.counters.writers_created);
        Ok(Box::new(FakeWriter {
            log: self.writer_log.clone(),
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeenFrame {
    pub width: u32,
    pub height: u32,
    pub orientation: i32,
    pub mirror: bool,
    pub pixel_stride: usize,
    pub data: Vec<u8>,
}

#[derive(Default, Debug)]
pub struct EngineLog {
    pub calls: Vec<&'static str>,
    pub effects: Vec<(String, String)>,
    pub surface: Option<(u32, u32)>,
    pub frames: Vec<SeenFrame>,
    pub released: usize,
}

/// Engine that records what it is given and presents a blank 2x2 picture
/// for each frame.
pub struct FakeEngine {
    log: Arc<Mutex<EngineLog>>,
    surface: Option<Surface>,
    fail_init: bool,
    fail_on_frame: Option<usize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(EngineLog::default())),
            surface: None,
            fail_init: false,
            fail_on_frame: None,
        }
    }

    pub fn fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn fail_on_frame(mut self, frame: usize) -> Self {
        self.fail_on_frame = Some(frame);
        self
    }

    pub fn log(&self) -> Arc<Mutex<EngineLog>> {
        self.log.clone()
    }
}

impl FrameTransformEngine for FakeEngine {
    fn initialize(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().calls.push("initialize");
        if self.fail_init {
            anyhow::bail!("scripted init failure");
        }
        Ok(())
    }

    fn switch_effect(&mut self, slot: &str, path: &str) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.calls.push("switch_effect");
        log.effects.push((slot.to_string(), path.to_string()));
        Ok(())
    }

    fn set_render_surface(&mut self, surface: Surface, width: u32, height: u32) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.calls.push("set_render_surface");
        log.surface = Some((width, height));
        self.surface = Some(surface);
        Ok(())
    }

    fn receive_frame(&mut self, frame: &EngineFrame<'_>) -> anyhow::Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            if self.fail_on_frame == Some(log.frames.len()) {
                anyhow::bail!("scripted render failure");
            }
            log.frames.push(SeenFrame {
                width: frame.width,
                height: frame.height,
                orientation: frame.orientation,
                mirror: frame.mirror,
                pixel_stride: frame.pixel_stride,
                data: frame.data.to_vec(),
            });
        }
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no surface"))?;
        surface.present(SurfaceFrame::new(2, 2, vec![0u8; SurfaceFrame::expected_len(2, 2)])?)
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
    }
}
