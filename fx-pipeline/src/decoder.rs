use std::collections::HashMap;

use ffmpeg_next::Packet;

use crate::{
    codec::{
        BufferFlags, BufferInfo, CodecCallback, DecoderCodec, MediaBackend, StageState,
        TrackFormat,
    },
    error::{TranscodeError, TranscodeResult},
    frame::RawFrame,
    input::SourceReader,
    scaler::Scaler,
    stream::AvStream,
};

pub const DEFAULT_INPUT_SLOTS: usize = 4;

/// Buffer-exchange decoder over an ffmpeg video decoder.
///
/// Input slots are plain byte buffers handed out by index. Every decoded
/// picture is parked under a fresh output index until the owner releases it.
pub struct AvDecoder {
    name: String,
    candidates: Vec<ffmpeg_next::Codec>,
    decoder: Option<ffmpeg_next::codec::decoder::Video>,
    callback: Option<CodecCallback>,
    inputs: Vec<Vec<u8>>,
    outputs: HashMap<usize, Option<ffmpeg_next::frame::Video>>,
    next_output: usize,
    input_eos: bool,
    output_eos_posted: bool,
    scaler: Scaler,
}

// Only touched from the pipeline thread that owns it.
unsafe impl Send for AvDecoder {}

impl AvDecoder {
    pub fn new(candidates: Vec<ffmpeg_next::Codec>, input_slots: usize) -> Self {
        let name = candidates
            .first()
            .map(|c| c.name().to_string())
            .unwrap_or_default();
        Self {
            name,
            candidates,
            decoder: None,
            callback: None,
            inputs: vec![Vec::new(); input_slots.max(1)],
            outputs: HashMap::new(),
            next_output: 0,
            input_eos: false,
            output_eos_posted: false,
            scaler: Scaler::new(),
        }
    }

    fn open(
        codec: ffmpeg_next::Codec,
        stream: &AvStream,
    ) -> anyhow::Result<ffmpeg_next::codec::decoder::Video> {
        let mut ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        ctx.set_parameters(stream.parameters().clone())?;
        unsafe {
            // Packets are stamped in microseconds.
            (*ctx.as_mut_ptr()).pkt_timebase = ffmpeg_next::ffi::AVRational {
                num: 1,
                den: 1_000_000,
            };
        }
        let decoder = ctx.decoder().open_as(codec)?.video()?;
        if decoder.width() == 0 || decoder.height() == 0 {
            anyhow::bail!("missing codec parameters");
        }
        Ok(decoder)
    }

    fn decoder_mut(&mut self) -> anyhow::Result<&mut ffmpeg_next::codec::decoder::Video> {
        self.decoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("decoder {} not configured", self.name))
    }

    fn post_output(&mut self, frame: Option<ffmpeg_next::frame::Video>, info: BufferInfo) {
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.insert(index, frame);
        if let Some(callback) = &self.callback {
            callback.output_available(index, info);
        }
    }

    fn send_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        loop {
            let sent = self.decoder_mut()?.send_packet(packet);
            match sent {
                Ok(()) => return Ok(()),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    self.drain()?
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        loop {
            let mut frame = ffmpeg_next::frame::Video::empty();
            let received = self.decoder_mut()?.receive_frame(&mut frame);
            match received {
                Ok(()) => {
                    let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
                    let size = frame.width() as usize * frame.height() as usize * 3 / 2;
                    self.post_output(Some(frame), BufferInfo::new(size, pts, BufferFlags::NONE));
                }
                Err(ffmpeg_next::Error::Eof) => {
                    if self.input_eos && !self.output_eos_posted {
                        self.output_eos_posted = true;
                        log::debug!("decoder {} drained", self.name);
                        self.post_output(None, BufferInfo::end_of_stream(0));
                    }
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl DecoderCodec for AvDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &TrackFormat, callback: CodecCallback) -> anyhow::Result<()> {
        let stream = format
            .stream
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} track carries no ffmpeg stream", format.mime))?;
        let mut last_err = None;
        for codec in self.candidates.iter().copied() {
            match Self::open(codec, stream) {
                Ok(decoder) => {
                    log::info!("decoder opened successfully: {}", codec.name());
                    self.name = codec.name().to_string();
                    self.decoder = Some(decoder);
                    break;
                }
                Err(e) => {
                    log::warn!("decoder {} failed: {}, trying next", codec.name(), e);
                    last_err = Some(e);
                }
            }
        }
        if self.decoder.is_none() {
            return Err(last_err.unwrap_or_else(|| {
                anyhow::anyhow!("no decoder available for {}", format.mime)
            }));
        }
        self.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.decoder_mut()?;
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
        if info.size > 0 {
            let data = self
                .inputs
                .get(index)
                .and_then(|buf| buf.get(info.offset..info.offset + info.size))
                .ok_or_else(|| anyhow::anyhow!("input slot {} out of range", index))?;
            let mut packet = Packet::copy(data);
            packet.set_pts(Some(info.presentation_time_us));
            self.send_packet(&packet)?;
        }
        if info.flags.is_end_of_stream() {
            self.input_eos = true;
            self.decoder_mut()?.send_eof()?;
        }
        self.drain()?;
        if !self.input_eos {
            if let Some(callback) = &self.callback {
                callback.input_available(index);
            }
        }
        Ok(())
    }

    fn output_frame(&mut self, index: usize) -> anyhow::Result<Option<RawFrame>> {
        let Some(Some(frame)) = self.outputs.get(&index) else {
            return Ok(None);
        };
        let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
        if Scaler::needs_conversion(frame) {
            let mut converted = ffmpeg_next::frame::Video::empty();
            self.scaler.run(frame, &mut converted)?;
            RawFrame::from_yuv420p(&converted, pts).map(Some)
        } else {
            RawFrame::from_yuv420p(frame, pts).map(Some)
        }
    }

    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()> {
        self.outputs.remove(&index);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.outputs.clear();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.outputs.clear();
        self.decoder = None;
        self.callback = None;
    }
}

/// What one decoder output event turned out to be.
#[derive(Debug)]
pub enum DecodedOutput {
    Frame(RawFrame),
    EndOfStream,
    /// The codec had nothing to hand out for this index.
    Empty,
}

/// Decoder state machine: pulls units from the source reader when the codec
/// has room and turns output events into frames.
pub struct DecoderStage {
    codec: Option<Box<dyn DecoderCodec>>,
    state: StageState,
    input_eos_sent: bool,
    output_eos_seen: bool,
    units_queued: u64,
    frames_out: u64,
}

impl DecoderStage {
    pub fn new() -> Self {
        Self {
            codec: None,
            state: StageState::Unconfigured,
            input_eos_sent: false,
            output_eos_seen: false,
            units_queued: 0,
            frames_out: 0,
        }
    }

    pub fn configure(
        &mut self,
        backend: &dyn MediaBackend,
        format: &TrackFormat,
        callback: CodecCallback,
    ) -> TranscodeResult<()> {
        if self.state != StageState::Unconfigured {
            return Err(TranscodeError::DecodeFailure(format!(
                "configure in state {:?}",
                self.state
            )));
        }
        log::debug!(
            "decoders supporting {}: {:?}",
            format.mime,
            backend.decoder_names(format)
        );
        let mut codec = backend
            .create_decoder_for(format)
            .map_err(TranscodeError::decode)?;
        let configured = codec.configure(format, callback);
        let name = codec.name().to_string();
        // Keep the codec even on failure so release() reaches it.
        self.codec = Some(codec);
        configured.map_err(TranscodeError::decode)?;
        self.state = StageState::Configured;
        log::info!("decoder {} configured for {}", name, format.mime);
        Ok(())
    }

    pub fn start(&mut self) -> TranscodeResult<()> {
        if self.state != StageState::Configured {
            return Err(TranscodeError::DecodeFailure(format!(
                "start in state {:?}",
                self.state
            )));
        }
        self.codec_mut()?.start().map_err(TranscodeError::decode)?;
        self.state = StageState::Running;
        Ok(())
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn units_queued(&self) -> u64 {
        self.units_queued
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    pub fn input_eos_sent(&self) -> bool {
        self.input_eos_sent
    }

    pub fn output_eos_seen(&self) -> bool {
        self.output_eos_seen
    }

    fn codec_mut(&mut self) -> TranscodeResult<&mut Box<dyn DecoderCodec>> {
        self.codec
            .as_mut()
            .ok_or_else(|| TranscodeError::DecodeFailure("decoder released".into()))
    }

    /// Fills input slot `index` with the next unit, or with an empty
    /// end-of-stream unit once the reader runs dry.
    pub fn on_input_available(
        &mut self,
        index: usize,
        reader: &mut SourceReader,
    ) -> TranscodeResult<()> {
        if self.input_eos_sent {
            log::debug!("decoder input slot {} ignored after end of stream", index);
            return Ok(());
        }
        let unit = reader.next_unit()?;
        let codec = self.codec_mut()?;
        let buf = codec.input_buffer(index).ok_or_else(|| {
            TranscodeError::DecodeFailure(format!("no decoder input buffer {}", index))
        })?;
        buf.clear();
        let info = match unit {
            Some(unit) => {
                buf.extend_from_slice(&unit.payload);
                let flags = if unit.end_of_stream {
                    BufferFlags::END_OF_STREAM
                } else {
                    BufferFlags::NONE
                };
                BufferInfo::new(unit.size(), unit.presentation_time_us, flags)
            }
            None => BufferInfo::end_of_stream(0),
        };
        codec
            .queue_input_buffer(index, info)
            .map_err(TranscodeError::decode)?;
        if info.size > 0 {
            self.units_queued += 1;
        }
        if info.flags.is_end_of_stream() {
            self.input_eos_sent = true;
            self.state = StageState::Draining;
            log::info!(
                "decoder input end of stream after {} units",
                self.units_queued
            );
        }
        Ok(())
    }

    /// Classifies output `index`. A frame stays owned by the codec until
    /// [`DecoderStage::release_output`] is called for the same index.
    pub fn on_output_available(
        &mut self,
        index: usize,
        info: BufferInfo,
    ) -> TranscodeResult<DecodedOutput> {
        if info.flags.is_end_of_stream() {
            self.output_eos_seen = true;
            self.release_output(index)?;
            log::info!("decoder output end of stream after {} frames", self.frames_out);
            return Ok(DecodedOutput::EndOfStream);
        }
        let frame = self
            .codec_mut()?
            .output_frame(index)
            .map_err(TranscodeError::decode)?;
        match frame {
            Some(mut frame) => {
                frame.presentation_time_us = info.presentation_time_us;
                self.frames_out += 1;
                log::debug!(
                    "decoded frame {} pts {}us",
                    self.frames_out,
                    frame.presentation_time_us
                );
                Ok(DecodedOutput::Frame(frame))
            }
            None => {
                self.release_output(index)?;
                Ok(DecodedOutput::Empty)
            }
        }
    }

    pub fn release_output(&mut self, index: usize) -> TranscodeResult<()> {
        self.codec_mut()?
            .release_output_buffer(index)
            .map_err(TranscodeError::decode)
    }

    pub fn on_error(&self, message: String) -> TranscodeError {
        TranscodeError::DecodeFailure(message)
    }

    pub fn release(&mut self) {
        let Some(mut codec) = self.codec.take() else {
            return;
        };
        if matches!(self.state, StageState::Running | StageState::Draining) {
            if let Err(e) = codec.stop() {
                log::warn!("decoder {} stop error: {}", codec.name(), e);
            }
        }
        codec.release();
        self.state = StageState::Stopped;
        log::debug!("decoder {} released", codec.name());
    }
}

impl Default for DecoderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DecoderStage {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
