use bytes::Bytes;

use crate::codec::BufferInfo;

/// One access unit read from the source track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedUnit {
    pub payload: Bytes,
    pub presentation_time_us: i64,
    /// Set on the last unit of the track.
    pub end_of_stream: bool,
}

impl CompressedUnit {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// One unit produced by the encoder, already re-stamped for the writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedUnit {
    pub payload: Bytes,
    pub info: BufferInfo,
}

impl EncodedUnit {
    pub fn new(payload: Bytes, info: BufferInfo) -> Self {
        Self { payload, info }
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.info.presentation_time_us
    }

    pub fn is_codec_config(&self) -> bool {
        self.info.flags.is_codec_config()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.info.flags.is_end_of_stream()
    }

    /// The slice of the payload described by `info`.
    pub fn data(&self) -> &[u8] {
        let start = self.info.offset.min(self.payload.len());
        let end = (self.info.offset + self.info.size).min(self.payload.len());
        &self.payload[start..end]
    }
}
