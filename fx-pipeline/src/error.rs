//! Typed failures surfaced to the caller of a transcode job.

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Coarse classification of a [`TranscodeError`], stable across messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoVideoTrack,
    SourceUnreadable,
    DecodeFailure,
    EncodeFailure,
    Desync,
    EngineInitFailure,
    EngineFailure,
    WriterUsage,
    SinkFailure,
    Aborted,
}

#[derive(thiserror::Error, Debug)]
pub enum TranscodeError {
    #[error("no video track: {0}")]
    NoVideoTrack(String),

    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("encode failure: {0}")]
    EncodeFailure(String),

    #[error("timestamp queue desynchronized: {0}")]
    Desync(String),

    #[error("engine init failure: {0}")]
    EngineInitFailure(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("writer usage error: {0}")]
    WriterUsage(String),

    #[error("sink failure: {0}")]
    SinkFailure(String),

    #[error("pipeline aborted: {0}")]
    Aborted(String),
}

impl TranscodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoVideoTrack(_) => ErrorKind::NoVideoTrack,
            Self::SourceUnreadable(_) => ErrorKind::SourceUnreadable,
            Self::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Self::EncodeFailure(_) => ErrorKind::EncodeFailure,
            Self::Desync(_) => ErrorKind::Desync,
            Self::EngineInitFailure(_) => ErrorKind::EngineInitFailure,
            Self::EngineFailure(_) => ErrorKind::EngineFailure,
            Self::WriterUsage(_) => ErrorKind::WriterUsage,
            Self::SinkFailure(_) => ErrorKind::SinkFailure,
            Self::Aborted(_) => ErrorKind::Aborted,
        }
    }

    pub fn source_unreadable(err: impl std::fmt::Display) -> Self {
        Self::SourceUnreadable(format!("{err:#}"))
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::DecodeFailure(format!("{err:#}"))
    }

    pub fn encode(err: impl std::fmt::Display) -> Self {
        Self::EncodeFailure(format!("{err:#}"))
    }

    pub fn engine_init(err: impl std::fmt::Display) -> Self {
        Self::EngineInitFailure(format!("{err:#}"))
    }

    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::EngineFailure(format!("{err:#}"))
    }

    pub fn writer_usage(msg: impl Into<String>) -> Self {
        Self::WriterUsage(msg.into())
    }

    pub fn sink(err: impl std::fmt::Display) -> Self {
        Self::SinkFailure(format!("{err:#}"))
    }
}
