//! Error kinds for the mixing engine.
//!
//! Each failure path maps to one named variant so callers can decide
//! whether to retry, skip a frame, or give up on a source.

use thiserror::Error;

use crate::media::SourceState;

/// Failures while opening or running a media source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("No playable video stream in {0}")]
    NoPlayableStream(String),

    #[error("Codec initialization failed: {0}")]
    CodecInit(String),

    #[error("Resource allocation failed: {0}")]
    Allocation(String),

    /// Live capture hardware rejected the requested mode. Not retried.
    #[error("Capture unavailable: {0}")]
    Capture(String),

    #[error("Source is busy ({0:?})")]
    Busy(SourceState),

    /// A single frame could not be decoded or described; skipped.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl SourceError {
    /// Whether the decode loop may skip the offending frame and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Failures while turning a decoded frame into a GPU image
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("Frame has no planes")]
    NoPlanes,

    #[error("Unsupported plane layout: {0}")]
    UnsupportedFormat(String),

    #[error("Plane {width}x{height} exceeds the maximum texture size {max}")]
    TooLarge { width: u32, height: u32, max: u32 },

    #[error("Failed to map plane memory: {0}")]
    Map(String),

    #[error("Plane data truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("External memory import failed: {0}")]
    External(String),

    #[error("Import rejected: {0}")]
    Rejected(String),
}

/// Failures while compositing an output plane
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Output {0} does not exist")]
    NoSuchOutput(usize),

    #[error("No render target for this frame")]
    NoTarget,

    #[error("Render failed: {0}")]
    Backend(String),
}

/// Reasons a `show_media` request was not carried out
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShowMediaError {
    #[error("No media configured for slot {0}")]
    UnknownSlot(u32),

    #[error("Output {0} is still fading")]
    MixerBusy(usize),

    #[error("Slot {0} is already showing")]
    AlreadyShowing(u32),

    #[error("No free {0} source in the pool")]
    NoFreeSource(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<ShowMediaError> for common::MixerError {
    fn from(e: ShowMediaError) -> Self {
        match e {
            ShowMediaError::UnknownSlot(slot) => Self::UnknownSlot(slot),
            ShowMediaError::MixerBusy(output) => Self::MixerBusy(output),
            ShowMediaError::AlreadyShowing(slot) => Self::AlreadyShowing(slot),
            ShowMediaError::NoFreeSource(kind) => Self::NoFreeSource(kind),
            ShowMediaError::Source(err) => Self::Source(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        assert!(SourceError::Decode("bad slice".into()).is_recoverable());
        assert!(!SourceError::CodecInit("h264".into()).is_recoverable());
        assert!(!SourceError::Capture("no signal".into()).is_recoverable());
    }

    #[test]
    fn test_show_media_error_to_ipc() {
        let err: common::MixerError = ShowMediaError::MixerBusy(1).into();
        assert_eq!(err, common::MixerError::MixerBusy(1));

        let err: common::MixerError =
            ShowMediaError::Source(SourceError::NotFound("/media/a.mp4".into())).into();
        assert!(matches!(err, common::MixerError::Source(msg) if msg.contains("a.mp4")));
    }
}
