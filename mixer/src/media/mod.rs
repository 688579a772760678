//! Media sources: decode threads, frame pacing and the producers behind them
//!
//! Every source shares one lifecycle (`MediaSource`) regardless of what
//! feeds it. The variant-specific part is a `FrameProducer` that runs on the
//! source's decode thread:
//!
//! - `procedural`: CPU-generated test patterns (always available)
//! - `video`: file playback through GStreamer (feature `video`)
//! - `capture`: V4L2 capture through GStreamer (feature `video`)
//!
//! # Architecture
//!
//! 1. `SourceFactory::create` resolves the descriptor and assembles the
//!    decoder on the render thread, without blocking
//! 2. `MediaSource::play` spawns a `decode-<label>` thread. It prerolls the
//!    producer (`FrameProducer::start`), then pushes rebased frames into a
//!    bounded `FrameQueue`
//! 3. Each render cycle `MediaSource::update` releases at most one frame
//!    whose timestamp is due and imports it through the `GpuBackend`
//! 4. `MediaSource::close` stops the thread, drops the codec and hands the
//!    GPU images back under the fence discipline

mod decode;
mod factory;
mod frame;
mod pacing;
mod procedural;
mod producer;
mod source;
mod stats;

#[cfg(feature = "video")]
mod capture;
#[cfg(feature = "video")]
mod pipeline;
#[cfg(feature = "video")]
mod video;

use std::fmt;
use std::path::PathBuf;

pub use factory::GstSourceFactory;
pub use frame::{DecodedFrame, HostBytes, PixelFormat, PlaneDescriptor, PlaneMemory};
pub use pacing::{PACING_EPSILON, PacingClock};
pub use procedural::{Pattern, ProceduralProducer, parse_hex_color};
pub use producer::{FrameProducer, Produced, SourceFactory};
pub use source::{MediaSource, SourceSettings};
pub use stats::SourceStats;

#[cfg(feature = "video")]
pub use capture::CaptureProducer;
#[cfg(feature = "video")]
pub use pipeline::initialize_gstreamer;
#[cfg(feature = "video")]
pub use video::VideoProducer;

/// What feeds a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// Media file decoded from disk
    Video,
    /// Live capture device
    Capture,
    /// Generated test pattern
    Procedural,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Video, Self::Capture, Self::Procedural];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Capture => "capture",
            Self::Procedural => "procedural",
        }
    }

    /// Controller indicator for a slot holding this kind of media
    pub fn slot_state(&self) -> common::SlotState {
        match self {
            Self::Video => common::SlotState::FileAsset,
            Self::Capture => common::SlotState::LiveSource,
            Self::Procedural => common::SlotState::Procedural,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SourceState {
    #[default]
    Idle = 0,
    /// Opened and holding a producer, decode thread not started
    Opening = 1,
    Playing = 2,
    /// Decoding finished; waiting for queued frames to be consumed
    Flushing = 3,
}

impl SourceState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Opening,
            2 => Self::Playing,
            3 => Self::Flushing,
            _ => Self::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Playing => "playing",
            Self::Flushing => "flushing",
        }
    }
}

/// Everything needed to open one piece of media
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// File path, capture device path, or pattern id
    pub location: String,
    pub looping: bool,
    /// Play files in reverse
    pub backwards: bool,
    /// Route the audio track to the default sink
    pub audio: bool,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            looping: false,
            backwards: false,
            audio: false,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Short human-readable name used for threads and logs
    pub fn label(&self) -> String {
        let name = match self.kind {
            SourceKind::Video | SourceKind::Capture => PathBuf::from(&self.location)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.location.clone()),
            SourceKind::Procedural => self.location.clone(),
        };
        format!("{}:{}", self.kind, name)
    }
}
