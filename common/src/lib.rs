//! Common types and utilities for vmix.
//!
//! This crate defines the shared data structures and IPC protocol used for
//! communication between the mixing daemon (`vmixd`) and the control
//! client (`vmixctl`).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using newline-delimited
//! JSON messages. The client sends [`Command`] variants and receives
//! [`Response`] variants.
//!
//! # Examples
//!
//! ```no_run
//! use common::Command;
//!
//! // Fade media slot 3 onto its output plane
//! let cmd = Command::ShowMedia { slot: 3 };
//!
//! // Serialize for sending over IPC
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of media buttons reported per bank.
pub const MEDIA_BUTTONS: usize = 16;

/// Common error types shared between client and daemon.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MixerError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("No media configured for slot {0}")]
    UnknownSlot(u32),

    #[error("Output {0} is still fading")]
    MixerBusy(usize),

    #[error("Slot {0} is already showing")]
    AlreadyShowing(u32),

    #[error("No free {0} source in the pool")]
    NoFreeSource(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Daemon is shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for MixerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MixerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

/// Commands sent from client to daemon via IPC.
///
/// # Examples
///
/// ```
/// use common::Command;
///
/// let cmd = Command::SetLooping { slot: 0, looping: false };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Fade the source configured for a media slot onto its output.
    ///
    /// The output is chosen by grid position; the request is refused
    /// while that output is already fading.
    ShowMedia {
        /// Logical media slot id (bank offset included)
        slot: u32,
    },
    /// Switch the bank of media buttons reported to the controller
    SetBank { bank: u8 },
    /// Change looping for a slot, applied to a running source too
    SetLooping { slot: u32, looping: bool },
    /// Change the crossfade duration for subsequent fades
    SetFadeTime { ms: u64 },
    /// Query daemon status
    Query,
    /// Ping the daemon
    Ping,
    /// Stop the daemon
    Kill,
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    /// `ShowMedia` accepted: the fade started on `output` using `pool_index`
    Shown { output: usize, pool_index: usize },
    Status(MixerStatus),
    Error(MixerError),
}

/// Indicator state of one media button.
///
/// Mirrors what the physical controller can display: whether a slot has
/// media assigned, what kind, and whether it is currently on air.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    #[default]
    Empty,
    FileAsset,
    FileAssetActive,
    LiveSource,
    LiveSourceActive,
    Procedural,
    ProceduralActive,
}

impl SlotState {
    /// Whether the slot is currently bound to a playing source
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::FileAssetActive | Self::LiveSourceActive | Self::ProceduralActive
        )
    }

    /// The "on air" variant of this state
    pub fn activated(self) -> Self {
        match self {
            Self::FileAsset => Self::FileAssetActive,
            Self::LiveSource => Self::LiveSourceActive,
            Self::Procedural => Self::ProceduralActive,
            other => other,
        }
    }
}

/// Snapshot of everything the button controller displays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerState {
    pub bank: u8,
    pub media: [SlotState; MEDIA_BUTTONS],
}

impl ControllerState {
    /// Number of buttons showing an active source
    pub fn active_count(&self) -> usize {
        self.media.iter().filter(|s| s.is_active()).count()
    }
}

/// Daemon status information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixerStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub outputs: Vec<OutputStatus>,
    pub pool: Vec<PoolEntryStatus>,
    pub controller: ControllerState,
}

/// Crossfade state of one output plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStatus {
    pub index: usize,
    pub from: Option<usize>,
    pub to: Option<usize>,
    pub mix_value: f32,
    pub fading: bool,
}

/// State of one pooled media source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntryStatus {
    pub index: usize,
    pub kind: String,
    pub state: String,
    pub media_slot: Option<u32>,
    /// Last failure reason, e.g. an unsupported capture format
    pub status: Option<String>,
    pub frames_presented: u64,
}

/// IPC socket path helper
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("vmix.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_state_activation() {
        assert_eq!(SlotState::FileAsset.activated(), SlotState::FileAssetActive);
        assert_eq!(SlotState::LiveSource.activated(), SlotState::LiveSourceActive);
        assert_eq!(SlotState::Procedural.activated(), SlotState::ProceduralActive);
        assert_eq!(SlotState::Empty.activated(), SlotState::Empty);

        assert!(SlotState::LiveSourceActive.is_active());
        assert!(!SlotState::FileAsset.is_active());
        assert!(!SlotState::Empty.is_active());
    }

    #[test]
    fn test_controller_state_default() {
        let state = ControllerState::default();
        assert_eq!(state.bank, 0);
        assert!(state.media.iter().all(|s| *s == SlotState::Empty));
        assert_eq!(state.active_count(), 0);
    }

    #[test]
    fn test_controller_state_equality_detects_changes() {
        let mut a = ControllerState::default();
        let b = a;
        assert_eq!(a, b);

        a.media[3] = SlotState::FileAssetActive;
        assert_ne!(a, b);
        assert_eq!(a.active_count(), 1);
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::ShowMedia { slot: 9 };
        let json = serde_json::to_string(&cmd).unwrap();
        let deserialized: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, Command::ShowMedia { slot: 9 });

        let cmd = Command::SetLooping {
            slot: 2,
            looping: true,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("SetLooping"));
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Shown {
            output: 1,
            pool_index: 3,
        };
        let json = serde_json::to_string(&resp).unwrap();
        let deserialized: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, resp);

        let resp = Response::Error(MixerError::MixerBusy(0));
        let json = serde_json::to_string(&resp).unwrap();
        let deserialized: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            deserialized,
            Response::Error(MixerError::MixerBusy(0))
        ));
    }

    #[test]
    fn test_mixer_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket missing");
        let err: MixerError = io_err.into();
        assert!(matches!(err, MixerError::Io(_)));

        let json_err = serde_json::from_str::<Command>("invalid json").unwrap_err();
        let err: MixerError = json_err.into();
        assert!(matches!(err, MixerError::Ipc(_)));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            MixerError::UnknownSlot(12).to_string(),
            "No media configured for slot 12"
        );
        assert_eq!(
            MixerError::MixerBusy(1).to_string(),
            "Output 1 is still fading"
        );
    }

    #[test]
    fn test_socket_path() {
        let path = get_socket_path();
        assert!(path.to_str().unwrap().contains("vmix.sock"));
    }
}
