//! vmix mixing engine
//!
//! A render-thread-owned pool of media sources, crossfaded onto output
//! planes. The daemon binary (`vmixd`) wraps this in a winit window and a
//! Unix socket control interface.

#[macro_use]
pub mod macros;

pub mod config;
pub mod controller;
pub mod error;
pub mod frame_queue;
pub mod gpu;
pub mod ipc_server;
pub mod media;
pub mod operator;
pub mod plane_mixer;
pub mod transition;

#[cfg(feature = "gpu")]
pub mod app;

pub use operator::{OperatorSettings, PlaybackOperator};
