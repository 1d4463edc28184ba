//! Container lifecycle management for the berth runtime.
//!
//! - [`manager`]: the registry of live containers, manifest validation and
//!   creation.
//! - [`container`]: one container's state machine, host-side start sequence
//!   and supervision.
//! - [`volume`]: pluggable volume drivers (`empty`, `host`).
//! - [`stager`]: the bootstrap sequence run inside a container directory.
//! - [`run`]: the app runner used by exec/attach.
//! - [`enter`]: the stream broker relaying interactive sessions.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod enter;
pub mod launch;
pub mod logs;
pub mod manager;
pub mod run;
pub mod stager;
pub mod state;
pub mod volume;

pub use container::{Container, WaitOutcome};
pub use manager::Manager;
