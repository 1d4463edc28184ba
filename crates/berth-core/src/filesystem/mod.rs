//! Filesystem management for container isolation.
//!
//! Provides mount descriptors as produced by volume drivers, and their
//! application inside a container's mount namespace.

pub mod mount;

pub use mount::{MountDescriptor, MountFlags};
