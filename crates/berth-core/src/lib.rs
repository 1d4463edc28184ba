//! # berth-core
//!
//! Low-level Linux isolation primitives for the berth runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: one parent scope per manager, one child scope per container.
//! - **Namespaces**: the namespace kinds a pod may request, and joining them.
//! - **Filesystem**: bind-mount descriptors and their application.
//! - **Primitive**: the container runtime primitive the stager drives, with
//!   a Linux implementation built on `unshare(2)`, `setns(2)` and `chroot(2)`.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod primitive;
