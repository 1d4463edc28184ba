//! # berth-image
//!
//! Image acquisition for the berth runtime.
//!
//! Handles:
//! - **Fetch**: `file://` and `http(s)://` references, each yielding one
//!   readable layer; other schemes are rejected.
//! - **Pullers**: the contract remote backends implement.
//! - **Layers**: unpacking a plain or gzip-compressed tar stream into a
//!   container root filesystem.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fetch;
pub mod layer;
