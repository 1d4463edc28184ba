//! Image layer unpacking.
//!
//! An image reader is a tar stream, optionally gzip-compressed. Compression
//! is detected from the stream's first bytes, since readers handed over by
//! a fetch carry no file name.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use berth_common::error::{BerthError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks a tar stream into `target`, creating it if needed.
///
/// # Errors
///
/// Returns an error if `target` cannot be created or the archive is
/// malformed.
pub fn unpack(reader: impl Read, target: &Path) -> Result<()> {
    tracing::info!(target = %target.display(), "unpacking image");
    std::fs::create_dir_all(target).map_err(|e| BerthError::io(target, e))?;

    let mut reader = BufReader::new(reader);
    let is_gzip = reader
        .fill_buf()
        .map_err(|e| BerthError::io(target, e))?
        .starts_with(&GZIP_MAGIC);

    let unpacked = if is_gzip {
        tar::Archive::new(flate2::read::GzDecoder::new(reader)).unpack(target)
    } else {
        tar::Archive::new(reader).unpack(target)
    };
    unpacked.map_err(|e| BerthError::io(target, e))?;

    tracing::debug!(target = %target.display(), gzip = is_gzip, "image unpacked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_bytes(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data)
            .expect("failed to append data");
        builder.into_inner().expect("failed to finish tar")
    }

    #[test]
    fn unpack_plain_tar_creates_expected_files() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let target = dir.path().join("rootfs");
        let archive = tar_bytes("etc/hostname", b"berth\n");

        unpack(archive.as_slice(), &target).expect("unpack failed");
        let content = std::fs::read_to_string(target.join("etc/hostname")).expect("read failed");
        assert_eq!(content, "berth\n");
    }

    #[test]
    fn unpack_detects_gzip_by_magic() {
        use std::io::Write;

        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let target = dir.path().join("rootfs");
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&tar_bytes("bin/app", b"#!/bin/sh\n"))
            .expect("compress");
        let compressed = encoder.finish().expect("failed to finish gzip");

        unpack(compressed.as_slice(), &target).expect("unpack failed");
        assert!(target.join("bin/app").is_file());
    }

    #[test]
    fn unpack_rejects_garbage() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let garbage = vec![0x42_u8; 1024];
        assert!(unpack(garbage.as_slice(), &dir.path().join("rootfs")).is_err());
    }
}
