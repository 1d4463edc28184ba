//! User namespace id mappings.

use berth_common::error::{BerthError, Result};

/// Writes an identity UID/GID mapping for the user namespace of `pid`.
///
/// The container's root maps to the host's root, so a user namespace only
/// separates capabilities, not ownership. `setgroups` is denied first, as
/// the kernel requires for unprivileged writers of `gid_map`.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/uid_map`,
/// `/proc/<pid>/gid_map`, or `/proc/<pid>/setgroups` fails.
pub fn write_identity_map(pid: u32) -> Result<()> {
    let map = format!("0 0 {}", u32::MAX);

    let setgroups_path = format!("/proc/{pid}/setgroups");
    if std::path::Path::new(&setgroups_path).exists() {
        std::fs::write(&setgroups_path, "deny").map_err(|e| BerthError::io(&setgroups_path, e))?;
    }

    for file in ["uid_map", "gid_map"] {
        let path = format!("/proc/{pid}/{file}");
        std::fs::write(&path, &map).map_err(|e| BerthError::io(&path, e))?;
    }

    tracing::debug!(pid, "wrote identity uid/gid map");
    Ok(())
}
