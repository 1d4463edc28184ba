//! System-wide constants and default paths.

use std::time::Duration;

/// Default base directory for berth data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/berth";
/// Default directory holding one subdirectory per container.
pub const DEFAULT_CONTAINER_DIR: &str = "/var/lib/berth/containers";
/// Default directory holding named volumes.
pub const DEFAULT_VOLUME_DIR: &str = "/var/lib/berth/volumes";
/// Default root for `empty` volume scratch directories.
pub const DEFAULT_EMPTY_VOLUME_DIR: &str = "/var/lib/berth/empty-volumes";
/// Default base directory `host` volume sources are resolved against.
pub const DEFAULT_HOST_VOLUME_DIR: &str = "/var/lib/berth/host-volumes";
/// Default location of the stager binary.
pub const DEFAULT_STAGER_BINARY: &str = "/opt/berth/bin/berth-stager";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";
/// Name of the parent cgroup all containers are placed under.
pub const DEFAULT_PARENT_CGROUP: &str = "berth";

/// Mount root for pod volumes inside a container.
pub const VOLUME_MOUNT_ROOT: &str = "/volumes";
/// Mode applied to `empty` volumes that do not declare one.
pub const DEFAULT_VOLUME_MODE: u32 = 0o755;

/// Isolator that declares which namespaces an app needs.
pub const NAMESPACES_ISOLATOR: &str = "os/linux/namespaces";

/// Configuration file the host writes for the stager.
pub const STAGER_CONFIG_FILE: &str = "stager.json";
/// State file the stager persists for crash forensics.
pub const STAGER_STATE_FILE: &str = "state.json";
/// File the stager's diagnostic output is written to.
pub const STAGER_LOG_FILE: &str = "stager.log";
/// File `run` sessions append their diagnostics to; their stderr belongs to
/// the entered process.
pub const RUN_LOG_FILE: &str = "run.log";
/// Descriptor number the stager reports readiness on.
pub const READY_FD: i32 = 3;

/// Window given to pending output after a process exits.
pub const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Application name used in log output and state files.
pub const APP_NAME: &str = "berth";
