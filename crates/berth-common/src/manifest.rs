//! Image and pod manifests.
//!
//! An [`ImageManifest`] describes one application image. A [`PodManifest`]
//! is assembled from one or more images at creation time and is immutable
//! from then on.

use serde::{Deserialize, Serialize};

use crate::constants::NAMESPACES_ISOLATOR;
use crate::error::{BerthError, Result};

/// Description of an application image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Image identifier, e.g. `example.com/reduce-worker`.
    pub name: String,
    /// Free-form labels such as `version`, `os` and `arch`.
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Application to run. Images without one cannot be run.
    #[serde(default)]
    pub app: Option<App>,
}

/// A `name=value` image label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// The executable entry point of an image and how to run it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Argument vector. Must not be empty.
    #[serde(default)]
    pub exec: Vec<String>,
    /// User to run as (name or numeric uid).
    #[serde(default)]
    pub user: String,
    /// Group to run as (name or numeric gid).
    #[serde(default)]
    pub group: String,
    /// Working directory inside the container. Defaults to `/`.
    #[serde(default)]
    pub working_directory: String,
    /// Environment variables.
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Isolation requirements.
    #[serde(default)]
    pub isolators: Vec<Isolator>,
    /// Named volumes to bind into the container.
    #[serde(default)]
    pub mount_points: Vec<MountPoint>,
    /// Whether the process wants a pseudo-terminal.
    #[serde(default)]
    pub tty: bool,
}

impl App {
    /// Returns the isolator with the given name, if declared.
    #[must_use]
    pub fn isolator(&self, name: &str) -> Option<&Isolator> {
        self.isolators.iter().find(|i| i.name == name)
    }

    /// Returns the parsed namespace isolator, if declared.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidManifest`] if the isolator value does not
    /// have the expected shape.
    pub fn namespaces(&self) -> Result<Option<LinuxNamespaces>> {
        self.isolator(NAMESPACES_ISOLATOR)
            .map(|iso| {
                serde_json::from_value(iso.value.clone()).map_err(|e| {
                    BerthError::InvalidManifest {
                        message: format!("malformed {NAMESPACES_ISOLATOR} isolator: {e}"),
                    }
                })
            })
            .transpose()
    }

    /// Returns the environment formatted as `NAME=value` entries.
    #[must_use]
    pub fn env_list(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect()
    }
}

/// An environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// An isolation requirement, keyed by name with a free-form value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isolator {
    /// Isolator name, e.g. `os/linux/namespaces`.
    pub name: String,
    /// Isolator-specific value.
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Whether a namespace is shared with the host or created for the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    /// Share the host namespace.
    #[default]
    Host,
    /// Create a new namespace for the container.
    Child,
}

/// Value of the `os/linux/namespaces` isolator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxNamespaces {
    /// IPC namespace.
    pub ipc: NamespaceMode,
    /// Mount namespace.
    pub mount: NamespaceMode,
    /// Network namespace.
    pub net: NamespaceMode,
    /// PID namespace.
    pub pid: NamespaceMode,
    /// User namespace.
    pub user: NamespaceMode,
    /// UTS namespace.
    pub uts: NamespaceMode,
}

impl LinuxNamespaces {
    /// Returns whether a new namespace is requested for the given
    /// namespace name, or `None` if the name is not a known namespace.
    #[must_use]
    pub fn requests(&self, name: &str) -> Option<bool> {
        let mode = match name {
            "ipc" => self.ipc,
            "mount" => self.mount,
            "net" => self.net,
            "pid" => self.pid,
            "user" => self.user,
            "uts" => self.uts,
            _ => return None,
        };
        Some(mode == NamespaceMode::Child)
    }
}

/// A named volume the application expects at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    /// Volume name.
    pub name: String,
    /// Absolute path inside the container.
    pub path: String,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Description of a group of applications run together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    /// Applications in the pod.
    #[serde(default)]
    pub apps: Vec<RuntimeApp>,
    /// Volumes available to the pod.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl PodManifest {
    /// Returns the volumes of the given kind.
    pub fn volumes_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Volume> + 'a {
        self.volumes.iter().filter(move |v| v.kind == kind)
    }
}

/// An application instance inside a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeApp {
    /// Name of the app within the pod.
    pub name: String,
    /// Application definition copied from the image.
    pub app: App,
    /// Image the app came from.
    pub image: RuntimeImage,
}

/// Reference to the image a [`RuntimeApp`] was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeImage {
    /// Image identifier.
    pub name: String,
    /// Image labels.
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// A volume declared on a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name; mounted at `/volumes/<name>`.
    pub name: String,
    /// Driver kind, e.g. `empty` or `host`.
    pub kind: String,
    /// Driver-specific source.
    #[serde(default)]
    pub source: Option<String>,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: Option<bool>,
    /// Octal directory mode, e.g. `"0750"`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owning user id.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Owning group id.
    #[serde(default)]
    pub gid: Option<u32>,
}

impl Volume {
    /// Returns whether the volume is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_manifest_parses_camel_case() {
        let json = r#"{
            "name": "example.com/worker",
            "app": {
                "exec": ["/bin/worker", "--serve"],
                "workingDirectory": "/srv",
                "environment": [{"name": "MODE", "value": "prod"}],
                "mountPoints": [{"name": "data", "path": "/data", "readOnly": true}],
                "isolators": [{
                    "name": "os/linux/namespaces",
                    "value": {"pid": "child", "mount": "child"}
                }]
            }
        }"#;
        let manifest: ImageManifest = serde_json::from_str(json).expect("parse");
        let app = manifest.app.expect("app");
        assert_eq!(app.working_directory, "/srv");
        assert_eq!(app.env_list(), vec!["MODE=prod"]);
        assert!(app.mount_points[0].read_only);

        let ns = app.namespaces().expect("isolator").expect("present");
        assert_eq!(ns.requests("pid"), Some(true));
        assert_eq!(ns.requests("net"), Some(false));
        assert_eq!(ns.requests("cgroup"), None);
    }

    #[test]
    fn malformed_namespace_isolator_is_invalid_manifest() {
        let app = App {
            exec: vec!["/bin/true".into()],
            isolators: vec![Isolator {
                name: NAMESPACES_ISOLATOR.into(),
                value: serde_json::json!({"pid": "sideways"}),
            }],
            ..App::default()
        };
        assert!(matches!(
            app.namespaces(),
            Err(BerthError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn volumes_of_kind_filters() {
        let pod = PodManifest {
            apps: Vec::new(),
            volumes: vec![
                Volume {
                    name: "a".into(),
                    kind: "empty".into(),
                    ..Volume::default()
                },
                Volume {
                    name: "b".into(),
                    kind: "host".into(),
                    ..Volume::default()
                },
            ],
        };
        let names: Vec<_> = pod.volumes_of_kind("host").map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
