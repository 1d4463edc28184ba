//! Linux namespace management for container isolation.
//!
//! Provides the set of namespace kinds a pod can request, `unshare(2)` for
//! creating them, and `setns(2)` for joining the namespaces held by a
//! container's init process.

pub mod user;
pub mod uts;

use std::fmt;
use std::os::fd::OwnedFd;

use berth_common::error::{BerthError, Result};
use berth_common::manifest::LinuxNamespaces;
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// A kernel namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// User and group id mappings. Always joined first.
    User,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Hostname and domain name.
    Uts,
    /// Network stack.
    Net,
    /// Process ids.
    Pid,
    /// Mount table. Always joined last, since it changes `/proc`.
    Mount,
}

impl NamespaceKind {
    /// Every kind, in join order.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Ipc,
        Self::Uts,
        Self::Net,
        Self::Pid,
        Self::Mount,
    ];

    /// Parses a policy name (`ipc`, `mount`, `net`, `pid`, `user`, `uts`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Name used in manifests and host policy.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mount => "mount",
        }
    }

    /// Entry name under `/proc/<pid>/ns/` used to join this namespace.
    ///
    /// For PID namespaces this is `pid_for_children`: the init process
    /// unshares its PID namespace, which only applies to its children.
    #[must_use]
    pub const fn proc_entry(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid_for_children",
            Self::Mount => "mnt",
        }
    }

    /// Flag passed to `unshare(2)` / `setns(2)`.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Mount => CloneFlags::CLONE_NEWNS,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The namespaces created for a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet(Vec<NamespaceKind>);

impl Default for NamespaceSet {
    /// IPC, UTS, PID and mount isolation. Network and user namespaces are
    /// only created when an isolator asks for them.
    fn default() -> Self {
        Self::from_kinds([
            NamespaceKind::Ipc,
            NamespaceKind::Uts,
            NamespaceKind::Pid,
            NamespaceKind::Mount,
        ])
    }
}

impl NamespaceSet {
    /// Builds a set from the given kinds, deduplicated and in join order.
    pub fn from_kinds(kinds: impl IntoIterator<Item = NamespaceKind>) -> Self {
        let mut kinds: Vec<_> = kinds.into_iter().collect();
        kinds.sort_unstable();
        kinds.dedup();
        Self(kinds)
    }

    /// Builds the set requested by an app's namespace isolator.
    #[must_use]
    pub fn from_isolator(isolator: &LinuxNamespaces) -> Self {
        Self::from_kinds(
            NamespaceKind::ALL
                .into_iter()
                .filter(|k| isolator.requests(k.name()).unwrap_or(false)),
        )
    }

    /// Parses a comma separated list such as `pid,mount`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] for an unknown namespace name.
    pub fn parse(list: &str) -> Result<Self> {
        let mut kinds = Vec::new();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let kind = NamespaceKind::from_name(name).ok_or_else(|| BerthError::Config {
                message: format!("unknown namespace {name:?}"),
            })?;
            kinds.push(kind);
        }
        Ok(Self::from_kinds(kinds))
    }

    /// Returns whether the set contains `kind`.
    #[must_use]
    pub fn contains(&self, kind: NamespaceKind) -> bool {
        self.0.contains(&kind)
    }

    /// Returns the kinds in join order.
    #[must_use]
    pub fn kinds(&self) -> &[NamespaceKind] {
        &self.0
    }

    /// Combined flags for `unshare(2)`.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        self.0
            .iter()
            .fold(CloneFlags::empty(), |acc, k| acc | k.clone_flag())
    }

    /// Returns the list formatted for [`NamespaceSet::parse`].
    #[must_use]
    pub fn to_list(&self) -> String {
        self.0
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Creates every namespace in the set for the calling process.
    ///
    /// # Errors
    ///
    /// Returns an error if the `unshare(2)` syscall fails.
    pub fn unshare(&self) -> Result<()> {
        nix::sched::unshare(self.clone_flags()).map_err(|e| BerthError::Io {
            path: "unshare".into(),
            source: e.into(),
        })?;
        Ok(())
    }
}

/// Open handles to the namespaces of a running process.
///
/// Opened in the parent before `fork(2)`, so that joining them in the child
/// only issues `setns(2)` calls.
#[derive(Debug)]
pub struct NamespaceFds(Vec<(NamespaceKind, OwnedFd)>);

impl NamespaceFds {
    /// Opens `/proc/<pid>/ns/*` for every kind in `set`.
    ///
    /// # Errors
    ///
    /// Returns an error if any namespace file cannot be opened.
    pub fn open(pid: u32, set: &NamespaceSet) -> Result<Self> {
        let mut fds = Vec::with_capacity(set.kinds().len());
        for &kind in set.kinds() {
            let path = format!("/proc/{pid}/ns/{}", kind.proc_entry());
            let file = std::fs::File::open(&path).map_err(|e| BerthError::io(&path, e))?;
            fds.push((kind, OwnedFd::from(file)));
        }
        Ok(Self(fds))
    }

    /// Removes and returns the handle for `kind`, if it was opened.
    ///
    /// Used for the PID namespace, which has to be joined by the thread that
    /// forks rather than by the child itself.
    pub fn take(&mut self, kind: NamespaceKind) -> Option<OwnedFd> {
        let index = self.0.iter().position(|(k, _)| *k == kind)?;
        Some(self.0.remove(index).1)
    }

    /// Joins every opened namespace, in order.
    ///
    /// Safe to call between `fork(2)` and `exec(2)`, since it does not allocate.
    ///
    /// # Errors
    ///
    /// Returns the `setns(2)` error of the first namespace that fails.
    pub fn enter(&self) -> std::io::Result<()> {
        for (kind, fd) in &self.0 {
            nix::sched::setns(fd, kind.clone_flag())?;
        }
        Ok(())
    }
}
