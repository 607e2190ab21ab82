//! Per-container isolation scopes.
//!
//! A scope records where a container's rootfs lives, whether processes
//! chroot into it, its namespace arrangement, and its cgroup ceilings.
//! Provisioning a scope also writes `/etc/resolv.conf` and `/etc/hosts`
//! into the rootfs, before any read-only remount seals it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use silo_shared::config::{Dns, Hosts};
use silo_shared::{ScopeSpec, SiloError, SiloResult};
use tracing::{debug, trace, warn};

/// Cgroup subtree the agent manages.
const CGROUP_ROOT: &str = "/sys/fs/cgroup/silo";

/// One provisioned container scope.
pub(crate) struct Scope {
    pub container_id: String,
    pub spec: ScopeSpec,
    /// Usable rootfs path (identity in a real guest, the backing host
    /// directory when embedded); `None` for scopes without a rootfs.
    pub rootfs: Option<PathBuf>,
    pub cgroup_dir: Option<PathBuf>,
}

impl Scope {
    /// cgroup.procs path for attaching pids, when a cgroup exists.
    pub fn cgroup_procs(&self) -> Option<PathBuf> {
        self.cgroup_dir.as_ref().map(|dir| dir.join("cgroup.procs"))
    }
}

/// VM-wide defaults established at bootstrap, inherited by scopes that
/// do not override them.
#[derive(Clone, Default)]
pub(crate) struct ScopeDefaults {
    pub hostname: Option<String>,
    pub dns: Option<Dns>,
    pub hosts: Option<Hosts>,
}

#[derive(Default)]
pub(crate) struct ScopeSet {
    defaults: Mutex<ScopeDefaults>,
    scopes: Mutex<HashMap<String, Arc<Scope>>>,
}

impl ScopeSet {
    pub fn set_defaults(&self, defaults: ScopeDefaults) {
        *self.defaults.lock().unwrap_or_else(|e| e.into_inner()) = defaults;
    }

    pub fn defaults(&self) -> ScopeDefaults {
        self.defaults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Provision and register a scope. `rootfs` is the effective path
    /// resolved through the mount table.
    pub fn provision(
        &self,
        container_id: &str,
        spec: ScopeSpec,
        rootfs: Option<PathBuf>,
        privileged: bool,
    ) -> SiloResult<Arc<Scope>> {
        {
            let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
            if scopes.contains_key(container_id) {
                return Err(SiloError::InvalidState(format!(
                    "scope {} already provisioned",
                    container_id
                )));
            }
        }

        if let Some(rootfs) = &rootfs {
            self.write_etc_files(container_id, &spec, rootfs)?;
        }

        let cgroup_dir = if privileged {
            match create_cgroup(container_id, &spec) {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(container = container_id, "cgroup setup failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let scope = Arc::new(Scope {
            container_id: container_id.to_string(),
            spec,
            rootfs,
            cgroup_dir,
        });
        self.scopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container_id.to_string(), Arc::clone(&scope));
        debug!(container = container_id, "provisioned scope");
        Ok(scope)
    }

    pub fn get(&self, container_id: &str) -> SiloResult<Arc<Scope>> {
        self.scopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(container_id)
            .cloned()
            .ok_or_else(|| SiloError::NotFound(format!("scope {}", container_id)))
    }

    /// Drop a scope. Idempotent.
    pub fn remove(&self, container_id: &str) {
        let removed = self
            .scopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_id);
        if let Some(scope) = removed {
            if let Some(dir) = &scope.cgroup_dir {
                if let Err(e) = std::fs::remove_dir(dir) {
                    trace!(container = container_id, "cgroup removal: {}", e);
                }
            }
        }
    }

    /// Scope-level DNS/hosts replace the bootstrap defaults wholesale;
    /// no merging.
    fn write_etc_files(
        &self,
        container_id: &str,
        spec: &ScopeSpec,
        rootfs: &Path,
    ) -> SiloResult<()> {
        let defaults = self.defaults();
        let dns = spec.dns.clone().or(defaults.dns);
        let hosts = spec.hosts.clone().or_else(|| {
            defaults
                .hostname
                .as_deref()
                .map(Hosts::with_defaults)
        });

        let etc = rootfs.join("etc");
        if dns.is_some() || hosts.is_some() {
            std::fs::create_dir_all(&etc).map_err(|e| {
                SiloError::Io(format!("failed to create {}: {}", etc.display(), e))
            })?;
        }
        if let Some(dns) = dns {
            let path = etc.join("resolv.conf");
            std::fs::write(&path, dns.render()).map_err(|e| {
                SiloError::Io(format!("failed to write {}: {}", path.display(), e))
            })?;
            debug!(container = container_id, "wrote resolv.conf");
        }
        if let Some(hosts) = hosts {
            let path = etc.join("hosts");
            std::fs::write(&path, hosts.render()).map_err(|e| {
                SiloError::Io(format!("failed to write {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Create the container's cgroup with its cpu/memory ceilings.
fn create_cgroup(container_id: &str, spec: &ScopeSpec) -> SiloResult<Option<PathBuf>> {
    let dir = PathBuf::from(CGROUP_ROOT).join(container_id);
    std::fs::create_dir_all(&dir)
        .map_err(|e| SiloError::Io(format!("failed to create {}: {}", dir.display(), e)))?;
    if let Some(cpus) = spec.cpus {
        // cpu.max: quota and period in microseconds.
        let quota = cpus as u64 * 100_000;
        std::fs::write(dir.join("cpu.max"), format!("{} 100000\n", quota))
            .map_err(|e| SiloError::Io(format!("failed to write cpu.max: {}", e)))?;
    }
    if let Some(memory) = spec.memory_bytes {
        std::fs::write(dir.join("memory.max"), format!("{}\n", memory))
            .map_err(|e| SiloError::Io(format!("failed to write memory.max: {}", e)))?;
    }
    Ok(Some(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_shared::config::Dns;

    #[test]
    fn test_etc_files_written_into_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let scopes = ScopeSet::default();
        scopes.set_defaults(ScopeDefaults {
            hostname: Some("box".into()),
            dns: Some(Dns {
                nameservers: vec!["8.8.8.8".into(), "8.8.4.4".into()],
                ..Default::default()
            }),
            hosts: None,
        });

        scopes
            .provision(
                "c1",
                ScopeSpec::default(),
                Some(tmp.path().to_path_buf()),
                false,
            )
            .unwrap();

        let resolv = std::fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap();
        assert!(resolv.contains("nameserver 8.8.8.8"));
        assert!(resolv.contains("nameserver 8.8.4.4"));
        let hosts = std::fs::read_to_string(tmp.path().join("etc/hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1"));
        assert!(hosts.contains("box"));
    }

    #[test]
    fn test_scope_dns_replaces_default_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let scopes = ScopeSet::default();
        scopes.set_defaults(ScopeDefaults {
            hostname: None,
            dns: Some(Dns {
                nameservers: vec!["1.1.1.1".into()],
                search_domains: vec!["pod.local".into()],
                ..Default::default()
            }),
            hosts: None,
        });

        let spec = ScopeSpec {
            dns: Some(Dns {
                nameservers: vec!["9.9.9.9".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        scopes
            .provision("c1", spec, Some(tmp.path().to_path_buf()), false)
            .unwrap();

        let resolv = std::fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap();
        assert!(resolv.contains("9.9.9.9"));
        // Replacement, not a merge: nothing from the pod default leaks.
        assert!(!resolv.contains("1.1.1.1"));
        assert!(!resolv.contains("pod.local"));
    }

    #[test]
    fn test_duplicate_scope_rejected() {
        let scopes = ScopeSet::default();
        scopes
            .provision("c1", ScopeSpec::default(), None, false)
            .unwrap();
        assert!(scopes
            .provision("c1", ScopeSpec::default(), None, false)
            .is_err());
    }
}
