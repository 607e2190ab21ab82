//! Serializable configuration types shared between host and guest.
//!
//! Everything here crosses the agent wire as JSON, so the shapes are kept
//! free of host-only handles (stdio sinks, hypervisor objects). Host-side
//! wrappers that carry those live in the `silo` crate.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::container::DEFAULT_HOSTNAME;

/// How a process resolves its user inside the guest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProcessUser {
    /// Explicit ids, optionally with supplementary groups.
    Id {
        uid: u32,
        gid: u32,
        #[serde(default)]
        additional_gids: Vec<u32>,
    },
    /// `"name"` or `"name:group"`, resolved against the rootfs passwd/group
    /// databases by the guest.
    Name(String),
}

impl Default for ProcessUser {
    fn default() -> Self {
        ProcessUser::Id {
            uid: 0,
            gid: 0,
            additional_gids: Vec::new(),
        }
    }
}

/// A single resource limit applied before exec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit name in OCI spelling, e.g. `RLIMIT_NOFILE`.
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

/// Process configuration: everything the guest needs to fork and exec.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// argv; `arguments[0]` is resolved against PATH when not absolute.
    pub arguments: Vec<String>,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub user: ProcessUser,
    /// Allocate a pty and carry stdio over a single console stream.
    #[serde(default)]
    pub terminal: bool,
    /// Linux capability names to retain, e.g. `CAP_NET_BIND_SERVICE`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
}

impl ProcessSpec {
    pub fn new(arguments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Value of a `KEY=VALUE` environment entry, if present.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// The primary filesystem mount for a container's root directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    /// Mount type as the guest sees it: `ext4`, `virtiofs`, ...
    pub fs_type: String,
    /// Block device path or share tag, depending on `fs_type`.
    pub source: String,
    /// Always `/` for a rootfs; kept explicit so the same shape serves
    /// secondary mounts.
    pub destination: String,
    /// Mount options, e.g. `["ro"]`.
    #[serde(default)]
    pub options: Vec<String>,
}

impl RootFs {
    pub fn block(source: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            fs_type: "ext4".into(),
            source: source.into(),
            destination: "/".into(),
            options,
        }
    }

    pub fn share(tag: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            fs_type: "virtiofs".into(),
            source: tag.into(),
            destination: "/".into(),
            options,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Additional mount handed to the guest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub fs_type: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// DNS configuration rendered into `/etc/resolv.conf`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// One `/etc/hosts` line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    pub ip: String,
    pub hostname: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// `/etc/hosts` contents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hosts {
    pub entries: Vec<HostEntry>,
}

/// Network interface attached to the VM and configured by the agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Guest-side device name, e.g. `eth0`.
    pub name: String,
    /// CIDR address, e.g. `192.168.64.2/24`.
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

/// Unix socket relayed between host and guest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnixSocket {
    pub host_path: PathBuf,
    pub guest_path: PathBuf,
}

/// Container configuration.
///
/// Managers hand callers a default-initialized value and apply their
/// configuration closure on top before `create`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub process: ProcessSpec,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub dns: Option<Dns>,
    #[serde(default)]
    pub hosts: Option<Hosts>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub sockets: Vec<UnixSocket>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Wrap the primary process in the reaping, signal-forwarding init shim.
    #[serde(default)]
    pub use_init: bool,
    /// Expose nested virtualization to the guest.
    #[serde(default)]
    pub virtualization: bool,
    /// Pod only: one PID namespace across all containers.
    #[serde(default)]
    pub share_process_namespace: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            process: ProcessSpec::default(),
            hostname: None,
            dns: None,
            hosts: None,
            mounts: Vec::new(),
            sockets: Vec::new(),
            interfaces: Vec::new(),
            cpus: 2,
            memory_bytes: 512 * 1024 * 1024,
            use_init: false,
            virtualization: false,
            share_process_namespace: false,
            labels: HashMap::new(),
        }
    }
}

impl ContainerConfig {
    /// Rejects configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.cpus == 0 {
            return Err("cpu count must be positive".into());
        }
        if self.memory_bytes == 0 {
            return Err("memory size must be positive".into());
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.mounts {
            if !seen.insert(m.destination.as_str()) {
                return Err(format!("conflicting mounts at {}", m.destination));
            }
        }
        Ok(())
    }

    pub fn hostname_or_default(&self) -> &str {
        self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }
}

impl Dns {
    /// Render `/etc/resolv.conf` contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("domain {}\n", domain));
        }
        if !self.search_domains.is_empty() {
            out.push_str(&format!("search {}\n", self.search_domains.join(" ")));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

impl Hosts {
    /// Render `/etc/hosts` contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            match &e.comment {
                Some(c) => out.push_str(&format!("{}\t{}\t# {}\n", e.ip, e.hostname, c)),
                None => out.push_str(&format!("{}\t{}\n", e.ip, e.hostname)),
            }
        }
        out
    }

    /// The conventional localhost lines plus the container's own hostname.
    pub fn with_defaults(hostname: &str) -> Self {
        Self {
            entries: vec![
                HostEntry {
                    ip: "127.0.0.1".into(),
                    hostname: "localhost".into(),
                    comment: None,
                },
                HostEntry {
                    ip: "::1".into(),
                    hostname: "localhost".into(),
                    comment: None,
                },
                HostEntry {
                    ip: "127.0.1.1".into(),
                    hostname: hostname.into(),
                    comment: None,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_cpus() {
        let config = ContainerConfig {
            cpus: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("cpu count"));
    }

    #[test]
    fn test_validate_rejects_conflicting_mounts() {
        let mut config = ContainerConfig::default();
        for _ in 0..2 {
            config.mounts.push(Mount {
                fs_type: "virtiofs".into(),
                source: "tag".into(),
                destination: "/mnt/data".into(),
                options: vec![],
            });
        }
        assert!(config.validate().unwrap_err().contains("conflicting mounts"));
    }

    #[test]
    fn test_dns_render() {
        let dns = Dns {
            nameservers: vec!["8.8.8.8".into(), "8.8.4.4".into()],
            domain: None,
            search_domains: vec!["example.com".into()],
            options: vec![],
        };
        let text = dns.render();
        assert!(text.contains("nameserver 8.8.8.8\n"));
        assert!(text.contains("nameserver 8.8.4.4\n"));
        assert!(text.contains("search example.com\n"));
    }

    #[test]
    fn test_process_spec_env_lookup() {
        let mut spec = ProcessSpec::new(["/bin/true"]);
        spec.environment.push("PATH=/usr/bin:/bin".into());
        assert_eq!(spec.env("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(spec.env("HOME"), None);
    }
}
