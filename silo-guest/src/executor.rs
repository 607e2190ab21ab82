//! Process spawning and supervision inside the guest.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use silo_shared::config::ProcessUser;
use silo_shared::constants::container::DEFAULT_PATH;
use silo_shared::{ExitStatus, ProcessSpec, SiloError, SiloResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::registry::{GuestProcess, PendingStdio, ProcState};
use crate::scope::Scope;
use crate::AgentOptions;

/// Resolve argv[0] to an executable path, searching PATH for bare
/// names. With a chroot scope, candidates are checked under the rootfs
/// but returned as in-container paths.
pub(crate) fn resolve_executable(
    spec: &ProcessSpec,
    scope: &Scope,
    privileged: bool,
) -> SiloResult<PathBuf> {
    let program = spec
        .arguments
        .first()
        .ok_or_else(|| SiloError::InvalidArgument("empty argument vector".into()))?;
    let chrooted = privileged && scope.spec.chroot && scope.rootfs.is_some();
    let check_root = if chrooted {
        scope.rootfs.clone().unwrap_or_default()
    } else {
        PathBuf::from("/")
    };

    let exists = |candidate: &Path| -> bool {
        let probe = if candidate.is_absolute() {
            check_root.join(candidate.strip_prefix("/").unwrap_or(candidate))
        } else {
            candidate.to_path_buf()
        };
        probe
            .metadata()
            .map(|m| m.is_file() && is_executable(&m))
            .unwrap_or(false)
    };

    if program.contains('/') {
        let candidate = PathBuf::from(program);
        if exists(&candidate) {
            return Ok(candidate);
        }
        return Err(SiloError::Internal(
            "failed to find target executable".into(),
        ));
    }

    let path_var = spec.env("PATH").unwrap_or(DEFAULT_PATH);
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(program);
        if exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(SiloError::Internal(
        "failed to find target executable".into(),
    ))
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// Resolve a `"name"` / `"name:group"` user against the rootfs passwd
/// and group databases.
pub(crate) fn resolve_user(user: &ProcessUser, rootfs: &Path) -> SiloResult<(u32, u32, Vec<u32>)> {
    match user {
        ProcessUser::Id {
            uid,
            gid,
            additional_gids,
        } => Ok((*uid, *gid, additional_gids.clone())),
        ProcessUser::Name(name) => {
            let (user_name, group_name) = match name.split_once(':') {
                Some((user, group)) => (user, Some(group)),
                None => (name.as_str(), None),
            };
            let passwd = std::fs::read_to_string(rootfs.join("etc/passwd"))
                .map_err(|e| SiloError::Io(format!("failed to read passwd: {}", e)))?;
            let (uid, passwd_gid) = lookup_passwd(&passwd, user_name).ok_or_else(|| {
                SiloError::NotFound(format!("user {} in passwd", user_name))
            })?;
            let gid = match group_name {
                Some(group) => {
                    let groups = std::fs::read_to_string(rootfs.join("etc/group"))
                        .map_err(|e| SiloError::Io(format!("failed to read group: {}", e)))?;
                    lookup_group(&groups, group).ok_or_else(|| {
                        SiloError::NotFound(format!("group {} in group db", group))
                    })?
                }
                None => passwd_gid,
            };
            Ok((uid, gid, Vec::new()))
        }
    }
}

fn lookup_passwd(passwd: &str, name: &str) -> Option<(u32, u32)> {
    for line in passwd.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(name) {
            continue;
        }
        let _password = fields.next();
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        return Some((uid, gid));
    }
    None
}

fn lookup_group(groups: &str, name: &str) -> Option<u32> {
    for line in groups.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(name) {
            continue;
        }
        let _password = fields.next();
        return fields.next()?.parse().ok();
    }
    None
}

/// Exec a created process: spawn, wire stdio pumps, attach the cgroup,
/// and start the wait task that publishes the exit status.
pub(crate) async fn launch(
    process: &Arc<GuestProcess>,
    scope: &Arc<Scope>,
    options: &AgentOptions,
) -> SiloResult<()> {
    let resolved = resolve_executable(&process.spec, scope, options.privileged)?;

    let mut cmd = if scope.spec.use_init {
        let shim = match &options.init_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe()
                .map_err(|e| SiloError::Internal(format!("cannot locate agent binary: {}", e)))?,
        };
        let mut cmd = Command::new(shim);
        cmd.arg("init-shim").arg("--").arg(&resolved);
        cmd.args(&process.spec.arguments[1..]);
        cmd
    } else {
        let mut cmd = Command::new(&resolved);
        cmd.args(&process.spec.arguments[1..]);
        cmd
    };

    cmd.env_clear();
    for kv in &process.spec.environment {
        if let Some((key, value)) = kv.split_once('=') {
            cmd.env(key, value);
        }
    }
    if process.spec.env("PATH").is_none() {
        cmd.env("PATH", DEFAULT_PATH);
    }
    if let Some(cwd) = &process.spec.working_directory {
        if !options.privileged {
            cmd.current_dir(cwd);
        }
        // Chrooted processes chdir after the chroot, below.
    }
    cmd.kill_on_drop(false);

    if options.privileged {
        let (uid, gid, additional_gids) = resolve_user(
            &process.spec.user,
            scope.rootfs.as_deref().unwrap_or(Path::new("/")),
        )?;
        cmd.uid(uid).gid(gid);

        let chroot_dir = if scope.spec.chroot {
            scope.rootfs.clone()
        } else {
            None
        };
        let cwd = process
            .spec
            .working_directory
            .clone()
            .unwrap_or_else(|| "/".to_string());
        let rlimits = process.spec.rlimits.clone();
        let new_pid_ns = scope.spec.new_pid_namespace;
        let capabilities = process.spec.capabilities.clone();
        unsafe {
            cmd.pre_exec(move || {
                pre_exec_setup(
                    chroot_dir.as_deref(),
                    &cwd,
                    &rlimits,
                    &additional_gids,
                    new_pid_ns,
                    &capabilities,
                )
            });
        }
    } else {
        unsafe {
            cmd.pre_exec(|| {
                // Own process group so signals stay contained.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let pending = {
        let mut stdio = process.stdio.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *stdio)
    };

    // Terminal processes attach to a pty; the master pairs with the
    // console stream. Pipe processes get per-stream pipes or /dev/null.
    let console_master = if process.spec.terminal {
        let pty = nix::pty::openpty(None, None)
            .map_err(|e| SiloError::Internal(format!("failed to open pty: {}", e)))?;
        let slave_out = pty
            .slave
            .try_clone()
            .map_err(|e| SiloError::Internal(format!("failed to dup pty slave: {}", e)))?;
        let slave_err = pty
            .slave
            .try_clone()
            .map_err(|e| SiloError::Internal(format!("failed to dup pty slave: {}", e)))?;
        cmd.stdin(Stdio::from(pty.slave));
        cmd.stdout(Stdio::from(slave_out));
        cmd.stderr(Stdio::from(slave_err));
        Some(pty.master)
    } else {
        cmd.stdin(if pending.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if pending.stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if pending.stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        None
    };

    let mut child = cmd.spawn().map_err(|e| {
        SiloError::Internal(format!("failed to spawn {}: {}", resolved.display(), e))
    })?;
    let pid = child.id().map(|p| p as i32).unwrap_or(-1);
    process.set_state(ProcState::Running { pid });
    debug!(process = %process.id, pid, program = %resolved.display(), "started process");

    if let Some(procs_file) = scope.cgroup_procs() {
        if let Err(e) = std::fs::write(&procs_file, format!("{}\n", pid)) {
            warn!(process = %process.id, "cgroup attach failed: {}", e);
        }
    }

    match console_master {
        Some(master) => wire_console(process, pending, master)?,
        None => wire_stdio(process, pending, &mut child),
    }

    // Reap and publish.
    let proc_ref = Arc::clone(process);
    let wait_task = tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => exit_status_from(status),
            Err(e) => {
                warn!(process = %proc_ref.id, "wait failed: {}", e);
                ExitStatus::Signaled(libc::SIGKILL)
            }
        };
        trace!(process = %proc_ref.id, code = status.code(), "process exited");
        proc_ref.record_exit(status);
    });
    process.track(wait_task);
    Ok(())
}

fn exit_status_from(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitStatus::Exited(code),
        None => ExitStatus::Signaled(status.signal().unwrap_or(libc::SIGKILL)),
    }
}

fn wire_stdio(
    process: &Arc<GuestProcess>,
    pending: PendingStdio,
    child: &mut tokio::process::Child,
) {
    if let (Some(receiver), Some(mut stdin)) = (pending.stdin, child.stdin.take()) {
        let id = process.id.clone();
        process.track(tokio::spawn(async move {
            if let Ok(stream) = receiver.await {
                let (mut read, _write) = tokio::io::split(stream);
                if let Err(e) = tokio::io::copy(&mut read, &mut stdin).await {
                    trace!(process = %id, "stdin pump ended: {}", e);
                }
            }
            // Dropping stdin delivers EOF.
        }));
    }
    if let (Some(receiver), Some(mut stdout)) = (pending.stdout, child.stdout.take()) {
        let id = process.id.clone();
        process.track(tokio::spawn(async move {
            if let Ok(stream) = receiver.await {
                let (_read, mut write) = tokio::io::split(stream);
                if let Err(e) = tokio::io::copy(&mut stdout, &mut write).await {
                    trace!(process = %id, "stdout pump ended: {}", e);
                }
                let _ = write.shutdown().await;
            }
        }));
    }
    if let (Some(receiver), Some(mut stderr)) = (pending.stderr, child.stderr.take()) {
        let id = process.id.clone();
        process.track(tokio::spawn(async move {
            if let Ok(stream) = receiver.await {
                let (_read, mut write) = tokio::io::split(stream);
                if let Err(e) = tokio::io::copy(&mut stderr, &mut write).await {
                    trace!(process = %id, "stderr pump ended: {}", e);
                }
                let _ = write.shutdown().await;
            }
        }));
    }
}

/// Pump the pty master against the console stream.
fn wire_console(
    process: &Arc<GuestProcess>,
    pending: PendingStdio,
    master: std::os::fd::OwnedFd,
) -> SiloResult<()> {
    let Some(receiver) = pending.console else {
        return Ok(());
    };
    let master_in = master
        .try_clone()
        .map_err(|e| SiloError::Internal(format!("failed to dup pty master: {}", e)))?;
    let id = process.id.clone();
    process.track(tokio::spawn(async move {
        let Ok(stream) = receiver.await else {
            return;
        };
        let (mut stream_read, mut stream_write) = tokio::io::split(stream);
        let mut master_read = tokio::fs::File::from_std(std::fs::File::from(master));
        let mut master_write = tokio::fs::File::from_std(std::fs::File::from(master_in));
        let outbound = async {
            let _ = tokio::io::copy(&mut master_read, &mut stream_write).await;
            let _ = stream_write.shutdown().await;
        };
        let inbound = async {
            let _ = tokio::io::copy(&mut stream_read, &mut master_write).await;
        };
        tokio::join!(outbound, inbound);
        trace!(process = %id, "console pumps finished");
    }));
    Ok(())
}

/// Everything that must happen between fork and exec, in async-signal-
/// safe territory: process group, namespaces, rlimits, chroot, cwd,
/// groups, capabilities.
fn pre_exec_setup(
    chroot_dir: Option<&Path>,
    cwd: &str,
    rlimits: &[silo_shared::config::Rlimit],
    additional_gids: &[u32],
    new_pid_ns: bool,
    capabilities: &[String],
) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    if new_pid_ns && unsafe { libc::unshare(libc::CLONE_NEWPID | libc::CLONE_NEWNS) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    if !additional_gids.is_empty() {
        let gids: Vec<libc::gid_t> = additional_gids.iter().map(|g| *g as libc::gid_t).collect();
        if unsafe { libc::setgroups(gids.len(), gids.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    for rlimit in rlimits {
        if let Some(resource) = rlimit_resource(&rlimit.name) {
            let limit = libc::rlimit {
                rlim_cur: rlimit.soft,
                rlim_max: rlimit.hard,
            };
            if unsafe { libc::setrlimit(resource, &limit) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }

    if let Some(dir) = chroot_dir {
        let c_dir = std::ffi::CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        if unsafe { libc::chroot(c_dir.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    let c_cwd = std::ffi::CString::new(cwd.as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::chdir(c_cwd.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    apply_capabilities(capabilities)?;
    #[cfg(not(target_os = "linux"))]
    let _ = capabilities;

    Ok(())
}

/// Restrict the bounding set to the named capabilities. An empty list
/// leaves the kernel default in place.
#[cfg(target_os = "linux")]
fn apply_capabilities(names: &[String]) -> std::io::Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    use std::str::FromStr;
    let mut keep = caps::CapsHashSet::new();
    for name in names {
        match caps::Capability::from_str(name) {
            Ok(cap) => {
                keep.insert(cap);
            }
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown capability {}", name),
                ))
            }
        }
    }
    let bounding = caps::read(None, caps::CapSet::Bounding)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    for cap in bounding.difference(&keep) {
        caps::drop(None, caps::CapSet::Bounding, *cap)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    }
    Ok(())
}

fn rlimit_resource(name: &str) -> Option<u32> {
    let resource = match name {
        "RLIMIT_NOFILE" => libc::RLIMIT_NOFILE,
        "RLIMIT_NPROC" => libc::RLIMIT_NPROC,
        "RLIMIT_CORE" => libc::RLIMIT_CORE,
        "RLIMIT_FSIZE" => libc::RLIMIT_FSIZE,
        "RLIMIT_STACK" => libc::RLIMIT_STACK,
        "RLIMIT_CPU" => libc::RLIMIT_CPU,
        "RLIMIT_AS" => libc::RLIMIT_AS,
        "RLIMIT_MEMLOCK" => libc::RLIMIT_MEMLOCK,
        _ => return None,
    };
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_shared::ScopeSpec;

    fn host_scope() -> Arc<Scope> {
        Arc::new(Scope {
            container_id: "test".into(),
            spec: ScopeSpec::default(),
            rootfs: None,
            cgroup_dir: None,
        })
    }

    #[test]
    fn test_resolve_absolute_path() {
        let spec = ProcessSpec::new(["/bin/sh", "-c", "exit 0"]);
        let resolved = resolve_executable(&spec, &host_scope(), false).unwrap();
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_via_path_search() {
        let mut spec = ProcessSpec::new(["sh"]);
        spec.environment.push("PATH=/usr/bin:/bin".into());
        let resolved = resolve_executable(&spec, &host_scope(), false).unwrap();
        assert!(resolved.ends_with("sh"), "got {}", resolved.display());
    }

    #[test]
    fn test_resolve_missing_binary_message() {
        let spec = ProcessSpec::new(["definitely-not-a-real-binary-name"]);
        let err = resolve_executable(&spec, &host_scope(), false).unwrap_err();
        assert!(err.to_string().contains("failed to find target executable"));
    }

    #[test]
    fn test_lookup_passwd_and_group() {
        let passwd = "root:x:0:0:root:/root:/bin/sh\nweb:x:33:33:www:/var/www:/sbin/nologin\n";
        assert_eq!(lookup_passwd(passwd, "web"), Some((33, 33)));
        assert_eq!(lookup_passwd(passwd, "nobody"), None);

        let group = "root:x:0:\nwww-data:x:33:web\n";
        assert_eq!(lookup_group(group, "www-data"), Some(33));
        assert_eq!(lookup_group(group, "missing"), None);
    }

    #[test]
    fn test_resolve_user_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/passwd"),
            "app:x:1000:1000::/home/app:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("etc/group"), "staff:x:50:app\n").unwrap();

        let user = ProcessUser::Name("app".into());
        assert_eq!(resolve_user(&user, tmp.path()).unwrap(), (1000, 1000, vec![]));

        let user = ProcessUser::Name("app:staff".into());
        assert_eq!(resolve_user(&user, tmp.path()).unwrap(), (1000, 50, vec![]));
    }
}
