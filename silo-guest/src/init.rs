//! Minimal init shim.
//!
//! Runs as pid 1 of a container scope when `use_init` is set: spawns
//! the real workload, forwards the signals a supervisor sends, and
//! reaps every zombie that lands on it. Exits with the child's code
//! (128+signum for signal deaths).

use std::process::{Command, Stdio};

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{trace, warn};

/// Signals forwarded to the child rather than acted on.
const FORWARDED: &[SignalKind] = &[
    SignalKind::terminate(),
    SignalKind::interrupt(),
    SignalKind::hangup(),
    SignalKind::quit(),
    SignalKind::user_defined1(),
    SignalKind::user_defined2(),
];

/// Run `command` under the shim; returns the exit code to die with.
pub async fn run(command: Vec<String>) -> i32 {
    let Some((program, args)) = command.split_first() else {
        eprintln!("init-shim: no command");
        return 127;
    };

    let child = match Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            eprintln!("init-shim: failed to exec {}: {}", program, e);
            return 127;
        }
    };
    let child_pid = Pid::from_raw(child.id() as i32);

    let mut sigchld = match signal(SignalKind::child()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("init-shim: no SIGCHLD stream: {}", e);
            return 127;
        }
    };
    let mut forwarded = Vec::new();
    for kind in FORWARDED {
        match signal(*kind) {
            Ok(stream) => forwarded.push((*kind, stream)),
            Err(e) => warn!("init-shim: cannot trap {:?}: {}", kind, e),
        }
    }

    // The child may have died before the SIGCHLD handler registered.
    if let Some(code) = reap(child_pid) {
        return code;
    }

    loop {
        let has_forwarded = !forwarded.is_empty();
        let forward_any = async {
            let polls = forwarded
                .iter_mut()
                .map(|(kind, stream)| Box::pin(async move {
                    stream.recv().await;
                    *kind
                }));
            futures::future::select_all(polls).await.0
        };

        tokio::select! {
            kind = forward_any, if has_forwarded => {
                if let Ok(sig) = Signal::try_from(kind.as_raw_value()) {
                    trace!("init-shim: forwarding {}", sig);
                    let _ = nix::sys::signal::kill(child_pid, sig);
                }
            }
            _ = sigchld.recv() => {
                // Reap everything that is ready; the workload's own exit
                // ends the shim.
                if let Some(code) = reap(child_pid) {
                    return code;
                }
            }
        }
    }
}

/// Collect exited children; `Some(code)` once the primary child died.
fn reap(child_pid: Pid) -> Option<i32> {
    let mut primary_code = None;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if pid == child_pid {
                    primary_code = Some(code);
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                if pid == child_pid {
                    primary_code = Some(128 + sig as i32);
                }
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break, // ECHILD: nothing left
        }
    }
    primary_code
}
