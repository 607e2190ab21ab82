//! Guest-side process table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use silo_shared::protocol::StdioPorts;
use silo_shared::{ExitStatus, IoStream, ProcessSpec, SiloError, SiloResult};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Lifecycle of one guest process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProcState {
    /// Created, stdio listeners up, not exec'd. A host may retry
    /// `StartProcess` or go straight to `DeleteProcess` from here.
    Created,
    Running {
        pid: i32,
    },
    Exited(ExitStatus),
}

/// Stdio streams the host will connect; each arrives through a oneshot
/// once the listener accepts it.
#[derive(Default)]
pub(crate) struct PendingStdio {
    pub stdin: Option<oneshot::Receiver<IoStream>>,
    pub stdout: Option<oneshot::Receiver<IoStream>>,
    pub stderr: Option<oneshot::Receiver<IoStream>>,
    pub console: Option<oneshot::Receiver<IoStream>>,
}

pub(crate) struct GuestProcess {
    pub container_id: String,
    pub id: String,
    pub spec: ProcessSpec,
    pub ports: StdioPorts,
    pub stdio: Mutex<PendingStdio>,
    pub state: Mutex<ProcState>,
    pub exit: watch::Sender<Option<ExitStatus>>,
    /// Port acceptors and stdio pumps; aborted at delete.
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GuestProcess {
    pub fn new(
        container_id: String,
        id: String,
        spec: ProcessSpec,
        ports: StdioPorts,
        stdio: PendingStdio,
    ) -> Arc<GuestProcess> {
        let (exit, _) = watch::channel(None);
        Arc::new(GuestProcess {
            container_id,
            id,
            spec,
            ports,
            stdio: Mutex::new(stdio),
            state: Mutex::new(ProcState::Created),
            exit,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ProcState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: ProcState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn record_exit(&self, status: ExitStatus) {
        self.set_state(ProcState::Exited(status));
        self.exit.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(status);
                true
            } else {
                false
            }
        });
    }

    /// Await the exit status; callable by any number of waiters, all of
    /// whom see the same value.
    pub async fn wait(&self) -> SiloResult<ExitStatus> {
        let mut rx = self.exit.subscribe();
        let status = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| SiloError::Internal(format!("process {} dropped", self.id)))?;
        Ok(status.expect("guarded by wait_for"))
    }

    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    pub fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }

    /// Let pumps drain what the process wrote, then cut stragglers. A
    /// hard abort here would drop tail bytes of stdout.
    pub async fn finish_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for mut task in tasks {
            let drained =
                tokio::time::timeout(std::time::Duration::from_secs(2), &mut task).await;
            if drained.is_err() {
                task.abort();
            }
        }
    }
}

/// All processes the agent supervises, keyed by host-assigned id.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    map: Mutex<HashMap<String, Arc<GuestProcess>>>,
}

impl ProcessRegistry {
    pub fn insert(&self, process: Arc<GuestProcess>) -> SiloResult<()> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&process.id) {
            return Err(SiloError::InvalidState(format!(
                "process {} already exists",
                process.id
            )));
        }
        map.insert(process.id.clone(), process);
        Ok(())
    }

    pub fn get(&self, id: &str) -> SiloResult<Arc<GuestProcess>> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SiloError::NotFound(format!("process {}", id)))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<GuestProcess>> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn running_in(&self, container_id: &str) -> u64 {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| {
                p.container_id == container_id
                    && matches!(p.state(), ProcState::Running { .. })
            })
            .count() as u64
    }
}
