//! The Service dispatches execute requests, owns the collection of live
//! Executions, and notifies a single observer of every emitted
//! [`ExecutionResponse`] (spec.md §4.4). This module has no knowledge of
//! sessions, WebSockets, or topics — that fanout lives in [`crate::server`],
//! which is the observer this module's `set_observer` installs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::execution::{Execution, ExecutionResponse, ProcessAction};

/// Observer sink installed via [`Service::set_observer`]. The Service
/// holds at most one at a time, matching spec.md's "single-sink observer
/// slot" design note — in this codebase the Server fills this role.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn receive_execution_response(&self, response: ExecutionResponse);
}

/// Opaque handle returned by [`Service::execute`]; the Server threads
/// this through its session → executions table.
pub type ExecutionRef = String;

#[derive(Debug, Clone, Default)]
pub struct NewProcessRequest {
    pub pid: String,
}

/// `req` in spec.md §4.4: `{loopback_payload, new_processes[],
/// processes: map<pid, per-process command>, poll_interval}`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub loopback_payload: Option<String>,
    pub new_processes: Option<Vec<NewProcessRequest>>,
    pub processes: Option<HashMap<String, ProcessAction>>,
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProcessState {
    pub pid: String,
    pub running_command_id: Option<String>,
    pub is_done_logging_in: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub processes: Vec<ProcessState>,
}

/// Dispatches execute requests, owns every live Execution, and relays
/// every emitted ExecutionResponse to the installed observer.
pub struct Service {
    executions: DashMap<ExecutionRef, Arc<Execution>>,
    /// Global pid → owning execution index, so a later `execute()` call
    /// can route a `processes` action to the Execution that actually
    /// owns that pid's Terminal, regardless of which execution this
    /// particular request creates.
    pid_owner: DashMap<String, ExecutionRef>,
    observer: Arc<RwLock<Option<Arc<dyn ExecutionObserver>>>>,
    response_tx: mpsc::Sender<ExecutionResponse>,
    relay_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    active_executions: AtomicUsize,
}

impl Service {
    pub fn new() -> Arc<Self> {
        let (response_tx, mut response_rx) = mpsc::channel::<ExecutionResponse>(512);
        let observer: Arc<RwLock<Option<Arc<dyn ExecutionObserver>>>> = Arc::new(RwLock::new(None));

        let relay_observer = observer.clone();
        let relay_handle = tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let guard = relay_observer.read().await;
                if let Some(observer) = guard.as_ref() {
                    observer.receive_execution_response(response).await;
                } else {
                    debug!("dropping execution response: no observer installed");
                }
            }
        });

        Arc::new(Service {
            executions: DashMap::new(),
            pid_owner: DashMap::new(),
            observer,
            response_tx,
            relay_handle: std::sync::Mutex::new(Some(relay_handle)),
            active_executions: AtomicUsize::new(0),
        })
    }

    /// Installs the single sink that receives every ExecutionResponse the
    /// engine emits. Replaces any previously installed observer.
    pub async fn set_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        *self.observer.write().await = Some(observer);
    }

    /// Creates an Execution, launches requested new processes, and
    /// applies any per-pid actions. Spawn failures are surfaced in the
    /// execution's next emitted response rather than returned here.
    pub fn execute(&self, session_id: &str, req: ExecuteRequest) -> ExecutionRef {
        let (execution, central_rx) = Execution::new(session_id.to_string());

        for new_process in req.new_processes.into_iter().flatten() {
            let pid = new_process.pid;
            match execution.spawn_process(pid.clone()) {
                Ok(()) => {
                    self.pid_owner.insert(pid, execution.id.clone());
                }
                Err(e) => {
                    warn!(pid = %pid, error = %e, "failed to spawn new process");
                }
            }
        }

        for (pid, action) in req.processes.into_iter().flatten() {
            self.apply_process_action(&pid, action);
        }

        if let Some(loopback) = req.loopback_payload {
            execution.set_loopback(loopback);
        }
        if let Some(poll_interval) = req.poll_interval {
            execution.set_poll_interval(poll_interval);
        }

        let id = execution.id.clone();
        self.executions.insert(id.clone(), execution.clone());
        self.active_executions.fetch_add(1, Ordering::Relaxed);

        let response_tx = self.response_tx.clone();
        tokio::spawn(execution.run(central_rx, response_tx));

        id
    }

    /// Routes a `processes` action to whichever Execution owns `pid`,
    /// wherever it was created. Unknown pids surface `NotFound` on the
    /// next response for that execution, per spec.md §7 — but since there
    /// is no owning execution to attach the error to, it is logged and
    /// otherwise dropped (this mirrors the reference implementation,
    /// which has no execution to report through in this case either).
    fn apply_process_action(&self, pid: &str, action: ProcessAction) {
        let Some(owner_id) = self.pid_owner.get(pid).map(|e| e.clone()) else {
            warn!(pid, "process action references unknown pid");
            return;
        };
        match self.executions.get(&owner_id) {
            Some(execution) => execution.apply_action(pid, action),
            None => warn!(pid, execution_id = %owner_id, "owning execution no longer tracked"),
        }
    }

    /// Synchronous snapshot, safe to call from any thread.
    pub fn get_execution_state(&self, execution_ids: &[ExecutionRef]) -> ExecutionState {
        let mut processes = Vec::new();
        for execution_id in execution_ids {
            if let Some(execution) = self.executions.get(execution_id) {
                for (pid, running_command_id, is_done_logging_in) in execution.process_snapshot() {
                    processes.push(ProcessState {
                        pid,
                        running_command_id,
                        is_done_logging_in,
                    });
                }
            }
        }
        ExecutionState { processes }
    }

    pub fn set_poll_interval(&self, execution_id: &str, seconds: u64) -> Result<(), EngineError> {
        match self.executions.get(execution_id) {
            Some(execution) => {
                execution.set_poll_interval(seconds);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "no such execution: {execution_id}"
            ))),
        }
    }

    /// Closes every Execution's Terminals, stops the response relay, and
    /// drops the observer. Best-effort and idempotent per execution
    /// (Terminal::close already is).
    pub async fn shutdown(&self) {
        info!(
            executions = self.active_executions.load(Ordering::Relaxed),
            "shutting down service"
        );
        for entry in self.executions.iter() {
            entry.value().close();
        }
        self.executions.clear();
        self.pid_owner.clear();
        *self.observer.write().await = None;
        if let Some(handle) = self.relay_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        responses: StdMutex<Vec<ExecutionResponse>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl ExecutionObserver for CollectingObserver {
        async fn receive_execution_response(&self, response: ExecutionResponse) {
            self.responses.lock().unwrap().push(response);
            self.notify.notify_waiters();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_with_new_process_emits_response_to_observer() {
        let service = Service::new();
        let observer = Arc::new(CollectingObserver {
            responses: StdMutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        service.set_observer(observer.clone()).await;

        let execution_id = service.execute(
            "session-1",
            ExecuteRequest {
                loopback_payload: Some("lb-1".to_string()),
                new_processes: Some(vec![NewProcessRequest { pid: "p1".to_string() }]),
                poll_interval: Some(1),
                ..Default::default()
            },
        );

        let mut got_ack = false;
        for _ in 0..20 {
            tokio::time::timeout(std::time::Duration::from_millis(500), observer.notify.notified())
                .await
                .ok();
            let responses = observer.responses.lock().unwrap();
            if responses
                .iter()
                .any(|r| r.execution_id == execution_id && r.new_processes.is_some())
            {
                got_ack = true;
                break;
            }
        }
        assert!(got_ack, "expected a new_processes ack for p1");

        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_execution_state_reflects_known_processes() {
        let service = Service::new();
        let execution_id = service.execute(
            "session-2",
            ExecuteRequest {
                new_processes: Some(vec![NewProcessRequest { pid: "p1".to_string() }]),
                poll_interval: Some(5),
                ..Default::default()
            },
        );

        let state = service.get_execution_state(&[execution_id]);
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.processes[0].pid, "p1");

        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_poll_interval_on_unknown_execution_is_not_found() {
        let service = Service::new();
        let result = service.set_poll_interval("does-not-exist", 5);
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        service.shutdown().await;
    }
}
