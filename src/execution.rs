//! Per-execution aggregator: assembles [`ExecutionResponse`]s from the
//! union of reader outputs for an execution's owned processes, batched by
//! a poll-interval window.
//!
//! Each [`Execution`] owns exactly the processes it created via its own
//! `new_processes` (spec's "owning Execution"); a Process's reader output
//! has exactly one consumer for its lifetime, so a later `execute()` call
//! that merely *acts* on an already-existing pid (no `new_processes` of
//! its own) writes/signals that pid's terminal directly but never competes
//! with the owning Execution's aggregator for its output. See DESIGN.md
//! for the full reasoning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::reader::Reader;
use crate::sanitize;
use crate::terminal::{parse_signal, Terminal, TerminalOutput};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Per-pid command requested by a client for an already-running process:
/// input bytes/text, a signal, a stop mark, or a client-chosen tag for the
/// command currently being issued.
#[derive(Debug, Clone, Default)]
pub struct ProcessAction {
    pub send_text: Option<String>,
    pub send_bytes: Option<Vec<u8>>,
    pub signal: Option<String>,
    pub stop_mark: Option<String>,
    pub running_command_id: Option<String>,
}

/// Per-pid state reported back to the client in an [`ExecutionResponse`].
#[derive(Debug, Clone, Default)]
pub struct ProcessUpdate {
    pub output: Option<String>,
    pub is_done: bool,
    pub is_done_logging_in: bool,
    pub running_command_id: Option<String>,
    pub stop_mark_found: bool,
    pub error: Option<String>,
}

/// The wire shape sent to WebSockets and published to topics (plus the
/// `execution_id` the Service/Server use internally to route it).
#[derive(Debug, Clone, Default)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub loopback_payload: Option<String>,
    pub new_processes: Option<Vec<String>>,
    pub processes: Option<HashMap<String, ProcessUpdate>>,
    pub error: Option<String>,
}

/// A single `pid → TerminalOutput` event posted onto an execution's
/// central channel by that pid's reader-forwarding task. This is the
/// "post callback to the event loop from an arbitrary thread" bridge
/// spec.md §9 describes, specialized to carry the originating pid.
struct PidEvent {
    pid: String,
    output: TerminalOutput,
}

/// A logical process inside an [`Execution`]: one Terminal, one Reader,
/// and the bookkeeping spec.md's data model assigns to `Process`.
struct ProcessHandle {
    terminal: Arc<Terminal>,
    _reader: Reader,
    running_command_id: Mutex<Option<String>>,
    is_done_logging_in: AtomicBool,
    stop_mark: Mutex<Option<String>>,
}

/// Created per execute request (spec.md §3). Runs one long-lived
/// aggregator task that loops forever — closed only by
/// [`Execution::close`], called on service shutdown.
pub struct Execution {
    pub id: String,
    pub session_id: String,
    poll_interval_secs: AtomicU64,
    processes: std::sync::RwLock<HashMap<String, Arc<ProcessHandle>>>,
    pending_loopback: Mutex<Option<String>>,
    pending_new_process_acks: Mutex<Vec<String>>,
    pending_errors: Mutex<HashMap<String, String>>,
    central_tx: mpsc::Sender<PidEvent>,
    closed: AtomicBool,
    wake: Notify,
}

impl Execution {
    /// Construct a new Execution and return it alongside the receiving
    /// half of its central channel; the caller is responsible for driving
    /// [`Execution::run`] in its own task (the Service does this).
    pub fn new(session_id: String) -> (Arc<Execution>, mpsc::Receiver<PidEvent>) {
        let (central_tx, central_rx) = mpsc::channel(256);
        let execution = Arc::new(Execution {
            id: Uuid::new_v4().to_string(),
            session_id,
            poll_interval_secs: AtomicU64::new(DEFAULT_POLL_INTERVAL_SECS),
            processes: std::sync::RwLock::new(HashMap::new()),
            pending_loopback: Mutex::new(None),
            pending_new_process_acks: Mutex::new(Vec::new()),
            pending_errors: Mutex::new(HashMap::new()),
            central_tx,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        });
        (execution, central_rx)
    }

    /// Spawn a brand-new PTY-backed process owned by this execution. The
    /// pid is the client-chosen logical identifier (spec.md's `Process`
    /// key), not the OS pid.
    pub fn spawn_process(&self, pid: String) -> Result<(), EngineError> {
        let terminal = match Terminal::start() {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.pending_errors
                    .lock()
                    .unwrap()
                    .insert(pid.clone(), e.to_string());
                return Err(e);
            }
        };
        let (reader, mut rx) = Reader::spawn(terminal.clone(), format!("{}-{pid}", self.id));
        let handle = Arc::new(ProcessHandle {
            terminal,
            _reader: reader,
            running_command_id: Mutex::new(None),
            is_done_logging_in: AtomicBool::new(false),
            stop_mark: Mutex::new(None),
        });
        self.processes
            .write()
            .unwrap()
            .insert(pid.clone(), handle);
        self.pending_new_process_acks.lock().unwrap().push(pid.clone());

        let central_tx = self.central_tx.clone();
        let forward_pid = pid.clone();
        tokio::spawn(async move {
            while let Some(output) = rx.recv().await {
                if central_tx
                    .send(PidEvent {
                        pid: forward_pid.clone(),
                        output,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(())
    }

    /// `true` if this execution owns `pid` (created it as `new`).
    pub fn owns(&self, pid: &str) -> bool {
        self.processes.read().unwrap().contains_key(pid)
    }

    /// Apply a client-requested action to one of this execution's owned
    /// processes. Spawn/write/signal failures become a pending per-pid
    /// error surfaced on the next emitted response, per spec.md §7.
    pub fn apply_action(&self, pid: &str, action: ProcessAction) {
        let handle = match self.processes.read().unwrap().get(pid).cloned() {
            Some(h) => h,
            None => {
                self.pending_errors
                    .lock()
                    .unwrap()
                    .insert(pid.to_string(), "process not found".to_string());
                return;
            }
        };

        if let Some(id) = action.running_command_id {
            *handle.running_command_id.lock().unwrap() = Some(id);
        }
        if let Some(mark) = action.stop_mark {
            *handle.stop_mark.lock().unwrap() = Some(mark);
        }
        if let Some(text) = action.send_text {
            if let Err(e) = handle.terminal.send_text(&text) {
                self.pending_errors
                    .lock()
                    .unwrap()
                    .insert(pid.to_string(), e.to_string());
            }
        }
        if let Some(bytes) = action.send_bytes {
            if let Err(e) = handle.terminal.send_bytes(&bytes) {
                self.pending_errors
                    .lock()
                    .unwrap()
                    .insert(pid.to_string(), e.to_string());
            }
        }
        if let Some(sig_name) = action.signal {
            match parse_signal(&sig_name).and_then(|sig| handle.terminal.send_signal(sig)) {
                Ok(()) => {}
                Err(e) => {
                    self.pending_errors
                        .lock()
                        .unwrap()
                        .insert(pid.to_string(), e.to_string());
                }
            }
        }
    }

    pub fn set_loopback(&self, payload: String) {
        *self.pending_loopback.lock().unwrap() = Some(payload);
    }

    /// Retarget future poll cycles. An in-flight cycle is not shortened
    /// (spec.md §4.3): the new value is only read at the top of the next
    /// iteration of [`Execution::run`].
    pub fn set_poll_interval(&self, seconds: u64) {
        self.poll_interval_secs.store(seconds.max(1), Ordering::Relaxed);
    }

    /// Synchronous snapshot for `Service::get_execution_state`.
    pub fn process_snapshot(&self) -> Vec<(String, Option<String>, bool)> {
        self.processes
            .read()
            .unwrap()
            .iter()
            .map(|(pid, handle)| {
                (
                    pid.clone(),
                    handle.running_command_id.lock().unwrap().clone(),
                    handle.is_done_logging_in.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Close every owned Terminal (spec.md §4.1 close semantics) and stop
    /// the aggregator loop at the top of its next iteration.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        for handle in self.processes.read().unwrap().values() {
            handle.terminal.close();
        }
    }

    /// Drive the poll-cycle aggregator for this execution until
    /// [`Execution::close`] is called. Spawned as its own task by the
    /// Service; never blocks the caller.
    pub async fn run(self: Arc<Self>, mut central_rx: mpsc::Receiver<PidEvent>, response_tx: mpsc::Sender<ExecutionResponse>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let poll_interval = Duration::from_secs(self.poll_interval_secs.load(Ordering::Relaxed));
            let deadline = Instant::now() + poll_interval;
            let mut cycle = Cycle::default();

            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let remaining = deadline - now;

                tokio::select! {
                    _ = self.wake.notified() => {
                        if self.closed.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(remaining) => break,
                    maybe_event = central_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                let pid = event.pid.clone();
                                cycle.apply(&event);
                                self.check_stop_mark(&mut cycle, &pid);
                                if self.cycle_should_close(&cycle) {
                                    break;
                                }
                            }
                            None => {
                                // All processes' readers have exited; keep
                                // waiting out the window so empty cycles
                                // still emit for loopback correlation.
                            }
                        }
                    }
                }
            }

            let response = self.finish_cycle(cycle);
            trace!(execution_id = %self.id, "poll cycle closed");
            if response_tx.send(response).await.is_err() {
                debug!(execution_id = %self.id, "response channel closed, stopping aggregator");
                break;
            }

            if self.closed.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Sanitize `pid`'s accumulated output-so-far this cycle and test it
    /// against that process's installed stop mark, if any. On a match,
    /// marks the cycle closeable so the window doesn't run out the full
    /// `poll_interval` (spec.md §4.3 step 3 / glossary "Stop mark").
    fn check_stop_mark(&self, cycle: &mut Cycle, pid: &str) {
        let Some(handle) = self.processes.read().unwrap().get(pid).cloned() else {
            return;
        };
        let Some(mark) = handle.stop_mark.lock().unwrap().clone() else {
            return;
        };
        let Some(raw) = cycle.output.get(pid) else {
            return;
        };
        let sanitized = sanitize::sanitize(&String::from_utf8_lossy(raw));
        if sanitize::contains_stop_mark(&sanitized, &mark) {
            cycle.stop_mark_found.insert(pid.to_string(), true);
        }
    }

    fn cycle_should_close(&self, cycle: &Cycle) -> bool {
        if cycle.any_stop_mark_found() {
            return true;
        }
        let processes = self.processes.read().unwrap();
        if processes.is_empty() {
            return false;
        }
        processes.keys().all(|pid| cycle.is_done.get(pid).copied().unwrap_or(false))
    }

    fn finish_cycle(&self, cycle: Cycle) -> ExecutionResponse {
        let mut processes_out = HashMap::new();
        let owned = self.processes.read().unwrap();

        for (pid, handle) in owned.iter() {
            let raw = cycle.output.get(pid).cloned().unwrap_or_default();
            let text = String::from_utf8_lossy(&raw).into_owned();
            let stop_mark = handle.stop_mark.lock().unwrap().clone();

            let ctrl_c_recent = handle.terminal.ctrl_c_recently_sent();
            let (rendered, stop_mark_found) = match &stop_mark {
                Some(mark) => {
                    let sanitized = sanitize::sanitize(&text);
                    let found = sanitize::contains_stop_mark(&sanitized, mark);
                    (sanitize::apply_ctrl_c_echo_fix(&sanitized, ctrl_c_recent), found)
                }
                None => (sanitize::apply_ctrl_c_echo_fix(&text, ctrl_c_recent), false),
            };

            let is_done = cycle.is_done.get(pid).copied().unwrap_or(false);
            if is_done && !handle.is_done_logging_in.load(Ordering::Relaxed) {
                handle.is_done_logging_in.store(true, Ordering::Relaxed);
            }
            let running_command_id = handle.running_command_id.lock().unwrap().clone();
            if is_done {
                *handle.running_command_id.lock().unwrap() = None;
            }

            let error = self.pending_errors.lock().unwrap().remove(pid);

            processes_out.insert(
                pid.clone(),
                ProcessUpdate {
                    output: if rendered.is_empty() { None } else { Some(rendered) },
                    is_done,
                    is_done_logging_in: handle.is_done_logging_in.load(Ordering::Relaxed),
                    running_command_id,
                    stop_mark_found,
                    error,
                },
            );
        }
        drop(owned);

        // Errors for pids that never resolved to an owned process (unknown
        // pid referenced by a `processes` action) still need to surface.
        let mut leftover_errors = self.pending_errors.lock().unwrap();
        for (pid, error) in leftover_errors.drain() {
            processes_out
                .entry(pid)
                .or_insert_with(|| ProcessUpdate {
                    error: Some(error),
                    ..Default::default()
                });
        }
        drop(leftover_errors);

        let new_processes = {
            let mut acks = self.pending_new_process_acks.lock().unwrap();
            if acks.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *acks))
            }
        };

        ExecutionResponse {
            execution_id: self.id.clone(),
            loopback_payload: self.pending_loopback.lock().unwrap().take(),
            new_processes,
            processes: if processes_out.is_empty() { None } else { Some(processes_out) },
            error: None,
        }
    }
}

/// Accumulated state for one poll-cycle window.
#[derive(Default)]
struct Cycle {
    output: HashMap<String, Vec<u8>>,
    is_done: HashMap<String, bool>,
    stop_mark_found: HashMap<String, bool>,
}

impl Cycle {
    fn apply(&mut self, event: &PidEvent) {
        if let Some(bytes) = &event.output.output {
            self.output
                .entry(event.pid.clone())
                .or_default()
                .extend_from_slice(bytes);
        }
        if event.output.is_done {
            self.is_done.insert(event.pid.clone(), true);
        }
        // `stop_mark_found` on the Cycle is populated by
        // `Execution::check_stop_mark` after sanitization, not here — the
        // Reader never parses output beyond sentinel detection (spec.md
        // §4.2), so `event.output.stop_mark_found` is always false.
        if let Some(err) = &event.output.error {
            warn!(pid = %event.pid, error = %err, "reader reported error this cycle");
        }
    }

    fn any_stop_mark_found(&self) -> bool {
        self.stop_mark_found.values().any(|v| *v)
    }
}
