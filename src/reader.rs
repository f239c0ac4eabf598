//! One OS thread per [`crate::terminal::Terminal`], bridging its blocking
//! `select`/`read` loop onto the cooperative scheduler via a bounded
//! channel. This is the "post callback to the event loop from an arbitrary
//! thread" bridge: the reader thread never touches async state directly, it
//! only pushes [`TerminalOutput`] values that the execution aggregator polls
//! from its own task.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::terminal::{Terminal, TerminalOutput};

/// Reader → aggregator channel depth. Bounded so a stalled aggregator
/// applies backpressure to the reader thread rather than growing memory
/// without bound; the kernel's own PTY buffer absorbs the rest.
const CHANNEL_DEPTH: usize = 64;

pub struct Reader {
    handle: Option<JoinHandle<()>>,
}

impl Reader {
    /// Spawn the reader thread for `terminal` and return a handle plus the
    /// receiving half of its output channel. The thread exits (and closes
    /// the channel) on the first error or EOF.
    pub fn spawn(terminal: Arc<Terminal>, label: String) -> (Self, mpsc::Receiver<TerminalOutput>) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let handle = std::thread::Builder::new()
            .name(format!("reader-{label}"))
            .spawn(move || reader_loop(terminal, tx))
            .expect("failed to spawn reader thread");

        (Reader { handle: Some(handle) }, rx)
    }

    /// Block until the reader thread has exited. Used during shutdown after
    /// the owning Terminal has been closed (close() triggers EOF, which
    /// wakes the thread).
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.join();
    }
}

fn reader_loop(terminal: Arc<Terminal>, tx: mpsc::Sender<TerminalOutput>) {
    loop {
        let output = terminal.read_blocking();

        let is_error = output.error.is_some();
        let is_eof = !is_error
            && !output.is_done
            && output.output.as_deref().map(<[u8]>::is_empty).unwrap_or(false);

        if is_error {
            warn!(error = ?output.error, "reader exiting on error");
        } else if is_eof {
            debug!("reader exiting on EOF");
        }

        let should_stop = is_error || is_eof;
        if tx.blocking_send(output).is_err() {
            debug!("reader exiting: aggregator channel closed");
            return;
        }
        if should_stop {
            return;
        }
    }
}
