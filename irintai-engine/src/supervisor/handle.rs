//! One generation of a running model process

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pump::PumpLine;

/// Whether a generation's process is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited { code: Option<i32> },
}

/// Lines a generation may queue while nobody is reading.
pub(crate) const LINE_QUEUE_CAPACITY: usize = 1024;

/// Producer side of a generation's output queue, fed by the pump.
pub(crate) struct LineSink {
    tx: mpsc::Sender<PumpLine>,
    overflow_markers: Arc<AtomicUsize>,
}

impl LineSink {
    /// Queue `line`, dropping it when the queue is full.
    ///
    /// Dropped markers are counted so the reader can still settle the
    /// responses they closed.
    pub(crate) fn push(&self, line: PumpLine) {
        match self.tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(PumpLine::Marker)) => {
                self.overflow_markers.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(PumpLine::Content(_)) | TrySendError::Closed(_)) => {}
        }
    }
}

/// Consumer side of a generation's output queue.
pub(crate) struct LineQueue {
    rx: mpsc::Receiver<PumpLine>,
    overflow_markers: Arc<AtomicUsize>,
    markers_owed: usize,
}

/// A bounded output queue holding at most `capacity` lines.
pub(crate) fn line_queue(capacity: usize) -> (LineSink, LineQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    let overflow_markers = Arc::new(AtomicUsize::new(0));
    let sink = LineSink {
        tx,
        overflow_markers: Arc::clone(&overflow_markers),
    };
    let queue = LineQueue {
        rx,
        overflow_markers,
        markers_owed: 0,
    };
    (sink, queue)
}

impl LineQueue {
    pub(crate) async fn recv(&mut self) -> Option<PumpLine> {
        self.rx.recv().await
    }

    /// Discard output produced before the caller started listening.
    pub(crate) fn drain_stale(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(line) = self.rx.try_recv() {
            self.settle(&line);
            dropped += 1;
        }
        self.settle_overflow();
        dropped
    }

    /// Record an exchange that gave up before its marker arrived.
    pub(crate) fn owe_marker(&mut self) {
        self.markers_owed += 1;
    }

    /// Markers still expected from abandoned exchanges.
    pub(crate) fn markers_owed(&self) -> usize {
        self.markers_owed
    }

    /// Skip the remainder of abandoned responses.
    ///
    /// Returns `false` if the output closed before every owed marker arrived.
    pub(crate) async fn resync(&mut self) -> bool {
        loop {
            self.settle_overflow();
            if self.markers_owed == 0 {
                return true;
            }
            match self.rx.recv().await {
                Some(line) => self.settle(&line),
                None => return false,
            }
        }
    }

    fn settle(&mut self, line: &PumpLine) {
        if matches!(line, PumpLine::Marker) {
            self.markers_owed = self.markers_owed.saturating_sub(1);
        }
    }

    fn settle_overflow(&mut self) {
        let dropped = self.overflow_markers.swap(0, Ordering::SeqCst);
        self.markers_owed = self.markers_owed.saturating_sub(dropped);
    }
}

/// Exclusive access to a generation's stdin and output lines.
///
/// Holding this is what makes an exchange exclusive.
pub struct SessionIo {
    pub(crate) stdin: ChildStdin,
    pub(crate) lines: LineQueue,
}

/// Shared view of one spawned process.
///
/// The child itself is owned by the generation's monitor task; the handle
/// carries what callers need: the generation number, its cancellation token
/// and the pipes used by the exchange channel.
pub struct ProcessHandle {
    model: String,
    generation: u64,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    io: Mutex<SessionIo>,
    exit: watch::Receiver<ExitState>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        model: &str,
        generation: u64,
        pid: Option<u32>,
        cancel: CancellationToken,
        io: SessionIo,
        exit: watch::Receiver<ExitState>,
    ) -> Self {
        Self {
            model: model.to_string(),
            generation,
            pid,
            spawned_at: Utc::now(),
            started: Instant::now(),
            cancel,
            io: Mutex::new(io),
            exit,
            monitor: StdMutex::new(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exit_state(&self) -> ExitState {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.exit_state(), ExitState::Exited { .. })
    }

    /// Whether this generation was stopped or superseded.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) async fn lock_io(&self) -> MutexGuard<'_, SessionIo> {
        self.io.lock().await
    }

    pub(crate) fn set_monitor(&self, task: JoinHandle<()>) {
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub(crate) fn take_monitor(&self) -> Option<JoinHandle<()>> {
        self.monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("model", &self.model)
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("spawned_at", &self.spawned_at)
            .field("exit", &self.exit_state())
            .finish()
    }
}

/// Ask the process to exit, killing it if it outlives `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    request_exit(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(code = ?status.code(), "Engine process exited");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to wait for engine process");
            None
        }
        Err(_) => {
            info!(grace = ?grace, "Engine process ignored termination, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill engine process");
            }
            None
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    match child.id() {
        // SAFETY: pid belongs to a child we have not yet reaped
        Some(pid) => unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}


#[cfg(test)]
mod queue_tests {
    use super::*;

    fn content(text: &str) -> PumpLine {
        PumpLine::Content(text.to_string())
    }

    #[tokio::test]
    async fn full_queue_drops_lines() {
        let (sink, mut queue) = line_queue(4);

        for i in 0..10 {
            sink.push(content(&format!("noise {i}")));
        }

        assert_eq!(queue.drain_stale(), 4);
    }

    #[tokio::test]
    async fn resync_skips_rest_of_abandoned_response() {
        let (sink, mut queue) = line_queue(16);
        queue.owe_marker();

        sink.push(content("answer to one"));
        sink.push(PumpLine::Marker);
        sink.push(content("answer to two"));

        assert!(queue.resync().await);
        assert_eq!(queue.markers_owed(), 0);
        assert_eq!(queue.recv().await, Some(content("answer to two")));
    }

    #[tokio::test]
    async fn drained_marker_settles_debt() {
        let (sink, mut queue) = line_queue(16);
        queue.owe_marker();
        sink.push(content("late"));
        sink.push(PumpLine::Marker);

        queue.drain_stale();

        assert_eq!(queue.markers_owed(), 0);
    }

    #[tokio::test]
    async fn dropped_marker_still_settles_debt() {
        let (sink, mut queue) = line_queue(2);
        queue.owe_marker();
        sink.push(content("a"));
        sink.push(content("b"));
        sink.push(PumpLine::Marker);

        assert!(queue.resync().await);
        assert_eq!(queue.markers_owed(), 0);
    }

    #[tokio::test]
    async fn resync_fails_when_output_closes() {
        let (sink, mut queue) = line_queue(4);
        queue.owe_marker();
        sink.push(content("half an answer"));
        drop(sink);

        assert!(!queue.resync().await);
    }
}
