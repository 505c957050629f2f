//! Live run handles: event stream plus lifecycle controls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::event::RunEvent;

use super::result::AgentResult;

/// Cooperative control flags shared between a handle and its executor task.
///
/// The executor consults the flags at every suspension-point boundary; the
/// handle's methods only set flags and wake waiters, so control calls never
/// block.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    cancel: AtomicBool,
    pause: AtomicBool,
    interrupt: AtomicBool,
    notify: Notify,
}

impl RunControl {
    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub(crate) fn is_interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Wait for any control change notification.
    pub(crate) async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// One-shot result slot that supports repeated awaits.
#[derive(Debug, Default)]
pub(crate) struct ResultSlot {
    value: Mutex<Option<Option<AgentResult>>>,
    notify: Notify,
}

impl ResultSlot {
    pub(crate) async fn set(&self, outcome: Option<AgentResult>) {
        let mut value = self.value.lock().await;
        if value.is_none() {
            *value = Some(outcome);
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn get(&self) -> Option<AgentResult> {
        loop {
            let waiter = self.notify.notified();
            {
                let value = self.value.lock().await;
                if let Some(outcome) = value.as_ref() {
                    return outcome.clone();
                }
            }
            waiter.await;
        }
    }
}

/// Handle to a live (or pre-resolved) agent run.
///
/// Exposes the ordered event stream and the pause / resume / cancel /
/// interrupt lifecycle controls. `await_result` returns `None` when the
/// run was cancelled before producing a terminal result.
pub struct RunHandle {
    run_id: String,
    thread_id: String,
    control: Arc<RunControl>,
    events: Mutex<mpsc::UnboundedReceiver<RunEvent>>,
    result: Arc<ResultSlot>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub(crate) fn new(
        run_id: String,
        thread_id: String,
        control: Arc<RunControl>,
        events: mpsc::UnboundedReceiver<RunEvent>,
        result: Arc<ResultSlot>,
    ) -> Self {
        Self {
            run_id,
            thread_id,
            control,
            events: Mutex::new(events),
            result,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Build a handle already resolved with a terminal result.
    pub(crate) fn resolved(run_id: String, thread_id: String, result: AgentResult) -> Arc<Self> {
        let (_tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ResultSlot::default());
        let handle = Arc::new(Self::new(
            run_id,
            thread_id,
            Arc::new(RunControl::default()),
            rx,
            Arc::clone(&slot),
        ));
        // The slot is empty, so try_lock cannot be contended here.
        if let Ok(mut value) = slot.value.try_lock() {
            *value = Some(Some(result));
        }
        handle
    }

    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }

    pub(crate) fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// The run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The thread identifier.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Request a pause at the next safe boundary.
    pub fn pause(&self) {
        self.control.request_pause();
    }

    /// Resume after a pause.
    pub fn resume(&self) {
        self.control.request_resume();
    }

    /// Request cancellation. In-flight work is allowed to settle; no new
    /// phase starts after the next boundary.
    pub fn cancel(&self) {
        self.control.request_cancel();
    }

    /// Attempt to abort in-flight model work (capability-gated); degrades
    /// to cancel when the transport does not support interruption.
    pub fn interrupt(&self) {
        self.control.request_interrupt();
    }

    /// Receive the next lifecycle event, or `None` once the stream closes.
    pub async fn next_event(&self) -> Option<RunEvent> {
        self.events.lock().await.recv().await
    }

    /// Await the terminal result. `None` means the run was cancelled.
    pub async fn await_result(&self) -> Option<AgentResult> {
        self.result.get().await
    }
}
