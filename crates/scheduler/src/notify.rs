//! Terminal-transition notification
//!
//! Every process reaching a terminal state is forwarded to an optional sink
//! (telemetry, history store). Delivery runs on a dedicated thread behind an
//! unbounded channel so a slow or failing sink never holds up scheduling.

use crate::record::ProcessRecord;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{trace, warn};

/// Receives a copy of each record as it becomes terminal
pub trait TerminalSink: Send + Sync + 'static {
    fn record_terminal(&self, record: &ProcessRecord);
}

impl<F> TerminalSink for F
where
    F: Fn(&ProcessRecord) + Send + Sync + 'static,
{
    fn record_terminal(&self, record: &ProcessRecord) {
        self(record)
    }
}

/// Owns the delivery thread
///
/// Dropping the notifier closes the channel and waits for queued records to
/// be delivered.
pub(crate) struct Notifier {
    sender: Option<Sender<ProcessRecord>>,
    thread: Option<JoinHandle<()>>,
}

impl Notifier {
    pub(crate) fn spawn(sink: Arc<dyn TerminalSink>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<ProcessRecord>();

        let thread = thread::Builder::new()
            .name("bgproc-notifier".to_string())
            .spawn(move || {
                for record in receiver {
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                        sink.record_terminal(&record)
                    }));
                    if delivered.is_err() {
                        warn!(process_id = %record.process_id, "terminal sink panicked");
                    }
                }
                trace!("notifier channel closed");
            })?;

        Ok(Self { sender: Some(sender), thread: Some(thread) })
    }

    /// Queue a record for delivery; never blocks
    pub(crate) fn notify(&self, record: ProcessRecord) {
        let sent = self.sender.as_ref().is_some_and(|sender| sender.send(record).is_ok());
        if !sent {
            warn!("terminal sink thread is gone, dropping notification");
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            // A sink that owns the scheduler can drop it from the delivery thread.
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("notifier thread panicked");
            }
        }
    }
}
