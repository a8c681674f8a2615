//! Graceful-shutdown coordination for a server's in-flight dispatch tasks.
//!
//! The serve loop for a connection holds one `Signal`; every dispatch task
//! it spawns holds a clone of the matching `Watch`. When the serve loop
//! exits it calls `drain()`, which wakes every `Watch` immediately, and
//! then awaits `Draining` until the last clone has been dropped — i.e.
//! until every dispatch task has actually finished.

use tokio::sync::watch;

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = watch::channel(false);
    (Signal { tx }, Watch { rx })
}

pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub(crate) struct Watch {
    rx: watch::Receiver<bool>,
}

impl Signal {
    /// Tell every outstanding `Watch` that the connection is shutting
    /// down, then wait for all of them to be dropped.
    pub(crate) async fn drain(self) {
        let _ = self.tx.send(true);
        self.tx.closed().await;
    }
}
