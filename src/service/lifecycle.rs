use tokio::sync::watch;
use tracing::debug;

/// Lifecycle phase of one of the service's top-level tasks.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Spawned, not yet accepting.
    Starting,
    /// Accepting connections.
    Running,
    /// No longer accepting; waiting for in-flight work within the grace period.
    Draining,
    /// Every connection owned by the task is closed.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    task: &'static str,
    tx: watch::Sender<Phase>,
}

impl Lifecycle {
    pub(crate) fn new(task: &'static str) -> (Self, watch::Receiver<Phase>) {
        let (tx, rx) = watch::channel(Phase::Starting);
        (Self { task, tx }, rx)
    }

    /// A lifecycle nobody observes.
    pub(crate) fn detached(task: &'static str) -> Self {
        Self::new(task).0
    }

    pub(crate) fn set(&self, phase: Phase) {
        debug!(task = self.task, ?phase, "Lifecycle transition");
        self.tx.send_replace(phase);
    }
}

/// Observes the lifecycle of a [`Service`](crate::Service)'s three top-level tasks.
#[derive(Clone, Debug)]
pub struct ServiceStatus {
    pub(crate) router: watch::Receiver<Phase>,
    pub(crate) plain: watch::Receiver<Phase>,
    pub(crate) secure: watch::Receiver<Phase>,
}

impl ServiceStatus {
    /// Phase of the protocol router's accept loop.
    pub fn router(&self) -> Phase {
        *self.router.borrow()
    }

    /// Phase of the plaintext HTTP server.
    pub fn plain(&self) -> Phase {
        *self.plain.borrow()
    }

    /// Phase of the TLS server.
    pub fn secure(&self) -> Phase {
        *self.secure.borrow()
    }

    /// Waits until every task has reached at least `phase`.
    ///
    /// Returns early if the service is dropped before that happens.
    pub async fn wait_for(&mut self, phase: Phase) {
        for rx in [&mut self.router, &mut self.plain, &mut self.secure] {
            let _ = rx.wait_for(|current| *current >= phase).await;
        }
    }
}
