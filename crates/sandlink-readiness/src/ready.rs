//! Background readiness evaluation

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Error type carried by warnings and fatal errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Capacity of the warning queue; newer warnings are dropped once full
pub const WARNING_BUFFER: usize = 100;

/// Outcome of one evaluation
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Whether the watched condition currently holds
    pub ready: bool,
    /// Diagnostic, non-authoritative problem
    pub warning: Option<BoxError>,
    /// Terminal problem; evaluation stops for good
    pub fatal: Option<BoxError>,
}

impl Evaluation {
    /// Ready, no diagnostics
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Self::default()
        }
    }

    /// Not ready, no diagnostics
    pub fn not_ready() -> Self {
        Self::default()
    }

    /// Not ready because of a transient problem
    pub fn warning(err: impl Into<BoxError>) -> Self {
        Self {
            ready: false,
            warning: Some(err.into()),
            fatal: None,
        }
    }

    /// Terminal failure
    pub fn fatal(err: impl Into<BoxError>) -> Self {
        Self {
            ready: false,
            warning: None,
            fatal: Some(err.into()),
        }
    }
}

/// Handle to a background evaluation loop
///
/// Dropping the handle stops the loop without waiting for it.
pub struct Readiness {
    ready: Arc<AtomicBool>,
    warnings: Mutex<mpsc::Receiver<BoxError>>,
    fatal: Arc<Mutex<Option<BoxError>>>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Readiness {
    /// Start evaluating `eval` every `interval`
    ///
    /// The first evaluation runs immediately.
    pub fn spawn<F, Fut>(interval: Duration, mut eval: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Evaluation> + Send + 'static,
    {
        let ready = Arc::new(AtomicBool::new(false));
        let fatal: Arc<Mutex<Option<BoxError>>> = Arc::new(Mutex::new(None));
        let (warn_tx, warn_rx) = mpsc::channel(WARNING_BUFFER);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let loop_ready = Arc::clone(&ready);
        let loop_fatal = Arc::clone(&fatal);
        tokio::spawn(async move {
            loop {
                let evaluation = tokio::select! {
                    _ = stop_rx.wait_for(|stop| *stop) => break,
                    evaluation = eval() => evaluation,
                };

                if let Some(err) = evaluation.fatal {
                    tracing::debug!(error = %err, "readiness evaluation failed fatally");
                    loop_ready.store(false, Ordering::SeqCst);
                    *loop_fatal.lock() = Some(err);
                    break;
                }

                loop_ready.store(evaluation.ready, Ordering::SeqCst);
                if let Some(err) = evaluation.warning {
                    // Full buffer: the newest warning is dropped.
                    let _ = warn_tx.try_send(err);
                }

                tokio::select! {
                    _ = stop_rx.wait_for(|stop| *stop) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            done_tx.send_replace(true);
        });

        Self {
            ready,
            warnings: Mutex::new(warn_rx),
            fatal,
            stop_tx,
            done_rx,
        }
    }

    /// Take one buffered warning, if any
    pub fn warn(&self) -> Option<BoxError> {
        self.warnings.lock().try_recv().ok()
    }

    /// Take the fatal error, if one occurred; returns it at most once
    pub fn fatal(&self) -> Option<BoxError> {
        self.fatal.lock().take()
    }

    /// Last observed readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether the evaluation loop has exited (stopped or fatal)
    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Stop the loop and wait until it has exited
    ///
    /// Idempotent and safe to call concurrently; no evaluation runs after
    /// this returns.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut done = self.done_rx.clone();
        // Err means the loop task is gone, which is also "exited".
        let _ = done.wait_for(|d| *d).await;
    }
}
