//! Async runtime manager and preemption notice

use crate::{Error, Result, TrainConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown signal receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Shared flag set when the environment announces that this worker will be reclaimed
#[derive(Debug, Clone, Default)]
pub struct PreemptionNotice {
    flag: Arc<AtomicBool>,
}

impl PreemptionNotice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process as preempted
    pub fn signal(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            warn!("Preemption notice received");
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runtime manager owning the tokio runtime of a worker process
pub struct RuntimeManager {
    /// Tokio runtime
    runtime: Option<Runtime>,

    /// Configuration
    config: TrainConfig,

    /// Preemption flag shared with the checkpointer
    preemption: PreemptionNotice,

    /// Shutdown signal sender
    shutdown_tx: ShutdownSender,
}

impl RuntimeManager {
    /// Create a new runtime manager
    pub fn new(config: TrainConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .enable_all()
            .thread_name("trainer-worker")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            runtime: Some(runtime),
            config,
            preemption: PreemptionNotice::new(),
            shutdown_tx,
        })
    }

    /// Get a reference to the Tokio runtime
    pub fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or_else(|| Error::Internal {
            message: "runtime already shut down".to_string(),
        })
    }

    /// Preemption flag for this process
    pub fn preemption(&self) -> PreemptionNotice {
        self.preemption.clone()
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> ShutdownReceiver {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to all components
    pub fn shutdown(&self) {
        info!("Initiating runtime shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Block on a future until completion
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }

    /// Spawn a task on the runtime
    pub fn spawn<F>(&self, future: F) -> Result<tokio::task::JoinHandle<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.runtime()?.spawn(future))
    }

    /// Turn SIGTERM / Ctrl-C into a preemption notice until shutdown.
    ///
    /// Only installed when the run exits after an on-demand checkpoint;
    /// otherwise the signals keep their default behavior.
    pub fn spawn_preemption_listener(&self) -> Result<Option<tokio::task::JoinHandle<()>>> {
        if !self.config.exit_after_ondemand_checkpoint {
            debug!("Proactive preemption exit disabled, not listening for signals");
            return Ok(None);
        }
        let notice = self.preemption();
        let mut shutdown_rx = self.shutdown_receiver();
        let handle = self.spawn(async move {
            tokio::select! {
                _ = termination_signal() => notice.signal(),
                _ = shutdown_rx.recv() => {}
            }
        })?;
        Ok(Some(handle))
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Signal shutdown
            let _ = self.shutdown_tx.send(());

            // Give tasks time to clean up
            runtime.shutdown_timeout(Duration::from_secs(5));
            info!("Runtime manager shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: TrainConfig) -> RuntimeManager {
        RuntimeManager::new(config).unwrap()
    }

    #[test]
    fn test_runtime_creation() {
        let manager = manager(TrainConfig {
            io_threads: 2,
            ..Default::default()
        });
        assert!(manager.runtime().is_ok());
        assert!(!manager.preemption().is_signaled());
    }

    #[test]
    fn test_spawn_task() {
        let manager = manager(TrainConfig::default());

        let result = manager
            .block_on(async {
                let handle = tokio::spawn(async { 42 });
                handle.await.unwrap()
            })
            .unwrap();

        assert_eq!(result, 42);
    }

    #[test]
    fn test_preemption_notice_is_shared() {
        let manager = manager(TrainConfig::default());
        let notice = manager.preemption();
        notice.signal();
        assert!(manager.preemption().is_signaled());
    }

    #[test]
    fn test_listener_only_with_proactive_exit() {
        let passive = manager(TrainConfig::default());
        assert!(passive.spawn_preemption_listener().unwrap().is_none());

        let proactive = manager(TrainConfig {
            exit_after_ondemand_checkpoint: true,
            ..Default::default()
        });
        assert!(proactive.spawn_preemption_listener().unwrap().is_some());
        proactive.shutdown();
    }
}
