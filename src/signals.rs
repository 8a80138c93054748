//! Pause/shutdown flags and heartbeat files.
//!
//! A shutdown signal makes workers finish the current turn, checkpoint, and
//! exit the process; a pause signal does the same without exiting. Both are
//! observed cooperatively at suspension points.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::{log_info, log_warn};

/// Process-wide signal state shared by the producer, consumer pool, and
/// webhook server.
#[derive(Clone, Default)]
pub struct SignalState {
    shutdown: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Either pause or shutdown: the condition workers poll at suspension
    /// points.
    pub fn stop_requested(&self) -> bool {
        self.shutdown_requested() || self.pause_requested()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Install OS signal handlers: SIGINT/SIGTERM request shutdown, SIGUSR1
    /// requests pause.
    pub fn install_handlers(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let state = self.clone();
            tokio::spawn(async move {
                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        log_warn!("failed to install SIGINT handler: {e}");
                        return;
                    }
                };
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        log_warn!("failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                log_info!("shutdown signal received");
                state.request_shutdown();
            });

            let state = self.clone();
            tokio::spawn(async move {
                let mut sigusr1 = match signal(SignalKind::user_defined1()) {
                    Ok(s) => s,
                    Err(e) => {
                        log_warn!("failed to install SIGUSR1 handler: {e}");
                        return;
                    }
                };
                while sigusr1.recv().await.is_some() {
                    log_info!("pause signal received");
                    state.request_pause();
                }
            });
        }
    }
}

/// Sleep for `duration` while checking the signal state at 100 ms
/// granularity. Returns `false` when the sleep was cut short by a signal.
pub async fn sleep_with_signal_check(duration: Duration, signals: &SignalState) -> bool {
    let step = Duration::from_millis(100);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if signals.stop_requested() {
            return false;
        }
        let slice = remaining.min(step);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    !signals.stop_requested()
}

/// Touch `<dir>/<role>.health` with the current ISO-8601 timestamp. External
/// health checks read these; staleness semantics belong to the operator.
pub fn touch_heartbeat(dir: &Path, role: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{role}.health"));
    std::fs::write(path, Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_file_holds_iso_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch_heartbeat(dir.path(), "producer").expect("touch");
        let content =
            std::fs::read_to_string(dir.path().join("producer.health")).expect("read back");
        assert!(content.contains('T'));
        assert!(content.parse::<chrono::DateTime<chrono::Utc>>().is_ok());
    }

    #[tokio::test]
    async fn sleep_cut_short_by_signal() {
        let signals = SignalState::new();
        signals.request_shutdown();
        let start = std::time::Instant::now();
        let completed = sleep_with_signal_check(Duration::from_secs(5), &signals).await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
