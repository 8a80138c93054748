//! Producer loop: periodic polling for labelled items when webhooks are
//! absent (or alongside them), feeding the shared queue.
//!
//! Duplicates from rapid polling are tolerated downstream: consumers observe
//! the processing label on the forge and skip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProducerSettings;
use crate::error::Result;
use crate::forge::{ForgeTarget, ItemState};
use crate::queue::TaskQueue;
use crate::signals::{touch_heartbeat, SignalState};
use crate::task::TaskDescriptor;
use crate::{log_info, log_warn};

pub struct Producer {
    targets: Vec<Arc<ForgeTarget>>,
    queue: Arc<dyn TaskQueue>,
    signals: SignalState,
    heartbeat_dir: PathBuf,
    settings: ProducerSettings,
}

impl Producer {
    pub fn new(
        targets: Vec<Arc<ForgeTarget>>,
        queue: Arc<dyn TaskQueue>,
        signals: SignalState,
        heartbeat_dir: PathBuf,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            targets,
            queue,
            signals,
            heartbeat_dir,
            settings,
        }
    }

    /// One poll across every configured forge. Returns how many descriptors
    /// were enqueued.
    pub async fn run_once(&self) -> Result<usize> {
        let mut enqueued = 0;
        for target in &self.targets {
            let items = match target
                .client
                .list_items_with_label(&target.repo, &target.labels.bot, ItemState::Open)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    log_warn!("poll of {} failed: {e}", target.repo);
                    continue;
                }
            };

            for (key, raw) in items {
                let user = raw
                    .get("user")
                    .and_then(|u| u.get("login"))
                    .or_else(|| raw.get("author").and_then(|a| a.get("username")))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string);
                let descriptor = TaskDescriptor::new(key, user);
                if let Err(e) = self.queue.put(&descriptor).await {
                    log_warn!("enqueue failed for {}: {e}", descriptor.task_key);
                    continue;
                }
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            log_info!("producer enqueued {enqueued} descriptors");
        }
        Ok(enqueued)
    }

    /// Continuous mode: poll, heartbeat, sleep `interval_minutes` with
    /// 100 ms-granularity shutdown checks.
    pub async fn run_continuous(&self) -> Result<()> {
        let interval = Duration::from_secs(self.settings.interval_minutes * 60);

        if self.settings.delay_first_run && !self.sleep_interruptible(interval).await {
            return Ok(());
        }

        loop {
            if self.signals.shutdown_requested() {
                log_info!("producer shutting down");
                return Ok(());
            }

            if let Err(e) = self.run_once().await {
                log_warn!("producer iteration failed: {e}");
            }
            if let Err(e) = touch_heartbeat(&self.heartbeat_dir, "producer") {
                log_warn!("producer heartbeat failed: {e}");
            }

            if !self.sleep_interruptible(interval).await {
                log_info!("producer shutting down");
                return Ok(());
            }
        }
    }

    /// Sleep the full duration unless shutdown arrives. A pause signal does
    /// not stop polling; only workers pause.
    async fn sleep_interruptible(&self, duration: Duration) -> bool {
        let step = Duration::from_millis(100);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.signals.shutdown_requested() {
                return false;
            }
            let slice = remaining.min(step);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        true
    }
}
