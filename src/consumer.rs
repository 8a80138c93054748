//! Consumer worker pool.
//!
//! Up to `max_llm_process_num` workers share the queue. Each worker
//! dequeues with signal checks, re-queries the forge to materialize the
//! task (the enqueued snapshot is never trusted), acquires the processing
//! label, runs the dialogue, and finalizes. Cross-worker coordination is
//! only through the queue, the checkpoint store, and forge label state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::checkpoint::CheckpointStore;
use crate::comments::CommentWatcher;
use crate::config::Config;
use crate::convert::{conversion_applies, IssueConverter};
use crate::dialogue::{
    DialogueDriver, DialogueEnd, DialogueSettings, DEFAULT_FIRST_USER_PROMPT,
    DEFAULT_SYSTEM_PROMPT,
};
use crate::error::Result;
use crate::forge::ForgeTarget;
use crate::llm::{LlmClient, LlmSession};
use crate::mcp::McpToolClient;
use crate::queue::{TaskQueue, DEFAULT_POLL_INTERVAL};
use crate::signals::{touch_heartbeat, SignalState};
use crate::task::{Platform, Task, TaskDescriptor, TaskOutcome};
use crate::telemetry::TaskStore;
use crate::userconfig::UserConfigResolver;
use crate::{log_debug, log_info, log_warn};

/// Everything a worker needs, injected once from the composition root.
pub struct ConsumerContext {
    pub queue: Arc<dyn TaskQueue>,
    pub targets: HashMap<Platform, Arc<ForgeTarget>>,
    pub config: Arc<Config>,
    pub signals: SignalState,
    pub checkpoints: Arc<CheckpointStore>,
    pub telemetry: Arc<TaskStore>,
    pub resolver: Option<Arc<UserConfigResolver>>,
    pub mcp: Option<Arc<McpToolClient>>,
}

pub struct ConsumerPool {
    ctx: Arc<ConsumerContext>,
}

impl ConsumerPool {
    pub fn new(ctx: Arc<ConsumerContext>) -> Self {
        Self { ctx }
    }

    /// Spawn the workers and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let worker_count = self.ctx.config.max_llm_process_num;
        log_info!("starting {worker_count} workers");

        let mut workers = JoinSet::new();
        for index in 0..worker_count {
            let ctx = self.ctx.clone();
            workers.spawn(async move { worker_loop(ctx, index).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log_warn!("worker exited abnormally: {e}");
            }
        }
        log_info!("consumer pool stopped");
        Ok(())
    }

    /// Single-shot mode: drain whatever the queue holds right now, then
    /// return.
    pub async fn run_until_empty(&self) -> Result<()> {
        loop {
            if self.ctx.signals.stop_requested() || self.ctx.queue.empty().await? {
                return Ok(());
            }
            let Some(descriptor) = self.ctx.queue.try_get().await? else {
                return Ok(());
            };
            process_descriptor(&self.ctx, descriptor).await;
        }
    }
}

async fn worker_loop(ctx: Arc<ConsumerContext>, index: usize) {
    log_debug!("worker {index} started");
    let min_interval = Duration::from_secs(ctx.config.continuous.consumer.min_interval_seconds);
    let queue_timeout = Duration::from_secs(ctx.config.continuous.consumer.queue_timeout_seconds);
    let mut last_finished: Option<Instant> = None;

    loop {
        if ctx.signals.shutdown_requested() {
            break;
        }
        if ctx.signals.pause_requested() {
            // Paused: stay alive, keep the heartbeat fresh, take no work.
            tokio::time::sleep(Duration::from_millis(500)).await;
            heartbeat(&ctx);
            continue;
        }

        let signals = ctx.signals.clone();
        let received = ctx
            .queue
            .get_with_signal_check(Some(queue_timeout), DEFAULT_POLL_INTERVAL, &move || {
                signals.stop_requested()
            })
            .await;
        heartbeat(&ctx);

        let descriptor = match received {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => continue,
            Err(e) => {
                log_warn!("worker {index} dequeue failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Per-worker rate limit between tasks.
        if !min_interval.is_zero() {
            if let Some(finished) = last_finished {
                let elapsed = finished.elapsed();
                if elapsed < min_interval
                    && !crate::signals::sleep_with_signal_check(min_interval - elapsed, &ctx.signals)
                        .await
                {
                    // Signal during the wait: push the descriptor back.
                    if let Err(e) = ctx.queue.put(&descriptor).await {
                        log_warn!("requeue during shutdown failed: {e}");
                    }
                    continue;
                }
            }
        }

        log_info!("worker {index} picked up {}", descriptor.task_key);
        process_descriptor(&ctx, descriptor).await;
        last_finished = Some(Instant::now());
        heartbeat(&ctx);
    }
    log_debug!("worker {index} stopped");
}

fn heartbeat(ctx: &ConsumerContext) {
    if let Err(e) = touch_heartbeat(&ctx.config.continuous.healthcheck.dir, "consumer") {
        log_warn!("consumer heartbeat failed: {e}");
    }
}

/// One task end to end. Task-local errors never propagate: they end as a
/// comment plus the done label, or as a logged warning and an abandoned
/// descriptor.
async fn process_descriptor(ctx: &ConsumerContext, descriptor: TaskDescriptor) {
    let key = descriptor.task_key.clone();
    let platform = key.platform();
    let Some(target) = ctx.targets.get(&platform) else {
        log_warn!("no forge configured for {}; dropping {key}", platform.as_str());
        return;
    };

    // Materialize from a fresh forge query rather than the enqueued
    // snapshot.
    let raw = match target.client.get_item(&key).await {
        Ok(raw) => raw,
        Err(e) => {
            log_warn!("failed to materialize {key}: {e}");
            return;
        }
    };
    let mut task = Task::new(
        descriptor.clone(),
        raw,
        target.client.clone(),
        target.labels.clone(),
    );

    // The label may have been pulled between enqueue and dequeue.
    if !task.has_bot_label() {
        log_debug!("bot label gone from {key}; dropping silently");
        return;
    }

    let had_processing = task.has_processing_label();
    let has_checkpoint = ctx.checkpoints.exists(&key);
    task.resumed = had_processing && has_checkpoint;
    if had_processing && !has_checkpoint {
        log_warn!("{key} was left in processing with no checkpoint; starting fresh");
    }

    if let Err(e) = task.prepare().await {
        log_warn!("failed to acquire processing label on {key}: {e}");
        return;
    }

    // Per-user configuration overrides the ambient LLM block.
    let mut llm_config = ctx.config.llm.clone();
    let mut system_prompt = ctx.config.system_prompt.clone();
    if let (Some(resolver), Some(user)) = (&ctx.resolver, &descriptor.user) {
        if let Some(resolved) = resolver.resolve(platform, user).await {
            llm_config = UserConfigResolver::merge_into(&llm_config, &resolved);
            if let Some(prompt) = resolved.system_prompt {
                system_prompt = Some(prompt);
            }
        }
    }
    let llm = match LlmClient::new(llm_config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log_warn!("LLM client construction failed for {key}: {e}");
            return;
        }
    };

    if let Err(e) = ctx.telemetry.record_start(&descriptor, llm.model()) {
        log_warn!("telemetry start record failed: {e}");
    }

    // Issue-sourced tasks convert to a change request first when policy
    // requires it; the dialogue then happens on the change request.
    if conversion_applies(&key, &ctx.config.conversion) && !task.resumed {
        let bot_name = target.bot_name.clone().unwrap_or_default();
        let converter = IssueConverter::new(&task, &llm, &ctx.config.conversion, bot_name);
        let result = converter.convert().await;
        if result.success {
            if let Err(e) = ctx.checkpoints.remove(&key) {
                log_warn!("checkpoint cleanup failed for {key}: {e}");
            }
            finish_telemetry(ctx, &descriptor, "done", None);
            return;
        }
        log_warn!(
            "conversion of {key} did not produce a change request ({}); continuing with the dialogue",
            result.error.unwrap_or_default()
        );
    }

    run_dialogue(ctx, target, &task, llm, system_prompt.as_deref()).await;
}

async fn run_dialogue(
    ctx: &ConsumerContext,
    target: &ForgeTarget,
    task: &Task,
    llm: Arc<LlmClient>,
    system_prompt: Option<&str>,
) {
    let key = task.key().clone();
    let session = LlmSession::new(llm);
    let watcher = CommentWatcher::new(target.bot_name.clone());
    let settings: DialogueSettings = ctx.config.dialogue.clone();
    let system_prompt = system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let first_prompt = ctx
        .config
        .first_user_prompt
        .as_deref()
        .unwrap_or(DEFAULT_FIRST_USER_PROMPT);

    let mut driver = DialogueDriver::new(
        task,
        session,
        ctx.mcp.as_deref(),
        watcher,
        &ctx.checkpoints,
        &ctx.signals,
        settings,
        system_prompt,
        first_prompt,
    )
    .await;

    let end = match driver.run().await {
        Ok(end) => end,
        Err(e) => {
            log_warn!("dialogue for {key} aborted: {e}");
            DialogueEnd::Failed {
                error: e.to_string(),
            }
        }
    };
    let state = driver.state().clone();

    match end {
        DialogueEnd::Completed => {
            if let Err(e) = task.finalize(TaskOutcome::Success).await {
                log_warn!("finalize(success) failed for {key}: {e}");
            }
            if let Err(e) = ctx.checkpoints.remove(&key) {
                log_warn!("checkpoint cleanup failed for {key}: {e}");
            }
            record_dialogue_finish(ctx, task, "done", None, &state);
        }
        DialogueEnd::Failed { error } => {
            // Failure is final from the agent's perspective; the error was
            // already announced as a comment by the driver.
            if let Err(e) = task.finalize(TaskOutcome::Failed).await {
                log_warn!("finalize(failed) failed for {key}: {e}");
            }
            if let Err(e) = ctx.checkpoints.remove(&key) {
                log_warn!("checkpoint cleanup failed for {key}: {e}");
            }
            record_dialogue_finish(ctx, task, "failed", Some(&error), &state);
        }
        DialogueEnd::Paused => {
            // Checkpoint written, processing label kept: a later worker
            // resumes from here.
            log_info!("{key} paused mid-dialogue");
            record_dialogue_finish(ctx, task, "paused", None, &state);
        }
    }
}

fn record_dialogue_finish(
    ctx: &ConsumerContext,
    task: &Task,
    status: &str,
    error: Option<&str>,
    state: &crate::dialogue::DialogueState,
) {
    if let Err(e) = ctx.telemetry.record_finish(
        &task.descriptor,
        status,
        state.llm_call_count,
        state.tool_call_count,
        state.total_tokens,
        state.compression_count,
        error,
    ) {
        log_warn!("telemetry finish record failed: {e}");
    }
}

fn finish_telemetry(
    ctx: &ConsumerContext,
    descriptor: &TaskDescriptor,
    status: &str,
    error: Option<&str>,
) {
    if let Err(e) = ctx
        .telemetry
        .record_finish(descriptor, status, 1, 0, 0, 0, error)
    {
        log_warn!("telemetry finish record failed: {e}");
    }
}
