//! Composition root: constructs the configured components and hands them to
//! the selected run mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;

use forgebot::checkpoint::CheckpointStore;
use forgebot::cli::{Cli, Mode};
use forgebot::config::{Config, QueueBackend};
use forgebot::consumer::{ConsumerContext, ConsumerPool};
use forgebot::forge::{ForgeClient, ForgeTarget, GitHubForge, GitLabForge, RepoRef};
use forgebot::mcp::McpToolClient;
use forgebot::producer::Producer;
use forgebot::queue::{BrokerTaskQueue, InMemoryTaskQueue, TaskQueue};
use forgebot::signals::{touch_heartbeat, SignalState};
use forgebot::task::Platform;
use forgebot::telemetry::{TaskStore, TokenUsageService};
use forgebot::userconfig::server::{ApiDefaults, ApiState, UserStore};
use forgebot::userconfig::UserConfigResolver;
use forgebot::webhook::{
    self, GitHubSignatureValidator, GitLabTokenValidator, WebhookState,
};
use forgebot::{log_error, log_info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    forgebot::logger::init().ok();
    forgebot::logger::enable_logging();
    if cli.log {
        forgebot::logger::set_log_file(cli.log_file_path())
            .with_context(|| format!("cannot open log file {}", cli.log_file_path()))?;
    }

    let config = Arc::new(Config::load(cli.config.as_deref())?);
    config.validate()?;

    let signals = SignalState::new();
    signals.install_handlers();

    let queue = build_queue(&config)?;

    let result = if cli.webhook {
        run_webhook(&config, queue, &signals).await
    } else if cli.config_api {
        run_config_api(&config).await
    } else {
        match cli.mode {
            Some(Mode::Producer) => run_producer(&config, queue, &signals, cli.continuous).await,
            Some(Mode::Consumer) => run_consumer(&config, queue, &signals, cli.continuous).await,
            None => Err(anyhow!(
                "nothing to do: pass --mode producer|consumer, --webhook, or --config-api"
            )),
        }
    };

    if let Err(e) = &result {
        log_error!("fatal: {e}");
    }
    result
}

fn build_queue(config: &Config) -> anyhow::Result<Arc<dyn TaskQueue>> {
    Ok(match config.queue.backend {
        QueueBackend::Memory => Arc::new(InMemoryTaskQueue::new()),
        QueueBackend::Broker => Arc::new(BrokerTaskQueue::open(&config.queue.broker_path)?),
    })
}

fn build_targets(config: &Config) -> anyhow::Result<Vec<Arc<ForgeTarget>>> {
    let mut targets = Vec::new();
    if let Some(github) = &config.github {
        let client: Arc<dyn ForgeClient> = Arc::new(GitHubForge::from_env()?);
        targets.push(Arc::new(ForgeTarget {
            client,
            repo: RepoRef::GitHub {
                owner: github.owner.clone(),
                repo: github.repo.clone(),
            },
            labels: github.labels.clone(),
            bot_name: github.bot_name.clone(),
        }));
    }
    if let Some(gitlab) = &config.gitlab {
        let client: Arc<dyn ForgeClient> =
            Arc::new(GitLabForge::new(
                std::env::var("GITLAB_PERSONAL_ACCESS_TOKEN").unwrap_or_default(),
                gitlab.api_url.clone(),
            )?);
        targets.push(Arc::new(ForgeTarget {
            client,
            repo: RepoRef::GitLab {
                project_id: gitlab.project_id,
            },
            labels: gitlab.labels.clone(),
            bot_name: gitlab.bot_name.clone(),
        }));
    }
    Ok(targets)
}

async fn run_producer(
    config: &Arc<Config>,
    queue: Arc<dyn TaskQueue>,
    signals: &SignalState,
    continuous: bool,
) -> anyhow::Result<()> {
    let targets = build_targets(config)?;
    let producer = Producer::new(
        targets,
        queue,
        signals.clone(),
        config.continuous.healthcheck.dir.clone(),
        config.continuous.producer.clone(),
    );
    if continuous {
        producer.run_continuous().await?;
    } else {
        let enqueued = producer.run_once().await?;
        log_info!("single-shot producer enqueued {enqueued} descriptors");
    }
    Ok(())
}

async fn run_consumer(
    config: &Arc<Config>,
    queue: Arc<dyn TaskQueue>,
    signals: &SignalState,
    continuous: bool,
) -> anyhow::Result<()> {
    let targets = build_targets(config)?;
    let targets: HashMap<Platform, Arc<ForgeTarget>> = targets
        .into_iter()
        .map(|t| (t.client.platform(), t))
        .collect();

    let checkpoints = Arc::new(CheckpointStore::new(&config.checkpoint_dir())?);
    let telemetry = Arc::new(TaskStore::open(&config.tasks_db_path())?);

    let resolver = match (&config.user_config_api, std::env::var("API_SERVER_KEY")) {
        (Some(api), Ok(key)) if !key.is_empty() => {
            Some(Arc::new(UserConfigResolver::new(api.url.clone(), key)?))
        }
        _ => None,
    };

    let mcp = match &config.mcp {
        Some(mcp_config) => Some(Arc::new(McpToolClient::spawn(mcp_config).await?)),
        None => None,
    };

    let ctx = Arc::new(ConsumerContext {
        queue,
        targets,
        config: config.clone(),
        signals: signals.clone(),
        checkpoints,
        telemetry,
        resolver,
        mcp,
    });
    let pool = ConsumerPool::new(ctx);
    if continuous {
        pool.run().await?;
    } else {
        pool.run_until_empty().await?;
    }
    Ok(())
}

async fn run_webhook(
    config: &Arc<Config>,
    queue: Arc<dyn TaskQueue>,
    signals: &SignalState,
) -> anyhow::Result<()> {
    let github_validator = match (&config.github, &config.webhook.github_secret) {
        (Some(_), Some(secret)) => Some(GitHubSignatureValidator::new(secret.clone())?),
        (Some(_), None) => {
            return Err(anyhow!(
                "GitHub is configured but GITHUB_WEBHOOK_SECRET is not set"
            ))
        }
        (None, _) => None,
    };

    let state = Arc::new(WebhookState {
        queue,
        github_bot_label: config
            .github
            .as_ref()
            .map(|g| g.labels.bot.clone())
            .unwrap_or_default(),
        gitlab_bot_label: config
            .gitlab
            .as_ref()
            .map(|g| g.labels.bot.clone())
            .unwrap_or_default(),
        github_validator,
        gitlab_validator: GitLabTokenValidator::new(config.webhook.gitlab_token.clone()),
        gitlab_system_validator: GitLabTokenValidator::new(
            config.webhook.gitlab_system_hook_token.clone(),
        ),
    });

    // Heartbeat ticker for the webhook role.
    let heartbeat_dir = config.continuous.healthcheck.dir.clone();
    let heartbeat_signals = signals.clone();
    tokio::spawn(async move {
        while !heartbeat_signals.shutdown_requested() {
            let _ = touch_heartbeat(&heartbeat_dir, "webhook");
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    });

    webhook::serve(state, &config.webhook.host, config.webhook.port).await?;
    Ok(())
}

async fn run_config_api(config: &Arc<Config>) -> anyhow::Result<()> {
    let api = config
        .user_config_api
        .clone()
        .ok_or_else(|| anyhow!("[user_config_api] section is required for --config-api"))?;
    let api_key =
        std::env::var("API_SERVER_KEY").map_err(|_| anyhow!("API_SERVER_KEY is not set"))?;

    let state = ApiState {
        store: Arc::new(UserStore::open(&api.users_db)?),
        usage: Arc::new(TokenUsageService::new(&config.tasks_db_path())),
        api_key,
        defaults: Arc::new(ApiDefaults {
            llm: config.llm.clone(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| forgebot::dialogue::DEFAULT_SYSTEM_PROMPT.to_string()),
            max_llm_process_num: config.max_llm_process_num,
        }),
    };

    let listener = tokio::net::TcpListener::bind((api.host.as_str(), api.port)).await?;
    log_info!("user-config API listening on {}:{}", api.host, api.port);
    axum::serve(listener, forgebot::userconfig::server::router(state)).await?;
    Ok(())
}
