//! Client side of the user-config REST contract.
//!
//! Workers look up per-user LLM overrides before each task; when the
//! service is unreachable or knows nothing about the user, the ambient
//! defaults apply unchanged.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::llm::LlmConfig;
use crate::log_warn;
use crate::task::Platform;

#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedUserConfig {
    pub llm: ResolvedLlm,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_llm_process_num: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedLlm {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<ResolvedUserConfig>,
}

pub struct UserConfigResolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl UserConfigResolver {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// Fetch the per-user configuration. Any failure degrades to `None`,
    /// meaning the ambient defaults stand.
    pub async fn resolve(&self, platform: Platform, username: &str) -> Option<ResolvedUserConfig> {
        let url = format!(
            "{}/config/{}/{username}",
            self.base_url,
            platform.as_str()
        );
        let response = match self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log_warn!(
                    "user-config lookup for {username} returned {}",
                    response.status()
                );
                return None;
            }
            Err(e) => {
                log_warn!("user-config lookup for {username} failed: {e}");
                return None;
            }
        };

        match response.json::<Envelope>().await {
            Ok(envelope) if envelope.status == "success" => envelope.data,
            Ok(_) => None,
            Err(e) => {
                log_warn!("user-config response parse failed: {e}");
                None
            }
        }
    }

    /// Merge a resolved override into the ambient LLM config: model name and
    /// API key override, everything else stays.
    pub fn merge_into(ambient: &LlmConfig, resolved: &ResolvedUserConfig) -> LlmConfig {
        let mut merged = ambient.clone();
        if let Some(model) = &resolved.llm.model {
            if !model.is_empty() {
                merged.model = model.clone();
            }
        }
        if let Some(api_key) = &resolved.llm.api_key {
            if !api_key.is_empty() {
                merged.api_key = Some(api_key.clone());
            }
        }
        if let Some(base_url) = &resolved.llm.base_url {
            if !base_url.is_empty() {
                merged.base_url = base_url.clone();
            }
        }
        merged
    }
}
