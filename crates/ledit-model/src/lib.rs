// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model layer: message types, the provider abstraction, the
//! OpenAI-compatible driver, and the failover client used by the agent loop.

mod client;
pub mod mock;
mod openai_compat;
mod pricing;
mod provider;
mod registry;
mod types;

pub use client::{ModelError, ProviderClient, RetryPolicy, OUTPUT_TRUNCATION_MARKER};
pub use openai_compat::{AuthStyle, HttpStatusError, OpenAICompatProvider};
pub use pricing::{ModelPricing, PricingTable};
pub use provider::{ModelProvider, ResponseStream};
pub use registry::{get_driver, list_drivers, DriverMeta, DRIVERS};
pub use types::{
    Completion, CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role,
    ToolInvocation, ToolSchema, TurnKind, Usage,
};

use std::sync::Arc;

use anyhow::{bail, Context};

/// Construct a provider from its configuration.
///
/// Fails with a configuration error when the provider id is unknown, the
/// base URL cannot be determined, or a mandatory API key is missing - these
/// are startup-fatal conditions, not runtime ones.
pub fn from_config(cfg: &ledit_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    if cfg.provider == "mock" {
        return Ok(Arc::new(mock::MockProvider));
    }

    let driver = get_driver(&cfg.provider)
        .with_context(|| format!("unknown model provider: {}", cfg.provider))?;

    let base_url = cfg
        .base_url
        .clone()
        .or_else(|| driver.default_base_url.map(String::from))
        .with_context(|| format!("provider {} requires an explicit base_url", driver.id))?;

    let api_key = resolve_api_key(cfg, driver);
    if driver.requires_api_key && api_key.is_none() {
        let env_hint = cfg
            .api_key_env
            .as_deref()
            .or(driver.default_api_key_env)
            .unwrap_or("<PROVIDER>_API_KEY");
        bail!(
            "provider {} requires an API key; set {} or model.api_key in config",
            driver.id,
            env_hint
        );
    }

    let auth = if api_key.is_some() {
        AuthStyle::Bearer
    } else {
        AuthStyle::None
    };

    Ok(Arc::new(OpenAICompatProvider::new(
        driver.id,
        cfg.name.clone(),
        api_key,
        &base_url,
        cfg.max_tokens,
        cfg.temperature,
        auth,
    )))
}

/// Key resolution order: explicit config value, configured env var, then the
/// driver's conventional `<PROVIDER>_API_KEY` variable.
fn resolve_api_key(cfg: &ledit_config::ModelConfig, driver: &DriverMeta) -> Option<String> {
    if let Some(key) = &cfg.api_key {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    let env_name = cfg.api_key_env.as_deref().or(driver.default_api_key_env)?;
    std::env::var(env_name).ok().filter(|k| !k.is_empty())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
