// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod paths;
mod schema;

pub use loader::{load, load_from};
pub use paths::ControlDir;
pub use schema::{
    AgentConfig, BudgetConfig, CacheConfig, Config, ModelConfig, RoutingConfig, ToolsConfig,
    WebConfig,
};
