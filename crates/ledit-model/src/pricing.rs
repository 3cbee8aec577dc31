// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Usage;

/// Per-million-token prices for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Pricing table keyed by model name, loaded from `model_pricing.json` in
/// the control directory.  Unknown models cost zero; the first lookup of
/// each unknown model logs a warning so silent under-billing is visible.
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    warned: Mutex<std::collections::HashSet<String>>,
}

impl PricingTable {
    /// Load the table; when the file does not exist, seed it with the
    /// built-in defaults so operators have something to edit.
    pub fn load_or_init(path: &Path) -> Self {
        if let Ok(text) = std::fs::read_to_string(path) {
            match serde_json::from_str::<HashMap<String, ModelPricing>>(&text) {
                Ok(models) => return Self::from_map(models),
                Err(e) => warn!("corrupt pricing table, using defaults: {e}"),
            }
        }
        let defaults = Self::default_models();
        if let Ok(text) = serde_json::to_string_pretty(&defaults) {
            let _ = std::fs::write(path, text);
        }
        Self::from_map(defaults)
    }

    pub fn from_map(models: HashMap<String, ModelPricing>) -> Self {
        Self {
            models,
            warned: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn default_models() -> HashMap<String, ModelPricing> {
        let mut m = HashMap::new();
        m.insert("gpt-4o", ModelPricing { input_per_mtok: 2.5, output_per_mtok: 10.0 });
        m.insert("gpt-4o-mini", ModelPricing { input_per_mtok: 0.15, output_per_mtok: 0.6 });
        m.insert("deepseek-chat", ModelPricing { input_per_mtok: 0.27, output_per_mtok: 1.1 });
        m.insert("deepseek-reasoner", ModelPricing { input_per_mtok: 0.55, output_per_mtok: 2.19 });
        m.insert("codestral-latest", ModelPricing { input_per_mtok: 0.3, output_per_mtok: 0.9 });
        m.insert("llama-3.3-70b-versatile", ModelPricing { input_per_mtok: 0.59, output_per_mtok: 0.79 });
        m.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// Dollar cost of `usage` under `model`.  Unknown models are free but
    /// warned about once per table instance.
    pub fn cost(&self, model: &str, usage: Usage) -> f64 {
        match self.models.get(model) {
            Some(p) => {
                usage.prompt_tokens as f64 / 1e6 * p.input_per_mtok
                    + usage.completion_tokens as f64 / 1e6 * p.output_per_mtok
            }
            None => {
                if self.warned.lock().unwrap().insert(model.to_string()) {
                    warn!(model, "no pricing entry; counting cost as $0");
                }
                0.0
            }
        }
    }

    pub fn known_models(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
