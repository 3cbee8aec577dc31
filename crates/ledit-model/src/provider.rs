// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display and pricing lookup (e.g. "openai").
    fn name(&self) -> &str;

    /// Model identifier as reported to users and the pricing table.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Lightweight liveness probe issued before first use in a session.
    ///
    /// The default trusts the provider; HTTP drivers override this with a
    /// cheap endpoint hit so the failover list can skip a dead provider
    /// before burning a real completion on it.
    async fn health(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
