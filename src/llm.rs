//! Completion provider seam. The engine treats the provider as an opaque
//! blocking call; concrete clients (Anthropic, OpenAI, ...) live outside
//! the core and plug in through this trait.

use anyhow::Result;
use async_trait::async_trait;

/// One completion from a provider.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub total_tokens: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        user_id: i64,
        task_id: i64,
    ) -> Result<Completion>;
}
