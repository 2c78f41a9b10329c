//! Text rewriting before re-publishing.
//!
//! The rewrite service is optional and unreliable by contract: every failure
//! collapses to [`RewriteResult::Unavailable`] and callers publish the
//! original text instead.

mod client;

pub use client::{DEFAULT_REWRITE_TIMEOUT, RewriteClient};

use async_trait::async_trait;

/// Outcome of a rewrite attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteResult {
    Rewritten(String),
    Unavailable,
}

impl RewriteResult {
    /// Rewritten text, or `original` when the service gave nothing back.
    pub fn or_original(self, original: &str) -> String {
        match self {
            RewriteResult::Rewritten(text) => text,
            RewriteResult::Unavailable => original.to_string(),
        }
    }
}

/// Something that can rewrite a post body.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, text: &str) -> RewriteResult;
}

/// Used when no rewrite endpoint is configured.
pub struct PassthroughRewriter;

#[async_trait]
impl Rewriter for PassthroughRewriter {
    async fn rewrite(&self, _text: &str) -> RewriteResult {
        RewriteResult::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_falls_back_to_original() {
        assert_eq!(RewriteResult::Unavailable.or_original("hello"), "hello");
        assert_eq!(
            RewriteResult::Rewritten("hi".into()).or_original("hello"),
            "hi"
        );
    }

    #[tokio::test]
    async fn passthrough_is_always_unavailable() {
        assert_eq!(
            PassthroughRewriter.rewrite("anything").await,
            RewriteResult::Unavailable
        );
    }
}
