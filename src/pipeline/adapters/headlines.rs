//! Market-wide headline feed
//!
//! Unlike `Adapter`, a headline source is not keyed by pair: one fetch per
//! cycle returns the latest news items, stored in `headlines` and keyed by
//! (source, url).

use super::sentiment::KEYWORDS;
use crate::pipeline::error::AdapterError;
use crate::pipeline::types::Headline;
use async_trait::async_trait;

#[async_trait]
pub trait HeadlineSource: Send + Sync {
    /// Source tag stored with every headline
    fn source(&self) -> &'static str;

    /// Latest headlines, newest last
    ///
    /// Errors follow `Adapter::fetch`: `Unavailable` is retried, `Data` is not.
    async fn fetch_headlines(&self) -> Result<Vec<Headline>, AdapterError>;
}

/// Tracked keywords that appear in `title`, in lexicon order
pub fn tracked_keywords(title: &str) -> Vec<String> {
    let lower = title.to_lowercase();
    KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .map(|k| k.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_keywords() {
        assert_eq!(
            tracked_keywords("Market wobbles as Open Interest surges; FUNDING flips negative"),
            vec!["funding".to_string(), "open interest".to_string()]
        );
        assert!(tracked_keywords("Quiet weekend").is_empty());
    }
}
