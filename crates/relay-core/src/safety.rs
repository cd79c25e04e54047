use std::sync::Arc;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::Result;

/// External moderation service. `Ok(true)` means the text is acceptable.
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<bool>;
}

/// One check run by the content-safety stage.
#[async_trait]
pub trait SafetyStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` on a violation.
    async fn check(&self, text: &str) -> Result<bool>;
}

/// Case-insensitive keyword / regex blocklist.
pub struct KeywordStrategy {
    patterns: Vec<Regex>,
}

impl KeywordStrategy {
    pub fn new(keywords: &[String]) -> Result<Self> {
        let patterns = keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|k| RegexBuilder::new(k).case_insensitive(true).build())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[async_trait]
impl SafetyStrategy for KeywordStrategy {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn check(&self, text: &str) -> Result<bool> {
        Ok(!self.patterns.iter().any(|p| p.is_match(text)))
    }
}

/// Wraps a [`ContentClassifier`]. A failing classifier lets the text through.
pub struct ClassifierStrategy {
    classifier: Arc<dyn ContentClassifier>,
}

impl ClassifierStrategy {
    pub fn new(classifier: Arc<dyn ContentClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl SafetyStrategy for ClassifierStrategy {
    fn name(&self) -> &str {
        "classifier"
    }

    async fn check(&self, text: &str) -> Result<bool> {
        match self.classifier.classify(text).await {
            Ok(ok) => Ok(ok),
            Err(e) => {
                warn!(error = %e, "content classifier failed; passing message");
                Ok(true)
            }
        }
    }
}
