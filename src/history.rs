//! Accepted prompt history
//!
//! Every prompt an optimizer accepts is kept as an immutable version with a
//! digest, so a session can be reviewed and replayed after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub version_id: Uuid,
    pub index: usize,
    pub prompt: String,
    pub accuracy: Option<f64>,
    pub digest: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptHistory {
    versions: Vec<PromptVersion>,
}

impl PromptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an accepted prompt and return its version id
    pub fn record(&mut self, prompt: impl Into<String>, accuracy: Option<f64>) -> Uuid {
        let prompt = prompt.into();
        let version = PromptVersion {
            version_id: Uuid::new_v4(),
            index: self.versions.len(),
            digest: compute_prompt_digest(&prompt),
            prompt,
            accuracy,
            accepted_at: Utc::now(),
        };

        let id = version.version_id;
        self.versions.push(version);
        id
    }

    pub fn latest(&self) -> Option<&PromptVersion> {
        self.versions.last()
    }

    pub fn get(&self, version_id: Uuid) -> Option<&PromptVersion> {
        self.versions.iter().find(|v| v.version_id == version_id)
    }

    pub fn versions(&self) -> &[PromptVersion] {
        &self.versions
    }

    /// Prompt texts in acceptance order
    pub fn prompts(&self) -> Vec<&str> {
        self.versions.iter().map(|v| v.prompt.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Recompute every digest and compare with the stored one
    pub fn verify_integrity(&self) -> bool {
        self.versions
            .iter()
            .all(|v| compute_prompt_digest(&v.prompt) == v.digest)
    }
}

/// SHA256 hex digest of a prompt text
pub fn compute_prompt_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}
