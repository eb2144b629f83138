//! Environment and option-file configuration

use crate::error::ApoError;
use crate::generation::gemini::DEFAULT_BASE_URL;
use crate::Result;
use serde::de::DeserializeOwned;
use std::path::Path;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub model: String,
}

impl AppConfig {
    /// Read settings from the process environment. Call `dotenv::dotenv()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let gemini_api_key = non_empty("GEMINI_API_KEY")
            .ok_or_else(|| ApoError::ConfigError("GEMINI_API_KEY not set".to_string()))?;

        Ok(Self {
            gemini_api_key,
            gemini_base_url: non_empty("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: non_empty("APO_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

/// Load a JSON options file
pub fn load_options<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ApoError::ConfigError(format!("read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&raw)?)
}
