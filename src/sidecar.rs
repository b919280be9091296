//! JSON metadata written next to the refined document.

use crate::cache::CacheStats;
use crate::config::Config;
use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Run summary for tooling that wraps the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sidecar {
    pub ok: bool,
    pub provider: String,
    pub model: String,
    pub model_source: String,
    pub endpoint: String,
    pub endpoint_source: String,
    pub refine_ms: u64,
    pub chunks: usize,
    /// Zero-based indices of chunks that failed.
    pub failed_chunks: Vec<usize>,
    pub memory_items_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl Sidecar {
    /// Starts a sidecar from the resolved configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            ok: false,
            provider: config.model.provider.to_string(),
            model: config.model.model.clone(),
            model_source: config.sources.model.clone(),
            endpoint: config.model.endpoint.clone(),
            endpoint_source: config.sources.endpoint.clone(),
            refine_ms: 0,
            chunks: 0,
            failed_chunks: Vec::new(),
            memory_items_used: 0,
            cache: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::VoxError::Other(format!("Failed to encode sidecar: {}", e)))
    }

    /// Writes the sidecar, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut json = self.to_json()?;
        json.push('\n');
        fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "wrote sidecar");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_records_sources() {
        let mut config = Config::default();
        config.sources.model = "flag".to_string();
        let sidecar = Sidecar::from_config(&config);

        assert!(!sidecar.ok);
        assert_eq!(sidecar.provider, "ollama");
        assert_eq!(sidecar.model, "llama3.1");
        assert_eq!(sidecar.model_source, "flag");
        assert_eq!(sidecar.endpoint_source, "default");
    }

    #[test]
    fn test_json_fields() {
        let mut sidecar = Sidecar::from_config(&Config::default());
        sidecar.ok = true;
        sidecar.chunks = 3;
        sidecar.failed_chunks = vec![1];
        sidecar.refine_ms = 42;

        let value: serde_json::Value = serde_json::from_str(&sidecar.to_json().unwrap()).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["chunks"], 3);
        assert_eq!(value["failed_chunks"], serde_json::json!([1]));
        assert_eq!(value["refine_ms"], 42);
        assert_eq!(value["memory_items_used"], 0);
        assert!(value.get("cache").is_none());
    }

    #[test]
    fn test_cache_stats_included_when_set() {
        let mut sidecar = Sidecar::from_config(&Config::default());
        sidecar.cache = Some(CacheStats {
            total: 2,
            valid: 1,
            expired: 1,
        });
        let value: serde_json::Value = serde_json::from_str(&sidecar.to_json().unwrap()).unwrap();
        assert_eq!(value["cache"]["valid"], 1);
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("note.json");
        Sidecar::from_config(&Config::default()).write(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"provider\": \"ollama\""));
    }
}
