//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Runtime configuration for the VM.
///
/// Read from a `kettle.toml` file; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Frames per thread before `StackOverflowError` is raised.
    pub max_call_depth: usize,
    /// Run the structural verifier on every class before linking.
    pub verify: bool,
    /// Log every method entry at `info` level (target `kettle::calls`).
    pub trace_calls: bool,
    /// Share string-constant objects across classes.
    pub intern_strings: bool,
    /// Hard limit on live objects (None = unlimited)
    pub heap_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            verify: true,
            trace_calls: false,
            intern_strings: true,
            heap_limit: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_keys() {
        let config = RuntimeConfig::from_toml("max_call_depth = 64\n").unwrap();
        assert_eq!(config.max_call_depth, 64);
        assert!(config.verify);
        assert_eq!(config.heap_limit, None);
    }

    #[test]
    fn test_full_file() {
        let config = RuntimeConfig::from_toml(
            "verify = false\ntrace_calls = true\nintern_strings = false\nheap_limit = 500\n",
        )
        .unwrap();
        assert!(!config.verify);
        assert!(config.trace_calls);
        assert!(!config.intern_strings);
        assert_eq!(config.heap_limit, Some(500));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(matches!(
            RuntimeConfig::from_toml("jit = true\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/kettle.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kettle.toml"));
    }
}
