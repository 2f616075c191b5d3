//! REPL configuration.
//!
//! Loaded from `~/.config/cubescript/repl.toml` when present; every field
//! is optional and the defaults work without a file.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplConfig {
    /// Prompt shown before each line.
    pub prompt: String,
    /// History file path; defaults next to the config file.
    pub history: Option<PathBuf>,
    /// Number of alias frames shown in diagnostic traces (`dbgalias`).
    pub trace_depth: Option<i32>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        ReplConfig {
            prompt: "> ".to_string(),
            history: None,
            trace_depth: None,
        }
    }
}

/// The directory holding config and history.
pub fn config_dir() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(".config").join("cubescript"))
}

impl ReplConfig {
    /// Load the config file if one exists; malformed files fall back to
    /// defaults with a message on stderr.
    pub fn load() -> ReplConfig {
        let Some(path) = config_dir().map(|d| d.join("repl.toml")) else {
            return ReplConfig::default();
        };
        let Ok(text) = std::fs::read_to_string(&path) else {
            return ReplConfig::default();
        };
        match toml::from_str(&text) {
            Ok(cfg) => {
                tracing::debug!("loaded config from {}", path.display());
                cfg
            }
            Err(e) => {
                eprintln!("ignoring malformed {}: {}", path.display(), e);
                ReplConfig::default()
            }
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        self.history
            .clone()
            .or_else(|| config_dir().map(|d| d.join("history")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ReplConfig::default();
        assert_eq!(cfg.prompt, "> ");
        assert!(cfg.history.is_none());
    }

    #[test]
    fn test_parse_config() {
        let cfg: ReplConfig =
            toml::from_str("prompt = \">> \"\ntrace_depth = 8\n").expect("valid toml");
        assert_eq!(cfg.prompt, ">> ");
        assert_eq!(cfg.trace_depth, Some(8));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<ReplConfig>("nope = 1").is_err());
    }
}
