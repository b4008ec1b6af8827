//! Machine settings.
//!
//! Settings are layered: command-line flags, then environment variables
//! (`BFM_MAX_STEPS`, `BFM_TIMEOUT_MS`), then the `[machine]` section of
//! `bfm.toml`, then built-in defaults. The config file lives in the XDG config
//! home (e.g. `~/.config/bfm.toml`) unless `BFM_CONFIG` names another path.
//!
//! ```toml
//! [machine]
//! tape_length = 30000
//! brackets = "nested"   # or "flat"
//! eof = "zero"          # or "unchanged", "fail"
//! max_steps = 1000000
//! timeout_ms = 2000
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;

use cross_xdg::BaseDirs;

use crate::machine::{BracketMatching, EofPolicy, MachineOptions, DEFAULT_TAPE_LENGTH};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "BFM_CONFIG";
pub const MAX_STEPS_ENV: &str = "BFM_MAX_STEPS";
pub const TIMEOUT_MS_ENV: &str = "BFM_TIMEOUT_MS";

/// Problems found while reading the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },

    #[error("line {line}: unknown key '{key}' in [machine]")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue { line: usize, key: String, value: String },
}

/// One layer of settings. `None` means "not set here; ask the next layer".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub tape_length: Option<usize>,
    pub bracket_matching: Option<BracketMatching>,
    pub eof_policy: Option<EofPolicy>,
    pub max_steps: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl Settings {
    /// Fill every unset field from `fallback`.
    pub fn or(self, fallback: Settings) -> Settings {
        Settings {
            tape_length: self.tape_length.or(fallback.tape_length),
            bracket_matching: self.bracket_matching.or(fallback.bracket_matching),
            eof_policy: self.eof_policy.or(fallback.eof_policy),
            max_steps: self.max_steps.or(fallback.max_steps),
            timeout_ms: self.timeout_ms.or(fallback.timeout_ms),
        }
    }

    /// Machine options with defaults applied to anything left unset.
    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            tape_length: self.tape_length.unwrap_or(DEFAULT_TAPE_LENGTH),
            bracket_matching: self.bracket_matching.unwrap_or_default(),
            eof_policy: self.eof_policy.unwrap_or_default(),
        }
    }

    /// Read the limit variables through `var`. Unparseable values are ignored.
    pub fn from_env_with<F>(var: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        Settings {
            max_steps: var(MAX_STEPS_ENV).and_then(|s| s.trim().parse::<u64>().ok()),
            timeout_ms: var(TIMEOUT_MS_ENV).and_then(|s| s.trim().parse::<u64>().ok()),
            ..Settings::default()
        }
    }

    pub fn from_env() -> Settings {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Parse the `[machine]` section of a config file. Other sections are ignored.
    pub fn from_toml_str(content: &str) -> Result<Settings, ConfigError> {
        // Very small hand-rolled parser: look for [machine] section and key = value pairs
        let mut in_machine = false;
        let mut settings = Settings::default();

        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue; }
            if line.starts_with('[') && line.ends_with(']') {
                in_machine = line[1..line.len() - 1].trim() == "machine";
                continue;
            }
            if !in_machine { continue; }
            let Some(eq) = line.find('=') else { continue };

            let key = line[..eq].trim();
            let raw = line[eq + 1..].trim();
            let Some(value) = scalar_value(raw) else {
                return Err(ConfigError::InvalidValue {
                    line: line_no,
                    key: key.to_string(),
                    value: raw.to_string(),
                });
            };
            let invalid = || ConfigError::InvalidValue {
                line: line_no,
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "tape_length" => {
                    let n = value.parse::<usize>().map_err(|_| invalid())?;
                    if n == 0 { return Err(invalid()); }
                    settings.tape_length = Some(n);
                }
                "brackets" => {
                    let matching = parse_bracket_matching(value).ok_or_else(invalid)?;
                    settings.bracket_matching = Some(matching);
                }
                "eof" => {
                    settings.eof_policy = Some(parse_eof_policy(value).ok_or_else(invalid)?);
                }
                "max_steps" => settings.max_steps = Some(value.parse().map_err(|_| invalid())?),
                "timeout_ms" => settings.timeout_ms = Some(value.parse().map_err(|_| invalid())?),
                _ => {
                    return Err(ConfigError::UnknownKey { line: line_no, key: key.to_string() });
                }
            }
        }

        Ok(settings)
    }

    /// Load the config file. A missing file is an empty layer.
    pub fn load() -> Result<Settings, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(Settings::default());
        };
        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }
}

/// Where the config file is expected: `$BFM_CONFIG`, else `<config home>/bfm.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(explicit));
    }

    // On Linux: resolves to /home/<user>/.config
    // On Windows: resolves to C:\Users\<user>\.config
    // On macOS: resolves to /Users/<user>/.config
    let base_dirs = BaseDirs::new().ok()?;
    let mut path = PathBuf::from(base_dirs.config_home());
    path.push("bfm.toml");
    Some(path)
}

pub fn parse_bracket_matching(value: &str) -> Option<BracketMatching> {
    match value.trim().to_ascii_lowercase().as_str() {
        "nested" => Some(BracketMatching::Nested),
        "flat" => Some(BracketMatching::Flat),
        _ => None,
    }
}

pub fn parse_eof_policy(value: &str) -> Option<EofPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "zero" | "0" => Some(EofPolicy::Zero),
        "unchanged" | "keep" => Some(EofPolicy::Unchanged),
        "fail" | "error" => Some(EofPolicy::Fail),
        _ => None,
    }
}

/// The value part of a `key = value` line, without quotes or trailing comment.
///
/// Quoted values end at the closing quote; only whitespace or a `#` comment
/// may follow it. Returns `None` for an unterminated quote or trailing junk.
fn scalar_value(raw: &str) -> Option<&str> {
    let Some(quoted) = raw.strip_prefix('"') else {
        return Some(raw.split('#').next().unwrap_or(raw).trim());
    };
    let close = quoted.find('"')?;
    let rest = quoted[close + 1..].trim_start();
    if rest.is_empty() || rest.starts_with('#') {
        Some(&quoted[..close])
    } else {
        None
    }
}
