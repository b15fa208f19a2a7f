//! Configuration types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StrataResult};
use crate::freshness::Freshness;

/// Default bound on concurrent batched reads.
pub const DEFAULT_MAX_PARALLELISM: usize = 8;

/// Default freshness for reads that say `Freshness::Default`.
pub const DEFAULT_FRESHNESS_SECS: u32 = 300;

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Substituted for `Freshness::Default` on primary reads.
    pub default_freshness: Freshness,
    /// Substituted when a read carries no fallback freshness. `None` = never fall back.
    pub default_fallback_freshness: Option<Freshness>,
    /// Substituted for `Freshness::Default` on association reads.
    pub default_populate_freshness: Freshness,
    /// Chunk size for batched reads.
    pub max_parallelism: usize,
    /// Directory holding pending-change envelopes.
    pub pending_dir: PathBuf,
    /// Directory holding hold markers.
    pub hold_dir: PathBuf,
    /// Connectivity at startup.
    pub online: bool,
}

impl StrataConfig {
    /// Defaults rooted at `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        Self {
            default_freshness: Freshness::MaxAge(DEFAULT_FRESHNESS_SECS),
            default_fallback_freshness: Some(Freshness::Any),
            default_populate_freshness: Freshness::Any,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            pending_dir: base_dir.join("pending"),
            hold_dir: base_dir.join("hold"),
            online: true,
        }
    }

    /// Defaults rooted at `base_dir`, overridden from the environment.
    ///
    /// Environment variables:
    /// - `STRATA_DEFAULT_FRESHNESS_SECS`: default max age (default: 300)
    /// - `STRATA_FALLBACK_FRESHNESS_SECS`: fallback max age; `none` disables fallback (default: any age)
    /// - `STRATA_MAX_PARALLELISM`: batched read chunk size (default: 8)
    pub fn from_env(base_dir: impl AsRef<Path>) -> Self {
        let defaults = Self::new(base_dir);

        let default_freshness = std::env::var("STRATA_DEFAULT_FRESHNESS_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Freshness::MaxAge)
            .unwrap_or(defaults.default_freshness);

        let default_fallback_freshness = match std::env::var("STRATA_FALLBACK_FRESHNESS_SECS") {
            Ok(s) if s.eq_ignore_ascii_case("none") => None,
            Ok(s) => s
                .parse()
                .ok()
                .map(|secs| Some(Freshness::MaxAge(secs)))
                .unwrap_or(defaults.default_fallback_freshness),
            Err(_) => defaults.default_fallback_freshness,
        };

        let max_parallelism = std::env::var("STRATA_MAX_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_parallelism);

        Self {
            default_freshness,
            default_fallback_freshness,
            max_parallelism,
            ..defaults
        }
    }

    pub fn with_default_freshness(mut self, freshness: Freshness) -> Self {
        self.default_freshness = freshness;
        self
    }

    pub fn with_fallback_freshness(mut self, freshness: Option<Freshness>) -> Self {
        self.default_fallback_freshness = freshness;
        self
    }

    pub fn with_populate_freshness(mut self, freshness: Freshness) -> Self {
        self.default_populate_freshness = freshness;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_parallelism > 0
    /// - pending_dir and hold_dir are set and distinct
    /// - `Default` is not used as a configured default
    pub fn validate(&self) -> StrataResult<()> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_parallelism".to_string(),
                value: self.max_parallelism.to_string(),
                reason: "max_parallelism must be greater than 0".to_string(),
            }
            .into());
        }

        for (field, dir) in [("pending_dir", &self.pending_dir), ("hold_dir", &self.hold_dir)] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: String::new(),
                    reason: format!("{} must be set", field),
                }
                .into());
            }
        }

        if self.pending_dir == self.hold_dir {
            return Err(ConfigError::InvalidValue {
                field: "hold_dir".to_string(),
                value: self.hold_dir.display().to_string(),
                reason: "hold_dir must differ from pending_dir".to_string(),
            }
            .into());
        }

        let defaults = [
            ("default_freshness", Some(self.default_freshness)),
            ("default_fallback_freshness", self.default_fallback_freshness),
            ("default_populate_freshness", Some(self.default_populate_freshness)),
        ];
        for (field, freshness) in defaults {
            if freshness == Some(Freshness::Default) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "Default".to_string(),
                    reason: "a configured default cannot itself be Default".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}
