//! Runner configuration.
//!
//! Loaded via the `config` crate from an optional file, then from
//! `WEFT__`-prefixed environment variables, e.g.
//! `WEFT__ENGINE__MAX_LOOP_ITERATIONS=50`.

use serde::Deserialize;
use std::path::Path;
use weft_workflow::EngineConfig;

/// Runner configuration composed from library configs.
#[derive(Debug, Default, Deserialize)]
pub struct RunnerConfig {
    /// Engine defaults and limits.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl RunnerConfig {
    /// Loads configuration from `path` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or a value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_from(path, None)
    }

    fn load_from(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("WEFT")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
