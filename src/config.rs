//! Process-wide configuration.
//!
//! Built programmatically (or deserialized by an embedder) and finalised
//! from the environment at startup; reloading requires a restart.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::error::Error;
use crate::params::Params;

pub const LOCAL_PATH_ENV_VAR: &str = "IMGSERV_LOCAL_PATH";
pub const PORT_ENV_VAR: &str = "IMGSERV_PORT";

pub const DEFAULT_LOCAL_PATH: &str = "local-images";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_THROTTLING_RATE: u32 = 60;
pub const DEFAULT_UPLOAD_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Which access index pruning selects victims from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Evict the least recently read artifacts first.
    Lru,
    /// Evict the least frequently read artifacts first.
    Lfu,
}

/// A named transformation available as a URL parameter identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transformation {
    pub params: Params,
    /// Eager transformations are materialised in the background on upload.
    #[serde(default)]
    pub eager: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requests per minute per remote address; 0 disables throttling.
    pub throttling_rate: u32,
    /// Derived-artifact byte budget; 0 means uncapped.
    pub cache_limit: u64,
    pub cache_policy: CachePolicy,
    pub jpeg_quality: u8,
    pub upload_max_file_size: u64,
    /// When true, uploads return before the source blob is stored.
    pub async_uploads: bool,
    pub allow_custom_transformations: bool,
    pub allow_custom_scale: bool,
    /// When true, anonymous requests may not read images.
    pub authorised_get: bool,
    /// When true, anonymous requests may not upload.
    pub authorised_upload: bool,
    pub local_path: String,
    pub port: u16,
    pub transformations: HashMap<String, Transformation>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            throttling_rate: DEFAULT_THROTTLING_RATE,
            cache_limit: 0,
            cache_policy: CachePolicy::Lru,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            upload_max_file_size: DEFAULT_UPLOAD_MAX_FILE_SIZE,
            async_uploads: false,
            allow_custom_transformations: true,
            allow_custom_scale: false,
            authorised_get: false,
            authorised_upload: true,
            local_path: DEFAULT_LOCAL_PATH.to_string(),
            port: DEFAULT_PORT,
            transformations: HashMap::new(),
        }
    }
}

impl Config {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(path) = env::var(LOCAL_PATH_ENV_VAR) {
            if !path.is_empty() {
                config.local_path = path;
            }
        }
        if let Some(port) = env::var(PORT_ENV_VAR).ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.jpeg_quality < 1 || self.jpeg_quality > 100 {
            return Err(Error::InvalidParameter(format!(
                "jpeg quality must be within [1, 100], got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    /// Resolves a named transformation, stamping the descriptor with its name.
    pub fn preset(&self, name: &str) -> Option<Params> {
        self.transformations.get(name).map(|t| {
            let mut params = t.params.clone();
            params.name = Some(name.to_string());
            params
        })
    }

    /// Transformations materialised in the background on upload.
    pub fn eager_transformations(&self) -> Vec<Params> {
        let mut eager: Vec<(&String, &Transformation)> = self
            .transformations
            .iter()
            .filter(|(_, t)| t.eager)
            .collect();
        // Deterministic fan-out order.
        eager.sort_by_key(|(name, _)| name.as_str());
        eager
            .into_iter()
            .map(|(name, t)| {
                let mut params = t.params.clone();
                params.name = Some(name.clone());
                params
            })
            .collect()
    }
}
