//! Permission snapshot consumed by the request orchestrator.
//!
//! API keys and their permission tokens live in the metadata store and are
//! managed out of process; this module loads them once at startup and
//! answers `has_permission`. Reloading requires a restart.

use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::error::Error;
use crate::metadata::{key_permissions_key, MetaStore, API_KEYS_KEY};

pub const GET_PERMISSION: &str = "get";
pub const UPLOAD_PERMISSION: &str = "upload";

/// Per-process permissions table. The empty key holds the anonymous grants.
#[derive(Clone, Debug, Default)]
pub struct Permissions {
    by_key: HashMap<String, HashSet<String>>,
}

impl Permissions {
    pub async fn load(store: &dyn MetaStore, config: &Config) -> Result<Self, Error> {
        let mut by_key = HashMap::new();

        let mut anonymous = HashSet::new();
        if !config.authorised_get {
            anonymous.insert(GET_PERMISSION.to_string());
        }
        if !config.authorised_upload {
            anonymous.insert(UPLOAD_PERMISSION.to_string());
        }
        by_key.insert(String::new(), anonymous);

        for key in store.smembers(API_KEYS_KEY).await? {
            let tokens = store.smembers(&key_permissions_key(&key)).await?;
            by_key.insert(key, tokens.into_iter().collect());
        }

        tracing::info!(keys = by_key.len() - 1, "permissions snapshot loaded");
        Ok(Permissions { by_key })
    }

    pub fn has_permission(&self, key: &str, permission: &str) -> bool {
        self.by_key
            .get(key)
            .map_or(false, |tokens| tokens.contains(permission))
    }
}

/// Whether `s` has the shape of an issued API key (a clean UUID: 32 lower
/// hex characters).
pub fn looks_like_key(s: &str) -> bool {
    s.len() == 32
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryStore;

    #[tokio::test]
    async fn anonymous_grants_follow_config_flags() {
        let store = MemoryStore::new();
        let mut config = Config::default();
        config.authorised_get = false;
        config.authorised_upload = true;

        let permissions = Permissions::load(&store, &config).await.unwrap();
        assert!(permissions.has_permission("", GET_PERMISSION));
        assert!(!permissions.has_permission("", UPLOAD_PERMISSION));
    }

    #[tokio::test]
    async fn keys_carry_their_recorded_tokens() {
        let store = MemoryStore::new();
        let key = "0123456789abcdef0123456789abcdef";
        store.sadd(API_KEYS_KEY, key);
        store.sadd(&key_permissions_key(key), UPLOAD_PERMISSION);

        let permissions = Permissions::load(&store, &Config::default()).await.unwrap();
        assert!(permissions.has_permission(key, UPLOAD_PERMISSION));
        assert!(!permissions.has_permission(key, GET_PERMISSION));
        assert!(!permissions.has_permission("unknown", GET_PERMISSION));
    }

    #[test]
    fn key_format() {
        assert!(looks_like_key("0123456789abcdef0123456789abcdef"));
        assert!(!looks_like_key("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!looks_like_key("short"));
        assert!(!looks_like_key("0123456789abcdef0123456789abcdeg"));
    }
}
