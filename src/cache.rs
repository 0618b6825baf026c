//! Token cache — persistence layer for access tokens and signing-key material.
//!
//! The [`TokenCache`] trait abstracts over storage backends. Rows are keyed by
//! `(kind, unique_property)` — e.g. `("access_token", username)` or
//! `("x5c", key_id)` — and carry an opaque value plus an absolute expiration.
//!
//! Expiration is persisted as `"%Y-%m-%d %H:%M:%S"` (UTC) and always compared
//! as a parsed datetime, never lexically. A row whose expiration fails to
//! parse reads as already expired.
//!
//! There is no background reaper: expired rows are deleted lazily by callers
//! on read. Racing creators of the same `(kind, key)` resolve as last write
//! wins.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Datetime format used in persisted rows.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A persisted cache row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedToken {
    /// Row id assigned at creation
    pub id: u64,

    /// Opaque token / key / certificate material
    pub value: String,

    /// Absolute expiration, `"%Y-%m-%d %H:%M:%S"` in UTC
    pub expiration: String,

    /// Category tag, e.g. `access_token`, `x5c`, `x509`
    #[serde(rename = "type")]
    pub kind: String,

    /// Owning identity: username for access tokens, key id for signing keys
    pub unique_property: String,
}

impl CachedToken {
    /// Parse the expiration column. `None` when the stored value is not a
    /// valid datetime.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.expiration, EXPIRATION_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Returns `true` if the row has passed its expiration, or if the stored
    /// expiration cannot be parsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires) => expires < now,
            None => true,
        }
    }
}

/// Format an absolute expiration for persistence.
#[must_use]
pub fn format_expiration(at: DateTime<Utc>) -> String {
    at.format(EXPIRATION_FORMAT).to_string()
}

/// Trait abstracting the token cache backend.
///
/// All four operations are atomic at the single-row level; there are no
/// multi-row transactional guarantees. `Err` means a storage fault —
/// "not found" is `Ok(None)` / `Ok(0)`, never an error.
#[async_trait]
pub trait TokenCache: Send + Sync + 'static {
    /// Look up the row for `(kind, key)`. At most one row is returned.
    async fn get(&self, kind: &str, key: &str) -> Result<Option<CachedToken>>;

    /// Insert a row for `(kind, key)`, returning its id.
    async fn create(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<u64>;

    /// Update the row matched by `(kind, key)`, returning the affected count.
    async fn update(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<usize>;

    /// Remove the row matched by `(kind, key)`, returning the affected count.
    async fn delete(&self, kind: &str, key: &str) -> Result<usize>;
}

fn next_row_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// File-backed token cache — one JSON row per `(kind, key)`.
///
/// Survives process restarts; suitable for the single-node deployments this
/// broker targets. Row files get owner-only permissions on Unix since they
/// hold live credentials.
pub struct FileTokenCache {
    base_dir: PathBuf,
}

impl FileTokenCache {
    /// Create a file cache rooted at `base_dir`, creating it if missing.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .map_err(|e| Error::Storage(format!("Failed to create cache dir: {e}")))?;
        }

        Ok(Self { base_dir })
    }

    /// Create the cache in the default location (`~/.token-broker/cache`).
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Storage("Cannot determine home directory".to_string()))?;

        Self::new(home.join(".token-broker").join("cache"))
    }

    fn storage_key(kind: &str, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let full: String = hash.iter().fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        });
        full[..16].to_string()
    }

    fn row_path(&self, kind: &str, key: &str) -> PathBuf {
        let name = Self::storage_key(kind, key);
        self.base_dir.join(format!("{name}.json"))
    }

    fn write_row(&self, row: &CachedToken) -> Result<()> {
        let path = self.row_path(&row.kind, &row.unique_property);

        let content = serde_json::to_string_pretty(row)
            .map_err(|e| Error::Storage(format!("Failed to serialize cache row: {e}")))?;

        fs::write(&path, content)
            .map_err(|e| Error::Storage(format!("Failed to write cache row: {e}")))?;

        // Owner read/write only — rows hold live credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&path, perms);
        }

        Ok(())
    }
}

#[async_trait]
impl TokenCache for FileTokenCache {
    async fn get(&self, kind: &str, key: &str) -> Result<Option<CachedToken>> {
        let path = self.row_path(kind, key);

        if !path.exists() {
            debug!(kind = %kind, "No cached row found");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read cache row: {e}")))?;

        match serde_json::from_str::<CachedToken>(&content) {
            Ok(row) => Ok(Some(row)),
            Err(e) => {
                // A corrupt row reads as absent; the caller will re-acquire
                warn!(kind = %kind, error = %e, "Discarding unparseable cache row");
                Ok(None)
            }
        }
    }

    async fn create(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<u64> {
        let row = CachedToken {
            id: next_row_id(),
            value: value.to_string(),
            expiration: format_expiration(expiration),
            kind: kind.to_string(),
            unique_property: key.to_string(),
        };

        self.write_row(&row)?;
        debug!(kind = %kind, id = row.id, "Created cache row");
        Ok(row.id)
    }

    async fn update(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<usize> {
        let Some(mut row) = self.get(kind, key).await? else {
            return Ok(0);
        };

        row.value = value.to_string();
        row.expiration = format_expiration(expiration);
        self.write_row(&row)?;
        debug!(kind = %kind, id = row.id, "Updated cache row");
        Ok(1)
    }

    async fn delete(&self, kind: &str, key: &str) -> Result<usize> {
        let path = self.row_path(kind, key);

        if !path.exists() {
            return Ok(0);
        }

        fs::remove_file(&path)
            .map_err(|e| Error::Storage(format!("Failed to delete cache row: {e}")))?;
        debug!(kind = %kind, "Deleted cache row");
        Ok(1)
    }
}

/// In-memory token cache backed by a `DashMap`.
///
/// Used by tests and ephemeral deployments where persistence across restarts
/// is not needed.
pub struct InMemoryTokenCache {
    rows: DashMap<(String, String), CachedToken>,
}

impl InMemoryTokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl Default for InMemoryTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get(&self, kind: &str, key: &str) -> Result<Option<CachedToken>> {
        Ok(self
            .rows
            .get(&(kind.to_string(), key.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn create(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<u64> {
        let row = CachedToken {
            id: next_row_id(),
            value: value.to_string(),
            expiration: format_expiration(expiration),
            kind: kind.to_string(),
            unique_property: key.to_string(),
        };

        let id = row.id;
        self.rows.insert((kind.to_string(), key.to_string()), row);
        Ok(id)
    }

    async fn update(
        &self,
        value: &str,
        expiration: DateTime<Utc>,
        kind: &str,
        key: &str,
    ) -> Result<usize> {
        match self.rows.get_mut(&(kind.to_string(), key.to_string())) {
            Some(mut entry) => {
                entry.value = value.to_string();
                entry.expiration = format_expiration(expiration);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, kind: &str, key: &str) -> Result<usize> {
        match self.rows.remove(&(kind.to_string(), key.to_string())) {
            Some(_) => Ok(1),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn in_one_hour() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[tokio::test]
    async fn create_then_get_returns_same_row() {
        // GIVEN: an empty in-memory cache
        let cache = InMemoryTokenCache::new();
        let expires = in_one_hour();

        // WHEN: a row is created and read back
        let id = cache
            .create("tok-value", expires, "access_token", "alice")
            .await
            .unwrap();
        let row = cache.get("access_token", "alice").await.unwrap().unwrap();

        // THEN: value, expiration, and identity match
        assert_eq!(row.id, id);
        assert_eq!(row.value, "tok-value");
        assert_eq!(row.expiration, format_expiration(expires));
        assert_eq!(row.kind, "access_token");
        assert_eq!(row.unique_property, "alice");
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_row() {
        let cache = InMemoryTokenCache::new();
        assert!(cache.get("access_token", "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_changes_value_without_changing_identity() {
        // GIVEN: an existing row
        let cache = InMemoryTokenCache::new();
        cache
            .create("old", in_one_hour(), "access_token", "alice")
            .await
            .unwrap();

        // WHEN: the row is updated
        let later = in_one_hour() + Duration::hours(1);
        let affected = cache
            .update("new", later, "access_token", "alice")
            .await
            .unwrap();

        // THEN: one row changed, same (kind, key), new value
        assert_eq!(affected, 1);
        let row = cache.get("access_token", "alice").await.unwrap().unwrap();
        assert_eq!(row.value, "new");
        assert_eq!(row.kind, "access_token");
        assert_eq!(row.unique_property, "alice");
    }

    #[tokio::test]
    async fn update_of_missing_row_affects_nothing() {
        let cache = InMemoryTokenCache::new();
        let affected = cache
            .update("v", in_one_hour(), "access_token", "ghost")
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        // GIVEN: an existing row
        let cache = InMemoryTokenCache::new();
        cache
            .create("v", in_one_hour(), "x5c", "kid-1")
            .await
            .unwrap();

        // WHEN: deleted
        let affected = cache.delete("x5c", "kid-1").await.unwrap();

        // THEN: the row is gone
        assert_eq!(affected, 1);
        assert!(cache.get("x5c", "kid-1").await.unwrap().is_none());
        // Deleting again affects nothing
        assert_eq!(cache.delete("x5c", "kid-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_with_same_key_but_different_kind_are_independent() {
        let cache = InMemoryTokenCache::new();
        cache
            .create("cert", in_one_hour(), "x5c", "abc")
            .await
            .unwrap();
        cache
            .create("token", in_one_hour(), "access_token", "abc")
            .await
            .unwrap();

        assert_eq!(
            cache.get("x5c", "abc").await.unwrap().unwrap().value,
            "cert"
        );
        assert_eq!(
            cache.get("access_token", "abc").await.unwrap().unwrap().value,
            "token"
        );
    }

    #[tokio::test]
    async fn file_cache_round_trips_a_row() {
        // GIVEN: a file cache in a temp dir
        let dir = tempfile::tempdir().unwrap();
        let cache = FileTokenCache::new(dir.path().to_path_buf()).unwrap();
        let expires = in_one_hour();

        // WHEN: create, read, update, delete
        cache
            .create("material", expires, "x509", "google-kid")
            .await
            .unwrap();
        let row = cache.get("x509", "google-kid").await.unwrap().unwrap();
        assert_eq!(row.value, "material");

        cache
            .update("fresh", expires, "x509", "google-kid")
            .await
            .unwrap();
        let row = cache.get("x509", "google-kid").await.unwrap().unwrap();
        assert_eq!(row.value, "fresh");

        cache.delete("x509", "google-kid").await.unwrap();
        assert!(cache.get("x509", "google-kid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_cache_reads_corrupt_row_as_absent() {
        // GIVEN: a row file holding junk
        let dir = tempfile::tempdir().unwrap();
        let cache = FileTokenCache::new(dir.path().to_path_buf()).unwrap();
        let path = cache.row_path("access_token", "alice");
        std::fs::write(&path, "not json at all").unwrap();

        // THEN: get treats it as a miss rather than failing
        assert!(cache.get("access_token", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_over_existing_row_is_last_write_wins() {
        // Two racing creators may both succeed; the second overwrites
        let cache = InMemoryTokenCache::new();
        cache
            .create("first", in_one_hour(), "access_token", "alice")
            .await
            .unwrap();
        cache
            .create("second", in_one_hour(), "access_token", "alice")
            .await
            .unwrap();

        let row = cache.get("access_token", "alice").await.unwrap().unwrap();
        assert_eq!(row.value, "second");
    }

    #[test]
    fn expiration_is_compared_as_datetime_not_text() {
        // "2025-9-02" style zero-padding differences would break a lexical
        // comparison; the parsed comparison is immune
        let row = CachedToken {
            id: 1,
            value: "v".to_string(),
            expiration: "2030-01-01 00:00:00".to_string(),
            kind: "access_token".to_string(),
            unique_property: "alice".to_string(),
        };

        assert!(!row.is_expired(Utc::now()));
        assert_eq!(
            row.expires_at().unwrap(),
            NaiveDateTime::parse_from_str("2030-01-01 00:00:00", EXPIRATION_FORMAT)
                .unwrap()
                .and_utc()
        );
    }

    #[test]
    fn unparseable_expiration_reads_as_expired() {
        let row = CachedToken {
            id: 1,
            value: "v".to_string(),
            expiration: "soonish".to_string(),
            kind: "access_token".to_string(),
            unique_property: "alice".to_string(),
        };

        assert!(row.expires_at().is_none());
        assert!(row.is_expired(Utc::now()));
    }

    #[test]
    fn storage_key_is_stable_and_distinct() {
        let a = FileTokenCache::storage_key("access_token", "alice");
        let b = FileTokenCache::storage_key("access_token", "alice");
        let c = FileTokenCache::storage_key("x5c", "alice");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
