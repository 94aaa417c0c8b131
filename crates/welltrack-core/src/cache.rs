use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use welltrack_protocol::ResultPayload;

use crate::error::{CoreError, CoreResult};
use crate::session_key::SessionKey;
use crate::store::AnalysisSession;

pub const CACHE_FORMAT_VERSION: &str = "1.0";
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted form of a session: the whole result list, never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope {
    pub results: Vec<ResultPayload>,
    pub session_key: SessionKey,
    /// Seconds since the Unix epoch at which the envelope was written.
    pub timestamp: f64,
    pub version: String,
}

impl CacheEnvelope {
    pub fn from_session(session: &AnalysisSession) -> Self {
        Self::new(session.session_key.clone(), session.results())
    }

    pub fn new(session_key: SessionKey, results: Vec<ResultPayload>) -> Self {
        Self {
            results,
            session_key,
            timestamp: unix_seconds(OffsetDateTime::now_utc()),
            version: CACHE_FORMAT_VERSION.to_owned(),
        }
    }

    /// Age relative to `now`. A timestamp from the future counts as fresh;
    /// one too old to represent, or not a number at all, counts as
    /// maximally old.
    pub fn age_at(&self, now: OffsetDateTime) -> Duration {
        let age = unix_seconds(now) - self.timestamp;
        if age.is_nan() {
            return Duration::MAX;
        }
        if age <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(age).unwrap_or(Duration::MAX)
    }
}

/// Result of looking for a usable cache. Everything but `Hit` means "no
/// usable cache" and is never an error for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEnvelope),
    Missing,
    Invalid(String),
    KeyMismatch { found: SessionKey },
    Stale { age: Duration },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_envelope(self) -> Option<CacheEnvelope> {
        match self {
            Self::Hit(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn miss_reason(&self) -> Option<String> {
        match self {
            Self::Hit(_) => None,
            Self::Missing => Some("no cache file".to_owned()),
            Self::Invalid(reason) => Some(format!("unreadable cache: {reason}")),
            Self::KeyMismatch { found } => Some(format!("cache belongs to session {found}")),
            Self::Stale { age } => Some(format!("cache is {}s old", age.as_secs())),
        }
    }
}

/// One JSON file per input location under a cache directory.
#[derive(Debug, Clone)]
pub struct CacheManager {
    directory: PathBuf,
    staleness: Duration,
}

impl CacheManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_staleness(directory, DEFAULT_STALENESS)
    }

    pub fn with_staleness(directory: impl Into<PathBuf>, staleness: Duration) -> Self {
        Self {
            directory: directory.into(),
            staleness,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, session_key: &SessionKey) -> PathBuf {
        self.directory.join(format!("{session_key}.json"))
    }

    pub fn save(&self, session: &AnalysisSession) -> CoreResult<()> {
        self.write_envelope(&CacheEnvelope::from_session(session))
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// reader sees either the old envelope or the new one.
    pub fn write_envelope(&self, envelope: &CacheEnvelope) -> CoreResult<()> {
        let path = self.path_for(&envelope.session_key);
        let body = serde_json::to_vec_pretty(envelope)?;

        write_atomically(&path, &body)?;

        tracing::debug!(
            session_key = %envelope.session_key,
            results = envelope.results.len(),
            path = %path.display(),
            "wrote cache envelope"
        );
        Ok(())
    }

    pub fn lookup(&self, session_key: &SessionKey) -> CacheLookup {
        self.lookup_at(session_key, OffsetDateTime::now_utc())
    }

    pub fn lookup_at(&self, session_key: &SessionKey, now: OffsetDateTime) -> CacheLookup {
        let path = self.path_for(session_key);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(error) if error.kind() == ErrorKind::NotFound => return CacheLookup::Missing,
            Err(error) => return CacheLookup::Invalid(error.to_string()),
        };
        let envelope = match serde_json::from_slice::<CacheEnvelope>(&body) {
            Ok(envelope) => envelope,
            Err(error) => return CacheLookup::Invalid(error.to_string()),
        };
        if &envelope.session_key != session_key {
            return CacheLookup::KeyMismatch {
                found: envelope.session_key,
            };
        }
        let age = envelope.age_at(now);
        if age > self.staleness {
            return CacheLookup::Stale { age };
        }
        CacheLookup::Hit(envelope)
    }

    /// Returns the envelope and whether a usable one was found.
    pub fn load(&self, session_key: &SessionKey) -> (Option<CacheEnvelope>, bool) {
        let lookup = self.lookup(session_key);
        if let Some(reason) = lookup.miss_reason() {
            tracing::info!(session_key = %session_key, reason = reason.as_str(), "no usable cache");
        }
        let envelope = lookup.into_envelope();
        let found = envelope.is_some();
        (envelope, found)
    }

    pub fn invalidate(&self, session_key: &SessionKey) -> CoreResult<()> {
        match fs::remove_file(self.path_for(session_key)) {
            Ok(()) => {
                tracing::debug!(session_key = %session_key, "invalidated cache");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Replaces `path` through a temp file in the same directory.
pub(crate) fn write_atomically(path: &Path, body: &[u8]) -> CoreResult<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)?;
    let mut staging = tempfile::NamedTempFile::new_in(directory)?;
    staging.write_all(body)?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .map_err(|error| CoreError::Persistence(error.error.to_string()))?;
    Ok(())
}

fn unix_seconds(at: OffsetDateTime) -> f64 {
    at.unix_timestamp_nanos() as f64 / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;
    use welltrack_protocol::ResultPayload;

    use super::{CacheEnvelope, CacheLookup, CacheManager};
    use crate::session_key::SessionKey;

    #[test]
    fn future_timestamp_counts_as_fresh() {
        let mut envelope = CacheEnvelope::new(SessionKey::new("k"), Vec::new());
        envelope.timestamp += 3600.0;

        assert_eq!(envelope.age_at(OffsetDateTime::now_utc()), Duration::ZERO);
    }

    #[test]
    fn unrepresentably_old_timestamp_is_stale() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = CacheManager::new(dir.path());
        let key = SessionKey::new("ancient");
        let mut envelope = CacheEnvelope::new(key.clone(), vec![ResultPayload::new("A01")]);
        envelope.timestamp = -1.0e20;
        cache.write_envelope(&envelope).expect("write envelope");

        assert_eq!(
            cache.lookup(&key),
            CacheLookup::Stale { age: Duration::MAX }
        );
        assert_eq!(cache.load(&key), (None, false));
    }

    #[test]
    fn non_finite_timestamp_is_never_fresh() {
        let mut envelope = CacheEnvelope::new(SessionKey::new("k"), Vec::new());
        envelope.timestamp = f64::NAN;
        assert_eq!(envelope.age_at(OffsetDateTime::now_utc()), Duration::MAX);

        envelope.timestamp = f64::NEG_INFINITY;
        assert_eq!(envelope.age_at(OffsetDateTime::now_utc()), Duration::MAX);
    }

    #[test]
    fn structurally_invalid_json_is_not_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = CacheManager::new(dir.path());
        let key = SessionKey::new("broken");
        std::fs::write(cache.path_for(&key), br#"{"results": 7}"#).expect("write file");

        assert!(matches!(cache.lookup(&key), CacheLookup::Invalid(_)));
        assert_eq!(cache.load(&key), (None, false));
    }

    #[test]
    fn missing_file_and_missing_directory_are_misses() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = CacheManager::new(dir.path().join("not-created-yet"));
        let key = SessionKey::new("fresh");

        assert_eq!(cache.lookup(&key), CacheLookup::Missing);
        cache.invalidate(&key).expect("invalidating nothing succeeds");
    }

    #[test]
    fn save_creates_the_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = CacheManager::new(dir.path().join("nested").join("cache"));
        let envelope = CacheEnvelope::new(SessionKey::new("k"), vec![ResultPayload::new("A01")]);

        cache.write_envelope(&envelope).expect("write envelope");
        assert!(cache.lookup(&SessionKey::new("k")).is_hit());
    }
}
