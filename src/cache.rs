//! Connection cache persistence. Writes are write-temp-then-rename so a
//! crash mid-write never leaves a half written cache.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedConnection {
    pub channel: String,
    pub pan_id: String,
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_addr: Option<String>,
}

pub struct ConnectionCache {
    path: PathBuf,
}

impl ConnectionCache {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        ConnectionCache { path: path.into() }
    }

    /// Loads the cache. Corruption (bad JSON, missing required fields) is
    /// treated as absence, never surfaced as an error.
    pub fn load(&self) -> Option<CachedConnection> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CachedConnection>(&contents) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("connection cache at {:?} is corrupt, ignoring: {}", self.path, e);
                None
            }
        }
    }

    /// Writes the cache atomically. Only called after a successful join.
    pub fn save(&self, cached: &CachedConnection) -> std::io::Result<()> {
        let json = serde_json::to_string(cached)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Deletes the cache file, e.g. after a confirmed `EVENT 24` auth
    /// failure. Absence is not an error.
    pub fn delete(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to delete connection cache {:?}: {}", self.path, e);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("wisun_cache_test_{}_{}", std::process::id(), name));
        p
    }

    #[test]
    fn round_trips_through_disk() {
        let path = temp_cache_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let cache = ConnectionCache::new(&path);

        assert!(cache.load().is_none());

        let cached = CachedConnection {
            channel: "21".into(),
            pan_id: "8888".into(),
            addr: "001D12345678ABCD".into(),
            ipv6_addr: Some("FE80:0000:0000:0000:021D:1234:5678:ABCD".into()),
        };
        cache.save(&cached).unwrap();
        assert_eq!(cache.load(), Some(cached));

        cache.delete();
        assert!(cache.load().is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_is_treated_as_absent() {
        let path = temp_cache_path("corrupt");
        std::fs::write(&path, b"{ not json").unwrap();
        let cache = ConnectionCache::new(&path);
        assert!(cache.load().is_none());
        let _ = std::fs::remove_file(&path);
    }
}
