//! HuggingFace hub cache scan.
//!
//! Enumerates `models--Org--Name` directories with a non-empty `snapshots/`
//! subdirectory (a completed download) so the dashboard can show which
//! models deploy without a cold download. Opportunistic: a missing cache
//! directory yields an empty list.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct CachedModel {
    pub name: String,
    pub cache_path: String,
    pub size_mb: f64,
    pub cached: bool,
}

/// Scan a hub cache directory for fully downloaded models.
pub fn scan(cache_dir: &str) -> Vec<CachedModel> {
    let dir = Path::new(cache_dir);
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(dir = %cache_dir, "HuggingFace cache directory not found");
        return Vec::new();
    };

    let mut cached = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(dir_name) = file_name.to_str() else {
            continue;
        };
        let Some(stripped) = dir_name.strip_prefix("models--") else {
            continue;
        };

        // models--Qwen--Qwen2.5-1.5B-Instruct → Qwen/Qwen2.5-1.5B-Instruct
        let name = stripped.split("--").collect::<Vec<_>>().join("/");
        if !name.contains('/') {
            continue;
        }

        // A snapshots directory with content marks a completed download.
        let snapshots = entry.path().join("snapshots");
        let has_snapshot = std::fs::read_dir(&snapshots)
            .map(|mut s| s.next().is_some())
            .unwrap_or(false);
        if !has_snapshot {
            continue;
        }

        match dir_size(&entry.path()) {
            Ok(size) => cached.push(CachedModel {
                name,
                cache_path: entry.path().display().to_string(),
                size_mb: (size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
                cached: true,
            }),
            Err(e) => warn!(model = %name, error = %e, "Failed to size cached model"),
        }
    }

    cached.sort_by(|a, b| a.name.cmp(&b.name));
    cached
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_missing_dir_is_empty() {
        assert!(scan("/no/such/cache/dir").is_empty());
    }

    #[test]
    fn test_scan_finds_completed_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        // Completed download: has a snapshot.
        let done = root.join("models--Qwen--Qwen2.5-1.5B-Instruct");
        std::fs::create_dir_all(done.join("snapshots").join("abc123")).unwrap();
        std::fs::write(done.join("snapshots/abc123/weights.bin"), vec![0u8; 2048]).unwrap();

        // In-progress download: no snapshots content.
        let partial = root.join("models--BAAI--bge-m3");
        std::fs::create_dir_all(partial.join("snapshots")).unwrap();

        // Unrelated directory.
        std::fs::create_dir_all(root.join("datasets--something")).unwrap();

        let cached = scan(root.to_str().unwrap());
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "Qwen/Qwen2.5-1.5B-Instruct");
        assert!(cached[0].cached);
        assert!(cached[0].size_mb > 0.0);
    }
}
