use crate::models::{TradingError, TradingResult};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Write a durable file atomically: write to a sibling temp file, fsync,
/// rename over the target. Readers never observe a half-written file.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> TradingResult<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| TradingError::DataError(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| TradingError::DataError(format!("create {}: {}", parent.display(), e)))?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .map_err(|e| TradingError::DataError(format!("create {}: {}", tmp.display(), e)))?;
        file.write_all(bytes)
            .map_err(|e| TradingError::DataError(format!("write {}: {}", tmp.display(), e)))?;
        file.sync_all()
            .map_err(|e| TradingError::DataError(format!("fsync {}: {}", tmp.display(), e)))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| TradingError::DataError(format!("rename into {}: {}", path.display(), e)))?;
    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(
    path: impl AsRef<Path>,
    value: &T,
) -> TradingResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| TradingError::DataError(format!("serialize {}: {}", path.as_ref().display(), e)))?;
    atomic_write(path, &bytes)
}

/// Load a JSON file if it exists; `None` when absent.
pub fn load_json<T: serde::de::DeserializeOwned>(
    path: impl AsRef<Path>,
) -> TradingResult<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)
        .map_err(|e| TradingError::DataError(format!("read {}: {}", path.display(), e)))?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| TradingError::DataError(format!("parse {}: {}", path.display(), e)))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("positions.json");

        atomic_write_json(&path, &vec![1u32, 2, 3]).unwrap();
        let loaded: Option<Vec<u32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        // No temp file left behind after rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let loaded: Option<Vec<u32>> = load_json(dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }
}
