use crate::config::StorageConfig;
use crate::models::{TradingError, TradingResult};
use crate::utils::persistence::atomic_write;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Per-cycle artifact directories, per-agent memory files, and the
/// archive/compaction policy.
///
/// Layout under the storage base path:
/// ```text
/// cycles/<YYYYMMDD_HHMMSS>/{plan.md, research.md, analysis.md, strategy.json, evaluation.md}
/// cycles/history/<id>.zip
/// memory/<agent>/memory.md
/// ```
pub struct ArtifactManager {
    cycles_dir: PathBuf,
    memory_dir: PathBuf,
    retention: usize,
}

impl ArtifactManager {
    pub fn new(storage: &StorageConfig) -> TradingResult<Self> {
        let base = PathBuf::from(&storage.base_path);
        let cycles_dir = base.join(&storage.cycles_path);
        let memory_dir = base.join(&storage.memory_path);
        for dir in [&cycles_dir, &memory_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| TradingError::DataError(format!("create {}: {}", dir.display(), e)))?;
        }
        Ok(Self {
            cycles_dir,
            memory_dir,
            retention: storage.archive_retention_count.max(1),
        })
    }

    pub fn cycle_dir(&self, cycle_id: &str) -> PathBuf {
        self.cycles_dir.join(cycle_id)
    }

    pub fn ensure_cycle_dir(&self, cycle_id: &str) -> TradingResult<PathBuf> {
        let dir = self.cycle_dir(cycle_id);
        fs::create_dir_all(&dir)
            .map_err(|e| TradingError::DataError(format!("create {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    pub fn write_artifact(
        &self,
        cycle_id: &str,
        name: &str,
        content: &str,
    ) -> TradingResult<PathBuf> {
        let dir = self.ensure_cycle_dir(cycle_id)?;
        let path = dir.join(name);
        atomic_write(&path, content.as_bytes())?;
        debug!("🗂️ Wrote artifact {}", path.display());
        Ok(path)
    }

    pub fn read_artifact(&self, cycle_id: &str, name: &str) -> Option<String> {
        fs::read_to_string(self.cycle_dir(cycle_id).join(name)).ok()
    }

    /// Cycle ids sorted ascending (their names sort chronologically).
    /// The history subtree is not a cycle.
    pub fn list_cycles(&self) -> Vec<String> {
        let mut ids: Vec<String> = fs::read_dir(&self.cycles_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|name| name != "history")
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// The most recent cycle whose strategy.json exists.
    pub fn latest_completed_cycle(&self) -> Option<String> {
        self.list_cycles()
            .into_iter()
            .rev()
            .find(|id| self.cycle_dir(id).join("strategy.json").exists())
    }

    // ---- memory ----------------------------------------------------------

    fn memory_path(&self, agent: &str) -> PathBuf {
        self.memory_dir.join(agent).join("memory.md")
    }

    /// Append one entry to the agent's memory file, `---`-separated.
    pub fn append_memory(&self, agent: &str, entry: &str) -> TradingResult<()> {
        let path = self.memory_path(agent);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TradingError::DataError(format!("create {}: {}", parent.display(), e)))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TradingError::DataError(format!("open {}: {}", path.display(), e)))?;
        writeln!(file, "{}\n\n---\n", entry.trim_end())
            .map_err(|e| TradingError::DataError(format!("append {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn read_memory(&self, agent: &str) -> String {
        fs::read_to_string(self.memory_path(agent)).unwrap_or_default()
    }

    // ---- archive / compaction -------------------------------------------

    /// Keep the N most recent cycle directories; zip older ones into the
    /// history subtree and delete the originals.
    pub fn archive_old_cycles(&self) -> TradingResult<usize> {
        let ids = self.list_cycles();
        if ids.len() <= self.retention {
            return Ok(0);
        }
        let history = self.cycles_dir.join("history");
        fs::create_dir_all(&history)
            .map_err(|e| TradingError::DataError(format!("create {}: {}", history.display(), e)))?;

        let excess = ids.len() - self.retention;
        let mut archived = 0;
        for id in ids.into_iter().take(excess) {
            let dir = self.cycle_dir(&id);
            let zip_path = history.join(format!("{}.zip", id));
            match self.zip_directory(&dir, &zip_path) {
                Ok(()) => {
                    fs::remove_dir_all(&dir).map_err(|e| {
                        TradingError::DataError(format!("remove {}: {}", dir.display(), e))
                    })?;
                    info!("📦 Archived cycle {} -> {}", id, zip_path.display());
                    archived += 1;
                }
                Err(e) => warn!("Failed to archive cycle {}: {}", id, e),
            }
        }
        Ok(archived)
    }

    fn zip_directory(&self, dir: &PathBuf, zip_path: &PathBuf) -> TradingResult<()> {
        let file = File::create(zip_path)
            .map_err(|e| TradingError::DataError(format!("create {}: {}", zip_path.display(), e)))?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let entries = fs::read_dir(dir)
            .map_err(|e| TradingError::DataError(format!("read {}: {}", dir.display(), e)))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            zip.start_file(name, options)
                .map_err(|e| TradingError::DataError(format!("zip entry: {}", e)))?;
            let mut contents = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut contents))
                .map_err(|e| TradingError::DataError(format!("read {}: {}", path.display(), e)))?;
            zip.write_all(&contents)
                .map_err(|e| TradingError::DataError(format!("zip write: {}", e)))?;
        }
        zip.finish()
            .map_err(|e| TradingError::DataError(format!("zip finish: {}", e)))?;
        Ok(())
    }
}
