//! Content-addressed per-run artifact storage.
//!
//! Each step execution produces one payload file
//! (`<tool>_<seq>.json`, gzipped past 10 KiB) and one metadata sidecar
//! (`<tool>_<seq>_metadata.json`) under `ARTIFACTS/<runId>/`. Artifacts are
//! never overwritten; replaying a step allocates a fresh sequence number.

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Payloads above this size are gzipped.
const COMPRESSION_THRESHOLD: usize = 10 * 1024;

/// Sidecar metadata describing one stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub run_id: String,
    pub tool_name: String,
    pub sequence: u32,
    /// Unix timestamp, fractional seconds.
    pub timestamp: f64,
    /// MD5 hex digest of the canonical-JSON input.
    pub input_hash: String,
    /// Byte size of the serialized payload before compression.
    pub output_size: usize,
    /// Tool execution time in seconds.
    pub execution_time: f64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<Value>,
    #[serde(default)]
    pub compressed: bool,
}

/// One entry from [`ArtifactStore::list_run`].
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    pub metadata: Option<ArtifactMetadata>,
    pub size: u64,
}

/// Storage totals from [`ArtifactStore::stats`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    pub total_size_bytes: u64,
    pub total_files: usize,
    pub run_count: usize,
}

/// The artifact tree rooted at a configured directory.
pub struct ArtifactStore {
    root: PathBuf,
    /// Monotonic sequence per run id, so concurrent plans never interleave.
    sequences: Mutex<HashMap<String, u32>>,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create artifact root {}", root.display()))?;
        // Canonical root so stored artifact paths come back absolute.
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve artifact root {}", root.display()))?;
        Ok(Self {
            root,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh run id: `run_<unixSeconds>_<8hex>`.
    pub fn generate_run_id() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        format!("run_{secs}_{suffix}")
    }

    /// Store one step's input and output; returns the payload path.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        run_id: &str,
        tool_name: &str,
        input: &Value,
        output: &Value,
        duration: Duration,
        status: &str,
        error_info: Option<Value>,
    ) -> Result<PathBuf> {
        let run_dir = self.root.join(run_id);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

        let sequence = {
            let mut sequences = self.sequences.lock().expect("sequence lock poisoned");
            let counter = sequences.entry(run_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let artifact_id = format!("{tool_name}_{sequence:03}");

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut payload = json!({
            "input": input,
            "output": output,
            "timestamp": now,
            "execution_time": duration.as_secs_f64(),
            "status": status,
        });
        if let Some(ref error) = error_info {
            payload["error"] = error.clone();
        }

        let bytes = serde_json::to_vec_pretty(&payload)?;
        let compressed = bytes.len() > COMPRESSION_THRESHOLD;

        let artifact_path = if compressed {
            let path = run_dir.join(format!("{artifact_id}.json.gz"));
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?;
            path
        } else {
            let path = run_dir.join(format!("{artifact_id}.json"));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            path
        };

        let metadata = ArtifactMetadata {
            run_id: run_id.to_string(),
            tool_name: tool_name.to_string(),
            sequence,
            timestamp: now,
            input_hash: hash_input(input),
            output_size: bytes.len(),
            execution_time: duration.as_secs_f64(),
            status: status.to_string(),
            error_info,
            compressed,
        };
        let metadata_path = run_dir.join(format!("{artifact_id}_metadata.json"));
        std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
            .with_context(|| format!("Failed to write {}", metadata_path.display()))?;

        tracing::debug!(artifact = %artifact_id, run = %run_id, compressed, "artifact stored");
        Ok(artifact_path)
    }

    /// Load a payload, transparently handling the `.gz` suffix.
    pub fn get(&self, path: &Path) -> Result<Value> {
        let is_gz = path.extension().is_some_and(|ext| ext == "gz");
        let value = if is_gz {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut decoder = GzDecoder::new(file);
            let mut content = String::new();
            decoder.read_to_string(&mut content)?;
            serde_json::from_str(&content)?
        } else {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)?
        };
        Ok(value)
    }

    /// Metadata sidecar for a payload path, if present.
    pub fn metadata_for(&self, path: &Path) -> Result<Option<ArtifactMetadata>> {
        let Some(id) = artifact_id_of(path) else {
            return Ok(None);
        };
        let sidecar = path
            .parent()
            .map(|dir| dir.join(format!("{id}_metadata.json")))
            .filter(|p| p.exists());
        match sidecar {
            Some(p) => {
                let content = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read {}", p.display()))?;
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }

    /// Payload entries for a run (sidecars excluded), ordered by sequence.
    pub fn list_run(&self, run_id: &str) -> Result<Vec<ArtifactEntry>> {
        let run_dir = self.root.join(run_id);
        if !run_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&run_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with("_metadata.json") {
                continue;
            }
            if !(name.ends_with(".json") || name.ends_with(".json.gz")) {
                continue;
            }
            let size = std::fs::metadata(&path)?.len();
            let metadata = self.metadata_for(&path)?;
            entries.push(ArtifactEntry {
                path,
                metadata,
                size,
            });
        }
        entries.sort_by_key(|e| e.metadata.as_ref().map(|m| m.sequence).unwrap_or(0));
        Ok(entries)
    }

    /// Remove run directories whose oldest file predates the cutoff.
    /// Returns the number of runs removed.
    pub fn cleanup(&self, older_than_days: u64) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(older_than_days * 24 * 60 * 60);
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root)? {
            let run_dir = entry?.path();
            if !run_dir.is_dir() {
                continue;
            }
            let oldest = std::fs::read_dir(&run_dir)?
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter_map(|m| m.modified().ok())
                .min();
            if let Some(oldest) = oldest
                && oldest < cutoff
            {
                std::fs::remove_dir_all(&run_dir)
                    .with_context(|| format!("Failed to remove {}", run_dir.display()))?;
                removed += 1;
                tracing::info!(run = %run_dir.display(), "removed expired artifact run");
            }
        }
        Ok(removed)
    }

    /// Totals across the artifact tree.
    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        for entry in std::fs::read_dir(&self.root).into_iter().flatten().flatten() {
            if entry.path().is_dir() {
                stats.run_count += 1;
            }
        }
        for entry in WalkDir::new(&self.root).into_iter().flatten() {
            if entry.file_type().is_file() {
                stats.total_files += 1;
                stats.total_size_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        stats
    }
}

/// MD5 hex digest of the canonical (sorted-key) JSON form of `input`.
pub fn hash_input(input: &Value) -> String {
    let canonical = serde_json::to_string(input).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Strip `.json` / `.json.gz` to recover the artifact id.
fn artifact_id_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".json.gz")
        .or_else(|| name.strip_suffix(".json"))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (ArtifactStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(&dir.path().join("ARTIFACTS")).unwrap();
        (store, dir)
    }

    #[test]
    fn store_writes_payload_and_sidecar() {
        let (store, _dir) = setup();
        let path = store
            .store(
                "run_1_abcdef01",
                "list_files",
                &json!({"path": "."}),
                &json!(["a.txt", "b.txt"]),
                Duration::from_millis(120),
                "success",
                None,
            )
            .unwrap();

        assert!(path.ends_with("run_1_abcdef01/list_files_001.json"));
        assert!(path.exists());
        let sidecar = path.parent().unwrap().join("list_files_001_metadata.json");
        assert!(sidecar.exists());

        let metadata = store.metadata_for(&path).unwrap().unwrap();
        assert_eq!(metadata.sequence, 1);
        assert_eq!(metadata.tool_name, "list_files");
        assert!(!metadata.compressed);
        assert_eq!(metadata.input_hash, hash_input(&json!({"path": "."})));
    }

    #[test]
    fn large_payloads_are_gzipped_and_read_back() {
        let (store, _dir) = setup();
        let big = "x".repeat(COMPRESSION_THRESHOLD * 2);
        let path = store
            .store(
                "run_1_abcdef01",
                "read_file",
                &json!({"path": "big.txt"}),
                &json!(big),
                Duration::from_secs(1),
                "success",
                None,
            )
            .unwrap();

        assert!(path.to_string_lossy().ends_with(".json.gz"));
        let metadata = store.metadata_for(&path).unwrap().unwrap();
        assert!(metadata.compressed);

        let payload = store.get(&path).unwrap();
        assert_eq!(payload["output"].as_str().unwrap().len(), big.len());
        assert_eq!(payload["status"], "success");
    }

    #[test]
    fn sequences_are_per_run_and_monotonic() {
        let (store, _dir) = setup();
        let input = json!({});
        let output = json!(null);
        let p1 = store
            .store("run_a", "read_file", &input, &output, Duration::ZERO, "success", None)
            .unwrap();
        let p2 = store
            .store("run_a", "read_file", &input, &output, Duration::ZERO, "success", None)
            .unwrap();
        let p3 = store
            .store("run_b", "read_file", &input, &output, Duration::ZERO, "success", None)
            .unwrap();

        assert!(p1.ends_with("run_a/read_file_001.json"));
        assert!(p2.ends_with("run_a/read_file_002.json"));
        // A different run restarts at 001.
        assert!(p3.ends_with("run_b/read_file_001.json"));
    }

    #[test]
    fn list_run_orders_by_sequence_and_skips_sidecars() {
        let (store, _dir) = setup();
        for _ in 0..3 {
            store
                .store(
                    "run_x",
                    "find_in_files",
                    &json!({"pattern": "TODO"}),
                    &json!([]),
                    Duration::ZERO,
                    "success",
                    None,
                )
                .unwrap();
        }
        let entries = store.list_run("run_x").unwrap();
        assert_eq!(entries.len(), 3);
        let sequences: Vec<u32> = entries
            .iter()
            .map(|e| e.metadata.as_ref().unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn list_run_on_unknown_run_is_empty() {
        let (store, _dir) = setup();
        assert!(store.list_run("run_missing").unwrap().is_empty());
    }

    #[test]
    fn error_info_is_recorded_in_payload_and_metadata() {
        let (store, _dir) = setup();
        let error = json!({"message": "timed out", "code": "STEP_TIMEOUT"});
        let path = store
            .store(
                "run_e",
                "bash_execute",
                &json!({"command": "sleep 10"}),
                &json!(null),
                Duration::from_secs(1),
                "timeout",
                Some(error.clone()),
            )
            .unwrap();

        let payload = store.get(&path).unwrap();
        assert_eq!(payload["error"], error);
        let metadata = store.metadata_for(&path).unwrap().unwrap();
        assert_eq!(metadata.status, "timeout");
        assert_eq!(metadata.error_info, Some(error));
    }

    #[test]
    fn input_hash_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(hash_input(&a), hash_input(&b));
    }

    #[test]
    fn stats_count_runs_and_files() {
        let (store, _dir) = setup();
        store
            .store("run_1", "read_file", &json!({}), &json!(1), Duration::ZERO, "success", None)
            .unwrap();
        store
            .store("run_2", "read_file", &json!({}), &json!(2), Duration::ZERO, "success", None)
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.total_files, 4); // two payloads + two sidecars
        assert!(stats.total_size_bytes > 0);
    }

    #[test]
    fn cleanup_ignores_fresh_runs() {
        let (store, _dir) = setup();
        store
            .store("run_new", "read_file", &json!({}), &json!(1), Duration::ZERO, "success", None)
            .unwrap();
        let removed = store.cleanup(30).unwrap();
        assert_eq!(removed, 0);
        assert!(store.root().join("run_new").exists());
    }

    #[test]
    fn run_ids_follow_the_layout_contract() {
        let id = ArtifactStore::generate_run_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "run");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }
}
