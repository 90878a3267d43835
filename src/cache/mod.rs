//! Content-addressed artifact cache with TTL.
//!
//! Artifacts are keyed by a stable hash of `(phase, normalized inputs,
//! model fingerprint)` and stored as a blob plus a JSON metadata sidecar:
//!
//! ```text
//! <root>/<phase>-<key>.bin
//! <root>/<phase>-<key>.meta.json
//! ```
//!
//! Writes are atomic (write-to-temp + rename in the same directory). Cache
//! failures never fail the caller: reads degrade to a miss, writes report a
//! degraded outcome, and the caller surfaces both as log events. The cache
//! does not introspect content; deciding what is cacheable is the caller's
//! job.

use crate::phase::PhaseId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Stable content-addressed key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from the phase, the normalized inputs, and the model
    /// fingerprint. Identical normalized inputs always yield identical keys.
    pub fn derive(phase: PhaseId, inputs: &str, model_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(phase.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(normalize(inputs).as_bytes());
        hasher.update([0]);
        hasher.update(model_fingerprint.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Key for a pattern-library entry: a read-through keyed by the task
    /// kind and pattern id.
    pub fn pattern(task_kind: &str, pattern_id: &str) -> Self {
        Self::derive(PhaseId::System, &format!("pattern\n{task_kind}\n{pattern_id}"), "patterns-v1")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Collapse runs of whitespace and trim, so formatting differences do not
/// change the key.
fn normalize(inputs: &str) -> String {
    inputs.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Metadata sidecar persisted next to each blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub phase: PhaseId,
    pub key: CacheKey,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub token_count: u64,
    pub source_provider: String,
    pub source_model: String,
}

impl ArtifactMeta {
    /// Whether this artifact is expired at the given instant.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 >= self.ttl_secs
    }
}

/// An opaque cached blob with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(
        phase: PhaseId,
        key: CacheKey,
        data: Vec<u8>,
        ttl: Duration,
        token_count: u64,
        source_provider: &str,
        source_model: &str,
    ) -> Self {
        Self {
            meta: ArtifactMeta {
                phase,
                key,
                created_at: Utc::now(),
                ttl_secs: ttl.as_secs(),
                token_count,
                source_provider: source_provider.to_string(),
                source_model: source_model.to_string(),
            },
            data,
        }
    }

    /// Blob interpreted as UTF-8 text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Outcome of a cache write. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    Degraded { reason: String },
}

/// Result of a sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// On-disk artifact cache.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    /// Open a cache rooted at the given directory, creating it if needed.
    /// A root that cannot be created produces a cache where every operation
    /// degrades gracefully.
    pub fn open(root: PathBuf) -> Self {
        if let Err(err) = fs::create_dir_all(&root) {
            warn!(root = %root.display(), error = %err, "Cache root could not be created");
        }
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, phase: PhaseId, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}-{}.bin", phase.as_str(), key.as_str()))
    }

    fn meta_path(&self, phase: PhaseId, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{}-{}.meta.json", phase.as_str(), key.as_str()))
    }

    /// Fetch an artifact. Expired entries and any I/O or decode failure
    /// read as a miss.
    pub fn get(&self, phase: PhaseId, key: &CacheKey) -> Option<Artifact> {
        let meta_bytes = match fs::read(self.meta_path(phase, key)) {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        let meta: ArtifactMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "Cache metadata unreadable, treating as miss");
                return None;
            }
        };
        if meta.expired_at(Utc::now()) {
            debug!(key = key.as_str(), "Cache entry expired");
            return None;
        }
        match fs::read(self.blob_path(phase, key)) {
            Ok(data) => Some(Artifact { meta, data }),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "Cache blob unreadable, treating as miss");
                None
            }
        }
    }

    /// Store an artifact atomically: blob first, then the metadata sidecar,
    /// each via write-to-temp + rename. A failure leaves no partial entry
    /// visible and degrades to a miss on the next `get`.
    pub fn put(&self, artifact: &Artifact) -> CacheWrite {
        let phase = artifact.meta.phase;
        let key = &artifact.meta.key;

        let meta_json = match serde_json::to_vec_pretty(&artifact.meta) {
            Ok(json) => json,
            Err(err) => {
                return CacheWrite::Degraded {
                    reason: format!("metadata encode failed: {err}"),
                };
            }
        };

        if let Err(err) = self.atomic_write(&self.blob_path(phase, key), &artifact.data) {
            return CacheWrite::Degraded {
                reason: format!("blob write failed: {err}"),
            };
        }
        if let Err(err) = self.atomic_write(&self.meta_path(phase, key), &meta_json) {
            return CacheWrite::Degraded {
                reason: format!("metadata write failed: {err}"),
            };
        }
        CacheWrite::Stored
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }

    /// Remove expired entries. Unreadable sidecars count as failures and
    /// are left in place.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return report,
        };
        let now = Utc::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(".meta.json") {
                continue;
            }
            let meta: ArtifactMeta = match fs::read(&path).ok().and_then(|b| serde_json::from_slice(&b).ok())
            {
                Some(meta) => meta,
                None => {
                    report.failed += 1;
                    continue;
                }
            };
            if meta.expired_at(now) {
                let blob = self.blob_path(meta.phase, &meta.key);
                let ok_blob = fs::remove_file(&blob).is_ok() || !blob.exists();
                let ok_meta = fs::remove_file(&path).is_ok();
                if ok_blob && ok_meta {
                    report.removed += 1;
                } else {
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Pattern-library read-through: fetch a previously learned pattern for
    /// a task kind. Never writes during a running task.
    pub fn get_pattern(&self, task_kind: &str, pattern_id: &str) -> Option<Artifact> {
        self.get(PhaseId::System, &CacheKey::pattern(task_kind, pattern_id))
    }
}
