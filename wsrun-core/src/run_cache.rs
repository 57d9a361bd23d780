//! Content-hash cache deciding which targets need to run.
//!
//! A target's hash covers its own source fingerprint, its command line and
//! the final hashes of its dependencies, so any change upstream invalidates
//! everything downstream. Hashes are persisted only for targets that exited
//! successfully.

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use blake3::Hasher;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::MANIFEST_FILE;
use crate::error::{Error, Result};
use crate::state::StateArena;
use crate::target::{Target, TargetCommand, TargetGraph, TargetId};

const RUN_CACHE_VERSION: u32 = 1;

/// Directories that never contribute to a package fingerprint.
const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Supplies the hash of a target's own inputs.
///
/// Fingerprinting reads the file system, so the supervisor only calls it on
/// the blocking pool.
pub trait SourceFingerprint: Send + Sync {
    fn fingerprint(&self, target: &Target) -> Result<String>;
}

/// Runs `fingerprint` for one target on the blocking pool.
pub async fn fingerprint_blocking(
    fingerprint: Arc<dyn SourceFingerprint>,
    target: Target,
) -> Result<String> {
    tokio::task::spawn_blocking(move || fingerprint.fingerprint(&target))
        .await
        .map_err(|e| Error::Cache(format!("fingerprint task failed: {}", e)))?
}

/// One entry of a target's `outputs`.
#[derive(Debug)]
enum OutputPattern {
    /// A file or directory relative to the package directory.
    Path(PathBuf),
    /// `*.ext`: any entry whose name ends with the suffix.
    Suffix(String),
}

impl OutputPattern {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('*') {
            Some(suffix) => OutputPattern::Suffix(suffix.to_string()),
            None => OutputPattern::Path(
                Path::new(raw)
                    .components()
                    .filter(|c| !matches!(c, Component::CurDir))
                    .collect(),
            ),
        }
    }

    fn matches(&self, relative: &Path, name: &OsStr) -> bool {
        match self {
            OutputPattern::Path(path) => !path.as_os_str().is_empty() && relative.starts_with(path),
            OutputPattern::Suffix(suffix) => name
                .to_str()
                .map(|name| name.ends_with(suffix.as_str()))
                .unwrap_or(false),
        }
    }
}

/// Fingerprints every regular file under the target's working directory.
///
/// Nested packages (subdirectories with their own manifest), the target's
/// declared outputs and any directory passed to [`exclude`](Self::exclude)
/// are left out.
pub struct DirectoryFingerprint {
    excluded: Vec<PathBuf>,
}

impl DirectoryFingerprint {
    pub fn new() -> Self {
        Self {
            excluded: Vec::new(),
        }
    }

    /// Excludes an additional directory, typically the cache directory.
    pub fn exclude(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.excluded
            .push(dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()));
        self
    }

    fn is_excluded(&self, root: &Path, outputs: &[OutputPattern], entry: &walkdir::DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if outputs
            .iter()
            .any(|output| output.matches(relative, entry.file_name()))
        {
            return true;
        }
        if !entry.file_type().is_dir() {
            return false;
        }
        if entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
        {
            return true;
        }
        if entry.path().join(MANIFEST_FILE).is_file() {
            return true;
        }
        if self.excluded.is_empty() {
            return false;
        }
        let path = entry
            .path()
            .canonicalize()
            .unwrap_or_else(|_| entry.path().to_path_buf());
        self.excluded.iter().any(|ex| path.starts_with(ex))
    }
}

impl Default for DirectoryFingerprint {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceFingerprint for DirectoryFingerprint {
    fn fingerprint(&self, target: &Target) -> Result<String> {
        let root = target.cwd.as_path();
        if !root.is_dir() {
            return Err(Error::Cache(format!(
                "package directory of {} does not exist: {}",
                target.name,
                root.display()
            )));
        }
        let outputs: Vec<OutputPattern> = target
            .outputs
            .iter()
            .map(|raw| OutputPattern::parse(raw))
            .collect();

        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_excluded(root, &outputs, e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let file_hashes: Vec<(PathBuf, blake3::Hash)> = files
            .into_par_iter()
            .map(|path| -> Result<(PathBuf, blake3::Hash)> {
                let content = fs::read(&path)?;
                let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                Ok((relative, blake3::hash(&content)))
            })
            .collect::<Result<_>>()?;

        let mut hasher = Hasher::new();
        for (relative, hash) in &file_hashes {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            hasher.update(hash.as_bytes());
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Persistent storage for the last-known-good hash of each target.
pub trait HashStore: Send {
    fn load(&self) -> Result<FxHashMap<String, String>>;
    fn save(&mut self, hashes: &FxHashMap<String, String>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RunCacheFile {
    version: u32,
    hashes: FxHashMap<String, String>,
}

/// The per-user cache directory, or a temp directory when the platform has
/// none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("wsrun"))
        .unwrap_or_else(|| std::env::temp_dir().join("wsrun-cache"))
}

/// Stores hashes in a versioned bincode file, one per packages directory and
/// command.
pub struct FileHashStore {
    path: PathBuf,
}

impl FileHashStore {
    pub fn new(cache_dir: impl AsRef<Path>, packages_dir: &Path, command_name: &str) -> Self {
        let packages_dir = packages_dir
            .canonicalize()
            .unwrap_or_else(|_| packages_dir.to_path_buf());
        let key = xxh3_64(packages_dir.as_os_str().as_encoded_bytes());
        let filename = format!("runs_{:x}_{}.bin", key, sanitize(command_name));
        Self {
            path: cache_dir.as_ref().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl HashStore for FileHashStore {
    fn load(&self) -> Result<FxHashMap<String, String>> {
        if !self.path.exists() {
            return Ok(FxHashMap::default());
        }

        let content = fs::read(&self.path)?;
        let file: RunCacheFile = bincode::deserialize(&content)
            .map_err(|e| Error::Cache(format!("Failed to parse run cache: {}", e)))?;

        if file.version != RUN_CACHE_VERSION {
            debug!(
                found = file.version,
                expected = RUN_CACHE_VERSION,
                "run cache version mismatch; starting empty"
            );
            return Ok(FxHashMap::default());
        }

        Ok(file.hashes)
    }

    fn save(&mut self, hashes: &FxHashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = RunCacheFile {
            version: RUN_CACHE_VERSION,
            hashes: hashes.clone(),
        };
        let content = bincode::serialize(&file)
            .map_err(|e| Error::Cache(format!("Failed to serialize run cache: {}", e)))?;

        // Readers only ever see a complete file.
        let tmp = self.path.with_extension("bin.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Stores hashes in memory. Clones share the same table, which lets tests
/// observe what a run committed.
#[derive(Clone, Default)]
pub struct MemoryHashStore {
    hashes: Arc<Mutex<FxHashMap<String, String>>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.hashes.lock().ok()?.get(name).cloned()
    }
}

impl HashStore for MemoryHashStore {
    fn load(&self) -> Result<FxHashMap<String, String>> {
        self.hashes
            .lock()
            .map(|h| h.clone())
            .map_err(|e| Error::Cache(format!("hash store lock poisoned: {}", e)))
    }

    fn save(&mut self, hashes: &FxHashMap<String, String>) -> Result<()> {
        let mut guard = self
            .hashes
            .lock()
            .map_err(|e| Error::Cache(format!("hash store lock poisoned: {}", e)))?;
        *guard = hashes.clone();
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Decides whether targets need to run and records successful runs.
pub struct RunCache {
    store: Box<dyn HashStore>,
    fingerprint: Arc<dyn SourceFingerprint>,
    hashes: FxHashMap<String, String>,
    ignore_cache: bool,
    persist: bool,
    stats: CacheStats,
}

impl RunCache {
    /// Loads prior hashes from `store`. An unreadable store is treated as
    /// empty so a corrupt cache only costs a full rebuild.
    pub fn open(
        store: Box<dyn HashStore>,
        fingerprint: Arc<dyn SourceFingerprint>,
        ignore_cache: bool,
    ) -> Self {
        let hashes = match store.load() {
            Ok(hashes) => hashes,
            Err(err) => {
                warn!(error = %err, "could not read run cache; treating it as empty");
                FxHashMap::default()
            }
        };

        Self {
            store,
            fingerprint,
            hashes,
            ignore_cache,
            persist: true,
            stats: CacheStats::default(),
        }
    }

    /// Keeps commits in memory only. Used for dry runs.
    pub fn in_memory_only(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn fingerprinter(&self) -> Arc<dyn SourceFingerprint> {
        Arc::clone(&self.fingerprint)
    }

    /// Fingerprints every target of `graph` in parallel on the blocking
    /// pool. One result per target, indexed by id.
    pub async fn fingerprint_all(&self, graph: &TargetGraph) -> Result<Vec<Result<String>>> {
        let fingerprint = self.fingerprinter();
        let targets = graph.targets().to_vec();
        tokio::task::spawn_blocking(move || {
            targets
                .par_iter()
                .map(|target| fingerprint.fingerprint(target))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Cache(format!("fingerprint task failed: {}", e)))
    }

    /// Computes the content hash of `id` from its own `source` fingerprint
    /// and the final hashes of its dependencies.
    ///
    /// # Errors
    ///
    /// Fails if a dependency's hash is not final yet.
    pub fn compute_hash(
        &self,
        graph: &TargetGraph,
        arena: &StateArena,
        id: TargetId,
        source: &str,
    ) -> Result<String> {
        let target = graph.get(id);
        let mut hasher = Hasher::new();

        hasher.update(graph.command_name().as_bytes());
        hasher.update(&[0]);
        if let TargetCommand::Script(command) = &target.command {
            hasher.update(command.as_bytes());
        }
        hasher.update(&[0]);
        hasher.update(source.as_bytes());

        let mut deps: Vec<(&str, &str)> = Vec::with_capacity(target.deps.len());
        for &dep in &target.deps {
            let dep_target = graph.get(dep);
            let record = arena.get(dep);
            let hash = match (&record.hash, record.state.is_satisfied()) {
                (Some(hash), true) => hash.as_str(),
                _ => {
                    return Err(Error::Cache(format!(
                        "hash of {} requested before dependency {} finished",
                        target.name, dep_target.name
                    )))
                }
            };
            deps.push((dep_target.name.as_str(), hash));
        }
        deps.sort_unstable();

        for (name, hash) in deps {
            hasher.update(&[0]);
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(hash.as_bytes());
        }

        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Whether the target must run given its freshly computed hash.
    pub fn should_run(&mut self, name: &str, hash: &str) -> bool {
        let run = self.ignore_cache || self.hashes.get(name).map(String::as_str) != Some(hash);
        if run {
            self.stats.misses += 1;
        } else {
            self.stats.hits += 1;
        }
        debug!(target = name, run, ignore_cache = self.ignore_cache, "cache decision");
        run
    }

    /// Records a successful run. Callers must only commit after a zero exit
    /// code.
    pub fn commit(&mut self, name: &str, hash: &str) -> Result<()> {
        self.hashes.insert(name.to_string(), hash.to_string());
        if self.persist {
            self.store.save(&self.hashes)?;
        }
        Ok(())
    }
}
