// src/store/fs.rs
//
// Filesystem object store. Writes go to a temp file in the final
// directory, are fsynced, then renamed into place; readers can never see
// a half-written artifact. The directory entry is synced after rename.

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PipelineError, PipelineResult};
use crate::store::{ObjectMeta, ObjectStore};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| PipelineError::storage(format!("create {}: {e}", root.display())))?;
        Ok(FsObjectStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PipelineResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(PipelineError::storage(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> PipelineResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(PipelineError::storage(format!(
                    "read_dir {}: {e}",
                    dir.display()
                )))
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::storage(e.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                if key.ends_with(".tmp") {
                    continue;
                }
                let size = entry
                    .metadata()
                    .map_err(|e| PipelineError::storage(e.to_string()))?
                    .len();
                out.push(ObjectMeta { key, size });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()> {
        let path = self.resolve(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| PipelineError::storage(format!("key {key:?} has no parent dir")))?;
        fs::create_dir_all(dir)
            .map_err(|e| PipelineError::storage(format!("create {}: {e}", dir.display())))?;

        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("object");
        let tmp = dir.join(format!(".{file_name}.{}.{n}.tmp", std::process::id()));
        let res = write_and_sync(&tmp, bytes).and_then(|_| {
            fs::rename(&tmp, &path)
                .map_err(|e| PipelineError::storage(format!("rename into {key}: {e}")))
        });
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
            return res;
        }
        sync_dir(dir)
    }

    async fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::storage(format!("read {key}: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        Ok(self.resolve(key)?.exists())
    }

    async fn list(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<ObjectMeta>> {
        let mut all = Vec::new();
        let root = self.root.clone();
        self.walk(&root, &mut all)?;
        all.retain(|m| m.key.starts_with(prefix));
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all.truncate(limit);
        Ok(all)
    }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let mut file = File::create(path)
        .map_err(|e| PipelineError::storage(format!("create {}: {e}", path.display())))?;
    file.write_all(bytes)
        .map_err(|e| PipelineError::storage(format!("write {}: {e}", path.display())))?;
    file.sync_all()
        .map_err(|e| PipelineError::storage(format!("sync {}: {e}", path.display())))
}

fn sync_dir(dir: &Path) -> PipelineResult<()> {
    let f = File::open(dir)
        .map_err(|e| PipelineError::storage(format!("open {}: {e}", dir.display())))?;
    f.sync_all()
        .map_err(|e| PipelineError::storage(format!("sync dir {}: {e}", dir.display())))
}
