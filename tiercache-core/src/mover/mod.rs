//! Atomic file mover.
//!
//! Every transfer writes to a sibling temp path on the destination
//! filesystem and renames into place, so the final path never holds a
//! partial file. A video and its subtitle siblings move as one group:
//! all copies land before any rename, and a failure before the last rename
//! unwinds the group.

pub mod siblings;

pub use siblings::find_siblings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};

use crate::disk::DiskUsage;
use crate::error::{Error, Result};
use crate::models::{CacheMethod, TransferOutcome};

/// Fraction of destination free space a transfer may consume.
const FREE_SPACE_HEADROOM: f64 = 0.95;

const PARTIAL_SUFFIX: &str = "tiercache-partial";

/// Direction of a transfer, used to pick the concurrency pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToCache,
    ToArray,
}

/// Crash-safe file transfers between the bulk array and the cache tier.
pub struct FileMover {
    array_root: PathBuf,
    cache_root: PathBuf,
    method: CacheMethod,
    to_cache_pool: Arc<Semaphore>,
    to_array_pool: Arc<Semaphore>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    disk: Arc<dyn DiskUsage>,
}

impl FileMover {
    pub fn new(
        array_root: PathBuf,
        cache_root: PathBuf,
        method: CacheMethod,
        max_concurrent_to_cache: usize,
        max_concurrent_to_array: usize,
        disk: Arc<dyn DiskUsage>,
    ) -> Self {
        Self {
            array_root,
            cache_root,
            method,
            to_cache_pool: Arc::new(Semaphore::new(max_concurrent_to_cache.max(1))),
            to_array_pool: Arc::new(Semaphore::new(max_concurrent_to_array.max(1))),
            path_locks: DashMap::new(),
            disk,
        }
    }

    #[must_use]
    pub fn method(&self) -> CacheMethod {
        self.method
    }

    /// Cache-tier path for a bulk-tier path.
    pub fn cache_path_for(&self, original: &Path) -> Result<PathBuf> {
        let rel = original.strip_prefix(&self.array_root).map_err(|_| {
            Error::Config(format!(
                "Path {} is not under array root {}",
                original.display(),
                self.array_root.display()
            ))
        })?;
        Ok(self.cache_root.join(rel))
    }

    /// Whether the file is materialized on the cache tier, by filesystem
    /// evidence alone (cache copy present, or original is a symlink into
    /// the cache root).
    pub fn is_cached_on_disk(&self, original: &Path) -> bool {
        if let Ok(cache_path) = self.cache_path_for(original) {
            if cache_path.exists() {
                return true;
            }
        }
        if let Ok(target) = std::fs::read_link(original) {
            return target.starts_with(&self.cache_root);
        }
        false
    }

    fn path_lock(&self, original: &Path) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(original.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn pool(&self, direction: Direction) -> &Arc<Semaphore> {
        match direction {
            Direction::ToCache => &self.to_cache_pool,
            Direction::ToArray => &self.to_array_pool,
        }
    }

    /// Copy one file to the cache tier.
    pub async fn copy_to_cache(&self, original: &Path) -> Result<TransferOutcome> {
        let outcomes = self.copy_group_to_cache(original, &[]).await?;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Interrupted("Empty transfer group".to_string()))
    }

    /// Copy a video and its sibling files to the cache tier as one group.
    ///
    /// All payloads are staged as temp files before the first rename; a
    /// failure before the last rename unwinds every file already renamed,
    /// leaving the sources untouched. Outcomes are returned in input order
    /// (video first). A group whose video is already on the cache tier is a
    /// no-op reporting zero bytes.
    pub async fn copy_group_to_cache(
        &self,
        original: &Path,
        group_siblings: &[PathBuf],
    ) -> Result<Vec<TransferOutcome>> {
        let _permit = self
            .pool(Direction::ToCache)
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Interrupted(e.to_string()))?;
        let lock = self.path_lock(original);
        let _guard = lock.lock().await;

        // Post-lock existence check: a concurrent transfer of the same path
        // may have completed while we waited.
        let dest = self.cache_path_for(original)?;
        if self.is_cached_on_disk(original) {
            tracing::debug!(path = %original.display(), "Already on cache tier, skipping transfer");
            return Ok(vec![TransferOutcome {
                dest_path: dest,
                bytes_transferred: 0,
            }]);
        }

        let mut plan: Vec<(PathBuf, PathBuf)> = vec![(original.to_path_buf(), dest)];
        for sibling in group_siblings {
            plan.push((sibling.clone(), self.cache_path_for(sibling)?));
        }

        let mut total_size: u64 = 0;
        for (source, _) in &plan {
            let meta = tokio::fs::metadata(source)
                .await
                .map_err(|_| Error::SourceMissing(source.clone()))?;
            total_size += meta.len();
        }

        let free = self.disk.free_bytes(&self.cache_root)?;
        if total_size as f64 > free as f64 * FREE_SPACE_HEADROOM {
            return Err(Error::InsufficientSpace {
                needed: total_size,
                available: free,
            });
        }

        let outcomes = self.transfer_group(&plan).await?;

        for (source, dest) in &plan {
            self.dispose_source(source, dest).await;
        }

        Ok(outcomes)
    }

    /// Stage every payload as a temp file, then rename all into place.
    async fn transfer_group(&self, plan: &[(PathBuf, PathBuf)]) -> Result<Vec<TransferOutcome>> {
        let mut staged: Vec<(PathBuf, PathBuf, u64)> = Vec::with_capacity(plan.len());

        for (source, dest) in plan {
            let tmp = partial_path(dest);
            if let Some(parent) = dest.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    cleanup_temps(&staged).await;
                    return Err(e.into());
                }
            }
            match tokio::fs::copy(source, &tmp).await {
                Ok(bytes) => staged.push((tmp, dest.clone(), bytes)),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    cleanup_temps(&staged).await;
                    return if e.kind() == std::io::ErrorKind::NotFound {
                        Err(Error::SourceMissing(source.clone()))
                    } else {
                        Err(e.into())
                    };
                }
            }
        }

        let mut outcomes = Vec::with_capacity(staged.len());
        for (i, (tmp, dest, bytes)) in staged.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(tmp, dest).await {
                // Unwind: remove already-renamed files and remaining temps.
                for (_, done_dest, _) in &staged[..i] {
                    let _ = tokio::fs::remove_file(done_dest).await;
                }
                for (pending_tmp, _, _) in &staged[i..] {
                    let _ = tokio::fs::remove_file(pending_tmp).await;
                }
                return Err(e.into());
            }
            outcomes.push(TransferOutcome {
                dest_path: dest.clone(),
                bytes_transferred: *bytes,
            });
        }
        Ok(outcomes)
    }

    /// Apply the configured cache method to a source after its payload has
    /// been renamed into the destination. Failures here leave extra copies
    /// behind but never an inconsistent destination, so they only warn.
    async fn dispose_source(&self, source: &Path, dest: &Path) {
        match self.method {
            CacheMethod::Copy => {}
            CacheMethod::Move => {
                if let Err(e) = tokio::fs::remove_file(source).await {
                    tracing::warn!(path = %source.display(), error = %e, "Could not remove source after move");
                }
            }
            CacheMethod::MoveWithSymlink => {
                if let Err(e) = tokio::fs::remove_file(source).await {
                    tracing::warn!(path = %source.display(), error = %e, "Could not remove source after move");
                    return;
                }
                #[cfg(unix)]
                if let Err(e) = tokio::fs::symlink(dest, source).await {
                    tracing::warn!(
                        path = %source.display(),
                        target = %dest.display(),
                        error = %e,
                        "Could not create symlink back to cache"
                    );
                }
                #[cfg(not(unix))]
                tracing::warn!(path = %source.display(), "Symlinks unsupported on this platform; file was moved");
            }
        }
    }

    /// Restore one file to the bulk array, removing the cache copy.
    pub async fn restore_to_array(&self, original: &Path) -> Result<TransferOutcome> {
        let outcomes = self.restore_group_to_array(original, &[]).await?;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Interrupted("Empty restore group".to_string()))
    }

    /// Restore a video and its siblings to the bulk array.
    ///
    /// Re-materializes each file at its original path regardless of the
    /// cache method used to place it, then removes whatever is at the cache
    /// path. Returns `NotCached` when the video has no cache copy.
    pub async fn restore_group_to_array(
        &self,
        original: &Path,
        group_siblings: &[PathBuf],
    ) -> Result<Vec<TransferOutcome>> {
        let _permit = self
            .pool(Direction::ToArray)
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Interrupted(e.to_string()))?;
        let lock = self.path_lock(original);
        let _guard = lock.lock().await;

        let video_cache = self.cache_path_for(original)?;
        if tokio::fs::metadata(&video_cache).await.is_err() {
            return Err(Error::NotCached(original.to_path_buf()));
        }

        let mut outcomes = Vec::with_capacity(1 + group_siblings.len());
        outcomes.push(self.restore_one(original, &video_cache).await?);
        for sibling in group_siblings {
            let sibling_cache = self.cache_path_for(sibling)?;
            match self.restore_one(sibling, &sibling_cache).await {
                Ok(outcome) => outcomes.push(outcome),
                // A sibling that never made it to the cache is not an error.
                Err(Error::NotCached(_)) => {}
                Err(e) => {
                    tracing::warn!(path = %sibling.display(), error = %e, "Could not restore sibling");
                }
            }
        }
        Ok(outcomes)
    }

    async fn restore_one(&self, original: &Path, cache_path: &Path) -> Result<TransferOutcome> {
        let cache_meta = match tokio::fs::metadata(cache_path).await {
            Ok(meta) => meta,
            Err(_) => return Err(Error::NotCached(original.to_path_buf())),
        };
        let size = cache_meta.len();

        // Drop any symlink left at the original path by move-with-symlink.
        if let Ok(link_meta) = tokio::fs::symlink_metadata(original).await {
            if link_meta.file_type().is_symlink() {
                tokio::fs::remove_file(original).await?;
            } else if link_meta.is_file() {
                // Copy mode: the array copy is already in place.
                tokio::fs::remove_file(cache_path).await?;
                return Ok(TransferOutcome {
                    dest_path: original.to_path_buf(),
                    bytes_transferred: 0,
                });
            }
        }

        let free = self.disk.free_bytes(&self.array_root)?;
        if size as f64 > free as f64 * FREE_SPACE_HEADROOM {
            return Err(Error::InsufficientSpace {
                needed: size,
                available: free,
            });
        }

        if let Some(parent) = original.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = partial_path(original);
        if let Err(e) = tokio::fs::copy(cache_path, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, original).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::remove_file(cache_path).await {
            tracing::warn!(path = %cache_path.display(), error = %e, "Could not remove cache copy after restore");
        }

        Ok(TransferOutcome {
            dest_path: original.to_path_buf(),
            bytes_transferred: size,
        })
    }

    /// Remove a file's cache copy. Idempotent: succeeds when already absent.
    /// Returns the bytes freed.
    pub async fn delete_from_cache(&self, original: &Path) -> Result<u64> {
        let lock = self.path_lock(original);
        let _guard = lock.lock().await;

        let cache_path = self.cache_path_for(original)?;
        match tokio::fs::metadata(&cache_path).await {
            Ok(meta) => {
                let size = meta.len();
                tokio::fs::remove_file(&cache_path).await?;
                if let Ok(target) = tokio::fs::read_link(original).await {
                    if target == cache_path {
                        tracing::warn!(
                            path = %original.display(),
                            "Cache copy deleted while original is a symlink to it"
                        );
                    }
                }
                Ok(size)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for FileMover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMover")
            .field("array_root", &self.array_root)
            .field("cache_root", &self.cache_root)
            .field("method", &self.method)
            .finish()
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());
    dest.with_file_name(format!(".{name}.{PARTIAL_SUFFIX}"))
}

async fn cleanup_temps(staged: &[(PathBuf, PathBuf, u64)]) {
    for (tmp, _, _) in staged {
        let _ = tokio::fs::remove_file(tmp).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedDisk;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        array: PathBuf,
        cache: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let array = dir.path().join("bulk");
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(array.join("shows/X")).expect("mkdir");
        std::fs::create_dir_all(&cache).expect("mkdir");
        Fixture {
            _dir: dir,
            array,
            cache,
        }
    }

    fn mover(fx: &Fixture, method: CacheMethod) -> FileMover {
        FileMover::new(
            fx.array.clone(),
            fx.cache.clone(),
            method,
            2,
            2,
            Arc::new(FixedDisk {
                total: u64::MAX,
                free: u64::MAX,
            }),
        )
    }

    fn seed(fx: &Fixture, rel: &str, content: &[u8]) -> PathBuf {
        let path = fx.array.join(rel);
        std::fs::write(&path, content).expect("seed");
        path
    }

    #[tokio::test]
    async fn copy_mode_keeps_both_copies() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"video-bytes");

        let outcome = mover.copy_to_cache(&video).await.expect("copy");
        assert_eq!(outcome.bytes_transferred, 11);
        assert_eq!(outcome.dest_path, fx.cache.join("shows/X/S1E5.mkv"));
        assert!(video.exists());
        assert_eq!(
            std::fs::read(&outcome.dest_path).expect("read"),
            b"video-bytes"
        );
    }

    #[tokio::test]
    async fn move_mode_removes_source() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Move);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"abc");

        mover.copy_to_cache(&video).await.expect("copy");
        assert!(!video.exists());
        assert!(fx.cache.join("shows/X/S1E5.mkv").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn move_with_symlink_leaves_link_at_original() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::MoveWithSymlink);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"abc");

        let outcome = mover.copy_to_cache(&video).await.expect("copy");
        let link = std::fs::read_link(&video).expect("symlink");
        assert_eq!(link, outcome.dest_path);
        assert!(mover.is_cached_on_disk(&video));
    }

    #[tokio::test]
    async fn group_transfer_carries_siblings() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Move);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"video");
        let sub = seed(&fx, "shows/X/S1E5.en.srt", b"subs");

        let outcomes = mover
            .copy_group_to_cache(&video, std::slice::from_ref(&sub))
            .await
            .expect("group");
        assert_eq!(outcomes.len(), 2);
        assert!(fx.cache.join("shows/X/S1E5.mkv").exists());
        assert!(fx.cache.join("shows/X/S1E5.en.srt").exists());
    }

    #[tokio::test]
    async fn already_cached_transfer_is_noop() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"video");

        let first = mover.copy_to_cache(&video).await.expect("copy");
        assert_eq!(first.bytes_transferred, 5);
        let second = mover.copy_to_cache(&video).await.expect("noop");
        assert_eq!(second.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let err = mover
            .copy_to_cache(&fx.array.join("shows/X/missing.mkv"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::SourceMissing(_)));
    }

    #[tokio::test]
    async fn insufficient_space_refuses_before_writing() {
        let fx = fixture();
        let video = seed(&fx, "shows/X/S1E5.mkv", &[0u8; 1000]);
        let mover = FileMover::new(
            fx.array.clone(),
            fx.cache.clone(),
            CacheMethod::Copy,
            1,
            1,
            Arc::new(FixedDisk {
                total: 2000,
                free: 1000,
            }),
        );

        // 1000 bytes > 95% of 1000 free.
        let err = mover.copy_to_cache(&video).await.expect_err("must refuse");
        assert!(matches!(err, Error::InsufficientSpace { .. }));
        assert!(!fx.cache.join("shows/X/S1E5.mkv").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restore_rematerializes_and_drops_cache_copy() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::MoveWithSymlink);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"payload");

        mover.copy_to_cache(&video).await.expect("copy");
        assert!(std::fs::symlink_metadata(&video)
            .expect("meta")
            .file_type()
            .is_symlink());

        let outcome = mover.restore_to_array(&video).await.expect("restore");
        assert_eq!(outcome.bytes_transferred, 7);
        assert!(!fx.cache.join("shows/X/S1E5.mkv").exists());
        let meta = std::fs::symlink_metadata(&video).expect("meta");
        assert!(meta.file_type().is_file());
        assert_eq!(std::fs::read(&video).expect("read"), b"payload");
    }

    #[tokio::test]
    async fn restore_copy_mode_only_deletes_cache_copy() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"payload");

        mover.copy_to_cache(&video).await.expect("copy");
        let outcome = mover.restore_to_array(&video).await.expect("restore");
        assert_eq!(outcome.bytes_transferred, 0);
        assert!(video.exists());
        assert!(!fx.cache.join("shows/X/S1E5.mkv").exists());
    }

    #[tokio::test]
    async fn restore_without_cache_copy_errors() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Move);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"payload");

        let err = mover.restore_to_array(&video).await.expect_err("must fail");
        assert!(matches!(err, Error::NotCached(_)));
    }

    #[tokio::test]
    async fn delete_from_cache_is_idempotent() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let video = seed(&fx, "shows/X/S1E5.mkv", b"12345678");

        mover.copy_to_cache(&video).await.expect("copy");
        assert_eq!(mover.delete_from_cache(&video).await.expect("delete"), 8);
        assert_eq!(mover.delete_from_cache(&video).await.expect("again"), 0);
    }

    #[tokio::test]
    async fn no_partial_file_is_left_at_destination() {
        let fx = fixture();
        let mover = mover(&fx, CacheMethod::Copy);
        let video = seed(&fx, "shows/X/S1E5.mkv", &[7u8; 4096]);

        mover.copy_to_cache(&video).await.expect("copy");
        let dest_dir = fx.cache.join("shows/X");
        let leftovers: Vec<_> = std::fs::read_dir(&dest_dir)
            .expect("read_dir")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(
            std::fs::metadata(dest_dir.join("S1E5.mkv")).expect("meta").len(),
            4096
        );
    }
}
