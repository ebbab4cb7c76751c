//! File deployment helpers.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Retry transient file lock errors
//! - Timeout all operations
//! - Never fail silently (log with context)
//!
//! Deletion never escalates a file-in-use failure: affected paths go to the
//! pending-delete journal and are swept on a later run.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Entries that must exist in the source bundle and, post-copy, in the
/// install path for a deployment to count as complete.
pub const REQUIRED_BUNDLE_ENTRIES: &[&str] = &[
    "bin/shopserve-web",
    "bin/shopserve-tasks",
    "wwwroot",
    "App_Data",
];

#[derive(Debug, Clone, Default)]
pub struct DeployStats {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteStats {
    pub removed: usize,
    pub kept: usize,
    pub deferred: usize,
}

/// Verify the fixed set of required entries exists under `root`.
pub async fn verify_required_entries(root: &Path, what: &str) -> Result<()> {
    for entry in REQUIRED_BUNDLE_ENTRIES {
        let path = root.join(entry);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            anyhow::bail!("{} is missing required entry '{}'", what, entry);
        }
    }
    Ok(())
}

/// Recursively collect all regular files under `root`.
///
/// Returns absolute paths.
pub async fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    Ok(out)
}

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("used by another process")
        || msg.contains("in use")
        || msg.contains("access is denied")
        || msg.contains("permission denied")
        || msg.contains("resource busy")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("timed out")
        || msg.contains("timeout")
}

/// Copy one file with retries + timeout, returning `(bytes_written, sha256_hex)`.
///
/// Caller must create the parent directory.
pub async fn copy_file_with_retries(src: &Path, dst: &Path, label: &str) -> Result<(u64, String)> {
    let started = Instant::now();

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        let timeout_dur = match tokio::fs::metadata(src).await {
            Ok(m) => {
                // Dynamic timeout: base 60s + 1s per MiB, capped at 10 minutes.
                let mib = (m.len() / (1024 * 1024)).min(10_000);
                let secs = (60_u64).saturating_add(mib).min(600);
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(60),
        };

        let res = timeout(timeout_dur, copy_file_once_and_sha256(src, dst)).await;
        match res {
            Ok(Ok((n, sha))) => {
                debug!(
                    "[PHASE: installation] [STEP: files] copy ok (label={}, bytes={}, sha256={}, attempt={}, duration_ms={})",
                    label,
                    n,
                    sha,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok((n, sha));
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: installation] [STEP: files] copy failed (label={}, attempt={}, transient={}, src={:?}, dst={:?}, err={})",
                    label, attempt, transient, src, dst, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                let err = anyhow::anyhow!("copy timed out (timeout_ms={})", timeout_dur.as_millis());
                warn!(
                    "[PHASE: installation] [STEP: files] copy timeout (label={}, attempt={}, src={:?}, dst={:?})",
                    label, attempt, src, dst
                );
                last_err = Some(err);
            }
        }

        let backoff_ms = 200_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("copy failed")))
}

async fn copy_file_once_and_sha256(src: &Path, dst: &Path) -> Result<(u64, String)> {
    let mut src_f = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open src failed: {:?}", src))?;
    let mut dst_f = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create dst failed: {:?}", dst))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = src_f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst_f.write_all(&buf[..n]).await?;
        total = total.saturating_add(n as u64);
    }
    dst_f.flush().await?;

    // Best-effort permissions preservation.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = tokio::fs::metadata(src).await {
            let mode = meta.permissions().mode();
            let _ = tokio::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode)).await;
        }
    }

    let digest = hasher.finalize();
    let sha256 = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    Ok((total, sha256))
}

/// Copy the whole bundled application tree into the install path.
///
/// Overwrites existing files; re-running a deployment is expected to succeed.
pub async fn deploy_tree(src_root: &Path, dst_root: &Path) -> Result<DeployStats> {
    let started = Instant::now();
    let files = collect_files_recursive(src_root).await?;

    let mut stats = DeployStats::default();
    for src in &files {
        let rel = src
            .strip_prefix(src_root)
            .with_context(|| format!("file outside bundle root: {:?}", src))?;
        let dst = dst_root.join(rel);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all failed: {:?}", parent))?;
        }
        let label = rel.to_string_lossy().to_string();
        let (bytes, _sha) = copy_file_with_retries(src, &dst, &label).await?;
        stats.files += 1;
        stats.bytes = stats.bytes.saturating_add(bytes);
    }

    debug!(
        "[PHASE: installation] [STEP: files] deploy_tree done (files={}, bytes={}, duration_ms={})",
        stats.files,
        stats.bytes,
        started.elapsed().as_millis()
    );
    Ok(stats)
}

// ============================================================================
// Deletion with keep-list and deferred removal
// ============================================================================

/// Journal of paths that could not be deleted. Swept by later runs.
#[derive(Debug, Clone)]
pub struct PendingDeletes {
    path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingDeletesDoc {
    #[serde(default)]
    paths: Vec<String>,
}

impl PendingDeletes {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("read pending-delete journal: {:?}", self.path))
            }
        };
        let doc: PendingDeletesDoc =
            serde_json::from_slice(&bytes).context("corrupt pending-delete journal")?;
        Ok(doc.paths)
    }

    /// Record a path for removal on a later run.
    pub async fn defer(&self, path: &Path) -> Result<()> {
        let mut paths = self.list().await?;
        let entry = path.to_string_lossy().to_string();
        if !paths.contains(&entry) {
            paths.push(entry);
        }
        self.save(&paths).await
    }

    /// Retry everything in the journal; entries that still fail stay queued.
    pub async fn sweep(&self) -> Result<usize> {
        let paths = self.list().await?;
        if paths.is_empty() {
            return Ok(0);
        }

        let mut remaining = Vec::new();
        let mut removed = 0usize;
        for entry in paths {
            let p = PathBuf::from(&entry);
            let gone = if p.is_dir() {
                tokio::fs::remove_dir_all(&p).await.is_ok()
            } else {
                match tokio::fs::remove_file(&p).await {
                    Ok(()) => true,
                    Err(e) => e.kind() == std::io::ErrorKind::NotFound,
                }
            };
            if gone {
                removed += 1;
            } else {
                remaining.push(entry);
            }
        }
        self.save(&remaining).await?;
        Ok(removed)
    }

    async fn save(&self, paths: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let doc = PendingDeletesDoc {
            paths: paths.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("write pending-delete journal: {:?}", self.path))
    }
}

fn is_kept(rel: &Path, keep: &[PathBuf]) -> bool {
    keep.iter().any(|k| rel.starts_with(k))
}

/// Delete a deployed tree, preserving the keep-list (relative paths) and
/// journaling anything that cannot be removed right now.
pub async fn delete_tree_preserving(
    root: &Path,
    keep_rel: &[String],
    journal: &PendingDeletes,
) -> Result<DeleteStats> {
    let mut stats = DeleteStats::default();
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        return Ok(stats);
    }

    let keep: Vec<PathBuf> = keep_rel.iter().map(PathBuf::from).collect();

    if keep.is_empty() {
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {
                stats.removed += 1;
                return Ok(stats);
            }
            Err(e) => {
                warn!(
                    "[PHASE: installation] [STEP: delete] remove_dir_all failed, falling back to per-file removal (root={:?}, err={})",
                    root, e
                );
            }
        }
    }

    let files = collect_files_recursive(root).await?;
    for file in files {
        let rel = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
        if is_kept(&rel, &keep) {
            stats.kept += 1;
            continue;
        }
        match tokio::fs::remove_file(&file).await {
            Ok(()) => stats.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "[PHASE: installation] [STEP: delete] Could not remove {:?} ({}); deferring",
                    file, e
                );
                journal.defer(&file).await?;
                stats.deferred += 1;
            }
        }
    }

    // Prune now-empty directories bottom-up; directories holding kept or
    // deferred files simply stay.
    prune_empty_dirs(root).await;

    Ok(stats)
}

async fn prune_empty_dirs(root: &Path) {
    // Collect directories depth-first so children are removed before parents.
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(mut rd) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if ent.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                    stack.push(ent.path());
                }
            }
        }
        dirs.push(dir);
    }
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = tokio::fs::remove_dir(&dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    async fn make_bundle(root: &Path) {
        for entry in REQUIRED_BUNDLE_ENTRIES {
            let path = root.join(entry);
            if entry.contains('.') || entry.starts_with("bin/") {
                write_file(&path, "binary placeholder").await;
            } else {
                tokio::fs::create_dir_all(&path).await.unwrap();
            }
        }
        write_file(&root.join("wwwroot").join("index.html"), "<html/>").await;
    }

    #[tokio::test]
    async fn verify_required_entries_detects_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bundle");
        make_bundle(&root).await;
        assert!(verify_required_entries(&root, "Source bundle").await.is_ok());

        tokio::fs::remove_file(root.join("bin/shopserve-web"))
            .await
            .unwrap();
        let err = verify_required_entries(&root, "Source bundle")
            .await
            .expect_err("missing entry");
        assert!(err.to_string().contains("bin/shopserve-web"));
    }

    #[tokio::test]
    async fn deploy_tree_copies_everything_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("bundle");
        let dst = tmp.path().join("install");
        make_bundle(&src).await;

        let stats = deploy_tree(&src, &dst).await.expect("deploy");
        assert!(stats.files >= 3);
        assert!(dst.join("wwwroot/index.html").exists());

        // Re-deploy over existing files succeeds (idempotent re-run).
        write_file(&dst.join("wwwroot").join("index.html"), "stale").await;
        deploy_tree(&src, &dst).await.expect("re-deploy");
        let content = tokio::fs::read_to_string(dst.join("wwwroot/index.html"))
            .await
            .unwrap();
        assert_eq!(content, "<html/>");
    }

    #[tokio::test]
    async fn delete_preserves_keep_list() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("install");
        write_file(&root.join("bin/shopserve-web"), "bin").await;
        write_file(&root.join("App_Data/uploads/img.png"), "img").await;
        write_file(&root.join("App_Data/settings.txt"), "cfg").await;

        let journal = PendingDeletes::new(tmp.path().join("pending_deletes.json"));
        let stats = delete_tree_preserving(
            &root,
            &["App_Data/uploads".to_string()],
            &journal,
        )
        .await
        .expect("delete");

        assert_eq!(stats.kept, 1);
        assert!(root.join("App_Data/uploads/img.png").exists());
        assert!(!root.join("bin").exists(), "empty dirs pruned");
        assert!(!root.join("App_Data/settings.txt").exists());
    }

    #[tokio::test]
    async fn delete_without_keep_list_removes_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("install");
        write_file(&root.join("bin/shopserve-web"), "bin").await;

        let journal = PendingDeletes::new(tmp.path().join("pending_deletes.json"));
        delete_tree_preserving(&root, &[], &journal)
            .await
            .expect("delete");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn pending_deletes_journal_round_trip_and_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = PendingDeletes::new(tmp.path().join("pending_deletes.json"));

        let stuck = tmp.path().join("stuck.bin");
        write_file(&stuck, "x").await;
        journal.defer(&stuck).await.expect("defer");
        journal.defer(&stuck).await.expect("defer twice is fine");
        assert_eq!(journal.list().await.unwrap().len(), 1);

        let removed = journal.sweep().await.expect("sweep");
        assert_eq!(removed, 1);
        assert!(!stuck.exists());
        assert!(journal.list().await.unwrap().is_empty());
    }
}
