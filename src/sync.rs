// ABOUTME: File synchronization between the host and an environment over the runtime's exec verb
// ABOUTME: Transfers are base64-encoded through the shell; sync is per-file and non-transactional

use crate::environment::Environment;
use crate::manager::{EnvironmentManager, ManagerError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Local path '{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Raw bytes per upload command. Keeps each encoded payload well under the
/// kernel's argument-size limit; a multiple of 3 so chunk boundaries never
/// produce base64 padding mid-file.
const UPLOAD_CHUNK_BYTES: usize = 48 * 1024;

/// One file that could not be transferred. Sync continues past failures;
/// the report carries everything that went wrong.
#[derive(Debug, Clone)]
pub struct SyncFileError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub synced: Vec<PathBuf>,
    pub errors: Vec<SyncFileError>,
    pub bytes_transferred: u64,
    pub duration: Duration,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present locally, absent in the environment.
    Added,
    /// Present on both sides with different content.
    Modified,
    /// Present in the environment, absent locally.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: PathBuf,
    pub change: ChangeKind,
}

/// Copies files in and out of environments using only the runtime's exec
/// verb, so no volume mounts or runtime-specific copy commands are needed.
///
/// Content travels base64-encoded through the shell. Each file transfers
/// independently; a failure is recorded and the rest of the batch proceeds.
pub struct FileSynchronizer {
    manager: Arc<EnvironmentManager>,
    excludes: Vec<String>,
}

impl FileSynchronizer {
    pub fn new(manager: Arc<EnvironmentManager>, excludes: Vec<String>) -> Self {
        Self { manager, excludes }
    }

    /// Copy a local directory tree into an environment.
    pub async fn sync_to(
        &self,
        env: &Environment,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<SyncReport> {
        if !local_dir.is_dir() {
            return Err(SyncError::NotADirectory(local_dir.to_path_buf()));
        }

        let files = collect_files(local_dir, &self.excludes)?;
        info!(
            "Syncing {} files from {} into '{}':{}",
            files.len(),
            local_dir.display(),
            env.name,
            remote_dir
        );

        let start = Instant::now();
        let mut report = SyncReport::default();
        for rel in files {
            match self.push_file(env, local_dir, &rel, remote_dir).await {
                Ok(bytes) => {
                    report.bytes_transferred += bytes;
                    report.synced.push(rel);
                }
                Err(message) => {
                    warn!("Sync of '{}' failed: {}", rel.display(), message);
                    report.errors.push(SyncFileError { path: rel, message });
                }
            }
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    /// The files a [`FileSynchronizer::sync_to`] of this directory would
    /// transfer, without transferring anything.
    pub fn dry_run(&self, local_dir: &Path) -> Result<Vec<PathBuf>> {
        if !local_dir.is_dir() {
            return Err(SyncError::NotADirectory(local_dir.to_path_buf()));
        }
        collect_files(local_dir, &self.excludes)
    }

    async fn push_file(
        &self,
        env: &Environment,
        local_dir: &Path,
        rel: &Path,
        remote_dir: &str,
    ) -> std::result::Result<u64, String> {
        let full = local_dir.join(rel);
        let bytes = std::fs::read(&full).map_err(|e| e.to_string())?;

        let remote_path = join_remote(remote_dir, rel);
        let quoted_path = shell_quote(&remote_path);
        let quoted_parent = shell_quote(&remote_parent(&remote_path));

        if bytes.len() <= UPLOAD_CHUNK_BYTES {
            let command = format!(
                "mkdir -p {} && printf '%s' '{}' | base64 -d > {}",
                quoted_parent,
                BASE64.encode(&bytes),
                quoted_path
            );
            self.run_upload(env, rel, &command).await?;
        } else {
            // Large files go over in appended chunks so no single command
            // carries the whole payload in its argument list
            let command = format!("mkdir -p {} && : > {}", quoted_parent, quoted_path);
            self.run_upload(env, rel, &command).await?;
            for chunk in bytes.chunks(UPLOAD_CHUNK_BYTES) {
                let command = format!(
                    "printf '%s' '{}' | base64 -d >> {}",
                    BASE64.encode(chunk),
                    quoted_path
                );
                self.run_upload(env, rel, &command).await?;
            }
        }

        debug!("Synced '{}' -> '{}'", rel.display(), remote_path);
        Ok(bytes.len() as u64)
    }

    async fn run_upload(
        &self,
        env: &Environment,
        rel: &Path,
        command: &str,
    ) -> std::result::Result<(), String> {
        let output = self
            .manager
            .exec(&env.name, command)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            debug!("Upload command for '{}' failed", rel.display());
            Err(format!("exit {}: {}", output.exit_code, output.stderr.trim()))
        }
    }

    /// Copy a directory tree out of an environment onto the host.
    pub async fn sync_from(
        &self,
        env: &Environment,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<SyncReport> {
        let remote_files = self.list_remote_files(env, remote_dir).await?;
        info!(
            "Syncing {} files from '{}':{} into {}",
            remote_files.len(),
            env.name,
            remote_dir,
            local_dir.display()
        );

        let start = Instant::now();
        let mut report = SyncReport::default();
        for rel in remote_files {
            if is_excluded(&rel, &self.excludes) {
                continue;
            }
            match self.pull_file(env, remote_dir, &rel, local_dir).await {
                Ok(bytes) => {
                    report.bytes_transferred += bytes;
                    report.synced.push(rel);
                }
                Err(message) => {
                    warn!("Fetch of '{}' failed: {}", rel.display(), message);
                    report.errors.push(SyncFileError { path: rel, message });
                }
            }
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    async fn pull_file(
        &self,
        env: &Environment,
        remote_dir: &str,
        rel: &Path,
        local_dir: &Path,
    ) -> std::result::Result<u64, String> {
        let bytes = self.fetch_remote(env, &join_remote(remote_dir, rel)).await?;
        let local_path = local_dir.join(rel);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let len = bytes.len() as u64;
        std::fs::write(&local_path, bytes).map_err(|e| e.to_string())?;
        Ok(len)
    }

    async fn fetch_remote(
        &self,
        env: &Environment,
        remote_path: &str,
    ) -> std::result::Result<Vec<u8>, String> {
        let command = format!("base64 < {}", shell_quote(remote_path));
        let output = self
            .manager
            .exec(&env.name, &command)
            .await
            .map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!("exit {}: {}", output.exit_code, output.stderr.trim()));
        }
        let compact: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64.decode(compact.as_bytes()).map_err(|e| e.to_string())
    }

    async fn list_remote_files(
        &self,
        env: &Environment,
        remote_dir: &str,
    ) -> Result<Vec<PathBuf>> {
        let command = format!("find {} -type f", shell_quote(remote_dir));
        let output = self.manager.exec_checked(&env.name, &command).await?;
        let prefix = if remote_dir.ends_with('/') {
            remote_dir.to_string()
        } else {
            format!("{}/", remote_dir)
        };
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .filter(|rel| !rel.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Compare local and environment content file by file.
    ///
    /// Comparison is by full content, not timestamps: clocks inside
    /// environments are not trustworthy across restarts.
    pub async fn detect_changes(
        &self,
        env: &Environment,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<Vec<ChangedFile>> {
        if !local_dir.is_dir() {
            return Err(SyncError::NotADirectory(local_dir.to_path_buf()));
        }

        let mut local: BTreeMap<PathBuf, Vec<u8>> = BTreeMap::new();
        for rel in collect_files(local_dir, &self.excludes)? {
            let full = local_dir.join(&rel);
            let bytes = std::fs::read(&full).map_err(|source| SyncError::Io {
                path: full,
                source,
            })?;
            local.insert(rel, bytes);
        }

        let mut changes = Vec::new();
        let mut remote_seen = Vec::new();
        for rel in self.list_remote_files(env, remote_dir).await? {
            if is_excluded(&rel, &self.excludes) {
                continue;
            }
            remote_seen.push(rel.clone());
            match local.get(&rel) {
                None => changes.push(ChangedFile {
                    path: rel,
                    change: ChangeKind::Deleted,
                }),
                Some(local_bytes) => {
                    let remote_bytes = self
                        .fetch_remote(env, &join_remote(remote_dir, &rel))
                        .await
                        .unwrap_or_default();
                    if &remote_bytes != local_bytes {
                        changes.push(ChangedFile {
                            path: rel,
                            change: ChangeKind::Modified,
                        });
                    }
                }
            }
        }
        for rel in local.keys() {
            if !remote_seen.contains(rel) {
                changes.push(ChangedFile {
                    path: rel.clone(),
                    change: ChangeKind::Added,
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }
}

/// Single-quote a string for the shell, closing and reopening around
/// embedded quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn join_remote(remote_dir: &str, rel: &Path) -> String {
    let dir = remote_dir.trim_end_matches('/');
    format!("{}/{}", dir, rel.display())
}

fn remote_parent(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/".to_string(),
    }
}

/// A path is excluded when any component matches an exclude entry exactly,
/// or the file name matches a `*.suffix` pattern.
fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        for pattern in excludes {
            if let Some(suffix) = pattern.strip_prefix('*') {
                if name.ends_with(suffix) {
                    return true;
                }
            } else if name == pattern.as_str() {
                return true;
            }
        }
    }
    false
}

fn collect_files(root: &Path, excludes: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| SyncError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SyncError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if is_excluded(&rel, excludes) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(rel);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_sync_excludes, EngineConfig};
    use crate::executor::{CommandOutput, CommandRunner, ExecOptions};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Runner that executes the environment-side shell command locally, so
    /// sync logic can be exercised end to end against the real filesystem.
    struct LoopbackRunner;

    #[async_trait]
    impl CommandRunner for LoopbackRunner {
        async fn run(
            &self,
            argv: &[String],
            _opts: &ExecOptions,
        ) -> crate::executor::Result<CommandOutput> {
            // Expected shape: <bin> exec <env> sh -c <command>
            assert_eq!(argv[1], "exec");
            assert_eq!(argv[3], "sh");
            assert_eq!(argv[4], "-c");
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&argv[5])
                .output()
                .await
                .expect("loopback shell");
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                duration: Duration::from_millis(1),
            })
        }
    }

    fn synchronizer() -> FileSynchronizer {
        let manager = Arc::new(EnvironmentManager::new(
            &EngineConfig::default(),
            Arc::new(LoopbackRunner),
        ));
        FileSynchronizer::new(manager, default_sync_excludes())
    }

    fn env() -> Environment {
        Environment {
            name: "env-a".to_string(),
            ..Default::default()
        }
    }

    fn write(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_shell_quote_survives_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote("has space"), "'has space'");
    }

    #[test]
    fn test_exclude_matching() {
        let excludes = default_sync_excludes();
        assert!(is_excluded(Path::new(".git/config"), &excludes));
        assert!(is_excluded(Path::new("node_modules/left-pad/index.js"), &excludes));
        assert!(is_excluded(Path::new("certs/server.pem"), &excludes));
        assert!(!is_excluded(Path::new("src/main.rs"), &excludes));
        assert!(!is_excluded(Path::new("gitlog.txt"), &excludes));
    }

    #[test]
    fn test_collect_files_skips_excluded_trees() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", b"pub fn x() {}");
        write(dir.path(), ".git/HEAD", b"ref: refs/heads/main");
        write(dir.path(), "secret.key", b"nope");

        let files = collect_files(dir.path(), &default_sync_excludes()).unwrap();
        assert_eq!(files, vec![PathBuf::from("src/lib.rs")]);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_bytes() {
        let src = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let binary: Vec<u8> = (0u8..=255).collect();
        write(src.path(), "notes.txt", b"hello 'quoted' world\n");
        write(src.path(), "deep/nested/blob.bin", &binary);
        write(src.path(), "with space.txt", b"spaces are fine");

        let sync = synchronizer();
        let remote_root = remote.path().to_str().unwrap();

        let up = sync.sync_to(&env(), src.path(), remote_root).await.unwrap();
        assert!(up.is_complete());
        assert_eq!(up.synced.len(), 3);
        let expected_bytes = (b"hello 'quoted' world\n".len()
            + binary.len()
            + b"spaces are fine".len()) as u64;
        assert_eq!(up.bytes_transferred, expected_bytes);

        let down = sync.sync_from(&env(), remote_root, dst.path()).await.unwrap();
        assert!(down.is_complete());

        for rel in ["notes.txt", "deep/nested/blob.bin", "with space.txt"] {
            let original = std::fs::read(src.path().join(rel)).unwrap();
            let returned = std::fs::read(dst.path().join(rel)).unwrap();
            assert_eq!(original, returned, "content drift in {rel}");
        }
    }

    #[tokio::test]
    async fn test_large_file_uploads_in_chunks_intact() {
        let src = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();

        // Larger than two upload chunks, with a tail that is not
        // chunk-aligned
        let big: Vec<u8> = (0..UPLOAD_CHUNK_BYTES * 2 + 1234)
            .map(|i| (i % 251) as u8)
            .collect();
        write(src.path(), "big.bin", &big);

        let sync = synchronizer();
        let remote_root = remote.path().to_str().unwrap();
        let report = sync.sync_to(&env(), src.path(), remote_root).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.bytes_transferred, big.len() as u64);

        let landed = std::fs::read(remote.path().join("big.bin")).unwrap();
        assert_eq!(landed, big);
    }

    #[tokio::test]
    async fn test_sync_continues_past_per_file_failures() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "good.txt", b"fine");

        // Remote root on a path that cannot be created
        let sync = synchronizer();
        let report = sync
            .sync_to(&env(), src.path(), "/proc/definitely-not-writable")
            .await
            .unwrap();

        assert_eq!(report.synced.len(), 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, PathBuf::from("good.txt"));
    }

    #[tokio::test]
    async fn test_sync_to_rejects_missing_local_dir() {
        let sync = synchronizer();
        let err = sync
            .sync_to(&env(), Path::new("/nonexistent-dir-xyz"), "/tmp/out")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotADirectory(_)));
    }

    #[test]
    fn test_dry_run_lists_candidates_without_transferring() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"a");
        write(dir.path(), "sub/b.txt", b"b");
        write(dir.path(), "node_modules/c.js", b"c");

        let sync = synchronizer();
        let files = sync.dry_run(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")]);
    }

    #[tokio::test]
    async fn test_detect_changes_by_content() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();

        write(local.path(), "same.txt", b"unchanged");
        write(remote.path(), "same.txt", b"unchanged");
        write(local.path(), "edited.txt", b"new content");
        write(remote.path(), "edited.txt", b"old content");
        write(local.path(), "local-only.txt", b"fresh");
        write(remote.path(), "remote-only.txt", b"stale");

        let sync = synchronizer();
        let changes = sync
            .detect_changes(&env(), local.path(), remote.path().to_str().unwrap())
            .await
            .unwrap();

        let by_path: Vec<(String, ChangeKind)> = changes
            .iter()
            .map(|c| (c.path.display().to_string(), c.change))
            .collect();
        assert_eq!(
            by_path,
            vec![
                ("edited.txt".to_string(), ChangeKind::Modified),
                ("local-only.txt".to_string(), ChangeKind::Added),
                ("remote-only.txt".to_string(), ChangeKind::Deleted),
            ]
        );
    }
}
