//! Dependency Image Builder: builds and caches a read-only filesystem image
//! containing a manifest's resolved third-party libraries.
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Platform/ABI the dependency resolver is pinned to. Must match the guest
/// rootfs's interpreter.
pub const TARGET_PLATFORM: &str = "manylinux2014_x86_64";
pub const PYTHON_VERSION: &str = "3.11";
pub const PYTHON_ABI: &str = "cp311";

#[derive(Debug, thiserror::Error)]
pub enum DibError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dependency resolution failed (exit code {code:?})")]
    DependencyResolution { code: Option<i32> },
    #[error("image build failed: {0}")]
    ImageBuild(String),
}

/// Content-addressed cache + scratch-build pipeline for dependency images.
#[derive(Debug, Clone)]
pub struct DependencyImageBuilder {
    cache_dir: PathBuf,
    build_dir: PathBuf,
    drive_size_mb: u64,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DependencyImageBuilder {
    pub fn new(cache_dir: impl Into<PathBuf>, build_dir: impl Into<PathBuf>, drive_size_mb: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            build_dir: build_dir.into(),
            drive_size_mb,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Stable content digest of a manifest. 128-bit BLAKE3 prefix, hex
    /// encoded, collision-resistant enough for a cache key, not meant to
    /// resist an adversarial manifest author.
    pub fn manifest_hash(manifest_bytes: &[u8]) -> String {
        let full = blake3::hash(manifest_bytes);
        hex::encode(&full.as_bytes()[..16])
    }

    fn image_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.img"))
    }

    /// Build (or reuse) the dependency image for `manifest_bytes`, streaming
    /// resolver output line-by-line into `log_sink`. Returns `Ok(None)` for
    /// an empty manifest; callers must skip attaching a deps drive.
    pub async fn build(
        &self,
        manifest_bytes: &[u8],
        mut log_sink: impl FnMut(&str) + Send,
    ) -> Result<Option<PathBuf>, DibError> {
        if manifest_bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let hash = Self::manifest_hash(manifest_bytes);
        let image_path = self.image_path(&hash);

        if tokio::fs::try_exists(&image_path).await? {
            log_sink(&format!("Found cached dependencies for hash: {hash}"));
            return Ok(Some(image_path));
        }

        let lock = self
            .locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another build may have completed while we waited.
        if tokio::fs::try_exists(&image_path).await? {
            log_sink(&format!("Found cached dependencies for hash: {hash}"));
            return Ok(Some(image_path));
        }

        log_sink(&format!("Building new dependency drive for hash: {hash}"));
        let result = self.build_uncached(manifest_bytes, &hash, &mut log_sink).await;
        self.locks.remove(&hash);
        result.map(Some)
    }

    async fn build_uncached(
        &self,
        manifest_bytes: &[u8],
        hash: &str,
        log_sink: &mut impl FnMut(&str),
    ) -> Result<PathBuf, DibError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let build_path = self.build_dir.join(hash);
        if tokio::fs::try_exists(&build_path).await? {
            tokio::fs::remove_dir_all(&build_path).await?;
        }
        tokio::fs::create_dir_all(&build_path).await?;

        let req_file_path = build_path.join("requirements.txt");
        tokio::fs::write(&req_file_path, manifest_bytes).await?;

        if let Err(e) = self.run_resolver(&req_file_path, &build_path, log_sink).await {
            let _ = tokio::fs::remove_dir_all(&build_path).await;
            return Err(e);
        }

        log_sink("Creating disk image container...");
        let final_path = self.image_path(hash);
        let tmp_path = self.cache_dir.join(format!(".tmp-{hash}"));
        match self.format_image(&build_path, &tmp_path, log_sink).await {
            Ok(()) => {
                tokio::fs::rename(&tmp_path, &final_path).await?;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                let _ = tokio::fs::remove_dir_all(&build_path).await;
                return Err(e);
            }
        }

        let _ = tokio::fs::remove_dir_all(&build_path).await;
        log_sink(&format!("Dependency drive ready: {hash}.img"));
        Ok(final_path)
    }

    async fn run_resolver(
        &self,
        req_file_path: &Path,
        build_path: &Path,
        log_sink: &mut impl FnMut(&str),
    ) -> Result<(), DibError> {
        log_sink("Starting pip install...");

        // Merge stderr into stdout so progress and error lines interleave in
        // the order the resolver emitted them.
        let mut child = Command::new("pip")
            .arg("install")
            .arg("-r")
            .arg(req_file_path)
            .arg("--target")
            .arg(build_path)
            .arg("--no-cache-dir")
            .arg("--only-binary=:all:")
            .arg("--platform")
            .arg(TARGET_PLATFORM)
            .arg("--python-version")
            .arg(PYTHON_VERSION)
            .arg("--implementation")
            .arg("cp")
            .arg("--abi")
            .arg(PYTHON_ABI)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stdout_done = false;
        let mut stderr_done = false;
        while !stdout_done || !stderr_done {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line? {
                    Some(line) => log_sink(line.trim_end()),
                    None => stdout_done = true,
                },
                line = stderr_lines.next_line(), if !stderr_done => match line? {
                    Some(line) => log_sink(line.trim_end()),
                    None => stderr_done = true,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(DibError::DependencyResolution { code: status.code() });
        }
        Ok(())
    }

    async fn format_image(
        &self,
        build_path: &Path,
        image_path: &Path,
        log_sink: &mut impl FnMut(&str),
    ) -> Result<(), DibError> {
        let size_bytes = self.drive_size_mb * 1024 * 1024;
        {
            let file = tokio::fs::File::create(image_path).await?;
            file.set_len(size_bytes).await?;
        }

        log_sink("Formatting as ext4 (populating files)...");
        let output = Command::new("mkfs.ext4")
            .arg("-d")
            .arg(build_path)
            .arg("-F")
            .arg(image_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DibError::ImageBuild(format!("mkfs.ext4 failed: {stderr}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_hash_is_stable() {
        let a = DependencyImageBuilder::manifest_hash(b"rich==13.0\n");
        let b = DependencyImageBuilder::manifest_hash(b"rich==13.0\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn manifest_hash_differs_for_different_input() {
        let a = DependencyImageBuilder::manifest_hash(b"rich==13.0\n");
        let b = DependencyImageBuilder::manifest_hash(b"numpy==1.26\n");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_manifest_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let builder = DependencyImageBuilder::new(dir.path().join("cache"), dir.path().join("build"), 8);
        let result = builder.build(b"   \n", |_| {}).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn second_build_is_a_cache_hit_without_invoking_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(&cache_dir).await.unwrap();

        let hash = DependencyImageBuilder::manifest_hash(b"rich==13.0\n");
        tokio::fs::write(cache_dir.join(format!("{hash}.img")), b"fake image").await.unwrap();

        let builder = DependencyImageBuilder::new(cache_dir, dir.path().join("build"), 8);
        let mut lines = Vec::new();
        let result = builder
            .build(b"rich==13.0\n", |line| lines.push(line.to_string()))
            .await
            .unwrap();

        assert!(result.is_some());
        assert!(lines.iter().any(|l| l.contains("Found cached dependencies")));
    }
}
