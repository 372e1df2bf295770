//! Artifact collection: primed trees into named archives in the output
//! directory.
//!
//! Archives are written to a temporary file next to their final path and
//! renamed into place, so a reader polling the output directory never sees a
//! partial file. Within one collector the first successful writer of a name
//! wins; later interchangeable jobs receive the existing artifact.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use multipack_core::{BuildJob, JobId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{CollectionError, CollectionResult};
use crate::lifecycle::{EnvironmentSession, PrimedTree};

/// A finished artifact and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedArtifact {
    pub path: PathBuf,
    pub file_name: String,
    /// Hex-encoded SHA-256 of the archive.
    pub sha256: String,
    /// The job whose lifecycle run produced the contents.
    pub produced_by: JobId,
    /// Set when an interchangeable job had already written this name.
    pub reused: bool,
}

pub struct ArtifactCollector {
    output_dir: PathBuf,
    written: Mutex<HashMap<String, CollectedArtifact>>,
}

impl ArtifactCollector {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn already_written(&self, file_name: &str) -> Option<CollectedArtifact> {
        lock(&self.written).get(file_name).map(|artifact| CollectedArtifact {
            reused: true,
            ..artifact.clone()
        })
    }

    /// Commit `tmp` as `file_name` unless another job got there first.
    /// The lock covers only the name check and the rename.
    fn commit(
        &self,
        tmp: NamedTempFile,
        sha256: String,
        file_name: &str,
        produced_by: JobId,
    ) -> CollectionResult<CollectedArtifact> {
        let mut written = lock(&self.written);
        if let Some(existing) = written.get(file_name) {
            debug!(file = %file_name, "artifact already written by an interchangeable job");
            return Ok(CollectedArtifact {
                reused: true,
                ..existing.clone()
            });
        }
        let path = self.output_dir.join(file_name);
        tmp.persist(&path).map_err(|e| e.error)?;
        let artifact = CollectedArtifact {
            path,
            file_name: file_name.to_string(),
            sha256,
            produced_by,
            reused: false,
        };
        written.insert(file_name.to_string(), artifact.clone());
        Ok(artifact)
    }

    /// Pull `tree` out of the environment and archive it as `file_name`.
    pub async fn collect(
        &self,
        session: &EnvironmentSession<'_>,
        tree: &PrimedTree,
        job: &BuildJob,
        file_name: &str,
    ) -> CollectionResult<CollectedArtifact> {
        validate_name(file_name)?;
        if let Some(existing) = self.already_written(file_name) {
            return Ok(existing);
        }

        let scratch = tempfile::tempdir()?;
        let primed = scratch.path().join("prime");
        session.pull(&tree.remote_path, &primed).await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_dir = self.output_dir.clone();
        let (tmp, sha256) = tokio::task::spawn_blocking(move || -> CollectionResult<_> {
            let mut tmp = NamedTempFile::new_in(&output_dir)?;
            let files = write_zip(&primed, tmp.as_file_mut())?;
            debug!(files = files, "archived primed tree");
            let sha256 = sha256_file(tmp.path())?;
            Ok((tmp, sha256))
        })
        .await
        .map_err(|e| CollectionError::Task(e.to_string()))??;

        let artifact = self.commit(tmp, sha256, file_name, job.id())?;
        if !artifact.reused {
            info!(job = %job.id(), artifact = %artifact.path.display(), sha256 = %artifact.sha256, "artifact written");
        }
        Ok(artifact)
    }

    /// Copy an existing artifact under another name.
    pub async fn duplicate(
        &self,
        source: &CollectedArtifact,
        file_name: &str,
    ) -> CollectionResult<CollectedArtifact> {
        validate_name(file_name)?;
        if file_name == source.file_name {
            return Ok(CollectedArtifact {
                reused: true,
                ..source.clone()
            });
        }
        if let Some(existing) = self.already_written(file_name) {
            return Ok(existing);
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_dir = self.output_dir.clone();
        let src = source.path.clone();
        let (tmp, sha256) = tokio::task::spawn_blocking(move || -> CollectionResult<_> {
            let mut tmp = NamedTempFile::new_in(&output_dir)?;
            let mut input = File::open(&src)?;
            io::copy(&mut input, tmp.as_file_mut())?;
            tmp.as_file_mut().flush()?;
            let sha256 = sha256_file(tmp.path())?;
            Ok((tmp, sha256))
        })
        .await
        .map_err(|e| CollectionError::Task(e.to_string()))??;

        self.commit(tmp, sha256, file_name, source.produced_by.clone())
    }
}

fn validate_name(file_name: &str) -> CollectionResult<()> {
    let valid = !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CollectionError::InvalidName(file_name.to_string()))
    }
}

/// Zip `root` into `out` with stable entry order and timestamps.
/// Returns the number of files archived.
fn write_zip(root: &Path, out: &mut File) -> CollectionResult<u64> {
    let mut zip = ZipWriter::new(out);
    let base_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut files = 0;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let options = with_permissions(base_options, &entry.metadata()?);

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.path().is_file() {
            zip.start_file(name, options)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
            files += 1;
        }
    }
    zip.finish()?;
    Ok(files)
}

#[cfg(unix)]
fn with_permissions(options: SimpleFileOptions, metadata: &fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn with_permissions(options: SimpleFileOptions, _metadata: &fs::Metadata) -> SimpleFileOptions {
    options
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EnvironmentBackend, HostBackend};
    use multipack_core::{Architecture, Base, BuildPlatform, TargetPlatform};

    fn job(label: &str, arch: Architecture) -> BuildJob {
        let base = Base::new("ubuntu", "24.04");
        BuildJob {
            platform_label: label.to_string(),
            build_on: BuildPlatform::new(base.clone(), arch),
            build_for: TargetPlatform::all(base),
            sequence_index: 0,
            cross_compile: false,
        }
    }

    async fn primed_env(
        state: &Path,
        arch: Architecture,
    ) -> (HostBackend, crate::backend::EnvironmentHandle) {
        let backend = HostBackend::new(state);
        let handle = backend.create(&job("x", arch).build_on).await.unwrap();
        let dir = backend.environment_dir(&handle.name).join("prime/x-0/bin");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tool"), "#!/bin/sh\necho hi\n").unwrap();
        (backend, handle)
    }

    fn tree() -> PrimedTree {
        PrimedTree {
            remote_path: "prime/x-0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_collect_writes_zip_atomically() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);
        let collector = ArtifactCollector::new(out.path());

        let artifact = collector
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap();
        assert!(!artifact.reused);
        assert_eq!(artifact.path, out.path().join("demo_x.zip"));
        assert_eq!(artifact.sha256.len(), 64);

        // only the final file remains in the output directory
        let entries: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let mut archive = zip::ZipArchive::new(File::open(&artifact.path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("bin/tool")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.contains("echo hi"));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);
        let collector = ArtifactCollector::new(out.path());

        let first = collector
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap();
        let second = collector
            .collect(&session, &tree(), &job("x", Architecture::Arm64), "demo_x.zip")
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.produced_by, first.produced_by);
        assert_eq!(second.sha256, first.sha256);
    }

    #[tokio::test]
    async fn test_replaces_file_from_earlier_run() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(out.path().join("demo_x.zip"), "stale").unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);

        let artifact = ArtifactCollector::new(out.path())
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap();
        assert!(!artifact.reused);
        assert_ne!(fs::read(&artifact.path).unwrap(), b"stale");
    }

    #[tokio::test]
    async fn test_duplicate_copies_under_new_name() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);
        let collector = ArtifactCollector::new(out.path());

        let original = collector
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap();
        let copy = collector.duplicate(&original, "demo_y.zip").await.unwrap();
        assert_eq!(copy.file_name, "demo_y.zip");
        assert_eq!(copy.sha256, original.sha256);
        assert_eq!(copy.produced_by, original.produced_by);
        assert!(!copy.reused);
        assert!(out.path().join("demo_y.zip").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_collects_commit_one_digest() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);
        let collector = ArtifactCollector::new(out.path());
        let jobs: Vec<BuildJob> = [Architecture::Amd64, Architecture::Arm64, Architecture::Riscv64]
            .into_iter()
            .map(|arch| job("x", arch))
            .collect();

        let tree = tree();
        let results = futures::future::join_all(
            jobs.iter()
                .map(|j| collector.collect(&session, &tree, j, "demo_x.zip")),
        )
        .await;
        let artifacts: Vec<_> = results.into_iter().map(Result::unwrap).collect();

        assert_eq!(artifacts.iter().filter(|a| !a.reused).count(), 1);
        let on_disk = sha256_file(&out.path().join("demo_x.zip")).unwrap();
        assert!(artifacts.iter().all(|a| a.sha256 == on_disk));
        let entries: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_digest_matches_file_on_disk() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (backend, handle) = primed_env(state.path(), Architecture::Amd64).await;
        let session = EnvironmentSession::new(&backend, &handle);
        let collector = ArtifactCollector::new(out.path());

        let original = collector
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap();
        let copy = collector.duplicate(&original, "demo_y.zip").await.unwrap();
        assert_eq!(copy.sha256, sha256_file(&copy.path).unwrap());
        assert_eq!(original.sha256, sha256_file(&original.path).unwrap());
    }

    #[tokio::test]
    async fn test_missing_prime_dir_is_collection_error() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backend = HostBackend::new(state.path());
        let handle = backend
            .create(&job("x", Architecture::Amd64).build_on)
            .await
            .unwrap();
        let session = EnvironmentSession::new(&backend, &handle);

        let err = ArtifactCollector::new(out.path())
            .collect(&session, &tree(), &job("x", Architecture::Amd64), "demo_x.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Backend(_)));
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(validate_name("demo_x.zip").is_ok());
        assert!(validate_name("../escape.zip").is_err());
        assert!(validate_name("").is_err());
    }
}
