//! Persistence of generated images into the output directory.
//!
//! Bytes are first written and synced to hidden temporary files, then
//! published by hard-linking them to their final names. `link` fails
//! instead of overwriting when the name exists, so concurrent writers
//! racing for the same name each end up with a distinct file and a
//! reader never sees a partially written image under a final name.
//!
//! A stem is claimed through its prompt sidecar (`{stem}.txt`) before the
//! image is linked, so an image and its prompt always share a stem even
//! when images of different formats collide on it.

use std::io;
use std::path::{Path, PathBuf};

use imagegen_core::naming::{image_extension, image_stem, slugify, timestamp_component};
use imagegen_core::request::GenerationRequest;
use imagegen_core::types::Timestamp;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::GenerationError;
use crate::resolver::Artifact;

/// Give up after this many taken names for one stem.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// An image written to the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedImage {
    pub path: PathBuf,
    pub file_name: String,
    /// Public URL of the image.
    pub locator: String,
    pub created_at: Timestamp,
    pub title_slug: String,
}

impl PersistedImage {
    /// Markdown image link, e.g. `![Sunset](https://img/…/sunset.png)`.
    pub fn markdown(&self, title: &str) -> String {
        format!("![{title}]({})", self.locator)
    }
}

/// Writes artifacts into one output directory.
#[derive(Debug, Clone)]
pub struct Persister {
    output_dir: PathBuf,
    base_url: String,
    workflow_name: String,
    write_prompt_sidecar: bool,
}

impl Persister {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        base_url: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            workflow_name: workflow_name.into(),
            write_prompt_sidecar: true,
        }
    }

    pub fn with_prompt_sidecar(mut self, enabled: bool) -> Self {
        self.write_prompt_sidecar = enabled;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `artifact` under a fresh, collision-free name.
    pub async fn persist(
        &self,
        artifact: &Artifact,
        request: &GenerationRequest,
    ) -> Result<PersistedImage, GenerationError> {
        self.persist_at(artifact, request, chrono::Utc::now()).await
    }

    pub(crate) async fn persist_at(
        &self,
        artifact: &Artifact,
        request: &GenerationRequest,
        created_at: Timestamp,
    ) -> Result<PersistedImage, GenerationError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| failed(&self.output_dir, source))?;

        let title_slug = slugify(request.title());
        let timestamp = timestamp_component(&created_at);
        let extension = image_extension(
            &artifact.bytes,
            artifact.content_type.as_deref(),
            Some(&artifact.source_name),
        );

        let mut staging = Staging::default();
        let claimed = async {
            let image = staging.write(&self.output_dir, &artifact.bytes).await?;
            let prompt = if self.write_prompt_sidecar {
                let text = request.prompt().as_bytes();
                Some(staging.write(&self.output_dir, text).await?)
            } else {
                None
            };
            let stems = |attempt| image_stem(&timestamp, &title_slug, &self.workflow_name, attempt);
            self.claim_name(&image, prompt.as_deref(), stems, &extension).await
        }
        .await;
        staging.discard().await;
        let (stem, path) = claimed?;

        let file_name = format!("{stem}.{extension}");
        let locator = format!("{}/{}", self.base_url, file_name);
        tracing::info!(
            path = %path.display(),
            bytes = artifact.bytes.len(),
            "Image persisted",
        );

        Ok(PersistedImage {
            path,
            file_name,
            locator,
            created_at,
            title_slug,
        })
    }

    /// Link the staged image, and the staged prompt when there is one, to
    /// the first candidate stem whose names are all free.
    async fn claim_name(
        &self,
        image: &Path,
        prompt: Option<&Path>,
        stems: impl Fn(u32) -> String,
        extension: &str,
    ) -> Result<(String, PathBuf), GenerationError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let stem = stems(attempt);
            let sidecar = self.output_dir.join(format!("{stem}.txt"));
            if let Some(prompt) = prompt {
                match tokio::fs::hard_link(prompt, &sidecar).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(source) => return Err(failed(&sidecar, source)),
                }
            }

            let path = self.output_dir.join(format!("{stem}.{extension}"));
            match tokio::fs::hard_link(image, &path).await {
                Ok(()) => return Ok((stem, path)),
                Err(e) => {
                    if prompt.is_some() {
                        remove_quietly(&sidecar).await;
                    }
                    if e.kind() != io::ErrorKind::AlreadyExists {
                        return Err(failed(&path, e));
                    }
                }
            }
        }

        let first = self.output_dir.join(format!("{}.{extension}", stems(0)));
        Err(failed(
            &first,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{MAX_NAME_ATTEMPTS} candidate names already taken"),
            ),
        ))
    }
}

/// Hidden files written ahead of publishing.
///
/// A path is registered before its file is created, so a write that fails
/// halfway is still removed by [`Staging::discard`].
#[derive(Debug, Default)]
struct Staging {
    paths: Vec<PathBuf>,
}

impl Staging {
    async fn write(&mut self, dir: &Path, bytes: &[u8]) -> Result<PathBuf, GenerationError> {
        let path = dir.join(format!(".{}.partial", uuid::Uuid::new_v4()));
        self.paths.push(path.clone());
        write_new(&path, bytes)
            .await
            .map_err(|source| failed(&path, source))?;
        Ok(path)
    }

    async fn discard(self) {
        for path in &self.paths {
            remove_quietly(path).await;
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Create `path` exclusively and write `bytes` to it, synced to disk.
async fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

fn failed(path: &Path, source: io::Error) -> GenerationError {
    GenerationError::PersistenceFailed {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use imagegen_core::request::AspectRatio;
    use imagegen_core::workflow::NodeId;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];

    fn artifact(bytes: &[u8]) -> Artifact {
        Artifact {
            bytes: bytes.to_vec(),
            content_type: Some("image/png".into()),
            origin_node: NodeId::from("9"),
            source_name: "ComfyUI_00001_.png".into(),
        }
    }

    fn request(title: &str) -> GenerationRequest {
        GenerationRequest::new("a sunset over mountains", title, AspectRatio::Wide).unwrap()
    }

    fn at() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap()
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn writes_image_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "https://img.example.com/", "flux");

        let image = persister
            .persist_at(&artifact(PNG), &request("Mountain Sunset"), at())
            .await
            .unwrap();

        assert_eq!(image.file_name, "2025-06-01_12-30-45_mountain-sunset_flux.png");
        assert_eq!(image.title_slug, "mountain-sunset");
        assert_eq!(
            image.locator,
            "https://img.example.com/2025-06-01_12-30-45_mountain-sunset_flux.png"
        );
        assert_eq!(std::fs::read(&image.path).unwrap(), PNG);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("2025-06-01_12-30-45_mountain-sunset_flux.txt"))
                .unwrap(),
            "a sunset over mountains"
        );
        // No temporary files left behind.
        assert_eq!(names_in(dir.path()).len(), 2);
        assert_eq!(
            image.markdown("Mountain Sunset"),
            "![Mountain Sunset](https://img.example.com/2025-06-01_12-30-45_mountain-sunset_flux.png)"
        );
    }

    #[tokio::test]
    async fn sidecar_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "http://x", "flux").with_prompt_sidecar(false);
        persister
            .persist_at(&artifact(PNG), &request("t"), at())
            .await
            .unwrap();
        assert_eq!(names_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn collision_gets_suffix_and_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "http://x", "flux");

        let first = persister
            .persist_at(&artifact(PNG), &request("Same"), at())
            .await
            .unwrap();
        let second = persister
            .persist_at(&artifact(b"second image"), &request("Same"), at())
            .await
            .unwrap();

        assert_eq!(first.file_name, "2025-06-01_12-30-45_same_flux.png");
        assert_eq!(second.file_name, "2025-06-01_12-30-45_same_flux-2.png");
        assert_eq!(std::fs::read(&first.path).unwrap(), PNG);
        assert_eq!(std::fs::read(&second.path).unwrap(), b"second image");
    }

    #[tokio::test]
    async fn sidecar_stays_with_its_image_across_formats() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "http://x", "flux");
        let jpeg = Artifact {
            content_type: Some("image/jpeg".into()),
            ..artifact(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0])
        };
        let first_request =
            GenerationRequest::new("first prompt", "Same", AspectRatio::Wide).unwrap();
        let second_request =
            GenerationRequest::new("second prompt", "Same", AspectRatio::Wide).unwrap();

        let first = persister
            .persist_at(&jpeg, &first_request, at())
            .await
            .unwrap();
        let second = persister
            .persist_at(&artifact(PNG), &second_request, at())
            .await
            .unwrap();

        assert_eq!(first.file_name, "2025-06-01_12-30-45_same_flux.jpg");
        assert_eq!(second.file_name, "2025-06-01_12-30-45_same_flux-2.png");
        assert_eq!(
            std::fs::read_to_string(first.path.with_extension("txt")).unwrap(),
            "first prompt"
        );
        assert_eq!(
            std::fs::read_to_string(second.path.with_extension("txt")).unwrap(),
            "second prompt"
        );
        assert_eq!(names_in(dir.path()).len(), 4);
    }

    #[tokio::test]
    async fn failed_claim_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "http://x", "flux");
        let timestamp = timestamp_component(&at());
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let stem = image_stem(&timestamp, "full", "flux", attempt);
            std::fs::write(dir.path().join(format!("{stem}.txt")), b"taken").unwrap();
        }

        assert_matches!(
            persister.persist_at(&artifact(PNG), &request("Full"), at()).await,
            Err(GenerationError::PersistenceFailed { .. })
        );
        let names = names_in(dir.path());
        assert_eq!(names.len(), MAX_NAME_ATTEMPTS as usize);
        assert!(names.iter().all(|name| name.ends_with(".txt")));
    }

    #[tokio::test]
    async fn staging_discards_partial_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut staging = Staging::default();
        staging.write(dir.path(), b"complete").await.unwrap();

        // A write that died after creating its file, and one that never did.
        let partial = dir.path().join(".cut-short.partial");
        std::fs::write(&partial, b"half").unwrap();
        staging.paths.push(partial);
        staging.paths.push(dir.path().join(".never-created.partial"));

        staging.discard().await;
        assert!(names_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn concurrent_writers_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Arc::new(Persister::new(dir.path(), "http://x", "flux"));

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let persister = Arc::clone(&persister);
                tokio::spawn(async move {
                    let bytes = vec![i; 16];
                    let image = persister
                        .persist_at(&artifact(&bytes), &request("Race"), at())
                        .await
                        .unwrap();
                    (image, bytes)
                })
            })
            .collect();

        let mut names = Vec::new();
        for task in tasks {
            let (image, bytes) = task.await.unwrap();
            assert_eq!(std::fs::read(&image.path).unwrap(), bytes);
            names.push(image.file_name);
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn extension_follows_payload() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path(), "http://x", "flux");
        let jpeg = Artifact {
            content_type: Some("image/jpeg".into()),
            ..artifact(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0])
        };
        let image = persister.persist_at(&jpeg, &request("j"), at()).await.unwrap();
        assert!(image.file_name.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn unwritable_directory_is_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let persister = Persister::new(blocker.join("out"), "http://x", "flux");

        assert_matches!(
            persister.persist(&artifact(PNG), &request("t")).await,
            Err(GenerationError::PersistenceFailed { .. })
        );
    }
}
