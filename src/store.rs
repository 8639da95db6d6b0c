//! One directory per job, with an explicit create/update/finalize lifecycle.

use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::JobManifest;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Job ids name a directory directly under the store root.
pub fn is_valid_job_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == id
    )
}

fn check_job_id(id: &str) -> PipelineResult<()> {
    if is_valid_job_id(id) {
        Ok(())
    } else {
        Err(PipelineError::InvalidJobId(id.to_string()))
    }
}

/// Paths of one job's directory.
#[derive(Debug, Clone)]
pub struct JobDir {
    job_id: String,
    root: PathBuf,
    finalized: bool,
}

impl JobDir {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join("segments")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.segments_dir().join(format!("segment_{index:03}.mp4"))
    }

    pub fn reference_image_path(&self) -> PathBuf {
        self.frames_dir().join("reference.png")
    }

    pub fn stitched_path(&self) -> PathBuf {
        self.output_dir().join("stitched.mp4")
    }

    pub fn enhanced_path(&self) -> PathBuf {
        self.output_dir().join("enhanced.mp4")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lay out a fresh job directory and write the initial manifest.
    pub async fn create(&self, manifest: &mut JobManifest) -> PipelineResult<JobDir> {
        check_job_id(&manifest.job_id)?;
        let dir = JobDir {
            job_id: manifest.job_id.clone(),
            root: self.root.join(&manifest.job_id),
            finalized: false,
        };
        if fs::try_exists(dir.manifest_path()).await? {
            return Err(PipelineError::InvalidTransition {
                from: format!("job {} exists", manifest.job_id),
                to: "created".to_string(),
            });
        }
        for sub in [dir.segments_dir(), dir.frames_dir(), dir.output_dir()] {
            fs::create_dir_all(&sub).await?;
        }
        self.write(&dir, manifest).await?;
        debug!(job_id = %dir.job_id, "Created job directory {}", dir.root.display());
        Ok(dir)
    }

    pub async fn update(&self, dir: &JobDir, manifest: &mut JobManifest) -> PipelineResult<()> {
        if dir.finalized {
            return Err(PipelineError::InvalidTransition {
                from: "finalized".to_string(),
                to: "update".to_string(),
            });
        }
        self.write(dir, manifest).await
    }

    /// Last write for a job. Leftover partial downloads are removed.
    pub async fn finalize(&self, dir: &mut JobDir, manifest: &mut JobManifest) -> PipelineResult<()> {
        self.update(dir, manifest).await?;
        dir.finalized = true;
        let swept = sweep_partials(&dir.root);
        if swept > 0 {
            warn!(job_id = %dir.job_id, swept, "Removed partial downloads");
        }
        Ok(())
    }

    pub async fn load(&self, job_id: &str) -> PipelineResult<JobManifest> {
        check_job_id(job_id)?;
        let path = self.root.join(job_id).join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Ids of every job with a manifest under the store root, sorted.
    pub fn list_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
            .filter_map(|e| {
                e.path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        ids
    }

    async fn write(&self, dir: &JobDir, manifest: &mut JobManifest) -> PipelineResult<()> {
        manifest.updated_at = chrono::Utc::now();
        let body = serde_json::to_vec_pretty(&manifest.relative_to(&dir.root))?;
        let path = dir.manifest_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Delete `*.part` files below `root`. Returns how many were removed.
pub fn sweep_partials(root: &Path) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("part"))
        .filter(|e| std::fs::remove_file(e.path()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::EncodingProfile;
    use crate::state::JobState;
    use crate::stitch::TransitionSpec;

    fn manifest(id: &str) -> JobManifest {
        JobManifest::new(id, TransitionSpec::default(), EncodingProfile::default())
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path());
        let mut m = manifest("job-a");

        let mut dir = store.create(&mut m).await.unwrap();
        assert!(dir.segments_dir().is_dir());
        assert!(dir.frames_dir().is_dir());
        assert!(dir.manifest_path().is_file());

        m.state.advance(JobState::ImageGenerating).unwrap();
        store.update(&dir, &mut m).await.unwrap();
        assert_eq!(store.load("job-a").await.unwrap().state, JobState::ImageGenerating);

        fs::write(dir.segments_dir().join("segment_000.mp4.part"), b"x")
            .await
            .unwrap();
        store.finalize(&mut dir, &mut m).await.unwrap();
        assert!(dir.is_finalized());
        assert!(!dir.segments_dir().join("segment_000.mp4.part").exists());
        assert!(store.update(&dir, &mut m).await.is_err());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_job() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path());
        store.create(&mut manifest("dup")).await.unwrap();
        assert!(store.create(&mut manifest("dup")).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_ids_outside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("jobs"));
        let absolute = elsewhere.path().join("escaped").display().to_string();

        for id in ["", ".", "..", "a/../../x", "a/b", absolute.as_str()] {
            let err = store.create(&mut manifest(id)).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidJobId(_)), "{id:?}");
        }
        assert!(!elsewhere.path().join("escaped").exists());
        assert!(!tmp.path().join("x").exists());
        assert!(matches!(
            store.load("../x").await.unwrap_err(),
            PipelineError::InvalidJobId(_)
        ));
    }

    #[test]
    fn test_job_id_shape() {
        assert!(is_valid_job_id("job-a"));
        assert!(is_valid_job_id("2024.render_01"));
        assert!(!is_valid_job_id("a/"));
        assert!(!is_valid_job_id("./a"));
        assert!(!is_valid_job_id("/a"));
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path());
        for id in ["b", "a"] {
            store.create(&mut manifest(id)).await.unwrap();
        }
        fs::create_dir_all(tmp.path().join("stray")).await.unwrap();
        assert_eq!(store.list_jobs(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_layout_names() {
        let dir = JobDir {
            job_id: "j".to_string(),
            root: PathBuf::from("/jobs/j"),
            finalized: false,
        };
        assert_eq!(dir.segment_path(2), PathBuf::from("/jobs/j/segments/segment_002.mp4"));
        assert_eq!(dir.reference_image_path(), PathBuf::from("/jobs/j/frames/reference.png"));
        assert_eq!(dir.enhanced_path(), PathBuf::from("/jobs/j/output/enhanced.mp4"));
    }
}
