//! On-disk research workspace.
//!
//! Layout under the workspace root (`.researchkit/` by default):
//! - `memory/constitution.md`
//! - `research/<date>-<slug>/{plan,findings,synthesis,sources}.md`
//! - `templates/plan-template.md`
//! - `config/researchkit.toml`
//!
//! The approved synthesis is also copied to the project directory.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use researchkit_agent::prompts::DEFAULT_PLAN_OUTLINE;
use researchkit_agent::tools::{SourceEntry, SourceLog};
use researchkit_agent::workflow::{ArtifactStore, ResearchSession, StoreError};
use researchkit_core::{Artifact, Phase};
use tokio::io::AsyncWriteExt;

const SOURCES_HEADER: &str = "# Sources\n\n";

#[derive(Clone, Debug)]
pub struct FsWorkspace {
    project_dir: PathBuf,
    root: PathBuf,
}

impl FsWorkspace {
    /// `root_dir` is resolved against `project_dir` unless absolute.
    pub fn new(project_dir: impl Into<PathBuf>, root_dir: &Path) -> Self {
        let project_dir = project_dir.into();
        let root = if root_dir.is_absolute() { root_dir.to_path_buf() } else { project_dir.join(root_dir) };
        Self { project_dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn constitution_path(&self) -> PathBuf {
        self.root.join("memory").join("constitution.md")
    }

    pub fn plan_template_path(&self) -> PathBuf {
        self.root.join("templates").join("plan-template.md")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config").join("researchkit.toml")
    }

    pub fn research_dir(&self, session: &ResearchSession) -> PathBuf {
        self.root.join("research").join(session.directory_name())
    }

    pub fn sources_path(&self, session: &ResearchSession) -> PathBuf {
        self.research_dir(session).join("sources.md")
    }

    pub fn artifact_path(&self, session: &ResearchSession, phase: Phase) -> PathBuf {
        match phase {
            Phase::Constitution => self.constitution_path(),
            Phase::Plan => self.research_dir(session).join("plan.md"),
            Phase::Execute => self.research_dir(session).join("findings.md"),
            Phase::Synthesize => self.research_dir(session).join("synthesis.md"),
        }
    }

    /// Creates the directory tree and the default plan template. Existing files
    /// are left alone; the returned paths are the ones created.
    pub async fn init(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut created = Vec::new();
        for dir in ["memory", "research", "templates", "config"] {
            let path = self.root.join(dir);
            if !path.is_dir() {
                tokio::fs::create_dir_all(&path).await.map_err(|error| write_error(&path, error))?;
                created.push(path);
            }
        }

        let template = self.plan_template_path();
        if !template.exists() {
            tokio::fs::write(&template, DEFAULT_PLAN_OUTLINE)
                .await
                .map_err(|error| write_error(&template, error))?;
            created.push(template);
        }
        Ok(created)
    }

    pub fn source_log(&self, session: &ResearchSession) -> FileSourceLog {
        FileSourceLog::new(self.sources_path(session))
    }
}

#[async_trait]
impl ArtifactStore for FsWorkspace {
    async fn load(&self, session: &ResearchSession, phase: Phase) -> Result<Option<String>, StoreError> {
        read_optional(&self.artifact_path(session, phase)).await
    }

    async fn save(&self, session: &ResearchSession, artifact: &Artifact) -> Result<Vec<PathBuf>, StoreError> {
        let path = self.artifact_path(session, artifact.phase);
        write_file(&path, &artifact.body).await?;
        let mut written = vec![path];

        if artifact.phase == Phase::Synthesize {
            let copy = self.project_dir.join(session.synthesis_copy_name());
            write_file(&copy, &artifact.body).await?;
            written.push(copy);
        }
        if artifact.phase != Phase::Constitution {
            let sources = self.sources_path(session);
            if sources.exists() {
                written.push(sources);
            }
        }
        Ok(written)
    }

    async fn plan_template(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.plan_template_path()).await
    }

    async fn bibliography(&self, session: &ResearchSession) -> Result<Option<String>, StoreError> {
        read_optional(&self.sources_path(session)).await
    }
}

/// Appends each newly seen URL to `sources.md` as a markdown list item.
pub struct FileSourceLog {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl FileSourceLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, seen: Mutex::new(HashSet::new()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn first_sighting(&self, url: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(url.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(url.to_string()),
        }
    }
}

#[async_trait]
impl SourceLog for FileSourceLog {
    async fn record(&self, entry: SourceEntry) -> io::Result<()> {
        if !self.first_sighting(&entry.url) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let fresh = !self.path.exists();
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        if fresh {
            file.write_all(SOURCES_HEADER.as_bytes()).await?;
        }
        file.write_all(render_source(&entry).as_bytes()).await?;
        file.flush().await
    }
}

fn render_source(entry: &SourceEntry) -> String {
    match entry.title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
        Some(title) => format!("- [{title}]({}) (via {})\n", entry.url, entry.via),
        None => format!("- <{}> (via {})\n", entry.url, entry.via),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Ok(Some(body)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(StoreError::Read { path: path.to_path_buf(), message: error.to_string() }),
    }
}

async fn write_file(path: &Path, body: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|error| write_error(parent, error))?;
    }
    tokio::fs::write(path, body).await.map_err(|error| write_error(path, error))
}

fn write_error(path: &Path, error: io::Error) -> StoreError {
    StoreError::Write { path: path.to_path_buf(), message: error.to_string() }
}
