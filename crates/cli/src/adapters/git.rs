use std::path::{Path, PathBuf};

use async_trait::async_trait;
use researchkit_agent::workflow::{CheckpointError, Checkpointer};
use tokio::process::Command;
use tracing::debug;

/// Commits accepted artifacts with the `git` binary found on `PATH`.
#[derive(Clone, Debug)]
pub struct GitCheckpointer {
    git: PathBuf,
    project_dir: PathBuf,
}

impl GitCheckpointer {
    pub fn discover(project_dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let git = which::which("git").map_err(|error| CheckpointError::Unavailable(error.to_string()))?;
        Ok(Self { git, project_dir: project_dir.into() })
    }

    pub async fn is_repository(&self) -> bool {
        self.git_command(&["rev-parse", "--is-inside-work-tree"])
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn git_command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.git);
        command.args(args).current_dir(&self.project_dir).kill_on_drop(true);
        command
    }

    async fn run(&self, args: Vec<String>) -> Result<(), CheckpointError> {
        let rendered = format!("git {}", args.join(" "));
        let borrowed = args.iter().map(String::as_str).collect::<Vec<_>>();
        let output = self.git_command(&borrowed).output().await.map_err(|error| {
            CheckpointError::CommandFailed { command: rendered.clone(), stderr: error.to_string() }
        })?;
        if output.status.success() {
            debug!(event_name = "checkpoint.git", command = %rendered, "git command succeeded");
            return Ok(());
        }
        Err(CheckpointError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Checkpointer for GitCheckpointer {
    async fn checkpoint(&self, paths: &[PathBuf], message: &str) -> Result<(), CheckpointError> {
        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(paths.iter().map(|path| relative_to(path, &self.project_dir)));
        self.run(add).await?;
        self.run(vec!["commit".to_string(), "-m".to_string(), message.to_string()]).await
    }
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::relative_to;

    #[test]
    fn paths_are_made_relative_to_the_project() {
        let base = Path::new("/work/project");
        assert_eq!(relative_to(Path::new("/work/project/.researchkit/memory/c.md"), base), ".researchkit/memory/c.md");
        assert_eq!(relative_to(Path::new("/elsewhere/x.md"), base), "/elsewhere/x.md");
    }
}
