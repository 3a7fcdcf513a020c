use std::path::PathBuf;

use tracing::{debug, error};

use crate::errors::WorkOrderError;

/// Resolves workflow command names to their prompt files
/// (`<commands_dir>/<name>.md`).
#[derive(Debug, Clone)]
pub struct CommandLoader {
    commands_dir: PathBuf,
}

impl CommandLoader {
    pub fn new(commands_dir: PathBuf) -> Self {
        Self { commands_dir }
    }

    pub fn load(&self, command_name: &str) -> Result<PathBuf, WorkOrderError> {
        let path = self.commands_dir.join(format!("{command_name}.md"));
        if !path.exists() {
            error!(command_name, path = %path.display(), "command_not_found");
            return Err(WorkOrderError::CommandNotFound {
                name: command_name.to_string(),
                path,
            });
        }
        debug!(command_name, path = %path.display(), "command_load_completed");
        Ok(path)
    }

    /// Names of every `.md` command file present, for discovery endpoints
    /// and diagnostics.
    pub fn list_available(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.commands_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().is_some_and(|ext| ext == "md") {
                    Some(path.file_stem()?.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("planning.md"), "make a plan for $1").unwrap();
        std::fs::write(dir.path().join("commit.md"), "commit everything").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a command").unwrap();

        let loader = CommandLoader::new(dir.path().to_path_buf());
        assert_eq!(
            loader.load("planning").unwrap(),
            dir.path().join("planning.md")
        );
        assert_eq!(loader.list_available(), vec!["commit", "planning"]);

        match loader.load("bogus") {
            Err(WorkOrderError::CommandNotFound { name, .. }) => assert_eq!(name, "bogus"),
            other => panic!("expected CommandNotFound, got {other:?}"),
        }
    }
}
