//! Persistence of raw task output to the workspace directory.
//!
//! Output files are a convenience for humans digging into what an agent
//! produced; failing to write one never fails the task.

use crate::{constants, models::Task, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct WorkspaceStore {
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

fn slugify(title: &str) -> String {
    let slug: String = title
        .chars()
        .take(constants::TASK_SLUG_LENGTH)
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

impl WorkspaceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Deterministic output file name for a task.
    pub fn output_file_name(task: &Task) -> String {
        format!("task-{}-{}.txt", task.short_id(), slugify(&task.title))
    }

    /// Write the raw output for a task. Errors are reported to the caller
    /// but the executor only logs them.
    pub async fn persist_output(&self, task: &Task, output: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("creating workspace dir {:?}", self.base_dir))?;

        let path = self.base_dir.join(Self::output_file_name(task));
        tokio::fs::write(&path, output)
            .await
            .with_context(|| format!("writing task output to {path:?}"))?;
        debug!(task_id = %task.id, path = %path.display(), "task output persisted");
        Ok(path)
    }

    /// List persisted output files, newest first.
    pub async fn list_files(&self) -> Result<Vec<WorkspaceFile>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(files),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("reading workspace dir")?
        {
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified_at = metadata
                .modified()
                .ok()
                .map(DateTime::<Utc>::from);
            files.push(WorkspaceFile {
                name: entry.file_name().to_string_lossy().to_string(),
                size_bytes: metadata.len(),
                modified_at,
            });
        }

        files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(files)
    }

    /// Retention pass: keep the newest `retain` files, delete the rest.
    pub async fn cleanup_old_outputs(&self, retain: usize) -> Result<usize> {
        let files = self.list_files().await?;
        let mut removed = 0;
        for file in files.iter().skip(retain) {
            let path = self.base_dir.join(&file.name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old output"),
            }
        }
        if removed > 0 {
            debug!(removed, "workspace retention pass finished");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;

    #[test]
    fn slug_is_lowercase_alnum_dashes() {
        assert_eq!(slugify("Add two numbers!"), "add-two-numbers");
        assert_eq!(slugify("///"), "task");
        let long = slugify("a very long task title that keeps going and going");
        assert!(long.len() <= constants::TASK_SLUG_LENGTH);
    }

    #[tokio::test]
    async fn output_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceStore::new(dir.path());
        let task = Task::new("Add numbers", "desc", TaskType::Code);

        let path = workspace.persist_output(&task, "the output").await.unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("task-"));

        let files = workspace.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, "the output".len() as u64);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "the output");
    }

    #[tokio::test]
    async fn listing_missing_dir_is_empty() {
        let workspace = WorkspaceStore::new("/nonexistent/fleet-core-test");
        assert!(workspace.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceStore::new(dir.path());

        for i in 0..5 {
            let task = Task::new(format!("task {i}"), "desc", TaskType::Code);
            workspace.persist_output(&task, "x").await.unwrap();
        }

        let removed = workspace.cleanup_old_outputs(3).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(workspace.list_files().await.unwrap().len(), 3);
    }
}
