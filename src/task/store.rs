// ABOUTME: TaskStore - the on-disk task layout: <root>/<agent>/<taskId>/ holding
// ABOUTME: INIT/PLAN/DONE/ERROR marker files. Enumerates, reads, and writes tasks.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::types::{Marker, Task, TaskFlags, TaskInit, TaskStatus};
use crate::error::TaskError;

/// Filesystem-backed task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
    #[cfg(test)]
    failing_marker: Option<Marker>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            #[cfg(test)]
            failing_marker: None,
        }
    }

    /// Make every write of `marker` fail with an I/O error.
    #[cfg(test)]
    pub(crate) fn fail_marker_writes(&mut self, marker: Option<Marker>) {
        self.failing_marker = marker;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `agent`.
    pub fn agent_dir(&self, agent: &str) -> Result<PathBuf, TaskError> {
        validate_segment("agent", agent)?;
        Ok(self.root.join(agent))
    }

    /// Directory of `task_id` inside `agent`'s namespace.
    pub fn task_dir(&self, agent: &str, task_id: &str) -> Result<PathBuf, TaskError> {
        validate_segment("taskId", task_id)?;
        Ok(self.agent_dir(agent)?.join(task_id))
    }

    /// Every task in `agent`'s namespace, sorted by id.
    ///
    /// An agent without a namespace has no tasks; any other I/O failure is
    /// returned as is.
    pub async fn agent_tasks(&self, agent: &str) -> Result<Vec<Task>, TaskError> {
        let agent_dir = self.agent_dir(agent)?;
        let mut entries = match tokio::fs::read_dir(&agent_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            tasks.push(load_task(agent, &name, &entry.path()).await?);
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Look up one task. `None` if it does not exist under `agent`.
    pub async fn task(&self, agent: &str, task_id: &str) -> Result<Option<Task>, TaskError> {
        let dir = self.task_dir(agent, task_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(Some(load_task(agent, task_id, &dir).await?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a task whose directory holds `init` as INIT.md. Fails if the
    /// task already exists.
    ///
    /// The directory is assembled under a hidden name and renamed into place,
    /// so a failed creation leaves no task behind and the id stays free.
    pub async fn create_task(
        &self,
        agent: &str,
        task_id: &str,
        init: &TaskInit,
    ) -> Result<Task, TaskError> {
        let target = self.task_dir(agent, task_id)?;
        let agent_dir = self.agent_dir(agent)?;
        tokio::fs::create_dir_all(&agent_dir).await?;
        if tokio::fs::try_exists(&target).await? {
            return Err(already_exists(agent, task_id));
        }

        let staging = agent_dir.join(format!(".{task_id}.{}.creating", uuid::Uuid::new_v4()));
        tokio::fs::create_dir(&staging).await?;
        let placed: Result<(), TaskError> = async {
            self.replace_file(&staging, Marker::Init, &render_init(init)).await?;
            match tokio::fs::rename(&staging, &target).await {
                Ok(()) => Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::AlreadyExists
                            | ErrorKind::DirectoryNotEmpty
                            | ErrorKind::NotADirectory
                    ) =>
                {
                    Err(already_exists(agent, task_id))
                }
                Err(e) => Err(e.into()),
            }
        }
        .await;

        if let Err(e) = placed {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                tracing::warn!(
                    path = %staging.display(),
                    error = %cleanup,
                    "failed to remove staged task directory"
                );
            }
            return Err(e);
        }

        load_task(agent, task_id, &target).await
    }

    /// Parsed INIT.md, or `None` if the task has none.
    pub async fn read_init(&self, task: &Task) -> Result<Option<TaskInit>, TaskError> {
        let path = self.task_dir(&task.agent, &task.id)?.join(Marker::Init.file_name());
        Ok(read_optional(&path).await?.map(|raw| parse_init(&raw, &task.id)))
    }

    /// Raw PLAN.md, or `None` if no plan was submitted.
    pub async fn read_plan(&self, task: &Task) -> Result<Option<String>, TaskError> {
        let path = self.task_dir(&task.agent, &task.id)?.join(Marker::Plan.file_name());
        Ok(read_optional(&path).await?)
    }

    /// Replace a marker file atomically: readers see the old file or the new
    /// one, never a partial write.
    pub async fn write_marker(
        &self,
        task: &Task,
        marker: Marker,
        content: &str,
    ) -> Result<(), TaskError> {
        let dir = self.task_dir(&task.agent, &task.id)?;
        self.replace_file(&dir, marker, content).await
    }

    async fn replace_file(&self, dir: &Path, marker: Marker, content: &str) -> Result<(), TaskError> {
        #[cfg(test)]
        if self.failing_marker == Some(marker) {
            return Err(std::io::Error::other(format!("cannot write {}", marker.file_name())).into());
        }

        let target = dir.join(marker.file_name());
        let staging = dir.join(format!(".{}.{}.tmp", marker.file_name(), uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&staging, content).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn already_exists(agent: &str, task_id: &str) -> TaskError {
    TaskError::invalid(
        "taskId",
        format!("task '{task_id}' already exists for agent '{agent}'"),
    )
}

/// Render INIT.md for a new task.
pub fn render_init(init: &TaskInit) -> String {
    let mut out = format!("# {}\n\n## Objective\n\n{}\n", init.title.trim(), init.objective.trim());
    if !init.requirements.is_empty() {
        out.push_str("\n## Requirements\n\n");
        for requirement in &init.requirements {
            out.push_str("- ");
            out.push_str(requirement.trim());
            out.push('\n');
        }
    }
    out
}

/// Parse INIT.md: `# Title`, then `## Objective` and `## Requirements` sections.
/// Without an Objective heading, untitled body text becomes the objective.
pub fn parse_init(raw: &str, fallback_title: &str) -> TaskInit {
    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Objective,
        Requirements,
        Other,
    }

    let mut title = None;
    let mut preamble = Vec::new();
    let mut objective = Vec::new();
    let mut requirements = Vec::new();
    let mut section = Section::Preamble;

    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            section = match heading.trim().to_ascii_lowercase().as_str() {
                "objective" | "objectives" => Section::Objective,
                "requirements" => Section::Requirements,
                _ => Section::Other,
            };
            continue;
        }
        if title.is_none() && section == Section::Preamble {
            if let Some(heading) = trimmed.strip_prefix("# ") {
                title = Some(heading.trim().to_string());
                continue;
            }
        }
        match section {
            Section::Preamble => preamble.push(line),
            Section::Objective => objective.push(line),
            Section::Requirements => {
                let item = trimmed
                    .strip_prefix("- ")
                    .or_else(|| trimmed.strip_prefix("* "))
                    .unwrap_or(trimmed)
                    .trim();
                if !item.is_empty() {
                    requirements.push(item.to_string());
                }
            }
            Section::Other => {}
        }
    }

    let objective = if objective.iter().any(|l| !l.trim().is_empty()) {
        objective
    } else {
        preamble
    };

    TaskInit {
        title: title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title.to_string()),
        objective: objective.join("\n").trim().to_string(),
        requirements,
    }
}

/// Reject empty names and anything that could step outside the task root.
fn validate_segment(field: &str, value: &str) -> Result<(), TaskError> {
    if value.trim().is_empty() {
        return Err(TaskError::invalid(field, "must not be empty"));
    }
    let mut components = Path::new(value).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single_normal || value.contains(['/', '\\']) || value.starts_with('.') {
        return Err(TaskError::invalid(
            field,
            format!("'{value}' is not a valid name"),
        ));
    }
    Ok(())
}

async fn load_task(agent: &str, task_id: &str, dir: &Path) -> Result<Task, TaskError> {
    let mut flags = TaskFlags::default();
    let mut modified = modified_at(&tokio::fs::metadata(dir).await?);

    for marker in Marker::ALL {
        match tokio::fs::metadata(dir.join(marker.file_name())).await {
            Ok(meta) => {
                flags.set(marker);
                modified = modified.max(modified_at(&meta));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Task {
        agent: agent.to_string(),
        id: task_id.to_string(),
        flags,
        status: TaskStatus::from_flags(flags),
        modified,
    })
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(|t: SystemTime| DateTime::<Utc>::from(t))
}

async fn read_optional(path: &Path) -> Result<Option<String>, TaskError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
