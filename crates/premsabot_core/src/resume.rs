use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};

pub const RESUME_SCHEMA_VERSION: u32 = 1;

/// Persisted run state. At any snapshot an id lives in exactly one of
/// `queue`, `uploaded` or `rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResumeFile {
    schema_version: u32,
    started_at: Option<String>,
    ended_at: Option<String>,
    queue: Vec<String>,
    uploaded: Vec<String>,
    rejected: Vec<String>,
}

impl Default for ResumeFile {
    fn default() -> Self {
        Self {
            schema_version: RESUME_SCHEMA_VERSION,
            started_at: None,
            ended_at: None,
            queue: Vec::new(),
            uploaded: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Durable queue of ids awaiting disposition for one logical run. Every
/// resolution is persisted before the next item starts, so a crash loses at
/// most the in-flight item.
pub struct ResumeManager {
    path: PathBuf,
    state: ResumeFile,
}

impl ResumeManager {
    /// Open the run state. A non-empty leftover queue means the previous run
    /// did not finish; the caller must skip ingestion and replay the queue.
    /// Returns the manager and whether this run is resuming.
    pub fn open(path: &Path) -> Result<(Self, bool)> {
        let persisted = read_resume_file(path)?;
        if !persisted.queue.is_empty() {
            info!(
                "queue has {} leftover items, resuming run started {}",
                persisted.queue.len(),
                persisted.started_at.as_deref().unwrap_or("unknown"),
            );
            info!(
                "previously uploaded this run ({}): {:?}",
                persisted.uploaded.len(),
                persisted.uploaded
            );
            return Ok((
                Self {
                    path: path.to_path_buf(),
                    state: persisted,
                },
                true,
            ));
        }

        let state = ResumeFile {
            started_at: Some(now_stamp()),
            ..ResumeFile::default()
        };
        Ok((
            Self {
                path: path.to_path_buf(),
                state,
            },
            false,
        ))
    }

    pub fn queue(&self) -> &[String] {
        &self.state.queue
    }

    pub fn uploaded_count(&self) -> usize {
        self.state.uploaded.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.state.rejected.len()
    }

    /// Add ids not already queued and persist. Idempotent.
    pub fn enqueue(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if !self.state.queue.iter().any(|queued| queued == id) {
                self.state.queue.push(id.clone());
            }
        }
        self.save()
    }

    pub fn resolve_uploaded(&mut self, id: &str) -> Result<()> {
        self.resolve(id, Disposition::Uploaded)
    }

    pub fn resolve_rejected(&mut self, id: &str) -> Result<()> {
        self.resolve(id, Disposition::Rejected)
    }

    /// All ids finally resolved this run, uploaded first.
    pub fn reveal(&self) -> Vec<String> {
        info!(
            "processed: {}, uploaded: {}, rejected: {}",
            self.state.uploaded.len() + self.state.rejected.len(),
            self.state.uploaded.len(),
            self.state.rejected.len()
        );
        let mut resolved = self.state.uploaded.clone();
        resolved.extend(self.state.rejected.iter().cloned());
        resolved
    }

    /// Stamp the end of the run and persist.
    pub fn close(&mut self) -> Result<()> {
        self.state.ended_at = Some(now_stamp());
        self.save()
    }

    fn resolve(&mut self, id: &str, disposition: Disposition) -> Result<()> {
        self.state.queue.retain(|queued| queued != id);
        let target = match disposition {
            Disposition::Uploaded => &mut self.state.uploaded,
            Disposition::Rejected => &mut self.state.rejected,
        };
        if !target.iter().any(|resolved| resolved == id) {
            target.push(id.to_string());
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered =
            serde_json::to_string_pretty(&self.state).context("failed to serialize run state")?;
        fs::write(&self.path, rendered)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

enum Disposition {
    Uploaded,
    Rejected,
}

fn read_resume_file(path: &Path) -> Result<ResumeFile> {
    if !path.exists() {
        return Ok(ResumeFile::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: ResumeFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if parsed.schema_version != RESUME_SCHEMA_VERSION {
        bail!(
            "unsupported run state schema version {} in {}",
            parsed.schema_version,
            path.display()
        );
    }
    Ok(parsed)
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
