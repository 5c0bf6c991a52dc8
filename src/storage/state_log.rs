// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Append-only resumption log (`state.jsonl`)
//!
//! One JSON object per line. The log is folded into memory once at open and
//! then only appended to. Appends go through a single async mutex and are
//! synced before the in-memory view is updated, so the view never claims more
//! than the file does.

use crate::errors::{CurationError, CurationResult};
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub const STATE_FILE: &str = "state.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StateRecord {
    Completed {
        image_id: String,
        stage: Stage,
    },
    Failed {
        image_id: String,
        stage: Stage,
        reason: String,
    },
}

/// Last recorded failure of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Default)]
struct FoldedState {
    completed: HashSet<(String, Stage)>,
    failed: BTreeMap<String, FailureRecord>,
}

impl FoldedState {
    fn apply(&mut self, record: StateRecord) {
        match record {
            StateRecord::Completed { image_id, stage } => {
                if self
                    .failed
                    .get(&image_id)
                    .map(|f| f.stage == stage)
                    .unwrap_or(false)
                {
                    self.failed.remove(&image_id);
                }
                self.completed.insert((image_id, stage));
            }
            StateRecord::Failed {
                image_id,
                stage,
                reason,
            } => {
                self.failed.insert(image_id, FailureRecord { stage, reason });
            }
        }
    }
}

pub struct PipelineState {
    path: PathBuf,
    state: RwLock<FoldedState>,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl PipelineState {
    /// Open (or create lazily) the log at `path` and fold existing records
    pub async fn open(path: impl Into<PathBuf>) -> CurationResult<Self> {
        let path = path.into();
        let mut folded = FoldedState::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut records = 0usize;
                for (n, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StateRecord>(line) {
                        Ok(record) => {
                            folded.apply(record);
                            records += 1;
                        }
                        Err(e) => warn!(
                            "Ignoring unreadable state record at {}:{}: {}",
                            path.display(),
                            n + 1,
                            e
                        ),
                    }
                }
                debug!("Loaded {} state records from {}", records, path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CurationError::storage_read(&path, e)),
        }

        Ok(Self {
            path,
            state: RwLock::new(folded),
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_complete(&self, image_id: &str, stage: Stage) -> bool {
        self.state
            .read()
            .await
            .completed
            .contains(&(image_id.to_string(), stage))
    }

    /// Whether every stage of the image is recorded complete
    pub async fn is_fully_complete(&self, image_id: &str) -> bool {
        let state = self.state.read().await;
        Stage::ALL
            .iter()
            .all(|stage| state.completed.contains(&(image_id.to_string(), *stage)))
    }

    pub async fn failure(&self, image_id: &str) -> Option<FailureRecord> {
        self.state.read().await.failed.get(image_id).cloned()
    }

    /// Images whose latest outcome is a failure, ordered by id
    pub async fn failures(&self) -> BTreeMap<String, FailureRecord> {
        self.state.read().await.failed.clone()
    }

    pub async fn completed_count(&self, stage: Stage) -> usize {
        self.state
            .read()
            .await
            .completed
            .iter()
            .filter(|(_, s)| *s == stage)
            .count()
    }

    pub async fn mark_complete(&self, image_id: &str, stage: Stage) -> CurationResult<()> {
        self.append(StateRecord::Completed {
            image_id: image_id.to_string(),
            stage,
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        image_id: &str,
        stage: Stage,
        reason: &str,
    ) -> CurationResult<()> {
        self.append(StateRecord::Failed {
            image_id: image_id.to_string(),
            stage,
            reason: reason.to_string(),
        })
        .await
    }

    async fn append(&self, record: StateRecord) -> CurationResult<()> {
        let mut line =
            serde_json::to_vec(&record).map_err(|e| CurationError::storage_write(&self.path, e))?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            if writer.is_none() {
                *writer = Some(self.open_for_append().await?);
            }
            if let Some(file) = writer.as_mut() {
                file.write_all(&line)
                    .await
                    .map_err(|e| CurationError::storage_write(&self.path, e))?;
                file.sync_data()
                    .await
                    .map_err(|e| CurationError::storage_write(&self.path, e))?;
            }
        }

        self.state.write().await.apply(record);
        Ok(())
    }

    /// Open in append mode, terminating a torn last line first
    async fn open_for_append(&self) -> CurationResult<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CurationError::storage_write(parent, e))?;
        }

        let needs_newline = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes.last().map(|b| *b != b'\n').unwrap_or(false),
            Err(_) => false,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CurationError::storage_write(&self.path, e))?;

        if needs_newline {
            file.write_all(b"\n")
                .await
                .map_err(|e| CurationError::storage_write(&self.path, e))?;
        }
        Ok(file)
    }

    /// Delete the log file; the in-memory view is left as is
    pub async fn remove(&self) -> CurationResult<()> {
        let mut writer = self.writer.lock().await;
        *writer = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CurationError::storage_write(&self.path, e)),
        }
    }
}
