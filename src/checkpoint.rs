//! Per-task checkpoint store.
//!
//! One JSON file per `TaskKey` holding the dialogue state plus the comment
//! watcher state. Written at turn boundaries and on pause, removed on
//! terminal completion.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::comments::CommentWatcherState;
use crate::dialogue::DialogueState;
use crate::error::Result;
use crate::log_debug;
use crate::task::TaskKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dialogue: DialogueState,
    pub comments: CommentWatcherState,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &TaskKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.slug()))
    }

    pub fn exists(&self, key: &TaskKey) -> bool {
        self.path_for(key).exists()
    }

    pub fn save(&self, key: &TaskKey, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(key);
        let body = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&path, body)?;
        log_debug!("checkpoint written for {key}");
        Ok(())
    }

    /// Load a checkpoint. A missing or malformed file reads as `None`; the
    /// caller starts fresh in that case.
    pub fn load(&self, key: &TaskKey) -> Option<Checkpoint> {
        let path = self.path_for(key);
        let body = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&body) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                log_debug!("discarding malformed checkpoint for {key}: {e}");
                None
            }
        }
    }

    pub fn remove(&self, key: &TaskKey) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
