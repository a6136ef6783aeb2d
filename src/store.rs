use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use crate::agent::{AgentError, PageState, RunState, RunStore, SnapshotStore, StepRecord};

/// `<base>/<run_id>/run.json` plus one `steps.jsonl` line per step.
pub struct DiskRunStore {
    base_dir: PathBuf,
}

impl DiskRunStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    async fn run_dir(&self, run_id: &str) -> Result<PathBuf, AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Store(format!("create_dir {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    async fn write_run(&self, run: &RunState) -> Result<(), AgentError> {
        let dir = self.run_dir(&run.run_id).await?;
        let json = serde_json::to_vec_pretty(run).map_err(|e| AgentError::Store(format!("encode run: {}", e)))?;
        async_fs::write(dir.join("run.json"), json)
            .await
            .map_err(|e| AgentError::Store(format!("write run.json: {}", e)))
    }
}

#[async_trait]
impl RunStore for DiskRunStore {
    async fn write_run_start(&self, run: &RunState) -> Result<(), AgentError> {
        self.write_run(run).await
    }

    async fn write_step(&self, run_id: &str, step: &StepRecord) -> Result<(), AgentError> {
        let dir = self.run_dir(run_id).await?;
        let mut line = serde_json::to_vec(step).map_err(|e| AgentError::Store(format!("encode step: {}", e)))?;
        line.push(b'\n');
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("steps.jsonl"))
            .await
            .map_err(|e| AgentError::Store(format!("open steps.jsonl: {}", e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| AgentError::Store(format!("append steps.jsonl: {}", e)))?;
        file.flush().await.map_err(|e| AgentError::Store(format!("flush steps.jsonl: {}", e)))
    }

    async fn write_run_end(&self, run: &RunState) -> Result<(), AgentError> {
        self.write_run(run).await
    }
}

/// Writes the screenshot of each captured page, when there is one.
pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(&self, run_id: &str, step: usize, page: &PageState) -> Result<(), AgentError> {
        let Some(b64) = &page.image_base64 else {
            return Ok(());
        };
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Store(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(b64)
            .map_err(|e| AgentError::Store(format!("b64 decode: {}", e)))?;
        async_fs::write(dir.join(format!("step_{:03}.png", step)), &png)
            .await
            .map_err(|e| AgentError::Store(format!("write: {}", e)))
    }
}
