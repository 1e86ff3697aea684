use serde::{Deserialize, Serialize};

use crate::tuple::fifo::FifoConfig;
use crate::tuple::DEFAULT_PAGE_SIZE;

/// Configuration for a dispatcher and the stages registered on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Size in bytes of the pages moved between stages.
    pub page_size: usize,

    /// Max number of pages buffered in a fifo before the producer blocks.
    /// Unbounded if None.
    pub fifo_capacity: Option<usize>,

    /// Number of workers for stages registered without an explicit config.
    pub default_stage_workers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            page_size: DEFAULT_PAGE_SIZE,
            fifo_capacity: None,
            default_stage_workers: num_cpus::get(),
        }
    }
}

impl ExecutionConfig {
    pub fn fifo_config(&self) -> FifoConfig {
        FifoConfig {
            page_size: self.page_size,
            capacity: self.fifo_capacity,
        }
    }

    pub fn default_stage_config(&self) -> StageConfig {
        StageConfig {
            workers: self.default_stage_workers,
            sharing_enabled: true,
        }
    }
}

/// Per stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Number of worker threads for the stage.
    pub workers: usize,

    /// Whether packets for the stage may be merged.
    pub sharing_enabled: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        ExecutionConfig::default().default_stage_config()
    }
}

impl StageConfig {
    pub fn with_workers(workers: usize) -> Self {
        StageConfig {
            workers,
            ..Default::default()
        }
    }

    pub fn without_sharing(mut self) -> Self {
        self.sharing_enabled = false;
        self
    }
}
