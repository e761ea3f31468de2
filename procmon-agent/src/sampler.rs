//! Process table sampling
//!
//! CPU usage of a process only means something over a window, so a collection
//! refreshes the table three times:
//! - prime: every process gets a CPU accounting baseline
//! - after the settle delay: processes that survived are re-read
//! - after the measurement window: CPU% over that window plus resident memory
//!
//! Processes that exit or turn zombie in between are dropped. sysinfo leaves
//! out processes it cannot read at all.

use serde::Serialize;
use std::time::Duration;
use sysinfo::{ProcessStatus, System};
use tracing::{debug, trace};

use crate::error::SampleError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One process as shipped to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
}

/// Where process data comes from. `refresh` re-reads the OS table;
/// `processes` reports the state as of the last refresh.
pub trait ProcessTable: Send {
    fn refresh(&mut self);
    fn processes(&self) -> Vec<Result<ProcessSample, SampleError>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerTimings {
    pub settle: Duration,
    pub window: Duration,
}

impl Default for SamplerTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            window: Duration::from_millis(200),
        }
    }
}

pub struct SysinfoTable {
    sys: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn refresh(&mut self) {
        self.sys.refresh_processes();
    }

    fn processes(&self) -> Vec<Result<ProcessSample, SampleError>> {
        self.sys
            .processes()
            .values()
            .map(|p| -> Result<ProcessSample, SampleError> {
                check_status(p.status())?;
                Ok(ProcessSample {
                    pid: p.pid().as_u32(),
                    ppid: p.parent().map(|pp| pp.as_u32()).unwrap_or(0),
                    name: display_name(p.name()),
                    cpu_percent: Some(p.cpu_usage()),
                    memory_mb: Some(p.memory() as f64 / BYTES_PER_MB),
                })
            })
            .collect()
    }
}

fn check_status(status: ProcessStatus) -> Result<(), SampleError> {
    match status {
        ProcessStatus::Zombie => Err(SampleError::Zombie),
        ProcessStatus::Dead => Err(SampleError::Vanished),
        _ => Ok(()),
    }
}

fn display_name(raw: &str) -> String {
    if raw.is_empty() {
        "unknown".to_string()
    } else {
        raw.to_string()
    }
}

pub struct Sampler<T = SysinfoTable> {
    table: T,
    timings: SamplerTimings,
}

impl Sampler<SysinfoTable> {
    /// Sampler over the real OS process table with the standard delays.
    pub fn system() -> Self {
        Self::new(SysinfoTable::new(), SamplerTimings::default())
    }
}

impl<T: ProcessTable> Sampler<T> {
    pub fn new(table: T, timings: SamplerTimings) -> Self {
        Self { table, timings }
    }

    /// Takes one snapshot of the process table. Never fails; unreadable
    /// processes are simply missing from the result.
    pub async fn collect(&mut self) -> Vec<ProcessSample> {
        self.table.refresh();
        tokio::time::sleep(self.timings.settle).await;

        self.table.refresh();
        tokio::time::sleep(self.timings.window).await;
        self.table.refresh();

        let mut skipped = 0usize;
        let samples: Vec<ProcessSample> = self
            .table
            .processes()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(sample) => Some(sample),
                Err(reason) => {
                    trace!(%reason, "Process skipped");
                    skipped += 1;
                    None
                }
            })
            .collect();

        debug!(processes = samples.len(), skipped, "Process table sampled");
        samples
    }
}
