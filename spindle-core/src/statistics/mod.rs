//! Timing samples gathered by workers and submitters.
//!
//! Workers record how long they waited for a task and its inputs (transfer)
//! and how long the operation ran (process), keyed by worker name.
//! Submitters record how long caching and enqueueing took, keyed by their
//! source id. The totals are diagnostic only: concurrent updates may race
//! with a snapshot, and a snapshot may show an entry before its first sample
//! landed.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Sink and snapshot source for timing samples.
#[async_trait]
pub trait Statistics: Send + Sync {
    async fn add_transfer_time(&self, name: &str, elapsed: Duration) -> Result<()>;

    async fn add_process_time(&self, name: &str, elapsed: Duration) -> Result<()>;

    async fn add_queueing_time(&self, name: &str, elapsed: Duration) -> Result<()>;

    /// Render every entry, one per line.
    async fn get_stats(&self) -> Result<String>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleKind {
    Process,
    Queue,
}

/// Running totals for one worker or queue.
#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    pub kind: SampleKind,
    pub transfer_time: Duration,
    pub transfer_count: u32,
    pub process_time: Duration,
    pub process_count: u32,
}

impl Sample {
    fn new(name: &str, kind: SampleKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            transfer_time: Duration::ZERO,
            transfer_count: 0,
            process_time: Duration::ZERO,
            process_count: 0,
        }
    }
}

fn average(total: Duration, count: u32) -> Option<f64> {
    (count > 0).then(|| total.as_secs_f64() / f64::from(count))
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transfer = average(self.transfer_time, self.transfer_count);
        match self.kind {
            SampleKind::Queue => match transfer {
                Some(avg) => write!(
                    f,
                    "Queue {}: {avg:.6} ({:.6}/{})",
                    self.name,
                    self.transfer_time.as_secs_f64(),
                    self.transfer_count
                ),
                None => write!(f, "Queue {}: not ready", self.name),
            },
            SampleKind::Process => {
                match (transfer, average(self.process_time, self.process_count)) {
                    (Some(transfer_avg), Some(process_avg)) => write!(
                        f,
                        "Process {}: {transfer_avg:.6} ({:.6}/{}) - {process_avg:.6} ({:.6}/{})",
                        self.name,
                        self.transfer_time.as_secs_f64(),
                        self.transfer_count,
                        self.process_time.as_secs_f64(),
                        self.process_count
                    ),
                    _ => write!(f, "Process {}: not ready", self.name),
                }
            }
        }
    }
}

/// The manager-owned [`Statistics`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryStatistics {
    processes: Arc<DashMap<String, Sample>>,
    queues: Arc<DashMap<String, Sample>>,
}

impl InMemoryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        map: &DashMap<String, Sample>,
        name: &str,
        kind: SampleKind,
        f: impl FnOnce(&mut Sample),
    ) {
        let mut entry = map
            .entry(name.to_string())
            .or_insert_with(|| Sample::new(name, kind));
        f(entry.value_mut());
    }

    /// Copy of the current entry for `name`, if any.
    pub fn sample(&self, name: &str) -> Option<Sample> {
        self.processes
            .get(name)
            .or_else(|| self.queues.get(name))
            .map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> String {
        let mut lines: Vec<String> = self
            .processes
            .iter()
            .chain(self.queues.iter())
            .map(|entry| entry.value().to_string())
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

#[async_trait]
impl Statistics for InMemoryStatistics {
    async fn add_transfer_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        Self::update(&self.processes, name, SampleKind::Process, |sample| {
            sample.transfer_count += 1;
            sample.transfer_time += elapsed;
        });
        Ok(())
    }

    async fn add_process_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        Self::update(&self.processes, name, SampleKind::Process, |sample| {
            sample.process_count += 1;
            sample.process_time += elapsed;
        });
        Ok(())
    }

    async fn add_queueing_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        Self::update(&self.queues, name, SampleKind::Queue, |sample| {
            sample.transfer_count += 1;
            sample.transfer_time += elapsed;
        });
        Ok(())
    }

    async fn get_stats(&self) -> Result<String> {
        Ok(self.snapshot())
    }
}
