use std::sync::Arc;
use std::time::Duration;

use elh_adapters::EpisodeFetcher;
use elh_core::{Record, WorkItemRef};
use elh_storage::CheckpointError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::reconcile::{Applied, Reconciler};

/// In-flight fetches per collection batch. The work is I/O bound.
pub const DEFAULT_CONCURRENCY: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub item_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            item_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub dispatched: usize,
    pub completed: usize,
    pub empty: usize,
    pub timed_out: usize,
    pub crashed: usize,
    pub rejected: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Fate {
    Fetched,
    TimedOut,
    Crashed,
}

#[derive(Debug)]
struct Completion {
    index: usize,
    record: Record,
    fate: Fate,
}

/// Runs fetches for one collection with at most `concurrency` in flight.
///
/// Jobs are dispatched in the order given; completions are handed to the reconciler in
/// whatever order they finish. A failing, hanging or panicking fetch resolves to an empty
/// record for its index and never affects its siblings. `run` returns after every
/// dispatched job has been reconciled, or on the first persist failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        jobs: Vec<(usize, WorkItemRef)>,
        fetcher: Arc<dyn EpisodeFetcher>,
        reconciler: &mut Reconciler,
    ) -> Result<BatchStats, CheckpointError> {
        let cap = self.config.concurrency.max(1);
        let mut stats = BatchStats::default();
        let mut queue = jobs.into_iter();
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.len() < cap {
                let Some((index, reference)) = queue.next() else {
                    break;
                };
                stats.dispatched += 1;
                in_flight.spawn(fetch_one(
                    index,
                    reference,
                    Arc::clone(&fetcher),
                    self.config.item_timeout,
                ));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let completion = match joined {
                Ok(completion) => completion,
                Err(err) => {
                    // fetch_one contains panics itself; only runtime shutdown lands here.
                    error!(collection = %reconciler.key(), error = %err, "fetch task lost");
                    stats.crashed += 1;
                    continue;
                }
            };

            match completion.fate {
                Fate::Fetched => {}
                Fate::TimedOut => stats.timed_out += 1,
                Fate::Crashed => stats.crashed += 1,
            }
            if completion.record.is_complete() {
                stats.completed += 1;
            } else {
                stats.empty += 1;
            }

            if reconciler.apply(completion.index, completion.record).await? == Applied::Rejected {
                stats.rejected += 1;
            }
        }

        info!(
            collection = %reconciler.key(),
            dispatched = stats.dispatched,
            completed = stats.completed,
            empty = stats.empty,
            timed_out = stats.timed_out,
            "batch drained"
        );
        Ok(stats)
    }
}

/// Aborts the wrapped fetch when the batch is cancelled or the fetch times out.
struct AbortOnDrop(JoinHandle<Record>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn fetch_one(
    index: usize,
    reference: WorkItemRef,
    fetcher: Arc<dyn EpisodeFetcher>,
    timeout: Duration,
) -> Completion {
    let url = reference.clone();
    let mut task = AbortOnDrop(tokio::spawn(async move { fetcher.fetch(&reference).await }));

    let (record, fate) = match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(record)) => (record, Fate::Fetched),
        Ok(Err(err)) => {
            error!(index, url = %url, error = %err, "fetch panicked");
            (Record::empty(), Fate::Crashed)
        }
        Err(_) => {
            warn!(index, url = %url, timeout_secs = timeout.as_secs_f64(), "fetch timed out");
            (Record::empty(), Fate::TimedOut)
        }
    };
    Completion {
        index,
        record,
        fate,
    }
}
