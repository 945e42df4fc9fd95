//! Multi-threaded aggregation driver.
//!
//! Input files sit in a shared queue; each worker thread pops one file at a
//! time and folds it into its own [`Aggregator`]. No table is ever shared
//! between threads while aggregating. A coordinator thread joins the workers
//! and merges their tables, either fully or with the threshold top-K merge.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipfix::element::Registry;
use crate::ipfix::provider::{FlowFilter, FlowProvider};
use crate::ipfix::reader::count_records;

use super::channel::Channel;
use super::threshold::ThresholdAlgorithm;
use super::view::View;
use super::Aggregator;

/// Records processed between two cancellation checks.
const CANCEL_CHECK_INTERVAL: u32 = 4096;

/// Capacity of the state notification channel. Larger than the number of
/// transitions of a run, so publishing never blocks.
const NOTIFICATION_CAPACITY: usize = 16;

/// Lifecycle of a threaded aggregation run.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    None = 0,
    Started = 1,
    Aggregating = 2,
    Sorting = 3,
    Merging = 4,
    Finished = 5,
    Errored = 6,
}

impl AggregatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Started,
            2 => Self::Aggregating,
            3 => Self::Sorting,
            4 => Self::Merging,
            5 => Self::Finished,
            6 => Self::Errored,
            _ => Self::None,
        }
    }

    /// True for `Finished` and `Errored`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored)
    }
}

/// Options of a threaded aggregation run.
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// Worker thread count (minimum 1).
    pub threads: usize,
    /// Merge per-thread tables into one result.
    pub merge_results: bool,
    /// Keep only the best N merged records via threshold merge; 0 merges all.
    pub merge_topk: usize,
    /// Drop biflow halves without octets and packets.
    pub biflow_autoignore: bool,
    /// Record filter applied before aggregation.
    pub filter: Option<FlowFilter>,
    /// Row limit per table for the threshold merge.
    pub max_rows: Option<usize>,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            merge_results: true,
            merge_topk: 0,
            biflow_autoignore: true,
            filter: None,
            max_rows: None,
        }
    }
}

// --- Shared state ---

#[derive(Default)]
struct WorkerStats {
    processed_flows: AtomicU64,
    processed_files: AtomicU64,
}

struct Shared {
    files: Mutex<VecDeque<PathBuf>>,
    workers: Vec<WorkerStats>,
    total_files: usize,
    total_flows: AtomicU64,
    state: AtomicU8,
    cancel: CancellationToken,
    notifications: Channel<AggregatorState>,
}

impl Shared {
    fn set_state(&self, state: AggregatorState) {
        self.state.store(state as u8, Ordering::Relaxed);
        if self.notifications.put(state).is_err() {
            debug!(?state, "notification channel closed");
        }
    }

    fn state(&self) -> AggregatorState {
        AggregatorState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

/// Result of a finished run.
pub struct AggregationOutput {
    view: View,
    tables: Vec<Aggregator>,
    merged: Option<Aggregator>,
}

impl AggregationOutput {
    pub fn view(&self) -> &View {
        &self.view
    }

    /// Maximum number of records to output per table.
    pub fn limit(&self) -> usize {
        self.view.output_limit().unwrap_or(usize::MAX)
    }

    pub fn is_merged(&self) -> bool {
        self.merged.is_some()
    }

    /// Merged records in output order, limited. Empty for unmerged runs.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.merged
            .iter()
            .flat_map(|m| m.records())
            .take(self.limit())
    }

    /// Per-thread tables of an unmerged run, each sorted when the view has
    /// an order. Empty for merged runs.
    pub fn tables(&self) -> &[Aggregator] {
        &self.tables
    }
}

/// Handle of a running threaded aggregation.
pub struct ThreadedAggregator {
    shared: Arc<Shared>,
    coordinator: Option<JoinHandle<Result<AggregationOutput>>>,
}

impl ThreadedAggregator {
    /// Starts aggregating `files` in the background.
    pub fn start(
        view: View,
        files: Vec<PathBuf>,
        registry: Arc<Registry>,
        options: AggregatorOptions,
    ) -> Result<Self> {
        if options.merge_results && options.merge_topk > 0 && view.order().is_empty() {
            bail!("top-K merge requires an order");
        }

        let threads = options.threads.max(1);
        let shared = Arc::new(Shared {
            total_files: files.len(),
            files: Mutex::new(files.into()),
            workers: (0..threads).map(|_| WorkerStats::default()).collect(),
            total_flows: AtomicU64::new(0),
            state: AtomicU8::new(AggregatorState::None as u8),
            cancel: CancellationToken::new(),
            notifications: Channel::new(NOTIFICATION_CAPACITY),
        });

        let coordinator = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("flowagg-coordinator".into())
                .spawn(move || coordinate(view, registry, options, shared))
                .context("spawning coordinator thread")?
        };

        Ok(Self {
            shared,
            coordinator: Some(coordinator),
        })
    }

    /// Current state.
    pub fn state(&self) -> AggregatorState {
        self.shared.state()
    }

    /// State change notifications, in order.
    pub fn notifications(&self) -> &Channel<AggregatorState> {
        &self.shared.notifications
    }

    /// Records read so far by all workers.
    pub fn processed_flows(&self) -> u64 {
        self.shared
            .workers
            .iter()
            .map(|w| w.processed_flows.load(Ordering::Relaxed))
            .sum()
    }

    /// Records in all input files, as far as they have been counted.
    pub fn total_flows(&self) -> u64 {
        self.shared.total_flows.load(Ordering::Relaxed)
    }

    pub fn processed_files(&self) -> u64 {
        self.shared
            .workers
            .iter()
            .map(|w| w.processed_files.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_files(&self) -> usize {
        self.shared.total_files
    }

    /// Asks every worker to stop at its next check point.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Token tripping [`cancel`](Self::cancel), for signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Waits for the run and returns its output or the first worker error.
    pub fn join(mut self) -> Result<AggregationOutput> {
        let handle = self
            .coordinator
            .take()
            .ok_or_else(|| anyhow!("aggregation already joined"))?;
        let result = handle
            .join()
            .map_err(|payload| anyhow!("coordinator panicked: {}", panic_message(&*payload)))?;
        self.shared.notifications.close();
        result
    }
}

impl Drop for ThreadedAggregator {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            self.shared.cancel.cancel();
            if handle.join().is_err() {
                warn!("coordinator panicked during shutdown");
            }
        }
    }
}

// --- Threads ---

fn coordinate(
    view: View,
    registry: Arc<Registry>,
    options: AggregatorOptions,
    shared: Arc<Shared>,
) -> Result<AggregationOutput> {
    let started = Instant::now();
    shared.set_state(AggregatorState::Started);

    let result = run(view, registry, &options, &shared);
    match &result {
        Ok(output) => {
            shared.set_state(AggregatorState::Finished);
            info!(
                merged = output.is_merged(),
                elapsed = ?started.elapsed(),
                "aggregation finished"
            );
        }
        Err(e) => {
            shared.set_state(AggregatorState::Errored);
            warn!(error = %e, "aggregation failed");
        }
    }
    result
}

fn run(
    view: View,
    registry: Arc<Registry>,
    options: &AggregatorOptions,
    shared: &Arc<Shared>,
) -> Result<AggregationOutput> {
    let threads = shared.workers.len();
    let files: Vec<PathBuf> = shared.files.lock().iter().cloned().collect();
    info!(threads, files = files.len(), "starting aggregation");

    let done = Arc::new(Channel::new(threads));
    let mut handles = Vec::with_capacity(threads);
    for index in 0..threads {
        let worker = Worker {
            index,
            view: view.clone(),
            registry: Arc::clone(&registry),
            options: options.clone(),
            shared: Arc::clone(shared),
            done: Arc::clone(&done),
        };
        let spawned = thread::Builder::new()
            .name(format!("flowagg-worker-{index}"))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => handles.push(Some(handle)),
            Err(e) => {
                shared.cancel.cancel();
                for handle in handles.into_iter().flatten() {
                    let _ = handle.join();
                }
                return Err(e).context("spawning worker thread");
            }
        }
    }
    shared.set_state(AggregatorState::Aggregating);

    // Count while the workers read; only progress reporting needs it.
    for path in &files {
        if shared.cancel.is_cancelled() {
            break;
        }
        match count_records(path) {
            Ok(n) => {
                shared.total_flows.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot count flow records"),
        }
    }

    let mut tables: Vec<Option<Aggregator>> = (0..threads).map(|_| None).collect();
    let mut first_error = None;
    let mut remaining = handles.len();
    while remaining > 0 {
        let Ok(index) = done.get() else {
            break;
        };
        let Some(handle) = handles[index].take() else {
            continue;
        };
        remaining -= 1;

        let outcome = handle
            .join()
            .map_err(|payload| anyhow!("worker {index} panicked: {}", panic_message(&*payload)))
            .and_then(|r| r);
        match outcome {
            Ok(table) => {
                debug!(worker = index, records = table.len(), "worker finished");
                tables[index] = Some(table);
            }
            Err(e) => {
                warn!(worker = index, error = %e, "worker failed");
                if first_error.is_none() {
                    shared.set_state(AggregatorState::Errored);
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    let tables: Vec<Aggregator> = tables.into_iter().flatten().collect();

    if !options.merge_results {
        return Ok(AggregationOutput {
            view,
            tables,
            merged: None,
        });
    }

    shared.set_state(AggregatorState::Merging);
    let merged = if options.merge_topk > 0 {
        let mut algo = ThresholdAlgorithm::new(&tables, &view, options.merge_topk);
        if let Some(max_rows) = options.max_rows {
            algo.set_max_row(max_rows);
        }
        let top = algo.run().context("threshold merge")?;
        shared.set_state(AggregatorState::Sorting);
        top
    } else {
        let mut merged = Aggregator::new(view.clone());
        for table in &tables {
            merged.merge(table).context("merging worker tables")?;
        }
        shared.set_state(AggregatorState::Sorting);
        merged.sort_items();
        merged
    };

    Ok(AggregationOutput {
        view,
        tables: Vec::new(),
        merged: Some(merged),
    })
}

struct Worker {
    index: usize,
    view: View,
    registry: Arc<Registry>,
    options: AggregatorOptions,
    shared: Arc<Shared>,
    done: Arc<Channel<usize>>,
}

/// Reports a worker as done when it returns or unwinds.
struct DoneGuard<'a> {
    index: usize,
    done: &'a Channel<usize>,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        let _ = self.done.put(self.index);
    }
}

impl Worker {
    fn run(self) -> Result<Aggregator> {
        let _guard = DoneGuard {
            index: self.index,
            done: &self.done,
        };
        let stats = &self.shared.workers[self.index];
        let cancel = &self.shared.cancel;

        let mut provider = FlowProvider::new(&self.registry);
        provider.set_biflow_autoignore(self.options.biflow_autoignore);
        if let Some(filter) = &self.options.filter {
            provider.set_filter(filter.clone());
        }

        let mut agg = Aggregator::new(self.view.clone());
        'files: while !cancel.is_cancelled() {
            let Some(path) = self.shared.files.lock().pop_front() else {
                break;
            };
            debug!(worker = self.index, path = %path.display(), "processing file");
            provider.queue_file(&path);

            let mut since_check = 0;
            while let Some(flow) = provider
                .next_record()
                .with_context(|| format!("reading {}", path.display()))?
            {
                agg.process_record(flow)
                    .with_context(|| format!("aggregating {}", path.display()))?;

                since_check += 1;
                if since_check == CANCEL_CHECK_INTERVAL {
                    since_check = 0;
                    stats
                        .processed_flows
                        .store(provider.processed_flows(), Ordering::Relaxed);
                    if cancel.is_cancelled() {
                        break 'files;
                    }
                }
            }

            stats
                .processed_flows
                .store(provider.processed_flows(), Ordering::Relaxed);
            stats.processed_files.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .processed_flows
            .store(provider.processed_flows(), Ordering::Relaxed);

        let merge = self.options.merge_results;
        if !self.view.order().is_empty() && (!merge || self.options.merge_topk > 0) {
            agg.sort_items();
        }
        Ok(agg)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
