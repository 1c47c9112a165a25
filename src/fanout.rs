//! Bounded fan-out of lookup tasks
//!
//! A batch is the Cartesian product of two reference id lists, or a single list whose ids
//! are paired with themselves. Every pair becomes one task; at most `workers` tasks run at once, driven by
//! [`buffer_unordered`](futures::StreamExt::buffer_unordered). Results either stream into
//! the sink as each task finishes or are held until the whole batch is done.

use crate::config::{CollectionMode, FailurePolicy};
use crate::error::{Error, Result};
use crate::sink::RowSink;
use crate::types::{BatchReport, Event, FailedPair, ReferenceId, Row, TaskPair, TaskState};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};

/// Every `(a, b)` with `a` from `outer` and `b` from `inner`, outer-major
pub fn cross_product(outer: &[ReferenceId], inner: &[ReferenceId]) -> Vec<TaskPair> {
    outer
        .iter()
        .flat_map(|&a| inner.iter().map(move |&b| TaskPair::new(a, b)))
        .collect()
}

/// One task per id, the id filling both halves of the pair
pub fn per_id(ids: &[ReferenceId]) -> Vec<TaskPair> {
    ids.iter().map(|&id| TaskPair::new(id, id)).collect()
}

/// Lifecycle state of every task in a batch
///
/// Transitions are forward-only; the board also tracks how many tasks are running and
/// the highest number seen running at once.
pub struct TaskBoard {
    pairs: Vec<TaskPair>,
    states: Vec<AtomicU8>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl TaskBoard {
    /// Board with every task `Pending`
    pub fn new(pairs: Vec<TaskPair>) -> Self {
        let states = pairs
            .iter()
            .map(|_| AtomicU8::new(TaskState::Pending.to_u8()))
            .collect();
        Self {
            pairs,
            states,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the batch has no tasks
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The pair task `index` looks up
    pub fn pair(&self, index: usize) -> Option<TaskPair> {
        self.pairs.get(index).copied()
    }

    /// Current state of task `index` (`Pending` for an unknown index)
    pub fn state(&self, index: usize) -> TaskState {
        self.states
            .get(index)
            .map(|s| TaskState::from_u8(s.load(Ordering::Acquire)))
            .unwrap_or(TaskState::Pending)
    }

    /// Move task `index` to `next`; returns `false` if the transition is not allowed
    pub fn transition(&self, index: usize, next: TaskState) -> bool {
        let Some(slot) = self.states.get(index) else {
            return false;
        };

        let mut current = TaskState::from_u8(slot.load(Ordering::Acquire));
        loop {
            if !current.can_transition_to(next) {
                tracing::debug!(index, from = ?current, to = ?next, "Rejected task transition");
                return false;
            }
            match slot.compare_exchange(
                current.to_u8(),
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = TaskState::from_u8(actual),
            }
        }

        if next == TaskState::Running {
            let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
            self.peak.fetch_max(now, Ordering::AcqRel);
        } else if current == TaskState::Running {
            self.running.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    /// Tasks currently running
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Highest number of tasks observed running at once
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Number of tasks in `state`
    pub fn count(&self, state: TaskState) -> usize {
        self.states
            .iter()
            .filter(|s| TaskState::from_u8(s.load(Ordering::Acquire)) == state)
            .count()
    }
}

/// Terminal outcome of one task, in completion order
enum Outcome {
    Succeeded,
    Failed(TaskPair, Error),
    Skipped,
}

/// Bounded worker pool for one run
pub struct FanOut {
    workers: usize,
    events: broadcast::Sender<Event>,
}

impl FanOut {
    /// Pool of `workers` concurrent tasks publishing progress on `events`
    pub fn new(workers: usize, events: broadcast::Sender<Event>) -> Self {
        Self {
            workers: workers.max(1),
            events,
        }
    }

    /// Maximum concurrent tasks
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `fetch` for every pair and hand the rows to `sink`
    ///
    /// With [`FailurePolicy::FailFast`] the first failure stops further dispatch, tasks
    /// already running finish, and the failure is returned as [`Error::Task`]; in
    /// [`CollectionMode::Buffer`] nothing is written in that case. With
    /// [`FailurePolicy::BestEffort`] failures are listed in the report.
    ///
    /// A fatal error (see [`Error::is_fatal`]) halts dispatch under either policy and is
    /// returned unwrapped, so a rejected re-login keeps its `Authentication` kind.
    ///
    /// The sink is not finished here.
    pub async fn run<F, Fut>(
        &self,
        job: &str,
        pairs: Vec<TaskPair>,
        fetch: F,
        sink: &dyn RowSink,
        mode: CollectionMode,
        policy: FailurePolicy,
    ) -> Result<BatchReport>
    where
        F: Fn(TaskPair) -> Fut,
        Fut: Future<Output = Result<Vec<Row>>>,
    {
        let started_at = chrono::Utc::now();
        let board = TaskBoard::new(pairs);
        let total = board.len();
        let halted = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);
        let rows_written = AtomicU64::new(0);
        let buffered: Mutex<Vec<Row>> = Mutex::new(Vec::new());

        tracing::info!(job, total, workers = self.workers, ?mode, ?policy, "Starting batch");
        self.emit(Event::BatchStarted {
            job: job.to_string(),
            total,
        });

        let outcomes: Vec<Outcome> = {
            let (board, halted, completed, rows_written, buffered, fetch) = (
                &board,
                &halted,
                &completed,
                &rows_written,
                &buffered,
                &fetch,
            );
            stream::iter(0..total)
                .map(|index| async move {
                    let Some(pair) = board.pair(index) else {
                        return Outcome::Skipped;
                    };
                    if halted.load(Ordering::Acquire) {
                        board.transition(index, TaskState::Skipped);
                        return Outcome::Skipped;
                    }
                    board.transition(index, TaskState::Running);

                    let result = match fetch(pair).await {
                        Ok(rows) => match mode {
                            CollectionMode::Stream => sink
                                .write_rows(&rows)
                                .await
                                .map(|written| (rows.len(), written))
                                .map_err(|e| write_failure(sink, e)),
                            CollectionMode::Buffer => {
                                let count = rows.len();
                                buffered.lock().await.extend(rows);
                                Ok((count, 0))
                            }
                        },
                        Err(e) => Err(e),
                    };

                    match result {
                        Ok((rows, written)) => {
                            board.transition(index, TaskState::Succeeded);
                            rows_written.fetch_add(written, Ordering::AcqRel);
                            let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                            tracing::debug!(pair = %pair, rows, done, total, "Task succeeded");
                            self.emit(Event::TaskCompleted {
                                pair,
                                rows,
                                completed: done,
                                total,
                            });
                            Outcome::Succeeded
                        }
                        Err(e) => {
                            board.transition(index, TaskState::Failed);
                            if policy == FailurePolicy::FailFast || e.is_fatal() {
                                halted.store(true, Ordering::Release);
                            }
                            let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                            tracing::warn!(
                                pair = %pair,
                                kind = %e.kind(),
                                error = %e,
                                "Task failed"
                            );
                            self.emit(Event::TaskFailed {
                                pair,
                                kind: e.kind(),
                                error: e.to_string(),
                                completed: done,
                                total,
                            });
                            Outcome::Failed(pair, e)
                        }
                    }
                })
                .buffer_unordered(self.workers)
                .collect()
                .await
        };

        let mut failures: Vec<(TaskPair, Error)> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Outcome::Failed(pair, e) => Some((pair, e)),
                Outcome::Succeeded | Outcome::Skipped => None,
            })
            .collect();

        // A fatal error ends the run under either policy and is returned as is
        if let Some(position) = failures.iter().position(|(_, e)| e.is_fatal()) {
            let (pair, fatal) = failures.swap_remove(position);
            tracing::error!(
                job,
                pair = %pair,
                kind = %fatal.kind(),
                skipped = board.count(TaskState::Skipped),
                "Batch halted on fatal error"
            );
            self.emit(Event::BatchFinished {
                job: job.to_string(),
                succeeded: board.count(TaskState::Succeeded),
                failed: board.count(TaskState::Failed),
                rows_written: rows_written.load(Ordering::Acquire),
            });
            return Err(fatal);
        }

        if policy == FailurePolicy::FailFast && !failures.is_empty() {
            let (pair, source) = failures.remove(0);
            tracing::error!(
                job,
                pair = %pair,
                skipped = board.count(TaskState::Skipped),
                "Batch halted on first failure"
            );
            self.emit(Event::BatchFinished {
                job: job.to_string(),
                succeeded: board.count(TaskState::Succeeded),
                failed: board.count(TaskState::Failed),
                rows_written: rows_written.load(Ordering::Acquire),
            });
            return Err(Error::Task {
                pair,
                source: Box::new(source),
            });
        }

        if mode == CollectionMode::Buffer {
            let rows = buffered.into_inner();
            let written = sink
                .write_rows(&rows)
                .await
                .map_err(|e| write_failure(sink, e))?;
            rows_written.fetch_add(written, Ordering::AcqRel);
        }

        let report = BatchReport {
            job: job.to_string(),
            total,
            succeeded: board.count(TaskState::Succeeded),
            failed: failures
                .iter()
                .map(|(pair, e)| FailedPair {
                    pair: *pair,
                    kind: e.kind(),
                    message: e.to_string(),
                })
                .collect(),
            skipped: board.count(TaskState::Skipped),
            rows_written: rows_written.load(Ordering::Acquire),
            peak_running: board.peak_running(),
            started_at,
            finished_at: chrono::Utc::now(),
        };

        tracing::info!(
            job,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            rows = report.rows_written,
            peak_running = report.peak_running,
            "Batch finished"
        );
        self.emit(Event::BatchFinished {
            job: job.to_string(),
            succeeded: report.succeeded,
            failed: report.failed.len(),
            rows_written: report.rows_written,
        });

        Ok(report)
    }

    fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.events.send(event).ok();
    }
}

fn write_failure(sink: &dyn RowSink, e: Error) -> Error {
    match e {
        Error::Write { .. } => e,
        other => Error::write(sink.name(), other),
    }
}
