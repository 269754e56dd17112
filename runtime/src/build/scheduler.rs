//! Stage scheduler.
//!
//! Runs the selected stages of a `BuildGraph` as soon as their dependencies
//! have completed, up to `max_parallel` at a time, one task per stage. The
//! first failure cancels everything still running or pending and becomes the
//! build's error.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use stagecraft_core::error::{BuildError, Result};
use stagecraft_core::event::{events, BuildEvent, EventEmitter};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

use super::graph::StageId;
use super::resolve::BuildGraph;

/// Execution state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Aborted or never started because another stage failed
    Cancelled,
    /// Not needed for the requested target
    Skipped,
}

/// Outputs of the completed stages a stage depends on.
#[derive(Debug)]
pub struct StageInputs<T> {
    completed: BTreeMap<StageId, Arc<T>>,
}

impl<T> StageInputs<T> {
    pub fn get(&self, id: StageId) -> Option<&Arc<T>> {
        self.completed.get(&id)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

/// Executes one stage.
#[async_trait]
pub trait StageRunner: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Run `stage`. `inputs` holds every direct dependency, all Completed.
    async fn run_stage(&self, stage: StageId, inputs: StageInputs<Self::Output>) -> Result<Self::Output>;
}

/// Outputs of a successful run, by stage.
pub type StageOutputs<T> = BTreeMap<StageId, Arc<T>>;

type StageTask<T> = JoinHandle<(StageId, Result<T>)>;

/// Dependency-ordered, bounded-parallel stage scheduler.
#[derive(Debug)]
pub struct Scheduler {
    max_parallel: usize,
    events: EventEmitter,
    states: Mutex<BTreeMap<StageId, StageState>>,
}

impl Scheduler {
    pub fn new(max_parallel: usize, events: EventEmitter) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            events,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// State of every stage as of now.
    pub fn states(&self) -> BTreeMap<StageId, StageState> {
        self.states.lock().clone()
    }

    pub fn state(&self, id: StageId) -> Option<StageState> {
        self.states.lock().get(&id).copied()
    }

    /// Run every stage in `selected`. Each selected stage's dependencies must
    /// also be selected.
    pub async fn run<R: StageRunner>(
        &self,
        graph: &BuildGraph,
        selected: &BTreeSet<StageId>,
        runner: Arc<R>,
    ) -> Result<StageOutputs<R::Output>> {
        let mut waiting: HashMap<StageId, usize> = HashMap::new();
        for &id in selected {
            let deps = graph.dependencies(id);
            if let Some(missing) = deps.iter().find(|d| !selected.contains(d)) {
                return Err(BuildError::Other(format!(
                    "stage {} depends on unscheduled stage {}",
                    graph.label(id),
                    graph.label(*missing)
                )));
            }
            waiting.insert(id, deps.len());
        }

        {
            let mut states = self.states.lock();
            states.clear();
            for stage in graph.stages() {
                let state = if selected.contains(&stage.id) {
                    StageState::Pending
                } else {
                    StageState::Skipped
                };
                states.insert(stage.id, state);
            }
        }
        for stage in graph.stages().iter().filter(|s| !selected.contains(&s.id)) {
            tracing::debug!(stage = %stage.label(), "Stage not needed, skipping");
            self.events.emit(BuildEvent::with_fields(
                events::STAGE_SKIPPED,
                [
                    ("stage", serde_json::json!(stage.label())),
                    ("index", serde_json::json!(stage.id.index())),
                ],
            ));
        }

        let mut ready: VecDeque<StageId> = selected
            .iter()
            .copied()
            .filter(|id| waiting.get(id) == Some(&0))
            .collect();
        let mut outputs: StageOutputs<R::Output> = BTreeMap::new();
        let mut active: FuturesUnordered<StageTask<R::Output>> = FuturesUnordered::new();
        let mut handles: HashMap<StageId, AbortHandle> = HashMap::new();
        let mut started: HashMap<StageId, Instant> = HashMap::new();

        while outputs.len() < selected.len() {
            while active.len() < self.max_parallel {
                let Some(id) = ready.pop_front() else { break };
                let task = self.spawn_stage(graph, id, &outputs, runner.clone());
                handles.insert(id, task.abort_handle());
                started.insert(id, Instant::now());
                active.push(task);
            }

            let Some(joined) = active.next().await else {
                let pending: Vec<String> = selected
                    .iter()
                    .filter(|id| !outputs.contains_key(id))
                    .map(|id| graph.label(*id))
                    .collect();
                return Err(BuildError::Other(format!(
                    "scheduler stalled; remaining stages: {}",
                    pending.join(", ")
                )));
            };

            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    self.cancel_all(graph, &mut active, &handles).await;
                    return Err(BuildError::Other(format!("Stage task join error: {}", e)));
                }
            };
            handles.remove(&id);
            let duration_ms = started
                .get(&id)
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or_default();
            let label = graph.label(id);

            match result {
                Ok(output) => {
                    self.set_state(id, StageState::Completed);
                    tracing::info!(stage = %label, duration_ms, "Stage completed");
                    self.events.emit(BuildEvent::with_fields(
                        events::STAGE_COMPLETED,
                        [
                            ("stage", serde_json::json!(label)),
                            ("index", serde_json::json!(id.index())),
                            ("duration_ms", serde_json::json!(duration_ms)),
                        ],
                    ));
                    outputs.insert(id, Arc::new(output));

                    for dependent in graph.dependents(id) {
                        if let Some(count) = waiting.get_mut(&dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
                Err(e) => {
                    self.set_state(id, StageState::Failed);
                    tracing::error!(stage = %label, error = %e, "Stage failed");
                    self.events.emit(BuildEvent::with_fields(
                        events::STAGE_FAILED,
                        [
                            ("stage", serde_json::json!(label)),
                            ("index", serde_json::json!(id.index())),
                            ("error", serde_json::json!(e.to_string())),
                            ("duration_ms", serde_json::json!(duration_ms)),
                        ],
                    ));
                    self.cancel_all(graph, &mut active, &handles).await;
                    return Err(e);
                }
            }
        }

        Ok(outputs)
    }

    fn spawn_stage<R: StageRunner>(
        &self,
        graph: &BuildGraph,
        id: StageId,
        outputs: &StageOutputs<R::Output>,
        runner: Arc<R>,
    ) -> StageTask<R::Output> {
        let label = graph.label(id);
        let inputs = StageInputs {
            completed: graph
                .dependencies(id)
                .iter()
                .filter_map(|dep| outputs.get(dep).map(|out| (*dep, out.clone())))
                .collect(),
        };

        self.set_state(id, StageState::Running);
        tracing::info!(stage = %label, "Stage started");
        self.events.emit(BuildEvent::with_fields(
            events::STAGE_STARTED,
            [
                ("stage", serde_json::json!(label)),
                ("index", serde_json::json!(id.index())),
            ],
        ));

        let span = tracing::info_span!("stage", stage = %label, index = id.index());
        tokio::spawn(
            async move {
                let result = AssertUnwindSafe(runner.run_stage(id, inputs))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(BuildError::Other(format!("stage {} panicked", label)))
                    });
                (id, result)
            }
            .instrument(span),
        )
    }

    /// Abort running stages, wait for them to stop, and mark everything not
    /// yet finished as cancelled. A stage that finished before the abort took
    /// effect keeps its real outcome.
    async fn cancel_all<T>(
        &self,
        graph: &BuildGraph,
        active: &mut FuturesUnordered<StageTask<T>>,
        handles: &HashMap<StageId, AbortHandle>,
    ) {
        for handle in handles.values() {
            handle.abort();
        }
        while let Some(joined) = active.next().await {
            let Ok((id, result)) = joined else { continue };
            let label = graph.label(id);
            match result {
                Ok(_) => {
                    self.set_state(id, StageState::Completed);
                    tracing::debug!(stage = %label, "Stage finished while cancelling");
                }
                Err(e) => {
                    self.set_state(id, StageState::Failed);
                    tracing::debug!(stage = %label, error = %e, "Stage failed while cancelling");
                }
            }
        }

        let cancelled: Vec<StageId> = {
            let mut states = self.states.lock();
            states
                .iter_mut()
                .filter(|(_, s)| matches!(s, StageState::Pending | StageState::Running))
                .map(|(id, s)| {
                    *s = StageState::Cancelled;
                    *id
                })
                .collect()
        };
        for id in cancelled {
            let label = graph.label(id);
            tracing::warn!(stage = %label, "Stage cancelled");
            self.events.emit(BuildEvent::with_fields(
                events::STAGE_CANCELLED,
                [
                    ("stage", serde_json::json!(label)),
                    ("index", serde_json::json!(id.index())),
                ],
            ));
        }
    }

    fn set_state(&self, id: StageId, state: StageState) {
        self.states.lock().insert(id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::dockerfile::Dockerfile;
    use crate::build::graph::StageGraph;
    use std::time::Duration;

    fn graph(content: &str) -> BuildGraph {
        let df = Dockerfile::parse(content).unwrap();
        BuildGraph::resolve(StageGraph::build(&df, &HashMap::new()).unwrap()).unwrap()
    }

    fn all(graph: &BuildGraph) -> BTreeSet<StageId> {
        graph.stages().iter().map(|s| s.id).collect()
    }

    /// Records start/finish order; output is the stage index plus the sum of
    /// its inputs.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        fail: Option<StageId>,
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl StageRunner for Recorder {
        type Output = usize;

        async fn run_stage(&self, stage: StageId, inputs: StageInputs<usize>) -> Result<usize> {
            use std::sync::atomic::Ordering;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().push(format!("start {}", stage.index()));

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail == Some(stage) {
                return Err(BuildError::InstructionExecution {
                    stage: stage.to_string(),
                    instruction: "RUN false".to_string(),
                    message: "exit code 1".to_string(),
                });
            }
            self.log.lock().push(format!("finish {}", stage.index()));
            Ok(stage.index() + inputs.completed.values().map(|v| **v).sum::<usize>())
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[tokio::test]
    async fn test_dependency_order() {
        let g = graph("FROM scratch AS a\nFROM scratch AS b\nCOPY --from=a /x /x\nFROM b");
        let runner = Arc::new(Recorder::default());
        let scheduler = Scheduler::new(4, EventEmitter::default());

        let outputs = scheduler.run(&g, &all(&g), runner.clone()).await.unwrap();

        let log = runner.log.lock().clone();
        assert!(position(&log, "finish 0") < position(&log, "start 1"));
        assert!(position(&log, "finish 1") < position(&log, "start 2"));
        assert_eq!(*outputs[&StageId(2)], 3);
        assert!(scheduler
            .states()
            .values()
            .all(|s| *s == StageState::Completed));
    }

    #[tokio::test]
    async fn test_independent_stages_run_concurrently() {
        let g = graph("FROM scratch AS a\nFROM scratch AS b\nFROM scratch AS c");
        let runner = Arc::new(Recorder::default());
        Scheduler::new(4, EventEmitter::default())
            .run(&g, &all(&g), runner.clone())
            .await
            .unwrap();
        assert_eq!(runner.peak.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parallelism_limit() {
        let g = graph("FROM scratch AS a\nFROM scratch AS b\nFROM scratch AS c");
        let runner = Arc::new(Recorder::default());
        Scheduler::new(1, EventEmitter::default())
            .run(&g, &all(&g), runner.clone())
            .await
            .unwrap();
        assert_eq!(runner.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_never_starts_dependents() {
        let g = graph("FROM scratch AS a\nFROM a AS b\nFROM scratch AS c");
        let runner = Arc::new(Recorder {
            fail: Some(StageId(0)),
            ..Default::default()
        });
        let scheduler = Scheduler::new(1, EventEmitter::default());
        let mut rx = scheduler.events.subscribe();

        let err = scheduler.run(&g, &all(&g), runner.clone()).await.unwrap_err();

        assert!(matches!(err, BuildError::InstructionExecution { .. }));
        let log = runner.log.lock().clone();
        assert!(!log.contains(&"start 1".to_string()));
        assert_eq!(scheduler.state(StageId(0)), Some(StageState::Failed));
        assert_eq!(scheduler.state(StageId(1)), Some(StageState::Cancelled));

        let mut keys = Vec::new();
        while let Ok(event) = rx.try_recv() {
            keys.push(event.key);
        }
        assert!(keys.contains(&events::STAGE_FAILED.to_string()));
        assert!(keys.contains(&events::STAGE_CANCELLED.to_string()));
    }

    /// Stage 1 finishes without yielding, so an abort issued while it runs
    /// cannot stop it.
    struct Uninterruptible;

    #[async_trait]
    impl StageRunner for Uninterruptible {
        type Output = ();

        async fn run_stage(&self, stage: StageId, _inputs: StageInputs<()>) -> Result<()> {
            if stage == StageId(0) {
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(BuildError::Other("boom".to_string()));
            }
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stage_finishing_during_cancel_is_completed() {
        let g = graph("FROM scratch AS a\nFROM scratch AS b\nFROM a\nCOPY --from=b /x /x");
        let scheduler = Scheduler::new(2, EventEmitter::default());

        let err = scheduler
            .run(&g, &all(&g), Arc::new(Uninterruptible))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(scheduler.state(StageId(0)), Some(StageState::Failed));
        assert_eq!(scheduler.state(StageId(1)), Some(StageState::Completed));
        assert_eq!(scheduler.state(StageId(2)), Some(StageState::Cancelled));
    }

    #[tokio::test]
    async fn test_only_selected_stages_run() {
        let g = graph("FROM scratch AS a\nFROM scratch AS unused\nFROM a");
        let selected = g.closure(g.last_stage());
        let runner = Arc::new(Recorder::default());
        let scheduler = Scheduler::new(2, EventEmitter::default());

        let outputs = scheduler.run(&g, &selected, runner.clone()).await.unwrap();

        assert!(!outputs.contains_key(&StageId(1)));
        assert_eq!(scheduler.state(StageId(1)), Some(StageState::Skipped));
        assert!(!runner.log.lock().contains(&"start 1".to_string()));
    }

    #[tokio::test]
    async fn test_rejects_incomplete_selection() {
        let g = graph("FROM scratch AS a\nFROM a");
        let selected = BTreeSet::from([StageId(1)]);
        let err = Scheduler::new(1, EventEmitter::default())
            .run(&g, &selected, Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unscheduled"));
    }
}
