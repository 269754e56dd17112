//! Build engine for multi-stage image builds.
//!
//! Parses the build file, resolves stage references into a dependency graph,
//! schedules the stages the target needs, prunes intermediate stages and
//! hands the final image to the exporter.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use stagecraft_core::config::EngineConfig;
use stagecraft_core::error::{BuildError, Result};
use stagecraft_core::event::{events, BuildEvent, EventEmitter};

use super::artifacts::{ArtifactManager, CompletedStage, PruneReport, StageBase, StageWorkspace};
use super::copy::{copy_into, make_dir, replicate, resolve_path};
use super::dockerfile::{expand_vars, Dockerfile, Instruction};
use super::executor::{ExecContext, InstructionExecutor};
use super::export::{format_size, ImageExporter};
use super::fetch::{FetchCache, FetchedImage, ImageSource};
use super::graph::{StageGraph, StageId};
use super::layer::{create_layer, Changes, DirSnapshot, LayerBlob};
use super::resolve::{Action, BaseSource, BuildGraph, CopySource, CopyStep, Step};
use super::scheduler::{Scheduler, StageInputs, StageRunner, StageState};
use crate::oci::ImageReference;

/// Reference used when no tag is given.
pub const DEFAULT_REFERENCE: &str = "stagecraft-build:latest";

/// Configuration for a build operation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Path to the build context directory
    pub context_dir: PathBuf,
    /// Path to the build file (relative to context or absolute)
    pub dockerfile_path: PathBuf,
    /// Image tag (e.g., "myimage:latest")
    pub tag: Option<String>,
    /// Build arguments (ARG overrides)
    pub build_args: HashMap<String, String>,
    /// Stage to build, by name or index. Defaults to the last stage.
    pub target: Option<String>,
    pub engine: EngineConfig,
}

impl BuildConfig {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            dockerfile_path: PathBuf::from("Dockerfile"),
            tag: None,
            build_args: HashMap::new(),
            target: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildResult {
    /// Image reference the image was exported under
    pub reference: String,
    /// Manifest digest
    pub digest: String,
    /// Total image size in bytes
    pub size: u64,
    pub layer_count: usize,
    /// Label of the stage that became the image
    pub final_stage: String,
    /// Labels of the final stage and every stage it depends on
    pub lineage: Vec<String>,
    pub prune: PruneReport,
    /// Final state of every declared stage
    pub states: BTreeMap<StageId, StageState>,
    pub path: PathBuf,
}

/// A resolved build: the graph, the stage that becomes the image, and the
/// stages that will run.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub graph: BuildGraph,
    pub final_stage: StageId,
    pub scheduled: BTreeSet<StageId>,
}

impl BuildPlan {
    /// Parse, build and resolve `content`, then select the stages to run.
    pub fn new(content: &str, config: &BuildConfig) -> Result<Self> {
        let dockerfile = Dockerfile::parse(content)?;
        let graph = BuildGraph::resolve(StageGraph::build(&dockerfile, &config.build_args)?)?;

        let final_stage = match &config.target {
            Some(target) => graph.find_stage(target).ok_or_else(|| {
                BuildError::ConfigError(format!("target stage '{}' not found", target))
            })?,
            None => graph.last_stage(),
        };

        let scheduled = if config.engine.scheduler.skip_unused_stages {
            graph.closure(final_stage)
        } else {
            (0..=final_stage.index()).map(StageId).collect()
        };

        Ok(Self {
            graph,
            final_stage,
            scheduled,
        })
    }
}

/// Multi-stage build engine.
pub struct BuildEngine {
    images: Arc<dyn ImageSource>,
    executor: Arc<dyn InstructionExecutor>,
    exporter: Arc<dyn ImageExporter>,
    events: EventEmitter,
}

impl BuildEngine {
    pub fn new(
        images: Arc<dyn ImageSource>,
        executor: Arc<dyn InstructionExecutor>,
        exporter: Arc<dyn ImageExporter>,
    ) -> Self {
        Self {
            images,
            executor,
            exporter,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Build from the build file named in `config`.
    pub async fn build(&self, config: &BuildConfig) -> Result<BuildResult> {
        let path = dockerfile_location(config);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            BuildError::ConfigError(format!(
                "Failed to read build file at {}: {}",
                path.display(),
                e
            ))
        })?;
        self.build_from_str(&content, config).await
    }

    /// Build from build file text.
    pub async fn build_from_str(&self, content: &str, config: &BuildConfig) -> Result<BuildResult> {
        let started = Instant::now();
        self.events.emit(BuildEvent::with_fields(
            events::BUILD_STARTED,
            [("context", serde_json::json!(config.context_dir.display().to_string()))],
        ));

        match self.run(content, config).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    reference = %result.reference,
                    digest = %result.digest,
                    layers = result.layer_count,
                    duration_ms,
                    "Build completed"
                );
                self.events.emit(BuildEvent::with_fields(
                    events::BUILD_COMPLETED,
                    [
                        ("reference", serde_json::json!(result.reference)),
                        ("digest", serde_json::json!(result.digest)),
                        ("duration_ms", serde_json::json!(duration_ms)),
                    ],
                ));
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, "Build failed");
                self.events.emit(BuildEvent::with_fields(
                    events::BUILD_FAILED,
                    [
                        ("error", serde_json::json!(e.to_string())),
                        ("phase", serde_json::json!(e.phase().map(|p| format!("{:?}", p)))),
                        ("stage", serde_json::json!(e.stage())),
                    ],
                ));
                Err(e)
            }
        }
    }

    async fn run(&self, content: &str, config: &BuildConfig) -> Result<BuildResult> {
        let plan = BuildPlan::new(content, config)?;
        let graph = Arc::new(plan.graph);
        tracing::info!(
            stages = graph.len(),
            scheduled = plan.scheduled.len(),
            target = %graph.label(plan.final_stage),
            "Planned build"
        );

        let scratch = Arc::new(
            tempfile::Builder::new()
                .prefix("stagecraft-build-")
                .tempdir()
                .map_err(|e| BuildError::Other(format!("Failed to create build directory: {}", e)))?,
        );
        let artifacts = ArtifactManager::new(scratch.clone(), self.events.clone());
        let fetch = FetchCache::new(
            self.images.clone(),
            scratch,
            config.engine.fetch.cache_images,
        );

        let runner = Arc::new(StageExecutor {
            graph: graph.clone(),
            context_dir: config.context_dir.clone(),
            build_args: config.build_args.clone(),
            artifacts: artifacts.clone(),
            images: fetch,
            executor: self.executor.clone(),
            events: self.events.clone(),
        });
        let scheduler = Scheduler::new(config.engine.scheduler.max_parallel_stages, self.events.clone());
        let completed = scheduler.run(&graph, &plan.scheduled, runner).await?;

        let (image, prune) = artifacts.finalize(&graph, plan.final_stage, completed)?;
        let reference = config.tag.as_deref().unwrap_or(DEFAULT_REFERENCE);
        let exported = self.exporter.export(&image, reference).await?;

        Ok(BuildResult {
            reference: exported.reference,
            digest: exported.digest,
            size: exported.size,
            layer_count: exported.layer_count,
            final_stage: image.label().to_string(),
            lineage: image.lineage().iter().map(|id| graph.label(*id)).collect(),
            prune,
            states: scheduler.states(),
            path: exported.path,
        })
    }
}

impl std::fmt::Debug for BuildEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEngine")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Runs the instructions of one stage.
struct StageExecutor {
    graph: Arc<BuildGraph>,
    context_dir: PathBuf,
    build_args: HashMap<String, String>,
    artifacts: ArtifactManager,
    images: FetchCache,
    executor: Arc<dyn InstructionExecutor>,
    events: EventEmitter,
}

/// Per-stage state that is not part of the image config.
#[derive(Default)]
struct StageScope {
    /// `ARG`s declared in this stage
    args: HashMap<String, String>,
    /// `CMD` was set by this stage
    cmd_set: bool,
}

impl StageScope {
    fn expand(&self, ws: &StageWorkspace, s: &str) -> String {
        expand_vars(s, |key| {
            ws.config
                .env_var(key)
                .map(str::to_string)
                .or_else(|| self.args.get(key).cloned())
        })
    }
}

#[async_trait]
impl StageRunner for StageExecutor {
    type Output = CompletedStage;

    async fn run_stage(&self, id: StageId, inputs: StageInputs<CompletedStage>) -> Result<CompletedStage> {
        let stage = self.graph.stage(id);
        let label = stage.label();
        let arena = self.artifacts.allocate(id)?;

        let base = match &stage.base {
            BaseSource::Scratch => StageBase::Scratch,
            BaseSource::Stage(dep) => StageBase::Stage(self.dependency(&inputs, *dep)?.clone()),
            BaseSource::Image(reference) => StageBase::Image(self.fetch(&label, reference).await?),
        };
        let base_rootfs = match &base {
            StageBase::Scratch => None,
            StageBase::Stage(parent) => Some(parent.rootfs().to_path_buf()),
            StageBase::Image(image) => Some(image.rootfs().to_path_buf()),
        };
        if let Some(src) = base_rootfs {
            let dst = arena.rootfs().to_path_buf();
            blocking(move || replicate(&src, &dst)).await?;
        }

        let mut ws = StageWorkspace::new(id, label.clone(), arena, base);
        let mut scope = StageScope::default();
        for step in &stage.steps {
            tracing::debug!(line = step.line, instruction = %step.text, "Executing instruction");
            self.run_step(&mut ws, &mut scope, step, &inputs)
                .await
                .map_err(|e| instruction_error(&label, step, e))?;
        }

        tracing::debug!(stage = %label, layers = ws.own_layers().len(), "Stage filesystem sealed");
        Ok(ws.complete())
    }
}

impl StageExecutor {
    async fn run_step(
        &self,
        ws: &mut StageWorkspace,
        scope: &mut StageScope,
        step: &Step,
        inputs: &StageInputs<CompletedStage>,
    ) -> Result<()> {
        let instruction = match &step.action {
            Action::Copy(copy) => return self.copy(ws, scope, step, copy, inputs).await,
            Action::Exec(instruction) => instruction,
        };

        match instruction {
            Instruction::Run { command } => self.run_command(ws, scope, step, command).await?,

            Instruction::Workdir { path } => {
                let current = ws.config.working_dir.clone().unwrap_or_else(|| "/".to_string());
                let workdir = resolve_path(&current, &scope.expand(ws, path));
                let rootfs = ws.rootfs().to_path_buf();
                let dir = workdir.clone();
                let created = blocking(move || make_dir(&rootfs, &dir)).await?;
                ws.config.working_dir = Some(workdir);
                self.commit(ws, step, Changes::written(created)).await?;
            }

            Instruction::Env { key, value } => {
                let value = scope.expand(ws, value);
                ws.config.set_env(key, value);
                ws.push_history(&step.text);
            }

            Instruction::Arg { name, default } => {
                let value = self
                    .build_args
                    .get(name)
                    .cloned()
                    .or_else(|| default.as_ref().map(|d| scope.expand(ws, d)))
                    .or_else(|| {
                        self.graph
                            .global_args()
                            .iter()
                            .rev()
                            .find(|a| &a.name == name)
                            .and_then(|a| a.value.clone())
                    });
                if let Some(value) = value {
                    scope.args.insert(name.clone(), value);
                }
                ws.push_history(&step.text);
            }

            Instruction::Label { key, value } => {
                let key = scope.expand(ws, key);
                let value = scope.expand(ws, value);
                ws.config.labels.insert(key, value);
                ws.push_history(&step.text);
            }

            Instruction::User { user } => {
                ws.config.user = Some(scope.expand(ws, user));
                ws.push_history(&step.text);
            }

            Instruction::Expose { port } => {
                let mut port = scope.expand(ws, port);
                if !port.contains('/') {
                    port.push_str("/tcp");
                }
                if !ws.config.exposed_ports.contains(&port) {
                    ws.config.exposed_ports.push(port);
                }
                ws.push_history(&step.text);
            }

            Instruction::Cmd { exec } => {
                ws.config.cmd = Some(exec.clone());
                scope.cmd_set = true;
                ws.push_history(&step.text);
            }

            Instruction::Entrypoint { exec } => {
                ws.config.entrypoint = Some(exec.clone());
                if !scope.cmd_set {
                    ws.config.cmd = None;
                }
                ws.push_history(&step.text);
            }

            Instruction::From { .. } | Instruction::Copy { .. } => {
                return Err(BuildError::Other(format!(
                    "unexpected {} inside a stage",
                    instruction.keyword()
                )));
            }
        }
        Ok(())
    }

    async fn run_command(
        &self,
        ws: &mut StageWorkspace,
        scope: &StageScope,
        step: &Step,
        command: &str,
    ) -> Result<()> {
        let rootfs = ws.rootfs().to_path_buf();
        let snapshot_root = rootfs.clone();
        let before = blocking(move || DirSnapshot::capture(&snapshot_root)).await?;

        let mut env: Vec<(String, String)> = scope
            .args
            .iter()
            .filter(|(k, _)| ws.config.env_var(k).is_none())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.extend(ws.config.env.iter().cloned());

        let ctx = ExecContext {
            stage: ws.label().to_string(),
            rootfs: rootfs.clone(),
            workdir: ws.config.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            env,
            user: ws.config.user.clone(),
        };
        let output = self.executor.execute(&ctx, command).await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(BuildError::Other(if stderr.is_empty() {
                format!("command exited with code {}", output.exit_code)
            } else {
                format!("command exited with code {}: {}", output.exit_code, stderr)
            }));
        }

        let after = blocking(move || DirSnapshot::capture(&rootfs)).await?;
        self.commit(ws, step, before.diff(&after)).await
    }

    async fn copy(
        &self,
        ws: &mut StageWorkspace,
        scope: &StageScope,
        step: &Step,
        copy: &CopyStep,
        inputs: &StageInputs<CompletedStage>,
    ) -> Result<()> {
        let image;
        let src_root = match &copy.source {
            CopySource::Context => self.context_dir.clone(),
            CopySource::Stage(dep) => self.dependency(inputs, *dep)?.rootfs().to_path_buf(),
            CopySource::Image(reference) => {
                image = self.fetch(ws.label(), reference).await?;
                image.rootfs().to_path_buf()
            }
        };

        let sources: Vec<String> = copy.src.iter().map(|s| scope.expand(ws, s)).collect();
        let dst = scope.expand(ws, &copy.dst);
        let workdir = ws.config.working_dir.clone().unwrap_or_else(|| "/".to_string());
        let rootfs = ws.rootfs().to_path_buf();

        let written =
            blocking(move || copy_into(&src_root, &sources, &rootfs, &dst, &workdir)).await?;
        self.commit(ws, step, Changes::written(written)).await
    }

    /// Turn `changes` into a layer, or a history-only entry when empty.
    async fn commit(&self, ws: &mut StageWorkspace, step: &Step, changes: Changes) -> Result<()> {
        if changes.is_empty() {
            ws.push_history(&step.text);
            return Ok(());
        }

        let rootfs = ws.rootfs().to_path_buf();
        let layers_dir = ws.layers_dir().to_path_buf();
        let blob: LayerBlob = blocking(move || create_layer(&rootfs, &changes, &layers_dir)).await?;

        let layer = ws.push_layer(blob, &step.text);
        let (digest, size) = (layer.digest.clone(), layer.size);
        tracing::info!(
            digest = %digest,
            size = %format_size(size),
            instruction = %step.text,
            "Layer created"
        );
        self.events.emit(BuildEvent::with_fields(
            events::LAYER_CREATED,
            [
                ("stage", serde_json::json!(ws.label())),
                ("digest", serde_json::json!(digest)),
                ("size", serde_json::json!(size)),
                ("instruction", serde_json::json!(step.text)),
            ],
        ));
        Ok(())
    }

    fn dependency<'a>(
        &self,
        inputs: &'a StageInputs<CompletedStage>,
        id: StageId,
    ) -> Result<&'a Arc<CompletedStage>> {
        inputs.get(id).ok_or_else(|| {
            BuildError::Other(format!(
                "stage {} is not available",
                self.graph.label(id)
            ))
        })
    }

    async fn fetch(&self, stage: &str, reference: &ImageReference) -> Result<Arc<FetchedImage>> {
        self.images
            .get(reference)
            .await
            .map_err(|e| BuildError::ExternalImageFetch {
                stage: stage.to_string(),
                reference: reference.to_string(),
                message: message_of(e),
            })
    }
}

/// Attach stage and instruction to an error that does not carry them yet.
fn instruction_error(stage: &str, step: &Step, err: BuildError) -> BuildError {
    match err {
        e @ (BuildError::ExternalImageFetch { .. } | BuildError::InstructionExecution { .. }) => e,
        e => BuildError::InstructionExecution {
            stage: stage.to_string(),
            instruction: step.text.clone(),
            message: message_of(e),
        },
    }
}

fn message_of(err: BuildError) -> String {
    match err {
        BuildError::Other(message) => message,
        e => e.to_string(),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildError::Other(format!("Blocking task failed: {}", e)))?
}

/// Absolute path of the build file for `config`.
pub fn dockerfile_location(config: &BuildConfig) -> PathBuf {
    if config.dockerfile_path.is_absolute() {
        config.dockerfile_path.clone()
    } else {
        config.context_dir.join(&config.dockerfile_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(content: &str, configure: impl FnOnce(&mut BuildConfig)) -> Result<BuildPlan> {
        let mut config = BuildConfig::new("/ctx");
        configure(&mut config);
        BuildPlan::new(content, &config)
    }

    const FILE: &str = "FROM alpine AS a\nFROM alpine AS unused\nFROM scratch AS b\nCOPY --from=a /x /x\nFROM b\n";

    #[test]
    fn test_plan_defaults_to_last_stage_closure() {
        let plan = plan(FILE, |_| {}).unwrap();
        assert_eq!(plan.final_stage, StageId(3));
        assert_eq!(
            plan.scheduled,
            BTreeSet::from([StageId(0), StageId(2), StageId(3)])
        );
    }

    #[test]
    fn test_plan_keeps_unused_stages_when_asked() {
        let plan = plan(FILE, |c| c.engine.scheduler.skip_unused_stages = false).unwrap();
        assert_eq!(plan.scheduled.len(), 4);
    }

    #[test]
    fn test_plan_target_by_name_and_index() {
        let by_name = plan(FILE, |c| c.target = Some("B".to_string())).unwrap();
        assert_eq!(by_name.final_stage, StageId(2));
        assert_eq!(by_name.scheduled, BTreeSet::from([StageId(0), StageId(2)]));

        let by_index = plan(FILE, |c| c.target = Some("1".to_string())).unwrap();
        assert_eq!(by_index.final_stage, StageId(1));
        assert_eq!(by_index.scheduled, BTreeSet::from([StageId(1)]));
    }

    #[test]
    fn test_plan_unknown_target() {
        let err = plan(FILE, |c| c.target = Some("nope".to_string())).unwrap_err();
        assert!(matches!(err, BuildError::ConfigError(_)));
    }

    #[test]
    fn test_dockerfile_location() {
        let mut config = BuildConfig::new("/ctx");
        assert_eq!(dockerfile_location(&config), PathBuf::from("/ctx/Dockerfile"));
        config.dockerfile_path = PathBuf::from("/other/Buildfile");
        assert_eq!(dockerfile_location(&config), PathBuf::from("/other/Buildfile"));
    }

    #[test]
    fn test_instruction_error_keeps_stage_errors() {
        let step = Step {
            line: 3,
            text: "RUN make".to_string(),
            action: Action::Exec(Instruction::Run {
                command: "make".to_string(),
            }),
        };
        let wrapped = instruction_error("builder", &step, BuildError::Other("exit 2".to_string()));
        match wrapped {
            BuildError::InstructionExecution {
                stage,
                instruction,
                message,
            } => {
                assert_eq!(stage, "builder");
                assert_eq!(instruction, "RUN make");
                assert_eq!(message, "exit 2");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let fetch = BuildError::ExternalImageFetch {
            stage: "builder".to_string(),
            reference: "alpine".to_string(),
            message: "offline".to_string(),
        };
        assert!(matches!(
            instruction_error("builder", &step, fetch),
            BuildError::ExternalImageFetch { .. }
        ));
    }
}
