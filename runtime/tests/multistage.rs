//! End-to-end multi-stage builds with a scripted executor and images served
//! from local OCI layouts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagecraft_core::error::{BuildError, ErrorPhase, Result};
use stagecraft_core::event::{events, BuildEvent};
use stagecraft_runtime::build::{
    BuildConfig, BuildEngine, BuildResult, Disposition, ExecContext, ExecOutput, ImageSource,
    InstructionExecutor, LayoutImageSource, OciLayoutExporter, StageId, StageState,
};
use stagecraft_runtime::oci::{extract_layer, ImageReference, OciImage};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Understands three commands:
/// `write <path> <content>`, `sleep <ms>` and `fail`.
#[derive(Default)]
struct ScriptExecutor {
    runs: Mutex<Vec<(String, String)>>,
}

impl ScriptExecutor {
    fn stages_run(&self) -> Vec<String> {
        self.runs.lock().iter().map(|(stage, _)| stage.clone()).collect()
    }
}

#[async_trait]
impl InstructionExecutor for ScriptExecutor {
    async fn execute(&self, ctx: &ExecContext, command: &str) -> Result<ExecOutput> {
        self.runs
            .lock()
            .push((ctx.stage.clone(), command.to_string()));

        let mut parts = command.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("write"), Some(path), Some(content)) => {
                let full = if path.starts_with('/') {
                    ctx.rootfs.join(path.trim_start_matches('/'))
                } else {
                    ctx.rootfs
                        .join(ctx.workdir.trim_start_matches('/'))
                        .join(path)
                };
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(full, content)?;
                Ok(ExecOutput::default())
            }
            (Some("sleep"), Some(ms), None) => {
                let ms = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ExecOutput::default())
            }
            (Some("fail"), None, None) => Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".to_string(),
            }),
            _ => Ok(ExecOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("unknown command: {}", command),
            }),
        }
    }
}

/// Counts fetches on top of a layout directory.
struct CountingSource {
    inner: LayoutImageSource,
    calls: AtomicUsize,
}

#[async_trait]
impl ImageSource for CountingSource {
    async fn fetch(&self, reference: &ImageReference) -> Result<OciImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(reference).await
    }
}

struct Harness {
    images: TempDir,
    context: TempDir,
    out: TempDir,
    source: Arc<CountingSource>,
    executor: Arc<ScriptExecutor>,
    engine: BuildEngine,
}

impl Harness {
    /// Provides `alpine` (one layer with `/base.txt`, `ENV BASE=1`) in the
    /// layout store.
    async fn new() -> Self {
        let images = TempDir::new().unwrap();
        let context = TempDir::new().unwrap();
        std::fs::write(context.path().join("base.txt"), "from alpine").unwrap();
        std::fs::write(context.path().join("main.rs"), "fn main() {}").unwrap();

        let layouts = LayoutImageSource::new(images.path());
        let alpine_dir = layouts.layout_dir(&ImageReference::parse("alpine").unwrap());
        let seed = BuildEngine::new(
            Arc::new(LayoutImageSource::new(images.path())),
            Arc::new(ScriptExecutor::default()),
            Arc::new(OciLayoutExporter::new(&alpine_dir)),
        );
        seed.build_from_str(
            "FROM scratch\nCOPY base.txt /base.txt\nENV BASE=1\n",
            &BuildConfig::new(context.path()),
        )
        .await
        .unwrap();

        let source = Arc::new(CountingSource {
            inner: layouts,
            calls: AtomicUsize::new(0),
        });
        let executor = Arc::new(ScriptExecutor::default());
        let out = TempDir::new().unwrap();
        let engine = BuildEngine::new(
            source.clone(),
            executor.clone(),
            Arc::new(OciLayoutExporter::new(out.path())),
        );

        Self {
            images,
            context,
            out,
            source,
            executor,
            engine,
        }
    }

    fn config(&self) -> BuildConfig {
        BuildConfig::new(self.context.path())
    }

    async fn build(&self, content: &str) -> Result<BuildResult> {
        self.build_with(content, self.config()).await
    }

    async fn build_with(&self, content: &str, config: BuildConfig) -> Result<BuildResult> {
        self.engine.build_from_str(content, &config).await
    }

    fn fetches(&self) -> usize {
        self.source.calls.load(Ordering::SeqCst)
    }

    fn exported(&self) -> bool {
        self.out.path().join("index.json").exists()
    }

    /// Unpack the exported image into a fresh directory.
    fn unpack(&self) -> (OciImage, TempDir) {
        let image = OciImage::from_path(self.out.path()).unwrap();
        let rootfs = TempDir::new().unwrap();
        for layer in image.layers() {
            extract_layer(&layer.path, rootfs.path()).unwrap();
        }
        (image, rootfs)
    }
}

fn read(root: &Path, path: &str) -> String {
    std::fs::read_to_string(root.join(path)).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<BuildEvent>) -> Vec<BuildEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn stages_with(events: &[BuildEvent], key: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.key == key)
        .filter_map(|e| e.field("stage").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_copy_from_named_stage() {
    let h = Harness::new().await;
    let result = h
        .build(
            "FROM scratch AS builder\n\
             RUN write /out/app built\n\
             FROM scratch\n\
             COPY --from=builder /out/app /app\n",
        )
        .await
        .unwrap();

    assert_eq!(result.final_stage, "#1");
    assert_eq!(result.lineage, vec!["builder".to_string(), "#1".to_string()]);
    assert_eq!(result.layer_count, 1);
    assert_eq!(
        result.prune.disposition(StageId(0)),
        Some(Disposition::Consumed)
    );

    let (image, rootfs) = h.unpack();
    assert_eq!(image.layers().len(), 1);
    assert_eq!(read(rootfs.path(), "app"), "built");
    assert!(!rootfs.path().join("out").exists());
}

#[tokio::test]
async fn test_copy_from_stage_index() {
    let h = Harness::new().await;
    let result = h
        .build("FROM scratch\nRUN write /a one\nFROM scratch\nCOPY --from=0 /a /a\n")
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["#0".to_string(), "#1".to_string()]);
    let (_, rootfs) = h.unpack();
    assert_eq!(read(rootfs.path(), "a"), "one");
    assert_eq!(h.fetches(), 0);
}

#[tokio::test]
async fn test_unmatched_token_is_external_image() {
    let h = Harness::new().await;
    let result = h
        .build("FROM scratch AS build\nFROM scratch\nCOPY --from=alpine /base.txt /copied.txt\n")
        .await
        .unwrap();

    assert_eq!(h.fetches(), 1);
    // `build` is not needed by the final stage
    assert_eq!(result.states[&StageId(0)], StageState::Skipped);
    let (_, rootfs) = h.unpack();
    assert_eq!(read(rootfs.path(), "copied.txt"), "from alpine");
}

#[tokio::test]
async fn test_unused_stage_skipped_by_default() {
    let h = Harness::new().await;
    let mut rx = h.engine.events().subscribe();
    let result = h
        .build(
            "FROM scratch AS a\nRUN write /a a\n\
             FROM scratch AS d\nRUN write /d d\n\
             FROM a AS b\nRUN write /b b\n\
             FROM b AS c\nRUN write /c c\n",
        )
        .await
        .unwrap();

    assert_eq!(result.states[&StageId(1)], StageState::Skipped);
    assert!(!h.executor.stages_run().contains(&"d".to_string()));
    assert_eq!(stages_with(&drain(&mut rx), events::STAGE_SKIPPED), vec!["d"]);
    assert_eq!(result.layer_count, 3);
}

#[tokio::test]
async fn test_unused_stage_disposable_when_built() {
    let h = Harness::new().await;
    let mut config = h.config();
    config.engine.scheduler.skip_unused_stages = false;
    let result = h
        .build_with(
            "FROM scratch AS a\nRUN write /a a\n\
             FROM scratch AS d\nRUN write /d d\n\
             FROM a AS b\nRUN write /b b\n\
             FROM b AS c\nRUN write /c c\n",
            config,
        )
        .await
        .unwrap();

    assert!(h.executor.stages_run().contains(&"d".to_string()));
    assert_eq!(result.lineage, vec!["a", "b", "c"]);
    assert_eq!(
        result.prune.disposition(StageId(1)),
        Some(Disposition::Disposable)
    );
    for retained in [0, 2, 3] {
        assert_eq!(
            result.prune.disposition(StageId(retained)),
            Some(Disposition::Retained)
        );
    }
    assert_eq!(result.prune.disposed_layers().len(), 1);

    let (image, rootfs) = h.unpack();
    assert_eq!(image.layers().len(), 3);
    for file in ["a", "b", "c"] {
        assert_eq!(read(rootfs.path(), file), file);
    }
    assert!(!rootfs.path().join("d").exists());
    let disposed = result.prune.disposed_layers()[0].to_string();
    assert!(image.layers().iter().all(|l| l.digest != disposed));
}

#[tokio::test]
async fn test_stage_referencing_later_index_is_cycle_through_self() {
    let h = Harness::new().await;
    let err = h
        .build(
            "FROM alpine AS base\nRUN write /x x\n\
             FROM busybox\n\
             COPY --from=base /x /x\n\
             COPY --from=1 /c /d\n",
        )
        .await
        .unwrap_err();

    match err {
        BuildError::CyclicDependency {
            stage,
            instruction,
            cycle,
        } => {
            assert_eq!(stage, "#1");
            assert_eq!(instruction, "COPY --from=1 /c /d");
            assert_eq!(cycle, vec!["#1", "#1"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.executor.stages_run().is_empty());
    assert_eq!(h.fetches(), 0);
    assert!(!h.exported());
}

#[tokio::test]
async fn test_self_reference_by_name() {
    let h = Harness::new().await;
    let mut rx = h.engine.events().subscribe();
    let err = h
        .build("FROM scratch AS app\nCOPY --from=app /x /x\n")
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::CyclicDependency { .. }));
    assert_eq!(err.phase(), Some(ErrorPhase::Resolve));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.key == events::BUILD_FAILED));
    assert!(events.iter().all(|e| e.key != events::STAGE_STARTED));
}

#[tokio::test]
async fn test_forward_and_out_of_range_references() {
    let h = Harness::new().await;

    let err = h
        .build("FROM scratch\nCOPY --from=later /x /x\nFROM scratch AS later\n")
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::ForwardReference { ref target, .. } if target == "later"));

    let err = h
        .build("FROM scratch\nCOPY --from=5 /x /x\n")
        .await
        .unwrap_err();
    match err {
        BuildError::UnresolvedInternalReference {
            token, stage_count, ..
        } => {
            assert_eq!(token, "5");
            assert_eq!(stage_count, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_stops_dependents_and_cancels_siblings() {
    let h = Harness::new().await;
    let mut rx = h.engine.events().subscribe();
    let err = h
        .build(
            "FROM scratch AS a\nRUN fail\n\
             FROM scratch AS slow\nRUN sleep 5000\n\
             FROM a AS b\nRUN write /b b\n\
             FROM b\nCOPY --from=slow /x /x\n",
        )
        .await
        .unwrap_err();

    match &err {
        BuildError::InstructionExecution {
            stage,
            instruction,
            message,
        } => {
            assert_eq!(stage, "a");
            assert_eq!(instruction, "RUN fail");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let events = drain(&mut rx);
    let started = stages_with(&events, events::STAGE_STARTED);
    assert!(!started.contains(&"b".to_string()));
    assert!(!h.executor.stages_run().contains(&"b".to_string()));
    assert_eq!(stages_with(&events, events::STAGE_FAILED), vec!["a"]);
    let cancelled = stages_with(&events, events::STAGE_CANCELLED);
    assert!(cancelled.contains(&"b".to_string()));
    assert!(cancelled.contains(&"slow".to_string()));
    assert!(!h.exported());
}

#[tokio::test]
async fn test_external_image_fetched_once() {
    let h = Harness::new().await;
    h.build(
        "FROM alpine AS one\nRUN write /one 1\n\
         FROM alpine AS two\n\
         COPY --from=alpine /base.txt /copy.txt\n\
         COPY --from=one /one /one\n",
    )
    .await
    .unwrap();
    assert_eq!(h.fetches(), 1);

    let (image, rootfs) = h.unpack();
    // alpine layer + two copy layers
    assert_eq!(image.layers().len(), 3);
    assert_eq!(read(rootfs.path(), "copy.txt"), "from alpine");
    assert_eq!(read(rootfs.path(), "one"), "1");
}

#[tokio::test]
async fn test_fetch_cache_can_be_disabled() {
    let h = Harness::new().await;
    let mut config = h.config();
    config.engine.fetch.cache_images = false;
    h.build_with(
        "FROM alpine AS one\nFROM alpine\nCOPY --from=one /base.txt /b\n",
        config,
    )
    .await
    .unwrap();
    assert_eq!(h.fetches(), 2);
}

#[tokio::test]
async fn test_missing_external_image() {
    let h = Harness::new().await;
    let err = h
        .build("FROM ghcr.io/acme/missing:1\nRUN write /x x\n")
        .await
        .unwrap_err();
    match err {
        BuildError::ExternalImageFetch {
            stage, reference, ..
        } => {
            assert_eq!(stage, "#0");
            assert!(reference.contains("ghcr.io/acme/missing"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_config_inherited_through_stages() {
    let h = Harness::new().await;
    h.build(
        "FROM alpine AS base\n\
         ENV MODE=dev\n\
         WORKDIR /srv\n\
         RUN write app binary\n\
         FROM base\n\
         ENTRYPOINT [\"/srv/app\"]\n\
         EXPOSE 8080\n\
         LABEL stage=$MODE\n",
    )
    .await
    .unwrap();

    let (image, rootfs) = h.unpack();
    let config = image.config();
    assert_eq!(config.env_var("BASE"), Some("1"));
    assert_eq!(config.env_var("MODE"), Some("dev"));
    assert_eq!(config.working_dir.as_deref(), Some("/srv"));
    assert_eq!(config.entrypoint, Some(vec!["/srv/app".to_string()]));
    assert_eq!(config.exposed_ports, vec!["8080/tcp".to_string()]);
    assert_eq!(config.labels.get("stage").map(String::as_str), Some("dev"));
    assert_eq!(read(rootfs.path(), "srv/app"), "binary");
    // alpine, WORKDIR, RUN
    assert_eq!(image.layers().len(), 3);
}

#[tokio::test]
async fn test_target_stage() {
    let h = Harness::new().await;
    let mut config = h.config();
    config.target = Some("builder".to_string());
    config.tag = Some("tools:dev".to_string());
    let result = h
        .build_with(
            "FROM scratch AS builder\nRUN write /tool t\nFROM scratch\nRUN fail\n",
            config,
        )
        .await
        .unwrap();

    assert_eq!(result.final_stage, "builder");
    assert_eq!(result.reference, "tools:dev");
    assert_eq!(result.states[&StageId(1)], StageState::Skipped);
}

#[tokio::test]
async fn test_build_reads_file_from_context() {
    let h = Harness::new().await;
    std::fs::write(
        h.context.path().join("Dockerfile"),
        "ARG VERSION=1\n\
         FROM scratch AS src\n\
         ARG VERSION\n\
         COPY main.rs /src/v${VERSION}/main.rs\n\
         FROM scratch\n\
         COPY --from=src /src /src\n",
    )
    .unwrap();

    let mut config = h.config();
    config.build_args = HashMap::from([("VERSION".to_string(), "2".to_string())]);
    let result = h.engine.build(&config).await.unwrap();

    assert_eq!(result.reference, stagecraft_runtime::build::DEFAULT_REFERENCE);
    let (_, rootfs) = h.unpack();
    assert_eq!(read(rootfs.path(), "src/v2/main.rs"), "fn main() {}");
    assert!(h.images.path().join("docker.io").exists());
}

#[tokio::test]
async fn test_build_events_sequence() {
    let h = Harness::new().await;
    let mut rx = h.engine.events().subscribe();
    h.build("FROM scratch AS a\nRUN write /a a\nFROM a\n")
        .await
        .unwrap();

    let keys: Vec<String> = drain(&mut rx).into_iter().map(|e| e.key).collect();
    let position = |key: &str| keys.iter().position(|k| k == key).unwrap();
    assert_eq!(keys.first().map(String::as_str), Some(events::BUILD_STARTED));
    assert!(position(events::LAYER_CREATED) < position(events::STAGE_COMPLETED));
    assert!(position(events::IMAGE_PRUNED) < position(events::BUILD_COMPLETED));
    assert_eq!(keys.last().map(String::as_str), Some(events::BUILD_COMPLETED));
}


#[tokio::test]
async fn test_invalid_copy_source_reports_stage() {
    let h = Harness::new().await;
    let mut rx = h.engine.events().subscribe();
    let err = h
        .build("FROM scratch AS base\nFROM scratch\nCOPY --from=Bad:Tag! /a /b\n")
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::InvalidStageReference { .. }));
    let failed = drain(&mut rx)
        .into_iter()
        .find(|e| e.key == events::BUILD_FAILED)
        .unwrap();
    assert_eq!(failed.field("stage"), Some(&serde_json::json!("#1")));
    assert_eq!(failed.field("phase"), Some(&serde_json::json!("Resolve")));
    assert!(h.executor.stages_run().is_empty());
}
