//! Layer and artifact management.
//!
//! Each executing stage owns a scratch arena (rootfs + layer blobs) inside the
//! build's scratch root. When the stage completes, the arena is frozen into a
//! `CompletedStage`, which other stages can only read. After the final stage
//! completes, `finalize` keeps the final stage's lineage as the image and
//! releases every other arena in bulk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use stagecraft_core::error::{BuildError, Result};
use stagecraft_core::event::{events, BuildEvent, EventEmitter};
use tempfile::TempDir;

use super::fetch::FetchedImage;
use super::graph::StageId;
use super::layer::LayerBlob;
use super::resolve::BuildGraph;
use crate::oci::{ImageConfig, ImageReference};

/// Who produced a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOwner {
    Stage(StageId),
    Image(ImageReference),
}

/// An immutable, content-addressed filesystem delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Compressed digest, `sha256:` prefixed
    pub digest: String,
    /// Uncompressed digest, `sha256:` prefixed
    pub diff_id: String,
    pub size: u64,
    /// Blob location
    pub path: PathBuf,
    pub owner: LayerOwner,
    /// Instruction that produced the layer
    pub created_by: String,
}

/// One entry of the image history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub created_by: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// Scratch storage exclusively owned by one stage.
#[derive(Debug)]
pub struct StageArena {
    dir: TempDir,
    rootfs: PathBuf,
    layers_dir: PathBuf,
    _scratch: Arc<TempDir>,
}

impl StageArena {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn layers_dir(&self) -> &Path {
        &self.layers_dir
    }

    /// Remove the arena from disk now.
    fn dispose(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// What a stage starts from.
#[derive(Debug, Clone)]
pub enum StageBase {
    Scratch,
    Stage(Arc<CompletedStage>),
    Image(Arc<FetchedImage>),
}

/// A stage in the Running state.
#[derive(Debug)]
pub struct StageWorkspace {
    id: StageId,
    label: String,
    arena: StageArena,
    base: StageBase,
    layers: Vec<Layer>,
    own_start: usize,
    history: Vec<HistoryEntry>,
    /// Runtime configuration, inherited from the base and edited in place
    pub config: ImageConfig,
}

impl StageWorkspace {
    /// Start a stage on top of `base`, inheriting its layers, history and
    /// configuration. The base filesystem must already be in the arena.
    pub fn new(id: StageId, label: String, arena: StageArena, base: StageBase) -> Self {
        let (layers, history, config) = match &base {
            StageBase::Scratch => (Vec::new(), Vec::new(), ImageConfig::default()),
            StageBase::Stage(stage) => (
                stage.layers.clone(),
                stage.history.clone(),
                stage.config.clone(),
            ),
            StageBase::Image(image) => (
                image.layers().to_vec(),
                image
                    .layers()
                    .iter()
                    .map(|l| HistoryEntry {
                        created_by: l.created_by.clone(),
                        empty_layer: false,
                    })
                    .collect(),
                image.config().clone(),
            ),
        };

        Self {
            id,
            label,
            arena,
            base,
            own_start: layers.len(),
            layers,
            history,
            config,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rootfs(&self) -> &Path {
        self.arena.rootfs()
    }

    pub fn layers_dir(&self) -> &Path {
        self.arena.layers_dir()
    }

    /// Record a layer produced by `created_by`.
    pub fn push_layer(&mut self, blob: LayerBlob, created_by: &str) -> &Layer {
        self.history.push(HistoryEntry {
            created_by: created_by.to_string(),
            empty_layer: false,
        });
        self.layers.push(Layer {
            digest: blob.digest,
            diff_id: blob.diff_id,
            size: blob.size,
            path: blob.path,
            owner: LayerOwner::Stage(self.id),
            created_by: created_by.to_string(),
        });
        &self.layers[self.layers.len() - 1]
    }

    /// Record an instruction that produced no layer.
    pub fn push_history(&mut self, created_by: &str) {
        self.history.push(HistoryEntry {
            created_by: created_by.to_string(),
            empty_layer: true,
        });
    }

    /// Layers produced by this stage so far.
    pub fn own_layers(&self) -> &[Layer] {
        &self.layers[self.own_start..]
    }

    /// Freeze into the read-only completed view.
    pub fn complete(self) -> CompletedStage {
        CompletedStage {
            id: self.id,
            label: self.label,
            arena: self.arena,
            base: self.base,
            layers: self.layers,
            own_start: self.own_start,
            history: self.history,
            config: self.config,
        }
    }
}

/// The filesystem state of a stage as of its completion. Read-only.
#[derive(Debug)]
pub struct CompletedStage {
    id: StageId,
    label: String,
    arena: StageArena,
    base: StageBase,
    layers: Vec<Layer>,
    own_start: usize,
    history: Vec<HistoryEntry>,
    config: ImageConfig,
}

impl CompletedStage {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rootfs(&self) -> &Path {
        self.arena.rootfs()
    }

    /// All layers of this stage's image, bottom to top.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Layers produced by this stage itself.
    pub fn own_layers(&self) -> &[Layer] {
        &self.layers[self.own_start..]
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn base(&self) -> &StageBase {
        &self.base
    }
}

/// What happens to a stage's storage after the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// On the final stage's base chain; its layers are part of the image
    Retained,
    /// Contributed to the final stage only through copies
    Consumed,
    /// Outside the final stage's dependency closure
    Disposable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePrune {
    pub stage: usize,
    pub label: String,
    pub disposition: Disposition,
    /// Digests of the stage's own layers
    pub layers: Vec<String>,
}

/// Outcome of pruning after a successful build.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub stages: Vec<StagePrune>,
}

impl PruneReport {
    pub fn disposition(&self, id: StageId) -> Option<Disposition> {
        self.stages
            .iter()
            .find(|s| s.stage == id.index())
            .map(|s| s.disposition)
    }

    /// Digests of layers released with their stages.
    pub fn disposed_layers(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.disposition != Disposition::Retained)
            .flat_map(|s| s.layers.iter().map(String::as_str))
            .collect()
    }

    /// Digests of stage-produced layers kept in the image.
    pub fn retained_layers(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.disposition == Disposition::Retained)
            .flat_map(|s| s.layers.iter().map(String::as_str))
            .collect()
    }
}

/// The build's output: the final stage's layer sequence and configuration.
#[derive(Debug)]
pub struct FinalImage {
    stage: Arc<CompletedStage>,
    lineage: BTreeSet<StageId>,
}

impl FinalImage {
    pub fn stage(&self) -> StageId {
        self.stage.id()
    }

    pub fn label(&self) -> &str {
        self.stage.label()
    }

    /// Ordered layers: external base layers, base-chain stage layers, then
    /// the final stage's own.
    pub fn layers(&self) -> &[Layer] {
        self.stage.layers()
    }

    pub fn config(&self) -> &ImageConfig {
        self.stage.config()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.stage.history()
    }

    /// Stages the final stage depends on, itself included.
    pub fn lineage(&self) -> &BTreeSet<StageId> {
        &self.lineage
    }

    pub fn size(&self) -> u64 {
        self.layers().iter().map(|l| l.size).sum()
    }
}

/// Allocates stage arenas and prunes them once the build has finished.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    scratch: Arc<TempDir>,
    events: EventEmitter,
}

impl ArtifactManager {
    pub fn new(scratch: Arc<TempDir>, events: EventEmitter) -> Self {
        Self { scratch, events }
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Allocate an empty arena for `id`.
    pub fn allocate(&self, id: StageId) -> Result<StageArena> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("stage-{}-", id.index()))
            .tempdir_in(self.scratch.path())?;
        let rootfs = dir.path().join("rootfs");
        let layers_dir = dir.path().join("layers");
        std::fs::create_dir_all(&rootfs)?;
        std::fs::create_dir_all(&layers_dir)?;

        Ok(StageArena {
            dir,
            rootfs,
            layers_dir,
            _scratch: self.scratch.clone(),
        })
    }

    /// Split completed stages into the final image and everything else, then
    /// release everything else.
    pub fn finalize(
        &self,
        graph: &BuildGraph,
        final_stage: StageId,
        mut completed: BTreeMap<StageId, Arc<CompletedStage>>,
    ) -> Result<(FinalImage, PruneReport)> {
        let top = completed.get(&final_stage).cloned().ok_or_else(|| {
            BuildError::Other(format!(
                "final stage {} did not complete",
                graph.label(final_stage)
            ))
        })?;
        let lineage = graph.closure(final_stage);
        let chain: BTreeSet<StageId> = graph.base_chain(final_stage).into_iter().collect();

        let mut report = PruneReport::default();
        for (id, stage) in &completed {
            let disposition = if chain.contains(id) {
                Disposition::Retained
            } else if lineage.contains(id) {
                Disposition::Consumed
            } else {
                Disposition::Disposable
            };
            report.stages.push(StagePrune {
                stage: id.index(),
                label: stage.label().to_string(),
                disposition,
                layers: stage.own_layers().iter().map(|l| l.digest.clone()).collect(),
            });
        }

        // Later stages may hold their bases, so release from the top down
        let mut released = 0;
        while let Some((id, stage)) = completed.pop_last() {
            if chain.contains(&id) {
                continue;
            }
            match Arc::try_unwrap(stage) {
                Ok(stage) => {
                    let label = stage.label;
                    if let Err(e) = stage.arena.dispose() {
                        tracing::warn!(stage = %label, error = %e, "Failed to remove stage storage");
                    }
                    released += 1;
                }
                Err(shared) => drop(shared),
            }
        }

        let disposed = report.disposed_layers().len();
        tracing::info!(
            stage = %top.label(),
            lineage = lineage.len(),
            released,
            disposed_layers = disposed,
            "Pruned intermediate stages"
        );
        self.events.emit(BuildEvent::with_fields(
            events::IMAGE_PRUNED,
            [
                ("stage", serde_json::json!(top.label())),
                ("retained_layers", serde_json::json!(report.retained_layers())),
                ("disposed_layers", serde_json::json!(report.disposed_layers())),
            ],
        ));

        Ok((
            FinalImage {
                stage: top,
                lineage,
            },
            report,
        ))
    }
}
