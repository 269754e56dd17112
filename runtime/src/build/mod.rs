//! Multi-stage image build support.
//!
//! Parses build files with several `FROM` stages, resolves `COPY --from`
//! and `FROM` references between stages, runs independent stages
//! concurrently and keeps only the final stage's lineage in the image.
//!
//! # Pipeline
//!
//! ```text
//! Dockerfile -> StageGraph -> BuildGraph -> Scheduler -> ArtifactManager -> ImageExporter
//! ```
//!
//! # Supported Instructions
//!
//! FROM, RUN, COPY (incl. --from), WORKDIR, ENV, ENTRYPOINT, CMD, EXPOSE, LABEL, USER, ARG

pub mod artifacts;
pub mod copy;
pub mod dockerfile;
pub mod engine;
pub mod executor;
pub mod export;
pub mod fetch;
pub mod graph;
pub mod layer;
pub mod resolve;
pub mod scheduler;

pub use artifacts::{
    ArtifactManager, CompletedStage, Disposition, FinalImage, Layer, LayerOwner, PruneReport,
    StageBase, StagePrune, StageWorkspace,
};
pub use dockerfile::{Directive, Dockerfile, Instruction};
pub use engine::{BuildConfig, BuildEngine, BuildPlan, BuildResult, DEFAULT_REFERENCE};
pub use executor::{ChrootExecutor, ExecContext, ExecOutput, InstructionExecutor};
pub use export::{ExportedImage, ImageExporter, OciLayoutExporter};
pub use fetch::{FetchCache, FetchedImage, ImageSource, LayoutImageSource};
pub use graph::{Stage, StageGraph, StageId};
pub use layer::{Changes, DirSnapshot, LayerBlob};
pub use resolve::{resolve_token, BaseSource, BuildGraph, CopySource, ResolvedStage, Source};
pub use scheduler::{Scheduler, StageInputs, StageRunner, StageState};
