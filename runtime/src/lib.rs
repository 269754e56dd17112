//! Stagecraft Runtime - multi-stage build engine.
//!
//! Stage graph construction, reference resolution, concurrent stage
//! scheduling and layer management, plus the OCI image plumbing those need.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod oci;

// Re-export common types
pub use build::{
    BuildConfig, BuildEngine, BuildGraph, BuildPlan, BuildResult, ChrootExecutor, Dockerfile,
    ImageExporter, ImageSource, InstructionExecutor, LayoutImageSource, OciLayoutExporter,
    StageGraph, StageId,
};
pub use oci::{ImageConfig, ImageReference, OciImage};

/// Stagecraft Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
