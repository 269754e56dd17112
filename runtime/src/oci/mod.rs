//! OCI image support.
//!
//! Reference parsing, image layout loading and layer extraction used by the
//! build engine when a stage starts from (or copies out of) an external image.
//!
//! # Layout
//!
//! ```text
//! image/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (Image index)
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>   (Image manifest)
//!         ├── <config>     (Image configuration)
//!         └── <layers>     (Filesystem layers)
//! ```

mod image;
mod layers;
pub mod reference;

pub use image::{ImageConfig, ImageLayer, OciImage};
pub use layers::extract_layer;
pub use reference::ImageReference;
