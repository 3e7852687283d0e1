//! Programmatic container-image build pipeline.
//!
//! This crate replaces a declarative image-build recipe with an explicit,
//! testable pipeline:
//!
//! - **Steps as data** - an ordered list of step specifications (command or
//!   source copy, each with its own working directory and environment)
//! - **Explicit snapshot chain** - the image is an append-only sequence of
//!   immutable layers, one per completed step, addressed by sha256
//! - **Fail-fast driver** - steps run strictly sequentially; the first
//!   non-zero exit halts the build and reports the failing step
//! - **Local store** - base images and layer diffs live in a
//!   content-addressed store; the final snapshot is the only durable output
//!
//! # Example
//!
//! ```rust,ignore
//! use image_builder::pipeline::{BuildRequest, Pipeline};
//! use image_builder::runner::HostRunner;
//! use image_builder::step::{BaseImage, StepSpec};
//! use image_builder::store::LayerStore;
//!
//! let store = LayerStore::open_default()?;
//! let request = BuildRequest {
//!     base: BaseImage::new("rust", "1.88")?,
//!     steps: vec![
//!         StepSpec::command("install", "/build", &["apt-get", "install", "-y", "libx11-dev"]),
//!         StepSpec::copy_tree("copy-source", "/build", ".", "."),
//!         StepSpec::command("build", "/build", &["cargo", "build", "--release"]),
//!     ],
//!     context_dir: std::env::current_dir()?,
//! };
//! let report = Pipeline::new(&store, HostRunner).run(&request)?;
//! ```

pub mod pipeline;
pub mod preflight;
pub mod recipe;
pub mod runner;
pub mod runs;
pub mod snapshot;
pub mod step;
pub mod store;
pub mod tree;

pub use pipeline::{BuildReport, BuildRequest, Pipeline, StepFailure};
pub use runner::{CommandRunner, HostRunner};
pub use snapshot::{LayerId, Snapshot};
pub use step::{BaseImage, StepAction, StepSpec};
pub use store::LayerStore;
