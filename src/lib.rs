//! Containerizer
//!
//! `containerizer` builds OCI/Docker container images from an ordered
//! description of filesystem layers and a base image reference, without a
//! container runtime and without unpacking intermediate images. The result
//! goes to a remote registry, a local daemon, or a tarball on disk.
//!
//! ## Main Modules
//! - [`builder`] - The step graph: `Containerizer`, build plans, and sinks.
//! - [`registry`] - Docker Registry v2 client with auth negotiation.
//! - [`cache`] - Content-addressed layer cache with selector lookup.
//! - [`tar_builder`] - Reproducible layer archives from entry lists.
//! - [`image`] - References, layers, manifests, and config JSON.
//! - [`blob`] - Lazy byte sources with a size+digest write contract.
//! - [`credentials`] - Credential retriever chain and Docker config files.
//! - [`progress`] - Structured build events and progress allocations.
//! - [`error`] - The failure taxonomy surfaced across boundaries.
//!
//! ## Example
//!
//! ```no_run
//! use containerizer::builder::plan::{ContainerBuildPlan, LayerSpec};
//! use containerizer::builder::{Containerizer, Sink};
//! use containerizer::config::BuildConfiguration;
//! use containerizer::image::reference::ImageReference;
//! use containerizer::tar_builder::LayerEntry;
//!
//! # async fn build() -> containerizer::error::Result<()> {
//! let config = BuildConfiguration::new(ImageReference::parse("eclipse-temurin:17-jre")?)
//!     .with_target_image(ImageReference::parse("registry.example/my/app:latest")?);
//! let plan = ContainerBuildPlan::new()
//!     .with_layer(LayerSpec::new(
//!         "classes",
//!         vec![LayerEntry::new("./build/Main.class", "/app/classes/Main.class")],
//!     ))
//!     .with_entrypoint(vec!["java".into(), "-cp".into(), "/app/classes".into(), "Main".into()]);
//!
//! let containerizer = Containerizer::new(config)?;
//! let result = containerizer.containerize(&plan, &Sink::Registry).await?;
//! println!("pushed {}", result.image_digest);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod builder;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod executor;
pub mod image;
pub mod progress;
pub mod registry;
pub mod tar_builder;

pub use builder::{BuildResult, Containerizer, Sink};
pub use config::BuildConfiguration;
pub use digest::Digest;
pub use error::{BuildError, Result};
pub use image::reference::ImageReference;
