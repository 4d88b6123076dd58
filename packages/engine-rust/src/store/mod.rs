//! Storage layer for the vidcache engine.
//!
//! Provides the trait hierarchy and shared types for the two stores:
//!
//! - **Metadata** ([`MetadataStore`]): per-owner keyed record store over a
//!   pluggable [`MetadataBackend`], with the schema [`migrations`] ladder
//! - **Content** ([`ContentStore`]): process-wide blob store behind the
//!   synthetic URL scheme

pub mod backend;
pub mod content;
pub mod memory;
pub mod metadata;
pub mod migrations;

pub use backend::*;
pub use content::*;
pub use memory::*;
pub use metadata::*;
pub use migrations::*;
