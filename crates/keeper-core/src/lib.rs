//! Core building blocks for Tablekeeper, a change-management pipeline for
//! delimited tabular data files.
//!
//! The crate provides the stateful leaves of the pipeline: the versioned
//! [`backup::BackupStore`], the [`validate::ValidationPipeline`], the
//! [`diff::DiffEngine`] with its report renderers, and the append-only
//! [`changelog::ChangeLog`]. Filesystem monitoring and orchestration live in
//! the service crate; everything here is callable on its own.

pub mod backup;
pub mod changelog;
pub mod checksum;
pub mod config;
pub mod diff;
pub mod event;
pub mod table;
pub mod validate;

pub use config::KeeperConfig;
pub use event::{ChangeEvent, ChangeKind};
