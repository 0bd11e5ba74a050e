#![forbid(unsafe_code)]
//! Incremental content build pipeline.
//!
//! Source files are turned into build outputs by [`Builder`]s registered
//! per input extension. Every input becomes a [`Task`], and the
//! [`Engine`] runs tasks in passes until nothing is left. The
//! [`State`] remembers a signature for every output, so unchanged work is
//! skipped on the next run. A content-addressable [`ResourceCache`] shares
//! outputs between machines, and a [`RemoteBuilder`] may build the native
//! engine next to the content build.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kiln::{BuildContext, BuildError, Builder, BuilderDescriptor, CancelToken, Command, Project, Task};
//!
//! struct Copy;
//!
//! impl Builder for Copy {
//!     fn build(&self, task: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
//!         let data = task.inputs()[0].content()?;
//!         task.outputs()[0].set_content(&data)?;
//!         Ok(())
//!     }
//! }
//!
//! let project = Project::config("content")
//!     .builder(BuilderDescriptor::new("text", "txt", "txtc"), Arc::new(Copy))
//!     .finish()?;
//!
//! let results = project.build(&[Command::Build], &CancelToken::new())?;
//! # Ok::<(), kiln::KilnError>(())
//! ```

mod builder;
pub mod cache;
mod conflict;
mod core;
mod engine;
mod error;
mod factory;
mod project;
pub mod remote;
mod resource;
pub mod sources;
mod state;
mod task;
pub mod utils;

pub use crate::builder::{BuildContext, Builder, BuilderDescriptor, BuilderId, BuilderRegistry, Registered};
pub use crate::cache::{CacheConfig, CacheKey, RemoteStore, ResourceCache};
pub use crate::conflict::validate as validate_conflicts;
pub use crate::core::{Blake3Hasher, CancelToken, Hash32, Options, Signature, keys};
pub use crate::engine::{Engine, RunOutcome};
pub use crate::error::*;
pub use crate::factory::{GENERATED_MARKER, TaskFactory};
pub use crate::project::{Bundler, Command, Config, Project, STATE_FILE};
pub use crate::remote::{RemoteBuildHandle, RemoteBuildRequest, RemoteBuilder};
pub use crate::resource::{FileSystem, Resource};
pub use crate::state::State;
pub use crate::task::{Task, TaskDef, TaskResult};
