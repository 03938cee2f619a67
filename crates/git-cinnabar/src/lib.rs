//! Mercurial changegroup ingest engine.
//!
//! Reads the command stream described by the dispatcher module and turns it
//! into git objects: a sticky tail-window pack, the `hg2git`/`git2hg` notes
//! maps, and the per-ref head tracking needed to keep the bridged history
//! consistent. See [`dispatch::run`] for the entry point and [`context`]
//! for the state it drives.

pub mod collision;
pub mod config;
pub mod context;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod file_reconstructor;
pub mod heads;
pub mod ids;
pub mod manifest_reconstructor;
pub mod notes;
pub mod pack_session;
pub mod replace_map;
pub mod store_io;

pub use context::EngineContext;
pub use error::{EngineError, Result};
