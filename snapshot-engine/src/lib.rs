//! In-process snapshot engine: stop-the-world coordination, frame-pointer
//! stack unwinding, a bytecode stack-machine interpreter, and a
//! pointer-chase work queue, assembled into a single compact binary
//! snapshot buffer per call.
//!
//! The engine never touches the target process directly — every read of
//! its address space and every pause of its other threads goes through
//! the collaborator traits in [`collaborators`], so this crate compiles
//! and tests standalone against the in-process fake target.

pub mod buffer;
pub mod collaborators;
pub mod config;
pub mod decoder;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod murmur;
pub mod program;
pub mod queue;
pub mod snapshotter;
pub mod type_resolver;
pub mod unwinder;

pub use config::{Config, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use metrics::EngineMetrics;
pub use program::{RuntimeConfig, SnapshotProgram};
pub use snapshotter::{SnapshotResponse, Snapshotter};
