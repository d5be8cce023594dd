//! Build engine: recipe interpretation against an extracted context.
//!
//! The flow is leaves-first: the archive input goes through the
//! [`context`] module (extract + checksum), the [`recipe`] module splits
//! the build file into steps, and the [`engine`] drives dispatch, cache
//! probing, and commits.

pub mod context;
pub mod engine;
pub mod interpolate;
pub mod output;
pub mod recipe;
pub mod remote;
pub mod tarsum;

pub use context::BuildContext;
pub use engine::{BuildOptions, Builder, Instruction, DEFAULT_PATH_ENV};
pub use output::BuildOutput;
