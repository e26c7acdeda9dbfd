// Global runtime state and the embedder-facing API.

mod loam_error;
pub mod loam_limits;
mod vm;

pub use loam_error::{LoamError, LoamFullError, LoamResult};
pub use vm::LoamVm;


