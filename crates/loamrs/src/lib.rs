// Loam runtime memory core
// The incremental tri-color garbage collector and interned string table
// behind the Loam VM. The compiler and opcode interpreter live in
// sibling crates and consume this one through LoamVm.

#[cfg(test)]
mod test;

pub mod gc;
pub mod loam_value;
pub mod loam_vm;

pub use gc::{GcRef, GcState, GcStats, ObjectKind};
pub use loam_value::{LoamTable, LoamUpvalue, LoamValue, LoamValueKind, NativeFn, UpvalRef};
pub use loam_vm::{LoamError, LoamFullError, LoamResult, LoamVm};
