//! Architecture-specific context switching
//!
//! A fiber's suspended execution state is a `SavedContext`: the stack
//! pointer, the resume address, and the callee-saved register file. Only
//! voluntary switch points exist (yield, park, finish), so caller-saved
//! registers never need to be preserved.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{init_context, switch_context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{init_context, switch_context};

/// Callee-saved register file captured at a voluntary switch point.
///
/// Field order is ABI: the switch assembly addresses these by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    /// Stack pointer (offset 0x00).
    pub sp: u64,
    /// Resume address (offset 0x08).
    pub pc: u64,
    /// Callee-saved registers (x86_64: rbx, rbp, r12..r15).
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            pc: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}
