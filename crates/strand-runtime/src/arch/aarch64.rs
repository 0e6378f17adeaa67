//! aarch64 context switching
//!
//! TODO: port the x86_64 switch (save x19-x28/fp/lr/sp + d8-d15) for
//! Linux ARM and Apple Silicon.

use super::SavedContext;

/// Initialize a fresh fiber context.
pub unsafe fn init_context(
    _regs: *mut SavedContext,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Voluntary context switch.
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _restore: *const SavedContext) {
    todo!("aarch64 switch_context not yet implemented")
}
