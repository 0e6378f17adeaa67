//! x86_64 context switching
//!
//! Naked-function inline assembly, stable since Rust 1.88.

use super::SavedContext;
use std::arch::naked_asm;

/// Initialize a fresh fiber context.
///
/// When first switched to, execution enters the trampoline, which calls
/// `entry_fn(entry_arg)` and then the finish handler.
///
/// # Safety
///
/// `regs` must point to valid `SavedContext` memory; `stack_top` must be the
/// high end of a mapped stack region.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // System V AMD64: 16-byte alignment, minus 8 for the "call" slot.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let regs = &mut *regs;
    regs.sp = aligned_sp as u64;
    regs.pc = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First-switch trampoline: `entry_fn` in r12, its argument in r13.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finish}",
        "ud2",
        finish = sym crate::fiber::fiber_finished,
    );
}

/// Voluntary context switch.
///
/// Saves the callee-saved register file to `save` and resumes from
/// `restore`. Returns when something later switches back into `save`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _restore: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from restore (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the resume address
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
