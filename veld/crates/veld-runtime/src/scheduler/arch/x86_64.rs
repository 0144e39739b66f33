//! x86_64 (System V) context switch.
//!
//! Saved frame, from the stored stack pointer upward:
//!
//! ```text
//! [sp + 0x00]  r15   <- thread pointer in a fresh context
//! [sp + 0x08]  r14   <- trampoline address in a fresh context
//! [sp + 0x10]  r13
//! [sp + 0x18]  r12
//! [sp + 0x20]  rbx
//! [sp + 0x28]  rbp
//! [sp + 0x30]  return address
//! ```
//!
//! The entry shim runs with the planted registers live: it moves the thread
//! pointer into `rdi` and calls through `r14`. Alignment: the fabricated
//! frame consumes 0x38 bytes below a 16-aligned top, so the shim starts
//! with a 16-aligned stack and its `call` re-establishes the ABI's
//! entry alignment for the trampoline.

use veld_util::align_down;

macro_rules! asm_symbol {
    ($name:literal) => {
        concat!(
            ".globl ",
            sym_prefix!(),
            $name,
            "\n",
            ".balign 16\n",
            sym_prefix!(),
            $name,
            ":"
        )
    };
}

#[cfg(target_os = "macos")]
macro_rules! sym_prefix {
    () => {
        "_"
    };
}

#[cfg(not(target_os = "macos"))]
macro_rules! sym_prefix {
    () => {
        ""
    };
}

std::arch::global_asm!(
    ".text",
    asm_symbol!("veld_fiber_switch"),
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    asm_symbol!("veld_fiber_entry"),
    "mov rdi, r15",
    "call r14",
    "ud2",
);

extern "C" {
    fn veld_fiber_switch(save: *mut *mut u8, restore: *const *mut u8);
    fn veld_fiber_entry();
}

/// Switch contexts: store the current stack pointer through `save`, adopt
/// the one behind `restore`.
///
/// # Safety
/// `restore` must hold a stack pointer produced by [`init_context`] or a
/// previous switch, whose stack is live and owned by the caller's runtime.
#[inline]
pub(crate) unsafe fn switch_context(save: *mut *mut u8, restore: *const *mut u8) {
    veld_fiber_switch(save, restore);
}

/// Fabricate the initial frame for a fresh fiber.
///
/// # Safety
/// `stack_top` must be the high end of a writable stack with at least one
/// page of headroom; `thread` must outlive the fiber.
pub(crate) unsafe fn init_context(
    stack_top: *mut u8,
    thread: *mut u8,
    trampoline: extern "C" fn(*mut u8) -> !,
) -> *mut u8 {
    let top = align_down(stack_top as usize, 16);
    let sp = (top - 0x38) as *mut u64;

    sp.add(0).write(thread as u64); // r15
    sp.add(1).write(trampoline as usize as u64); // r14
    sp.add(2).write(0); // r13
    sp.add(3).write(0); // r12
    sp.add(4).write(0); // rbx
    sp.add(5).write(0); // rbp
    sp.add(6).write(veld_fiber_entry as usize as u64); // return address

    sp as *mut u8
}
