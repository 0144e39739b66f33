//! Architecture-Specific Context Switching
//!
//! The fiber context is a single saved stack pointer: all callee-saved
//! registers live in a frame pushed onto the fiber's own stack by the
//! switch shim, so switching is symmetric — the outgoing fiber's registers
//! are pushed and its stack pointer stored, the incoming fiber's stack
//! pointer is loaded and its registers popped, and execution resumes at its
//! saved return address.
//!
//! A freshly initialized context fabricates that frame by hand: the planted
//! return address is a tiny entry shim that moves the thread pointer (also
//! planted, in a callee-saved slot) into the first argument register and
//! tail-calls the Rust trampoline through a planted function-pointer slot.
//! Keeping the trampoline address in a register slot instead of naming the
//! symbol in assembly sidesteps Mach-O / ELF symbol-prefix differences.

#[cfg(all(unix, target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(unix, target_arch = "x86_64"))]
pub(crate) use x86_64::{init_context, switch_context};

#[cfg(all(unix, target_arch = "aarch64"))]
mod aarch64;
#[cfg(all(unix, target_arch = "aarch64"))]
pub(crate) use aarch64::{init_context, switch_context};

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("fiber context switching is only implemented for unix x86_64 and aarch64");
