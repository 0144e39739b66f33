//! # veld-runtime - Fiber-Concurrent Scripting Language Runtime Core
//!
//! The runtime core of the Veld language: tagged single-word values, a
//! region-based heap with a concurrent mark/evacuate/update-reference
//! collector, and an M:N fiber scheduler over a fixed pool of OS workers.
//!
//! ## Overview
//!
//! - **Values**: every runtime value is one machine word. Integers,
//!   floats, booleans, nulls/error sentinels, short strings and interned
//!   symbols are encoded immediately; everything else is an 8-byte-aligned
//!   heap pointer whose shape lives in a 16-byte object header.
//! - **Heap**: 16 KiB bump-allocated regions. Each scheduler processor
//!   owns an active region, so the mutator fast path is a fenceless bump;
//!   a mutex-guarded global region serves non-worker threads.
//! - **Collector**: a dedicated thread running concurrent tri-color mark,
//!   evacuation of sparse regions behind per-object forwarding pointers,
//!   and a reference-update sweep, with short stop-the-world pauses at
//!   phase boundaries driven by worker safepoints.
//! - **Scheduler**: cooperative fibers with their own guard-paged stacks,
//!   multiplexed over workers that run a work-stealing loop (local queue,
//!   1/32-biased global queue, steal-half) and preempt fibers that
//!   overrun their 10 ms timeslice at the next safepoint.
//!
//! ## Quick Start
//!
//! ```no_run
//! use veld_runtime::bytecode::{ModuleBuilder, Opcode};
//! use veld_runtime::{Runtime, RuntimeConfig};
//!
//! fn main() -> veld_runtime::Result<()> {
//!     let rt = Runtime::new(RuntimeConfig::default())?;
//!     rt.start();
//!
//!     let mut module = ModuleBuilder::new();
//!     let mut main_fn = module.function("main");
//!     main_fn.stacksize(2);
//!     main_fn.emit_smi(21);
//!     main_fn.emit_smi(21);
//!     main_fn.emit(Opcode::Add);
//!     main_fn.emit(Opcode::SetReturn);
//!     main_fn.emit(Opcode::Ret);
//!     let entry = main_fn.finish(&mut module);
//!     let module = module.finish(entry)?;
//!
//!     let outcome = rt.run_module(module)?;
//!     assert_eq!(outcome.value().as_int(), 42);
//!
//!     rt.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`value`]: tagged value encoding, shape ids, numeric semantics
//! - [`heap`]: regions, object headers, allocator, barriered access
//! - [`gc`]: concurrent collector and its phase machine
//! - [`scheduler`]: processors, workers, fibers, stop-the-world
//! - [`interp`]: call frames, thread control blocks, dispatch loop
//! - [`bytecode`]: compiled modules, instruction encoding, assembler
//! - [`runtime`]: the owning facade and embedder surface
//!
//! ## Platform Support
//!
//! | Platform | Status |
//! |----------|--------|
//! | Linux x86_64 | ✅ Full |
//! | Linux aarch64 | ✅ Full |
//! | macOS x86_64 / Apple Silicon | ✅ Full |
//! | Others | ❌ (no context-switch shim) |

pub mod bytecode;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod interp;
pub mod runtime;
pub mod scheduler;
pub mod value;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use runtime::{FiberHandle, FiberOutcome, NativeEntry, NativeFn, Runtime};
pub use value::{ErrorCode, ShapeId, Value};

/// Crate version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a runtime with default configuration. The runtime must be
/// started before fibers can be spawned.
pub fn init() -> Result<std::sync::Arc<Runtime>> {
    Runtime::with_defaults()
}

/// Build a runtime with a custom configuration.
pub fn init_with_config(config: RuntimeConfig) -> Result<std::sync::Arc<Runtime>> {
    Runtime::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let rt = init();
        assert!(rt.is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
