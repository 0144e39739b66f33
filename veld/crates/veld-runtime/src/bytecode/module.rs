//! Compiled Module Structures
//!
//! The external input to the runtime core: a compiled module holding one or
//! more compiled functions. These records are produced by the (out of
//! scope) compiler front-end or, in tests and embedders, by
//! [`builder::ModuleBuilder`](super::builder::ModuleBuilder).
//!
//! A module is immutable after loading; the runtime holds it behind an
//! `Arc` so function values can carry stable pointers to their records.

use veld_util::Symbol;

use crate::error::{Result, RuntimeError};

use super::{Instruction, Opcode};

/// Per-function static metadata
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionInfo {
    /// Maximum declared argument count
    pub argc: u8,
    /// Required argument count
    pub minargc: u8,
    /// Operand stack slots needed by the function body
    pub stacksize: u16,
    /// Local variable slots (arguments occupy the first slots)
    pub local_count: u16,
    /// Heap-captured variable slots (allocated in a FrameContext)
    pub heap_variables: u16,
    /// Arguments beyond `argc` are collected into a tuple
    pub spread: bool,
    /// Arrow function (no own `self`)
    pub arrow: bool,
    /// Class constructor (returns `self` by default)
    pub constructor: bool,
}

/// One `(ip_begin, ip_end, handler_ip)` exception-handler range.
///
/// `depth` is the operand-stack depth the handler expects; the thrower
/// truncates the stack to it before pushing the exception value.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionTableEntry {
    pub begin: u32,
    pub end: u32,
    pub handler: u32,
    pub depth: u16,
}

impl ExceptionTableEntry {
    #[inline]
    pub fn contains(&self, ip: u32) -> bool {
        self.begin <= ip && ip < self.end
    }

    #[inline]
    fn span(&self) -> u32 {
        self.end - self.begin
    }
}

/// A compiled function: bytecode, exception table, info block and child
/// function references.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: Symbol,
    pub info: FunctionInfo,
    pub bytecode: Vec<u32>,
    pub exception_table: Vec<ExceptionTableEntry>,
    /// Indices into the owning module's function table
    pub children: Vec<u32>,
}

impl CompiledFunction {
    /// Find the innermost handler whose range contains `ip`.
    pub fn find_handler(&self, ip: u32) -> Option<&ExceptionTableEntry> {
        self.exception_table
            .iter()
            .filter(|entry| entry.contains(ip))
            .min_by_key(|entry| entry.span())
    }

    /// Fetch and decode the instruction at `ip`.
    #[inline]
    pub fn fetch(&self, ip: usize) -> Instruction {
        Instruction(self.bytecode[ip])
    }
}

/// A compiled module: function table, entry point and constant pools.
#[derive(Debug, Clone, Default)]
pub struct CompiledModule {
    pub functions: Vec<CompiledFunction>,
    /// Index of the module-top function
    pub entry: u32,
    pub string_pool: Vec<String>,
    pub symbol_pool: Vec<Symbol>,
}

impl CompiledModule {
    /// Validate structural invariants before the module is handed to the
    /// scheduler: every opcode decodes, every branch lands inside its
    /// function, every pool / local / child index is in range.
    pub fn validate(&self) -> Result<()> {
        if self.functions.is_empty() {
            return Err(RuntimeError::ModuleValidation(
                "module has no functions".into(),
            ));
        }
        if self.entry as usize >= self.functions.len() {
            return Err(RuntimeError::ModuleValidation(format!(
                "entry index {} out of range",
                self.entry
            )));
        }

        for (index, function) in self.functions.iter().enumerate() {
            self.validate_function(index, function)?;
        }
        Ok(())
    }

    fn validate_function(&self, index: usize, function: &CompiledFunction) -> Result<()> {
        let fail = |message: String| {
            Err(RuntimeError::ModuleValidation(format!(
                "function {} ({}): {}",
                index, function.name, message
            )))
        };

        if function.bytecode.is_empty() {
            return fail("empty bytecode".into());
        }
        if function.info.minargc > function.info.argc {
            return fail("minargc exceeds argc".into());
        }
        if (function.info.argc as u16) > function.info.local_count {
            return fail("arguments exceed local slots".into());
        }

        let len = function.bytecode.len() as i64;
        for (ip, word) in function.bytecode.iter().enumerate() {
            let instr = Instruction(*word);
            let opcode = match instr.opcode() {
                Some(op) => op,
                None => return fail(format!("invalid opcode at ip {}", ip)),
            };

            match opcode {
                Opcode::Jmp | Opcode::JmpF | Opcode::JmpT => {
                    let target = ip as i64 + 1 + instr.iaaa() as i64;
                    if target < 0 || target >= len {
                        return fail(format!("branch target {} out of range at ip {}", target, ip));
                    }
                }
                Opcode::TestJmp | Opcode::CmpJmp => {
                    let target = ip as i64 + 1 + instr.ibb() as i64;
                    if target < 0 || target >= len {
                        return fail(format!("branch target {} out of range at ip {}", target, ip));
                    }
                }
                Opcode::SetIntercept => {
                    let target = ip as i64 + 1 + instr.ibb() as i64;
                    if target < 0 || target >= len {
                        return fail(format!(
                            "intercept target {} out of range at ip {}",
                            target, ip
                        ));
                    }
                }
                Opcode::LoadLocal | Opcode::SetLocal => {
                    if instr.bb() >= function.info.local_count {
                        return fail(format!("local index {} out of range", instr.bb()));
                    }
                }
                Opcode::LoadConst => {
                    let pool_len = match instr.a() {
                        super::POOL_STRING => self.string_pool.len(),
                        super::POOL_SYMBOL => self.symbol_pool.len(),
                        other => return fail(format!("invalid pool kind {}", other)),
                    };
                    if instr.bb() as usize >= pool_len {
                        return fail(format!("constant index {} out of range", instr.bb()));
                    }
                }
                Opcode::LoadGlobal | Opcode::SetGlobal => {
                    if instr.bb() as usize >= self.symbol_pool.len() {
                        return fail(format!("symbol index {} out of range", instr.bb()));
                    }
                }
                Opcode::MakeFunc => {
                    let child = instr.bb() as usize;
                    if child >= function.children.len() {
                        return fail(format!("child index {} out of range", child));
                    }
                    if function.children[child] as usize >= self.functions.len() {
                        return fail(format!("child {} resolves outside module", child));
                    }
                }
                _ => {}
            }
        }

        for (i, entry) in function.exception_table.iter().enumerate() {
            if entry.begin > entry.end
                || entry.end as usize > function.bytecode.len()
                || entry.handler as usize >= function.bytecode.len()
            {
                return fail(format!("exception table entry {} out of range", i));
            }
        }

        Ok(())
    }
}
