//! Programmatic Module Assembly
//!
//! A small assembler producing [`CompiledModule`] values: labels with
//! back-patching, catch ranges, default-argument dispatch tables. It stands
//! in for the excluded compiler front-end so embedders and tests can
//! produce runnable modules.
//!
//! ```
//! use veld_runtime::bytecode::{ModuleBuilder, Opcode};
//!
//! let mut module = ModuleBuilder::new();
//! let mut main = module.function("main");
//! main.stacksize(2);
//! main.emit_smi(21);
//! main.emit_smi(21);
//! main.emit(Opcode::Add);
//! main.emit(Opcode::SetReturn);
//! main.emit(Opcode::Ret);
//! let entry = main.finish(&mut module);
//! let module = module.finish(entry).unwrap();
//! assert_eq!(module.functions.len(), 1);
//! ```

use veld_util::Symbol;

use crate::error::Result;

use super::module::{CompiledFunction, CompiledModule, ExceptionTableEntry, FunctionInfo};
use super::{Instruction, Opcode, POOL_STRING, POOL_SYMBOL};

/// A forward-referencable code position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builder for a whole module: function table plus constant pools.
#[derive(Default)]
pub struct ModuleBuilder {
    functions: Vec<CompiledFunction>,
    string_pool: Vec<String>,
    symbol_pool: Vec<Symbol>,
}

impl ModuleBuilder {
    pub fn new() -> ModuleBuilder {
        ModuleBuilder::default()
    }

    /// Start a new function builder. Finish it with
    /// [`FunctionBuilder::finish`] to register it in this module.
    pub fn function(&mut self, name: &str) -> FunctionBuilder {
        FunctionBuilder::new(Symbol::intern(name))
    }

    /// Intern a string into the module string pool, returning its index
    pub fn string_constant(&mut self, value: &str) -> u16 {
        if let Some(index) = self.string_pool.iter().position(|s| s == value) {
            return index as u16;
        }
        self.string_pool.push(value.to_string());
        (self.string_pool.len() - 1) as u16
    }

    /// Intern a symbol into the module symbol pool, returning its index
    pub fn symbol_constant(&mut self, name: &str) -> u16 {
        let symbol = Symbol::intern(name);
        if let Some(index) = self.symbol_pool.iter().position(|s| *s == symbol) {
            return index as u16;
        }
        self.symbol_pool.push(symbol);
        (self.symbol_pool.len() - 1) as u16
    }

    /// Seal the module with the given entry function and validate it.
    pub fn finish(self, entry: u32) -> Result<CompiledModule> {
        let module = CompiledModule {
            functions: self.functions,
            entry,
            string_pool: self.string_pool,
            symbol_pool: self.symbol_pool,
        };
        module.validate()?;
        Ok(module)
    }
}

/// Builder for one function's bytecode and metadata.
pub struct FunctionBuilder {
    name: Symbol,
    info: FunctionInfo,
    code: Vec<u32>,
    exception_table: Vec<ExceptionTableEntry>,
    children: Vec<u32>,
    labels: Vec<Option<u32>>,
    patches: Vec<Patch>,
}

struct Patch {
    position: usize,
    label: Label,
    wide: bool,
}

impl FunctionBuilder {
    fn new(name: Symbol) -> FunctionBuilder {
        FunctionBuilder {
            name,
            info: FunctionInfo {
                stacksize: 8,
                ..Default::default()
            },
            code: Vec::new(),
            exception_table: Vec::new(),
            children: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    // === Metadata ===

    pub fn args(&mut self, argc: u8, minargc: u8) -> &mut Self {
        self.info.argc = argc;
        self.info.minargc = minargc;
        if (argc as u16) > self.info.local_count {
            self.info.local_count = argc as u16;
        }
        self
    }

    pub fn stacksize(&mut self, slots: u16) -> &mut Self {
        self.info.stacksize = slots;
        self
    }

    pub fn locals(&mut self, count: u16) -> &mut Self {
        self.info.local_count = count.max(self.info.argc as u16);
        self
    }

    pub fn heap_variables(&mut self, count: u16) -> &mut Self {
        self.info.heap_variables = count;
        self
    }

    pub fn spread(&mut self) -> &mut Self {
        self.info.spread = true;
        // the collected tuple lives in the slot after the declared args
        if self.info.local_count < self.info.argc as u16 + 1 {
            self.info.local_count = self.info.argc as u16 + 1;
        }
        self
    }

    pub fn arrow(&mut self) -> &mut Self {
        self.info.arrow = true;
        self
    }

    pub fn constructor(&mut self) -> &mut Self {
        self.info.constructor = true;
        self
    }

    /// Register a child function (already finished into the module) and
    /// return its `MakeFunc` operand.
    pub fn child(&mut self, function_index: u32) -> u16 {
        self.children.push(function_index);
        (self.children.len() - 1) as u16
    }

    // === Labels ===

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current code position
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len() as u32);
    }

    /// Current code position as a bound label
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    // === Emission ===

    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        self.code.push(Instruction::op(opcode).0);
        self
    }

    pub fn emit_a(&mut self, opcode: Opcode, a: u8) -> &mut Self {
        self.code.push(Instruction::op_a(opcode, a).0);
        self
    }

    pub fn emit_abb(&mut self, opcode: Opcode, a: u8, bb: u16) -> &mut Self {
        self.code.push(Instruction::op_abb(opcode, a, bb).0);
        self
    }

    /// Push a small integer constant (24-bit signed)
    pub fn emit_smi(&mut self, value: i32) -> &mut Self {
        self.code.push(Instruction::op_aaa(Opcode::LoadSmi, value).0);
        self
    }

    /// Push null / true / false
    pub fn emit_null(&mut self) -> &mut Self {
        self.emit_a(Opcode::Load, 0)
    }

    pub fn emit_bool(&mut self, value: bool) -> &mut Self {
        self.emit_a(Opcode::Load, if value { 1 } else { 2 })
    }

    /// Push a string-pool constant
    pub fn emit_string(&mut self, index: u16) -> &mut Self {
        self.emit_abb(Opcode::LoadConst, POOL_STRING, index)
    }

    /// Push a symbol-pool constant
    pub fn emit_symbol(&mut self, index: u16) -> &mut Self {
        self.emit_abb(Opcode::LoadConst, POOL_SYMBOL, index)
    }

    /// Emit a wide branch (`jmp`, `jmpf`, `jmpt`) to a label
    pub fn emit_jump(&mut self, opcode: Opcode, target: Label) -> &mut Self {
        debug_assert!(matches!(
            opcode,
            Opcode::Jmp | Opcode::JmpF | Opcode::JmpT
        ));
        self.patches.push(Patch {
            position: self.code.len(),
            label: target,
            wide: true,
        });
        self.code.push(Instruction::op_aaa(opcode, 0).0);
        self
    }

    /// Emit an integer compare-and-branch to a label
    pub fn emit_cmpjmp(&mut self, kind: u8, target: Label) -> &mut Self {
        self.patches.push(Patch {
            position: self.code.len(),
            label: target,
            wide: false,
        });
        self.code.push(Instruction::op_abb(Opcode::CmpJmp, kind, 0).0);
        self
    }

    /// Emit a test-against-immediate branch to a label
    pub fn emit_testjmp(&mut self, value: i8, target: Label) -> &mut Self {
        self.patches.push(Patch {
            position: self.code.len(),
            label: target,
            wide: false,
        });
        self.code
            .push(Instruction::op_abb(Opcode::TestJmp, value as u8, 0).0);
        self
    }

    /// Emit a `setintercept` routing a non-local transfer through a
    /// finally block. For break/continue `target` is the ultimate
    /// destination; for return/throw it is ignored (bind it to the next
    /// instruction).
    pub fn emit_intercept(&mut self, kind: u8, target: Label) -> &mut Self {
        self.patches.push(Patch {
            position: self.code.len(),
            label: target,
            wide: false,
        });
        self.code
            .push(Instruction::op_abb(Opcode::SetIntercept, kind, 0).0);
        self
    }

    /// Record a catch range: throws with `begin <= ip < end` dispatch to
    /// `handler` with the operand stack truncated to `depth`.
    pub fn catch_range(&mut self, begin: Label, end: Label, handler: Label, depth: u16) {
        self.exception_table.push(ExceptionTableEntry {
            begin: self.resolve(begin),
            end: self.resolve(end),
            handler: self.resolve(handler),
            depth,
        });
    }

    /// Emit the default-argument dispatch table.
    ///
    /// A function with `minargc < argc` begins with one `jmp` per possible
    /// supplied count; `vm_call` starts execution at entry
    /// `supplied - minargc`, initializing every missing argument on the
    /// way to the body. `targets[i]` is the initializer for argument
    /// `minargc + i`; the last target is the body itself.
    pub fn default_arg_table(&mut self, targets: &[Label]) -> &mut Self {
        debug_assert_eq!(
            targets.len(),
            (self.info.argc - self.info.minargc) as usize + 1
        );
        for target in targets {
            self.emit_jump(Opcode::Jmp, *target);
        }
        self
    }

    fn resolve(&self, label: Label) -> u32 {
        self.labels[label.0].expect("label used before bind")
    }

    /// Seal the function into the module, resolving all patches, and
    /// return its function-table index.
    pub fn finish(mut self, module: &mut ModuleBuilder) -> u32 {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].expect("unbound label at finish") as i64;
            let offset = target - (patch.position as i64 + 1);
            let old = Instruction(self.code[patch.position]);
            let opcode = old.opcode().expect("patching invalid instruction");
            let patched = if patch.wide {
                Instruction::op_aaa(opcode, offset as i32)
            } else {
                debug_assert!((i16::MIN as i64..=i16::MAX as i64).contains(&offset));
                Instruction::op_abb(opcode, old.a(), offset as u16)
            };
            self.code[patch.position] = patched.0;
        }

        module.functions.push(CompiledFunction {
            name: self.name,
            info: self.info,
            bytecode: self.code,
            exception_table: self.exception_table,
            children: self.children,
        });
        (module.functions.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_minimal_module() {
        let mut module = ModuleBuilder::new();
        let mut main = module.function("main");
        main.stacksize(2);
        main.emit_smi(1);
        main.emit(Opcode::SetReturn);
        main.emit(Opcode::Ret);
        let entry = main.finish(&mut module);
        let module = module.finish(entry).unwrap();
        assert_eq!(module.entry, entry);
        assert_eq!(module.functions[0].bytecode.len(), 3);
    }

    #[test]
    fn test_backward_branch_patching() {
        let mut module = ModuleBuilder::new();
        let mut f = module.function("loop");
        f.stacksize(4).locals(1);

        f.emit_smi(0);
        f.emit_abb(Opcode::SetLocal, 0, 0);
        f.emit(Opcode::Pop);
        let top = f.here();
        f.emit_abb(Opcode::LoadLocal, 0, 0);
        f.emit_smi(1);
        f.emit(Opcode::Add);
        f.emit_abb(Opcode::SetLocal, 0, 0);
        f.emit_smi(10);
        f.emit_cmpjmp(super::super::CMP_LT, top);
        f.emit(Opcode::Ret);

        let entry = f.finish(&mut module);
        let module = module.finish(entry).unwrap();

        // the cmpjmp sits at ip 8 and targets ip 3: offset 3 - 9 = -6
        let instr = Instruction(module.functions[0].bytecode[8]);
        assert_eq!(instr.opcode(), Some(Opcode::CmpJmp));
        assert_eq!(instr.ibb(), -6);
    }

    #[test]
    fn test_forward_branch_patching() {
        let mut module = ModuleBuilder::new();
        let mut f = module.function("branchy");
        f.stacksize(4);

        let skip = f.label();
        f.emit_bool(true);
        f.emit_jump(Opcode::JmpT, skip);
        f.emit_smi(111);
        f.emit(Opcode::Pop);
        f.bind(skip);
        f.emit(Opcode::Ret);

        let entry = f.finish(&mut module);
        let module = module.finish(entry).unwrap();

        let instr = Instruction(module.functions[0].bytecode[1]);
        assert_eq!(instr.opcode(), Some(Opcode::JmpT));
        assert_eq!(instr.iaaa(), 2);
    }

    #[test]
    fn test_constant_pools_dedup() {
        let mut module = ModuleBuilder::new();
        let a = module.string_constant("hello world, long string");
        let b = module.string_constant("hello world, long string");
        assert_eq!(a, b);

        let s1 = module.symbol_constant("counter");
        let s2 = module.symbol_constant("counter");
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_catch_range_resolution() {
        let mut module = ModuleBuilder::new();
        let mut f = module.function("catchy");
        f.stacksize(4);

        let begin = f.here();
        f.emit_null();
        f.emit(Opcode::ThrowEx);
        let end = f.here();
        f.emit(Opcode::Ret);
        let handler = f.here();
        f.emit(Opcode::GetException);
        f.emit(Opcode::SetReturn);
        f.emit(Opcode::Ret);
        f.catch_range(begin, end, handler, 0);

        let entry = f.finish(&mut module);
        let module = module.finish(entry).unwrap();
        let table = &module.functions[0].exception_table;
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].begin, 0);
        assert_eq!(table[0].end, 2);
        assert_eq!(table[0].handler, 3);
    }
}
