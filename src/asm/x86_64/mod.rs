//! The x86-64 JIT backend. Generated code implements the IJVM stack and
//! calling convention directly on the machine stack; I/O and the heap go
//! through a table of host function pointers handed to the entry point in
//! `rdi` and kept in `r14`.
//!
//! Off limits as scratch: `rbx`, `rsp`, `rbp`, `r12`-`r15`. Every IJVM stack
//! slot is a 64-bit word; arithmetic happens on the low 32 bits and is
//! sign-extended back, preserving 32-bit wrap-around.
//!
//! Each function's frame, addressed as `[rbp - offset]`:
//!
//! ```text
//! |  OBJREF    | <- rbp            (non-main only)
//! |  args      |
//! |  prev pc   |   __ret_addr__
//! |  prev rbp  |   __base_ptr__
//! |  saved rsp |   __rsp__         (scratch for ABI-aligned external calls)
//! |  lvars     |
//! |  sentinel  |
//! |  lstack    | <- rsp
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use indexmap::IndexMap;
use log::{debug, log_enabled, Level};
use memmap::MmapMut;

use crate::error::{Error, Result};
use super::{Assembler as AssemblerTrait, ConstantPool};

mod assembler;
pub use assembler::{Assembler, Label, Register, Condition, BinaryOp, disp32};

use Register::*;

/** Offsets into the external function table held in `r14`. */
const FN_GETCHAR: i32 = 0 * 8;
const FN_PUTCHAR: i32 = 1 * 8;
const FN_HALT: i32 = 2 * 8;
const FN_ERR: i32 = 3 * 8;
#[allow(dead_code)]
const FN_CALLOC: i32 = 4 * 8;
const FN_NEWARRAY: i32 = 5 * 8;
const FN_IALOAD: i32 = 6 * 8;
const FN_IASTORE: i32 = 7 * 8;
const FN_DEBUG: i32 = 8 * 8;

/** Pushed below the locals as a safety barrier against stack underruns. */
const SENTINEL: i64 = 0x1337133713371337;

//-----------------------------------------------------------------------------

/** The x86-64 code generator described in the module docs. */
pub struct X64Assembler {
    pool: ConstantPool,
    a: Assembler,
    /** `"fname#label"` to jump target. */
    labels: IndexMap<String, Label>,
    /** Function name to entry point. */
    funcs: IndexMap<String, Label>,
    /** Local variable name to `rbp` offset in the current function. */
    frame: IndexMap<String, i32>,
    fname: String,
    /** Emit a `debug` shim call at every label. */
    trace: bool,
}

impl Default for X64Assembler {
    fn default() -> Self { X64Assembler::new() }
}

impl X64Assembler {
    pub fn new() -> Self {
        let mut a = Assembler::new();
        // The entry preamble: the host passes the function table in rdi.
        a.mov_rr(R14, RDI);
        X64Assembler {
            pool: ConstantPool::new(),
            a,
            labels: IndexMap::new(),
            funcs: IndexMap::new(),
            frame: IndexMap::new(),
            fname: "main".to_string(),
            trace: false,
        }
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    fn qualify(&self, label: &str) -> String {
        format!("{}#{}", self.fname, label)
    }

    fn var_offset(&self, var: &str) -> Result<i32> {
        self.frame.get(var).copied().ok_or_else(|| {
            Error::semantic(format!(
                "'{}' is not a local variable of {}", var, self.fname))
        })
    }

    /**
     * Brackets a call out to host code: the stack pointer is parked in the
     * frame and 16-byte aligned as the host ABI requires, then restored.
     * Arguments must already be in `rdi`/`rsi`/`rdx`.
     */
    fn extern_call(&mut self, table_offset: i32) -> Result<()> {
        let rsp_slot = self.var_offset("__rsp__")?;
        self.a.push_r(R14);
        self.a.store((RBP, -rsp_slot), RSP);
        self.a.and_ri8(RSP, -16);
        self.a.load(RA, (R14, table_offset));
        self.a.call_r(RA);
        self.a.load(RSP, (RBP, -rsp_slot));
        self.a.pop_r(R14);
        Ok(())
    }

    fn branch(&mut self, cc: Condition, label: &str) -> Result<()> {
        let key = self.qualify(label);
        let label = self.labels.entry(key).or_default();
        self.a.jump_if(cc, label);
        Ok(())
    }

    fn not_implemented(&self, op: &str) -> Error {
        Error::semantic(format!("not implemented in the x86-64 backend: {}", op))
    }

    fn finalize(&self) -> Result<()> {
        for (name, label) in &self.labels {
            if !label.is_defined() {
                return Err(Error::link(format!(
                    "branch to undefined label '{}'", name)));
            }
        }
        for (name, label) in &self.funcs {
            if !label.is_defined() {
                return Err(Error::link(format!(
                    "call to undefined function '{}'", name)));
            }
        }
        Ok(())
    }

    /**
     * Finalises the code, redirects the shim I/O, and transfers control to
     * the generated entry point. Does not return on success: the generated
     * code leaves via `exit()` when it executes HALT or ERR.
     */
    pub fn run(self, input: Option<&Path>, output: Option<&Path>) -> Result<()> {
        self.finalize()?;

        {
            let mut io = JIT_IO.lock().unwrap();
            io.input = match input {
                Some(path) => Some(File::open(path)?),
                None => None,
            };
            io.output = match output {
                Some(path) => Some(File::create(path)?),
                None => None,
            };
        }

        let code = self.a.code();
        let mut memory = MmapMut::map_anon(code.len())?;
        memory[..code.len()].copy_from_slice(code);
        let memory = memory.make_exec()?;

        let table = shim_table();

        debug!("transferring control to {} bytes of generated code", code.len());
        let entry: extern "C" fn(*const u64) =
            unsafe { std::mem::transmute(memory.as_ptr()) };
        entry(table.as_ptr());
        unreachable!("generated code returned");
    }
}

impl AssemblerTrait for X64Assembler {
    fn pool(&self) -> &ConstantPool { &self.pool }
    fn pool_mut(&mut self) -> &mut ConstantPool { &mut self.pool }

    fn function(&mut self, name: &str, args: &[String], vars: &[String]) -> Result<()> {
        self.fname = name.to_string();
        self.frame.clear();

        debug!("stack frame for {}:", name);
        let mut offset = 0;
        if name != "main" {
            self.frame.insert("OBJREF".to_string(), 0);
        } else {
            offset = -8;
        }
        for arg in args {
            offset += 8;
            self.frame.insert(arg.clone(), offset);
        }
        offset += 8;
        self.frame.insert("__ret_addr__".to_string(), offset);
        offset += 8;
        self.frame.insert("__base_ptr__".to_string(), offset);
        offset += 8;
        self.frame.insert("__rsp__".to_string(), offset);
        for var in vars {
            offset += 8;
            self.frame.insert(var.clone(), offset);
        }
        if log_enabled!(Level::Debug) {
            for (var, off) in &self.frame {
                debug!("    [rbp - {:3}] = {}", off, var);
            }
        }

        let label = self.funcs.entry(name.to_string()).or_default();
        self.a.define(label);

        // Prologue: the caller has pushed OBJREF, the arguments and the
        // return address; rbp is made to point at the OBJREF slot. main has
        // no OBJREF slot, so its rbp lands one slot lower, on the return
        // address itself, matching the offset table above.
        self.a.push_r(RBP);
        let caller_slots = (if name == "main" { 1 } else { 2 }) + args.len() as i32;
        self.a.lea(RBP, (RSP, caller_slots * 8));
        self.a.sub_ri32(RSP, (vars.len() as i32 + 1) * 8);
        self.a.mov_ri64(RA, SENTINEL);
        self.a.push_r(RA);
        Ok(())
    }

    fn label(&mut self, name: &str) -> Result<()> {
        let key = self.qualify(name);
        let label = self.labels.entry(key.clone()).or_default();
        if label.is_defined() {
            return Err(Error::semantic(format!("label '{}' defined twice", key)));
        }
        self.a.define(label);
        if self.trace {
            let here = self.a.here();
            self.a.mov_ri64(RDI, here as i64);
            self.extern_call(FN_DEBUG)?;
        }
        Ok(())
    }

    fn is_var(&self, name: &str) -> bool {
        self.frame.contains_key(name)
    }

    fn compile(&mut self, sink: &mut dyn Write) -> Result<()> {
        self.finalize()?;
        sink.write_all(self.a.code())?;
        Ok(())
    }

    fn bipush(&mut self, value: i8) -> Result<()> {
        self.a.push_imm8(value);
        Ok(())
    }

    fn dup(&mut self) -> Result<()> {
        self.a.push_mem_rsp();
        Ok(())
    }

    fn iadd(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.pop_r(RC);
        self.a.op32_rr(BinaryOp::Add, RC, RA);
        self.a.movsxd(RA, RC);
        self.a.push_r(RA);
        Ok(())
    }

    fn isub(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.pop_r(RC);
        self.a.op32_rr(BinaryOp::Sub, RC, RA);
        self.a.movsxd(RA, RC);
        self.a.push_r(RA);
        Ok(())
    }

    fn iand(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.op_mem_rsp(BinaryOp::And, RA);
        Ok(())
    }

    fn ior(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.op_mem_rsp(BinaryOp::Or, RA);
        Ok(())
    }

    fn pop(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        Ok(())
    }

    fn swap(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.pop_r(RC);
        self.a.push_r(RA);
        self.a.push_r(RC);
        Ok(())
    }

    fn nop(&mut self) -> Result<()> { Ok(()) }

    fn ldc_w(&mut self, constant: &str) -> Result<()> {
        let value = self.pool.get(constant).ok_or_else(|| {
            Error::semantic(format!("LDC_W of undeclared constant '{}'", constant))
        })?;
        self.a.push_imm32(value);
        Ok(())
    }

    fn iload(&mut self, var: &str) -> Result<()> {
        let offset = self.var_offset(var)?;
        self.a.load(RA, (RBP, -offset));
        self.a.push_r(RA);
        Ok(())
    }

    fn istore(&mut self, var: &str) -> Result<()> {
        let offset = self.var_offset(var)?;
        self.a.pop_r(RA);
        self.a.store((RBP, -offset), RA);
        Ok(())
    }

    fn iinc(&mut self, var: &str, value: i8) -> Result<()> {
        let offset = self.var_offset(var)?;
        self.a.add_mem_imm8((RBP, -offset), value);
        Ok(())
    }

    /** Local-variable widths are a bytecode concern; nothing to do here. */
    fn wide(&mut self) -> Result<()> { Ok(()) }

    fn halt(&mut self) -> Result<()> {
        self.extern_call(FN_HALT)
    }

    fn err(&mut self) -> Result<()> {
        self.extern_call(FN_ERR)
    }

    fn in_(&mut self) -> Result<()> {
        self.extern_call(FN_GETCHAR)?;
        self.a.push_r(RA);
        Ok(())
    }

    fn out(&mut self) -> Result<()> {
        self.a.pop_r(RDI);
        self.extern_call(FN_PUTCHAR)
    }

    fn goto(&mut self, label: &str) -> Result<()> {
        let key = self.qualify(label);
        let label = self.labels.entry(key).or_default();
        self.a.const_jump(label);
        Ok(())
    }

    fn ifeq(&mut self, label: &str) -> Result<()> {
        self.a.pop_r(RA);
        self.a.cmp_ri8(RA, 0);
        self.branch(Condition::Z, label)
    }

    fn iflt(&mut self, label: &str) -> Result<()> {
        self.a.pop_r(RA);
        self.a.cmp_ri8(RA, 0);
        self.branch(Condition::L, label)
    }

    fn icmpeq(&mut self, label: &str) -> Result<()> {
        self.a.pop_r(RA);
        self.a.pop_r(RC);
        self.a.cmp_rr(RA, RC);
        self.branch(Condition::Z, label)
    }

    fn invokevirtual(&mut self, func: &str) -> Result<()> {
        let label = self.funcs.entry(func.to_string()).or_default();
        self.a.const_call(label);
        self.a.push_r(RA);
        Ok(())
    }

    fn ireturn(&mut self) -> Result<()> {
        let ret = self.var_offset("__ret_addr__")?;
        let base = self.var_offset("__base_ptr__")?;
        self.a.pop_r(RA);
        self.a.load(RC, (RBP, -ret));
        self.a.mov_rr(RSP, RBP);
        self.a.load(RBP, (RBP, -base));
        self.a.jump_r(RC);
        Ok(())
    }

    fn newarray(&mut self) -> Result<()> {
        self.a.pop_r(RDI);
        self.extern_call(FN_NEWARRAY)?;
        self.a.push_r(RA);
        Ok(())
    }

    fn iaload(&mut self) -> Result<()> {
        self.a.pop_r(RDI);
        self.a.pop_r(RSI);
        self.extern_call(FN_IALOAD)?;
        self.a.push_r(RA);
        Ok(())
    }

    fn iastore(&mut self) -> Result<()> {
        self.a.pop_r(RDI);
        self.a.pop_r(RSI);
        self.a.pop_r(RD);
        self.extern_call(FN_IASTORE)
    }

    fn gc(&mut self) -> Result<()> {
        Err(self.not_implemented("GC"))
    }

    fn netbind(&mut self) -> Result<()> {
        Err(self.not_implemented("NETBIND"))
    }

    fn netconnect(&mut self) -> Result<()> {
        Err(self.not_implemented("NETCONNECT"))
    }

    fn netin(&mut self) -> Result<()> {
        Err(self.not_implemented("NETIN"))
    }

    fn netout(&mut self) -> Result<()> {
        Err(self.not_implemented("NETOUT"))
    }

    fn netclose(&mut self) -> Result<()> {
        Err(self.not_implemented("NETCLOSE"))
    }

    fn shl(&mut self) -> Result<()> {
        self.a.pop_r(RC);
        self.a.pop_r(RA);
        self.a.shl32_cl(RA);
        self.a.movsxd(RA, RA);
        self.a.push_r(RA);
        Ok(())
    }

    fn shr(&mut self) -> Result<()> {
        self.a.pop_r(RC);
        self.a.pop_r(RA);
        self.a.shr32_cl(RA);
        self.a.movsxd(RA, RA);
        self.a.push_r(RA);
        Ok(())
    }

    fn imul(&mut self) -> Result<()> {
        self.a.pop_r(RA);
        self.a.pop_r(RC);
        self.a.imul32_rr(RA, RC);
        self.a.movsxd(RA, RA);
        self.a.push_r(RA);
        Ok(())
    }

    fn idiv(&mut self) -> Result<()> {
        self.a.pop_r(RC);
        self.a.pop_r(RA);
        self.a.cdq();
        self.a.idiv32(RC);
        self.a.movsxd(RA, RA);
        self.a.push_r(RA);
        Ok(())
    }

    /** A single native multiply beats the portable shift-and-add expansion. */
    fn imul_const(&mut self, factor: i32) -> Result<()> {
        self.a.pop_r(RA);
        self.a.imul32_rri(RA, RA, factor);
        self.a.movsxd(RA, RA);
        self.a.push_r(RA);
        Ok(())
    }
}

//-----------------------------------------------------------------------------
// Host shims called by the generated code.

/** The table of host entry points handed to the generated code in `rdi`. */
fn shim_table() -> [u64; 9] {
    [
        getchar_shim as usize as u64,
        putchar_shim as usize as u64,
        halt_shim as usize as u64,
        err_shim as usize as u64,
        calloc_shim as usize as u64,
        newarray_shim as usize as u64,
        iaload_shim as usize as u64,
        iastore_shim as usize as u64,
        debug_shim as usize as u64,
    ]
}

struct JitIo {
    input: Option<File>,
    output: Option<File>,
}

static JIT_IO: Mutex<JitIo> = Mutex::new(JitIo {input: None, output: None});

extern "C" fn getchar_shim() -> i64 {
    let mut io = JIT_IO.lock().unwrap();
    let mut byte = [0u8; 1];
    let got = match &mut io.input {
        Some(file) => file.read(&mut byte),
        None => std::io::stdin().read(&mut byte),
    };
    match got {
        Ok(1) => byte[0] as i64,
        _ => 0,
    }
}

extern "C" fn putchar_shim(c: i64) {
    let mut io = JIT_IO.lock().unwrap();
    let byte = [c as u8];
    let _ = match &mut io.output {
        Some(file) => file.write_all(&byte),
        None => {
            let mut stdout = std::io::stdout();
            let result = stdout.write_all(&byte);
            let _ = stdout.flush();
            result
        },
    };
}

extern "C" fn halt_shim() -> ! {
    std::process::exit(0);
}

extern "C" fn err_shim() -> ! {
    eprintln!("ERR encountered");
    std::process::exit(1);
}

extern "C" fn calloc_shim(count: u64, size: u64) -> *mut u8 {
    let bytes = (count * size).max(1) as usize;
    let layout = std::alloc::Layout::from_size_align(bytes, 8).unwrap();
    unsafe { std::alloc::alloc_zeroed(layout) }
}

/** There is no garbage collector: arrays live until the process exits. */
extern "C" fn newarray_shim(len: i64) -> *mut i64 {
    let array = vec![0i64; len.max(0) as usize].into_boxed_slice();
    Box::leak(array).as_mut_ptr()
}

extern "C" fn iaload_shim(array: *const i64, index: i64) -> i64 {
    unsafe { *array.offset(index as isize) }
}

extern "C" fn iastore_shim(array: *mut i64, index: i64, value: i64) {
    unsafe { *array.offset(index as isize) = value };
}

extern "C" fn debug_shim(word: u64) {
    debug!("trace {:#x}", word);
}

//-----------------------------------------------------------------------------
