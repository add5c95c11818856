//! The target-independent assembler abstraction. Frontends emit one method
//! call per instruction into an [`Assembler`]; the three backends turn the
//! stream into IJVM bytecode, JAS text or x86-64 machine code.

use std::io::Write;

use indexmap::IndexMap;

use crate::error::{Result};

mod ijvm;
pub use ijvm::{IjvmAssembler, IJVM_MAGIC};

mod jas;
pub use jas::{JasAssembler};

pub mod x86_64;
pub use x86_64::{X64Assembler};

//-----------------------------------------------------------------------------

/** The IJVM operation codes with their fixed wire values. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum Opcode {
    NOP           = 0x00,
    BIPUSH        = 0x10,
    LDC_W         = 0x13,
    ILOAD         = 0x15,
    ISTORE        = 0x36,
    POP           = 0x57,
    DUP           = 0x59,
    SWAP          = 0x5F,
    IADD          = 0x60,
    ISUB          = 0x64,
    SHL           = 0x70,
    SHR           = 0x71,
    IMUL          = 0x72,
    IDIV          = 0x73,
    IAND          = 0x7E,
    IINC          = 0x84,
    IFEQ          = 0x99,
    IFLT          = 0x9B,
    ICMPEQ        = 0x9F,
    GOTO          = 0xA7,
    IRETURN       = 0xAC,
    IOR           = 0xB0,
    INVOKEVIRTUAL = 0xB6,
    WIDE          = 0xC4,
    NEWARRAY      = 0xD1,
    IALOAD        = 0xD2,
    IASTORE       = 0xD3,
    GC            = 0xD4,
    NETBIND       = 0xE1,
    NETCONNECT    = 0xE2,
    NETIN         = 0xE3,
    NETOUT        = 0xE4,
    NETCLOSE      = 0xE5,
    IN            = 0xFC,
    OUT           = 0xFD,
    ERR           = 0xFE,
    HALT          = 0xFF,
}

use Opcode::*;

const ALL_OPCODES: [Opcode; 37] = [
    NOP, BIPUSH, LDC_W, ILOAD, ISTORE, POP, DUP, SWAP, IADD, ISUB, SHL, SHR,
    IMUL, IDIV, IAND, IINC, IFEQ, IFLT, ICMPEQ, GOTO, IRETURN, IOR,
    INVOKEVIRTUAL, WIDE, NEWARRAY, IALOAD, IASTORE, GC, NETBIND, NETCONNECT,
    NETIN, NETOUT, NETCLOSE, IN, OUT, ERR, HALT,
];

impl Opcode {
    /** Decodes a wire byte, or `None` if it is not a known opcode. */
    pub fn parse(byte: u8) -> Option<Opcode> {
        ALL_OPCODES.iter().copied().find(|&op| op as u8 == byte)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            NOP => "NOP", BIPUSH => "BIPUSH", LDC_W => "LDC_W",
            ILOAD => "ILOAD", ISTORE => "ISTORE", POP => "POP", DUP => "DUP",
            SWAP => "SWAP", IADD => "IADD", ISUB => "ISUB", SHL => "SHL",
            SHR => "SHR", IMUL => "IMUL", IDIV => "IDIV", IAND => "IAND",
            IINC => "IINC", IFEQ => "IFEQ", IFLT => "IFLT", ICMPEQ => "ICMPEQ",
            GOTO => "GOTO", IRETURN => "IRETURN", IOR => "IOR",
            INVOKEVIRTUAL => "INVOKEVIRTUAL", WIDE => "WIDE",
            NEWARRAY => "NEWARRAY", IALOAD => "IALOAD", IASTORE => "IASTORE",
            GC => "GC", NETBIND => "NETBIND", NETCONNECT => "NETCONNECT",
            NETIN => "NETIN", NETOUT => "NETOUT", NETCLOSE => "NETCLOSE",
            IN => "IN", OUT => "OUT", ERR => "ERR", HALT => "HALT",
        }
    }

    /** Looks up a JAS mnemonic. `IF_ICMPEQ` is an accepted alias. */
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        if name == "IF_ICMPEQ" {
            return Some(ICMPEQ);
        }
        ALL_OPCODES.iter().copied().find(|op| op.mnemonic() == name)
    }

    /** Takes a local-variable operand (auto-WIDE above index 255). */
    pub fn has_var_arg(self) -> bool {
        matches!(self, ILOAD | ISTORE | IINC)
    }

    /** Takes a function-local label operand. */
    pub fn has_label_arg(self) -> bool {
        matches!(self, GOTO | IFEQ | IFLT | ICMPEQ)
    }

    pub fn has_const_arg(self) -> bool {
        self == LDC_W
    }

    pub fn has_fun_arg(self) -> bool {
        self == INVOKEVIRTUAL
    }

    /** Takes a signed-byte immediate operand. */
    pub fn has_imm_arg(self) -> bool {
        matches!(self, BIPUSH | IINC)
    }

    /** Ends a basic block with no fall-through. */
    pub fn is_final(self) -> bool {
        matches!(self, IRETURN | HALT | ERR)
    }
}

//-----------------------------------------------------------------------------

/**
 * The named integer constants of the program being assembled, in declaration
 * order. The position of a name is its emitted pool index.
 */
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    map: IndexMap<String, i32>,
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool {map: IndexMap::new()}
    }

    /** Declares `name`, or updates its value keeping its position. */
    pub fn set(&mut self, name: &str, value: i32) {
        if let Some(slot) = self.map.get_mut(name) {
            *slot = value;
        } else {
            self.map.insert(name.to_string(), value);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<i32> {
        self.map.get(name).copied()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.map.get_index_of(name)
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item=(&str, i32)> {
        self.map.iter().map(|(name, &value)| (name.as_str(), value))
    }
}

//-----------------------------------------------------------------------------

/**
 * A target-independent instruction sink. One required method per opcode, plus
 * bookkeeping for named constants, local variables and labels. The pseudo-ops
 * are provided methods built from the primitives, so every backend gets them
 * for free; a backend with a better native encoding may override them.
 *
 * Calling discipline: `function()` ends the emission scope of the previous
 * function and starts a new one; `label()` marks the next emission point;
 * `compile()` links and drains the artifact.
 */
pub trait Assembler {
    /** The constant pool. */
    fn pool(&self) -> &ConstantPool;

    /** The constant pool. */
    fn pool_mut(&mut self) -> &mut ConstantPool;

    /** Ends the previous function and begins `name` with `args` and `vars`. */
    fn function(&mut self, name: &str, args: &[String], vars: &[String]) -> Result<()>;

    /** Marks the next emission point with a function-local label. */
    fn label(&mut self, name: &str) -> Result<()>;

    /** Tests whether `name` is a local variable of the current function. */
    fn is_var(&self, name: &str) -> bool;

    /** Finalises (links) and drains the artifact into `sink`. */
    fn compile(&mut self, sink: &mut dyn Write) -> Result<()>;

    fn bipush(&mut self, value: i8) -> Result<()>;
    fn dup(&mut self) -> Result<()>;
    fn iadd(&mut self) -> Result<()>;
    fn iand(&mut self) -> Result<()>;
    fn ior(&mut self) -> Result<()>;
    fn isub(&mut self) -> Result<()>;
    fn pop(&mut self) -> Result<()>;
    fn swap(&mut self) -> Result<()>;
    fn nop(&mut self) -> Result<()>;

    fn ldc_w(&mut self, constant: &str) -> Result<()>;

    fn iload(&mut self, var: &str) -> Result<()>;
    fn istore(&mut self, var: &str) -> Result<()>;
    fn iinc(&mut self, var: &str, value: i8) -> Result<()>;
    fn wide(&mut self) -> Result<()>;

    fn halt(&mut self) -> Result<()>;
    fn err(&mut self) -> Result<()>;
    fn in_(&mut self) -> Result<()>;
    fn out(&mut self) -> Result<()>;

    fn goto(&mut self, label: &str) -> Result<()>;
    fn ifeq(&mut self, label: &str) -> Result<()>;
    fn iflt(&mut self, label: &str) -> Result<()>;
    fn icmpeq(&mut self, label: &str) -> Result<()>;

    fn invokevirtual(&mut self, func: &str) -> Result<()>;
    fn ireturn(&mut self) -> Result<()>;

    fn newarray(&mut self) -> Result<()>;
    fn iaload(&mut self) -> Result<()>;
    fn iastore(&mut self) -> Result<()>;
    fn gc(&mut self) -> Result<()>;

    fn netbind(&mut self) -> Result<()>;
    fn netconnect(&mut self) -> Result<()>;
    fn netin(&mut self) -> Result<()>;
    fn netout(&mut self) -> Result<()>;
    fn netclose(&mut self) -> Result<()>;

    fn shl(&mut self) -> Result<()>;
    fn shr(&mut self) -> Result<()>;
    fn imul(&mut self) -> Result<()>;
    fn idiv(&mut self) -> Result<()>;

    //-------------------------------------------------------------------------
    // Provided methods.

    /** Declares or updates a named integer constant. */
    fn constant(&mut self, name: &str, value: i32) {
        self.pool_mut().set(name, value);
    }

    fn is_constant(&self, name: &str) -> bool {
        self.pool().contains(name)
    }

    /**
     * Pushes `value`: one BIPUSH if it fits in a signed byte, otherwise one
     * LDC_W of a synthesized constant (one pool entry per distinct value).
     */
    fn push_val(&mut self, value: i32) -> Result<()> {
        if (-128..=127).contains(&value) {
            return self.bipush(value as i8);
        }
        let name = if value < 0 {
            format!("__const_{}n__", value.unsigned_abs())
        } else {
            format!("__const_{}__", value)
        };
        self.constant(&name, value);
        self.ldc_w(&name)
    }

    fn set_var(&mut self, var: &str, value: i32) -> Result<()> {
        self.push_val(value)?;
        self.istore(var)
    }

    /**
     * Adds `value` to `var`. IINC covers the signed-byte range; anything
     * larger lowers to a load, add and store.
     */
    fn inc_var(&mut self, var: &str, value: i32) -> Result<()> {
        if (-128..=127).contains(&value) {
            return self.iinc(var, value as i8);
        }
        self.iload(var)?;
        self.push_val(value)?;
        self.iadd()?;
        self.istore(var)
    }

    /**
     * Multiplies the top of the stack by the compile-time constant `factor`,
     * leaving `factor * old_top` under 32-bit two's-complement wrap. The
     * default expansion uses only DUP, IADD, ISUB, BIPUSH, SWAP and POP:
     * a zero accumulator is tucked under the multiplicand, a copy of the
     * running doubled value is saved at every set bit of `|factor|`, and the
     * copies are folded into the accumulator at the end (subtracted from it
     * when the factor is negative).
     */
    fn imul_const(&mut self, factor: i32) -> Result<()> {
        if factor == 0 {
            self.pop()?;
            return self.bipush(0);
        }
        let magnitude = factor.unsigned_abs();
        self.bipush(0)?;
        self.swap()?;
        let bits = 32 - magnitude.leading_zeros();
        for i in 0..bits {
            let top_bit = i + 1 == bits;
            if magnitude >> i & 1 == 1 && !top_bit {
                self.dup()?;
            }
            if !top_bit {
                self.dup()?;
                self.iadd()?;
            }
        }
        // The running value itself is the top bit's contribution; beneath it
        // sit one copy per lower set bit, then the zero accumulator.
        for _ in 1..magnitude.count_ones() {
            self.iadd()?;
        }
        if factor > 0 { self.iadd() } else { self.isub() }
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    /**
     * An [`Assembler`] that records its calls, plus a tiny evaluator for the
     * stack-only opcode subset, used to check pseudo-op expansions.
     */
    #[derive(Default)]
    pub struct Recorder {
        pool: ConstantPool,
        pub ops: Vec<(Opcode, i32)>,
    }

    impl Recorder {
        fn push(&mut self, op: Opcode, arg: i32) -> Result<()> {
            self.ops.push((op, arg));
            Ok(())
        }

        /** Runs the recorded stack ops over `stack`, wrapping at 32 bits. */
        pub fn eval(&self, stack: &mut Vec<i32>) {
            for &(op, arg) in &self.ops {
                match op {
                    BIPUSH => stack.push(arg),
                    DUP => {
                        let top = *stack.last().unwrap();
                        stack.push(top);
                    },
                    POP => { stack.pop().unwrap(); },
                    SWAP => {
                        let b = stack.pop().unwrap();
                        let a = stack.pop().unwrap();
                        stack.push(b);
                        stack.push(a);
                    },
                    IADD => {
                        let b = stack.pop().unwrap();
                        let a = stack.pop().unwrap();
                        stack.push(a.wrapping_add(b));
                    },
                    ISUB => {
                        let b = stack.pop().unwrap();
                        let a = stack.pop().unwrap();
                        stack.push(a.wrapping_sub(b));
                    },
                    op => panic!("eval: unsupported {:?}", op),
                }
            }
        }
    }

    impl Assembler for Recorder {
        fn pool(&self) -> &ConstantPool { &self.pool }
        fn pool_mut(&mut self) -> &mut ConstantPool { &mut self.pool }
        fn function(&mut self, _: &str, _: &[String], _: &[String]) -> Result<()> { Ok(()) }
        fn label(&mut self, _: &str) -> Result<()> { Ok(()) }
        fn is_var(&self, _: &str) -> bool { false }
        fn compile(&mut self, _: &mut dyn Write) -> Result<()> { Ok(()) }

        fn bipush(&mut self, value: i8) -> Result<()> { self.push(BIPUSH, value as i32) }
        fn dup(&mut self) -> Result<()> { self.push(DUP, 0) }
        fn iadd(&mut self) -> Result<()> { self.push(IADD, 0) }
        fn iand(&mut self) -> Result<()> { self.push(IAND, 0) }
        fn ior(&mut self) -> Result<()> { self.push(IOR, 0) }
        fn isub(&mut self) -> Result<()> { self.push(ISUB, 0) }
        fn pop(&mut self) -> Result<()> { self.push(POP, 0) }
        fn swap(&mut self) -> Result<()> { self.push(SWAP, 0) }
        fn nop(&mut self) -> Result<()> { self.push(NOP, 0) }
        fn ldc_w(&mut self, name: &str) -> Result<()> {
            let value = self.pool.get(name).unwrap();
            self.push(LDC_W, value)
        }
        fn iload(&mut self, _: &str) -> Result<()> { self.push(ILOAD, 0) }
        fn istore(&mut self, _: &str) -> Result<()> { self.push(ISTORE, 0) }
        fn iinc(&mut self, _: &str, value: i8) -> Result<()> { self.push(IINC, value as i32) }
        fn wide(&mut self) -> Result<()> { self.push(WIDE, 0) }
        fn halt(&mut self) -> Result<()> { self.push(HALT, 0) }
        fn err(&mut self) -> Result<()> { self.push(ERR, 0) }
        fn in_(&mut self) -> Result<()> { self.push(IN, 0) }
        fn out(&mut self) -> Result<()> { self.push(OUT, 0) }
        fn goto(&mut self, _: &str) -> Result<()> { self.push(GOTO, 0) }
        fn ifeq(&mut self, _: &str) -> Result<()> { self.push(IFEQ, 0) }
        fn iflt(&mut self, _: &str) -> Result<()> { self.push(IFLT, 0) }
        fn icmpeq(&mut self, _: &str) -> Result<()> { self.push(ICMPEQ, 0) }
        fn invokevirtual(&mut self, _: &str) -> Result<()> { self.push(INVOKEVIRTUAL, 0) }
        fn ireturn(&mut self) -> Result<()> { self.push(IRETURN, 0) }
        fn newarray(&mut self) -> Result<()> { self.push(NEWARRAY, 0) }
        fn iaload(&mut self) -> Result<()> { self.push(IALOAD, 0) }
        fn iastore(&mut self) -> Result<()> { self.push(IASTORE, 0) }
        fn gc(&mut self) -> Result<()> { self.push(GC, 0) }
        fn netbind(&mut self) -> Result<()> { self.push(NETBIND, 0) }
        fn netconnect(&mut self) -> Result<()> { self.push(NETCONNECT, 0) }
        fn netin(&mut self) -> Result<()> { self.push(NETIN, 0) }
        fn netout(&mut self) -> Result<()> { self.push(NETOUT, 0) }
        fn netclose(&mut self) -> Result<()> { self.push(NETCLOSE, 0) }
        fn shl(&mut self) -> Result<()> { self.push(SHL, 0) }
        fn shr(&mut self) -> Result<()> { self.push(SHR, 0) }
        fn imul(&mut self) -> Result<()> { self.push(IMUL, 0) }
        fn idiv(&mut self) -> Result<()> { self.push(IDIV, 0) }
    }

    #[test]
    fn opcode_round_trip() {
        for op in ALL_OPCODES {
            assert_eq!(Opcode::parse(op as u8), Some(op));
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        }
        assert_eq!(Opcode::parse(0x42), None);
        assert_eq!(Opcode::from_mnemonic("IF_ICMPEQ"), Some(ICMPEQ));
    }

    #[test]
    fn pool_order_is_declaration_order() {
        let mut pool = ConstantPool::new();
        pool.set("b", 2);
        pool.set("a", 1);
        pool.set("b", 3);
        assert_eq!(pool.index_of("b"), Some(0));
        assert_eq!(pool.index_of("a"), Some(1));
        assert_eq!(pool.get("b"), Some(3));
    }

    #[test]
    fn push_val_boundaries() {
        let mut a = Recorder::default();
        a.push_val(127).unwrap();
        a.push_val(-128).unwrap();
        assert_eq!(a.ops, vec![(BIPUSH, 127), (BIPUSH, -128)]);

        let mut a = Recorder::default();
        a.push_val(128).unwrap();
        a.push_val(-129).unwrap();
        a.push_val(128).unwrap();
        assert_eq!(a.ops, vec![(LDC_W, 128), (LDC_W, -129), (LDC_W, 128)]);
        assert!(a.is_constant("__const_128__"));
        assert!(a.is_constant("__const_129n__"));
        assert_eq!(a.pool().len(), 2);
    }

    #[test]
    fn set_var_is_push_then_store() {
        let mut a = Recorder::default();
        a.set_var("x", 300).unwrap();
        assert_eq!(a.ops, vec![(LDC_W, 300), (ISTORE, 0)]);
    }

    #[test]
    fn inc_var_boundaries() {
        let mut a = Recorder::default();
        a.inc_var("x", 127).unwrap();
        assert_eq!(a.ops, vec![(IINC, 127)]);

        let mut a = Recorder::default();
        a.inc_var("x", 128).unwrap();
        assert_eq!(
            a.ops,
            vec![(ILOAD, 0), (LDC_W, 128), (IADD, 0), (ISTORE, 0)],
        );
    }

    #[test]
    fn imul_const_uses_only_stack_ops() {
        let mut a = Recorder::default();
        a.imul_const(100).unwrap();
        for &(op, _) in &a.ops {
            assert!(matches!(op, DUP | IADD | ISUB | BIPUSH | SWAP | POP));
        }
    }

    #[test]
    fn imul_const_semantics() {
        let factors = [
            0, 1, -1, 2, 3, -3, 4, 10, -7, 100, 255, -1000, 0x4001,
            i32::MAX, i32::MIN,
        ];
        let values = [0, 1, -1, 7, -13, 1000, i32::MAX, i32::MIN];
        for &k in &factors {
            for &x in &values {
                let mut a = Recorder::default();
                a.imul_const(k).unwrap();
                let mut stack = vec![x];
                a.eval(&mut stack);
                assert_eq!(
                    stack, vec![x.wrapping_mul(k)],
                    "imul_const({}) on {}", k, x,
                );
            }
        }
    }
}
