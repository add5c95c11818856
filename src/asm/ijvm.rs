//! The IJVM bytecode backend. Instructions append to a raw code buffer;
//! branches and calls leave two-byte placeholders behind and are patched in a
//! link pass once every label address and function pool index is known.

use std::io::Write;

use indexmap::IndexMap;
use log::{debug};

use crate::buffer::{Buffer, Endian};
use crate::error::{Error, Result};
use super::{Assembler, ConstantPool, Opcode};

pub const IJVM_MAGIC: u32 = 0x1DEADFAD;
const POOL_MARKER: u32 = 0xD000D000;
const TEXT_MARKER: u32 = 0x00000000;
const FUNC_MARKER: u32 = 0xEEEEEEEE;
const LABEL_MARKER: u32 = 0xFFFFFFFF;

const E: Endian = Endian::Big;

/** The IJVM bytecode emitter described in the module docs. */
#[derive(Default)]
pub struct IjvmAssembler {
    pool: ConstantPool,
    /** The raw text section under construction. */
    code: Buffer,
    /** `"fname#label"` to code offset. */
    label_addrs: IndexMap<String, u32>,
    /** Offset of a branch opcode to the `"fname#label"` it must reach. */
    pending_jumps: Vec<(u32, String)>,
    /** Function name to code offset of its header. */
    func_addrs: IndexMap<String, u32>,
    /** Offset of an INVOKEVIRTUAL opcode to the function it names. */
    pending_invokes: Vec<(u32, String)>,
    current_func: String,
    vars: Vec<String>,
}

impl IjvmAssembler {
    pub fn new() -> Self {
        IjvmAssembler {
            current_func: "main".to_string(),
            ..Default::default()
        }
    }

    fn qualify(&self, label: &str) -> String {
        format!("{}#{}", self.current_func, label)
    }

    fn var_index(&self, var: &str) -> Result<usize> {
        self.vars.iter().position(|v| v == var).ok_or_else(|| {
            Error::semantic(format!(
                "'{}' is not a local variable of {}", var, self.current_func))
        })
    }

    fn simple(&mut self, op: Opcode) -> Result<()> {
        self.code.append_u8(op as u8);
        Ok(())
    }

    /** Emits an opcode with a local-variable index, WIDE-prefixed if the
     * index does not fit in a byte. */
    fn var_op(&mut self, op: Opcode, var: &str) -> Result<()> {
        let index = self.var_index(var)?;
        if index > 255 {
            self.code.append_u8(Opcode::WIDE as u8);
            self.code.append_u8(op as u8);
            self.code.append_u16(index as u16, E);
        } else {
            self.code.append_u8(op as u8);
            self.code.append_u8(index as u8);
        }
        Ok(())
    }

    fn branch(&mut self, op: Opcode, label: &str) -> Result<()> {
        let name = self.qualify(label);
        self.pending_jumps.push((self.code.len() as u32, name));
        self.code.append_u8(op as u8);
        self.code.append_i16(0, E); // overwritten at link time
        Ok(())
    }

    /**
     * Resolves every pending branch and call. Branch displacements are
     * signed 16-bit, relative to the branch's own opcode byte.
     */
    fn link(&mut self, func_indexes: &IndexMap<String, u16>) -> Result<()> {
        for (offset, name) in &self.pending_jumps {
            let laddr = *self.label_addrs.get(name).ok_or_else(|| {
                Error::link(format!("branch to undefined label '{}'", name))
            })?;
            let disp = laddr as i64 - *offset as i64;
            if !(-0x8000..0x8000).contains(&disp) {
                return Err(Error::link(format!(
                    "branch to '{}' does not fit in 16 bits", name)));
            }
            self.code.write_i16(disp as i16, *offset as usize + 1, E);
        }
        for (offset, name) in &self.pending_invokes {
            let index = *func_indexes.get(name).ok_or_else(|| {
                Error::link(format!("INVOKEVIRTUAL of undefined function '{}'", name))
            })?;
            self.code.write_u16(index, *offset as usize + 1, E);
        }
        Ok(())
    }

    fn symbol_block(symbols: impl Iterator<Item=(String, u32)>) -> Buffer {
        let mut block = Buffer::new();
        for (name, offset) in symbols {
            block.append_u32(offset, E);
            block.append_str(&name);
            block.append_u8(0);
        }
        block
    }
}

impl Assembler for IjvmAssembler {
    fn pool(&self) -> &ConstantPool { &self.pool }
    fn pool_mut(&mut self) -> &mut ConstantPool { &mut self.pool }

    /**
     * `main` has no header and no OBJREF slot: its body runs inline from
     * offset 0 of the text section. Every other function starts with its
     * `(nargs, nvars)` header and owns local slot 0 as the OBJREF.
     */
    fn function(&mut self, name: &str, args: &[String], vars: &[String]) -> Result<()> {
        self.current_func = name.to_string();
        self.vars.clear();
        if name == "main" {
            self.vars.extend_from_slice(args);
            self.vars.extend_from_slice(vars);
            return Ok(());
        }
        self.func_addrs.insert(name.to_string(), self.code.len() as u32);
        self.code.append_u16(args.len() as u16 + 1, E);
        self.code.append_u16(vars.len() as u16, E);
        self.vars.push("OBJREF".to_string());
        self.vars.extend_from_slice(args);
        self.vars.extend_from_slice(vars);
        Ok(())
    }

    fn label(&mut self, name: &str) -> Result<()> {
        let name = self.qualify(name);
        self.label_addrs.insert(name, self.code.len() as u32);
        Ok(())
    }

    fn is_var(&self, name: &str) -> bool {
        self.vars.iter().any(|v| v == name)
    }

    fn compile(&mut self, sink: &mut dyn Write) -> Result<()> {
        // User constants in declaration order, then one slot per function
        // holding its code offset.
        let mut consts: Vec<i32> = self.pool.iter().map(|(_, v)| v).collect();
        let mut func_indexes = IndexMap::new();
        for (name, addr) in &self.func_addrs {
            func_indexes.insert(name.clone(), consts.len() as u16);
            consts.push(*addr as i32);
        }

        self.link(&func_indexes)?;
        debug!("linked {} jumps, {} invokes",
            self.pending_jumps.len(), self.pending_invokes.len());

        let mut output = Buffer::new();
        output.append_u32(IJVM_MAGIC, E);

        output.append_u32(POOL_MARKER, E);
        output.append_u32(consts.len() as u32 * 4, E);
        for c in &consts {
            output.append_i32(*c, E);
        }

        output.append_u32(TEXT_MARKER, E);
        output.append_u32(self.code.len() as u32, E);
        output.append_buffer(&self.code);

        let funcs = Self::symbol_block(
            self.func_addrs.iter().map(|(n, &a)| (n.clone(), a)));
        output.append_u32(FUNC_MARKER, E);
        output.append_u32(funcs.len() as u32, E);
        output.append_buffer(&funcs);

        let labels = Self::symbol_block(
            self.label_addrs.iter().map(|(n, &a)| (n.clone(), a)));
        output.append_u32(LABEL_MARKER, E);
        output.append_u32(labels.len() as u32, E);
        output.append_buffer(&labels);

        sink.write_all(output.as_slice())?;
        Ok(())
    }

    fn bipush(&mut self, value: i8) -> Result<()> {
        self.code.append_u8(Opcode::BIPUSH as u8);
        self.code.append_i8(value);
        Ok(())
    }

    fn dup(&mut self) -> Result<()> { self.simple(Opcode::DUP) }
    fn iadd(&mut self) -> Result<()> { self.simple(Opcode::IADD) }
    fn iand(&mut self) -> Result<()> { self.simple(Opcode::IAND) }
    fn ior(&mut self) -> Result<()> { self.simple(Opcode::IOR) }
    fn isub(&mut self) -> Result<()> { self.simple(Opcode::ISUB) }
    fn pop(&mut self) -> Result<()> { self.simple(Opcode::POP) }
    fn swap(&mut self) -> Result<()> { self.simple(Opcode::SWAP) }
    fn nop(&mut self) -> Result<()> { self.simple(Opcode::NOP) }

    fn ldc_w(&mut self, constant: &str) -> Result<()> {
        let index = self.pool.index_of(constant).ok_or_else(|| {
            Error::semantic(format!("LDC_W of undeclared constant '{}'", constant))
        })?;
        self.code.append_u8(Opcode::LDC_W as u8);
        self.code.append_u16(index as u16, E);
        Ok(())
    }

    fn iload(&mut self, var: &str) -> Result<()> {
        self.var_op(Opcode::ILOAD, var)
    }

    fn istore(&mut self, var: &str) -> Result<()> {
        self.var_op(Opcode::ISTORE, var)
    }

    fn iinc(&mut self, var: &str, value: i8) -> Result<()> {
        self.var_op(Opcode::IINC, var)?;
        self.code.append_i8(value);
        Ok(())
    }

    fn wide(&mut self) -> Result<()> { self.simple(Opcode::WIDE) }

    fn halt(&mut self) -> Result<()> { self.simple(Opcode::HALT) }
    fn err(&mut self) -> Result<()> { self.simple(Opcode::ERR) }
    fn in_(&mut self) -> Result<()> { self.simple(Opcode::IN) }
    fn out(&mut self) -> Result<()> { self.simple(Opcode::OUT) }

    fn goto(&mut self, label: &str) -> Result<()> {
        self.branch(Opcode::GOTO, label)
    }

    fn ifeq(&mut self, label: &str) -> Result<()> {
        self.branch(Opcode::IFEQ, label)
    }

    fn iflt(&mut self, label: &str) -> Result<()> {
        self.branch(Opcode::IFLT, label)
    }

    fn icmpeq(&mut self, label: &str) -> Result<()> {
        self.branch(Opcode::ICMPEQ, label)
    }

    fn invokevirtual(&mut self, func: &str) -> Result<()> {
        self.pending_invokes.push((self.code.len() as u32, func.to_string()));
        self.code.append_u8(Opcode::INVOKEVIRTUAL as u8);
        self.code.append_i16(0, E); // overwritten at link time
        Ok(())
    }

    fn ireturn(&mut self) -> Result<()> { self.simple(Opcode::IRETURN) }

    fn newarray(&mut self) -> Result<()> { self.simple(Opcode::NEWARRAY) }
    fn iaload(&mut self) -> Result<()> { self.simple(Opcode::IALOAD) }
    fn iastore(&mut self) -> Result<()> { self.simple(Opcode::IASTORE) }
    fn gc(&mut self) -> Result<()> { self.simple(Opcode::GC) }

    fn netbind(&mut self) -> Result<()> { self.simple(Opcode::NETBIND) }
    fn netconnect(&mut self) -> Result<()> { self.simple(Opcode::NETCONNECT) }
    fn netin(&mut self) -> Result<()> { self.simple(Opcode::NETIN) }
    fn netout(&mut self) -> Result<()> { self.simple(Opcode::NETOUT) }
    fn netclose(&mut self) -> Result<()> { self.simple(Opcode::NETCLOSE) }

    fn shl(&mut self) -> Result<()> { self.simple(Opcode::SHL) }
    fn shr(&mut self) -> Result<()> { self.simple(Opcode::SHR) }
    fn imul(&mut self) -> Result<()> { self.simple(Opcode::IMUL) }
    fn idiv(&mut self) -> Result<()> { self.simple(Opcode::IDIV) }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn image(a: &mut IjvmAssembler) -> Vec<u8> {
        let mut out = Vec::new();
        a.compile(&mut out).expect("compile failed");
        out
    }

    fn text_section(image: &[u8]) -> &[u8] {
        let pool_bytes = u32::from_be_bytes(image[8..12].try_into().unwrap());
        let text_start = 12 + pool_bytes as usize + 8;
        let text_bytes = u32::from_be_bytes(
            image[text_start - 4..text_start].try_into().unwrap());
        &image[text_start..text_start + text_bytes as usize]
    }

    #[test]
    fn header_layout() {
        let mut a = IjvmAssembler::new();
        a.constant("x", 0x01020304);
        a.function("main", &[], &[]).unwrap();
        a.halt().unwrap();
        let img = image(&mut a);
        assert_eq!(&img[0..4], &[0x1D, 0xEA, 0xDF, 0xAD]);
        assert_eq!(&img[4..8], &[0xD0, 0x00, 0xD0, 0x00]);
        assert_eq!(&img[8..12], &[0, 0, 0, 4]); // one pool entry
        assert_eq!(&img[12..16], &[1, 2, 3, 4]);
        assert_eq!(&img[16..20], &[0, 0, 0, 0]); // text marker
        assert_eq!(&img[20..24], &[0, 0, 0, 1]);
        assert_eq!(img[24], Opcode::HALT as u8);
    }

    #[test]
    fn backward_branch_displacement() {
        let mut a = IjvmAssembler::new();
        a.function("main", &[], &[]).unwrap();
        a.label("top").unwrap();
        a.nop().unwrap();
        a.goto("top").unwrap();
        a.halt().unwrap();
        let img = image(&mut a);
        let text = text_section(&img);
        // NOP at 0, GOTO at 1 with displacement back to offset 0.
        assert_eq!(text, &[
            Opcode::NOP as u8,
            Opcode::GOTO as u8, 0xFF, 0xFF,
            Opcode::HALT as u8,
        ]);
    }

    #[test]
    fn function_header_and_invoke_index() {
        let mut a = IjvmAssembler::new();
        a.constant("answer", 42);
        a.function("main", &[], &[]).unwrap();
        a.invokevirtual("f").unwrap();
        a.halt().unwrap();
        a.function("f", &["n".to_string()], &["t".to_string()]).unwrap();
        a.ireturn().unwrap();
        let img = image(&mut a);
        // Pool: "answer" then f's address.
        assert_eq!(&img[8..12], &[0, 0, 0, 8]);
        assert_eq!(&img[12..16], &[0, 0, 0, 42]);
        assert_eq!(&img[16..20], &[0, 0, 0, 4]); // f starts after main's 4 bytes
        let text = text_section(&img);
        // INVOKEVIRTUAL patched with pool index 1.
        assert_eq!(&text[0..4], &[Opcode::INVOKEVIRTUAL as u8, 0, 1,
            Opcode::HALT as u8]);
        // Header: nargs counts the OBJREF.
        assert_eq!(&text[4..8], &[0, 2, 0, 1]);
        assert_eq!(text[8], Opcode::IRETURN as u8);
    }

    #[test]
    fn wide_above_byte_index() {
        let vars: Vec<String> = (0..300).map(|i| format!("v{}", i)).collect();
        let mut a = IjvmAssembler::new();
        a.function("main", &[], &vars).unwrap();
        a.iload("v1").unwrap();
        a.iload("v299").unwrap();
        a.iinc("v299", -1).unwrap();
        a.halt().unwrap();
        let img = image(&mut a);
        let text = text_section(&img);
        assert_eq!(&text[0..2], &[Opcode::ILOAD as u8, 1]);
        assert_eq!(&text[2..6], &[Opcode::WIDE as u8, Opcode::ILOAD as u8, 1, 43]);
        assert_eq!(&text[6..11],
            &[Opcode::WIDE as u8, Opcode::IINC as u8, 1, 43, 0xFF]);
    }

    #[test]
    fn unknown_label_is_a_link_error() {
        let mut a = IjvmAssembler::new();
        a.function("main", &[], &[]).unwrap();
        a.goto("nowhere").unwrap();
        let mut out = Vec::new();
        assert!(matches!(a.compile(&mut out), Err(Error::Link(_))));
    }

    #[test]
    fn unknown_variable_is_a_semantic_error() {
        let mut a = IjvmAssembler::new();
        a.function("main", &[], &[]).unwrap();
        assert!(matches!(a.iload("ghost"), Err(Error::Semantic(_))));
    }

    #[test]
    fn main_locals_resolve_without_objref() {
        let mut a = IjvmAssembler::new();
        a.function("main", &[], &["x".to_string()]).unwrap();
        a.bipush(1).unwrap();
        a.istore("x").unwrap();
        a.halt().unwrap();
        let img = image(&mut a);
        let text = text_section(&img);
        // x is slot 0: main has no OBJREF.
        assert_eq!(text, &[Opcode::BIPUSH as u8, 1, Opcode::ISTORE as u8, 0,
            Opcode::HALT as u8]);
    }
}
