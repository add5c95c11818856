//! The JAS text backend: renders the instruction stream as the textual
//! assembly the JAS frontend can read back.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write;

use crate::error::{Error, Result};
use super::{Assembler, ConstantPool};

/** Renders the program as a JAS listing. */
#[derive(Default)]
pub struct JasAssembler {
    pool: ConstantPool,
    /** The body text: everything between `.main` and the final `.end-*`. */
    text: String,
    /** Whether a `.method` section has been opened. */
    fn_declared: bool,
    vars: HashSet<String>,
}

impl JasAssembler {
    pub fn new() -> Self {
        JasAssembler::default()
    }

    fn line(&mut self, mnemonic: &str) -> Result<()> {
        let _ = writeln!(self.text, "    {}", mnemonic);
        Ok(())
    }

    fn line_arg(&mut self, mnemonic: &str, arg: impl std::fmt::Display) -> Result<()> {
        let _ = writeln!(self.text, "    {} {}", mnemonic, arg);
        Ok(())
    }
}

impl Assembler for JasAssembler {
    fn pool(&self) -> &ConstantPool { &self.pool }
    fn pool_mut(&mut self) -> &mut ConstantPool { &mut self.pool }

    /**
     * `main` is the implicit `.main` section, so it opens no `.method`
     * header; it still gets a `.var` block when it has locals.
     */
    fn function(&mut self, name: &str, args: &[String], vars: &[String]) -> Result<()> {
        if name != "main" {
            if self.fn_declared {
                self.text.push_str(".end-method\n\n");
            } else {
                self.text.push_str(".end-main\n\n");
                self.fn_declared = true;
            }
            let _ = writeln!(self.text, ".method {}({})", name, args.join(", "));
        }
        if !vars.is_empty() {
            self.text.push_str(".var\n");
            for var in vars {
                let _ = writeln!(self.text, "    {}", var);
            }
            self.text.push_str(".end-var\n");
        }
        self.vars.clear();
        self.vars.extend(args.iter().cloned());
        self.vars.extend(vars.iter().cloned());
        if name != "main" {
            self.vars.insert("OBJREF".to_string());
        }
        Ok(())
    }

    fn label(&mut self, name: &str) -> Result<()> {
        let _ = writeln!(self.text, "{}:", name);
        Ok(())
    }

    fn is_var(&self, name: &str) -> bool {
        self.vars.contains(name)
    }

    fn compile(&mut self, sink: &mut dyn Write) -> Result<()> {
        let mut out = String::new();
        if !self.pool.is_empty() {
            out.push_str(".constant\n");
            for (name, value) in self.pool.iter() {
                let _ = writeln!(out, "    {} 0x{:x}", name, value);
            }
            out.push_str(".end-constant\n\n");
        }
        out.push_str(".main\n");
        out.push_str(&self.text);
        out.push_str(if self.fn_declared { ".end-method" } else { ".end-main" });
        out.push('\n');
        sink.write_all(out.as_bytes())?;
        Ok(())
    }

    fn bipush(&mut self, value: i8) -> Result<()> { self.line_arg("BIPUSH", value) }
    fn dup(&mut self) -> Result<()> { self.line("DUP") }
    fn iadd(&mut self) -> Result<()> { self.line("IADD") }
    fn iand(&mut self) -> Result<()> { self.line("IAND") }
    fn ior(&mut self) -> Result<()> { self.line("IOR") }
    fn isub(&mut self) -> Result<()> { self.line("ISUB") }
    fn pop(&mut self) -> Result<()> { self.line("POP") }
    fn swap(&mut self) -> Result<()> { self.line("SWAP") }
    fn nop(&mut self) -> Result<()> { self.line("NOP") }

    fn ldc_w(&mut self, constant: &str) -> Result<()> {
        if !self.is_constant(constant) {
            return Err(Error::semantic(format!(
                "LDC_W of undeclared constant '{}'", constant)));
        }
        self.line_arg("LDC_W", constant)
    }

    fn iload(&mut self, var: &str) -> Result<()> { self.line_arg("ILOAD", var) }
    fn istore(&mut self, var: &str) -> Result<()> { self.line_arg("ISTORE", var) }

    fn iinc(&mut self, var: &str, value: i8) -> Result<()> {
        let _ = writeln!(self.text, "    IINC {} {}", var, value);
        Ok(())
    }

    fn wide(&mut self) -> Result<()> { self.line("WIDE") }

    fn halt(&mut self) -> Result<()> { self.line("HALT") }
    fn err(&mut self) -> Result<()> { self.line("ERR") }
    fn in_(&mut self) -> Result<()> { self.line("IN") }
    fn out(&mut self) -> Result<()> { self.line("OUT") }

    fn goto(&mut self, label: &str) -> Result<()> { self.line_arg("GOTO", label) }
    fn ifeq(&mut self, label: &str) -> Result<()> { self.line_arg("IFEQ", label) }
    fn iflt(&mut self, label: &str) -> Result<()> { self.line_arg("IFLT", label) }
    fn icmpeq(&mut self, label: &str) -> Result<()> { self.line_arg("ICMPEQ", label) }

    fn invokevirtual(&mut self, func: &str) -> Result<()> {
        self.line_arg("INVOKEVIRTUAL", func)
    }

    fn ireturn(&mut self) -> Result<()> { self.line("IRETURN") }

    fn newarray(&mut self) -> Result<()> { self.line("NEWARRAY") }
    fn iaload(&mut self) -> Result<()> { self.line("IALOAD") }
    fn iastore(&mut self) -> Result<()> { self.line("IASTORE") }
    fn gc(&mut self) -> Result<()> { self.line("GC") }

    fn netbind(&mut self) -> Result<()> { self.line("NETBIND") }
    fn netconnect(&mut self) -> Result<()> { self.line("NETCONNECT") }
    fn netin(&mut self) -> Result<()> { self.line("NETIN") }
    fn netout(&mut self) -> Result<()> { self.line("NETOUT") }
    fn netclose(&mut self) -> Result<()> { self.line("NETCLOSE") }

    fn shl(&mut self) -> Result<()> { self.line("SHL") }
    fn shr(&mut self) -> Result<()> { self.line("SHR") }
    fn imul(&mut self) -> Result<()> { self.line("IMUL") }
    fn idiv(&mut self) -> Result<()> { self.line("IDIV") }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(a: &mut JasAssembler) -> String {
        let mut out = Vec::new();
        a.compile(&mut out).expect("compile failed");
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn main_only() {
        let mut a = JasAssembler::new();
        a.function("main", &[], &[]).unwrap();
        a.bipush(72).unwrap();
        a.out().unwrap();
        a.halt().unwrap();
        assert_eq!(listing(&mut a),
            ".main\n    BIPUSH 72\n    OUT\n    HALT\n.end-main\n");
    }

    #[test]
    fn constants_methods_and_labels() {
        let mut a = JasAssembler::new();
        a.constant("answer", 42);
        a.constant("neg", -1);
        a.function("main", &[], &[]).unwrap();
        a.halt().unwrap();
        a.function("f", &["n".to_string()], &["t".to_string()]).unwrap();
        a.label("loop").unwrap();
        a.iinc("t", -3).unwrap();
        a.goto("loop").unwrap();
        a.ireturn().unwrap();
        let text = listing(&mut a);
        assert_eq!(text, "\
.constant
    answer 0x2a
    neg 0xffffffff
.end-constant

.main
    HALT
.end-main

.method f(n)
.var
    t
.end-var
loop:
    IINC t -3
    GOTO loop
    IRETURN
.end-method
");
    }

    #[test]
    fn vars_follow_the_current_function() {
        let mut a = JasAssembler::new();
        a.function("main", &[], &["m".to_string()]).unwrap();
        assert!(a.is_var("m"));
        assert!(!a.is_var("OBJREF"));
        a.function("f", &["x".to_string()], &[]).unwrap();
        assert!(a.is_var("x"));
        assert!(a.is_var("OBJREF"));
        assert!(!a.is_var("m"));
    }
}
