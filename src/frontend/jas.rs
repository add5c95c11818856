//! The JAS textual frontend. The format is flat enough that no AST is
//! needed: every mnemonic maps straight onto one assembler call.

use log::{debug};

use crate::asm::{Assembler, Opcode};
use crate::error::{Error, Result};
use crate::lexer::{Lexer, TokenKind};
use super::{parse_identifier, parse_value};

use TokenKind::*;

/**
 * Directives plus every mnemonic: anything left over is an identifier, which
 * the method-body loop reads as a label, variable or function name.
 */
const KEYWORDS: &[&str] = &[
    "constant", "main", "method", "var", "end",
    "BIPUSH",   "DUP",           "ERR",       "GOTO",
    "HALT",     "IADD",          "IAND",      "IFEQ",
    "IFLT",     "ICMPEQ",        "IF_ICMPEQ", "ILOAD",
    "IN",       "INVOKEVIRTUAL", "IOR",       "IRETURN",
    "ISTORE",   "ISUB",          "LDC_W",     "NOP",
    "OUT",      "POP",           "SWAP",      "WIDE",
    "IINC",     "NEWARRAY",      "IALOAD",    "IASTORE",
    "GC",       "NETBIND",       "NETCONNECT", "NETIN",
    "NETOUT",   "NETCLOSE",      "SHL",       "SHR",
    "IMUL",     "IDIV",
];

/** Parses a whole JAS listing into `a`. */
pub fn compile(l: &mut Lexer, a: &mut dyn Assembler) -> Result<()> {
    l.set_skip(&[Whitespace, Newline, Comment]);
    l.set_keywords(KEYWORDS);

    while l.has_token()? && l.is_next(Period)? {
        l.expect_kind(Period, true)?;
        l.expect_one_of(Keyword, &["constant", "main", "method"])?;
        if l.is_next_value(Keyword, "constant")? {
            parse_constant_block(l, a)?;
        } else {
            parse_method(l, a)?;
        }
    }
    Ok(())
}

/** Consumes an `.end-<what>` marker, the `.` already eaten by the caller. */
fn expect_end(l: &mut Lexer, what: &str) -> Result<()> {
    l.expect_value(Keyword, "end", true)?;
    l.expect_value(Operator, "-", true)?;
    l.expect_value(Keyword, what, true)?;
    Ok(())
}

fn parse_constant_block(l: &mut Lexer, a: &mut dyn Assembler) -> Result<()> {
    l.discard()?; // 'constant'
    while l.is_next(Identifier)? {
        let name = parse_identifier(l)?;
        let value = parse_value(l, i32::MIN as i64, i32::MAX as i64)?;
        a.constant(&name, value);
    }
    l.expect_kind(Period, true)?;
    expect_end(l, "constant")
}

fn parse_optional_vars(l: &mut Lexer) -> Result<Vec<String>> {
    let mut vars = Vec::new();
    if l.is_next(Period)? {
        l.discard()?;
        l.expect_value(Keyword, "var", true)?;
        while l.is_next(Identifier)? {
            vars.push(l.get()?.value);
        }
        l.expect_kind(Period, true)?;
        expect_end(l, "var")?;
    }
    Ok(vars)
}

/** Parses a `.main` or `.method` section up to and including its end. */
fn parse_method(l: &mut Lexer, a: &mut dyn Assembler) -> Result<()> {
    let main = l.is_next_value(Keyword, "main")?;
    let mut name = "main".to_string();
    let mut args = Vec::new();

    if main {
        l.discard()?;
        // `.main` optionally takes an empty pair of parentheses.
        if l.is_next(LParen)? {
            l.expect_kind(LParen, true)?;
            l.expect_kind(RParen, true)?;
        }
    } else {
        l.expect_value(Keyword, "method", true)?;
        name = parse_identifier(l)?;
        l.expect_kind(LParen, true)?;
        if l.is_next(Identifier)? {
            args.push(l.get()?.value);
            while l.is_next(Comma)? {
                l.discard()?;
                args.push(parse_identifier(l)?);
            }
        }
        l.expect_kind(RParen, true)?;
    }

    let vars = parse_optional_vars(l)?;
    debug!("method {}({}) with {} vars", name, args.join(", "), vars.len());
    a.function(&name, &args, &vars)?;

    while l.is_next(Identifier)? || l.is_next(Keyword)? {
        if l.is_next(Identifier)? {
            // A label is an identifier followed by a colon.
            let label = parse_identifier(l)?;
            l.expect_kind(Colon, true)?;
            a.label(&label)?;
        } else {
            parse_op(l, a)?;
        }
    }

    l.expect_kind(Period, true)?;
    expect_end(l, if main { "main" } else { "method" })
}

fn parse_op(l: &mut Lexer, a: &mut dyn Assembler) -> Result<()> {
    let t = l.get()?;
    let op = Opcode::from_mnemonic(&t.value).ok_or_else(|| {
        Error::parse(&t.loc, format!("expected a JAS op code, found '{}'", t.value))
    })?;

    match op {
        Opcode::BIPUSH => {
            let v = parse_value(l, -128, 127)? as i8;
            a.bipush(v)
        },
        Opcode::IINC => {
            let var = parse_identifier(l)?;
            let v = parse_value(l, -128, 127)? as i8;
            a.iinc(&var, v)
        },
        Opcode::DUP => a.dup(),
        Opcode::ERR => a.err(),
        Opcode::GOTO => a.goto(&parse_identifier(l)?),
        Opcode::HALT => a.halt(),
        Opcode::IADD => a.iadd(),
        Opcode::IAND => a.iand(),
        Opcode::IFEQ => a.ifeq(&parse_identifier(l)?),
        Opcode::IFLT => a.iflt(&parse_identifier(l)?),
        Opcode::ICMPEQ => a.icmpeq(&parse_identifier(l)?),
        Opcode::ILOAD => a.iload(&parse_identifier(l)?),
        Opcode::IN => a.in_(),
        Opcode::INVOKEVIRTUAL => a.invokevirtual(&parse_identifier(l)?),
        Opcode::IOR => a.ior(),
        Opcode::IRETURN => a.ireturn(),
        Opcode::ISTORE => a.istore(&parse_identifier(l)?),
        Opcode::ISUB => a.isub(),
        Opcode::LDC_W => a.ldc_w(&parse_identifier(l)?),
        Opcode::NOP => a.nop(),
        Opcode::OUT => a.out(),
        Opcode::POP => a.pop(),
        Opcode::SWAP => a.swap(),
        Opcode::WIDE => a.wide(),
        Opcode::NEWARRAY => a.newarray(),
        Opcode::IALOAD => a.iaload(),
        Opcode::IASTORE => a.iastore(),
        Opcode::GC => a.gc(),
        Opcode::NETBIND => a.netbind(),
        Opcode::NETCONNECT => a.netconnect(),
        Opcode::NETIN => a.netin(),
        Opcode::NETOUT => a.netout(),
        Opcode::NETCLOSE => a.netclose(),
        Opcode::SHL => a.shl(),
        Opcode::SHR => a.shr(),
        Opcode::IMUL => a.imul(),
        Opcode::IDIV => a.idiv(),
    }
}

//-----------------------------------------------------------------------------
