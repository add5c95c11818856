//! The recursive-descent IJ parser. One function per grammar production;
//! "magic" keywords desugar to inline JAS statements as they are parsed.

use std::collections::HashSet;

use crate::ast::{BinOp, CompStmt, Constant, Expr, Function, JasStmt, Program, Stmt};
use crate::asm::{Opcode};
use crate::error::{Error, Result};
use crate::lexer::{Lexer, TokenKind};
use super::super::{parse_identifier, parse_value};

use TokenKind::*;

const KEYWORDS: &[&str] = &[
    "constant", "function", "import", "var",   "for",
    "while",    "if",       "else",   "label", "jas",
    "break",    "continue", "return", "$getc", "$putc",
    "$print",   "$puts",    "$halt",  "$err",  "$malloc",
    "$push",    "$pop",
];

const I32_RANGE: (i64, i64) = (i32::MIN as i64, i32::MAX as i64);

pub fn parse_program(l: &mut Lexer) -> Result<Program> {
    let mut program = Program::default();
    let mut names: HashSet<String> = HashSet::new();
    let mut imports: HashSet<String> = HashSet::new();
    names.insert("main".to_string());

    l.set_skip(&[Whitespace, Newline, Comment]);
    l.set_keywords(KEYWORDS);

    while l.has_token()? {
        l.expect_one_of(Keyword, &["function", "constant", "import"])?;
        let t = l.peek()?.clone();

        match t.value.as_str() {
            "import" => {
                l.discard()?;
                l.expect_kind(StringLit, false)?;
                let path = l.get()?.value;
                if imports.insert(path.clone()) {
                    l.add_source(&path)?;
                }
            },
            "constant" => {
                let c = parse_constant(l)?;
                if !names.insert(c.name.clone()) {
                    return Err(Error::parse(&t.loc, format!(
                        "constant {} was defined twice", c.name)));
                }
                program.consts.push(c);
            },
            "function" => {
                let f = parse_function(l)?;
                if !names.insert(f.name.clone()) {
                    return Err(Error::parse(&t.loc, format!(
                        "function {} was defined twice", f.name)));
                }
                program.funcs.push(f);
            },
            _ => unreachable!(),
        }
    }

    Ok(program)
}

fn parse_constant(l: &mut Lexer) -> Result<Constant> {
    l.expect_value(Keyword, "constant", true)?;
    let name = parse_identifier(l)?;
    l.expect_value(Operator, "=", true)?;
    let value = parse_value(l, I32_RANGE.0, I32_RANGE.1)?;
    l.expect_kind(Semicolon, true)?;
    Ok(Constant {name, value})
}

fn parse_identifier_list(l: &mut Lexer) -> Result<Vec<String>> {
    let mut args = Vec::new();
    if l.is_next(Identifier)? {
        args.push(parse_identifier(l)?);
    }
    while l.is_next(Comma)? {
        l.discard()?;
        args.push(parse_identifier(l)?);
    }
    Ok(args)
}

/**
 * Parses `function <name>(<idlist>) { <stmts> }` or
 * `function <name>(<idlist>) jas { [var | label | mnemonic]* }`.
 */
fn parse_function(l: &mut Lexer) -> Result<Function> {
    l.expect_value(Keyword, "function", true)?;
    let name = parse_identifier(l)?;

    l.expect_kind(LParen, true)?;
    let args = parse_identifier_list(l)?;
    l.expect_kind(RParen, true)?;

    if l.is_next_value(Keyword, "jas")? {
        l.discard()?;
        let body = parse_jas_block(l)?;
        Ok(Function {name, args, body, jas: true})
    } else {
        let body = parse_compound_stmt(l)?;
        Ok(Function {name, args, body, jas: false})
    }
}

fn parse_compound_stmt(l: &mut Lexer) -> Result<CompStmt> {
    if !l.is_next(LBrace)? {
        return Ok(CompStmt::new(vec![parse_statement(l)?]));
    }

    l.expect_kind(LBrace, true)?;
    let mut stmts = Vec::new();
    while !l.is_next(RBrace)? {
        if l.is_next(Semicolon)? {
            l.discard()?;
            continue;
        }
        stmts.push(parse_statement(l)?);
    }
    l.expect_kind(RBrace, true)?;

    Ok(CompStmt::new(stmts))
}

fn parse_jas_block(l: &mut Lexer) -> Result<CompStmt> {
    l.expect_kind(LBrace, true)?;
    let mut stmts = Vec::new();
    while !l.is_next(RBrace)? {
        if l.is_next(Semicolon)? {
            l.discard()?;
        } else if l.is_next_value(Keyword, "var")? {
            stmts.push(parse_var_stmt(l)?);
        } else if l.is_next_value(Keyword, "label")? {
            stmts.push(parse_label_stmt(l)?);
        } else {
            stmts.push(parse_jas_stmt(l)?);
        }
    }
    l.expect_kind(RBrace, true)?;
    Ok(CompStmt::new(stmts))
}

//-----------------------------------------------------------------------------
// Statements.

fn parse_statement(l: &mut Lexer) -> Result<Stmt> {
    if l.is_next_value(Keyword, "for")? {
        return parse_for_stmt(l);
    }
    if l.is_next_value(Keyword, "while")? {
        return parse_while_stmt(l);
    }
    if l.is_next_value(Keyword, "if")? {
        return parse_if_stmt(l);
    }
    if l.is_next_value(Keyword, "break")? {
        l.discard()?;
        l.expect_kind(Semicolon, true)?;
        return Ok(Stmt::Break);
    }
    if l.is_next_value(Keyword, "continue")? {
        l.discard()?;
        l.expect_kind(Semicolon, true)?;
        return Ok(Stmt::Continue);
    }

    let s = if l.is_next_value(Keyword, "var")? {
        parse_var_stmt(l)?
    } else if l.is_next_value(Keyword, "return")? {
        l.discard()?;
        Stmt::Ret(parse_expr(l)?)
    } else if l.is_next_in(Keyword, &["$print", "$puts"])? {
        parse_magic_print(l)?
    } else if l.is_next_in(Keyword, &["$halt", "$err"])? {
        parse_magic_stop(l)?
    } else if l.is_next_value(Keyword, "$putc")? {
        parse_magic_putc(l)?
    } else if l.is_next_value(Keyword, "$push")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        let s = Stmt::Expr {expr: parse_expr(l)?, pop: false};
        l.expect_kind(RParen, true)?;
        s
    } else if l.is_next_value(Keyword, "$pop")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        l.expect_kind(RParen, true)?;
        Stmt::Jas(JasStmt::plain(Opcode::POP))
    } else {
        Stmt::Expr {expr: parse_expr(l)?, pop: true}
    };

    l.expect_kind(Semicolon, true)?;
    Ok(s)
}

/** `var x = e;` — a missing initialiser defaults to zero. */
fn parse_var_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.expect_value(Keyword, "var", true)?;
    let name = parse_identifier(l)?;

    let init = if l.is_next_value(Operator, "=")? {
        l.discard()?;
        parse_expr(l)?
    } else {
        Expr::Value(0)
    };
    Ok(Stmt::Var {name, init})
}

fn parse_for_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.expect_value(Keyword, "for", true)?;
    l.expect_kind(LParen, true)?;

    let init = if l.is_next_value(Keyword, "var")? {
        Some(Box::new(parse_var_stmt(l)?))
    } else if !l.is_next(Semicolon)? {
        Some(Box::new(Stmt::Expr {expr: parse_expr(l)?, pop: true}))
    } else {
        None
    };
    l.expect_kind(Semicolon, true)?;

    let cond = if !l.is_next(Semicolon)? {
        Some(parse_expr(l)?)
    } else {
        None
    };
    l.expect_kind(Semicolon, true)?;

    let update = if !l.is_next(RParen)? {
        Some(parse_expr(l)?)
    } else {
        None
    };
    l.expect_kind(RParen, true)?;

    let body = parse_compound_stmt(l)?;
    Ok(Stmt::For {init, cond, update, body})
}

fn parse_while_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.expect_value(Keyword, "while", true)?;
    l.expect_kind(LParen, true)?;
    let cond = if !l.is_next(RParen)? {
        Some(parse_expr(l)?)
    } else {
        None
    };
    l.expect_kind(RParen, true)?;
    let body = parse_compound_stmt(l)?;
    Ok(Stmt::For {init: None, cond, update: None, body})
}

fn parse_if_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.expect_value(Keyword, "if", true)?;
    l.expect_kind(LParen, true)?;
    let cond = parse_expr(l)?;
    l.expect_kind(RParen, true)?;

    let then = parse_compound_stmt(l)?;
    let els = if l.is_next_value(Keyword, "else")? {
        l.discard()?;
        parse_compound_stmt(l)?
    } else {
        CompStmt::default()
    };
    Ok(Stmt::If {cond, then, els})
}

fn parse_label_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.discard()?; // 'label'
    let name = l.get()?.value;
    l.expect_kind(Colon, true)?;
    Ok(Stmt::Label(name))
}

fn parse_jas_stmt(l: &mut Lexer) -> Result<Stmt> {
    l.expect_kind(Identifier, false)?;
    let t = l.get()?;

    let op = Opcode::from_mnemonic(&t.value).ok_or_else(|| {
        Error::parse(&t.loc, format!("unknown JAS instruction: {}", t.value))
    })?;

    let mut stmt = JasStmt::plain(op);
    if op.has_const_arg() || op.has_fun_arg() || op.has_label_arg() || op.has_var_arg() {
        stmt.ident = Some(parse_identifier(l)?);
    }
    if op.has_imm_arg() {
        stmt.imm = Some(parse_value(l, -128, 127)? as i8);
    }
    Ok(Stmt::Jas(stmt))
}

//-----------------------------------------------------------------------------
// Magic statements.

/** `$print("s")` and `$puts("s")` unroll to one BIPUSH/OUT pair per byte. */
fn parse_magic_print(l: &mut Lexer) -> Result<Stmt> {
    let add_newline = l.is_next_value(Keyword, "$puts")?;
    l.discard()?;

    l.expect_kind(LParen, true)?;
    l.expect_kind(StringLit, false)?;
    let s = l.get()?.value;
    l.expect_kind(RParen, true)?;

    let mut stmts = Vec::new();
    for &byte in s.as_bytes() {
        stmts.push(Stmt::Jas(JasStmt::bipush(byte as i8)));
        stmts.push(Stmt::Jas(JasStmt::plain(Opcode::OUT)));
    }
    if add_newline {
        stmts.push(Stmt::Jas(JasStmt::bipush(b'\n' as i8)));
        stmts.push(Stmt::Jas(JasStmt::plain(Opcode::OUT)));
    }
    Ok(Stmt::Comp(CompStmt::new(stmts)))
}

fn parse_magic_putc(l: &mut Lexer) -> Result<Stmt> {
    l.discard()?;
    l.expect_kind(LParen, true)?;
    let arg = Stmt::Expr {expr: parse_expr(l)?, pop: false};
    l.expect_kind(RParen, true)?;
    Ok(Stmt::Comp(CompStmt::new(vec![
        arg,
        Stmt::Jas(JasStmt::plain(Opcode::OUT)),
    ])))
}

fn parse_magic_stop(l: &mut Lexer) -> Result<Stmt> {
    let op = if l.is_next_value(Keyword, "$err")? { Opcode::ERR } else { Opcode::HALT };
    l.discard()?;
    l.expect_kind(LParen, true)?;
    l.expect_kind(RParen, true)?;
    Ok(Stmt::Jas(JasStmt::plain(op)))
}

//-----------------------------------------------------------------------------
// Expressions, loosest binding first.

pub fn parse_expr(l: &mut Lexer) -> Result<Expr> {
    let mut left = parse_compare_expr(l)?;
    while l.is_next_in(Operator, &["=", "+=", "-=", "&=", "|="])? {
        let op = BinOp::from_token(&l.get()?.value).unwrap();
        left = Expr::Op {
            op,
            left: Box::new(left),
            right: Box::new(parse_compare_expr(l)?),
        };
    }
    Ok(left)
}

fn parse_binary_level(
    l: &mut Lexer,
    tokens: &[&str],
    next: fn(&mut Lexer) -> Result<Expr>,
) -> Result<Expr> {
    let mut left = next(l)?;
    while l.peek()?.kind == Operator {
        if !tokens.contains(&l.peek()?.value.as_str()) {
            break;
        }
        let op = BinOp::from_token(&l.get()?.value).unwrap();
        left = Expr::Op {op, left: Box::new(left), right: Box::new(next(l)?)};
    }
    Ok(left)
}

fn parse_compare_expr(l: &mut Lexer) -> Result<Expr> {
    parse_binary_level(l, &["==", "!=", "<", ">", "<=", ">="], parse_logic_expr)
}

fn parse_logic_expr(l: &mut Lexer) -> Result<Expr> {
    parse_binary_level(l, &["&", "|"], parse_arit_expr)
}

fn parse_arit_expr(l: &mut Lexer) -> Result<Expr> {
    parse_binary_level(l, &["+", "-"], parse_mul_expr)
}

fn parse_mul_expr(l: &mut Lexer) -> Result<Expr> {
    parse_binary_level(l, &["*"], parse_basic_expr)
}

fn numeric(l: &mut Lexer) -> Result<bool> {
    let t = l.peek()?;
    Ok(match t.kind {
        Operator => t.value == "-",
        Decimal | Hex | CharLit => true,
        _ => false,
    })
}

fn parse_basic_expr(l: &mut Lexer) -> Result<Expr> {
    let mut minus = false;
    if l.is_next_value(Operator, "-")? {
        minus = true;
        l.discard()?;
    }

    let mut res = if l.is_next_value(Keyword, "$getc")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        l.expect_kind(RParen, true)?;
        Expr::Stmt(Box::new(Stmt::Jas(JasStmt::plain(Opcode::IN))))
    } else if l.is_next_value(Keyword, "$push")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        let arg = Stmt::Expr {expr: parse_expr(l)?, pop: false};
        l.expect_kind(RParen, true)?;
        Expr::Stmt(Box::new(Stmt::Comp(CompStmt::new(vec![
            arg,
            Stmt::Jas(JasStmt::plain(Opcode::DUP)),
        ]))))
    } else if l.is_next_value(Keyword, "$pop")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        l.expect_kind(RParen, true)?;
        Expr::Stmt(Box::new(Stmt::Jas(JasStmt::plain(Opcode::POP))))
    } else if l.is_next_value(Keyword, "$malloc")? {
        l.discard()?;
        l.expect_kind(LParen, true)?;
        let arg = Stmt::Expr {expr: parse_expr(l)?, pop: false};
        l.expect_kind(RParen, true)?;
        Expr::Stmt(Box::new(Stmt::Comp(CompStmt::new(vec![
            arg,
            Stmt::Jas(JasStmt::plain(Opcode::NEWARRAY)),
        ]))))
    } else if l.is_next(LParen)? {
        l.discard()?;
        let inner = parse_expr(l)?;
        l.expect_kind(RParen, true)?;
        inner
    } else if numeric(l)? {
        Expr::Value(parse_value(l, I32_RANGE.0, I32_RANGE.1)?)
    } else if l.is_next(Identifier)? {
        let name = parse_identifier(l)?;
        if l.peek()?.kind == LParen {
            parse_fcall(name, l)?
        } else {
            Expr::Ident(name)
        }
    } else {
        let t = l.peek()?;
        return Err(Error::parse(&t.loc, format!(
            "unknown expression at '{}'", t.value)));
    };

    while l.is_next(LBracket)? {
        l.discard()?;
        let index = parse_expr(l)?;
        l.expect_kind(RBracket, true)?;
        res = Expr::ArrAccess {array: Box::new(res), index: Box::new(index)};
    }

    if minus {
        res = match res {
            Expr::Value(v) => Expr::Value(v.wrapping_neg()),
            other => Expr::Op {
                op: BinOp::Sub,
                left: Box::new(Expr::Value(0)),
                right: Box::new(other),
            },
        };
    }
    Ok(res)
}

fn parse_fcall(name: String, l: &mut Lexer) -> Result<Expr> {
    l.expect_kind(LParen, true)?;
    let mut args = Vec::new();
    if l.peek()?.kind != RParen {
        args.push(parse_expr(l)?);
        while l.peek()?.kind == Comma {
            l.expect_kind(Comma, true)?;
            args.push(parse_expr(l)?);
        }
    }
    l.expect_kind(RParen, true)?;
    Ok(Expr::Call {name, args})
}

//-----------------------------------------------------------------------------
