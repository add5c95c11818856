//! The three frontends. Each one drives an [`Assembler`] directly or via the
//! AST; this module holds the token-level helpers they share.
//!
//! [`Assembler`]: crate::asm::Assembler

use crate::error::{Error, Result};
use crate::lexer::{Lexer, TokenKind};

pub mod ij;
pub mod jas;
pub mod ijvm;

pub fn parse_identifier(l: &mut Lexer) -> Result<String> {
    l.expect_kind(TokenKind::Identifier, false)?;
    Ok(l.get()?.value)
}

/** The character-literal escape set. Strings additionally accept `\0`. */
fn unescape_char(c: u8) -> Option<i64> {
    Some(match c {
        b'"' => b'"' as i64,
        b'\\' => b'\\' as i64,
        b'/' => b'/' as i64,
        b'b' => 0x08,
        b'f' => 0x0C,
        b'n' => b'\n' as i64,
        b'r' => b'\r' as i64,
        b't' => b'\t' as i64,
        _ => return None,
    })
}

/**
 * Parses an optionally negated numeric literal in decimal, hexadecimal or
 * character form, requiring it to land in `min..=max`. Hexadecimal literals
 * are read as 32-bit bit patterns, so `0xffffffff` is -1.
 */
pub fn parse_value(l: &mut Lexer, min: i64, max: i64) -> Result<i32> {
    let mut sign = false;
    if l.is_next_value(TokenKind::Operator, "-")? {
        sign = true;
        l.discard()?;
    }

    l.expect_kinds(&[TokenKind::Decimal, TokenKind::Hex, TokenKind::CharLit])?;
    let t = l.get()?;
    let out_of_range = || Error::parse(&t.loc, "number out of allowed range");

    let value = match t.kind {
        TokenKind::Decimal => {
            t.value.parse::<i64>().map_err(|_| out_of_range())?
        },
        TokenKind::Hex => {
            let raw = u32::from_str_radix(&t.value[2..], 16)
                .map_err(|_| out_of_range())?;
            raw as i32 as i64
        },
        TokenKind::CharLit => {
            let raw = t.value.as_bytes();
            if raw[1] == b'\\' {
                unescape_char(raw[2]).ok_or_else(|| Error::parse(&t.loc, format!(
                    "unrecognised escape symbol \\{}", raw[2] as char)))?
            } else {
                raw[1] as i64
            }
        },
        _ => unreachable!(),
    };

    let value = if sign { -value } else { value };
    if value < min || value > max {
        return Err(out_of_range());
    }
    Ok(value as i32)
}

//-----------------------------------------------------------------------------
