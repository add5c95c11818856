//! A multi-file tokenizer shared by the IJ and JAS frontends. Sources form a
//! stack: `import` pushes a new file on top, resolved relative to the file
//! that imported it, and exhausted files pop off. The keyword set and the
//! kinds to skip are chosen by each frontend.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Location, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Decimal,
    Hex,
    CharLit,
    StringLit,
    Identifier,
    Keyword,
    Operator,
    Whitespace,
    Newline,
    Comment,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Period,
    Semicolon,
    Colon,
}

/** One lexeme. Immutable once produced. */
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub loc: Location,
}

//-----------------------------------------------------------------------------

/** One open input file with a read position. */
struct Source {
    name: String,
    path: PathBuf,
    text: Vec<u8>,
    pos: usize,
    line: u32,
    col: u32,
}

impl Source {
    /**
     * Opens `path`. If this source was reached through an `import`, the path
     * is resolved relative to the directory of the importing file.
     */
    fn open(path: &str, prev: Option<&Path>) -> Result<Source> {
        let resolved = match prev.and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
            _ => PathBuf::from(path),
        };
        let text = fs::read(&resolved)?;
        Ok(Source {
            name: path.to_string(),
            path: resolved,
            text,
            pos: 0,
            line: 1,
            col: 0,
        })
    }

    /** A source that is not backed by a file. Imports resolve from `.`. */
    fn from_str(name: &str, text: &str) -> Source {
        Source {
            name: name.to_string(),
            path: PathBuf::from(name),
            text: text.as_bytes().to_vec(),
            pos: 0,
            line: 1,
            col: 0,
        }
    }

    fn eof(&self) -> bool { self.pos >= self.text.len() }

    fn peekchar(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn getchar(&mut self) -> Option<u8> {
        let c = self.peekchar()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn loc(&self, line: u32, col_start: u32) -> Location {
        Location {
            file: self.name.clone(),
            line,
            col_start,
            col_end: self.col,
        }
    }
}

//-----------------------------------------------------------------------------

const OPERATOR_CHARS: &[u8] = b"+-|*/&<>=";

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

/** The JSON escape set shared by string and character literals. */
fn unescape(c: u8) -> Option<u8> {
    Some(match c {
        b'"' => b'"',
        b'\\' => b'\\',
        b'/' => b'/',
        b'b' => 0x08,
        b'f' => 0x0C,
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'0' => 0,
        _ => return None,
    })
}

/**
 * The token stream. `peek()`/`get()` operate on a one-token cache; kinds in
 * the skip list are dropped before they become visible.
 */
pub struct Lexer {
    srcs: Vec<Source>,
    cache: Vec<Token>,
    skip: HashSet<TokenKind>,
    keywords: HashSet<String>,
}

impl Default for Lexer {
    fn default() -> Self { Lexer::new() }
}

impl Lexer {
    pub fn new() -> Self {
        Lexer {
            srcs: Vec::new(),
            cache: Vec::new(),
            skip: HashSet::new(),
            keywords: HashSet::new(),
        }
    }

    /** Pushes a file on top of the source stack. */
    pub fn add_source(&mut self, path: &str) -> Result<()> {
        let prev = self.srcs.last().map(|s| s.path.clone());
        let src = Source::open(path, prev.as_deref())?;
        self.srcs.push(src);
        Ok(())
    }

    /** Pushes an in-memory source, mainly for tests. */
    pub fn add_source_str(&mut self, name: &str, text: &str) {
        self.srcs.push(Source::from_str(name, text));
    }

    pub fn set_skip(&mut self, kinds: &[TokenKind]) {
        self.skip = kinds.iter().copied().collect();
    }

    pub fn set_keywords(&mut self, keywords: &[&str]) {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
    }

    /** Pops exhausted sources, then tests whether a symbol remains. */
    fn has_symbol(&mut self) -> bool {
        while self.srcs.last().map_or(false, Source::eof) {
            self.srcs.pop();
        }
        !self.srcs.is_empty()
    }

    /** Tests whether another non-skipped token is available. */
    pub fn has_token(&mut self) -> Result<bool> {
        loop {
            if self.cache.is_empty() && !self.has_symbol() {
                return Ok(false);
            }
            if self.cache.is_empty() {
                self.read_token()?;
            }
            if let Some(t) = self.cache.last() {
                if !self.skip.contains(&t.kind) {
                    return Ok(true);
                }
                self.cache.pop();
            }
        }
    }

    pub fn peek(&mut self) -> Result<&Token> {
        if !self.has_token()? {
            return Err(Error::Semantic("unexpected end of input".to_string()));
        }
        Ok(self.cache.last().unwrap())
    }

    pub fn get(&mut self) -> Result<Token> {
        self.peek()?;
        Ok(self.cache.pop().unwrap())
    }

    pub fn discard(&mut self) -> Result<()> {
        self.peek()?;
        self.cache.pop();
        Ok(())
    }

    pub fn is_next(&mut self, kind: TokenKind) -> Result<bool> {
        Ok(self.peek()?.kind == kind)
    }

    pub fn is_next_value(&mut self, kind: TokenKind, value: &str) -> Result<bool> {
        let t = self.peek()?;
        Ok(t.kind == kind && t.value == value)
    }

    pub fn is_next_in(&mut self, kind: TokenKind, values: &[&str]) -> Result<bool> {
        let t = self.peek()?;
        Ok(t.kind == kind && values.contains(&t.value.as_str()))
    }

    /** Requires the next token to have `kind`, optionally consuming it. */
    pub fn expect_kind(&mut self, kind: TokenKind, consume: bool) -> Result<()> {
        if !self.is_next(kind)? {
            let t = self.peek()?;
            return Err(Error::parse(&t.loc, format!(
                "wrong token {:?} ({:?}), expected {:?}", t.value, t.kind, kind)));
        }
        if consume {
            self.discard()?;
        }
        Ok(())
    }

    /** Requires the next token to be one of several kinds. Does not consume. */
    pub fn expect_kinds(&mut self, kinds: &[TokenKind]) -> Result<()> {
        let t = self.peek()?;
        if !kinds.contains(&t.kind) {
            return Err(Error::parse(&t.loc, format!(
                "wrong token {:?} ({:?}), expected one of {:?}", t.value, t.kind, kinds)));
        }
        Ok(())
    }

    pub fn expect_value(&mut self, kind: TokenKind, value: &str, consume: bool) -> Result<()> {
        if !self.is_next_value(kind, value)? {
            let t = self.peek()?;
            return Err(Error::parse(&t.loc, format!(
                "wrong token {:?}, expected {:?}", t.value, value)));
        }
        if consume {
            self.discard()?;
        }
        Ok(())
    }

    pub fn expect_one_of(&mut self, kind: TokenKind, values: &[&str]) -> Result<()> {
        if !self.is_next_in(kind, values)? {
            let t = self.peek()?;
            return Err(Error::parse(&t.loc, format!(
                "wrong token {:?}, expected one of {}", t.value, values.join(", "))));
        }
        Ok(())
    }

    //-------------------------------------------------------------------------

    /** Scans one raw token off the top source into the cache. */
    fn read_token(&mut self) -> Result<()> {
        assert!(self.has_symbol(), "read_token with nothing left to read");
        let keywords = std::mem::take(&mut self.keywords);
        let result = self.read_token_inner(&keywords);
        self.keywords = keywords;
        result
    }

    fn read_token_inner(&mut self, keywords: &HashSet<String>) -> Result<()> {
        let src = self.srcs.last_mut().unwrap();
        let line = src.line;
        let col = src.col;

        let c = src.getchar().unwrap();
        if c == 0 || c > b'~' {
            return Err(Error::lexer(&src.loc(line, col), format!(
                "byte {:#04x} is not printable ASCII", c)));
        }

        // String literal: escapes are decoded here, so the token value is the
        // final byte string.
        if c == b'"' {
            let mut value = Vec::new();
            loop {
                let c = match src.getchar() {
                    None => return Err(Error::lexer(&src.loc(line, col),
                        "string literal wasn't terminated")),
                    Some(c) => c,
                };
                match c {
                    b'"' => break,
                    b'\n' => return Err(Error::lexer(&src.loc(line, col),
                        "multiline strings are not allowed")),
                    b'\\' => {
                        let e = src.getchar().unwrap_or(b'\n');
                        match unescape(e) {
                            Some(decoded) => value.push(decoded),
                            None => return Err(Error::lexer(&src.loc(line, col), format!(
                                "escaped character '\\{}' not recognised", e as char))),
                        }
                    },
                    c => value.push(c),
                }
            }
            let value = String::from_utf8(value).expect("ASCII only");
            self.push_token(TokenKind::StringLit, value, line, col);
            return Ok(());
        }

        // Line comment.
        if c == b'/' && src.peekchar() == Some(b'/') {
            let mut value = String::from("/");
            while let Some(c) = src.peekchar() {
                if c == b'\n' {
                    break;
                }
                value.push(src.getchar().unwrap() as char);
            }
            self.push_token(TokenKind::Comment, value, line, col);
            return Ok(());
        }

        if c == b'\n' {
            self.push_token(TokenKind::Newline, "\n".to_string(), line, col);
            return Ok(());
        }

        if c.is_ascii_whitespace() {
            let mut value = String::new();
            value.push(c as char);
            while let Some(p) = src.peekchar() {
                if !p.is_ascii_whitespace() || p == b'\n' {
                    break;
                }
                value.push(src.getchar().unwrap() as char);
            }
            self.push_token(TokenKind::Whitespace, value, line, col);
            return Ok(());
        }

        if is_ident_start(c) {
            let mut value = String::new();
            value.push(c as char);
            while let Some(p) = src.peekchar() {
                if !is_ident_continue(p) {
                    break;
                }
                value.push(src.getchar().unwrap() as char);
            }
            let kind = if keywords.contains(&value) {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier
            };
            self.push_token(kind, value, line, col);
            return Ok(());
        }

        // Character literal. The value keeps its quotes and any backslash;
        // the numeric parser decodes it.
        if c == b'\'' {
            let mut value = String::from("'");
            let mut inner = match src.getchar() {
                None => return Err(Error::lexer(&src.loc(line, col),
                    "character literal wasn't terminated")),
                Some(c) => c,
            };
            value.push(inner as char);
            if inner == b'\\' {
                inner = src.getchar().unwrap_or(b'\n');
                value.push(inner as char);
            }
            match src.getchar() {
                Some(b'\'') => value.push('\''),
                _ => return Err(Error::lexer(&src.loc(line, col),
                    "character literal wasn't terminated")),
            }
            self.push_token(TokenKind::CharLit, value, line, col);
            return Ok(());
        }

        if c.is_ascii_digit() {
            let mut value = String::new();
            value.push(c as char);
            if c == b'0' && src.peekchar() == Some(b'x') {
                value.push(src.getchar().unwrap() as char);
                while src.peekchar().map_or(false, |p| p.is_ascii_hexdigit()) {
                    value.push(src.getchar().unwrap() as char);
                }
                self.push_token(TokenKind::Hex, value, line, col);
                return Ok(());
            }
            while src.peekchar().map_or(false, |p| p.is_ascii_digit()) {
                value.push(src.getchar().unwrap() as char);
            }
            self.push_token(TokenKind::Decimal, value, line, col);
            return Ok(());
        }

        // Operators, optionally suffixed with '='.
        if OPERATOR_CHARS.contains(&c) {
            let mut value = String::new();
            value.push(c as char);
            if src.peekchar() == Some(b'=') {
                value.push(src.getchar().unwrap() as char);
            }
            self.push_token(TokenKind::Operator, value, line, col);
            return Ok(());
        }

        let kind = match c {
            b':' => TokenKind::Colon,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Period,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            _ => return Err(Error::lexer(&src.loc(line, col), format!(
                "can't identify symbol '{}'", c as char))),
        };
        self.push_token(kind, (c as char).to_string(), line, col);
        Ok(())
    }

    fn push_token(&mut self, kind: TokenKind, value: String, line: u32, col: u32) {
        let src = self.srcs.last().unwrap();
        let loc = src.loc(line, col);
        self.cache.push(Token {kind, value, loc});
    }
}

//-----------------------------------------------------------------------------
