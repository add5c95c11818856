//! The program model built by the IJ parser and consumed by the lowering
//! pass. Expressions and statements are tagged sums owning their children
//! exclusively; analysis is pattern matching, there is no further runtime
//! introspection.

use std::fmt;

use crate::asm::{Opcode};

/** A binary or assignment operator of the IJ surface syntax. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinOp {
    Assign,
    AddAssign,
    SubAssign,
    AndAssign,
    OrAssign,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
}

use BinOp::*;

impl BinOp {
    pub fn from_token(token: &str) -> Option<BinOp> {
        Some(match token {
            "=" => Assign,
            "+=" => AddAssign,
            "-=" => SubAssign,
            "&=" => AndAssign,
            "|=" => OrAssign,
            "==" => Eq,
            "!=" => Ne,
            "<" => Lt,
            ">" => Gt,
            "<=" => Le,
            ">=" => Ge,
            "&" => And,
            "|" => Or,
            "+" => Add,
            "-" => Sub,
            "*" => Mul,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            Assign => "=", AddAssign => "+=", SubAssign => "-=",
            AndAssign => "&=", OrAssign => "|=",
            Eq => "==", Ne => "!=", Lt => "<", Gt => ">", Le => "<=", Ge => ">=",
            And => "&", Or => "|", Add => "+", Sub => "-", Mul => "*",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, Eq | Ne | Lt | Gt | Le | Ge)
    }

    pub fn is_assignment(self) -> bool {
        matches!(self, Assign | AddAssign | SubAssign | AndAssign | OrAssign)
    }

    /** Tests whether evaluating the operator leaves a value on the stack. */
    pub fn leaves_on_stack(self) -> bool {
        matches!(self, And | Or | Add | Sub | Mul)
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug)]
pub enum Expr {
    Op { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Ident(String),
    Value(i32),
    Call { name: String, args: Vec<Expr> },
    /** A statement emitted in expression position (I/O and heap sugar). */
    Stmt(Box<Stmt>),
    ArrAccess { array: Box<Expr>, index: Box<Expr> },
}

impl Expr {
    /** Folds a literal subtree to its value, or `None`. */
    pub fn val(&self) -> Option<i32> {
        match self {
            Expr::Value(v) => Some(*v),
            Expr::Op {op, left, right} => {
                let l = left.val()?;
                let r = right.val()?;
                Some(match op {
                    Add => l.wrapping_add(r),
                    Sub => l.wrapping_sub(r),
                    Mul => l.wrapping_mul(r),
                    And => l & r,
                    Or => l | r,
                    Eq => (l == r) as i32,
                    Ne => (l != r) as i32,
                    Lt => (l < r) as i32,
                    Gt => (l > r) as i32,
                    Le => (l <= r) as i32,
                    Ge => (l >= r) as i32,
                    Assign | AddAssign | SubAssign | AndAssign | OrAssign => return None,
                })
            },
            _ => None,
        }
    }

    pub fn has_side_effects(&self) -> bool {
        match self {
            Expr::Op {left, right, ..} =>
                left.has_side_effects() || right.has_side_effects(),
            Expr::Ident(_) | Expr::Value(_) => false,
            Expr::Call {..} | Expr::Stmt(_) | Expr::ArrAccess {..} => true,
        }
    }

    /** Calls `f` on this expression and every expression below it. */
    pub fn for_each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Op {left, right, ..} => {
                left.for_each_expr(f);
                right.for_each_expr(f);
            },
            Expr::Call {args, ..} => {
                for arg in args {
                    arg.for_each_expr(f);
                }
            },
            Expr::Stmt(stmt) => stmt.for_each_expr(f),
            Expr::ArrAccess {array, index} => {
                array.for_each_expr(f);
                index.for_each_expr(f);
            },
            Expr::Ident(_) | Expr::Value(_) => {},
        }
    }

    /** Calls `f` on every statement embedded below this expression. */
    pub fn for_each_stmt<'a>(&'a self, f: &mut dyn FnMut(&'a Stmt)) {
        match self {
            Expr::Op {left, right, ..} => {
                left.for_each_stmt(f);
                right.for_each_stmt(f);
            },
            Expr::Call {args, ..} => {
                for arg in args {
                    arg.for_each_stmt(f);
                }
            },
            Expr::Stmt(stmt) => stmt.for_each_stmt(f),
            Expr::ArrAccess {array, index} => {
                array.for_each_stmt(f);
                index.for_each_stmt(f);
            },
            Expr::Ident(_) | Expr::Value(_) => {},
        }
    }
}

//-----------------------------------------------------------------------------

/** A literal assembly instruction appearing in a `jas` block. */
#[derive(Debug)]
pub struct JasStmt {
    pub op: Opcode,
    /** The label, variable, constant or function operand, if the opcode
     * takes one. */
    pub ident: Option<String>,
    /** The signed-byte immediate, if the opcode takes one. */
    pub imm: Option<i8>,
}

impl JasStmt {
    pub fn plain(op: Opcode) -> Self {
        JasStmt {op, ident: None, imm: None}
    }

    pub fn bipush(value: i8) -> Self {
        JasStmt {op: Opcode::BIPUSH, ident: None, imm: Some(value)}
    }
}

#[derive(Debug, Default)]
pub struct CompStmt {
    pub stmts: Vec<Stmt>,
}

impl CompStmt {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        CompStmt {stmts}
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /**
     * Tests whether control cannot fall out of the bottom of this block:
     * some member returns, breaks, continues, or is a final JAS instruction.
     * Used to elide the GOTO after a then-branch.
     */
    pub fn is_terminal(&self) -> bool {
        self.stmts.iter().any(|s| match s {
            Stmt::Comp(c) => c.is_terminal(),
            Stmt::Jas(j) => j.op.is_final(),
            Stmt::Ret(_) | Stmt::Break | Stmt::Continue => true,
            _ => false,
        })
    }

    pub fn find_vars(&self, vars: &mut Vec<String>) {
        for s in &self.stmts {
            s.find_vars(vars);
        }
    }

    pub fn for_each_stmt<'a>(&'a self, f: &mut dyn FnMut(&'a Stmt)) {
        for s in &self.stmts {
            s.for_each_stmt(f);
        }
    }

    pub fn for_each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        for s in &self.stmts {
            s.for_each_expr(f);
        }
    }
}

#[derive(Debug)]
pub enum Stmt {
    Comp(CompStmt),
    Var { name: String, init: Expr },
    Ret(Expr),
    Expr { expr: Expr, pop: bool },
    /** `while` is a `For` with no init and no update. */
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: CompStmt,
    },
    If { cond: Expr, then: CompStmt, els: CompStmt },
    Label(String),
    Break,
    Continue,
    Jas(JasStmt),
}

impl Stmt {
    /** Collects the names declared by `var` statements, in order. */
    pub fn find_vars(&self, vars: &mut Vec<String>) {
        match self {
            Stmt::Comp(c) => c.find_vars(vars),
            Stmt::Var {name, ..} => vars.push(name.clone()),
            Stmt::For {init, body, ..} => {
                if let Some(init) = init {
                    init.find_vars(vars);
                }
                body.find_vars(vars);
            },
            Stmt::If {then, els, ..} => {
                then.find_vars(vars);
                els.find_vars(vars);
            },
            _ => {},
        }
    }

    /** Calls `f` on this statement and every statement below it. */
    pub fn for_each_stmt<'a>(&'a self, f: &mut dyn FnMut(&'a Stmt)) {
        f(self);
        match self {
            Stmt::Comp(c) => c.for_each_stmt(f),
            Stmt::Var {init, ..} => init.for_each_stmt(f),
            Stmt::Ret(e) => e.for_each_stmt(f),
            Stmt::Expr {expr, ..} => expr.for_each_stmt(f),
            Stmt::For {init, cond, update, body} => {
                if let Some(init) = init {
                    init.for_each_stmt(f);
                }
                if let Some(cond) = cond {
                    cond.for_each_stmt(f);
                }
                if let Some(update) = update {
                    update.for_each_stmt(f);
                }
                body.for_each_stmt(f);
            },
            Stmt::If {cond, then, els} => {
                cond.for_each_stmt(f);
                then.for_each_stmt(f);
                els.for_each_stmt(f);
            },
            Stmt::Label(_) | Stmt::Break | Stmt::Continue | Stmt::Jas(_) => {},
        }
    }

    /** Calls `f` on every expression below this statement. */
    pub fn for_each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match self {
            Stmt::Comp(c) => c.for_each_expr(f),
            Stmt::Var {init, ..} => init.for_each_expr(f),
            Stmt::Ret(e) => e.for_each_expr(f),
            Stmt::Expr {expr, ..} => expr.for_each_expr(f),
            Stmt::For {init, cond, update, body} => {
                if let Some(init) = init {
                    init.for_each_expr(f);
                }
                if let Some(cond) = cond {
                    cond.for_each_expr(f);
                }
                if let Some(update) = update {
                    update.for_each_expr(f);
                }
                body.for_each_expr(f);
            },
            Stmt::If {cond, then, els} => {
                cond.for_each_expr(f);
                then.for_each_expr(f);
                els.for_each_expr(f);
            },
            Stmt::Label(_) | Stmt::Break | Stmt::Continue | Stmt::Jas(_) => {},
        }
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Constant {
    pub name: String,
    pub value: i32,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub args: Vec<String>,
    pub body: CompStmt,
    /** Whether the body was written as a literal `jas` block. */
    pub jas: bool,
}

impl Function {
    /** The local variables declared by the body, in declaration order. */
    pub fn vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.body.find_vars(&mut vars);
        vars
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
            || self.vars().iter().any(|v| v == name)
    }
}

/** A parsed program: functions and constants in declaration order. */
#[derive(Debug, Default)]
pub struct Program {
    pub funcs: Vec<Function>,
    pub consts: Vec<Constant>,
}

impl Program {
    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn get_const(&self, name: &str) -> Option<&Constant> {
        self.consts.iter().find(|c| c.name == name)
    }
}

//-----------------------------------------------------------------------------
// Debug dumps, printed by the driver at the highest verbosity.

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Op {op, left, right} =>
                write!(f, "Operator<'{}'>({}, {})", op.token(), left, right),
            Expr::Ident(name) => write!(f, "Identifier('{}')", name),
            Expr::Value(v) => write!(f, "Value({})", v),
            Expr::Call {name, args} => {
                write!(f, "Call({}, (", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, "))")
            },
            Expr::Stmt(stmt) => write!(f, "StmtExpr({})", stmt),
            Expr::ArrAccess {array, index} =>
                write!(f, "ArrayAccess({}[{}])", array, index),
        }
    }
}

impl fmt::Display for CompStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for s in &self.stmts {
            write!(f, "{}; ", s)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Comp(c) => write!(f, "{}", c),
            Stmt::Var {name, init} => write!(f, "VarStmt('{}', {})", name, init),
            Stmt::Ret(e) => write!(f, "RetStmt({})", e),
            Stmt::Expr {expr, ..} => write!(f, "Stmt({})", expr),
            Stmt::For {init, cond, update, body} => {
                write!(f, "ForStmt(init=")?;
                match init {
                    Some(init) => write!(f, "{}", init)?,
                    None => write!(f, "empty")?,
                }
                write!(f, ", condition=")?;
                match cond {
                    Some(cond) => write!(f, "{}", cond)?,
                    None => write!(f, "empty")?,
                }
                write!(f, ", update=")?;
                match update {
                    Some(update) => write!(f, "{}", update)?,
                    None => write!(f, "empty")?,
                }
                write!(f, "){}", body)
            },
            Stmt::If {cond, then, els} =>
                write!(f, "IfStmt({}) {} Else{}", cond, then, els),
            Stmt::Label(name) => write!(f, "Label({})", name),
            Stmt::Break => write!(f, "Break"),
            Stmt::Continue => write!(f, "Continue"),
            Stmt::Jas(j) => {
                write!(f, "JasStmt({}", j.op.mnemonic())?;
                if let Some(ident) = &j.ident {
                    write!(f, " {}", ident)?;
                }
                if let Some(imm) = j.imm {
                    write!(f, " {}", imm)?;
                }
                write!(f, ")")
            },
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constant({}, {})", self.name, self.value)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function<{}>{}({})", self.name,
            if self.jas { " jas" } else { "" }, self.args.join(", "))?;
        write!(f, " {}", self.body)
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Op {op, left: Box::new(left), right: Box::new(right)}
    }

    #[test]
    fn constant_folding() {
        // 1 + 1 == 2
        let e = op(Eq, op(Add, Expr::Value(1), Expr::Value(1)), Expr::Value(2));
        assert_eq!(e.val(), Some(1));
        let e = op(Ne, Expr::Value(3), Expr::Value(3));
        assert_eq!(e.val(), Some(0));
        let e = op(Mul, Expr::Value(0x40000000), Expr::Value(4));
        assert_eq!(e.val(), Some(0));
        let e = op(Add, Expr::Ident("x".to_string()), Expr::Value(2));
        assert_eq!(e.val(), None);
    }

    #[test]
    fn side_effects() {
        let call = Expr::Call {name: "f".to_string(), args: vec![]};
        assert!(call.has_side_effects());
        let e = op(Add, Expr::Value(1), call);
        assert!(e.has_side_effects());
        assert_eq!(e.val(), None);
        assert!(!op(Add, Expr::Value(1), Expr::Ident("x".to_string()))
            .has_side_effects());
    }

    #[test]
    fn terminality() {
        let terminal = CompStmt::new(vec![Stmt::Ret(Expr::Value(0))]);
        assert!(terminal.is_terminal());
        let nested = CompStmt::new(vec![
            Stmt::Comp(CompStmt::new(vec![Stmt::Break])),
        ]);
        assert!(nested.is_terminal());
        let jas = CompStmt::new(vec![Stmt::Jas(JasStmt::plain(Opcode::HALT))]);
        assert!(jas.is_terminal());
        let open = CompStmt::new(vec![Stmt::Expr {
            expr: Expr::Value(1),
            pop: true,
        }]);
        assert!(!open.is_terminal());
    }

    #[test]
    fn var_collection() {
        let body = CompStmt::new(vec![
            Stmt::Var {name: "a".to_string(), init: Expr::Value(0)},
            Stmt::For {
                init: Some(Box::new(Stmt::Var {
                    name: "i".to_string(),
                    init: Expr::Value(0),
                })),
                cond: None,
                update: None,
                body: CompStmt::new(vec![
                    Stmt::Var {name: "b".to_string(), init: Expr::Value(0)},
                ]),
            },
        ]);
        let f = Function {
            name: "f".to_string(),
            args: vec!["n".to_string()],
            body,
            jas: false,
        };
        assert_eq!(f.vars(), vec!["a", "i", "b"]);
        assert!(f.has_var("n"));
        assert!(f.has_var("b"));
        assert!(!f.has_var("x"));
    }
}
