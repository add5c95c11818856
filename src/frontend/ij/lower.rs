//! Turns a parsed [`Program`] into assembler calls: synthesizes the entry
//! point, drops unreachable functions and constants, then walks the AST
//! emitting instructions. Structured control flow becomes labels and
//! conditional branches here.

use std::collections::HashSet;

use log::{debug, info};

use crate::asm::{Assembler, Opcode};
use crate::ast::{BinOp, CompStmt, Expr, Function, JasStmt, Program, Stmt};
use crate::error::{Error, Result};
use crate::lexer::{Lexer};
use super::parse::{parse_program};

/** The receiver word pushed below the arguments of every call. */
const OBJREF_VALUE: i32 = 0xD000D000u32 as i32;

/** Parses, prunes and lowers a whole IJ program into `a`. */
pub fn compile(l: &mut Lexer, a: &mut dyn Assembler) -> Result<()> {
    let mut program = parse_program(l)?;
    add_main(&mut program);
    prune(&mut program)?;

    debug!("constants: {}", program.consts.len());
    for c in &program.consts {
        debug!("    - {}", c);
        a.constant(&c.name, c.value);
    }

    debug!("functions: {}", program.funcs.len());
    for f in &program.funcs {
        debug!("compiling function {}", f.name);
        compile_function(&program, f, a)?;
    }

    info!("successfully compiled program");
    Ok(())
}

/**
 * The real entry point calls `__main__` and dispatches on the sign of its
 * result: negative means ERR, anything else HALT. Keeping user code out of
 * `main` sidesteps the entry point's lack of a local-variable header.
 */
fn add_main(program: &mut Program) {
    let call = Expr::Call {name: "__main__".to_string(), args: vec![]};
    let cond = Expr::Op {
        op: BinOp::Lt,
        left: Box::new(call),
        right: Box::new(Expr::Value(0)),
    };
    let body = CompStmt::new(vec![Stmt::If {
        cond,
        then: CompStmt::new(vec![Stmt::Jas(JasStmt::plain(Opcode::ERR))]),
        els: CompStmt::new(vec![Stmt::Jas(JasStmt::plain(Opcode::HALT))]),
    }]);
    program.funcs.insert(0, Function {
        name: "main".to_string(),
        args: vec![],
        body,
        jas: false,
    });
}

/**
 * Reachability from `main`. Called functions come from `Call` expressions
 * and JAS `INVOKEVIRTUAL`s; an identifier that is not a local of its
 * enclosing function counts as a constant reference. Anything never reached
 * is dropped before lowering.
 */
fn prune(program: &mut Program) -> Result<()> {
    let mut reachable_funcs: HashSet<String> = HashSet::new();
    let mut reachable_consts: HashSet<String> = HashSet::new();
    let mut todo = vec!["main".to_string()];

    while let Some(name) = todo.pop() {
        if !reachable_funcs.insert(name.clone()) {
            continue;
        }
        let f = program.get_function(&name).ok_or_else(|| {
            Error::semantic(format!(
                "couldn't find function '{}' even though it was mentioned", name))
        })?;

        let mut called: Vec<String> = Vec::new();
        f.body.for_each_stmt(&mut |s| {
            if let Stmt::Jas(j) = s {
                if let Some(ident) = &j.ident {
                    if j.op.has_fun_arg() {
                        called.push(ident.clone());
                    }
                    if j.op.has_const_arg() {
                        reachable_consts.insert(ident.clone());
                    }
                }
            }
        });
        f.body.for_each_expr(&mut |e| {
            match e {
                Expr::Call {name, ..} => called.push(name.clone()),
                Expr::Ident(ident) => {
                    if !f.has_var(ident) {
                        reachable_consts.insert(ident.clone());
                    }
                },
                _ => {},
            }
        });

        for name in called {
            if program.get_function(&name).is_none() {
                return Err(Error::semantic(format!(
                    "couldn't find function '{}' even though it was mentioned",
                    name)));
            }
            todo.push(name);
        }
    }

    program.funcs.retain(|f| {
        let keep = reachable_funcs.contains(&f.name);
        if !keep {
            info!("function {} is not reachable", f.name);
        }
        keep
    });
    program.consts.retain(|c| {
        let keep = reachable_consts.contains(&c.name);
        if !keep {
            info!("constant {} is not reachable", c.name);
        }
        keep
    });
    Ok(())
}

//-----------------------------------------------------------------------------

/**
 * Hands out label ids and remembers the innermost enclosing `for`, which is
 * what `break` and `continue` target. The enclosing id is saved and restored
 * around each loop body, so plain recursion gives stack discipline.
 */
#[derive(Default)]
struct IdGen {
    next: usize,
    last_for: Option<usize>,
}

impl IdGen {
    fn fresh(&mut self) -> usize {
        let id = self.next;
        self.next += 1;
        id
    }
}

fn compile_function(p: &Program, f: &Function, a: &mut dyn Assembler) -> Result<()> {
    let mut gen = IdGen::default();
    let vars = f.vars();
    a.function(&f.name, &f.args, &vars)?;
    compile_comp(p, &f.body, a, &mut gen)
}

fn compile_comp(
    p: &Program,
    c: &CompStmt,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
) -> Result<()> {
    for s in &c.stmts {
        compile_stmt(p, s, a, gen)?;
    }
    Ok(())
}

fn compile_stmt(
    p: &Program,
    s: &Stmt,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
) -> Result<()> {
    match s {
        Stmt::Comp(c) => compile_comp(p, c, a, gen),
        Stmt::Var {name, init} => {
            compile_expr(p, init, a, gen)?;
            a.istore(name)
        },
        Stmt::Ret(e) => {
            compile_expr(p, e, a, gen)?;
            a.ireturn()
        },
        Stmt::Expr {expr, pop} => {
            compile_expr(p, expr, a, gen)?;
            if let Expr::Op {op, ..} = expr {
                if !op.leaves_on_stack() {
                    return Ok(());
                }
            }
            if *pop {
                a.pop()?;
            }
            Ok(())
        },
        Stmt::For {..} => compile_for(p, s, a, gen),
        Stmt::If {..} => compile_if(p, s, a, gen),
        Stmt::Label(name) => a.label(name),
        Stmt::Break => {
            let id = gen.last_for.ok_or_else(|| {
                Error::semantic("break outside of a for loop")
            })?;
            a.goto(&format!("for{}_end", id))
        },
        Stmt::Continue => {
            let id = gen.last_for.ok_or_else(|| {
                Error::semantic("continue outside of a for loop")
            })?;
            a.goto(&format!("for{}_update", id))
        },
        Stmt::Jas(j) => compile_jas(j, a),
    }
}

fn compile_for(
    p: &Program,
    s: &Stmt,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
) -> Result<()> {
    let Stmt::For {init, cond, update, body} = s else { unreachable!() };
    let id = gen.fresh();
    let l_start = format!("for{}_start", id);
    let l_cond = format!("for{}_condition", id);
    let l_body = format!("for{}_body", id);
    let l_update = format!("for{}_update", id);
    let l_end = format!("for{}_end", id);

    a.label(&l_start)?;
    if let Some(init) = init {
        compile_stmt(p, init, a, gen)?;
    }

    a.label(&l_cond)?;
    match cond {
        Some(Expr::Op {op, left, right}) if op.is_comparison() => {
            compile_comparison(p, a, gen, *op, left, right, &l_body, &l_end)?;
        },
        Some(cond) => {
            compile_expr(p, cond, a, gen)?;
            a.ifeq(&l_end)?;
        },
        None => {},
    }

    let enclosing = gen.last_for.replace(id);
    a.label(&l_body)?;
    compile_comp(p, body, a, gen)?;
    gen.last_for = enclosing;

    a.label(&l_update)?;
    if let Some(update) = update {
        compile_expr(p, update, a, gen)?;
    }
    a.goto(&l_cond)?;
    a.label(&l_end)
}

fn compile_if(
    p: &Program,
    s: &Stmt,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
) -> Result<()> {
    let Stmt::If {cond, then, els} = s else { unreachable!() };

    // A condition known at compile time selects its branch outright. If it
    // also has side effects it is still evaluated and discarded.
    if let Some(v) = cond.val() {
        if cond.has_side_effects() {
            compile_expr(p, cond, a, gen)?;
            a.pop()?;
        }
        return if v != 0 {
            compile_comp(p, then, a, gen)
        } else {
            compile_comp(p, els, a, gen)
        };
    }

    let id = gen.fresh();
    let else_enabled = !els.is_empty();
    let l_start = format!("if{}_condition", id);
    let l_then = format!("if{}_then", id);
    let l_end = format!("if{}_end", id);
    let l_else = if else_enabled { format!("if{}_else", id) } else { l_end.clone() };

    a.label(&l_start)?;
    match cond {
        Expr::Op {op, left, right} if op.is_comparison() => {
            compile_comparison(p, a, gen, *op, left, right, &l_then, &l_else)?;
        },
        cond => {
            compile_expr(p, cond, a, gen)?;
            a.ifeq(&l_else)?;
        },
    }

    a.label(&l_then)?;
    compile_comp(p, then, a, gen)?;

    if else_enabled {
        // The GOTO is only needed when there is code to jump over.
        if !then.is_terminal() {
            a.goto(&l_end)?;
        }
        a.label(&l_else)?;
        compile_comp(p, els, a, gen)?;
    }

    a.label(&l_end)
}

/** Lowers a comparison into ISUB/IFLT or ICMPEQ with two branch targets. */
fn compile_comparison(
    p: &Program,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
    op: BinOp,
    left: &Expr,
    right: &Expr,
    if_true: &str,
    if_false: &str,
) -> Result<()> {
    match op {
        BinOp::Lt => {
            compile_expr(p, left, a, gen)?;
            compile_expr(p, right, a, gen)?;
            a.isub()?;
            a.iflt(if_true)?;
            a.goto(if_false)
        },
        BinOp::Gt => {
            compile_expr(p, right, a, gen)?;
            compile_expr(p, left, a, gen)?;
            a.isub()?;
            a.iflt(if_true)?;
            a.goto(if_false)
        },
        BinOp::Ge => {
            compile_expr(p, left, a, gen)?;
            compile_expr(p, right, a, gen)?;
            a.isub()?;
            a.iflt(if_false)?;
            a.goto(if_true)
        },
        BinOp::Le => {
            compile_expr(p, right, a, gen)?;
            compile_expr(p, left, a, gen)?;
            a.isub()?;
            a.iflt(if_false)?;
            a.goto(if_true)
        },
        BinOp::Eq => {
            compile_expr(p, left, a, gen)?;
            compile_expr(p, right, a, gen)?;
            a.icmpeq(if_true)?;
            a.goto(if_false)
        },
        BinOp::Ne => {
            compile_expr(p, left, a, gen)?;
            compile_expr(p, right, a, gen)?;
            a.icmpeq(if_false)?;
            a.goto(if_true)
        },
        _ => Err(Error::semantic(format!(
            "'{}' is not a comparison", op.token()))),
    }
}

//-----------------------------------------------------------------------------

fn compile_expr(
    p: &Program,
    e: &Expr,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
) -> Result<()> {
    match e {
        Expr::Value(v) => a.push_val(*v),
        Expr::Ident(name) => {
            if a.is_var(name) {
                a.iload(name)
            } else if a.is_constant(name) {
                a.ldc_w(name)
            } else {
                Err(Error::semantic(format!(
                    "couldn't find reference to {}", name)))
            }
        },
        Expr::Call {name, args} => {
            if !a.is_constant("__OBJREF__") {
                a.constant("__OBJREF__", OBJREF_VALUE);
            }
            a.ldc_w("__OBJREF__")?;
            for arg in args {
                compile_expr(p, arg, a, gen)?;
            }
            a.invokevirtual(name)
        },
        Expr::Stmt(s) => compile_stmt(p, s, a, gen),
        Expr::ArrAccess {array, index} => {
            compile_expr(p, index, a, gen)?;
            compile_expr(p, array, a, gen)?;
            a.iaload()
        },
        Expr::Op {op, left, right} => compile_op(p, a, gen, *op, left, right),
    }
}

fn arith_insn(a: &mut dyn Assembler, op: BinOp) -> Result<()> {
    match op {
        BinOp::Add => a.iadd(),
        BinOp::Sub => a.isub(),
        BinOp::And => a.iand(),
        BinOp::Or => a.ior(),
        _ => unreachable!(),
    }
}

/** The arithmetic counterpart of a compound assignment. */
fn compound_base(op: BinOp) -> BinOp {
    match op {
        BinOp::AddAssign => BinOp::Add,
        BinOp::SubAssign => BinOp::Sub,
        BinOp::AndAssign => BinOp::And,
        BinOp::OrAssign => BinOp::Or,
        _ => unreachable!(),
    }
}

fn compile_op(
    p: &Program,
    a: &mut dyn Assembler,
    gen: &mut IdGen,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> Result<()> {
    if op.is_comparison() {
        return Err(Error::semantic(format!(
            "no support for {} outside of conditionals", op.token())));
    }

    match op {
        BinOp::Assign => match left {
            Expr::Ident(name) => {
                if !a.is_var(name) {
                    return Err(Error::semantic(
                        "only local variables can be assigned"));
                }
                compile_expr(p, right, a, gen)?;
                a.istore(name)
            },
            Expr::ArrAccess {array, index} => {
                compile_expr(p, right, a, gen)?;
                compile_expr(p, index, a, gen)?;
                compile_expr(p, array, a, gen)?;
                a.iastore()
            },
            _ => Err(Error::semantic(
                "you can only reassign variables and arrays")),
        },
        BinOp::AddAssign | BinOp::SubAssign | BinOp::AndAssign | BinOp::OrAssign => {
            let base = compound_base(op);
            match left {
                Expr::Ident(name) => {
                    if !a.is_var(name) {
                        return Err(Error::semantic(
                            "only local variables can be reassigned"));
                    }
                    // A literal in the signed byte range goes through IINC.
                    if let Expr::Value(v) = right {
                        let value = if base == BinOp::Sub {
                            v.wrapping_neg()
                        } else {
                            *v
                        };
                        if matches!(base, BinOp::Add | BinOp::Sub)
                            && (-128..=127).contains(&value)
                        {
                            return a.iinc(name, value as i8);
                        }
                    }
                    a.iload(name)?;
                    compile_expr(p, right, a, gen)?;
                    arith_insn(a, base)?;
                    a.istore(name)
                },
                Expr::ArrAccess {array, index} => {
                    compile_expr(p, index, a, gen)?;
                    compile_expr(p, array, a, gen)?;
                    a.iaload()?;
                    compile_expr(p, right, a, gen)?;
                    arith_insn(a, base)?;
                    compile_expr(p, index, a, gen)?;
                    compile_expr(p, array, a, gen)?;
                    a.iastore()
                },
                _ => Err(Error::semantic("you can only reassign variables")),
            }
        },
        BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or => {
            compile_expr(p, left, a, gen)?;
            compile_expr(p, right, a, gen)?;
            arith_insn(a, op)
        },
        BinOp::Mul => {
            // Core IJVM has no general multiply: one side must be a literal,
            // which the IMUL pseudo-op expands.
            if let Expr::Value(v) = left {
                compile_expr(p, right, a, gen)?;
                a.imul_const(*v)
            } else if let Expr::Value(v) = right {
                compile_expr(p, left, a, gen)?;
                a.imul_const(*v)
            } else {
                Err(Error::semantic(
                    "multiplication is only supported with a constant operand"))
            }
        },
        _ => unreachable!(),
    }
}

fn compile_jas(j: &JasStmt, a: &mut dyn Assembler) -> Result<()> {
    let ident = || -> Result<&str> {
        j.ident.as_deref().ok_or_else(|| {
            Error::semantic(format!("{} needs an operand", j.op.mnemonic()))
        })
    };
    let imm = || -> Result<i8> {
        j.imm.ok_or_else(|| {
            Error::semantic(format!("{} needs an immediate", j.op.mnemonic()))
        })
    };

    match j.op {
        Opcode::BIPUSH => a.bipush(imm()?),
        Opcode::DUP => a.dup(),
        Opcode::ERR => a.err(),
        Opcode::GOTO => a.goto(ident()?),
        Opcode::HALT => a.halt(),
        Opcode::IADD => a.iadd(),
        Opcode::IAND => a.iand(),
        Opcode::IFEQ => a.ifeq(ident()?),
        Opcode::IFLT => a.iflt(ident()?),
        Opcode::ICMPEQ => a.icmpeq(ident()?),
        Opcode::IINC => a.iinc(ident()?, imm()?),
        Opcode::ILOAD => a.iload(ident()?),
        Opcode::IN => a.in_(),
        Opcode::INVOKEVIRTUAL => a.invokevirtual(ident()?),
        Opcode::IOR => a.ior(),
        Opcode::IRETURN => a.ireturn(),
        Opcode::ISTORE => a.istore(ident()?),
        Opcode::ISUB => a.isub(),
        Opcode::LDC_W => a.ldc_w(ident()?),
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
