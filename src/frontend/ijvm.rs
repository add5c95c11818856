//! The IJVM-binary frontend: decodes an image back into an instruction
//! stream and replays it into an assembler. Control flow is recovered with a
//! worklist of basic-block entry points; jump targets get `loc_<offset>`
//! labels and functions `func_<offset>` names, resolved through the constant
//! pool.

use std::collections::HashSet;

use log::{debug};

use crate::asm::{Assembler, Opcode, IJVM_MAGIC};
use crate::buffer::{Buffer, Endian, Reader};
use crate::error::{Error, Result};

const E: Endian = Endian::Big;

fn loc_name(offset: usize) -> String {
    format!("loc_{:04x}", offset)
}

fn func_name(offset: usize) -> String {
    format!("func_{:04x}", offset)
}

/** Decodes the image in `b` and replays it into `a`. */
pub fn compile(b: &Buffer, a: &mut dyn Assembler) -> Result<()> {
    let mut r = b.reader();

    let magic = r.read_u32(E)?;
    if magic != IJVM_MAGIC {
        return Err(Error::semantic(format!(
            "magic was supposed to be {:#x} but was {:#x}", IJVM_MAGIC, magic)));
    }

    r.read_u32(E)?; // pool marker
    let pool_bytes = r.read_u32(E)?;
    let mut constants = Vec::new();
    for i in 0..pool_bytes / 4 {
        let value = r.read_i32(E)?;
        a.constant(&format!("constant_{}", i), value);
        constants.push(value);
    }
    debug!("image carries {} constants", constants.len());

    r.read_u32(E)?; // text marker
    let text_bytes = r.read_u32(E)? as usize;
    let text = b.slice(r.position(), r.position() + text_bytes)?;

    // The entry point has no header, so its local count must be recovered
    // by scanning for the highest slot index it touches.
    let main_vars = main_local_count(&text)?;
    debug!("main uses {} local slots", main_vars);

    let mut funcs_found = Vec::new();
    let mut text_reader = text.reader();
    compile_method(&mut text_reader, "main", 0, main_vars, a, &mut funcs_found,
        &constants)?;

    let mut funcs_visited: HashSet<usize> = HashSet::new();
    while let Some(addr) = funcs_found.pop() {
        if !funcs_visited.insert(addr) {
            continue;
        }
        text_reader.seek(addr);
        let nargs = text_reader.read_u16(E)?;
        let nvars = text_reader.read_u16(E)?;
        if nargs == 0 {
            return Err(Error::semantic(format!(
                "function header at {:#x} counts no OBJREF slot", addr)));
        }
        compile_method(&mut text_reader, &func_name(addr), nargs - 1, nvars, a,
            &mut funcs_found, &constants)?;
    }

    Ok(())
}

fn read_index(r: &mut Reader<'_>, wide: bool) -> Result<u16> {
    if wide {
        r.read_u16(E)
    } else {
        Ok(r.read_u8()? as u16)
    }
}

/** Reads one opcode, folding any WIDE prefixes into a flag. */
fn read_opcode(r: &mut Reader<'_>) -> Result<(Opcode, bool)> {
    let mut wide = false;
    loop {
        let raw = r.read_u8()?;
        let op = Opcode::parse(raw).ok_or_else(|| {
            Error::semantic(format!("encountered illegal instruction {:#04x}", raw))
        })?;
        if op == Opcode::WIDE {
            wide = true;
            continue;
        }
        return Ok((op, wide));
    }
}

/**
 * Walks every basic block of the entry point, tracking the highest
 * local-variable index it loads, stores or increments.
 */
fn main_local_count(text: &Buffer) -> Result<u16> {
    let mut r = text.reader();
    let mut todo: Vec<usize> = vec![0];
    let mut visited: HashSet<usize> = HashSet::new();
    let mut var_count: u16 = 0;

    while let Some(start) = todo.pop() {
        r.seek(start);
        loop {
            let offset = r.position();
            if !visited.insert(offset) {
                break;
            }
            let (op, wide) = read_opcode(&mut r)?;

            if op.has_var_arg() {
                let index = read_index(&mut r, wide)?;
                var_count = var_count.max(index + 1);
                if op == Opcode::IINC {
                    r.read_i8()?;
                }
            } else if op.is_final() {
                break;
            } else if op == Opcode::LDC_W || op == Opcode::INVOKEVIRTUAL {
                r.read_u16(E)?;
            } else if op == Opcode::BIPUSH {
                r.read_i8()?;
            } else if op.has_label_arg() {
                let disp = r.read_i16(E)?;
                todo.push((offset as i64 + disp as i64) as usize);
                if op == Opcode::GOTO {
                    break;
                }
            }
        }
    }

    Ok(var_count)
}

/**
 * Decodes one method body, replaying each instruction into `a`. Every
 * decoded offset is labelled so that jumps into the middle of an
 * already-decoded run still resolve.
 */
fn compile_method(
    r: &mut Reader<'_>,
    name: &str,
    nargs: u16,
    nvars: u16,
    a: &mut dyn Assembler,
    funcs_found: &mut Vec<usize>,
    constants: &[i32],
) -> Result<()> {
    let is_main = name == "main";
    let args: Vec<String> = (0..nargs).map(|i| format!("arg_{}", i)).collect();
    let vars: Vec<String> = (0..nvars).map(|i| format!("lvar_{}", i)).collect();

    debug!("decoding {} with {} args and {} vars", name, nargs, nvars);
    a.function(name, &args, &vars)?;

    let local_name = |index: u16| -> Result<String> {
        let mut index = index as usize;
        if !is_main {
            if index == 0 {
                return Ok("OBJREF".to_string());
            }
            index -= 1;
        }
        if index < args.len() {
            return Ok(args[index].clone());
        }
        index -= args.len();
        if index < vars.len() {
            return Ok(vars[index].clone());
        }
        Err(Error::semantic(format!(
            "{} does not have a local variable slot {}", name, index)))
    };

    let mut todo: Vec<usize> = vec![r.position()];
    let mut visited: HashSet<usize> = HashSet::new();

    while let Some(start) = todo.pop() {
        r.seek(start);
        loop {
            let offset = r.position();
            if !visited.insert(offset) {
                break;
            }
            a.label(&loc_name(offset))?;
            let (op, wide) = read_opcode(r)?;

            match op {
                Opcode::BIPUSH => a.bipush(r.read_i8()?)?,

                Opcode::ILOAD => {
                    let var = local_name(read_index(r, wide)?)?;
                    a.iload(&var)?;
                },
                Opcode::ISTORE => {
                    let var = local_name(read_index(r, wide)?)?;
                    a.istore(&var)?;
                },
                Opcode::IINC => {
                    let var = local_name(read_index(r, wide)?)?;
                    a.iinc(&var, r.read_i8()?)?;
                },

                Opcode::LDC_W => {
                    let index = r.read_u16(E)?;
                    a.ldc_w(&format!("constant_{}", index))?;
                },
                Opcode::INVOKEVIRTUAL => {
                    let index = r.read_u16(E)? as usize;
                    let addr = *constants.get(index).ok_or_else(|| {
                        Error::semantic(format!(
                            "INVOKEVIRTUAL of out-of-range pool slot {}", index))
                    })? as u32 as usize;
                    funcs_found.push(addr);
                    a.invokevirtual(&func_name(addr))?;
                },

                Opcode::GOTO => {
                    let target = (offset as i64 + r.read_i16(E)? as i64) as usize;
                    a.goto(&loc_name(target))?;
                    todo.push(target);
                    break;
                },
                Opcode::IFEQ | Opcode::IFLT | Opcode::ICMPEQ => {
                    let target = (offset as i64 + r.read_i16(E)? as i64) as usize;
                    match op {
                        Opcode::IFEQ => a.ifeq(&loc_name(target))?,
                        Opcode::IFLT => a.iflt(&loc_name(target))?,
                        _ => a.icmpeq(&loc_name(target))?,
                    }
                    todo.push(target);
                },

                Opcode::IRETURN => {
                    a.ireturn()?;
                    break;
                },
                Opcode::HALT => {
                    a.halt()?;
                    break;
                },
                Opcode::ERR => {
                    a.err()?;
                    break;
                },

                Opcode::DUP => a.dup()?,
                Opcode::IADD => a.iadd()?,
                Opcode::IAND => a.iand()?,
                Opcode::IN => a.in_()?,
                Opcode::IOR => a.ior()?,
                Opcode::ISUB => a.isub()?,
                Opcode::NOP => a.nop()?,
                Opcode::OUT => a.out()?,
                Opcode::POP => a.pop()?,
                Opcode::SWAP => a.swap()?,
                Opcode::NEWARRAY => a.newarray()?,
                Opcode::IALOAD => a.iaload()?,
                Opcode::IASTORE => a.iastore()?,
                Opcode::GC => a.gc()?,
                Opcode::NETBIND => a.netbind()?,
                Opcode::NETCONNECT => a.netconnect()?,
                Opcode::NETIN => a.netin()?,
                Opcode::NETOUT => a.netout()?,
                Opcode::NETCLOSE => a.netclose()?,
                Opcode::SHL => a.shl()?,
                Opcode::SHR => a.shr()?,
                Opcode::IMUL => a.imul()?,
                Opcode::IDIV => a.idiv()?,
                Opcode::WIDE => unreachable!("folded by read_opcode"),
            }

            if !r.has_next(1) {
                return Err(Error::semantic(
                    "instruction stream ran off the end of the text section"
                        .to_string()));
            }
        }
    }

    Ok(())
}

//-----------------------------------------------------------------------------
