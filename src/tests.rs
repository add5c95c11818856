//! End-to-end tests: IJ source (or JAS text) through the IJVM backend, with
//! the emitted image executed by a small reference evaluator.

use std::collections::VecDeque;

use crate::asm::{Assembler, IjvmAssembler, JasAssembler, Opcode};
use crate::buffer::{Buffer};
use crate::frontend::{ij, ijvm, jas};
use crate::lexer::{Lexer};

fn compile_ij(source: &str) -> Vec<u8> {
    let mut l = Lexer::new();
    l.add_source_str("test.ij", source);
    let mut a = IjvmAssembler::new();
    ij::compile(&mut l, &mut a).expect("compile failed");
    let mut out = Vec::new();
    a.compile(&mut out).unwrap();
    out
}

fn compile_ij_to_jas(source: &str) -> String {
    let mut l = Lexer::new();
    l.add_source_str("test.ij", source);
    let mut a = JasAssembler::new();
    ij::compile(&mut l, &mut a).expect("compile failed");
    let mut out = Vec::new();
    a.compile(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn compile_jas(source: &str) -> Vec<u8> {
    let mut l = Lexer::new();
    l.add_source_str("test.jas", source);
    let mut a = IjvmAssembler::new();
    jas::compile(&mut l, &mut a).expect("assemble failed");
    let mut out = Vec::new();
    a.compile(&mut out).unwrap();
    out
}

/** The text section of an image, for byte-level assertions. */
fn text_section(image: &[u8]) -> &[u8] {
    let pool_bytes = u32::from_be_bytes(image[8..12].try_into().unwrap()) as usize;
    let text_start = 12 + pool_bytes + 8;
    let text_bytes = u32::from_be_bytes(
        image[text_start - 4..text_start].try_into().unwrap()) as usize;
    &image[text_start..text_start + text_bytes]
}

//-----------------------------------------------------------------------------

struct Frame {
    locals: Vec<i32>,
    return_pc: usize,
}

/** A reference evaluator for emitted IJVM images. */
struct Vm {
    pool: Vec<i32>,
    text: Vec<u8>,
    stack: Vec<i32>,
    heap: Vec<Vec<i32>>,
    frames: Vec<Frame>,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl Vm {
    fn new(image: &[u8], input: &[u8]) -> Vm {
        assert_eq!(&image[0..4], &[0x1D, 0xEA, 0xDF, 0xAD], "bad magic");
        let pool_bytes = u32::from_be_bytes(image[8..12].try_into().unwrap()) as usize;
        let pool = (0..pool_bytes / 4)
            .map(|i| {
                let at = 12 + i * 4;
                i32::from_be_bytes(image[at..at + 4].try_into().unwrap())
            })
            .collect();
        let text = text_section(image).to_vec();
        Vm {
            pool,
            text,
            stack: Vec::new(),
            heap: Vec::new(),
            frames: vec![Frame {locals: Vec::new(), return_pc: usize::MAX}],
            input: input.iter().copied().collect(),
            output: Vec::new(),
        }
    }

    fn push(&mut self, v: i32) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> i32 {
        self.stack.pop().expect("operand stack underflow")
    }

    fn local(&mut self, index: usize) -> &mut i32 {
        let locals = &mut self.frames.last_mut().unwrap().locals;
        if locals.len() <= index {
            locals.resize(index + 1, 0);
        }
        &mut locals[index]
    }

    fn u8_at(&self, pc: usize) -> u8 {
        self.text[pc]
    }

    fn u16_at(&self, pc: usize) -> u16 {
        u16::from_be_bytes(self.text[pc..pc + 2].try_into().unwrap())
    }

    fn i16_at(&self, pc: usize) -> i16 {
        self.u16_at(pc) as i16
    }

    /** Runs to HALT or ERR, returning the exit status. */
    fn run(&mut self) -> i32 {
        let mut pc = 0usize;
        for _step in 0..1_000_000 {
            let at = pc;
            let mut wide = false;
            let mut raw = self.u8_at(pc);
            pc += 1;
            while raw == Opcode::WIDE as u8 {
                wide = true;
                raw = self.u8_at(pc);
                pc += 1;
            }
            let op = Opcode::parse(raw)
                .unwrap_or_else(|| panic!("illegal opcode {:#04x} at {}", raw, at));

            let index = if op.has_var_arg() {
                if wide {
                    let v = self.u16_at(pc) as usize;
                    pc += 2;
                    v
                } else {
                    let v = self.u8_at(pc) as usize;
                    pc += 1;
                    v
                }
            } else {
                0
            };

            match op {
                Opcode::NOP => {},
                Opcode::BIPUSH => {
                    let v = self.u8_at(pc) as i8 as i32;
                    pc += 1;
                    self.push(v);
                },
                Opcode::LDC_W => {
                    let i = self.u16_at(pc) as usize;
                    pc += 2;
                    self.push(self.pool[i]);
                },
                Opcode::ILOAD => {
                    let v = *self.local(index);
                    self.push(v);
                },
                Opcode::ISTORE => {
                    let v = self.pop();
                    *self.local(index) = v;
                },
                Opcode::IINC => {
                    let v = self.u8_at(pc) as i8 as i32;
                    pc += 1;
                    let old = *self.local(index);
                    *self.local(index) = old.wrapping_add(v);
                },
                Opcode::POP => {
                    self.pop();
                },
                Opcode::DUP => {
                    let v = *self.stack.last().unwrap();
                    self.push(v);
                },
                Opcode::SWAP => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(b);
                    self.push(a);
                },
                Opcode::IADD => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_add(b));
                },
                Opcode::ISUB => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_sub(b));
                },
                Opcode::IAND => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a & b);
                },
                Opcode::IOR => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a | b);
                },
                Opcode::SHL => {
                    let count = self.pop();
                    let v = self.pop();
                    self.push(v.wrapping_shl(count as u32 & 31));
                },
                Opcode::SHR => {
                    let count = self.pop();
                    let v = self.pop();
                    self.push(((v as u32) >> (count as u32 & 31)) as i32);
                },
                Opcode::IMUL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_mul(b));
                },
                Opcode::IDIV => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_div(b));
                },
                Opcode::IFEQ => {
                    let d = self.i16_at(pc);
                    pc += 2;
                    if self.pop() == 0 {
                        pc = (at as i64 + d as i64) as usize;
                    }
                },
                Opcode::IFLT => {
                    let d = self.i16_at(pc);
                    pc += 2;
                    if self.pop() < 0 {
                        pc = (at as i64 + d as i64) as usize;
                    }
                },
                Opcode::ICMPEQ => {
                    let d = self.i16_at(pc);
                    pc += 2;
                    let b = self.pop();
                    let a = self.pop();
                    if a == b {
                        pc = (at as i64 + d as i64) as usize;
                    }
                },
                Opcode::GOTO => {
                    let d = self.i16_at(pc);
                    pc = (at as i64 + d as i64) as usize;
                },
                Opcode::INVOKEVIRTUAL => {
                    let i = self.u16_at(pc) as usize;
                    pc += 2;
                    let addr = self.pool[i] as u32 as usize;
                    let nargs = self.u16_at(addr) as usize;
                    let nvars = self.u16_at(addr + 2) as usize;
                    let mut locals = vec![0; nargs + nvars];
                    for slot in (0..nargs).rev() {
                        locals[slot] = self.pop();
                    }
                    self.frames.push(Frame {locals, return_pc: pc});
                    pc = addr + 4;
                },
                Opcode::IRETURN => {
                    let v = self.pop();
                    let frame = self.frames.pop().expect("return without frame");
                    pc = frame.return_pc;
                    self.push(v);
                },
                Opcode::IN => {
                    let v = self.input.pop_front().map_or(0, |b| b as i32);
                    self.push(v);
                },
                Opcode::OUT => {
                    let v = self.pop();
                    self.output.push(v as u8);
                },
                Opcode::NEWARRAY => {
                    let size = self.pop().max(0) as usize;
                    self.heap.push(vec![0; size]);
                    self.push(self.heap.len() as i32 - 1);
                },
                Opcode::IALOAD => {
                    let array = self.pop() as usize;
                    let i = self.pop() as usize;
                    self.push(self.heap[array][i]);
                },
                Opcode::IASTORE => {
                    let array = self.pop() as usize;
                    let i = self.pop() as usize;
                    let v = self.pop();
                    self.heap[array][i] = v;
                },
                Opcode::HALT => return 0,
                Opcode::ERR => return 1,
                op => panic!("evaluator does not support {:?}", op),
            }
        }
        panic!("step limit exceeded");
    }
}

fn run_image(image: &[u8], input: &[u8]) -> (String, i32) {
    let mut vm = Vm::new(image, input);
    let status = vm.run();
    (String::from_utf8_lossy(&vm.output).into_owned(), status)
}

fn run_ij(source: &str, input: &[u8]) -> (String, i32) {
    run_image(&compile_ij(source), input)
}

//-----------------------------------------------------------------------------

#[test]
fn s1_hello() {
    let (out, status) = run_ij(
        r#"function __main__() { $puts("Hello"); return 0; }"#, b"");
    assert_eq!(out, "Hello\n");
    assert_eq!(status, 0);
}

#[test]
fn s2_arithmetic() {
    let (out, status) = run_ij(
        "function __main__() { var x = 3; x += 5*2; $putc('0'+x); return 0; }",
        b"");
    assert_eq!(out, "=");
    assert_eq!(status, 0);
}

#[test]
fn s3_control_flow() {
    let (out, status) = run_ij("
        function __main__() {
            var i = 0;
            for (i = 0; i < 3; i += 1) { $putc('a'+i); }
            return 0;
        }", b"");
    assert_eq!(out, "abc");
    assert_eq!(status, 0);
}

#[test]
fn s4_recursion_with_shift_and_add_multiply() {
    let (out, status) = run_ij("
        function f(n) {
            if (n<=1) return 1;
            return 2*f(n-1);
        }
        function __main__() { $putc('0'+f(5)); return 0; }", b"");
    // f doubles four times: '0' + 16 = '@'.
    assert_eq!(out, "@");
    assert_eq!(status, 0);
}

#[test]
fn s5_known_condition_emits_only_the_taken_branch() {
    let image = compile_ij("
        function __main__() {
            if (1+1 == 2) { $putc('Y'); } else { $putc('N'); }
            return 0;
        }");
    let text = text_section(&image);
    let has = |imm: u8| text.windows(2)
        .any(|w| w == [Opcode::BIPUSH as u8, imm]);
    assert!(has(b'Y'));
    assert!(!has(b'N'));
}

#[test]
fn s6_pruned_image_matches_the_baseline() {
    let with_dead = compile_ij("
        constant unused_weight = 1000;
        function unused(n) { return n + unused_weight; }
        function __main__() { return 0; }");
    let baseline = compile_ij("function __main__() { return 0; }");
    assert_eq!(with_dead.len(), baseline.len());
    assert_eq!(with_dead, baseline);
}

#[test]
fn exit_status_follows_the_sign_of_main() {
    assert_eq!(run_ij("function __main__() { return 0; }", b"").1, 0);
    assert_eq!(run_ij("function __main__() { return 5; }", b"").1, 0);
    assert_eq!(run_ij("function __main__() { return -1; }", b"").1, 1);
}

#[test]
fn getc_reads_and_eof_is_zero() {
    let source = "
        function __main__() {
            var c = $getc();
            for (; c; c = $getc()) { $putc(c); }
            return 0;
        }";
    let (out, _) = run_ij(source, b"hi!");
    assert_eq!(out, "hi!");
    let (out, _) = run_ij(source, b"");
    assert_eq!(out, "");
}

#[test]
fn break_and_continue() {
    let (out, _) = run_ij("
        function __main__() {
            var i;
            for (i = 0; i < 10; i += 1) {
                if (i == 2) { continue; }
                if (i == 5) { break; }
                $putc('0'+i);
            }
            return 0;
        }", b"");
    assert_eq!(out, "0134");
}

#[test]
fn while_loops_and_compound_assignment() {
    let (out, _) = run_ij("
        function __main__() {
            var n = 1;
            while (n < 100) { n = n * 3; }
            // 243: emit hundreds, tens, ones the hard way.
            $putc('0' + 2);
            $putc('0' + 4);
            $putc('0' + (n - 240));
            return 0;
        }", b"");
    assert_eq!(out, "243");
}

#[test]
fn arrays_end_to_end() {
    let (out, _) = run_ij("
        function __main__() {
            var arr = $malloc(3);
            var i;
            for (i = 0; i < 3; i += 1) { arr[i] = 'a' + i; }
            arr[1] += 1;
            for (i = 0; i < 3; i += 1) { $putc(arr[i]); }
            return 0;
        }", b"");
    assert_eq!(out, "acc");
}

#[test]
fn jas_functions_mix_with_ij() {
    let (out, _) = run_ij("
        function twice(n) jas {
            ILOAD n
            ILOAD n
            IADD
            IRETURN
        }
        function __main__() { $putc(twice('0') - 32); return 0; }", b"");
    // 2 * 48 - 32 = 64.
    assert_eq!(out, "@");
}

#[test]
fn large_literals_go_through_the_pool() {
    let (out, _) = run_ij("
        function __main__() {
            var big = 1000;
            $putc(big - 936);
            return 0;
        }", b"");
    assert_eq!(out, "@");
}

#[test]
fn hand_written_jas_runs() {
    let image = compile_jas("
.main
.var
    i
.end-var
    BIPUSH 3
    ISTORE i
loop:
    BIPUSH 42
    OUT
    IINC i -1
    ILOAD i
    IFEQ done
    GOTO loop
done:
    HALT
.end-main
");
    let (out, status) = run_image(&image, b"");
    assert_eq!(out, "***");
    assert_eq!(status, 0);
}

#[test]
fn disassembled_image_reassembles_to_the_same_behaviour() {
    let source = "
        function f(n) {
            if (n<=1) return 1;
            return 3*f(n-1);
        }
        function __main__() {
            var i;
            for (i = 0; i < 3; i += 1) { $putc('a'+i); }
            $putc('0' + (f(4) - 20));
            return 0;
        }";
    let image = compile_ij(source);
    let (expected, _) = run_image(&image, b"");

    let mut buffer = Buffer::new();
    buffer.append_bytes(&image);
    let mut a = IjvmAssembler::new();
    ijvm::compile(&buffer, &mut a).expect("disassembly failed");
    let mut image2 = Vec::new();
    a.compile(&mut image2).unwrap();

    let (actual, status) = run_image(&image2, b"");
    assert_eq!(actual, expected);
    assert_eq!(status, 0);
}

#[test]
fn jas_listing_assembles_to_the_same_behaviour() {
    let source = r#"
        function f(a, b) { return a + b; }
        function __main__() {
            $putc(f('A', 1));
            $puts("!");
            return 0;
        }"#;
    let (expected, _) = run_image(&compile_ij(source), b"");

    let listing = compile_ij_to_jas(source);
    let (actual, status) = run_image(&compile_jas(&listing), b"");
    assert_eq!(actual, expected);
    assert_eq!(status, 0);
    assert_eq!(actual, "B!\n");
}

#[test]
fn imports_inline_other_files() {
    let dir = std::env::temp_dir().join("ijit_import_test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("lib.ij"),
        "function greet() jas { BIPUSH 'o' OUT BIPUSH 'k' OUT BIPUSH 0 IRETURN }")
        .unwrap();
    std::fs::write(dir.join("prog.ij"), r#"
        import "lib.ij"
        function __main__() { greet(); return 0; }
    "#).unwrap();

    let mut l = Lexer::new();
    l.add_source(&dir.join("prog.ij").to_string_lossy()).unwrap();
    let mut a = IjvmAssembler::new();
    ij::compile(&mut l, &mut a).expect("compile failed");
    let mut image = Vec::new();
    a.compile(&mut image).unwrap();
    let (out, status) = run_image(&image, b"");
    assert_eq!(out, "ok");
    assert_eq!(status, 0);
}
