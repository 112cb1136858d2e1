//! End-to-end pipeline tests: preprocess, parse and emit small programs,
//! then assert on the shape of the generated assembly.

use nanocc::codegen::codegen;
use nanocc::parse::parse;
use nanocc::preprocess::{Preprocessor, render_tokens};
use nanocc::Options;

fn compile_with(opts: &Options, src: &str) -> String {
  let mut pp = Preprocessor::new(opts);
  let toks = pp.run_text("test.c", src).expect("preprocess");
  let files = pp.input_files().to_vec();
  let mut prog = parse(toks).expect("parse");
  let mut out: Vec<u8> = vec![];
  codegen(&mut prog, opts, &files, &mut out).expect("codegen");
  String::from_utf8(out).expect("utf-8 assembly")
}

fn compile(src: &str) -> String {
  compile_with(&Options::default(), src)
}

#[test]
fn arithmetic_program() {
  let asm = compile("int main() { return 2 + 3 * 4; }");
  assert!(asm.contains("  .globl main"));
  assert!(asm.contains("main:"));
  assert!(asm.contains("  imul "));
  assert!(asm.contains(".L.return.main:"));
  assert!(asm.contains("  ret"));
}

#[test]
fn array_initializer_program() {
  let asm = compile("int main() { int a[3] = {1, 2, 3}; return a[0] + a[1] + a[2]; }");
  assert!(asm.contains("main:"));
  // Element stores go through computed addresses.
  assert!(asm.contains("  lea -"));
}

#[test]
fn preprocessed_macro_program() {
  let opts = Options::default();
  let mut pp = Preprocessor::new(&opts);
  let toks = pp
    .run_text("test.c", "#define ADD(a,b) ((a)+(b))\nint main(){return ADD(2,3);}\n")
    .expect("preprocess");
  assert_eq!(render_tokens(&toks), "int main ( ) { return ( ( 2 ) + ( 3 ) ) ; }\n");

  let mut prog = parse(toks).expect("parse");
  let mut out: Vec<u8> = vec![];
  codegen(&mut prog, &opts, &pp.input_files().to_vec(), &mut out).expect("codegen");
}

#[test]
fn bitfield_read_modify_write() {
  let asm = compile(
    "int main() { struct { int a : 3; int b : 5; } x = {0}; x.a = 7; x.b = 31;\
     return x.a + x.b; }");
  // Stores mask and or into the container word; reads extract by shifting.
  assert!(asm.contains("  or %rdx, %rax"));
  assert!(asm.contains("  shl $"));
}

#[test]
fn global_pointer_initializer_emits_relocation() {
  let asm = compile("int g = 5; int *p = &g; int main() { return *p; }");
  assert!(asm.contains("  .quad g+0"));
  assert!(asm.contains("g:"));
  assert!(asm.contains("p:"));
}

#[test]
fn for_loop_program() {
  let asm = compile("int main() { int s = 0; for (int i = 0; i < 10; i++) s += i; return s; }");
  assert!(asm.contains(".L.begin."));
  assert!(asm.contains(".L.continue."));
  assert!(asm.contains(".L.break."));
}

#[test]
fn empty_translation_unit() {
  let asm = compile("");
  assert!(asm.contains("  .text"));
  assert!(asm.contains("  .data"));
  assert!(asm.contains("  .bss"));
  assert!(!asm.contains("  .globl"));
}

#[test]
fn bss_and_data_split() {
  let asm = compile("int zeroed; int filled = 7;");
  let bss = asm.find("  .bss").expect(".bss section");
  let data = asm.find("  .data").expect(".data section");
  let zeroed = asm.find("zeroed:").expect("zeroed symbol");
  let filled = asm.find("filled:").expect("filled symbol");
  assert!(bss < zeroed && zeroed < data);
  assert!(data < filled);
  assert!(asm.contains("  .zero 4"));
}

#[test]
fn static_symbols_are_not_global() {
  let asm = compile("static int hidden = 1; int shown = 2; static int f() { return 0; }\
                     int main() { return f(); }");
  assert!(!asm.contains(".globl hidden"));
  assert!(asm.contains(".globl shown"));
  assert!(!asm.contains(".globl f\n"));
  assert!(asm.contains(".globl main"));
}

#[test]
fn string_literals_are_anonymous_globals() {
  let asm = compile("int main() { char *s = \"hi\"; return 0; }");
  assert!(asm.contains(".L.data."));
  // "hi" plus the terminator.
  assert!(asm.contains("  .byte 104"));
  assert!(asm.contains("  .byte 105"));
  assert!(asm.contains("  .byte 0"));
}

#[test]
fn pic_and_no_pic_addressing() {
  let pic = compile("int g; int main() { return g; }");
  assert!(pic.contains("g@GOTPCREL(%rip)"));

  let opts = Options { include_paths: vec![], pic: false };
  let nopic = compile_with(&opts, "int g; int main() { return g; }");
  assert!(nopic.contains("  mov $g, "));
  assert!(!nopic.contains("@GOTPCREL"));
}

#[test]
fn calls_use_the_sysv_registers() {
  let asm = compile(
    "int add3(int a, int b, int c) { return a + b + c; }\
     int main() { return add3(1, 2, 3); }");
  // Parameters land in edi/esi/edx, and the call saves the live bank.
  assert!(asm.contains("  mov %edi, -"));
  assert!(asm.contains("  mov %esi, -"));
  assert!(asm.contains("  mov %edx, -"));
  assert!(asm.contains("call add3"));
  assert!(asm.contains("  mov %r10, (%rsp)"));
}

#[test]
fn implicit_declaration_calls_through_plt_under_pic() {
  let asm = compile("int main() { foo(); return 0; }");
  assert!(asm.contains("  call foo@PLT"));
}

#[test]
fn float_arithmetic_and_return() {
  let asm = compile("double f(double x) { return x + 1.5; }");
  assert!(asm.contains("  addsd "));
  assert!(asm.contains("  movsd %xmm0, -"));
  assert!(asm.contains("  movsd %xmm8, %xmm0"));
}

#[test]
fn float_args_count_in_rax() {
  let asm = compile(
    "int printf();\
     int main() { printf(\"%f\", 1.0); return 0; }");
  assert!(asm.contains("  mov $1, %rax"));
  assert!(asm.contains("  movsd -"));
}

#[test]
fn variadic_function_spills_register_save_area() {
  let asm = compile(
    "long f(long n, ...) { long ap[4]; __builtin_va_start(ap); return n; }");
  // All six GP argument registers land in the save area.
  assert!(asm.contains("  mov %rdi, -208(%rbp)"));
  assert!(asm.contains("  mov %r9, -168(%rbp)"));
  assert!(asm.contains("  movsd %xmm0, -160(%rbp)"));
  // One named GP parameter: gp_offset starts at 8.
  assert!(asm.contains("  movl $8, (%rax)"));
}

#[test]
fn switch_emits_compare_chain() {
  let asm = compile(
    "int main(int argc, char **argv) {\
       switch (argc) { case 1: return 10; case 2: return 20; default: return 30; } }");
  assert!(asm.contains("  cmp $1, "));
  assert!(asm.contains("  cmp $2, "));
  assert!(asm.matches(".L.case.").count() >= 6);
}

#[test]
fn goto_and_labels_are_function_scoped() {
  let asm = compile("int main() { goto out; out: return 0; }");
  assert!(asm.contains("  jmp .L.label.main.out"));
  assert!(asm.contains(".L.label.main.out:"));
}

#[test]
fn loc_directives_reference_registered_files() {
  let asm = compile("int main() {\nreturn 0;\n}");
  assert!(asm.contains("  .file 1 \"test.c\""));
  assert!(asm.contains("  .loc 1 2"));
}

#[test]
fn stray_break_is_rejected() {
  let opts = Options::default();
  let mut pp = Preprocessor::new(&opts);
  let toks = pp.run_text("test.c", "int main() { break; return 0; }").expect("preprocess");
  let mut prog = parse(toks).expect("parse");
  let mut out: Vec<u8> = vec![];
  assert!(codegen(&mut prog, &opts, &pp.input_files().to_vec(), &mut out).is_err());
}

#[test]
fn const_assignment_is_rejected_in_codegen() {
  let opts = Options::default();
  let mut pp = Preprocessor::new(&opts);
  let toks = pp
    .run_text("test.c", "int main() { const int x = 1; x = 2; return x; }")
    .expect("preprocess");
  let mut prog = parse(toks).expect("parse");
  let mut out: Vec<u8> = vec![];
  assert!(codegen(&mut prog, &opts, &pp.input_files().to_vec(), &mut out).is_err());
}

#[test]
fn statement_expressions_yield_values() {
  let asm = compile("int main() { return ({ int x = 3; x + 1; }); }");
  assert!(asm.contains("main:"));
}

#[test]
fn function_pointers_call_indirect() {
  let asm = compile(
    "int id(int x) { return x; }\
     int main() { int (*fp)(int) = id; return fp(7); }");
  assert!(asm.contains("  call *%r1"));
}

#[test]
fn do_while_loops_back() {
  let asm = compile("int main() { int i = 0; do { i++; } while (i < 5); return i; }");
  assert!(asm.contains("  jne .L.begin."));
}

#[test]
fn sizeof_is_a_compile_time_constant() {
  let asm = compile("int main() { return sizeof(long) + sizeof(int[3]); }");
  // 8 + 12 folds into literal operands, not a runtime sizeof.
  assert!(asm.contains("movabs $8, ") || asm.contains("mov $8, "));
  assert!(asm.contains("movabs $12, ") || asm.contains("mov $12, "));
}
