//! The assembly emitter: walks the typed AST and prints GNU-assembler text
//! for x86-64 (System V ABI).
//!
//! Expressions are evaluated against a fixed bank of six integer registers
//! (r10–r15) and six SSE registers (xmm8–xmm13) used as a pure stack
//! indexed by `top`: emitting an expression leaves its value in
//! `reg[top-1]` (or `freg[top-1]` for a floating value) and increments
//! `top`; emitting a statement leaves `top` where it found it. The emitter
//! asserts `top == 0` at every function boundary.

use std::io::Write;
use std::rc::Rc;

use arrayvec::ArrayVec;

use crate::tokenize::{SourceFile, Token};
use crate::types::ast::{BinOp, Function, Node, NodeKind, Program, VarId};
use crate::types::ty::{Member, Ty, TyKind};
use crate::types::align_to;
use crate::{Error, Options, Result};

const REG64: [&str; 6] = ["%r10", "%r11", "%r12", "%r13", "%r14", "%r15"];
const REG32: [&str; 6] = ["%r10d", "%r11d", "%r12d", "%r13d", "%r14d", "%r15d"];
const REG16: [&str; 6] = ["%r10w", "%r11w", "%r12w", "%r13w", "%r14w", "%r15w"];
const REG8: [&str; 6] = ["%r10b", "%r11b", "%r12b", "%r13b", "%r14b", "%r15b"];
const FREG: [&str; 6] = ["%xmm8", "%xmm9", "%xmm10", "%xmm11", "%xmm12", "%xmm13"];

const ARGREG8: [&str; 6] = ["%dil", "%sil", "%dl", "%cl", "%r8b", "%r9b"];
const ARGREG16: [&str; 6] = ["%di", "%si", "%dx", "%cx", "%r8w", "%r9w"];
const ARGREG32: [&str; 6] = ["%edi", "%esi", "%edx", "%ecx", "%r8d", "%r9d"];
const ARGREG64: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Bytes reserved at the frame bottom for the callee-saved registers the
/// prologue spills (r12–r15).
const CALLEE_SAVE: i64 = 32;
/// Size of the variadic register save area (6 GP slots + 8 XMM slots).
const VA_AREA: i64 = 176;

/// Emit assembly for a parsed program. The layout pass assigns every
/// local's frame offset and each function's stack size first.
pub fn codegen(
  prog: &mut Program, opts: &Options, files: &[Rc<SourceFile>], out: &mut impl Write,
) -> Result<()> {
  assign_lvar_offsets(prog);
  let mut cg = Codegen {
    prog: &*prog, opts, out,
    top: 0, brknum: 0, contnum: 0, count: 0,
    current_fn: None,
  };
  cg.run(files)
}

/// Locals are packed below the callee-save area (and, in a variadic
/// function, below the register save area), aligned individually; the
/// frame is rounded to 16 bytes.
fn assign_lvar_offsets(prog: &mut Program) {
  for f in &mut prog.fns {
    let mut offset = if f.is_variadic { CALLEE_SAVE + VA_AREA } else { CALLEE_SAVE };
    for &v in &f.locals {
      let size = prog.types.size(prog.vars[v].ty).max(1);
      let align = prog.vars[v].align.max(1);
      offset = align_to(offset, align);
      offset += size;
      prog.vars[v].offset = offset;
    }
    f.stack_size = align_to(offset, 16);
  }
}

struct Codegen<'a, W> {
  prog: &'a Program,
  opts: &'a Options,
  out: &'a mut W,
  /// Evaluation stack depth; see the module docs.
  top: usize,
  /// Label ids of the innermost `break`/`continue` targets (0 = none).
  brknum: u32,
  contnum: u32,
  count: u32,
  current_fn: Option<&'a Function>,
}

impl<'a, W: Write> Codegen<'a, W> {
  fn count(&mut self) -> u32 {
    self.count += 1;
    self.count
  }

  fn reg(&self, idx: usize) -> Result<&'static str> {
    REG64.get(idx).copied().ok_or_else(|| Error::msg(format!("register out of range: {idx}")))
  }

  fn reg_sized(&self, idx: usize, size: i64) -> Result<&'static str> {
    let table = match size {
      1 => &REG8,
      2 => &REG16,
      4 => &REG32,
      _ => &REG64,
    };
    table.get(idx).copied().ok_or_else(|| Error::msg(format!("register out of range: {idx}")))
  }

  /// The register name sized for a value of type `ty`: 64-bit for
  /// pointers and 8-byte scalars, 32-bit otherwise.
  fn xreg(&self, ty: Ty, idx: usize) -> Result<&'static str> {
    let t = &self.prog.types;
    if t.base(ty).is_some() || t.size(ty) == 8 {
      self.reg(idx)
    } else {
      self.reg_sized(idx, 4)
    }
  }

  fn freg(&self, idx: usize) -> Result<&'static str> {
    FREG.get(idx).copied().ok_or_else(|| Error::msg(format!("register out of range: {idx}")))
  }

  fn loc(&mut self, tok: &Token) -> Result<()> {
    writeln!(self.out, "  .loc {} {}", tok.file.file_no, tok.line_no)?;
    Ok(())
  }

  fn fn_name(&self) -> &'static str {
    self.current_fn.expect("emitting outside a function").name.as_str()
  }

  // ---------------------------------------------------------------------
  // Addresses, loads, stores

  /// Compute the address of an lvalue into `reg[top++]`.
  fn gen_addr(&mut self, node: &Node) -> Result<()> {
    match &node.kind {
      NodeKind::Var(v) => {
        let var = &self.prog.vars[*v];
        let r = self.reg(self.top)?;
        self.top += 1;
        if var.is_local {
          writeln!(self.out, "  lea -{}(%rbp), {}", var.offset, r)?;
        } else if self.opts.pic {
          writeln!(self.out, "  mov {}@GOTPCREL(%rip), {}", var.name, r)?;
        } else {
          writeln!(self.out, "  mov ${}, {}", var.name, r)?;
        }
        Ok(())
      }
      NodeKind::Deref(lhs) => self.gen_expr(lhs),
      NodeKind::Comma { lhs, rhs } => {
        self.gen_expr(lhs)?;
        self.top -= 1;
        self.gen_addr(rhs)
      }
      NodeKind::Member { base, member } => {
        self.gen_addr(base)?;
        writeln!(self.out, "  add ${}, {}", member.offset, self.reg(self.top - 1)?)?;
        Ok(())
      }
      _ => Err(node.tok.error("not an lvalue")),
    }
  }

  /// Load a value of type `ty` from the address in `reg[top-1]`.
  ///
  /// Arrays, structs and functions are not loaded: the result of
  /// evaluating them is their address. This is where C's array-to-pointer
  /// decay happens. char/short/int loads extend into the full 32-bit
  /// register, so the low half always holds a valid value.
  fn load(&mut self, ty: Ty) -> Result<()> {
    let t = &self.prog.types;
    match t[ty].kind {
      TyKind::Array { .. } | TyKind::Struct { .. } | TyKind::Func { .. } => return Ok(()),
      TyKind::Float => {
        let rs = self.reg(self.top - 1)?;
        writeln!(self.out, "  movss ({}), {}", rs, self.freg(self.top - 1)?)?;
        return Ok(())
      }
      TyKind::Double => {
        let rs = self.reg(self.top - 1)?;
        writeln!(self.out, "  movsd ({}), {}", rs, self.freg(self.top - 1)?)?;
        return Ok(())
      }
      _ => {}
    }

    let rs = self.reg(self.top - 1)?;
    let rd = self.xreg(ty, self.top - 1)?;
    let insn = if t.is_unsigned(ty) { "movz" } else { "movs" };
    match t.size(ty) {
      1 => writeln!(self.out, "  {}bl ({}), {}", insn, rs, rd)?,
      2 => writeln!(self.out, "  {}wl ({}), {}", insn, rs, rd)?,
      _ => writeln!(self.out, "  mov ({}), {}", rs, rd)?,
    }
    Ok(())
  }

  /// Store the value in slot `top-2` through the address in `reg[top-1]`,
  /// leaving the value as the expression result.
  fn store(&mut self, ty: Ty) -> Result<()> {
    let t = &self.prog.types;
    let rd = self.reg(self.top - 1)?;
    let size = t.size(ty);

    match t[ty].kind {
      TyKind::Struct { .. } => {
        let rs = self.reg(self.top - 2)?;
        for i in 0..size {
          writeln!(self.out, "  mov {}({}), %al", i, rs)?;
          writeln!(self.out, "  mov %al, {}({})", i, rd)?;
        }
      }
      TyKind::Float => writeln!(self.out, "  movss {}, ({})", self.freg(self.top - 2)?, rd)?,
      TyKind::Double => writeln!(self.out, "  movsd {}, ({})", self.freg(self.top - 2)?, rd)?,
      _ => {
        let rs = self.reg_sized(self.top - 2, size)?;
        writeln!(self.out, "  mov {}, ({})", rs, rd)?;
      }
    }
    self.top -= 1;
    Ok(())
  }

  /// Compare the value at the stack top against zero and pop it.
  fn cmp_zero(&mut self, ty: Ty) -> Result<()> {
    self.top -= 1;
    match self.prog.types[ty].kind {
      TyKind::Float => {
        writeln!(self.out, "  xorps %xmm0, %xmm0")?;
        writeln!(self.out, "  ucomiss %xmm0, {}", self.freg(self.top)?)?;
      }
      TyKind::Double => {
        writeln!(self.out, "  xorpd %xmm0, %xmm0")?;
        writeln!(self.out, "  ucomisd %xmm0, {}", self.freg(self.top)?)?;
      }
      _ => writeln!(self.out, "  cmp $0, {}", self.reg(self.top)?)?,
    }
    Ok(())
  }

  /// Emit the conversion from `from` to `to` on the value at `top-1`.
  fn cast(&mut self, from: Ty, to: Ty) -> Result<()> {
    let t = &self.prog.types;
    if t.is_void(to) {
      return Ok(())
    }

    let r = self.reg(self.top - 1)?;
    let fr = self.freg(self.top - 1)?;

    if matches!(t[to].kind, TyKind::Bool) {
      self.cmp_zero(from)?;
      writeln!(self.out, "  setne {}", self.reg_sized(self.top, 1)?)?;
      writeln!(self.out, "  movzx {}, {}", self.reg_sized(self.top, 1)?,
        self.reg_sized(self.top, 4)?)?;
      self.top += 1;
      return Ok(())
    }

    if matches!(t[from].kind, TyKind::Float) {
      match t[to].kind {
        TyKind::Float => {}
        TyKind::Double => writeln!(self.out, "  cvtss2sd {}, {}", fr, fr)?,
        _ => writeln!(self.out, "  cvttss2si {}, {}", fr, r)?,
      }
      return Ok(())
    }
    if matches!(t[from].kind, TyKind::Double) {
      match t[to].kind {
        TyKind::Double => {}
        TyKind::Float => writeln!(self.out, "  cvtsd2ss {}, {}", fr, fr)?,
        _ => writeln!(self.out, "  cvttsd2si {}, {}", fr, r)?,
      }
      return Ok(())
    }

    if matches!(t[to].kind, TyKind::Float) {
      writeln!(self.out, "  cvtsi2ss {}, {}", r, fr)?;
      return Ok(())
    }
    if matches!(t[to].kind, TyKind::Double) {
      writeln!(self.out, "  cvtsi2sd {}, {}", r, fr)?;
      return Ok(())
    }

    let insn = if t.is_unsigned(to) { "movzx" } else { "movsx" };
    match t.size(to) {
      1 => writeln!(self.out, "  {} {}, {}", insn, self.reg_sized(self.top - 1, 1)?, r)?,
      2 => writeln!(self.out, "  {} {}, {}", insn, self.reg_sized(self.top - 1, 2)?, r)?,
      4 => writeln!(self.out, "  mov {}, {}",
        self.reg_sized(self.top - 1, 4)?, self.reg_sized(self.top - 1, 4)?)?,
      _ => {
        if t.is_integer(from) && t.size(from) < 8 && !t.is_unsigned(from) {
          writeln!(self.out, "  movsx {}, {}", self.reg_sized(self.top - 1, 4)?, r)?;
        }
      }
    }
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Expressions

  fn gen_expr(&mut self, node: &Node) -> Result<()> {
    self.loc(&node.tok)?;
    let t = &self.prog.types;

    match &node.kind {
      NodeKind::Num(val) => {
        let ty = node.ty();
        if t.size(ty) == 8 || t.base(ty).is_some() {
          writeln!(self.out, "  movabs ${}, {}", val, self.reg(self.top)?)?;
        } else {
          writeln!(self.out, "  mov ${}, {}", *val as i32, self.reg_sized(self.top, 4)?)?;
        }
        self.top += 1;
        Ok(())
      }
      NodeKind::Float(val) => {
        if matches!(t[node.ty()].kind, TyKind::Float) {
          let bits = (*val as f32).to_bits();
          writeln!(self.out, "  mov ${}, %eax", bits)?;
          writeln!(self.out, "  movd %eax, {}", self.freg(self.top)?)?;
        } else {
          writeln!(self.out, "  movabs ${}, %rax", val.to_bits())?;
          writeln!(self.out, "  movq %rax, {}", self.freg(self.top)?)?;
        }
        self.top += 1;
        Ok(())
      }
      NodeKind::Var(_) => {
        self.gen_addr(node)?;
        self.load(node.ty())
      }
      NodeKind::Member { member, .. } => {
        let member = member.clone();
        self.gen_addr(node)?;
        self.load(node.ty())?;
        if member.is_bitfield {
          self.extract_bitfield(&member)?;
        }
        Ok(())
      }
      NodeKind::Deref(lhs) => {
        self.gen_expr(lhs)?;
        self.load(node.ty())
      }
      NodeKind::Addr(lhs) => self.gen_addr(lhs),
      NodeKind::Assign { lhs, rhs, is_init } => {
        if self.prog.types.is_array(node.ty()) {
          return Err(node.tok.error("not an lvalue"))
        }
        if self.prog.types[lhs.ty()].is_const && !is_init {
          return Err(node.tok.error("cannot assign to a const variable"))
        }

        self.gen_expr(rhs)?;
        self.gen_addr(lhs)?;
        if let NodeKind::Member { member, .. } = &lhs.kind {
          if member.is_bitfield {
            return self.store_bitfield(&member.clone())
          }
        }
        self.store(node.ty())
      }
      NodeKind::StmtExpr(body) => {
        for stmt in body {
          self.gen_stmt(stmt)?;
        }
        // The value of the trailing expression statement is left in the
        // slot its ExprStmt vacated.
        self.top += 1;
        Ok(())
      }
      NodeKind::NullExpr => {
        self.top += 1;
        Ok(())
      }
      NodeKind::Comma { lhs, rhs } => {
        self.gen_expr(lhs)?;
        self.top -= 1;
        self.gen_expr(rhs)
      }
      NodeKind::Cast(lhs) => {
        self.gen_expr(lhs)?;
        self.cast(lhs.ty(), node.ty())
      }
      NodeKind::Cond { cond, then, els } => {
        let c = self.count();
        self.gen_expr(cond)?;
        self.cmp_zero(cond.ty())?;
        writeln!(self.out, "  je .L.else.{}", c)?;
        self.gen_expr(then)?;
        self.top -= 1;
        writeln!(self.out, "  jmp .L.end.{}", c)?;
        writeln!(self.out, ".L.else.{}:", c)?;
        self.gen_expr(els)?;
        writeln!(self.out, ".L.end.{}:", c)?;
        Ok(())
      }
      NodeKind::Not(lhs) => {
        self.gen_expr(lhs)?;
        self.cmp_zero(lhs.ty())?;
        writeln!(self.out, "  sete {}", self.reg_sized(self.top, 1)?)?;
        writeln!(self.out, "  movzx {}, {}", self.reg_sized(self.top, 1)?,
          self.reg_sized(self.top, 4)?)?;
        self.top += 1;
        Ok(())
      }
      NodeKind::BitNot(lhs) => {
        self.gen_expr(lhs)?;
        writeln!(self.out, "  not {}", self.reg(self.top - 1)?)?;
        Ok(())
      }
      NodeKind::LogAnd { lhs, rhs } => {
        let c = self.count();
        self.gen_expr(lhs)?;
        self.cmp_zero(lhs.ty())?;
        writeln!(self.out, "  je .L.false.{}", c)?;
        self.gen_expr(rhs)?;
        self.cmp_zero(rhs.ty())?;
        writeln!(self.out, "  je .L.false.{}", c)?;
        writeln!(self.out, "  mov $1, {}", self.reg(self.top)?)?;
        writeln!(self.out, "  jmp .L.end.{}", c)?;
        writeln!(self.out, ".L.false.{}:", c)?;
        writeln!(self.out, "  mov $0, {}", self.reg(self.top)?)?;
        self.top += 1;
        writeln!(self.out, ".L.end.{}:", c)?;
        Ok(())
      }
      NodeKind::LogOr { lhs, rhs } => {
        let c = self.count();
        self.gen_expr(lhs)?;
        self.cmp_zero(lhs.ty())?;
        writeln!(self.out, "  jne .L.true.{}", c)?;
        self.gen_expr(rhs)?;
        self.cmp_zero(rhs.ty())?;
        writeln!(self.out, "  jne .L.true.{}", c)?;
        writeln!(self.out, "  mov $0, {}", self.reg(self.top)?)?;
        writeln!(self.out, "  jmp .L.end.{}", c)?;
        writeln!(self.out, ".L.true.{}:", c)?;
        writeln!(self.out, "  mov $1, {}", self.reg(self.top)?)?;
        self.top += 1;
        writeln!(self.out, ".L.end.{}:", c)?;
        Ok(())
      }
      NodeKind::Funcall { func, args, .. } => self.gen_funcall(node, func, args),
      NodeKind::Binary { op, lhs, rhs } => {
        self.gen_expr(lhs)?;
        self.gen_expr(rhs)?;
        if self.prog.types.is_flonum(lhs.ty()) {
          self.gen_float_binary(*op, lhs.ty(), &node.tok)
        } else {
          self.gen_int_binary(*op, node, lhs)
        }
      }
      _ => Err(node.tok.error("invalid expression")),
    }
  }

  /// Sign- or zero-extend the bit range of a just-loaded bitfield: shift
  /// the field to the top of the 64-bit register, then arithmetic- or
  /// logical-shift it back down.
  fn extract_bitfield(&mut self, member: &Member) -> Result<()> {
    let r = self.reg(self.top - 1)?;
    writeln!(self.out, "  shl ${}, {}", 64 - member.bit_width - member.bit_offset, r)?;
    let insn = if self.prog.types.is_unsigned(member.ty) { "shr" } else { "sar" };
    writeln!(self.out, "  {} ${}, {}", insn, 64 - member.bit_width, r)?;
    Ok(())
  }

  /// Read-modify-write a bitfield store: the container word is loaded,
  /// the target bits masked out, the new value masked and shifted in, and
  /// the word written back. Value in slot `top-2`, address in `top-1`.
  fn store_bitfield(&mut self, member: &Member) -> Result<()> {
    let rs = self.reg(self.top - 2)?;
    let rd = self.reg(self.top - 1)?;
    let size = self.prog.types.size(member.ty);
    let mask: u64 = if member.bit_width >= 64 { u64::MAX } else { (1 << member.bit_width) - 1 };
    let clear: u64 = !(mask << member.bit_offset);

    match size {
      1 => writeln!(self.out, "  movzbl ({}), %eax", rd)?,
      2 => writeln!(self.out, "  movzwl ({}), %eax", rd)?,
      4 => writeln!(self.out, "  mov ({}), %eax", rd)?,
      _ => writeln!(self.out, "  mov ({}), %rax", rd)?,
    }
    writeln!(self.out, "  movabs ${}, %rcx", clear)?;
    writeln!(self.out, "  and %rcx, %rax")?;
    writeln!(self.out, "  mov {}, %rdx", rs)?;
    writeln!(self.out, "  movabs ${}, %rcx", mask)?;
    writeln!(self.out, "  and %rcx, %rdx")?;
    writeln!(self.out, "  shl ${}, %rdx", member.bit_offset)?;
    writeln!(self.out, "  or %rdx, %rax")?;
    match size {
      1 => writeln!(self.out, "  mov %al, ({})", rd)?,
      2 => writeln!(self.out, "  mov %ax, ({})", rd)?,
      4 => writeln!(self.out, "  mov %eax, ({})", rd)?,
      _ => writeln!(self.out, "  mov %rax, ({})", rd)?,
    }
    self.top -= 1;
    Ok(())
  }

  fn gen_int_binary(&mut self, op: BinOp, node: &Node, lhs: &Node) -> Result<()> {
    let rd = self.xreg(lhs.ty(), self.top - 2)?;
    let rs = self.xreg(lhs.ty(), self.top - 1)?;
    self.top -= 1;
    let unsigned = self.prog.types.is_unsigned(lhs.ty());

    match op {
      BinOp::Add => writeln!(self.out, "  add {}, {}", rs, rd)?,
      BinOp::Sub => writeln!(self.out, "  sub {}, {}", rs, rd)?,
      BinOp::Mul => writeln!(self.out, "  imul {}, {}", rs, rd)?,
      BinOp::Div => self.divmod(node, rs, rd, "%rax", "%eax")?,
      BinOp::Mod => self.divmod(node, rs, rd, "%rdx", "%edx")?,
      BinOp::BitAnd => writeln!(self.out, "  and {}, {}", rs, rd)?,
      BinOp::BitOr => writeln!(self.out, "  or {}, {}", rs, rd)?,
      BinOp::BitXor => writeln!(self.out, "  xor {}, {}", rs, rd)?,
      BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le => {
        writeln!(self.out, "  cmp {}, {}", rs, rd)?;
        let set = match op {
          BinOp::Eq => "sete",
          BinOp::Ne => "setne",
          BinOp::Lt => if unsigned { "setb" } else { "setl" },
          _ => if unsigned { "setbe" } else { "setle" },
        };
        writeln!(self.out, "  {} %al", set)?;
        writeln!(self.out, "  movzb %al, {}", rd)?;
      }
      BinOp::Shl => {
        writeln!(self.out, "  mov {}, %rcx", self.reg(self.top)?)?;
        writeln!(self.out, "  shl %cl, {}", rd)?;
      }
      BinOp::Shr => {
        writeln!(self.out, "  mov {}, %rcx", self.reg(self.top)?)?;
        let insn = if unsigned { "shr" } else { "sar" };
        writeln!(self.out, "  {} %cl, {}", insn, rd)?;
      }
    }
    Ok(())
  }

  fn gen_float_binary(&mut self, op: BinOp, lhs_ty: Ty, tok: &Token) -> Result<()> {
    let sd = matches!(self.prog.types[lhs_ty].kind, TyKind::Double);
    let sfx = if sd { "sd" } else { "ss" };
    let rd = self.freg(self.top - 2)?;
    let rs = self.freg(self.top - 1)?;
    self.top -= 1;

    match op {
      BinOp::Add => writeln!(self.out, "  add{} {}, {}", sfx, rs, rd)?,
      BinOp::Sub => writeln!(self.out, "  sub{} {}, {}", sfx, rs, rd)?,
      BinOp::Mul => writeln!(self.out, "  mul{} {}, {}", sfx, rs, rd)?,
      BinOp::Div => writeln!(self.out, "  div{} {}, {}", sfx, rs, rd)?,
      BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le => {
        writeln!(self.out, "  ucomi{} {}, {}", sfx, rs, rd)?;
        let set = match op {
          BinOp::Eq => "sete",
          BinOp::Ne => "setne",
          BinOp::Lt => "setb",
          _ => "setbe",
        };
        writeln!(self.out, "  {} %al", set)?;
        writeln!(self.out, "  movzb %al, {}", self.reg_sized(self.top - 1, 4)?)?;
      }
      _ => return Err(tok.error("invalid expression")),
    }
    Ok(())
  }

  fn divmod(&mut self, node: &Node, rs: &str, rd: &str, r64: &str, r32: &str) -> Result<()> {
    let t = &self.prog.types;
    if t.size(node.ty()) == 8 {
      writeln!(self.out, "  mov {}, %rax", rd)?;
      if t.is_unsigned(node.ty()) {
        writeln!(self.out, "  mov $0, %rdx")?;
        writeln!(self.out, "  div {}", rs)?;
      } else {
        writeln!(self.out, "  cqo")?;
        writeln!(self.out, "  idiv {}", rs)?;
      }
      writeln!(self.out, "  mov {}, {}", r64, rd)?;
    } else {
      writeln!(self.out, "  mov {}, %eax", rd)?;
      if t.is_unsigned(node.ty()) {
        writeln!(self.out, "  mov $0, %edx")?;
        writeln!(self.out, "  div {}", rs)?;
      } else {
        writeln!(self.out, "  cdq")?;
        writeln!(self.out, "  idiv {}", rs)?;
      }
      writeln!(self.out, "  mov {}, {}", r32, rd)?;
    }
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Calls

  fn gen_funcall(&mut self, node: &Node, func: &Node, args: &[VarId]) -> Result<()> {
    // The variadic bootstrap primitive writes a va_list in place.
    if let NodeKind::Var(v) = &func.kind {
      if self.prog.vars[*v].name.as_str() == "__builtin_va_start" {
        return self.gen_va_start(args)
      }
    }

    let t = &self.prog.types;

    // Direct calls go by symbol; anything else is evaluated to an address
    // first.
    let direct: Option<&str> = match &func.kind {
      NodeKind::Var(v) if t.is_func(self.prog.vars[*v].ty) =>
        Some(self.prog.vars[*v].name.as_str()),
      _ => None,
    };
    if direct.is_none() {
      self.gen_expr(func)?;
    }

    // Classify arguments: six integer registers, eight SSE registers, the
    // rest on the stack right to left.
    let mut gp: ArrayVec<VarId, 6> = ArrayVec::new();
    let mut fp: ArrayVec<VarId, 8> = ArrayVec::new();
    let mut stack: Vec<VarId> = vec![];
    for &arg in args {
      let ty = self.prog.vars[arg].ty;
      if self.prog.types.is_flonum(ty) {
        if fp.try_push(arg).is_err() { stack.push(arg) }
      } else if gp.try_push(arg).is_err() {
        stack.push(arg)
      }
    }

    // Save the caller-saved part of the register bank around the call.
    writeln!(self.out, "  sub $64, %rsp")?;
    writeln!(self.out, "  mov %r10, (%rsp)")?;
    writeln!(self.out, "  mov %r11, 8(%rsp)")?;
    for (i, f) in FREG.iter().enumerate() {
      writeln!(self.out, "  movsd {}, {}(%rsp)", f, 16 + 8 * i)?;
    }

    // Push stack arguments right to left, padded to keep the stack
    // 16-byte aligned at the call.
    let pad = stack.len() % 2 == 1;
    if pad {
      writeln!(self.out, "  sub $8, %rsp")?;
    }
    for &arg in stack.iter().rev() {
      let var = &self.prog.vars[arg];
      if self.prog.types.size(var.ty) <= 4 && !self.prog.types.is_flonum(var.ty) {
        writeln!(self.out, "  movslq -{}(%rbp), %rax", var.offset)?;
      } else {
        writeln!(self.out, "  mov -{}(%rbp), %rax", var.offset)?;
      }
      writeln!(self.out, "  push %rax")?;
    }

    // Load register arguments from their temporaries.
    for (i, &arg) in gp.iter().enumerate() {
      let var = &self.prog.vars[arg];
      let insn = if self.prog.types.is_unsigned(var.ty) { "movz" } else { "movs" };
      match self.prog.types.size(var.ty) {
        1 => writeln!(self.out, "  {}bl -{}(%rbp), {}", insn, var.offset, ARGREG32[i])?,
        2 => writeln!(self.out, "  {}wl -{}(%rbp), {}", insn, var.offset, ARGREG32[i])?,
        4 => writeln!(self.out, "  mov -{}(%rbp), {}", var.offset, ARGREG32[i])?,
        _ => writeln!(self.out, "  mov -{}(%rbp), {}", var.offset, ARGREG64[i])?,
      }
    }
    for (i, &arg) in fp.iter().enumerate() {
      let var = &self.prog.vars[arg];
      let insn = if self.prog.types.size(var.ty) == 4 { "movss" } else { "movsd" };
      writeln!(self.out, "  {} -{}(%rbp), %xmm{}", insn, var.offset, i)?;
    }

    // The ABI passes the number of vector registers used in %rax for
    // variadic callees.
    writeln!(self.out, "  mov ${}, %rax", fp.len())?;

    match direct {
      Some(name) if self.opts.pic => writeln!(self.out, "  call {}@PLT", name)?,
      Some(name) => writeln!(self.out, "  call {}", name)?,
      None => writeln!(self.out, "  call *{}", self.reg(self.top - 1)?)?,
    }

    let popped = 8 * stack.len() + if pad { 8 } else { 0 };
    if popped > 0 {
      writeln!(self.out, "  add ${}, %rsp", popped)?;
    }

    // Restore the register bank.
    writeln!(self.out, "  mov (%rsp), %r10")?;
    writeln!(self.out, "  mov 8(%rsp), %r11")?;
    for (i, f) in FREG.iter().enumerate() {
      writeln!(self.out, "  movsd {}(%rsp), {}", 16 + 8 * i, f)?;
    }
    writeln!(self.out, "  add $64, %rsp")?;

    if direct.is_none() {
      self.top -= 1;
    }

    let ret = node.ty();
    // Only the low 8 bits of a _Bool return value are specified; clear
    // the rest.
    if matches!(self.prog.types[ret].kind, TyKind::Bool) {
      writeln!(self.out, "  movzx %al, %eax")?;
    }
    match self.prog.types[ret].kind {
      TyKind::Float => writeln!(self.out, "  movss %xmm0, {}", self.freg(self.top)?)?,
      TyKind::Double => writeln!(self.out, "  movsd %xmm0, {}", self.freg(self.top)?)?,
      _ => writeln!(self.out, "  mov %rax, {}", self.reg(self.top)?)?,
    }
    self.top += 1;
    Ok(())
  }

  /// `__builtin_va_start(ap)` fills in the canonical va_list: gp_offset,
  /// fp_offset, the overflow (stack) argument area, and the register save
  /// area written by the prologue.
  fn gen_va_start(&mut self, args: &[VarId]) -> Result<()> {
    let f = self.current_fn.expect("va_start outside a function");
    let mut gps = 0i64;
    let mut fps = 0i64;
    for &p in &f.params {
      if self.prog.types.is_flonum(self.prog.vars[p].ty) { fps += 1 } else { gps += 1 }
    }
    let ap = &self.prog.vars[args[0]];

    writeln!(self.out, "  mov -{}(%rbp), %rax", ap.offset)?;
    writeln!(self.out, "  movl ${}, (%rax)", 8 * gps.min(6))?;
    writeln!(self.out, "  movl ${}, 4(%rax)", 48 + 16 * fps.min(8))?;
    writeln!(self.out, "  lea 16(%rbp), %rdx")?;
    writeln!(self.out, "  mov %rdx, 8(%rax)")?;
    writeln!(self.out, "  lea -{}(%rbp), %rdx", CALLEE_SAVE + VA_AREA)?;
    writeln!(self.out, "  mov %rdx, 16(%rax)")?;
    self.top += 1;
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Statements

  fn gen_stmt(&mut self, node: &Node) -> Result<()> {
    self.loc(&node.tok)?;
    let entry = self.top;

    match &node.kind {
      NodeKind::If { cond, then, els } => {
        let c = self.count();
        self.gen_expr(cond)?;
        self.cmp_zero(cond.ty())?;
        if let Some(els) = els {
          writeln!(self.out, "  je .L.else.{}", c)?;
          self.gen_stmt(then)?;
          writeln!(self.out, "  jmp .L.end.{}", c)?;
          writeln!(self.out, ".L.else.{}:", c)?;
          self.gen_stmt(els)?;
          writeln!(self.out, ".L.end.{}:", c)?;
        } else {
          writeln!(self.out, "  je .L.end.{}", c)?;
          self.gen_stmt(then)?;
          writeln!(self.out, ".L.end.{}:", c)?;
        }
      }
      NodeKind::For { init, cond, inc, body } => {
        let c = self.count();
        let brk = self.brknum;
        let cont = self.contnum;
        self.brknum = c;
        self.contnum = c;

        if let Some(init) = init {
          self.gen_stmt(init)?;
        }
        writeln!(self.out, ".L.begin.{}:", c)?;
        if let Some(cond) = cond {
          self.gen_expr(cond)?;
          self.cmp_zero(cond.ty())?;
          writeln!(self.out, "  je .L.break.{}", c)?;
        }
        self.gen_stmt(body)?;
        writeln!(self.out, ".L.continue.{}:", c)?;
        if let Some(inc) = inc {
          self.gen_expr(inc)?;
          self.top -= 1;
        }
        writeln!(self.out, "  jmp .L.begin.{}", c)?;
        writeln!(self.out, ".L.break.{}:", c)?;

        self.brknum = brk;
        self.contnum = cont;
      }
      NodeKind::Do { body, cond } => {
        let c = self.count();
        let brk = self.brknum;
        let cont = self.contnum;
        self.brknum = c;
        self.contnum = c;

        writeln!(self.out, ".L.begin.{}:", c)?;
        self.gen_stmt(body)?;
        writeln!(self.out, ".L.continue.{}:", c)?;
        self.gen_expr(cond)?;
        self.cmp_zero(cond.ty())?;
        writeln!(self.out, "  jne .L.begin.{}", c)?;
        writeln!(self.out, ".L.break.{}:", c)?;

        self.brknum = brk;
        self.contnum = cont;
      }
      NodeKind::Switch { cond, body, cases, default } => {
        let c = self.count();
        let brk = self.brknum;
        self.brknum = c;

        self.gen_expr(cond)?;
        let r = self.xreg(cond.ty(), self.top - 1)?;
        for case in cases {
          writeln!(self.out, "  cmp ${}, {}", case.val, r)?;
          writeln!(self.out, "  je .L.case.{}", case.id)?;
        }
        self.top -= 1;

        if let Some(d) = default {
          writeln!(self.out, "  jmp .L.case.{}", d)?;
        }
        writeln!(self.out, "  jmp .L.break.{}", c)?;
        self.gen_stmt(body)?;
        writeln!(self.out, ".L.break.{}:", c)?;

        self.brknum = brk;
      }
      NodeKind::Case { id, body } => {
        writeln!(self.out, ".L.case.{}:", id)?;
        self.gen_stmt(body)?;
      }
      NodeKind::Block(body) => {
        for stmt in body {
          self.gen_stmt(stmt)?;
        }
      }
      NodeKind::Break => {
        if self.brknum == 0 {
          return Err(node.tok.error("stray break"))
        }
        writeln!(self.out, "  jmp .L.break.{}", self.brknum)?;
      }
      NodeKind::Continue => {
        if self.contnum == 0 {
          return Err(node.tok.error("stray continue"))
        }
        writeln!(self.out, "  jmp .L.continue.{}", self.contnum)?;
      }
      NodeKind::Goto(label) => {
        writeln!(self.out, "  jmp .L.label.{}.{}", self.fn_name(), label)?;
      }
      NodeKind::Label { name, body } => {
        writeln!(self.out, ".L.label.{}.{}:", self.fn_name(), name)?;
        self.gen_stmt(body)?;
      }
      NodeKind::Return(expr) => {
        if let Some(expr) = expr {
          self.gen_expr(expr)?;
          self.top -= 1;
          match self.prog.types[expr.ty()].kind {
            TyKind::Float => writeln!(self.out, "  movss {}, %xmm0", self.freg(self.top)?)?,
            TyKind::Double => writeln!(self.out, "  movsd {}, %xmm0", self.freg(self.top)?)?,
            _ => writeln!(self.out, "  mov {}, %rax", self.reg(self.top)?)?,
          }
        }
        writeln!(self.out, "  jmp .L.return.{}", self.fn_name())?;
      }
      NodeKind::ExprStmt(expr) => {
        self.gen_expr(expr)?;
        self.top -= 1;
      }
      _ => return Err(node.tok.error("invalid statement")),
    }

    debug_assert_eq!(self.top, entry, "statement unbalanced the register stack");
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Sections

  fn emit_bss(&mut self) -> Result<()> {
    writeln!(self.out, "  .bss")?;
    for &v in &self.prog.globals {
      let var = &self.prog.vars[v];
      if var.init_data.is_some() {
        continue
      }
      writeln!(self.out, "  .align {}", var.align)?;
      if !var.is_static {
        writeln!(self.out, "  .globl {}", var.name)?;
      }
      writeln!(self.out, "{}:", var.name)?;
      writeln!(self.out, "  .zero {}", self.prog.types.size(var.ty))?;
    }
    Ok(())
  }

  fn emit_data(&mut self) -> Result<()> {
    writeln!(self.out, "  .data")?;
    for &v in &self.prog.globals {
      let var = &self.prog.vars[v];
      let Some(init_data) = &var.init_data else { continue };
      writeln!(self.out, "  .align {}", var.align)?;
      if !var.is_static {
        writeln!(self.out, "  .globl {}", var.name)?;
      }
      writeln!(self.out, "{}:", var.name)?;

      let mut rels = var.rel.iter().peekable();
      let mut pos = 0usize;
      while pos < init_data.len() {
        if let Some(rel) = rels.peek() {
          if rel.offset == pos as i64 {
            writeln!(self.out, "  .quad {}{:+}", rel.label, rel.addend)?;
            rels.next();
            pos += 8;
            continue
          }
        }
        writeln!(self.out, "  .byte {}", init_data[pos])?;
        pos += 1;
      }
    }
    Ok(())
  }

  fn emit_text(&mut self) -> Result<()> {
    writeln!(self.out, "  .text")?;
    for f in &self.prog.fns {
      if !f.is_static {
        writeln!(self.out, "  .globl {}", f.name)?;
      }
      writeln!(self.out, "{}:", f.name)?;
      self.current_fn = Some(f);

      // Prologue. r12-r15 are callee-saved.
      writeln!(self.out, "  push %rbp")?;
      writeln!(self.out, "  mov %rsp, %rbp")?;
      writeln!(self.out, "  sub ${}, %rsp", f.stack_size)?;
      writeln!(self.out, "  mov %r12, -8(%rbp)")?;
      writeln!(self.out, "  mov %r13, -16(%rbp)")?;
      writeln!(self.out, "  mov %r14, -24(%rbp)")?;
      writeln!(self.out, "  mov %r15, -32(%rbp)")?;

      // A variadic function spills the full argument register file for
      // __builtin_va_start to pick over.
      if f.is_variadic {
        let base = CALLEE_SAVE + VA_AREA;
        for (i, r) in ARGREG64.iter().enumerate() {
          writeln!(self.out, "  mov {}, -{}(%rbp)", r, base - 8 * i as i64)?;
        }
        for i in 0..8i64 {
          writeln!(self.out, "  movsd %xmm{}, -{}(%rbp)", i, base - 48 - 16 * i)?;
        }
      }

      // Copy parameters from their argument registers (or the caller's
      // stack area) into their frame slots.
      let mut gp = 0usize;
      let mut fp = 0usize;
      let mut stack_idx = 0i64;
      for &p in &f.params {
        let var = &self.prog.vars[p];
        let size = self.prog.types.size(var.ty);
        if self.prog.types.is_flonum(var.ty) {
          if fp < 8 {
            let insn = if size == 4 { "movss" } else { "movsd" };
            writeln!(self.out, "  {} %xmm{}, -{}(%rbp)", insn, fp, var.offset)?;
            fp += 1;
            continue
          }
        } else if gp < 6 {
          let r = match size {
            1 => ARGREG8[gp],
            2 => ARGREG16[gp],
            4 => ARGREG32[gp],
            _ => ARGREG64[gp],
          };
          writeln!(self.out, "  mov {}, -{}(%rbp)", r, var.offset)?;
          gp += 1;
          continue
        }
        // A parameter beyond the register file lives in the caller's
        // frame; copy it down to our slot.
        writeln!(self.out, "  mov {}(%rbp), %rax", 16 + 8 * stack_idx)?;
        stack_idx += 1;
        match size {
          1 => writeln!(self.out, "  mov %al, -{}(%rbp)", var.offset)?,
          2 => writeln!(self.out, "  mov %ax, -{}(%rbp)", var.offset)?,
          4 => writeln!(self.out, "  mov %eax, -{}(%rbp)", var.offset)?,
          _ => writeln!(self.out, "  mov %rax, -{}(%rbp)", var.offset)?,
        }
      }

      self.gen_stmt(&f.body)?;
      assert_eq!(self.top, 0, "expression stack unbalanced at end of {}", f.name);

      // Epilogue.
      writeln!(self.out, ".L.return.{}:", f.name)?;
      writeln!(self.out, "  mov -8(%rbp), %r12")?;
      writeln!(self.out, "  mov -16(%rbp), %r13")?;
      writeln!(self.out, "  mov -24(%rbp), %r14")?;
      writeln!(self.out, "  mov -32(%rbp), %r15")?;
      writeln!(self.out, "  mov %rbp, %rsp")?;
      writeln!(self.out, "  pop %rbp")?;
      writeln!(self.out, "  ret")?;
    }
    Ok(())
  }

  fn run(&mut self, files: &[Rc<SourceFile>]) -> Result<()> {
    for file in files {
      writeln!(self.out, "  .file {} \"{}\"", file.file_no, file.name)?;
    }
    self.emit_bss()?;
    self.emit_data()?;
    self.emit_text()
  }
}
