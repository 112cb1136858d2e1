//! The recursive descent parser.
//!
//! Most methods are named after the grammar symbols they read. Each takes
//! the cursor where it stands, builds an AST node, and leaves the cursor on
//! the first token it did not consume (the C original threaded a `rest`
//! out-parameter for this; here the cursor is parser state).
//!
//! The parser performs semantic analysis in the same pass: it resolves
//! names through the nested scopes, assigns a type to every expression
//! node ([`Parser::add_type`]), lowers initializers into assignment
//! expression trees (locals) or byte images with relocations (globals),
//! and folds constant expressions for array dimensions, enumerators, case
//! labels and static initializers.

use byteorder::{ByteOrder, LE};
use if_chain::if_chain;
use smallvec::SmallVec;

use crate::symbol::{Symbol, intern};
use crate::tokenize::{NumLit, Token, TokenKind};
use crate::types::ast::{
  BinOp, CaseLabel, Function, Node, NodeKind, Program, Relocation, VarData, VarId,
};
use crate::types::ty::{Member, Param, Ty, TyArena, TyData, TyKind};
use crate::types::{IdxVec, align_down, align_to};
use crate::Result;

/// A variable/typedef/enum-constant scope entry.
#[derive(Clone, Debug)]
enum ScopeEntry {
  Var(VarId),
  Typedef(Ty),
  EnumConst(i64),
}

#[derive(Clone, Debug)]
struct VarScope {
  name: Symbol,
  depth: u32,
  entry: ScopeEntry,
}

/// A struct/union/enum tag scope entry.
#[derive(Clone, Debug)]
struct TagScope {
  name: Symbol,
  depth: u32,
  ty: Ty,
}

/// Variable attributes accumulated by `typespec` (storage class and
/// alignment).
#[derive(Default)]
struct VarAttr {
  is_typedef: bool,
  is_static: bool,
  is_extern: bool,
  align: i64,
}

/// A parsed declarator: the declared type plus the name it binds (absent
/// in abstract declarators and parameter declarations that omit it).
struct Decl {
  ty: Ty,
  name: Option<Token>,
  name_pos: Token,
}

/// The initializer tree. Leaves hold an expression; aggregate nodes hold
/// one child slot per element or member, `None` where the written
/// initializer omitted it (omitted elements are zeroed).
#[derive(Clone, Debug)]
struct Initializer {
  tok: Token,
  expr: Option<Node>,
  children: Vec<Option<Initializer>>,
}

impl Initializer {
  fn leaf(expr: Node, tok: Token) -> Self {
    Initializer { tok, expr: Some(expr), children: vec![] }
  }

  fn aggregate(len: usize, tok: Token) -> Self {
    Initializer { tok, expr: None, children: (0..len).map(|_| None).collect() }
  }
}

/// The path from an initialized variable down to one leaf sub-object,
/// used to rebuild the lvalue expression for the synthesized assignment.
enum InitDesg<'a> {
  Var(VarId),
  Index { parent: &'a InitDesg<'a>, idx: i64 },
  Member { parent: &'a InitDesg<'a>, member: &'a Member },
}

/// Case labels collected while parsing the body of a `switch`.
struct SwitchCtx {
  cases: Vec<CaseLabel>,
  default: Option<u32>,
}

pub struct Parser {
  toks: Vec<Token>,
  pos: usize,

  types: TyArena,
  vars: IdxVec<VarId, VarData>,
  globals: Vec<VarId>,
  locals: Vec<VarId>,
  fns: Vec<Function>,

  var_scope: Vec<VarScope>,
  tag_scope: Vec<TagScope>,
  scope_depth: u32,

  /// Return type of the function being parsed.
  current_ret: Option<Ty>,
  current_switch: Option<SwitchCtx>,

  /// Counter for anonymous global names (`.L.data.<n>`) and case labels.
  unique_id: u32,
}

/// Parse a whole (preprocessed) translation unit.
pub fn parse(toks: Vec<Token>) -> Result<Program> {
  Parser::new(toks).program()
}

/// Evaluate a token sequence as an integer constant expression. Used by the
/// preprocessor for `#if` lines; the trailing token must be EOF.
pub fn const_expr_tokens(toks: &[Token]) -> Result<i64> {
  assert!(toks.last().is_some_and(Token::is_eof), "missing EOF sentinel");
  let mut p = Parser::new(toks.to_vec());
  let mut node = p.conditional()?;
  if !p.cur().is_eof() {
    return Err(p.cur().error("extra token"))
  }
  p.add_type(&mut node)?;
  p.eval(&mut node)
}

impl Parser {
  fn new(toks: Vec<Token>) -> Self {
    Parser {
      toks, pos: 0,
      types: TyArena::new(),
      vars: IdxVec::new(),
      globals: vec![], locals: vec![], fns: vec![],
      var_scope: vec![], tag_scope: vec![], scope_depth: 0,
      current_ret: None, current_switch: None,
      unique_id: 0,
    }
  }

  // ---------------------------------------------------------------------
  // Cursor plumbing

  fn cur(&self) -> &Token { &self.toks[self.pos] }

  fn peek(&self, n: usize) -> &Token {
    &self.toks[(self.pos + n).min(self.toks.len() - 1)]
  }

  fn at(&self, s: &str) -> bool { self.cur().is(s) }

  fn tok(&self) -> Token { self.cur().clone() }

  fn bump(&mut self) -> Token {
    let t = self.cur().clone();
    if self.pos + 1 < self.toks.len() { self.pos += 1 }
    t
  }

  fn skip(&mut self, s: &str) -> Result<Token> {
    if !self.at(s) {
      return Err(self.cur().error(format_args!("expected '{s}'")))
    }
    Ok(self.bump())
  }

  fn consume(&mut self, s: &str) -> bool {
    if self.at(s) { self.bump(); true } else { false }
  }

  // ---------------------------------------------------------------------
  // Scopes and variables

  fn enter_scope(&mut self) { self.scope_depth += 1 }

  fn leave_scope(&mut self) {
    self.scope_depth -= 1;
    while self.var_scope.last().is_some_and(|sc| sc.depth > self.scope_depth) {
      self.var_scope.pop();
    }
    while self.tag_scope.last().is_some_and(|sc| sc.depth > self.scope_depth) {
      self.tag_scope.pop();
    }
  }

  fn push_scope(&mut self, name: Symbol, entry: ScopeEntry) {
    self.var_scope.push(VarScope { name, depth: self.scope_depth, entry });
  }

  fn push_tag_scope(&mut self, name: Symbol, ty: Ty) {
    self.tag_scope.push(TagScope { name, depth: self.scope_depth, ty });
  }

  fn find_var(&self, tok: &Token) -> Option<&ScopeEntry> {
    let name = intern(tok.text());
    self.var_scope.iter().rev().find(|sc| sc.name == name).map(|sc| &sc.entry)
  }

  fn find_tag(&self, tok: &Token) -> Option<&TagScope> {
    let name = intern(tok.text());
    self.tag_scope.iter().rev().find(|sc| sc.name == name)
  }

  fn find_typedef(&self, tok: &Token) -> Option<Ty> {
    if tok.is_ident() {
      if let Some(ScopeEntry::Typedef(ty)) = self.find_var(tok) {
        return Some(*ty)
      }
    }
    None
  }

  fn new_var(&mut self, name: Symbol, ty: Ty) -> VarId {
    let align = self.types.align(ty);
    let var = self.vars.push(VarData {
      name, ty, is_local: false, align, offset: 0,
      is_static: false, init_data: None, rel: vec![],
    });
    self.push_scope(name, ScopeEntry::Var(var));
    var
  }

  fn new_lvar(&mut self, name: Symbol, ty: Ty) -> VarId {
    let var = self.new_var(name, ty);
    self.vars[var].is_local = true;
    self.locals.push(var);
    var
  }

  fn new_gvar(&mut self, name: Symbol, ty: Ty, is_static: bool, is_definition: bool) -> VarId {
    let var = self.new_var(name, ty);
    self.vars[var].is_static = is_static;
    if is_definition {
      self.globals.push(var);
    }
    var
  }

  fn new_unique_name(&mut self) -> Symbol {
    let name = intern(&format!(".L.data.{}", self.unique_id));
    self.unique_id += 1;
    name
  }

  fn next_case_id(&mut self) -> u32 {
    self.unique_id += 1;
    self.unique_id - 1
  }

  fn new_string_literal(&mut self, bytes: &[u8], elem: u8) -> VarId {
    let base = match elem {
      1 => Ty::CHAR,
      2 => Ty::USHORT,
      _ => Ty::UINT,
    };
    let len = (bytes.len() / elem as usize) as i64;
    let ty = self.types.array_of(base, len);
    let name = self.new_unique_name();
    let var = self.new_gvar(name, ty, true, true);
    self.vars[var].init_data = Some(bytes.to_vec());
    var
  }

  fn get_ident(tok: &Token) -> Result<Symbol> {
    if !tok.is_ident() {
      return Err(tok.error("expected an identifier"))
    }
    Ok(intern(tok.text()))
  }

  // ---------------------------------------------------------------------
  // Node constructors

  fn new_num(val: i64, tok: Token) -> Node { Node::new(NodeKind::Num(val), tok) }

  fn new_ulong(val: i64, tok: Token) -> Node {
    let mut node = Node::new(NodeKind::Num(val), tok);
    node.ty = Some(Ty::ULONG);
    node
  }

  fn new_var_node(var: VarId, tok: Token) -> Node { Node::new(NodeKind::Var(var), tok) }

  fn new_binary(op: BinOp, lhs: Node, rhs: Node, tok: Token) -> Node {
    Node::new(NodeKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, tok)
  }

  fn new_cast(&mut self, mut expr: Node, ty: Ty) -> Result<Node> {
    self.add_type(&mut expr)?;
    let tok = expr.tok.clone();
    Ok(Node { kind: NodeKind::Cast(Box::new(expr)), ty: Some(ty), tok })
  }

  /// Rewrite `node` to `(ty)node` in place.
  fn wrap_cast(&mut self, node: &mut Box<Node>, ty: Ty) {
    let tok = node.tok.clone();
    let inner = std::mem::replace(node, Box::new(Node::new(NodeKind::NullExpr, tok.clone())));
    **node = Node { kind: NodeKind::Cast(inner), ty: Some(ty), tok };
  }

  // ---------------------------------------------------------------------
  // The type pass

  fn usual_arith_conv(&mut self, lhs: &mut Box<Node>, rhs: &mut Box<Node>) {
    let ty = self.types.common_type(lhs.ty(), rhs.ty());
    self.wrap_cast(lhs, ty);
    self.wrap_cast(rhs, ty);
  }

  /// Assign a type to every expression node reachable from `node` that
  /// does not have one yet, inserting the casts required by the usual
  /// arithmetic conversion.
  fn add_type(&mut self, node: &mut Node) -> Result<()> {
    if node.ty.is_some() {
      return Ok(())
    }
    match &mut node.kind {
      NodeKind::Binary { op, lhs, rhs } => {
        self.add_type(lhs)?;
        self.add_type(rhs)?;
        let op = *op;
        if matches!(op, BinOp::Mod | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
            | BinOp::Shl | BinOp::Shr)
          && (self.types.is_flonum(lhs.ty()) || self.types.is_flonum(rhs.ty()))
        {
          return Err(node.tok.error("invalid operands"))
        }
        if matches!(op, BinOp::Shl | BinOp::Shr) {
          node.ty = Some(lhs.ty());
        } else if op.is_cmp() {
          self.usual_arith_conv(lhs, rhs);
          node.ty = Some(Ty::INT);
        } else {
          self.usual_arith_conv(lhs, rhs);
          node.ty = Some(lhs.ty());
        }
      }
      NodeKind::Not(lhs) => {
        self.add_type(lhs)?;
        node.ty = Some(Ty::INT);
      }
      NodeKind::BitNot(lhs) => {
        self.add_type(lhs)?;
        if !self.types.is_integer(lhs.ty()) {
          return Err(node.tok.error("invalid operand"))
        }
        node.ty = Some(lhs.ty());
      }
      NodeKind::LogAnd { lhs, rhs } | NodeKind::LogOr { lhs, rhs } => {
        self.add_type(lhs)?;
        self.add_type(rhs)?;
        node.ty = Some(Ty::INT);
      }
      NodeKind::Assign { lhs, rhs, .. } => {
        self.add_type(lhs)?;
        self.add_type(rhs)?;
        if self.types.is_array(lhs.ty()) {
          return Err(lhs.tok.error("not an lvalue"))
        }
        if self.types.is_scalar(rhs.ty()) {
          let to = lhs.ty();
          self.wrap_cast(rhs, to);
        }
        node.ty = Some(lhs.ty());
      }
      NodeKind::Cond { cond, then, els } => {
        self.add_type(cond)?;
        self.add_type(then)?;
        self.add_type(els)?;
        if self.types.is_void(then.ty()) || self.types.is_void(els.ty()) {
          node.ty = Some(Ty::VOID);
        } else {
          self.usual_arith_conv(then, els);
          node.ty = Some(then.ty());
        }
      }
      NodeKind::Comma { lhs, rhs } => {
        self.add_type(lhs)?;
        self.add_type(rhs)?;
        node.ty = Some(rhs.ty());
      }
      NodeKind::Member { base, member } => {
        self.add_type(base)?;
        node.ty = Some(member.ty);
      }
      NodeKind::Addr(lhs) => {
        self.add_type(lhs)?;
        let ty = lhs.ty();
        node.ty = Some(match self.types[ty].kind {
          TyKind::Array { base, .. } => self.types.pointer_to(base),
          _ => self.types.pointer_to(ty),
        });
      }
      NodeKind::Deref(lhs) => {
        self.add_type(lhs)?;
        let Some(base) = self.types.base(lhs.ty()) else {
          return Err(node.tok.error("invalid pointer dereference"))
        };
        if self.types.is_void(base) {
          return Err(node.tok.error("dereferencing a void pointer"))
        }
        node.ty = Some(base);
      }
      NodeKind::Var(v) => node.ty = Some(self.vars[*v].ty),
      NodeKind::Num(val) => {
        node.ty = Some(if *val == i64::from(*val as i32) { Ty::INT } else { Ty::LONG });
      }
      NodeKind::Float(_) => node.ty = Some(Ty::DOUBLE),
      NodeKind::Funcall { .. } | NodeKind::Cast(_) =>
        unreachable!("typed at creation"),
      NodeKind::StmtExpr(body) => {
        for stmt in body.iter_mut() {
          self.add_type(stmt)?;
        }
        if let Some(Node { kind: NodeKind::ExprStmt(e), .. }) = body.last() {
          node.ty = Some(e.ty());
        } else {
          return Err(node.tok.error("statement expression returning void is not supported"))
        }
      }
      NodeKind::NullExpr => node.ty = Some(Ty::INT),

      // Statements carry no type; their sub-expressions are typed here.
      NodeKind::If { cond, then, els } => {
        self.add_type(cond)?;
        self.add_type(then)?;
        if let Some(els) = els { self.add_type(els)? }
      }
      NodeKind::For { init, cond, inc, body } => {
        if let Some(n) = init { self.add_type(n)? }
        if let Some(n) = cond { self.add_type(n)? }
        if let Some(n) = inc { self.add_type(n)? }
        self.add_type(body)?;
      }
      NodeKind::Do { body, cond } => {
        self.add_type(body)?;
        self.add_type(cond)?;
      }
      NodeKind::Switch { cond, body, .. } => {
        self.add_type(cond)?;
        self.add_type(body)?;
      }
      NodeKind::Case { body, .. } | NodeKind::Label { body, .. } => self.add_type(body)?,
      NodeKind::Block(body) => {
        for stmt in body.iter_mut() {
          self.add_type(stmt)?;
        }
      }
      NodeKind::ExprStmt(e) => self.add_type(e)?,
      NodeKind::Return(Some(e)) => self.add_type(e)?,
      NodeKind::Return(None) | NodeKind::Break | NodeKind::Continue | NodeKind::Goto(_) => {}
    }
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Constant evaluation

  fn const_expr(&mut self) -> Result<i64> {
    let mut node = self.conditional()?;
    self.add_type(&mut node)?;
    self.eval(&mut node)
  }

  /// Evaluate a node as an integer constant expression.
  fn eval(&mut self, node: &mut Node) -> Result<i64> {
    self.add_type(node)?;
    if self.types.is_flonum(node.ty()) {
      return Ok(self.eval_double(node)? as i64)
    }
    let unsigned = self.types.is_unsigned(node.ty());
    let size = self.types.size(node.ty());
    match &mut node.kind {
      NodeKind::Binary { op, lhs, rhs } => {
        let lhs_unsigned = self.types.is_unsigned(lhs.ty());
        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;
        Ok(match op {
          BinOp::Add => l.wrapping_add(r),
          BinOp::Sub => l.wrapping_sub(r),
          BinOp::Mul => l.wrapping_mul(r),
          BinOp::Div | BinOp::Mod => {
            if r == 0 {
              return Err(node.tok.error("division by zero"))
            }
            match (op, unsigned) {
              (BinOp::Div, true) => ((l as u64) / (r as u64)) as i64,
              (BinOp::Div, false) => l.wrapping_div(r),
              (_, true) => ((l as u64) % (r as u64)) as i64,
              (_, false) => l.wrapping_rem(r),
            }
          }
          BinOp::BitAnd => l & r,
          BinOp::BitOr => l | r,
          BinOp::BitXor => l ^ r,
          BinOp::Shl => l.wrapping_shl(r as u32),
          BinOp::Shr =>
            if unsigned && size == 8 { ((l as u64).wrapping_shr(r as u32)) as i64 }
            else { l.wrapping_shr(r as u32) },
          BinOp::Eq => i64::from(l == r),
          BinOp::Ne => i64::from(l != r),
          BinOp::Lt =>
            if lhs_unsigned { i64::from((l as u64) < r as u64) } else { i64::from(l < r) },
          BinOp::Le =>
            if lhs_unsigned { i64::from(l as u64 <= r as u64) } else { i64::from(l <= r) },
        })
      }
      NodeKind::Cond { cond, then, els } => {
        if self.eval(cond)? != 0 { self.eval(then) } else { self.eval(els) }
      }
      NodeKind::Comma { rhs, .. } => self.eval(rhs),
      NodeKind::Not(lhs) => Ok(i64::from(self.eval(lhs)? == 0)),
      NodeKind::BitNot(lhs) => Ok(!self.eval(lhs)?),
      NodeKind::LogAnd { lhs, rhs } =>
        Ok(i64::from(self.eval(lhs)? != 0 && self.eval(rhs)? != 0)),
      NodeKind::LogOr { lhs, rhs } =>
        Ok(i64::from(self.eval(lhs)? != 0 || self.eval(rhs)? != 0)),
      NodeKind::Cast(lhs) => {
        let val = self.eval(lhs)?;
        if !self.types.is_integer(node.ty()) || size == 8 {
          return Ok(val)
        }
        Ok(match (size, unsigned) {
          (1, true) => i64::from(val as u8),
          (1, false) => i64::from(val as i8),
          (2, true) => i64::from(val as u16),
          (2, false) => i64::from(val as i16),
          (_, true) => i64::from(val as u32),
          (_, false) => i64::from(val as i32),
        })
      }
      NodeKind::Num(val) => Ok(*val),
      _ => Err(node.tok.error("not a constant expression")),
    }
  }

  fn eval_double(&mut self, node: &mut Node) -> Result<f64> {
    self.add_type(node)?;
    if self.types.is_integer(node.ty()) {
      let unsigned = self.types.is_unsigned(node.ty());
      let val = self.eval(node)?;
      return Ok(if unsigned { val as u64 as f64 } else { val as f64 })
    }
    match &mut node.kind {
      NodeKind::Binary { op, lhs, rhs } => {
        let l = self.eval_double(lhs)?;
        let r = self.eval_double(rhs)?;
        Ok(match op {
          BinOp::Add => l + r,
          BinOp::Sub => l - r,
          BinOp::Mul => l * r,
          BinOp::Div => l / r,
          _ => return Err(node.tok.error("not a constant expression")),
        })
      }
      NodeKind::Cond { cond, then, els } => {
        if self.eval_double(cond)? != 0.0 { self.eval_double(then) } else { self.eval_double(els) }
      }
      NodeKind::Comma { rhs, .. } => self.eval_double(rhs),
      NodeKind::Cast(lhs) => {
        if self.types.is_flonum(lhs.ty()) {
          self.eval_double(lhs)
        } else {
          Ok(self.eval(lhs)? as f64)
        }
      }
      NodeKind::Float(val) => Ok(*val),
      _ => Err(node.tok.error("not a constant expression")),
    }
  }

  /// Evaluate an address-valued constant expression of the shape
  /// `&global + constant`, returning the addend and the referenced global
  /// if any. Only valid inside a global initializer.
  fn eval_addr(&mut self, node: &mut Node) -> Result<(i64, Option<VarId>)> {
    self.add_type(node)?;
    match &mut node.kind {
      NodeKind::Binary { op: BinOp::Add, lhs, rhs } => {
        let (val, var) = self.eval_addr(lhs)?;
        Ok((val.wrapping_add(self.eval(rhs)?), var))
      }
      NodeKind::Binary { op: BinOp::Sub, lhs, rhs } => {
        let (val, var) = self.eval_addr(lhs)?;
        Ok((val.wrapping_sub(self.eval(rhs)?), var))
      }
      NodeKind::Addr(lhs) => self.eval_rval(lhs),
      NodeKind::Cast(lhs) => {
        if self.types.base(lhs.ty()).is_some() {
          self.eval_addr(lhs)
        } else {
          Ok((self.eval(lhs)?, None))
        }
      }
      NodeKind::Var(v) => {
        let ty = self.vars[*v].ty;
        if !self.types.is_array(ty) && !self.types.is_func(ty) {
          return Err(node.tok.error("invalid initializer"))
        }
        Ok((0, Some(*v)))
      }
      NodeKind::Num(val) => Ok((*val, None)),
      _ => Err(node.tok.error("not a constant expression")),
    }
  }

  fn eval_rval(&mut self, node: &mut Node) -> Result<(i64, Option<VarId>)> {
    self.add_type(node)?;
    match &mut node.kind {
      NodeKind::Var(v) => {
        if self.vars[*v].is_local {
          return Err(node.tok.error("not a compile-time constant"))
        }
        Ok((0, Some(*v)))
      }
      NodeKind::Deref(lhs) => self.eval_addr(lhs),
      NodeKind::Member { base, member } => {
        let (val, var) = self.eval_rval(base)?;
        Ok((val + member.offset, var))
      }
      _ => Err(node.tok.error("invalid initializer")),
    }
  }

  // ---------------------------------------------------------------------
  // Type specifiers and declarators

  /// Is the current token the start of a type name?
  fn is_typename(&self, tok: &Token) -> bool {
    const KW: &[&str] = &[
      "void", "_Bool", "char", "short", "int", "long", "float", "double",
      "struct", "union", "typedef", "enum", "static", "extern", "_Alignas",
      "signed", "unsigned", "const", "volatile", "register", "_Noreturn",
    ];
    KW.iter().any(|k| tok.is(k)) || self.find_typedef(tok).is_some()
  }

  /// typespec = typename typename*
  ///
  /// The order of type keywords does not matter (`int long static` means
  /// `static long int`), but only a limited set of combinations is valid.
  /// Each built-in keyword increments a counter with two bits reserved per
  /// keyword; the accumulated value is then matched against the valid
  /// combinations.
  fn typespec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<Ty> {
    const VOID: u32 = 1 << 0;
    const BOOL: u32 = 1 << 2;
    const CHAR: u32 = 1 << 4;
    const SHORT: u32 = 1 << 6;
    const INT: u32 = 1 << 8;
    const LONG: u32 = 1 << 10;
    const FLOAT: u32 = 1 << 12;
    const DOUBLE: u32 = 1 << 14;
    const OTHER: u32 = 1 << 16;
    const SIGNED: u32 = 1 << 17;
    const UNSIGNED: u32 = 1 << 18;

    let mut ty = Ty::INT;
    let mut counter = 0u32;
    let mut is_const = false;

    while self.is_typename(self.cur()) {
      let tok = self.tok();

      // Storage class specifiers.
      if self.at("typedef") || self.at("static") || self.at("extern") {
        let Some(attr) = attr.as_deref_mut() else {
          return Err(tok.error("storage class specifier is not allowed in this context"))
        };
        if self.at("typedef") { attr.is_typedef = true }
        else if self.at("static") { attr.is_static = true }
        else { attr.is_extern = true }
        if u8::from(attr.is_typedef) + u8::from(attr.is_static) + u8::from(attr.is_extern) > 1 {
          return Err(tok.error("typedef, static and extern may not be used together"))
        }
        self.bump();
        continue
      }

      if self.consume("const") {
        is_const = true;
        continue
      }
      if self.consume("volatile") || self.consume("register") || self.consume("_Noreturn") {
        continue
      }

      if self.at("_Alignas") {
        let Some(attr) = attr.as_deref_mut() else {
          return Err(tok.error("_Alignas is not allowed in this context"))
        };
        self.bump();
        self.skip("(")?;
        attr.align = if self.is_typename(self.cur()) {
          let ty = self.typename()?;
          self.types.align(ty)
        } else {
          self.const_expr()?
        };
        self.skip(")")?;
        continue
      }

      // User-defined types.
      let ty2 = self.find_typedef(self.cur());
      if self.at("struct") || self.at("union") || self.at("enum") || ty2.is_some() {
        if counter != 0 { break }

        if self.at("struct") {
          self.bump();
          ty = self.struct_decl()?;
        } else if self.at("union") {
          self.bump();
          ty = self.union_decl()?;
        } else if self.at("enum") {
          self.bump();
          ty = self.enum_specifier()?;
        } else {
          ty = ty2.expect("typedef");
          self.bump();
        }

        counter += OTHER;
        continue
      }

      // Built-in types.
      if self.at("void") { counter += VOID }
      else if self.at("_Bool") { counter += BOOL }
      else if self.at("char") { counter += CHAR }
      else if self.at("short") { counter += SHORT }
      else if self.at("int") { counter += INT }
      else if self.at("long") { counter += LONG }
      else if self.at("float") { counter += FLOAT }
      else if self.at("double") { counter += DOUBLE }
      else if self.at("signed") { counter |= SIGNED }
      else if self.at("unsigned") { counter |= UNSIGNED }
      else { unreachable!("typespec keyword") }

      ty = match counter {
        VOID => Ty::VOID,
        BOOL => Ty::BOOL,
        CHAR => Ty::CHAR,
        c if c == SIGNED + CHAR => Ty::SCHAR,
        c if c == UNSIGNED + CHAR => Ty::UCHAR,
        SHORT => Ty::SHORT,
        c if c == SHORT + INT => Ty::SHORT,
        c if c == SIGNED + SHORT || c == SIGNED + SHORT + INT => Ty::SSHORT,
        c if c == UNSIGNED + SHORT || c == UNSIGNED + SHORT + INT => Ty::USHORT,
        INT => Ty::INT,
        SIGNED => Ty::SINT,
        c if c == SIGNED + INT => Ty::SINT,
        UNSIGNED => Ty::UINT,
        c if c == UNSIGNED + INT => Ty::UINT,
        c if c == LONG || c == LONG + INT || c == LONG + LONG || c == LONG + LONG + INT =>
          Ty::LONG,
        c if c == SIGNED + LONG || c == SIGNED + LONG + INT
          || c == SIGNED + LONG + LONG || c == SIGNED + LONG + LONG + INT => Ty::SLONG,
        c if c == UNSIGNED + LONG || c == UNSIGNED + LONG + INT
          || c == UNSIGNED + LONG + LONG || c == UNSIGNED + LONG + LONG + INT => Ty::ULONG,
        FLOAT => Ty::FLOAT,
        c if c == DOUBLE || c == LONG + DOUBLE => Ty::DOUBLE,
        _ => return Err(tok.error("invalid type")),
      };

      self.bump();
    }

    if is_const {
      ty = self.types.with_const(ty);
    }
    Ok(ty)
  }

  /// func-params = ("void" | param ("," param)* ("," "...")?)? ")"
  /// param       = typespec declarator
  fn func_params(&mut self, return_ty: Ty) -> Result<Ty> {
    if self.at("void") && self.peek(1).is(")") {
      self.bump();
      self.bump();
      let fty = self.types.func_type(return_ty);
      return Ok(fty)
    }

    let mut params = vec![];
    let mut is_variadic = false;

    while !self.at(")") {
      if !params.is_empty() {
        self.skip(",")?;
      }

      if self.at("...") {
        is_variadic = true;
        self.bump();
        if !self.at(")") {
          return Err(self.cur().error("expected ')'"))
        }
        break
      }

      let basety = self.typespec(None)?;
      let decl = self.declarator(basety)?;
      let name = decl.name.as_ref().map(|t| intern(t.text()));

      // "array of T" decays to "pointer to T" in a parameter context, so
      // `char *argv[]` becomes `char **argv`.
      let ty = match self.types[decl.ty].kind {
        TyKind::Array { base, .. } => self.types.pointer_to(base),
        _ => decl.ty,
      };
      params.push(Param { name, ty });
    }
    self.skip(")")?;

    let fty = self.types.func_type(return_ty);
    let TyKind::Func { params: p, is_variadic: v, .. } = &mut self.types[fty].kind
      else { unreachable!() };
    *p = params;
    *v = is_variadic;
    Ok(fty)
  }

  /// array-dimensions = const-expr? "]" type-suffix
  fn array_dimensions(&mut self, ty: Ty) -> Result<Ty> {
    if self.consume("]") {
      let ty = self.type_suffix(ty)?;
      return Ok(self.types.array_of(ty, -1))
    }

    let len_tok = self.tok();
    let len = self.const_expr()?;
    if len < 0 {
      return Err(len_tok.error("array size is negative"))
    }
    self.skip("]")?;
    let ty = self.type_suffix(ty)?;
    Ok(self.types.array_of(ty, len))
  }

  /// type-suffix = "(" func-params | "[" array-dimensions | ε
  fn type_suffix(&mut self, ty: Ty) -> Result<Ty> {
    if self.consume("(") {
      return self.func_params(ty)
    }
    if self.consume("[") {
      return self.array_dimensions(ty)
    }
    Ok(ty)
  }

  /// pointers = ("*" ("const" | "volatile" | "restrict")*)*
  fn pointers(&mut self, mut ty: Ty) -> Result<Ty> {
    while self.consume("*") {
      ty = self.types.pointer_to(ty);
      while self.at("const") || self.at("volatile") || self.at("restrict") {
        if self.at("const") {
          self.types[ty].is_const = true;
        }
        self.bump();
      }
    }
    Ok(ty)
  }

  /// declarator = pointers ("(" declarator ")" | ident)? type-suffix
  ///
  /// `T (D) S` binds inside out: the inner declarator `D` wraps the
  /// eventual type, and the suffix `S` applies first. A placeholder slot is
  /// allocated for `D`'s base and back-patched once the suffix is known.
  fn declarator(&mut self, ty: Ty) -> Result<Decl> {
    let ty = self.pointers(ty)?;

    if self.at("(") {
      self.bump();
      let placeholder = self.types.alloc(TyData {
        kind: TyKind::Void, size: 0, align: 1,
        is_unsigned: false, is_const: false, is_incomplete: true, explicitly_signed: false,
      });
      let inner = self.declarator(placeholder)?;
      self.skip(")")?;
      let actual = self.type_suffix(ty)?;
      let data = self.types[actual].clone();
      self.types.complete(placeholder, data);
      return Ok(inner)
    }

    let name_pos = self.tok();
    let name = if self.cur().is_ident() { Some(self.bump()) } else { None };
    let ty = self.type_suffix(ty)?;
    Ok(Decl { ty, name, name_pos })
  }

  /// abstract-declarator = pointers ("(" abstract-declarator ")")? type-suffix
  fn abstract_declarator(&mut self, ty: Ty) -> Result<Ty> {
    let ty = self.pointers(ty)?;

    if self.at("(") {
      self.bump();
      let placeholder = self.types.alloc(TyData {
        kind: TyKind::Void, size: 0, align: 1,
        is_unsigned: false, is_const: false, is_incomplete: true, explicitly_signed: false,
      });
      let inner = self.abstract_declarator(placeholder)?;
      self.skip(")")?;
      let actual = self.type_suffix(ty)?;
      let data = self.types[actual].clone();
      self.types.complete(placeholder, data);
      return Ok(inner)
    }

    self.type_suffix(ty)
  }

  /// type-name = typespec abstract-declarator
  fn typename(&mut self) -> Result<Ty> {
    let ty = self.typespec(None)?;
    self.abstract_declarator(ty)
  }

  // ---------------------------------------------------------------------
  // struct/union/enum

  /// struct-members = (typespec declarator ("," declarator)* ";")*
  fn struct_members(&mut self) -> Result<Vec<Member>> {
    let mut members = vec![];

    while !self.at("}") {
      let mut attr = VarAttr::default();
      let basety = self.typespec(Some(&mut attr))?;

      // Anonymous nested struct member.
      if self.types.is_struct(basety) && self.consume(";") {
        let align = if attr.align != 0 { attr.align } else { self.types.align(basety) };
        members.push(Member {
          name: None, ty: basety, align, offset: 0,
          is_bitfield: false, bit_offset: 0, bit_width: 0,
        });
        continue
      }

      let mut first = true;
      while !self.consume(";") {
        if !first {
          self.skip(",")?;
        }
        first = false;

        let decl = self.declarator(basety)?;
        if self.types[decl.ty].is_incomplete {
          return Err(decl.name_pos.error("member has incomplete type"))
        }
        let mut ty = decl.ty;
        let mut is_bitfield = false;
        let mut bit_width = 0;

        if self.consume(":") {
          let width_tok = self.tok();
          is_bitfield = true;
          bit_width = self.const_expr()?;
          if !self.types.is_integer(ty) {
            return Err(width_tok.error("bit-field member has a non-integer type"))
          }
          if bit_width < 0 || bit_width > self.types.size(ty) * 8 {
            return Err(width_tok.error("invalid bit-field width"))
          }
          // Bitfields of a plain integer type are unsigned, as the psABI
          // specifies; an explicit `signed` keeps sign-extension.
          if !self.types[ty].explicitly_signed && !self.types.is_unsigned(ty) {
            ty = self.types.copy(ty);
            self.types[ty].is_unsigned = true;
          }
        }

        let name = decl.name.as_ref().map(|t| intern(t.text()));
        let align = if attr.align != 0 { attr.align } else { self.types.align(ty) };
        members.push(Member {
          name, ty, align, offset: 0,
          is_bitfield, bit_offset: 0, bit_width,
        });
      }
    }

    self.skip("}")?;
    Ok(members)
  }

  /// struct-union-decl = ident? ("{" struct-members)?
  ///
  /// Returns the tag's type handle. A reference to an unknown tag creates
  /// an incomplete type; a body completes the existing handle in place so
  /// that every earlier reference observes the completed layout.
  fn struct_union_decl(&mut self) -> Result<(Ty, bool)> {
    let mut tag = None;
    if self.cur().is_ident() {
      tag = Some(self.bump());
    }

    if let Some(tag) = &tag {
      if !self.at("{") {
        if let Some(sc) = self.find_tag(tag) {
          return Ok((sc.ty, false))
        }
        let ty = self.types.struct_type();
        self.push_tag_scope(intern(tag.text()), ty);
        return Ok((ty, false))
      }
    }

    self.skip("{")?;
    let members = self.struct_members()?;
    let ty = self.types.struct_type();
    let TyKind::Struct { members: m, .. } = &mut self.types[ty].kind else { unreachable!() };
    *m = members;

    if let Some(tag) = &tag {
      let name = intern(tag.text());
      // A same-scope redefinition (or a completion of a forward
      // declaration) overwrites the previous slot.
      if let Some(sc) = self.tag_scope.iter().rev().find(|sc| sc.name == name) {
        if sc.depth == self.scope_depth {
          let old = sc.ty;
          let data = self.types[ty].clone();
          self.types.complete(old, data);
          return Ok((old, true))
        }
      }
      self.push_tag_scope(name, ty);
    }
    Ok((ty, true))
  }

  /// struct-decl = struct-union-decl
  ///
  /// Assigns bit offsets to the members: a plain member is placed at the
  /// next alignment boundary; a bitfield packs into the current word
  /// unless it would cross a container boundary; a zero-width bitfield
  /// only forces alignment.
  fn struct_decl(&mut self) -> Result<Ty> {
    let (ty, has_body) = self.struct_union_decl()?;
    if !has_body {
      return Ok(ty)
    }

    let TyKind::Struct { members, .. } = &self.types[ty].kind else { unreachable!() };
    let mut members = members.clone();
    let mut bits = 0i64;
    let mut align = 1i64;

    for mem in &mut members {
      let sz = self.types.size(mem.ty);
      if mem.is_bitfield && mem.bit_width == 0 {
        bits = align_to(bits, sz * 8);
      } else if mem.is_bitfield {
        if bits / (sz * 8) != (bits + mem.bit_width - 1) / (sz * 8) {
          bits = align_to(bits, sz * 8);
        }
        mem.offset = align_down(bits / 8, sz);
        mem.bit_offset = bits % (sz * 8);
        bits += mem.bit_width;
      } else {
        bits = align_to(bits, mem.align * 8);
        mem.offset = bits / 8;
        bits += sz * 8;
      }
      align = align.max(mem.align);
    }

    let size = TyArena::struct_size(bits, align);
    let data = &mut self.types[ty];
    data.size = size;
    data.align = align;
    data.is_incomplete = false;
    let TyKind::Struct { members: m, .. } = &mut data.kind else { unreachable!() };
    *m = members;
    Ok(ty)
  }

  /// union-decl = struct-union-decl
  ///
  /// Every member is at offset 0; size and alignment are the maxima.
  fn union_decl(&mut self) -> Result<Ty> {
    let (ty, has_body) = self.struct_union_decl()?;
    if !has_body {
      return Ok(ty)
    }

    let TyKind::Struct { members, .. } = &self.types[ty].kind else { unreachable!() };
    let mut size = 0i64;
    let mut align = 1i64;
    for mem in members {
      align = align.max(mem.align);
      size = size.max(self.types.size(mem.ty));
    }
    let size = align_to(size, align);

    let data = &mut self.types[ty];
    data.size = size;
    data.align = align;
    data.is_incomplete = false;
    let TyKind::Struct { is_union, .. } = &mut data.kind else { unreachable!() };
    *is_union = true;
    Ok(ty)
  }

  /// enum-specifier = ident? "{" enum-list? "}" | ident
  /// enum-list      = ident ("=" const-expr)? ("," ident ("=" const-expr)?)* ","?
  fn enum_specifier(&mut self) -> Result<Ty> {
    let mut tag = None;
    if self.cur().is_ident() {
      tag = Some(self.bump());
    }

    if let Some(tag) = &tag {
      if !self.at("{") {
        let Some(sc) = self.find_tag(tag) else {
          return Err(tag.error("unknown enum type"))
        };
        if !matches!(self.types[sc.ty].kind, TyKind::Enum) {
          return Err(tag.error("not an enum tag"))
        }
        return Ok(sc.ty)
      }
    }

    let ty = self.types.enum_type();
    self.skip("{")?;

    let mut val = 0i64;
    let mut first = true;
    while !self.consume_end() {
      if !first {
        self.skip(",")?;
      }
      first = false;

      let name = Self::get_ident(self.cur())?;
      self.bump();

      if self.consume("=") {
        val = self.const_expr()?;
      }
      self.push_scope(name, ScopeEntry::EnumConst(val));
      val += 1;
    }

    if let Some(tag) = &tag {
      self.push_tag_scope(intern(tag.text()), ty);
    }
    Ok(ty)
  }

  // ---------------------------------------------------------------------
  // Declarations

  /// declaration = typespec (declarator ("=" initializer)?
  ///                         ("," declarator ("=" initializer)?)*)? ";"
  fn declaration(&mut self) -> Result<Node> {
    let start = self.tok();
    let mut attr = VarAttr::default();
    let basety = self.typespec(Some(&mut attr))?;

    let mut body = vec![];
    let mut first = true;

    while !self.at(";") {
      if !first {
        self.skip(",")?;
      }
      first = false;

      let decl = self.declarator(basety)?;
      let Some(name_tok) = &decl.name else {
        return Err(decl.name_pos.error("variable name omitted"))
      };
      let name = intern(name_tok.text());

      if self.types.is_void(decl.ty) {
        return Err(name_tok.error("variable declared void"))
      }

      if attr.is_typedef {
        self.push_scope(name, ScopeEntry::Typedef(decl.ty));
        continue
      }

      if attr.is_static {
        // A static local is a uniquely named global aliased into the
        // current scope.
        let unique = self.new_unique_name();
        let var = self.new_gvar(unique, decl.ty, true, true);
        self.push_scope(name, ScopeEntry::Var(var));
        if self.consume("=") {
          self.gvar_initializer(var)?;
        }
        continue
      }

      let var = self.new_lvar(name, decl.ty);
      if attr.align != 0 {
        self.vars[var].align = attr.align;
      }

      if self.consume("=") {
        let expr = self.lvar_initializer(var)?;
        let tok = self.tok();
        body.push(Node::new(NodeKind::ExprStmt(Box::new(expr)), tok));
      }

      if self.types[self.vars[var].ty].is_incomplete {
        return Err(name_tok.error("variable has incomplete type"))
      }
    }

    self.bump();
    let mut node = Node::new(NodeKind::Block(body), start);
    self.add_type(&mut node)?;
    Ok(node)
  }

  // ---------------------------------------------------------------------
  // Initializers

  fn is_end(&self) -> bool {
    self.at("}") || (self.at(",") && self.peek(1).is("}"))
  }

  fn consume_end(&mut self) -> bool {
    if self.at("}") {
      self.bump();
      return true
    }
    if self.at(",") && self.peek(1).is("}") {
      self.bump();
      self.bump();
      return true
    }
    false
  }

  fn skip_excess_elements(&mut self) -> Result<()> {
    while !self.consume_end() {
      self.skip(",")?;
      if self.at("{") {
        self.bump();
        self.skip_excess_elements()?;
      } else {
        self.assign()?;
      }
    }
    Ok(())
  }

  fn skip_end(&mut self) -> Result<()> {
    if self.consume_end() {
      return Ok(())
    }
    self.cur().warn("excess elements in initializer");
    self.skip_excess_elements()
  }

  /// Count the elements of an unsized array initializer by parsing the
  /// brace list once and rewinding.
  fn count_array_init_elements(&mut self, base: Ty) -> Result<i64> {
    let save = self.pos;
    self.skip("{")?;
    let mut len = 0;
    while !self.is_end() {
      if len > 0 {
        self.skip(",")?;
      }
      self.initializer2(base)?;
      len += 1;
    }
    self.pos = save;
    Ok(len)
  }

  /// string-initializer = string-literal
  fn string_initializer(&mut self, ty: Ty) -> Result<Initializer> {
    let tok = self.bump();
    let TokenKind::Str { bytes, elem } = &tok.kind else { unreachable!("string token") };
    let elem = *elem as usize;
    let declared_len = match self.types[ty].kind {
      TyKind::Array { len, .. } => len,
      _ => unreachable!("array type"),
    };

    let lit_len = (bytes.len() / elem) as i64;
    let len = declared_len.min(lit_len);
    let mut init = Initializer::aggregate(declared_len.max(0) as usize, tok.clone());
    for i in 0..len as usize {
      let val = match elem {
        1 => i64::from(bytes[i]),
        2 => i64::from(LE::read_u16(&bytes[i * 2..])),
        _ => i64::from(LE::read_u32(&bytes[i * 4..])),
      };
      init.children[i] = Some(Initializer::leaf(Self::new_num(val, tok.clone()), tok.clone()));
    }
    Ok(init)
  }

  /// array-initializer = "{" initializer ("," initializer)* ","? "}"
  fn array_initializer(&mut self, ty: Ty) -> Result<Initializer> {
    let tok = self.tok();
    let has_paren = self.consume("{");
    let (base, len) = match self.types[ty].kind {
      TyKind::Array { base, len } => (base, len),
      _ => unreachable!("array type"),
    };

    let mut init = Initializer::aggregate(len.max(0) as usize, tok);
    for i in 0..len {
      if self.is_end() { break }
      if i > 0 {
        self.skip(",")?;
      }
      init.children[i as usize] = Some(self.initializer2(base)?);
    }

    if has_paren {
      self.skip_end()?;
    }
    Ok(init)
  }

  /// struct-initializer = "{" initializer ("," initializer)* ","? "}"
  ///                    | assign   (a struct-valued expression)
  fn struct_initializer(&mut self, ty: Ty) -> Result<Initializer> {
    if !self.at("{") {
      // A struct can be initialized from another struct value.
      let save = self.pos;
      let mut expr = self.assign()?;
      self.add_type(&mut expr)?;
      if self.types.is_struct(expr.ty()) {
        let tok = expr.tok.clone();
        return Ok(Initializer::leaf(expr, tok))
      }
      self.pos = save;
    }

    let tok = self.tok();
    let members: Vec<Member> = match &self.types[ty].kind {
      TyKind::Struct { members, .. } => members.clone(),
      _ => unreachable!("struct type"),
    };

    let mut init = Initializer::aggregate(members.len(), tok);
    let has_paren = self.consume("{");

    for (i, mem) in members.iter().enumerate() {
      if self.is_end() { break }
      if i > 0 {
        self.skip(",")?;
      }
      init.children[i] = Some(self.initializer2(mem.ty)?);
    }

    if has_paren {
      self.skip_end()?;
    }
    Ok(init)
  }

  fn initializer2(&mut self, ty: Ty) -> Result<Initializer> {
    // A string literal can initialize a character array (and wide string
    // literals the matching wider element arrays).
    if_chain! {
      if self.types.is_array(ty);
      if let TokenKind::Str { elem, .. } = &self.cur().kind;
      if let Some(base) = self.types.base(ty);
      if self.types.is_integer(base) && self.types.size(base) == i64::from(*elem);
      then {
        return self.string_initializer(ty)
      }
    }

    if self.types.is_array(ty) {
      return self.array_initializer(ty)
    }
    if self.types.is_struct(ty) {
      return self.struct_initializer(ty)
    }

    let start = self.tok();
    let has_paren = self.consume("{");
    let expr = self.assign()?;
    let init = Initializer::leaf(expr, start);
    if has_paren {
      self.skip_end()?;
    }
    Ok(init)
  }

  /// initializer = string-initializer | array-initializer
  ///             | struct-initializer | "{" assign "}" | assign
  ///
  /// An omitted array length (`int x[] = {…}`) is inferred here and the
  /// incomplete array type is completed in place.
  fn initializer(&mut self, ty: Ty) -> Result<Initializer> {
    if_chain! {
      if let TyKind::Array { base, len } = self.types[ty].kind;
      if len < 0;
      then {
        let len = if let TokenKind::Str { bytes, elem } = &self.cur().kind {
          (bytes.len() / *elem as usize) as i64
        } else {
          self.count_array_init_elements(base)?
        };
        let complete = self.types.array_of(base, len);
        let data = self.types[complete].clone();
        self.types.complete(ty, data);
      }
    }
    self.initializer2(ty)
  }

  /// Rebuild the lvalue expression for an initializer leaf from its path.
  fn init_desg_expr(&mut self, desg: &InitDesg<'_>, tok: &Token) -> Result<Node> {
    match desg {
      InitDesg::Var(var) => Ok(Self::new_var_node(*var, tok.clone())),
      InitDesg::Member { parent, member } => {
        let base = self.init_desg_expr(parent, tok)?;
        Ok(Node::new(
          NodeKind::Member { base: Box::new(base), member: (*member).clone() },
          tok.clone(),
        ))
      }
      InitDesg::Index { parent, idx } => {
        let lhs = self.init_desg_expr(parent, tok)?;
        let rhs = Self::new_num(*idx, tok.clone());
        let sum = self.new_add(lhs, rhs, tok.clone())?;
        Ok(Node::new(NodeKind::Deref(Box::new(sum)), tok.clone()))
      }
    }
  }

  /// Lower an initializer tree into a comma-sequenced assignment
  /// expression; omitted elements assign zero.
  fn create_lvar_init(
    &mut self, init: Option<&Initializer>, ty: Ty, desg: &InitDesg<'_>, tok: &Token,
  ) -> Result<Node> {
    if let TyKind::Array { base, len } = self.types[ty].kind {
      let mut node = Node::new(NodeKind::NullExpr, tok.clone());
      for i in 0..len.max(0) {
        let desg2 = InitDesg::Index { parent: desg, idx: i };
        let child = init.and_then(|init| init.children.get(i as usize)?.as_ref());
        let rhs = self.create_lvar_init(child, base, &desg2, tok)?;
        node = Node::new(
          NodeKind::Comma { lhs: Box::new(node), rhs: Box::new(rhs) }, tok.clone());
      }
      return Ok(node)
    }

    if self.types.is_struct(ty) && init.is_none_or(|i| !i.children.is_empty()) {
      let members: Vec<Member> = match &self.types[ty].kind {
        TyKind::Struct { members, .. } => members.clone(),
        _ => unreachable!(),
      };
      let mut node = Node::new(NodeKind::NullExpr, tok.clone());
      for (i, mem) in members.iter().enumerate() {
        let desg2 = InitDesg::Member { parent: desg, member: mem };
        let child = init.and_then(|init| init.children.get(i)?.as_ref());
        let rhs = self.create_lvar_init(child, mem.ty, &desg2, tok)?;
        node = Node::new(
          NodeKind::Comma { lhs: Box::new(node), rhs: Box::new(rhs) }, tok.clone());
      }
      return Ok(node)
    }

    let lhs = self.init_desg_expr(desg, tok)?;
    let rhs = match init {
      Some(init) => init.expr.clone().expect("leaf initializer"),
      None => Self::new_num(0, tok.clone()),
    };
    let mut node = Node::new(NodeKind::Assign {
      lhs: Box::new(lhs), rhs: Box::new(rhs), is_init: true,
    }, tok.clone());
    self.add_type(&mut node)?;
    Ok(node)
  }

  /// A definition with an initializer is shorthand for a definition
  /// followed by assignments: `int x[2] = {6, 7}` becomes
  /// `x[0] = 6, x[1] = 7`.
  fn lvar_initializer(&mut self, var: VarId) -> Result<Node> {
    let tok = self.tok();
    let ty = self.vars[var].ty;
    let init = self.initializer(ty)?;
    let desg = InitDesg::Var(var);
    let ty = self.vars[var].ty;
    self.create_lvar_init(Some(&init), ty, &desg, &tok)
  }

  fn read_buf(buf: &[u8], sz: i64) -> i64 {
    match sz {
      1 => i64::from(buf[0]),
      2 => i64::from(LE::read_u16(buf)),
      4 => i64::from(LE::read_u32(buf)),
      _ => LE::read_u64(buf) as i64,
    }
  }

  fn write_buf(buf: &mut [u8], val: i64, sz: i64) {
    match sz {
      1 => buf[0] = val as u8,
      2 => LE::write_u16(buf, val as u16),
      4 => LE::write_u32(buf, val as u32),
      _ => LE::write_u64(buf, val as u64),
    }
  }

  /// Serialize an initializer into a global's byte image. Address-valued
  /// leaves become relocation entries instead of inline bytes.
  fn write_gvar_data(
    &mut self, rels: &mut Vec<Relocation>, init: &mut Initializer,
    ty: Ty, buf: &mut [u8], offset: i64,
  ) -> Result<()> {
    if let TyKind::Array { base, len } = self.types[ty].kind {
      let sz = self.types.size(base);
      for i in 0..len.max(0) {
        if let Some(child) = init.children.get_mut(i as usize).and_then(Option::as_mut) {
          let mut child = child.clone();
          self.write_gvar_data(rels, &mut child, base, buf, offset + sz * i)?;
        }
      }
      return Ok(())
    }

    if self.types.is_struct(ty) && init.expr.is_none() {
      let members: Vec<Member> = match &self.types[ty].kind {
        TyKind::Struct { members, .. } => members.clone(),
        _ => unreachable!(),
      };
      for (i, mem) in members.iter().enumerate() {
        let Some(child) = init.children.get_mut(i).and_then(Option::as_mut) else { continue };
        let mut child = child.clone();

        if mem.is_bitfield {
          let expr = child.expr.as_mut().ok_or_else(|| child.tok.error("invalid initializer"))?;
          let sz = self.types.size(mem.ty);
          let loc = (offset + mem.offset) as usize;
          let val = Self::read_buf(&buf[loc..], sz);
          let mask = (1i64 << mem.bit_width) - 1;
          let newval = val | ((self.eval(expr)? & mask) << mem.bit_offset);
          Self::write_buf(&mut buf[loc..], newval, sz);
          continue
        }

        self.write_gvar_data(rels, &mut child, mem.ty, buf, offset + mem.offset)?;
      }
      return Ok(())
    }

    let expr = init.expr.as_mut().ok_or_else(|| init.tok.error("invalid initializer"))?;

    match self.types[ty].kind {
      TyKind::Float => {
        let val = self.eval_double(expr)? as f32;
        buf[offset as usize..offset as usize + 4].copy_from_slice(&val.to_le_bytes());
      }
      TyKind::Double => {
        let val = self.eval_double(expr)?;
        buf[offset as usize..offset as usize + 8].copy_from_slice(&val.to_le_bytes());
      }
      TyKind::Ptr { .. } => {
        let (val, var) = self.eval_addr(expr)?;
        match var {
          None => Self::write_buf(&mut buf[offset as usize..], val, 8),
          Some(var) => rels.push(Relocation {
            offset, label: self.vars[var].name, addend: val,
          }),
        }
      }
      _ => {
        let sz = self.types.size(ty);
        let val = self.eval(expr)?;
        Self::write_buf(&mut buf[offset as usize..], val, sz);
      }
    }
    Ok(())
  }

  /// Global initializers are evaluated at compile time and embedded in the
  /// `.data` section as a byte image plus relocations.
  fn gvar_initializer(&mut self, var: VarId) -> Result<()> {
    let ty = self.vars[var].ty;
    let mut init = self.initializer(ty)?;
    let ty = self.vars[var].ty;

    let size = self.types.size(ty);
    let mut buf = vec![0u8; size as usize];
    let mut rels = vec![];
    self.write_gvar_data(&mut rels, &mut init, ty, &mut buf, 0)?;
    self.vars[var].init_data = Some(buf);
    self.vars[var].rel = rels;
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Statements

  /// stmt = "return" expr? ";" | "if" …| "switch" … | "case" … | "default" …
  ///      | "for" … | "while" … | "do" … | "break" ";" | "continue" ";"
  ///      | "goto" ident ";" | ident ":" stmt | "{" compound-stmt | expr-stmt
  fn stmt(&mut self) -> Result<Node> {
    if self.at("return") {
      let tok = self.bump();
      if self.consume(";") {
        return Ok(Node::new(NodeKind::Return(None), tok))
      }
      let mut exp = self.expr()?;
      self.skip(";")?;
      self.add_type(&mut exp)?;
      let ret = self.current_ret.expect("return outside a function");
      if self.types.is_struct(ret) {
        return Err(tok.error("returning a struct by value is not supported"))
      }
      let exp = self.new_cast(exp, ret)?;
      return Ok(Node::new(NodeKind::Return(Some(Box::new(exp))), tok))
    }

    if self.at("if") {
      let tok = self.bump();
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;
      let then = self.stmt()?;
      let els = if self.consume("else") { Some(Box::new(self.stmt()?)) } else { None };
      return Ok(Node::new(NodeKind::If {
        cond: Box::new(cond), then: Box::new(then), els,
      }, tok))
    }

    if self.at("switch") {
      let tok = self.bump();
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;

      let outer = self.current_switch.replace(SwitchCtx { cases: vec![], default: None });
      let body = self.stmt()?;
      let ctx = std::mem::replace(&mut self.current_switch, outer).expect("switch context");

      return Ok(Node::new(NodeKind::Switch {
        cond: Box::new(cond), body: Box::new(body),
        cases: ctx.cases, default: ctx.default,
      }, tok))
    }

    if self.at("case") {
      let tok = self.bump();
      if self.current_switch.is_none() {
        return Err(tok.error("stray case"))
      }
      let val = self.const_expr()?;
      self.skip(":")?;
      let id = self.next_case_id();
      self.current_switch.as_mut().expect("switch context")
        .cases.push(CaseLabel { val, id });
      let body = self.stmt()?;
      return Ok(Node::new(NodeKind::Case { id, body: Box::new(body) }, tok))
    }

    if self.at("default") {
      let tok = self.bump();
      if self.current_switch.is_none() {
        return Err(tok.error("stray default"))
      }
      self.skip(":")?;
      let id = self.next_case_id();
      self.current_switch.as_mut().expect("switch context").default = Some(id);
      let body = self.stmt()?;
      return Ok(Node::new(NodeKind::Case { id, body: Box::new(body) }, tok))
    }

    if self.at("for") {
      let tok = self.bump();
      self.skip("(")?;

      self.enter_scope();

      let init = if self.is_typename(self.cur()) {
        Some(Box::new(self.declaration()?))
      } else {
        Some(Box::new(self.expr_stmt()?))
      };

      let cond = if self.at(";") { None } else { Some(Box::new(self.expr()?)) };
      self.skip(";")?;
      let inc = if self.at(")") { None } else { Some(Box::new(self.expr()?)) };
      self.skip(")")?;

      let body = self.stmt()?;
      self.leave_scope();
      return Ok(Node::new(NodeKind::For { init, cond, inc, body: Box::new(body) }, tok))
    }

    if self.at("while") {
      let tok = self.bump();
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;
      let body = self.stmt()?;
      return Ok(Node::new(NodeKind::For {
        init: None, cond: Some(Box::new(cond)), inc: None, body: Box::new(body),
      }, tok))
    }

    if self.at("do") {
      let tok = self.bump();
      let body = self.stmt()?;
      self.skip("while")?;
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;
      self.skip(";")?;
      return Ok(Node::new(NodeKind::Do { body: Box::new(body), cond: Box::new(cond) }, tok))
    }

    if self.at("break") {
      let tok = self.bump();
      self.skip(";")?;
      return Ok(Node::new(NodeKind::Break, tok))
    }

    if self.at("continue") {
      let tok = self.bump();
      self.skip(";")?;
      return Ok(Node::new(NodeKind::Continue, tok))
    }

    if self.at("goto") {
      let tok = self.bump();
      let label = Self::get_ident(self.cur())?;
      self.bump();
      self.skip(";")?;
      return Ok(Node::new(NodeKind::Goto(label), tok))
    }

    if self.cur().is_ident() && self.peek(1).is(":") {
      let tok = self.bump();
      let name = intern(tok.text());
      self.bump();
      let body = self.stmt()?;
      return Ok(Node::new(NodeKind::Label { name, body: Box::new(body) }, tok))
    }

    if self.at("{") {
      self.bump();
      return self.compound_stmt()
    }

    self.expr_stmt()
  }

  /// compound-stmt = (declaration | stmt)* "}"
  fn compound_stmt(&mut self) -> Result<Node> {
    let tok = self.tok();
    let mut body = vec![];

    self.enter_scope();
    while !self.at("}") {
      if self.cur().is_eof() {
        return Err(self.cur().error("expected '}'"))
      }
      let mut node = if self.is_typename(self.cur()) {
        self.declaration()?
      } else {
        self.stmt()?
      };
      self.add_type(&mut node)?;
      body.push(node);
    }
    self.leave_scope();

    self.bump();
    Ok(Node::new(NodeKind::Block(body), tok))
  }

  /// expr-stmt = expr? ";"
  fn expr_stmt(&mut self) -> Result<Node> {
    if self.at(";") {
      let tok = self.bump();
      return Ok(Node::new(NodeKind::Block(vec![]), tok))
    }

    let tok = self.tok();
    let expr = self.expr()?;
    self.skip(";")?;
    Ok(Node::new(NodeKind::ExprStmt(Box::new(expr)), tok))
  }

  // ---------------------------------------------------------------------
  // Expressions

  /// expr = assign ("," expr)?
  fn expr(&mut self) -> Result<Node> {
    let node = self.assign()?;

    if self.at(",") {
      let tok = self.bump();
      let rhs = self.expr()?;
      return Ok(Node::new(NodeKind::Comma { lhs: Box::new(node), rhs: Box::new(rhs) }, tok))
    }
    Ok(node)
  }

  /// Convert `A op= B` to `tmp = &A, *tmp = *tmp op B` where `tmp` is a
  /// fresh pointer temporary, so `A` is evaluated once.
  fn to_assign(&mut self, mut binary: Node) -> Result<Node> {
    let NodeKind::Binary { op, lhs, rhs } = binary.kind else { unreachable!("binary node") };
    let tok = binary.tok.clone();
    let mut lhs = *lhs;
    let mut rhs = *rhs;
    self.add_type(&mut lhs)?;
    self.add_type(&mut rhs)?;

    let ptr_ty = self.types.pointer_to(lhs.ty());
    let var = self.new_lvar(intern(""), ptr_ty);

    // tmp = &A
    let expr1 = Node::new(NodeKind::Assign {
      lhs: Box::new(Self::new_var_node(var, tok.clone())),
      rhs: Box::new(Node::new(NodeKind::Addr(Box::new(lhs)), tok.clone())),
      is_init: false,
    }, tok.clone());

    // *tmp = *tmp op B
    let deref1 = Node::new(
      NodeKind::Deref(Box::new(Self::new_var_node(var, tok.clone()))), tok.clone());
    let deref2 = Node::new(
      NodeKind::Deref(Box::new(Self::new_var_node(var, tok.clone()))), tok.clone());
    let expr2 = Node::new(NodeKind::Assign {
      lhs: Box::new(deref1),
      rhs: Box::new(Self::new_binary(op, deref2, rhs, tok.clone())),
      is_init: false,
    }, tok.clone());

    binary = Node::new(NodeKind::Comma {
      lhs: Box::new(expr1), rhs: Box::new(expr2),
    }, tok);
    Ok(binary)
  }

  /// assign    = conditional (assign-op assign)?
  /// assign-op = "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "&=" | "|=" | "^="
  ///           | "<<=" | ">>="
  fn assign(&mut self) -> Result<Node> {
    let node = self.conditional()?;

    if self.at("=") {
      let tok = self.bump();
      let rhs = self.assign()?;
      return Ok(Node::new(NodeKind::Assign {
        lhs: Box::new(node), rhs: Box::new(rhs), is_init: false,
      }, tok))
    }

    const OPS: &[(&str, BinOp)] = &[
      ("*=", BinOp::Mul), ("/=", BinOp::Div), ("%=", BinOp::Mod),
      ("&=", BinOp::BitAnd), ("|=", BinOp::BitOr), ("^=", BinOp::BitXor),
      ("<<=", BinOp::Shl), (">>=", BinOp::Shr),
    ];

    if self.at("+=") {
      let tok = self.bump();
      let rhs = self.assign()?;
      let sum = self.new_add(node, rhs, tok)?;
      return self.to_assign(sum)
    }
    if self.at("-=") {
      let tok = self.bump();
      let rhs = self.assign()?;
      let diff = self.new_sub(node, rhs, tok)?;
      return self.to_assign(diff)
    }
    for &(s, op) in OPS {
      if self.at(s) {
        let tok = self.bump();
        let rhs = self.assign()?;
        return self.to_assign(Self::new_binary(op, node, rhs, tok))
      }
    }

    Ok(node)
  }

  /// conditional = logor ("?" expr ":" conditional)?
  fn conditional(&mut self) -> Result<Node> {
    let node = self.logor()?;

    if !self.at("?") {
      return Ok(node)
    }
    let tok = self.bump();
    let then = self.expr()?;
    self.skip(":")?;
    let els = self.conditional()?;
    Ok(Node::new(NodeKind::Cond {
      cond: Box::new(node), then: Box::new(then), els: Box::new(els),
    }, tok))
  }

  /// logor = logand ("||" logand)*
  fn logor(&mut self) -> Result<Node> {
    let mut node = self.logand()?;
    while self.at("||") {
      let tok = self.bump();
      let rhs = self.logand()?;
      node = Node::new(NodeKind::LogOr { lhs: Box::new(node), rhs: Box::new(rhs) }, tok);
    }
    Ok(node)
  }

  /// logand = bitor ("&&" bitor)*
  fn logand(&mut self) -> Result<Node> {
    let mut node = self.bitor()?;
    while self.at("&&") {
      let tok = self.bump();
      let rhs = self.bitor()?;
      node = Node::new(NodeKind::LogAnd { lhs: Box::new(node), rhs: Box::new(rhs) }, tok);
    }
    Ok(node)
  }

  /// bitor = bitxor ("|" bitxor)*
  fn bitor(&mut self) -> Result<Node> {
    let mut node = self.bitxor()?;
    while self.at("|") {
      let tok = self.bump();
      let rhs = self.bitxor()?;
      node = Self::new_binary(BinOp::BitOr, node, rhs, tok);
    }
    Ok(node)
  }

  /// bitxor = bitand ("^" bitand)*
  fn bitxor(&mut self) -> Result<Node> {
    let mut node = self.bitand()?;
    while self.at("^") {
      let tok = self.bump();
      let rhs = self.bitand()?;
      node = Self::new_binary(BinOp::BitXor, node, rhs, tok);
    }
    Ok(node)
  }

  /// bitand = equality ("&" equality)*
  fn bitand(&mut self) -> Result<Node> {
    let mut node = self.equality()?;
    while self.at("&") {
      let tok = self.bump();
      let rhs = self.equality()?;
      node = Self::new_binary(BinOp::BitAnd, node, rhs, tok);
    }
    Ok(node)
  }

  /// equality = relational ("==" relational | "!=" relational)*
  fn equality(&mut self) -> Result<Node> {
    let mut node = self.relational()?;
    loop {
      if self.at("==") {
        let tok = self.bump();
        let rhs = self.relational()?;
        node = Self::new_binary(BinOp::Eq, node, rhs, tok);
      } else if self.at("!=") {
        let tok = self.bump();
        let rhs = self.relational()?;
        node = Self::new_binary(BinOp::Ne, node, rhs, tok);
      } else {
        return Ok(node)
      }
    }
  }

  /// relational = shift ("<" shift | "<=" shift | ">" shift | ">=" shift)*
  fn relational(&mut self) -> Result<Node> {
    let mut node = self.shift()?;
    loop {
      if self.at("<") {
        let tok = self.bump();
        let rhs = self.shift()?;
        node = Self::new_binary(BinOp::Lt, node, rhs, tok);
      } else if self.at("<=") {
        let tok = self.bump();
        let rhs = self.shift()?;
        node = Self::new_binary(BinOp::Le, node, rhs, tok);
      } else if self.at(">") {
        let tok = self.bump();
        let lhs = self.shift()?;
        node = Self::new_binary(BinOp::Lt, lhs, node, tok);
      } else if self.at(">=") {
        let tok = self.bump();
        let lhs = self.shift()?;
        node = Self::new_binary(BinOp::Le, lhs, node, tok);
      } else {
        return Ok(node)
      }
    }
  }

  /// shift = add ("<<" add | ">>" add)*
  fn shift(&mut self) -> Result<Node> {
    let mut node = self.add()?;
    loop {
      if self.at("<<") {
        let tok = self.bump();
        let rhs = self.add()?;
        node = Self::new_binary(BinOp::Shl, node, rhs, tok);
      } else if self.at(">>") {
        let tok = self.bump();
        let rhs = self.add()?;
        node = Self::new_binary(BinOp::Shr, node, rhs, tok);
      } else {
        return Ok(node)
      }
    }
  }

  /// `+` with the pointer arithmetic rules: `p + n` scales `n` by the
  /// element size; a pointer is canonicalized to the left operand.
  fn new_add(&mut self, mut lhs: Node, mut rhs: Node, tok: Token) -> Result<Node> {
    self.add_type(&mut lhs)?;
    self.add_type(&mut rhs)?;

    if self.types.is_numeric(lhs.ty()) && self.types.is_numeric(rhs.ty()) {
      return Ok(Self::new_binary(BinOp::Add, lhs, rhs, tok))
    }

    let lbase = self.types.base(lhs.ty());
    let rbase = self.types.base(rhs.ty());
    if lbase.is_some() && rbase.is_some() {
      return Err(tok.error("invalid operands"))
    }

    // Canonicalize `num + ptr` to `ptr + num`.
    if lbase.is_none() && rbase.is_some() {
      std::mem::swap(&mut lhs, &mut rhs);
    }

    let base = self.types.base(lhs.ty()).expect("pointer operand");
    if self.types[base].is_incomplete {
      return Err(tok.error("invalid use of an incomplete type"))
    }
    let size = self.types.size(base);
    let rhs = Self::new_binary(BinOp::Mul, rhs, Self::new_num(size, tok.clone()), tok.clone());
    Ok(Self::new_binary(BinOp::Add, lhs, rhs, tok))
  }

  /// `-` with the pointer rules: `p - n` scales, `p - q` divides the byte
  /// difference by the element size.
  fn new_sub(&mut self, mut lhs: Node, mut rhs: Node, tok: Token) -> Result<Node> {
    self.add_type(&mut lhs)?;
    self.add_type(&mut rhs)?;

    if self.types.is_numeric(lhs.ty()) && self.types.is_numeric(rhs.ty()) {
      return Ok(Self::new_binary(BinOp::Sub, lhs, rhs, tok))
    }

    let lbase = self.types.base(lhs.ty());
    let rbase = self.types.base(rhs.ty());

    if let Some(base) = lbase {
      if self.types[base].is_incomplete {
        return Err(tok.error("invalid use of an incomplete type"))
      }
      let size = self.types.size(base);
      if rbase.is_none() && self.types.is_integer(rhs.ty()) {
        let rhs =
          Self::new_binary(BinOp::Mul, rhs, Self::new_num(size, tok.clone()), tok.clone());
        return Ok(Self::new_binary(BinOp::Sub, lhs, rhs, tok))
      }
      if rbase.is_some() {
        let diff = Self::new_binary(BinOp::Sub, lhs, rhs, tok.clone());
        return Ok(Self::new_binary(
          BinOp::Div, diff, Self::new_num(size, tok.clone()), tok))
      }
    }

    Err(tok.error("invalid operands"))
  }

  /// add = mul ("+" mul | "-" mul)*
  fn add(&mut self) -> Result<Node> {
    let mut node = self.mul()?;
    loop {
      if self.at("+") {
        let tok = self.bump();
        let rhs = self.mul()?;
        node = self.new_add(node, rhs, tok)?;
      } else if self.at("-") {
        let tok = self.bump();
        let rhs = self.mul()?;
        node = self.new_sub(node, rhs, tok)?;
      } else {
        return Ok(node)
      }
    }
  }

  /// mul = cast ("*" cast | "/" cast | "%" cast)*
  fn mul(&mut self) -> Result<Node> {
    let mut node = self.cast()?;
    loop {
      let op = if self.at("*") { BinOp::Mul }
        else if self.at("/") { BinOp::Div }
        else if self.at("%") { BinOp::Mod }
        else { return Ok(node) };
      let tok = self.bump();
      let rhs = self.cast()?;
      node = Self::new_binary(op, node, rhs, tok);
    }
  }

  /// compound-literal = initializer "}"
  fn compound_literal(&mut self, ty: Ty, start: Token) -> Result<Node> {
    if self.scope_depth == 0 {
      let name = self.new_unique_name();
      let var = self.new_gvar(name, ty, true, true);
      self.gvar_initializer(var)?;
      return Ok(Self::new_var_node(var, start))
    }

    let name = self.new_unique_name();
    let var = self.new_lvar(name, ty);
    let lhs = self.lvar_initializer(var)?;
    let rhs = Self::new_var_node(var, start.clone());
    Ok(Node::new(NodeKind::Comma { lhs: Box::new(lhs), rhs: Box::new(rhs) }, start))
  }

  /// cast = "(" type-name ")" "{" compound-literal
  ///      | "(" type-name ")" cast
  ///      | unary
  fn cast(&mut self) -> Result<Node> {
    if_chain! {
      if self.at("(");
      if self.is_typename(self.peek(1));
      then {
        let start = self.bump();
        let ty = self.typename()?;
        self.skip(")")?;

        if self.at("{") {
          return self.compound_literal(ty, start)
        }

        let expr = self.cast()?;
        let mut node = self.new_cast(expr, ty)?;
        node.tok = start;
        return Ok(node)
      }
    }
    self.unary()
  }

  /// Convert `A++` to `tmp = &A, *tmp = *tmp + 1, *tmp - 1`.
  fn new_inc_dec(&mut self, mut node: Node, tok: Token, addend: i64) -> Result<Node> {
    self.add_type(&mut node)?;
    let ptr_ty = self.types.pointer_to(node.ty());
    let var = self.new_lvar(intern(""), ptr_ty);

    let expr1 = Node::new(NodeKind::Assign {
      lhs: Box::new(Self::new_var_node(var, tok.clone())),
      rhs: Box::new(Node::new(NodeKind::Addr(Box::new(node)), tok.clone())),
      is_init: false,
    }, tok.clone());

    let deref = |var, tok: &Token| Node::new(
      NodeKind::Deref(Box::new(Self::new_var_node(var, tok.clone()))), tok.clone());

    let incremented =
      self.new_add(deref(var, &tok), Self::new_num(addend, tok.clone()), tok.clone())?;
    let expr2 = Node::new(NodeKind::Assign {
      lhs: Box::new(deref(var, &tok)),
      rhs: Box::new(incremented),
      is_init: false,
    }, tok.clone());

    let expr3 =
      self.new_add(deref(var, &tok), Self::new_num(-addend, tok.clone()), tok.clone())?;

    let inner = Node::new(NodeKind::Comma {
      lhs: Box::new(expr2), rhs: Box::new(expr3),
    }, tok.clone());
    Ok(Node::new(NodeKind::Comma { lhs: Box::new(expr1), rhs: Box::new(inner) }, tok))
  }

  /// unary = ("+" | "-" | "&" | "*" | "!" | "~") cast
  ///       | ("++" | "--") unary
  ///       | postfix
  fn unary(&mut self) -> Result<Node> {
    if self.at("+") {
      self.bump();
      return self.cast()
    }
    if self.at("-") {
      let tok = self.bump();
      let operand = self.cast()?;
      return Ok(Self::new_binary(BinOp::Sub, Self::new_num(0, tok.clone()), operand, tok))
    }
    if self.at("&") {
      let tok = self.bump();
      let operand = self.cast()?;
      return Ok(Node::new(NodeKind::Addr(Box::new(operand)), tok))
    }
    if self.at("*") {
      let tok = self.bump();
      let operand = self.cast()?;
      return Ok(Node::new(NodeKind::Deref(Box::new(operand)), tok))
    }
    if self.at("!") {
      let tok = self.bump();
      let operand = self.cast()?;
      return Ok(Node::new(NodeKind::Not(Box::new(operand)), tok))
    }
    if self.at("~") {
      let tok = self.bump();
      let operand = self.cast()?;
      return Ok(Node::new(NodeKind::BitNot(Box::new(operand)), tok))
    }

    // ++i is i += 1, --i is i -= 1.
    if self.at("++") {
      let tok = self.bump();
      let operand = self.unary()?;
      let sum = self.new_add(operand, Self::new_num(1, tok.clone()), tok)?;
      return self.to_assign(sum)
    }
    if self.at("--") {
      let tok = self.bump();
      let operand = self.unary()?;
      let diff = self.new_sub(operand, Self::new_num(1, tok.clone()), tok)?;
      return self.to_assign(diff)
    }

    self.postfix()
  }

  /// Find a member, descending through anonymous nested structs.
  fn get_struct_member(&self, ty: Ty, tok: &Token) -> Option<Member> {
    let TyKind::Struct { members, .. } = &self.types[ty].kind else { return None };
    let name = intern(tok.text());
    for mem in members {
      if mem.name.is_none() && self.types.is_struct(mem.ty) {
        if self.get_struct_member(mem.ty, tok).is_some() {
          return Some(mem.clone())
        }
        continue
      }
      if mem.name == Some(name) {
        return Some(mem.clone())
      }
    }
    None
  }

  /// Build `x.m`, resolving members of anonymous nested structs: in
  /// `struct { struct { int a; }; int b; } x;` the inner member is
  /// reachable as `x.a`.
  fn struct_ref(&mut self, mut node: Node, tok: &Token) -> Result<Node> {
    self.add_type(&mut node)?;
    if !self.types.is_struct(node.ty()) {
      return Err(node.tok.error("not a struct"))
    }

    let mut ty = node.ty();
    loop {
      let Some(mem) = self.get_struct_member(ty, tok) else {
        return Err(tok.error("no such member"))
      };
      let named = mem.name.is_some();
      ty = mem.ty;
      node = Node::new(NodeKind::Member { base: Box::new(node), member: mem }, tok.clone());
      if named {
        return Ok(node)
      }
    }
  }

  /// postfix = primary ("[" expr "]" | "(" func-args ")" | "." ident
  ///                    | "->" ident | "++" | "--")*
  fn postfix(&mut self) -> Result<Node> {
    let mut node = self.primary()?;

    loop {
      if self.at("(") {
        self.bump();
        node = self.funcall(node)?;
        continue
      }

      if self.at("[") {
        // x[y] is short for *(x+y).
        let start = self.bump();
        let idx = self.expr()?;
        self.skip("]")?;
        let sum = self.new_add(node, idx, start.clone())?;
        node = Node::new(NodeKind::Deref(Box::new(sum)), start);
        continue
      }

      if self.at(".") {
        self.bump();
        let tok = self.bump();
        node = self.struct_ref(node, &tok)?;
        continue
      }

      if self.at("->") {
        // x->y is short for (*x).y.
        let arrow = self.bump();
        node = Node::new(NodeKind::Deref(Box::new(node)), arrow);
        let tok = self.bump();
        node = self.struct_ref(node, &tok)?;
        continue
      }

      if self.at("++") {
        let tok = self.bump();
        node = self.new_inc_dec(node, tok, 1)?;
        continue
      }

      if self.at("--") {
        let tok = self.bump();
        node = self.new_inc_dec(node, tok, -1)?;
        continue
      }

      return Ok(node)
    }
  }

  /// funcall = (assign ("," assign)*)? ")"
  ///
  /// `foo(a, b)` compiles to `(t1 = a, t2 = b, foo(t1, t2))` with fresh
  /// temporaries, so argument evaluation is complete before the register
  /// shuffle of the call itself.
  fn funcall(&mut self, mut fnode: Node) -> Result<Node> {
    self.add_type(&mut fnode)?;
    let fn_ty = fnode.ty();

    let func_ty = match self.types[fn_ty].kind {
      TyKind::Func { .. } => fn_ty,
      TyKind::Ptr { base } if self.types.is_func(base) => base,
      _ => return Err(fnode.tok.error("not a function")),
    };

    let TyKind::Func { return_ty, params, .. } = &self.types[func_ty].kind
      else { unreachable!() };
    let return_ty = *return_ty;
    let params = params.clone();
    let mut param_iter = params.iter();

    let tok = self.tok();
    let mut node = Node::new(NodeKind::NullExpr, tok.clone());
    let mut args: SmallVec<[VarId; 6]> = SmallVec::new();

    while !self.at(")") {
      if !args.is_empty() {
        self.skip(",")?;
      }

      let mut arg = self.assign()?;
      self.add_type(&mut arg)?;

      if let Some(param) = param_iter.next() {
        if self.types.is_struct(param.ty) {
          return Err(arg.tok.error("passing a struct by value is not supported"))
        }
        arg = self.new_cast(arg, param.ty)?;
      } else if matches!(self.types[arg.ty()].kind, TyKind::Float) {
        // Variadic arguments undergo the default float promotion.
        arg = self.new_cast(arg, Ty::DOUBLE)?;
      }
      if self.types.is_struct(arg.ty()) {
        return Err(arg.tok.error("passing a struct by value is not supported"))
      }

      let var_ty = match self.types.base(arg.ty()) {
        Some(base) if !self.types.is_ptr(arg.ty()) => self.types.pointer_to(base),
        _ => arg.ty(),
      };
      let var = self.new_lvar(intern(""), var_ty);
      args.push(var);

      let assign = Node::new(NodeKind::Assign {
        lhs: Box::new(Self::new_var_node(var, tok.clone())),
        rhs: Box::new(arg),
        is_init: false,
      }, tok.clone());
      node = Node::new(NodeKind::Comma {
        lhs: Box::new(node), rhs: Box::new(assign),
      }, tok.clone());
    }
    self.skip(")")?;

    if self.types.is_struct(return_ty) {
      return Err(tok.error("returning a struct by value is not supported"))
    }

    let mut call = Node::new(NodeKind::Funcall {
      func: Box::new(fnode), func_ty, args,
    }, tok.clone());
    call.ty = Some(return_ty);

    let mut node = Node::new(NodeKind::Comma {
      lhs: Box::new(node), rhs: Box::new(call),
    }, tok);
    self.add_type(&mut node)?;
    Ok(node)
  }

  /// primary = "(" "{" compound-stmt ")" | "(" expr ")"
  ///         | "sizeof" "(" type-name ")" | "sizeof" unary
  ///         | "_Alignof" "(" type-name ")" | ident | str | num
  fn primary(&mut self) -> Result<Node> {
    if self.at("(") && self.peek(1).is("{") {
      // A GNU statement expression.
      let tok = self.bump();
      self.bump();
      let block = self.compound_stmt()?;
      let NodeKind::Block(body) = block.kind else { unreachable!() };
      self.skip(")")?;
      let mut node = Node::new(NodeKind::StmtExpr(body), tok);
      self.add_type(&mut node)?;
      return Ok(node)
    }

    if self.at("(") {
      self.bump();
      let node = self.expr()?;
      self.skip(")")?;
      return Ok(node)
    }

    if self.at("sizeof") && self.peek(1).is("(") && self.is_typename(self.peek(2)) {
      let tok = self.bump();
      self.bump();
      let ty = self.typename()?;
      self.skip(")")?;
      if self.types[ty].is_incomplete {
        return Err(tok.error("invalid use of an incomplete type"))
      }
      return Ok(Self::new_ulong(self.types.size(ty), tok))
    }

    if self.at("sizeof") {
      let tok = self.bump();
      let mut node = self.unary()?;
      self.add_type(&mut node)?;
      if self.types[node.ty()].is_incomplete {
        return Err(tok.error("invalid use of an incomplete type"))
      }
      return Ok(Self::new_ulong(self.types.size(node.ty()), tok))
    }

    if self.at("_Alignof") {
      let tok = self.bump();
      self.skip("(")?;
      let ty = self.typename()?;
      self.skip(")")?;
      return Ok(Self::new_ulong(self.types.align(ty), tok))
    }

    if self.cur().is_ident() {
      let tok = self.bump();

      if let Some(entry) = self.find_var(&tok) {
        match *entry {
          ScopeEntry::Var(var) => return Ok(Self::new_var_node(var, tok)),
          ScopeEntry::EnumConst(val) => return Ok(Self::new_num(val, tok)),
          ScopeEntry::Typedef(_) => return Err(tok.error("unexpected type name")),
        }
      }

      if self.at("(") {
        // An implicit function declaration gets type int(...).
        tok.warn("implicit declaration of a function");
        let name = intern(tok.text());
        let fty = self.types.func_type(Ty::INT);
        let var = self.new_gvar(name, fty, true, false);
        return Ok(Self::new_var_node(var, tok))
      }

      return Err(tok.error("undefined variable"))
    }

    if let TokenKind::Str { bytes, elem } = &self.cur().kind {
      let (bytes, elem) = (bytes.clone(), *elem);
      let tok = self.bump();
      let var = self.new_string_literal(&bytes, elem);
      return Ok(Self::new_var_node(var, tok))
    }

    let TokenKind::Num(lit) = self.cur().kind else {
      return Err(self.cur().error("expected an expression"))
    };
    let tok = self.bump();
    Ok(match lit {
      NumLit::Int { val, ty } => {
        let mut node = Self::new_num(val, tok);
        node.ty = Some(ty);
        node
      }
      NumLit::Float { val, ty } => {
        let mut node = Node::new(NodeKind::Float(val), tok);
        node.ty = Some(ty);
        node
      }
    })
  }

  // ---------------------------------------------------------------------
  // Top level

  /// Define `__func__` as a static character array holding the enclosing
  /// function's name.
  fn add_func_ident(&mut self, name: Symbol) {
    let mut bytes = name.as_str().as_bytes().to_vec();
    bytes.push(0);
    let var = self.new_string_literal(&bytes, 1);
    self.push_scope(intern("__func__"), ScopeEntry::Var(var));
  }

  /// funcdef = typespec declarator compound-stmt
  fn funcdef(&mut self, decl: &Decl, attr: &VarAttr) -> Result<Function> {
    self.locals = vec![];

    let Some(name_tok) = &decl.name else {
      return Err(decl.name_pos.error("function name omitted"))
    };
    let name = intern(name_tok.text());

    let TyKind::Func { return_ty, params, is_variadic } = &self.types[decl.ty].kind
      else { unreachable!("function type") };
    let return_ty = *return_ty;
    let is_variadic = *is_variadic;
    let params = params.clone();

    if self.types.is_struct(return_ty) {
      return Err(name_tok.error("returning a struct by value is not supported"))
    }

    self.enter_scope();
    for param in &params {
      let Some(pname) = param.name else {
        return Err(name_tok.error("parameter name omitted"))
      };
      self.new_lvar(pname, param.ty);
    }
    let param_vars = self.locals.clone();

    self.skip("{")?;
    self.current_ret = Some(return_ty);
    self.add_func_ident(name);
    let mut body = self.compound_stmt()?;
    self.add_type(&mut body)?;
    self.current_ret = None;
    self.leave_scope();

    Ok(Function {
      name,
      params: param_vars,
      is_static: attr.is_static,
      is_variadic,
      body,
      locals: std::mem::take(&mut self.locals),
      stack_size: 0,
    })
  }

  /// program = (typedef | funcdef | gvar-decl)*
  fn program(mut self) -> Result<Program> {
    // The built-in variadic primitive is visible in every program.
    let va_ty = self.types.func_type(Ty::VOID);
    self.new_gvar(intern("__builtin_va_start"), va_ty, true, false);

    while !self.cur().is_eof() {
      let mut attr = VarAttr::default();
      let basety = self.typespec(Some(&mut attr))?;
      if self.consume(";") {
        continue
      }
      let mut decl = self.declarator(basety)?;

      // Typedef.
      if attr.is_typedef {
        loop {
          let Some(name) = &decl.name else {
            return Err(decl.name_pos.error("typedef name omitted"))
          };
          self.push_scope(intern(name.text()), ScopeEntry::Typedef(decl.ty));
          if self.consume(";") {
            break
          }
          self.skip(",")?;
          decl = self.declarator(basety)?;
        }
        continue
      }

      // Function.
      if self.types.is_func(decl.ty) {
        let Some(name) = &decl.name else {
          return Err(decl.name_pos.error("function name omitted"))
        };
        self.new_gvar(intern(name.text()), decl.ty, attr.is_static, false);
        if !self.consume(";") {
          let f = self.funcdef(&decl, &attr)?;
          self.fns.push(f);
        }
        continue
      }

      // Global variable.
      loop {
        let Some(name) = &decl.name else {
          return Err(decl.name_pos.error("variable name omitted"))
        };
        let var = self.new_gvar(
          intern(name.text()), decl.ty, attr.is_static, !attr.is_extern);
        if attr.align != 0 {
          self.vars[var].align = attr.align;
        }

        if self.consume("=") {
          self.gvar_initializer(var)?;
        }
        if !attr.is_extern && self.types[self.vars[var].ty].is_incomplete {
          return Err(name.error("variable has incomplete type"))
        }

        if self.consume(";") {
          break
        }
        self.skip(",")?;
        decl = self.declarator(basety)?;
      }
    }

    Ok(Program {
      types: self.types,
      vars: self.vars,
      globals: self.globals,
      fns: self.fns,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tokenize::{convert_keywords, convert_pp_tokens, tokenize_text};

  fn parse_src(src: &str) -> Program {
    let mut toks = tokenize_text("test.c", 1, src).expect("tokenize");
    convert_pp_tokens(&mut toks).expect("numbers");
    convert_keywords(&mut toks);
    parse(toks).expect("parse")
  }

  fn global<'a>(prog: &'a Program, name: &str) -> &'a VarData {
    let name = intern(name);
    prog.globals.iter().map(|&v| &prog.vars[v]).find(|v| v.name == name)
      .expect("global not found")
  }

  #[test]
  fn constant_folding_in_global_init() {
    let prog = parse_src("int x = 3 * 4 + 1; long y = 1 << 40;");
    assert_eq!(global(&prog, "x").init_data.as_deref(), Some(&13i32.to_le_bytes()[..]));
    assert_eq!(global(&prog, "y").init_data.as_deref(), Some(&(1i64 << 40).to_le_bytes()[..]));
  }

  #[test]
  fn pointer_initializer_produces_relocation() {
    let prog = parse_src("int g = 5; int *p = &g; int *q = &g + 3;");
    let p = global(&prog, "p");
    assert_eq!(p.rel, vec![Relocation { offset: 0, label: intern("g"), addend: 0 }]);
    // &g + 3 scales by sizeof(int).
    let q = global(&prog, "q");
    assert_eq!(q.rel, vec![Relocation { offset: 0, label: intern("g"), addend: 12 }]);
  }

  #[test]
  fn string_initializer_boundaries() {
    // Exactly sized: fills {a, b, 0}. Oversized: drops the terminator.
    let prog = parse_src("char x[3] = \"ab\"; char y[3] = \"abcd\";");
    assert_eq!(global(&prog, "x").init_data.as_deref(), Some(&b"ab\0"[..]));
    assert_eq!(global(&prog, "y").init_data.as_deref(), Some(&b"abc"[..]));
  }

  #[test]
  fn array_length_inference() {
    let prog = parse_src("int a[] = {1, 2, 3}; char s[] = \"hi\";");
    let a = global(&prog, "a");
    assert_eq!(prog.types.size(a.ty), 12);
    let s = global(&prog, "s");
    assert_eq!(prog.types.size(s.ty), 3);
    assert_eq!(s.init_data.as_deref(), Some(&b"hi\0"[..]));
  }

  #[test]
  fn struct_layout() {
    let prog = parse_src("struct S { char c; int i; char d; } s;\
                          int sz = sizeof(struct S); int al = _Alignof(struct S);");
    assert_eq!(global(&prog, "sz").init_data.as_deref(), Some(&12i32.to_le_bytes()[..]));
    assert_eq!(global(&prog, "al").init_data.as_deref(), Some(&4i32.to_le_bytes()[..]));
  }

  #[test]
  fn union_layout() {
    let prog = parse_src("union U { char c[5]; int i; } u; int sz = sizeof(union U);");
    assert_eq!(global(&prog, "sz").init_data.as_deref(), Some(&8i32.to_le_bytes()[..]));
  }

  #[test]
  fn bitfield_layout_packs_words() {
    let prog = parse_src("struct B { int a : 3; int b : 5; int c : 30; } b;\
                          int sz = sizeof(struct B);");
    // a and b share the first word; c does not fit and starts a new one.
    assert_eq!(global(&prog, "sz").init_data.as_deref(), Some(&8i32.to_le_bytes()[..]));
  }

  #[test]
  fn bitfield_global_initializer() {
    let prog = parse_src("struct B { int a : 3; int b : 5; } x = { 5, 9 };");
    let x = global(&prog, "x");
    // 5 in bits 0..3, 9 in bits 3..8.
    assert_eq!(x.init_data.as_deref().map(|b| b[0]), Some(5 | (9 << 3)));
  }

  #[test]
  fn enum_constants() {
    let prog = parse_src("enum E { A, B = 5, C }; int x = C;");
    assert_eq!(global(&prog, "x").init_data.as_deref(), Some(&6i32.to_le_bytes()[..]));
  }

  #[test]
  fn sizeof_matches_layout() {
    let prog = parse_src(
      "int a = sizeof(int[10]); int b = sizeof(char *); int c = sizeof(long);");
    assert_eq!(global(&prog, "a").init_data.as_deref(), Some(&40i32.to_le_bytes()[..]));
    assert_eq!(global(&prog, "b").init_data.as_deref(), Some(&8i32.to_le_bytes()[..]));
    assert_eq!(global(&prog, "c").init_data.as_deref(), Some(&8i32.to_le_bytes()[..]));
  }

  #[test]
  fn nested_declarator_binds_inside_out() {
    // int (*x)[3] is a pointer to an array, so sizeof(*x) is 12.
    let prog = parse_src("int (*x)[3]; int sz = sizeof(*x);");
    assert_eq!(global(&prog, "sz").init_data.as_deref(), Some(&12i32.to_le_bytes()[..]));
  }

  #[test]
  fn ternary_and_comparisons_fold() {
    let prog = parse_src("int x = 1 < 2 ? 10 : 20; int y = (3 == 3) + (4 != 4);");
    assert_eq!(global(&prog, "x").init_data.as_deref(), Some(&10i32.to_le_bytes()[..]));
    assert_eq!(global(&prog, "y").init_data.as_deref(), Some(&1i32.to_le_bytes()[..]));
  }

  #[test]
  fn double_global_image() {
    let prog = parse_src("double d = 1.5;");
    assert_eq!(global(&prog, "d").init_data.as_deref(), Some(&1.5f64.to_le_bytes()[..]));
  }

  #[test]
  fn undefined_variable_is_an_error() {
    let mut toks = tokenize_text("t.c", 1, "int main() { return x; }").expect("tokenize");
    convert_pp_tokens(&mut toks).expect("numbers");
    convert_keywords(&mut toks);
    assert!(parse(toks).is_err());
  }

  #[test]
  fn const_assignment_allowed_only_for_init() {
    // Parsing succeeds; the const check fires in the back-end.
    let prog = parse_src("int main() { const int x = 1; return x; }");
    assert_eq!(prog.fns.len(), 1);
  }

  #[test]
  fn const_expr_tokens_for_preprocessor() {
    let mut toks = tokenize_text("t.c", 1, "1 + 2 * 3").expect("tokenize");
    convert_pp_tokens(&mut toks).expect("numbers");
    assert_eq!(const_expr_tokens(&toks).expect("eval"), 7);
    let mut toks = tokenize_text("t.c", 1, "(1 ? 6 : 9) == 6").expect("tokenize");
    convert_pp_tokens(&mut toks).expect("numbers");
    assert_eq!(const_expr_tokens(&toks).expect("eval"), 1);
  }
}
