//! The abstract syntax tree produced by the parser, plus variables,
//! functions and the program container handed to the back-end.

use smallvec::SmallVec;

use crate::symbol::Symbol;
use crate::tokenize::Token;
use crate::types::IdxVec;
use crate::types::mk_id;
use crate::types::ty::{Member, Ty, TyArena};

mk_id! {
  /// A handle to a variable in the program-wide variable arena.
  VarId
}

/// A named storage object: a local (frame slot) or a global (symbol).
#[derive(Clone, Debug)]
pub struct VarData {
  pub name: Symbol,
  pub ty: Ty,
  pub is_local: bool,
  pub align: i64,
  /// For locals: the frame offset; the variable lives at `-offset(%rbp)`.
  /// Assigned by the back-end's layout pass.
  pub offset: i64,
  /// For globals: `static` linkage (no `.globl` directive).
  pub is_static: bool,
  /// For globals: the initializer image. `None` places the variable in
  /// `.bss`.
  pub init_data: Option<Vec<u8>>,
  /// Address-valued initializer entries, by increasing offset; each
  /// replaces 8 bytes of `init_data` with `.quad label+addend`.
  pub rel: Vec<Relocation>,
}

/// An entry in a global's initializer referring to another global's
/// address, resolved at link time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
  pub offset: i64,
  pub label: Symbol,
  pub addend: i64,
}

/// Binary operators that share the emit-lhs/emit-rhs/combine shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
  Add, Sub, Mul, Div, Mod,
  BitAnd, BitOr, BitXor, Shl, Shr,
  Eq, Ne, Lt, Le,
}

impl BinOp {
  /// Operators whose operands undergo the usual arithmetic conversion.
  #[must_use] pub fn is_arith(self) -> bool {
    use BinOp::*;
    matches!(self, Add | Sub | Mul | Div | Mod | BitAnd | BitOr | BitXor)
  }

  /// Comparison operators; the result has type `int`.
  #[must_use] pub fn is_cmp(self) -> bool {
    matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le)
  }
}

/// A `case`/`default` label inside a `switch`, with the id of its emitted
/// label (`.L.case.<id>`).
#[derive(Clone, Copy, Debug)]
pub struct CaseLabel {
  pub val: i64,
  pub id: u32,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
  // Expressions
  Binary { op: BinOp, lhs: Box<Node>, rhs: Box<Node> },
  /// Unary `&`.
  Addr(Box<Node>),
  /// Unary `*`.
  Deref(Box<Node>),
  /// `!`.
  Not(Box<Node>),
  /// `~`.
  BitNot(Box<Node>),
  LogAnd { lhs: Box<Node>, rhs: Box<Node> },
  LogOr { lhs: Box<Node>, rhs: Box<Node> },
  /// `lhs = rhs`. `is_init` marks assignments synthesized from an
  /// initializer, which may write `const` objects.
  Assign { lhs: Box<Node>, rhs: Box<Node>, is_init: bool },
  /// `cond ? then : els`.
  Cond { cond: Box<Node>, then: Box<Node>, els: Box<Node> },
  Comma { lhs: Box<Node>, rhs: Box<Node> },
  /// `base.member`; `base->member` is lowered to `(*base).member`.
  Member { base: Box<Node>, member: Member },
  /// A call. Arguments have already been assigned to the `args` temporaries
  /// by comma expressions to the left of this node.
  Funcall { func: Box<Node>, func_ty: Ty, args: SmallVec<[VarId; 6]> },
  Var(VarId),
  Num(i64),
  Float(f64),
  Cast(Box<Node>),
  /// GNU statement expression `({ ... })`.
  StmtExpr(Vec<Node>),
  /// Does nothing; the zero element of comma chains.
  NullExpr,

  // Statements
  If { cond: Box<Node>, then: Box<Node>, els: Option<Box<Node>> },
  /// `for` and `while` share a node; `while` has no init/inc.
  For {
    init: Option<Box<Node>>,
    cond: Option<Box<Node>>,
    inc: Option<Box<Node>>,
    body: Box<Node>,
  },
  Do { body: Box<Node>, cond: Box<Node> },
  Switch {
    cond: Box<Node>,
    body: Box<Node>,
    cases: Vec<CaseLabel>,
    default: Option<u32>,
  },
  Case { id: u32, body: Box<Node> },
  Block(Vec<Node>),
  ExprStmt(Box<Node>),
  Return(Option<Box<Node>>),
  Break,
  Continue,
  Goto(Symbol),
  Label { name: Symbol, body: Box<Node> },
}

/// An AST node. `ty` is filled by the type pass; every expression node has
/// a type before codegen runs.
#[derive(Clone, Debug)]
pub struct Node {
  pub kind: NodeKind,
  pub ty: Option<Ty>,
  /// Representative token, for diagnostics and `.loc` directives.
  pub tok: Token,
}

impl Node {
  #[must_use] pub fn new(kind: NodeKind, tok: Token) -> Self {
    Node { kind, ty: None, tok }
  }

  /// The node's type; panics on statement nodes or before the type pass.
  #[must_use] pub fn ty(&self) -> Ty { self.ty.expect("untyped node") }
}

/// A function definition.
#[derive(Clone, Debug)]
pub struct Function {
  pub name: Symbol,
  pub params: Vec<VarId>,
  pub is_static: bool,
  pub is_variadic: bool,
  pub body: Node,
  /// All locals including params and compiler temporaries.
  pub locals: Vec<VarId>,
  /// Frame size; assigned by the back-end's layout pass.
  pub stack_size: i64,
}

/// A parsed translation unit.
#[derive(Clone, Debug)]
pub struct Program {
  pub types: TyArena,
  pub vars: IdxVec<VarId, VarData>,
  /// Globals with storage, in definition order.
  pub globals: Vec<VarId>,
  pub fns: Vec<Function>,
}
