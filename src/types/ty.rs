//! The C type system: a handle-addressed arena of type objects.
//!
//! Primitive types are fixed handles seeded at arena construction, so there
//! is exactly one instance per primitive kind. Constructed types (pointers,
//! arrays, functions, structs, enums) are freshly allocated slots. An
//! incomplete struct is completed by overwriting its slot in place, which
//! every outstanding handle observes — the arena equivalent of the C
//! original's retroactive `*ty = *new_ty` fill.

use crate::symbol::Symbol;
use crate::types::{IdxVec, align_to, mk_id};

mk_id! {
  /// A handle to a type in the [`TyArena`].
  Ty
}

impl Ty {
  pub const VOID: Ty = Ty(0);
  pub const BOOL: Ty = Ty(1);
  pub const CHAR: Ty = Ty(2);
  pub const SHORT: Ty = Ty(3);
  pub const INT: Ty = Ty(4);
  pub const LONG: Ty = Ty(5);
  pub const UCHAR: Ty = Ty(6);
  pub const USHORT: Ty = Ty(7);
  pub const UINT: Ty = Ty(8);
  pub const ULONG: Ty = Ty(9);
  pub const FLOAT: Ty = Ty(10);
  pub const DOUBLE: Ty = Ty(11);
  // `signed` spelled out is a distinct instance: bitfields of a plain
  // integer type are unsigned per the psABI, explicitly signed ones are not.
  pub const SCHAR: Ty = Ty(12);
  pub const SSHORT: Ty = Ty(13);
  pub const SINT: Ty = Ty(14);
  pub const SLONG: Ty = Ty(15);
}

/// A struct or union member.
#[derive(Clone, Debug)]
pub struct Member {
  /// `None` for an anonymous nested struct member.
  pub name: Option<Symbol>,
  pub ty: Ty,
  pub align: i64,
  /// Byte offset of the member (for a bitfield, of its container word).
  pub offset: i64,
  pub is_bitfield: bool,
  /// Bit offset within the container word.
  pub bit_offset: i64,
  pub bit_width: i64,
}

/// A function parameter. The name is `None` in a declaration that omits it.
#[derive(Clone, Debug)]
pub struct Param {
  pub name: Option<Symbol>,
  pub ty: Ty,
}

#[derive(Clone, Debug)]
pub enum TyKind {
  Void,
  Bool,
  Char,
  Short,
  Int,
  Long,
  Float,
  Double,
  Enum,
  Ptr { base: Ty },
  /// `len < 0` means the length is to be inferred from an initializer.
  Array { base: Ty, len: i64 },
  Func { return_ty: Ty, params: Vec<Param>, is_variadic: bool },
  Struct { members: Vec<Member>, is_union: bool },
}

/// A type object. `size`/`align` are in bytes; an incomplete type must not
/// be used to size storage.
#[derive(Clone, Debug)]
pub struct TyData {
  pub kind: TyKind,
  pub size: i64,
  pub align: i64,
  pub is_unsigned: bool,
  pub is_const: bool,
  pub is_incomplete: bool,
  /// The type was spelled with an explicit `signed` keyword.
  pub explicitly_signed: bool,
}

impl TyData {
  fn prim(kind: TyKind, size: i64, align: i64, is_unsigned: bool) -> Self {
    TyData {
      kind, size, align, is_unsigned,
      is_const: false, is_incomplete: false, explicitly_signed: false,
    }
  }
}

/// The type arena.
#[derive(Clone, Debug, Default)]
pub struct TyArena {
  data: IdxVec<Ty, TyData>,
}

impl std::ops::Index<Ty> for TyArena {
  type Output = TyData;
  fn index(&self, ty: Ty) -> &TyData { &self.data[ty] }
}

impl std::ops::IndexMut<Ty> for TyArena {
  fn index_mut(&mut self, ty: Ty) -> &mut TyData { &mut self.data[ty] }
}

impl TyArena {
  /// Build an arena seeded with the primitive types, at the handles named
  /// by the `Ty` associated constants.
  #[must_use] pub fn new() -> Self {
    use TyKind::*;
    let mut a = TyArena::default();
    for (kind, size, unsigned, signed_kw) in [
      (Void, 1, false, false), (Bool, 1, false, false),
      (Char, 1, false, false), (Short, 2, false, false),
      (Int, 4, false, false), (Long, 8, false, false),
      (Char, 1, true, false), (Short, 2, true, false),
      (Int, 4, true, false), (Long, 8, true, false),
      (Float, 4, false, false), (Double, 8, false, false),
      (Char, 1, false, true), (Short, 2, false, true),
      (Int, 4, false, true), (Long, 8, false, true),
    ] {
      let mut data = TyData::prim(kind, size, size, unsigned);
      data.explicitly_signed = signed_kw;
      a.data.push(data);
    }
    a
  }

  pub fn alloc(&mut self, data: TyData) -> Ty { self.data.push(data) }

  /// Clone a type into a fresh slot.
  pub fn copy(&mut self, ty: Ty) -> Ty {
    let data = self[ty].clone();
    self.alloc(data)
  }

  /// A copy of `ty` with the `const` qualifier set.
  pub fn with_const(&mut self, ty: Ty) -> Ty {
    let new = self.copy(ty);
    self[new].is_const = true;
    new
  }

  pub fn pointer_to(&mut self, base: Ty) -> Ty {
    self.alloc(TyData {
      kind: TyKind::Ptr { base }, size: 8, align: 8,
      is_unsigned: true, is_const: false, is_incomplete: false, explicitly_signed: false,
    })
  }

  /// `base[len]`. An array of an incomplete element is itself incomplete;
  /// completing the element later does not resize existing arrays, so the
  /// parser rejects storage of such a type.
  pub fn array_of(&mut self, base: Ty, len: i64) -> Ty {
    let b = &self[base];
    let (size, incomplete) = if b.is_incomplete || len < 0 {
      (0, true)
    } else {
      (b.size * len, false)
    };
    let align = b.align;
    self.alloc(TyData {
      kind: TyKind::Array { base, len }, size, align,
      is_unsigned: false, is_const: false, is_incomplete: incomplete,
      explicitly_signed: false,
    })
  }

  pub fn func_type(&mut self, return_ty: Ty) -> Ty {
    self.alloc(TyData {
      kind: TyKind::Func { return_ty, params: vec![], is_variadic: false },
      size: 1, align: 1,
      is_unsigned: false, is_const: false, is_incomplete: false, explicitly_signed: false,
    })
  }

  pub fn enum_type(&mut self) -> Ty {
    self.alloc(TyData {
      kind: TyKind::Enum, size: 4, align: 4,
      is_unsigned: false, is_const: false, is_incomplete: false, explicitly_signed: false,
    })
  }

  /// A fresh incomplete struct, to be completed by [`TyArena::complete`].
  pub fn struct_type(&mut self) -> Ty {
    self.alloc(TyData {
      kind: TyKind::Struct { members: vec![], is_union: false },
      size: 0, align: 1,
      is_unsigned: false, is_const: false, is_incomplete: true, explicitly_signed: false,
    })
  }

  /// Overwrite `ty`'s slot with `data`, completing a forward-declared tag.
  /// Every handle to `ty` observes the new contents.
  pub fn complete(&mut self, ty: Ty, data: TyData) { self[ty] = data }

  #[must_use] pub fn is_integer(&self, ty: Ty) -> bool {
    matches!(self[ty].kind,
      TyKind::Bool | TyKind::Char | TyKind::Short | TyKind::Int | TyKind::Long | TyKind::Enum)
  }

  #[must_use] pub fn is_flonum(&self, ty: Ty) -> bool {
    matches!(self[ty].kind, TyKind::Float | TyKind::Double)
  }

  #[must_use] pub fn is_numeric(&self, ty: Ty) -> bool {
    self.is_integer(ty) || self.is_flonum(ty)
  }

  #[must_use] pub fn is_scalar(&self, ty: Ty) -> bool {
    self.is_numeric(ty) || self.base(ty).is_some()
  }

  /// The pointed-to or element type. Arrays answer here too: in most
  /// contexts "array of T" behaves as "pointer to T", as the C spec
  /// requires, so callers examine `base` instead of the kind.
  #[must_use] pub fn base(&self, ty: Ty) -> Option<Ty> {
    match self[ty].kind {
      TyKind::Ptr { base } | TyKind::Array { base, .. } => Some(base),
      _ => None,
    }
  }

  #[must_use] pub fn size(&self, ty: Ty) -> i64 { self[ty].size }
  #[must_use] pub fn align(&self, ty: Ty) -> i64 { self[ty].align }
  #[must_use] pub fn is_unsigned(&self, ty: Ty) -> bool { self[ty].is_unsigned }

  #[must_use] pub fn is_void(&self, ty: Ty) -> bool { matches!(self[ty].kind, TyKind::Void) }
  #[must_use] pub fn is_func(&self, ty: Ty) -> bool { matches!(self[ty].kind, TyKind::Func { .. }) }
  #[must_use] pub fn is_array(&self, ty: Ty) -> bool { matches!(self[ty].kind, TyKind::Array { .. }) }
  #[must_use] pub fn is_struct(&self, ty: Ty) -> bool { matches!(self[ty].kind, TyKind::Struct { .. }) }
  #[must_use] pub fn is_ptr(&self, ty: Ty) -> bool { matches!(self[ty].kind, TyKind::Ptr { .. }) }

  /// The return type of a function, or of a pointer to function.
  #[must_use] pub fn return_ty(&self, ty: Ty) -> Option<Ty> {
    match self[ty].kind {
      TyKind::Func { return_ty, .. } => Some(return_ty),
      TyKind::Ptr { base } => match self[base].kind {
        TyKind::Func { return_ty, .. } => Some(return_ty),
        _ => None,
      },
      _ => None,
    }
  }

  /// The common type for the usual arithmetic conversion: a pointer wins,
  /// then the wider floating kind, then `long` if either operand is
  /// 8 bytes wide, else `int`.
  pub fn common_type(&mut self, t1: Ty, t2: Ty) -> Ty {
    if let Some(base) = self.base(t1) {
      return self.pointer_to(base)
    }
    if matches!(self[t1].kind, TyKind::Double) || matches!(self[t2].kind, TyKind::Double) {
      return Ty::DOUBLE
    }
    if matches!(self[t1].kind, TyKind::Float) || matches!(self[t2].kind, TyKind::Float) {
      return Ty::FLOAT
    }
    if self[t1].size == 8 || self[t2].size == 8 { Ty::LONG } else { Ty::INT }
  }

  /// Union/struct size rounding used by layout: `align_to` over the final
  /// bit count.
  #[must_use] pub fn struct_size(bits: i64, align: i64) -> i64 {
    align_to(bits, align * 8) / 8
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn primitives_are_seeded() {
    let a = TyArena::new();
    assert_eq!(a.size(Ty::CHAR), 1);
    assert_eq!(a.size(Ty::SHORT), 2);
    assert_eq!(a.size(Ty::INT), 4);
    assert_eq!(a.size(Ty::LONG), 8);
    assert_eq!(a.size(Ty::FLOAT), 4);
    assert_eq!(a.size(Ty::DOUBLE), 8);
    assert!(a.is_unsigned(Ty::UINT));
    assert!(!a.is_unsigned(Ty::INT));
    assert!(a[Ty::SINT].explicitly_signed);
  }

  #[test]
  fn pointer_and_array() {
    let mut a = TyArena::new();
    let p = a.pointer_to(Ty::INT);
    assert_eq!(a.size(p), 8);
    assert_eq!(a.base(p), Some(Ty::INT));
    let arr = a.array_of(Ty::INT, 3);
    assert_eq!(a.size(arr), 12);
    assert_eq!(a.base(arr), Some(Ty::INT));
    let unsized_ = a.array_of(Ty::INT, -1);
    assert!(a[unsized_].is_incomplete);
  }

  #[test]
  fn common_type_rules() {
    let mut a = TyArena::new();
    assert_eq!(a.common_type(Ty::INT, Ty::INT), Ty::INT);
    assert_eq!(a.common_type(Ty::INT, Ty::LONG), Ty::LONG);
    assert_eq!(a.common_type(Ty::INT, Ty::DOUBLE), Ty::DOUBLE);
    assert_eq!(a.common_type(Ty::FLOAT, Ty::INT), Ty::FLOAT);
    let p = a.pointer_to(Ty::CHAR);
    let c = a.common_type(p, Ty::LONG);
    assert_eq!(a.base(c), Some(Ty::CHAR));
  }

  #[test]
  fn completion_updates_all_handles() {
    let mut a = TyArena::new();
    let s = a.struct_type();
    let alias = s;
    assert!(a[alias].is_incomplete);
    let members = vec![Member {
      name: None, ty: Ty::INT, align: 4, offset: 0,
      is_bitfield: false, bit_offset: 0, bit_width: 0,
    }];
    a.complete(s, TyData {
      kind: TyKind::Struct { members, is_union: false },
      size: 4, align: 4, is_unsigned: false, is_const: false,
      is_incomplete: false, explicitly_signed: false,
    });
    assert!(!a[alias].is_incomplete);
    assert_eq!(a.size(alias), 4);
  }
}
