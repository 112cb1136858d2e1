//! The global string interner. Identifiers, macro names, labels and member
//! names are all represented as [`Symbol`]s, so name comparison is an integer
//! compare and hidesets can be sets of small integers.

use std::fmt;
use std::sync::{LazyLock, Mutex};

use hashbrown::HashMap;

/// An interned string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

#[derive(Default)]
struct Interner {
  names: HashMap<&'static str, Symbol>,
  strings: Vec<&'static str>,
}

impl Interner {
  fn intern(&mut self, s: &str) -> Symbol {
    if let Some(&sym) = self.names.get(s) { return sym }
    // Interned strings live for the whole process, like every other
    // compiler allocation.
    let s: &'static str = Box::leak(s.to_owned().into_boxed_str());
    let sym = Symbol(u32::try_from(self.strings.len()).expect("interner overflow"));
    self.strings.push(s);
    self.names.insert(s, sym);
    sym
  }
}

static INTERNER: LazyLock<Mutex<Interner>> = LazyLock::new(Default::default);

/// Intern a string, returning its [`Symbol`].
#[must_use] pub fn intern(s: &str) -> Symbol {
  INTERNER.lock().expect("interner poisoned").intern(s)
}

impl Symbol {
  /// Get the string this symbol names.
  #[must_use] pub fn as_str(self) -> &'static str {
    INTERNER.lock().expect("interner poisoned").strings[self.0 as usize]
  }
}

impl fmt::Display for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.as_str().fmt(f) }
}

impl fmt::Debug for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.as_str().fmt(f) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intern_is_stable() {
    let a = intern("foo");
    let b = intern("foo");
    let c = intern("bar");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.as_str(), "foo");
    assert_eq!(c.as_str(), "bar");
  }
}
