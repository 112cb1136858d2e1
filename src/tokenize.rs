//! The tokenizer: raw source bytes to a token list.
//!
//! Tokens hold byte offsets into the retained source buffer rather than
//! copied text, plus the coordinates and `at_bol`/`has_space` flags the
//! preprocessor's directive and stringize handling depend on. Numeric
//! literals are produced as *pp-numbers* (a superset of C's numeric
//! grammar); they are converted to typed numeric tokens by
//! [`convert_pp_tokens`] once preprocessing is done, and identifiers that
//! name keywords are re-kinded by [`convert_keywords`] at the same point.

use std::fmt::Display;
use std::io::Read;
use std::rc::Rc;
use std::sync::LazyLock;

use bitflags::bitflags;
use hashbrown::HashSet;

use crate::symbol::Symbol;
use crate::types::ty::Ty;
use crate::{Error, Result};

/// A source file retained for the lifetime of the compilation, because
/// tokens hold offsets into its contents.
#[derive(Debug)]
pub struct SourceFile {
  /// Display name (the path as given, or `-` for stdin).
  pub name: String,
  /// Index used by `.loc` directives and dependency output.
  pub file_no: usize,
  /// Canonicalized contents: `\r\n` normalized, backslash-newline spliced,
  /// guaranteed to end with a newline.
  pub contents: String,
}

impl SourceFile {
  /// Read and canonicalize a file, `-` meaning stdin.
  pub fn read(path: &str, file_no: usize) -> Result<Rc<SourceFile>> {
    let mut raw = String::new();
    if path == "-" {
      std::io::stdin().read_to_string(&mut raw)
        .map_err(|e| Error::msg(format!("cannot read stdin: {e}")))?;
    } else {
      raw = std::fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("cannot open {path}: {e}")))?;
    }
    Ok(Rc::new(SourceFile { name: path.to_owned(), file_no, contents: canonicalize(&raw) }))
  }

  /// Wrap an in-memory buffer (macro bodies built by the preprocessor,
  /// `-D` definitions, test input).
  pub fn from_text(name: &str, file_no: usize, text: &str) -> Rc<SourceFile> {
    Rc::new(SourceFile { name: name.to_owned(), file_no, contents: canonicalize(text) })
  }
}

/// Normalize line endings, splice backslash-newline sequences, and make sure
/// the buffer ends with a newline. Spliced newlines are re-emitted as a run
/// of blank lines at the next real newline so that physical line numbers are
/// preserved for diagnostics and `__LINE__`.
fn canonicalize(src: &str) -> String {
  let b = src.as_bytes();
  let mut out = String::with_capacity(src.len() + 1);
  let mut pending = 0usize;
  let mut i = 0;
  while i < b.len() {
    if b[i] == b'\r' {
      if b.get(i + 1) == Some(&b'\n') { i += 1 }
      out.push('\n');
      for _ in 0..pending { out.push('\n') }
      pending = 0;
      i += 1;
    } else if b[i] == b'\\' && b.get(i + 1) == Some(&b'\n') {
      pending += 1;
      i += 2;
    } else if b[i] == b'\\' && b.get(i + 1) == Some(&b'\r') && b.get(i + 2) == Some(&b'\n') {
      pending += 1;
      i += 3;
    } else if b[i] == b'\n' {
      out.push('\n');
      for _ in 0..pending { out.push('\n') }
      pending = 0;
      i += 1;
    } else {
      // Source is UTF-8; copy whole characters.
      let c = src[i..].chars().next().expect("char boundary");
      out.push(c);
      i += c.len_utf8();
    }
  }
  for _ in 0..pending { out.push('\n') }
  if !out.ends_with('\n') { out.push('\n') }
  out
}

bitflags! {
  /// Per-token layout flags consumed by the preprocessor.
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
  pub struct TokenFlags: u8 {
    /// This token is the first on its line.
    const AT_BOL = 1 << 0;
    /// At least one whitespace character (or comment) preceded this token.
    const HAS_SPACE = 1 << 1;
  }
}

/// The set of macro names by which a token has already been produced.
/// Persistent sets make the union/intersection operations of Prosser's
/// algorithm cheap and order-independent.
pub type Hideset = im::OrdSet<Symbol>;

/// A numeric literal with its inferred C type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumLit {
  /// Integer value; `ty` is one of the integer primitives.
  Int { val: i64, ty: Ty },
  /// Floating value; `ty` is `float` or `double`.
  Float { val: f64, ty: Ty },
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
  /// Keywords and punctuators.
  Reserved,
  /// Identifiers (and, before [`convert_keywords`] runs, keywords too).
  Ident,
  /// A string literal: decoded contents including the terminator, stored as
  /// little-endian code units of `elem` bytes each (1 for `"…"`/`u8"…"`,
  /// 2 for `u"…"`, 4 for `U"…"`/`L"…"`).
  Str { bytes: Vec<u8>, elem: u8 },
  /// A preliminary numeric token; see [`convert_pp_tokens`].
  PpNum,
  /// A typed numeric literal.
  Num(NumLit),
  /// End-of-file sentinel; always the last token of a stream.
  Eof,
}

/// A lexical token. Cheap to clone: the source buffer is shared.
#[derive(Clone, Debug)]
pub struct Token {
  pub kind: TokenKind,
  /// The file this token was produced from.
  pub file: Rc<SourceFile>,
  /// Byte offset of the token's spelling in `file.contents`.
  pub off: usize,
  /// Byte length of the spelling.
  pub len: usize,
  /// 1-based physical line number.
  pub line_no: u32,
  pub flags: TokenFlags,
  pub hideset: Hideset,
}

impl Token {
  /// The token's spelling.
  #[must_use] pub fn text(&self) -> &str { &self.file.contents[self.off..self.off + self.len] }

  /// Does this token spell `s`? Used for keywords and punctuators.
  #[must_use] pub fn is(&self, s: &str) -> bool { self.text() == s }

  #[must_use] pub fn is_ident(&self) -> bool { matches!(self.kind, TokenKind::Ident) }
  #[must_use] pub fn is_eof(&self) -> bool { matches!(self.kind, TokenKind::Eof) }
  #[must_use] pub fn at_bol(&self) -> bool { self.flags.contains(TokenFlags::AT_BOL) }
  #[must_use] pub fn has_space(&self) -> bool { self.flags.contains(TokenFlags::HAS_SPACE) }

  /// Render an error diagnostic pointing at this token.
  #[must_use] pub fn error(&self, msg: impl Display) -> Error {
    Error::msg(render_diag(&self.file, self.off, self.line_no, &msg.to_string()))
  }

  /// Print a warning pointing at this token and continue.
  pub fn warn(&self, msg: impl Display) {
    eprintln!("{}", render_diag(&self.file, self.off, self.line_no, &msg.to_string()));
  }
}

/// Render the standard diagnostic shape:
///
/// ```text
/// foo.c:10: x = y + 1;
///               ^ <message>
/// ```
fn render_diag(file: &SourceFile, off: usize, line_no: u32, msg: &str) -> String {
  let b = file.contents.as_bytes();
  let off = off.min(b.len());
  let mut start = off;
  while start > 0 && b[start - 1] != b'\n' { start -= 1 }
  let mut end = off;
  while end < b.len() && b[end] != b'\n' { end += 1 }
  let prefix = format!("{}:{}: ", file.name, line_no);
  let pad = prefix.len() + file.contents[start..off].chars().count();
  format!("{}{}\n{:pad$}^ {}", prefix, &file.contents[start..end], "", msg)
}

/// An error at a raw buffer position, before line numbers are assigned.
fn error_at(file: &SourceFile, off: usize, msg: impl Display) -> Error {
  let line_no = 1 + file.contents.as_bytes()[..off.min(file.contents.len())]
    .iter().filter(|&&c| c == b'\n').count() as u32;
  Error::msg(render_diag(file, off, line_no, &msg.to_string()))
}

fn is_ident_start(c: u8) -> bool { c.is_ascii_alphabetic() || c == b'_' }
fn is_ident_cont(c: u8) -> bool { is_ident_start(c) || c.is_ascii_digit() }

/// Multi-byte punctuators, longest first. Single punctuation bytes are the
/// fallback case in the scanner.
const PUNCTS: &[&str] = &[
  "<<=", ">>=", "...",
  "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "++", "--",
  "%=", "&=", "|=", "^=", "&&", "||", "<<", ">>", "##",
];

static KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
  HashSet::from_iter([
    "return", "if", "else", "for", "while", "int", "sizeof", "char",
    "struct", "union", "short", "long", "void", "typedef", "_Bool",
    "enum", "static", "break", "continue", "goto", "switch", "case",
    "default", "extern", "_Alignof", "_Alignas", "do", "signed",
    "unsigned", "const", "volatile", "register", "restrict",
    "_Noreturn", "float", "double",
  ])
});

/// Is this identifier a keyword?
#[must_use] pub fn is_keyword(s: &str) -> bool { KEYWORDS.contains(s) }

struct Lexer {
  file: Rc<SourceFile>,
  pos: usize,
  toks: Vec<Token>,
  flags: TokenFlags,
}

impl Lexer {
  fn bytes(&self) -> &[u8] { self.file.contents.as_bytes() }
  fn peek(&self, n: usize) -> u8 { *self.bytes().get(self.pos + n).unwrap_or(&0) }
  fn starts_with(&self, s: &str) -> bool { self.file.contents[self.pos..].starts_with(s) }

  fn err(&self, off: usize, msg: impl Display) -> Error { error_at(&self.file, off, msg) }

  fn push(&mut self, kind: TokenKind, off: usize, len: usize) {
    self.toks.push(Token {
      kind, file: self.file.clone(), off, len, line_no: 0,
      flags: std::mem::take(&mut self.flags),
      hideset: Hideset::default(),
    });
  }

  /// Decode one escape sequence at `pos` (just past the backslash),
  /// returning the code unit and the position after the sequence.
  fn read_escaped_char(&self, mut pos: usize) -> Result<(u32, usize)> {
    if (b'0'..=b'7').contains(&self.peek_at(pos)) {
      let mut c = u32::from(self.peek_at(pos) - b'0');
      pos += 1;
      for _ in 0..2 {
        if (b'0'..=b'7').contains(&self.peek_at(pos)) {
          c = c * 8 + u32::from(self.peek_at(pos) - b'0');
          pos += 1;
        }
      }
      return Ok((c, pos))
    }
    if self.peek_at(pos) == b'x' {
      pos += 1;
      if !self.peek_at(pos).is_ascii_hexdigit() {
        return Err(self.err(pos, "invalid hex escape sequence"))
      }
      let mut c = 0u32;
      while self.peek_at(pos).is_ascii_hexdigit() {
        c = c * 16 + u32::from((self.peek_at(pos) as char).to_digit(16).expect("hex digit"));
        if c > 255 {
          return Err(self.err(pos, "hex escape sequence out of range"))
        }
        pos += 1;
      }
      return Ok((c, pos))
    }
    let c = match self.peek_at(pos) {
      b'a' => 7, b'b' => 8, b't' => 9, b'n' => 10, b'v' => 11,
      b'f' => 12, b'r' => 13, b'e' => 27,
      c => u32::from(c),
    };
    Ok((c, pos + 1))
  }

  /// Read a string literal whose opening quote is at `quote`, decoding into
  /// `elem`-byte code units. The token starts at `start` (which may precede
  /// `quote` by an encoding prefix).
  fn read_string_literal(&mut self, start: usize, quote: usize, elem: u8) -> Result<()> {
    let mut units: Vec<u32> = vec![];
    let mut pos = quote + 1;
    loop {
      if pos >= self.bytes().len() || self.peek_at(pos) == 0 {
        return Err(self.err(start, "unclosed string literal"))
      }
      match self.peek_at(pos) {
        b'"' => break,
        b'\\' => {
          let (c, next) = self.read_escaped_char(pos + 1)?;
          units.push(c);
          pos = next;
        }
        c if c < 0x80 => {
          units.push(u32::from(c));
          pos += 1;
        }
        _ => {
          // A multi-byte UTF-8 character: bytes pass through for narrow
          // strings, code points are re-encoded for wide ones.
          let ch = self.file.contents[pos..].chars().next().expect("char boundary");
          if elem == 1 {
            for byte in self.file.contents[pos..pos + ch.len_utf8()].bytes() {
              units.push(u32::from(byte));
            }
          } else {
            units.push(ch as u32);
          }
          pos += ch.len_utf8();
        }
      }
    }
    units.push(0);
    let mut bytes = Vec::with_capacity(units.len() * elem as usize);
    for &u in &units {
      match elem {
        1 => bytes.push(u as u8),
        2 => {
          if u >= 0x10000 {
            // Encode as a UTF-16 surrogate pair.
            let mut buf = [0u16; 2];
            for unit in char::from_u32(u).unwrap_or('\u{fffd}').encode_utf16(&mut buf) {
              bytes.extend_from_slice(&unit.to_le_bytes());
            }
          } else {
            bytes.extend_from_slice(&(u as u16).to_le_bytes());
          }
        }
        _ => bytes.extend_from_slice(&u.to_le_bytes()),
      }
    }
    self.push(TokenKind::Str { bytes, elem }, start, pos + 1 - start);
    self.pos = pos + 1;
    Ok(())
  }

  fn peek_at(&self, pos: usize) -> u8 { *self.bytes().get(pos).unwrap_or(&0) }

  fn read_char_literal(&mut self, start: usize) -> Result<()> {
    let mut pos = start + 1;
    if self.peek_at(pos) == 0 || self.peek_at(pos) == b'\n' {
      return Err(self.err(start, "unclosed char literal"))
    }
    let c = if self.peek_at(pos) == b'\\' {
      let (c, next) = self.read_escaped_char(pos + 1)?;
      pos = next;
      c
    } else {
      let c = self.peek_at(pos);
      pos += 1;
      u32::from(c)
    };
    if self.peek_at(pos) != b'\'' {
      return Err(self.err(pos, "char literal too long"))
    }
    pos += 1;
    self.push(TokenKind::Num(NumLit::Int { val: i64::from(c as u8), ty: Ty::INT }),
      start, pos - start);
    self.pos = pos;
    Ok(())
  }

  /// Read a pp-number: digit or `.`digit, then any run of identifier
  /// characters and `.`, with `+`/`-` allowed after an exponent letter.
  fn read_pp_number(&mut self, start: usize) {
    let mut pos = start + 1;
    loop {
      let c = self.peek_at(pos);
      if matches!(c, b'e' | b'E' | b'p' | b'P') && matches!(self.peek_at(pos + 1), b'+' | b'-') {
        pos += 2;
      } else if is_ident_cont(c) || c == b'.' {
        pos += 1;
      } else {
        break
      }
    }
    self.push(TokenKind::PpNum, start, pos - start);
    self.pos = pos;
  }

  fn run(&mut self) -> Result<()> {
    self.flags = TokenFlags::AT_BOL;
    while self.pos < self.bytes().len() {
      let start = self.pos;

      // Line and block comments count as whitespace.
      if self.starts_with("//") {
        while !matches!(self.peek(0), b'\n' | 0) { self.pos += 1 }
        self.flags |= TokenFlags::HAS_SPACE;
        continue
      }
      if self.starts_with("/*") {
        match self.file.contents[self.pos + 2..].find("*/") {
          Some(n) => self.pos += 2 + n + 2,
          None => return Err(self.err(start, "unclosed block comment")),
        }
        self.flags |= TokenFlags::HAS_SPACE;
        continue
      }

      let c = self.peek(0);
      if c == b'\n' {
        self.pos += 1;
        self.flags = TokenFlags::AT_BOL;
        continue
      }
      if c.is_ascii_whitespace() {
        self.pos += 1;
        self.flags |= TokenFlags::HAS_SPACE;
        continue
      }

      // Numeric literal (pp-number).
      if c.is_ascii_digit() || (c == b'.' && self.peek(1).is_ascii_digit()) {
        self.read_pp_number(start);
        continue
      }

      // String literal, with an optional encoding prefix.
      if c == b'"' {
        self.read_string_literal(start, start, 1)?;
        continue
      }
      if self.starts_with("u8\"") {
        self.read_string_literal(start, start + 2, 1)?;
        continue
      }
      if self.starts_with("u\"") {
        self.read_string_literal(start, start + 1, 2)?;
        continue
      }
      if self.starts_with("U\"") || self.starts_with("L\"") {
        self.read_string_literal(start, start + 1, 4)?;
        continue
      }

      if c == b'\'' {
        self.read_char_literal(start)?;
        continue
      }

      if is_ident_start(c) {
        let mut pos = start + 1;
        while is_ident_cont(self.peek_at(pos)) { pos += 1 }
        self.push(TokenKind::Ident, start, pos - start);
        self.pos = pos;
        continue
      }

      // Punctuators, longest match first.
      if let Some(p) = PUNCTS.iter().find(|p| self.starts_with(p)) {
        self.push(TokenKind::Reserved, start, p.len());
        self.pos = start + p.len();
        continue
      }
      if c.is_ascii_punctuation() {
        self.push(TokenKind::Reserved, start, 1);
        self.pos = start + 1;
        continue
      }

      return Err(self.err(start, "invalid token"))
    }

    self.flags |= TokenFlags::AT_BOL;
    let end = self.bytes().len();
    self.push(TokenKind::Eof, end, 0);
    Ok(())
  }
}

/// Assign 1-based line numbers to tokens by a single scan over the source.
fn add_line_numbers(file: &SourceFile, toks: &mut [Token]) {
  let b = file.contents.as_bytes();
  let mut line_no = 1u32;
  let mut pos = 0;
  for tok in toks {
    while pos < tok.off.min(b.len()) {
      if b[pos] == b'\n' { line_no += 1 }
      pos += 1;
    }
    tok.line_no = line_no;
  }
}

/// Tokenize a canonicalized source file.
pub fn tokenize(file: Rc<SourceFile>) -> Result<Vec<Token>> {
  let mut lexer = Lexer { file: file.clone(), pos: 0, toks: vec![], flags: TokenFlags::empty() };
  lexer.run()?;
  let mut toks = lexer.toks;
  add_line_numbers(&file, &mut toks);
  Ok(toks)
}

/// Tokenize an in-memory buffer (used by the preprocessor for pasted
/// tokens, synthesized literals and `-D` definitions).
pub fn tokenize_text(name: &str, file_no: usize, text: &str) -> Result<Vec<Token>> {
  tokenize(SourceFile::from_text(name, file_no, text))
}

/// Re-kind identifiers that name keywords. Run after preprocessing so that
/// macro names may shadow keywords during expansion.
pub fn convert_keywords(toks: &mut [Token]) {
  for tok in toks {
    if tok.is_ident() && is_keyword(tok.text()) {
      tok.kind = TokenKind::Reserved;
    }
  }
}

/// Convert every pp-number token to a typed numeric token. The last step of
/// preprocessing.
pub fn convert_pp_tokens(toks: &mut [Token]) -> Result<()> {
  for tok in toks {
    if matches!(tok.kind, TokenKind::PpNum) {
      tok.kind = convert_pp_number(tok)?;
    }
  }
  Ok(())
}

/// Parse the spelling of a pp-number into a typed numeric literal,
/// following the C11 rules: decimal constants prefer `int` then `long`
/// (LP64 `long long` is `long`), hexadecimal/octal/binary constants fall
/// back to the unsigned type of each width.
pub fn convert_pp_number(tok: &Token) -> Result<TokenKind> {
  let s = tok.text();
  if let Some(kind) = convert_int(s) {
    return Ok(kind)
  }
  if let Some(kind) = convert_float(s) {
    return Ok(kind)
  }
  Err(tok.error("invalid numeric constant"))
}

fn convert_int(s: &str) -> Option<TokenKind> {
  let b = s.as_bytes();
  let (base, digits_at) = if (s.starts_with("0x") || s.starts_with("0X"))
      && b.get(2).is_some_and(u8::is_ascii_hexdigit) {
    (16, 2)
  } else if (s.starts_with("0b") || s.starts_with("0B"))
      && matches!(b.get(2), Some(b'0' | b'1')) {
    (2, 2)
  } else if s.starts_with('0') {
    (8, 1)
  } else {
    (10, 0)
  };

  let mut val = 0u64;
  let mut pos = digits_at;
  while pos < b.len() {
    let Some(d) = (b[pos] as char).to_digit(base) else { break };
    // Reject a literal that does not fit in 64 bits at all.
    val = val.checked_mul(u64::from(base))?.checked_add(u64::from(d))?;
    pos += 1;
  }
  if pos == digits_at && base != 8 { return None }

  // Read U, L or LL suffixes.
  let rest = &s[pos..];
  let (mut l, mut u) = (false, false);
  let suffix_len = {
    let low = rest.to_ascii_lowercase();
    if low.starts_with("llu") || low.starts_with("ull") {
      l = true; u = true; 3
    } else if low.starts_with("lu") || low.starts_with("ul") {
      l = true; u = true; 2
    } else if low.starts_with("ll") {
      l = true; 2
    } else if low.starts_with('l') {
      l = true; 1
    } else if low.starts_with('u') {
      u = true; 1
    } else {
      0
    }
  };
  if pos + suffix_len != s.len() {
    // Leftover characters: not an integer constant (may be a float).
    return None
  }

  let ty = if base == 10 {
    match (l, u) {
      (true, true) => Ty::ULONG,
      (true, false) => Ty::LONG,
      (false, true) => if val >> 32 != 0 { Ty::ULONG } else { Ty::UINT },
      (false, false) => if val >> 31 != 0 { Ty::LONG } else { Ty::INT },
    }
  } else {
    match (l, u) {
      (true, true) => Ty::ULONG,
      (true, false) => if val >> 63 != 0 { Ty::ULONG } else { Ty::LONG },
      (false, true) => if val >> 32 != 0 { Ty::ULONG } else { Ty::UINT },
      (false, false) =>
        if val >> 63 != 0 { Ty::ULONG }
        else if val >> 32 != 0 { Ty::LONG }
        else if val >> 31 != 0 { Ty::UINT }
        else { Ty::INT },
    }
  };
  Some(TokenKind::Num(NumLit::Int { val: val as i64, ty }))
}

fn convert_float(s: &str) -> Option<TokenKind> {
  let (body, ty) = match s.as_bytes().last() {
    Some(b'f' | b'F') => (&s[..s.len() - 1], Ty::FLOAT),
    // long double is double on this target.
    Some(b'l' | b'L') => (&s[..s.len() - 1], Ty::DOUBLE),
    _ => (s, Ty::DOUBLE),
  };
  let val = if body.starts_with("0x") || body.starts_with("0X") {
    parse_hex_float(&body[2..])?
  } else {
    // Without an `f` suffix, a floating constant needs a point or an
    // exponent; a run of bare digits that was too large for an integer
    // stays an error rather than quietly becoming a double.
    if ty != Ty::FLOAT && !body.contains(['.', 'e', 'E']) {
      return None
    }
    body.parse::<f64>().ok()?
  };
  Some(TokenKind::Num(NumLit::Float { val, ty }))
}

/// Parse a hexadecimal floating constant body (`1.8p3` given source
/// `0x1.8p3`): a hex mantissa and a mandatory base-2 decimal exponent.
fn parse_hex_float(s: &str) -> Option<f64> {
  let b = s.as_bytes();
  let mut mantissa = 0.0f64;
  let mut pos = 0;
  let mut seen = false;
  while pos < b.len() && b[pos].is_ascii_hexdigit() {
    mantissa = mantissa * 16.0 + f64::from((b[pos] as char).to_digit(16)?);
    pos += 1;
    seen = true;
  }
  if pos < b.len() && b[pos] == b'.' {
    pos += 1;
    let mut scale = 1.0 / 16.0;
    while pos < b.len() && b[pos].is_ascii_hexdigit() {
      mantissa += f64::from((b[pos] as char).to_digit(16)?) * scale;
      scale /= 16.0;
      pos += 1;
      seen = true;
    }
  }
  if !seen || pos >= b.len() || !matches!(b[pos], b'p' | b'P') { return None }
  pos += 1;
  let mut sign = 1i32;
  if pos < b.len() && matches!(b[pos], b'+' | b'-') {
    if b[pos] == b'-' { sign = -1 }
    pos += 1;
  }
  let mut exp = 0i32;
  let mut seen_exp = false;
  while pos < b.len() && b[pos].is_ascii_digit() {
    exp = exp.saturating_mul(10).saturating_add(i32::from(b[pos] - b'0'));
    pos += 1;
    seen_exp = true;
  }
  if !seen_exp || pos != b.len() { return None }
  Some(mantissa * 2.0f64.powi(sign * exp))
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  fn lex(src: &str) -> Vec<Token> {
    tokenize_text("test.c", 1, src).expect("tokenize")
  }

  fn texts(toks: &[Token]) -> Vec<&str> {
    toks.iter().filter(|t| !t.is_eof()).map(Token::text).collect()
  }

  #[test]
  fn punctuators_longest_match() {
    let toks = lex("a <<= b >> c >= = == ... ## #");
    assert_eq!(texts(&toks), ["a", "<<=", "b", ">>", "c", ">=", "=", "==", "...", "##", "#"]);
  }

  #[test]
  fn comments_are_whitespace() {
    let toks = lex("a /* x */ b // y\nc");
    assert_eq!(texts(&toks), ["a", "b", "c"]);
    assert!(toks[1].has_space());
    assert!(toks[2].at_bol());
  }

  #[test]
  fn line_numbers_and_bol() {
    let toks = lex("a b\n  c\n");
    assert_eq!(toks[0].line_no, 1);
    assert!(toks[0].at_bol());
    assert!(!toks[1].at_bol());
    assert!(toks[1].has_space());
    assert_eq!(toks[2].line_no, 2);
    assert!(toks[2].at_bol());
    assert!(toks[2].has_space());
  }

  #[test]
  fn backslash_newline_splices_lines() {
    let toks = lex("ab\\\ncd efg\nh");
    assert_eq!(texts(&toks), ["abcd", "efg", "h"]);
    // The spliced newline is re-emitted, so `h` keeps its physical line.
    assert_eq!(toks[2].line_no, 3);
  }

  #[test]
  fn string_escapes() {
    let toks = lex(r#""a\tb\x41\101\e\z""#);
    let TokenKind::Str { bytes, elem } = &toks[0].kind else { panic!("not a string") };
    assert_eq!(*elem, 1);
    assert_eq!(bytes, b"a\tbAA\x1bz\0");
  }

  #[test]
  fn wide_strings() {
    let toks = lex("u\"ab\" U\"a\" L\"a\"");
    let TokenKind::Str { bytes, elem } = &toks[0].kind else { panic!() };
    assert_eq!((*elem, bytes.len()), (2, 6));
    let TokenKind::Str { bytes, elem } = &toks[1].kind else { panic!() };
    assert_eq!((*elem, bytes.len()), (4, 8));
    let TokenKind::Str { elem, .. } = &toks[2].kind else { panic!() };
    assert_eq!(*elem, 4);
  }

  #[test]
  fn char_literals() {
    let toks = lex(r"'a' '\n' '\x41'");
    let vals: Vec<i64> = toks.iter().filter_map(|t| match t.kind {
      TokenKind::Num(NumLit::Int { val, .. }) => Some(val),
      _ => None,
    }).collect();
    assert_eq!(vals, [97, 10, 65]);
  }

  #[test]
  fn unclosed_string_is_an_error() {
    assert!(tokenize_text("t.c", 1, "\"abc\n").is_err());
  }

  #[test]
  fn pp_numbers_group_exponents() {
    let toks = lex("1.5e+3 0x1p-2 .5 123abc");
    assert_eq!(texts(&toks), ["1.5e+3", "0x1p-2", ".5", "123abc"]);
    assert!(toks.iter().take(4).all(|t| matches!(t.kind, TokenKind::PpNum)));
  }

  #[rstest]
  #[case("0", 0, Ty::INT)]
  #[case("10", 10, Ty::INT)]
  #[case("2147483647", 2147483647, Ty::INT)]
  #[case("2147483648", 2147483648, Ty::LONG)]
  #[case("10u", 10, Ty::UINT)]
  #[case("10L", 10, Ty::LONG)]
  #[case("10llu", 10, Ty::ULONG)]
  #[case("0x7fffffff", 0x7fff_ffff, Ty::INT)]
  #[case("0xffffffff", 0xffff_ffff, Ty::UINT)]
  #[case("0x100000000", 0x1_0000_0000, Ty::LONG)]
  #[case("0777", 0o777, Ty::INT)]
  #[case("0b101", 5, Ty::INT)]
  fn integer_literal_typing(#[case] src: &str, #[case] val: i64, #[case] ty: Ty) {
    let mut toks = lex(src);
    convert_pp_tokens(&mut toks).expect("convert");
    assert_eq!(toks[0].kind, TokenKind::Num(NumLit::Int { val, ty }));
  }

  #[rstest]
  #[case("1.5", 1.5, Ty::DOUBLE)]
  #[case("1e2", 100.0, Ty::DOUBLE)]
  #[case("2.0f", 2.0, Ty::FLOAT)]
  #[case("2.0L", 2.0, Ty::DOUBLE)]
  #[case("0x1p3", 8.0, Ty::DOUBLE)]
  #[case("0x1.8p1", 3.0, Ty::DOUBLE)]
  fn float_literal_typing(#[case] src: &str, #[case] val: f64, #[case] ty: Ty) {
    let mut toks = lex(src);
    convert_pp_tokens(&mut toks).expect("convert");
    assert_eq!(toks[0].kind, TokenKind::Num(NumLit::Float { val, ty }));
  }

  #[test]
  fn oversized_literal_is_rejected() {
    let mut toks = lex("99999999999999999999999999");
    assert!(convert_pp_tokens(&mut toks).is_err());
  }

  #[test]
  fn keyword_conversion() {
    let mut toks = lex("int foo return");
    convert_keywords(&mut toks);
    assert_eq!(toks[0].kind, TokenKind::Reserved);
    assert_eq!(toks[1].kind, TokenKind::Ident);
    assert_eq!(toks[2].kind, TokenKind::Reserved);
  }
}
