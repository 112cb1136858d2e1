//! The C preprocessor: a token-to-token transformation.
//!
//! Macro expansion terminates on any input, recursive definitions
//! included, because every token carries a *hideset*: the set of macro
//! names by which it has already been produced. A token whose name is in
//! its own hideset is never expanded again. Object-like expansion extends
//! the invocation's hideset with the macro name; function-like expansion
//! starts from the intersection of the name token's and closing
//! parenthesis's hidesets, as in Prosser's algorithm.
//!
//! The preprocessor works on a stack of pending tokens: expansion results
//! and included files are pushed in front of the remaining input, which
//! reproduces the C original's list splicing in O(1) per token.

use std::path::PathBuf;
use std::rc::Rc;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::symbol::{Symbol, intern};
use crate::tokenize::{
  SourceFile, Token, TokenKind, convert_keywords, convert_pp_tokens, tokenize, tokenize_text,
};
use crate::{Options, Result};

#[derive(Clone, Copy, Debug)]
enum DynamicMacro {
  /// `__FILE__`: the current file name as a string literal.
  File,
  /// `__LINE__`: the current line number.
  Line,
}

#[derive(Clone, Debug)]
enum MacroBody {
  Obj(Vec<Token>),
  Func { params: Vec<Symbol>, va_args: bool, body: Vec<Token> },
  Dynamic(DynamicMacro),
}

#[derive(Clone, Debug)]
struct Macro {
  body: MacroBody,
  /// `#undef` keeps the entry but marks it deleted, shadowing earlier
  /// definitions.
  deleted: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CondCtx {
  InThen,
  InElif,
  InElse,
}

/// One level of `#if` nesting.
struct CondIncl {
  ctx: CondCtx,
  tok: Token,
  included: bool,
}

pub struct Preprocessor<'a> {
  opts: &'a Options,
  macros: HashMap<Symbol, Macro>,
  cond_incl: Vec<CondIncl>,
  /// Input files in the order first read, for `.file` directives and
  /// `-M` dependency output.
  files: Vec<Rc<SourceFile>>,
  /// Pending tokens, reversed: the current token is the last element.
  input: Vec<Token>,
}

/// Concatenate token spellings, separated by a space wherever the source
/// had whitespace.
fn join_tokens(toks: &[Token]) -> String {
  let mut s = String::new();
  for (i, t) in toks.iter().enumerate() {
    if i > 0 && t.has_space() {
      s.push(' ');
    }
    s.push_str(t.text());
  }
  s
}

/// Double-quote a string, escaping backslashes and quotes.
fn quote_string(s: &str) -> String {
  let mut out = String::with_capacity(s.len() + 2);
  out.push('"');
  for c in s.chars() {
    if c == '\\' || c == '"' {
      out.push('\\');
    }
    out.push(c);
  }
  out.push('"');
  out
}

/// Render a preprocessed token stream the way `-E` prints it: one space
/// between tokens, a newline wherever a token begins a line.
#[must_use] pub fn render_tokens(toks: &[Token]) -> String {
  let mut out = String::new();
  let mut first = true;
  for tok in toks {
    if tok.is_eof() {
      break
    }
    if !first {
      out.push(if tok.at_bol() { '\n' } else { ' ' });
    }
    out.push_str(tok.text());
    first = false;
  }
  out.push('\n');
  out
}

/// `__DATE__`/`__TIME__` spellings for the given Unix timestamp, in the
/// `asctime` formats `"Mmm dd yyyy"` and `"hh:mm:ss"`.
fn date_time_strings(secs: u64) -> (String, String) {
  const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun",
    "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
  ];
  // Civil-from-days conversion on the proleptic Gregorian calendar.
  let days = (secs / 86400) as i64;
  let z = days + 719_468;
  let era = z.div_euclid(146_097);
  let doe = z.rem_euclid(146_097);
  let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
  let y = yoe + era * 400;
  let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
  let mp = (5 * doy + 2) / 153;
  let d = doy - (153 * mp + 2) / 5 + 1;
  let m = if mp < 10 { mp + 3 } else { mp - 9 };
  let y = if m <= 2 { y + 1 } else { y };

  let date = format!("\"{} {:2} {}\"", MONTHS[(m - 1) as usize], d, y);
  let t = secs % 86400;
  let time = format!("\"{:02}:{:02}:{:02}\"", t / 3600, (t / 60) % 60, t % 60);
  (date, time)
}

impl<'a> Preprocessor<'a> {
  pub fn new(opts: &'a Options) -> Self {
    let mut pp = Preprocessor {
      opts,
      macros: HashMap::new(),
      cond_incl: vec![],
      files: vec![],
      input: vec![],
    };
    pp.init_builtins();
    pp
  }

  /// Define a macro from `name` and a replacement text, as `-D` and the
  /// predefined macros do.
  pub fn define(&mut self, name: &str, def: &str) -> Result<()> {
    let mut body = tokenize_text("<built-in>", 1, def)?;
    body.pop();
    self.macros.insert(intern(name), Macro { body: MacroBody::Obj(body), deleted: false });
    Ok(())
  }

  fn define_dynamic(&mut self, name: &str, dynamic: DynamicMacro) {
    self.macros.insert(intern(name),
      Macro { body: MacroBody::Dynamic(dynamic), deleted: false });
  }

  /// Install the platform predefines and the built-in dynamic macros.
  fn init_builtins(&mut self) {
    for (name, def) in [
      ("_LP64", "1"),
      ("__ELF__", "1"),
      ("__LP64__", "1"),
      ("__SIZEOF_DOUBLE__", "8"),
      ("__SIZEOF_FLOAT__", "4"),
      ("__SIZEOF_INT__", "4"),
      ("__SIZEOF_LONG_DOUBLE__", "8"),
      ("__SIZEOF_LONG_LONG__", "8"),
      ("__SIZEOF_LONG__", "8"),
      ("__SIZEOF_POINTER__", "8"),
      ("__SIZEOF_PTRDIFF_T__", "8"),
      ("__SIZEOF_SHORT__", "2"),
      ("__SIZEOF_SIZE_T__", "8"),
      ("__STDC_HOSTED__", "1"),
      ("__STDC_NO_ATOMICS__", "1"),
      ("__STDC_NO_COMPLEX__", "1"),
      ("__STDC_NO_THREADS__", "1"),
      ("__STDC_NO_VLA__", "1"),
      ("__STDC_VERSION__", "201112L"),
      ("__STDC__", "1"),
      ("__alignof__", "_Alignof"),
      ("__amd64", "1"),
      ("__amd64__", "1"),
      ("__const__", "const"),
      ("__gnu_linux__", "1"),
      ("__linux", "1"),
      ("__linux__", "1"),
      ("__signed__", "signed"),
      ("__unix", "1"),
      ("__unix__", "1"),
      ("__volatile__", "volatile"),
      ("__x86_64", "1"),
      ("__x86_64__", "1"),
      ("linux", "1"),
      ("unix", "1"),
    ] {
      self.define(name, def).expect("predefined macro");
    }

    self.define_dynamic("__FILE__", DynamicMacro::File);
    self.define_dynamic("__LINE__", DynamicMacro::Line);

    // __DATE__ and __TIME__ are fixed at preprocessor init.
    let secs = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map_or(0, |d| d.as_secs());
    let (date, time) = date_time_strings(secs);
    self.define("__DATE__", &date).expect("predefined macro");
    self.define("__TIME__", &time).expect("predefined macro");
  }

  /// The files read during preprocessing, in order, for dependency
  /// output and `.file` directives.
  #[must_use] pub fn input_files(&self) -> &[Rc<SourceFile>] { &self.files }

  /// Preprocess a file: tokenize, process directives and macros, then run
  /// the post-passes (adjacent string literal concatenation, pp-number
  /// conversion, keyword recognition).
  pub fn run(&mut self, path: &str) -> Result<Vec<Token>> {
    let file = SourceFile::read(path, 1)?;
    self.files.push(file.clone());
    let toks = tokenize(file)?;
    self.run_tokens(toks)
  }

  /// As [`Preprocessor::run`], from an in-memory buffer.
  pub fn run_text(&mut self, name: &str, text: &str) -> Result<Vec<Token>> {
    let file = SourceFile::from_text(name, 1, text);
    self.files.push(file.clone());
    let toks = tokenize(file)?;
    self.run_tokens(toks)
  }

  fn run_tokens(&mut self, toks: Vec<Token>) -> Result<Vec<Token>> {
    self.input = toks;
    self.input.reverse();
    let mut out = self.preprocess2()?;
    if let Some(ci) = self.cond_incl.last() {
      return Err(ci.tok.error("unterminated conditional directive"))
    }
    out.push(self.pop());
    let mut out = join_string_literals(out)?;
    convert_pp_tokens(&mut out)?;
    convert_keywords(&mut out);
    Ok(out)
  }

  // ---------------------------------------------------------------------
  // Token stack

  fn peek(&self) -> &Token {
    self.input.last().expect("token stack underflow")
  }

  fn peek2(&self) -> Option<&Token> {
    self.input.len().checked_sub(2).map(|i| &self.input[i])
  }

  fn pop(&mut self) -> Token {
    if self.peek().is_eof() {
      return self.peek().clone()
    }
    self.input.pop().expect("token stack underflow")
  }

  /// Push a token sequence in front of the remaining input, dropping a
  /// trailing EOF if present.
  fn push_stream(&mut self, mut toks: Vec<Token>) {
    if toks.last().is_some_and(Token::is_eof) {
      toks.pop();
    }
    toks.reverse();
    self.input.append(&mut toks);
  }

  /// Is the current token a `#` at the beginning of a line?
  fn at_hash(&self) -> bool {
    self.peek().at_bol() && self.peek().is("#")
  }

  /// Pop the rest of the logical line.
  fn copy_line(&mut self) -> Vec<Token> {
    let mut out = vec![];
    while !self.peek().at_bol() && !self.peek().is_eof() {
      out.push(self.pop());
    }
    out
  }

  /// Directives such as `#include` allow extraneous tokens before the
  /// newline; warn and skip them.
  fn skip_line(&mut self) {
    if self.peek().at_bol() || self.peek().is_eof() {
      return
    }
    self.peek().warn("extra token");
    while !self.peek().at_bol() && !self.peek().is_eof() {
      self.pop();
    }
  }

  /// Run the expansion loop over a detached token sequence (macro
  /// arguments, `#if` lines, `#include` arguments).
  fn preprocess_tokens(&mut self, toks: Vec<Token>) -> Result<Vec<Token>> {
    let saved = std::mem::take(&mut self.input);
    self.input = tokenize_text("<eof>", 1, "").expect("empty buffer");
    let mut rest = toks;
    rest.reverse();
    self.input.append(&mut rest);
    let result = self.preprocess2();
    self.input = saved;
    result
  }

  // ---------------------------------------------------------------------
  // Macro expansion

  fn find_macro(&self, tok: &Token) -> Option<&Macro> {
    if !tok.is_ident() {
      return None
    }
    let m = self.macros.get(&intern(tok.text()))?;
    if m.deleted { None } else { Some(m) }
  }

  fn new_num_token(&self, val: i64, tmpl: &Token) -> Token {
    let mut toks = tokenize_text(&tmpl.file.name, tmpl.file.file_no, &format!("{val}\n"))
      .expect("number token");
    let mut tok = toks.swap_remove(0);
    tok.flags = tmpl.flags;
    tok
  }

  fn new_str_token(&self, s: &str, tmpl: &Token) -> Result<Token> {
    let quoted = quote_string(s);
    let mut toks = tokenize_text(&tmpl.file.name, tmpl.file.file_no, &quoted)
      .map_err(|_| tmpl.error("invalid stringized literal"))?;
    let mut tok = toks.swap_remove(0);
    tok.flags = tmpl.flags;
    Ok(tok)
  }

  /// Concatenate two tokens and re-tokenize the result; it must form
  /// exactly one token.
  fn paste(&self, lhs: &Token, rhs: &Token) -> Result<Token> {
    let buf = format!("{}{}", lhs.text(), rhs.text());
    let toks = tokenize_text(&lhs.file.name, lhs.file.file_no, &buf)
      .map_err(|_| lhs.error(format_args!("pasting forms '{buf}', an invalid token")))?;
    if toks.len() != 2 {
      return Err(lhs.error(format_args!("pasting forms '{buf}', an invalid token")))
    }
    let mut tok = toks.into_iter().next().expect("pasted token");
    tok.flags = lhs.flags;
    Ok(tok)
  }

  /// Substitute macro parameters in a function-like body, handling `#`
  /// (stringize) and `##` (paste).
  fn subst(&mut self, body: &[Token], args: &[(Symbol, Vec<Token>)]) -> Result<Vec<Token>> {
    fn find_arg<'b>(args: &'b [(Symbol, Vec<Token>)], tok: &Token) -> Option<&'b Vec<Token>> {
      if !tok.is_ident() {
        return None
      }
      let name = intern(tok.text());
      args.iter().find(|(n, _)| *n == name).map(|(_, ts)| ts)
    }

    let mut out: Vec<Token> = vec![];
    let mut i = 0;

    while i < body.len() {
      let tok = &body[i];

      // "#" followed by a parameter becomes the stringized (unexpanded)
      // actual tokens.
      if tok.is("#") {
        let Some(arg) = body.get(i + 1).and_then(|t| find_arg(args, t)) else {
          return Err(tok.error("'#' is not followed by a macro parameter"))
        };
        out.push(self.new_str_token(&join_tokens(arg), tok)?);
        i += 2;
        continue
      }

      // `##` pastes the previous output token with what follows.
      if tok.is("##") {
        if out.is_empty() {
          return Err(tok.error("'##' cannot appear at start of macro expansion"))
        }
        let Some(rhs) = body.get(i + 1) else {
          return Err(tok.error("'##' cannot appear at end of macro expansion"))
        };
        if let Some(arg) = find_arg(args, rhs) {
          // x ## ε is x.
          if !arg.is_empty() {
            let last = out.pop().expect("paste operand");
            out.push(self.paste(&last, &arg[0])?);
            out.extend(arg[1..].iter().cloned());
          }
        } else {
          let last = out.pop().expect("paste operand");
          out.push(self.paste(&last, rhs)?);
        }
        i += 2;
        continue
      }

      if let Some(arg) = find_arg(args, tok) {
        // A parameter that is the left operand of `##` substitutes
        // without expansion; ε ## y is y.
        if body.get(i + 1).is_some_and(|t| t.is("##")) {
          if arg.is_empty() {
            let Some(rhs) = body.get(i + 2) else {
              return Err(tok.error("'##' cannot appear at end of macro expansion"))
            };
            if let Some(arg2) = find_arg(args, rhs) {
              out.extend(arg2.iter().cloned());
            } else {
              out.push(rhs.clone());
            }
            i += 3;
          } else {
            out.extend(arg.iter().cloned());
            i += 1;
          }
          continue
        }

        // A plain parameter is replaced by its fully expanded argument.
        let expanded = self.preprocess_tokens(arg.clone())?;
        out.extend(expanded);
        i += 1;
        continue
      }

      out.push(tok.clone());
      i += 1;
    }
    Ok(out)
  }

  /// Collect one macro argument: up to an unparenthesized `,` or `)`
  /// (`read_rest` keeps going through commas, for `__VA_ARGS__`).
  fn read_macro_arg_one(&mut self, read_rest: bool) -> Result<Vec<Token>> {
    let mut toks = vec![];
    let mut level = 0;

    loop {
      let t = self.peek();
      if t.is_eof() {
        return Err(t.error("premature end of macro arguments"))
      }
      if level == 0 && t.is(")") {
        break
      }
      if level == 0 && !read_rest && t.is(",") {
        break
      }
      if t.is("(") {
        level += 1;
      } else if t.is(")") {
        level -= 1;
      }
      toks.push(self.pop());
    }
    Ok(toks)
  }

  /// Read a parenthesized argument list; the cursor is on the `(`.
  /// Returns the named arguments and the closing parenthesis (whose
  /// hideset enters Prosser's intersection).
  fn read_macro_args(
    &mut self, params: &[Symbol], va_args: bool, start: &Token,
  ) -> Result<(Vec<(Symbol, Vec<Token>)>, Token)> {
    self.pop();
    let mut args = vec![];

    for (i, &p) in params.iter().enumerate() {
      if i > 0 {
        if !self.peek().is(",") {
          return Err(self.peek().error("expected ','"))
        }
        self.pop();
      }
      args.push((p, self.read_macro_arg_one(false)?));
    }

    if va_args {
      let rest = if self.peek().is(")") {
        vec![]
      } else {
        if !params.is_empty() {
          if !self.peek().is(",") {
            return Err(self.peek().error("expected ','"))
          }
          self.pop();
        }
        self.read_macro_arg_one(true)?
      };
      args.push((intern("__VA_ARGS__"), rest));
    }

    if !self.peek().is(")") {
      return Err(start.error("too many arguments"))
    }
    let rparen = self.pop();
    Ok((args, rparen))
  }

  /// If the current token is an invocable macro, expand it in place and
  /// return true.
  fn expand_macro(&mut self) -> Result<bool> {
    let tok = self.peek();
    if !tok.is_ident() {
      return Ok(false)
    }
    let name = intern(tok.text());
    if tok.hideset.contains(&name) {
      return Ok(false)
    }
    let Some(m) = self.find_macro(tok) else { return Ok(false) };
    let m = m.clone();

    match m.body {
      MacroBody::Dynamic(dynamic) => {
        let tok = self.pop();
        let new = match dynamic {
          DynamicMacro::File => self.new_str_token(&tok.file.name, &tok)?,
          DynamicMacro::Line => self.new_num_token(i64::from(tok.line_no), &tok),
        };
        self.push_stream(vec![new]);
        Ok(true)
      }
      MacroBody::Obj(body) => {
        let tok = self.pop();
        let hs = tok.hideset.update(name);
        let mut body: Vec<Token> = body.iter().map(|t| {
          let mut t = t.clone();
          t.hideset = t.hideset.clone().union(hs.clone());
          t
        }).collect();
        if let Some(first) = body.first_mut() {
          first.flags = tok.flags;
        }
        self.push_stream(body);
        Ok(true)
      }
      MacroBody::Func { params, va_args, body } => {
        // A function-like macro name without an argument list is a plain
        // identifier.
        let tok = self.pop();
        if !self.peek().is("(") {
          self.input.push(tok);
          return Ok(false)
        }

        let (args, rparen) = self.read_macro_args(&params, va_args, &tok)?;
        let hs = tok.hideset.clone()
          .intersection(rparen.hideset.clone())
          .update(name);
        let mut body = self.subst(&body, &args)?;
        for t in &mut body {
          t.hideset = t.hideset.clone().union(hs.clone());
        }
        if let Some(first) = body.first_mut() {
          first.flags = tok.flags;
        }
        self.push_stream(body);
        Ok(true)
      }
    }
  }

  // ---------------------------------------------------------------------
  // Directives

  fn read_macro_definition(&mut self) -> Result<()> {
    let name_tok = self.peek().clone();
    if !name_tok.is_ident() {
      return Err(name_tok.error("macro name must be an identifier"))
    }
    let name = intern(name_tok.text());
    self.pop();

    let body = if self.peek().is("(") && !self.peek().has_space() && !self.peek().at_bol() {
      // Function-like: the '(' must be adjacent to the name.
      self.pop();
      let mut params = vec![];
      let mut va_args = false;
      while !self.peek().is(")") {
        if !params.is_empty() && !va_args {
          if !self.peek().is(",") {
            return Err(self.peek().error("expected ','"))
          }
          self.pop();
        }
        if self.peek().is("...") {
          self.pop();
          va_args = true;
          break
        }
        if !self.peek().is_ident() {
          return Err(self.peek().error("expected an identifier"))
        }
        params.push(intern(self.pop().text()));
      }
      if !self.peek().is(")") {
        return Err(self.peek().error("expected ')'"))
      }
      self.pop();
      MacroBody::Func { params, va_args, body: self.copy_line() }
    } else {
      MacroBody::Obj(self.copy_line())
    };

    self.macros.insert(name, Macro { body, deleted: false });
    Ok(())
  }

  /// Resolve an `#include` argument to a file path. `#include MACRO`
  /// expands the line first and retries.
  fn read_include_path(&mut self) -> Result<(String, bool, Token)> {
    let start = self.peek().clone();

    // Pattern 1: #include "foo.h". The spelling is used verbatim; escape
    // sequences are not interpreted in an include name.
    if matches!(start.kind, TokenKind::Str { .. }) {
      let text = start.text();
      let filename = text[1..text.len() - 1].to_owned();
      self.pop();
      self.skip_line();
      return Ok((filename, true, start))
    }

    // Pattern 2: #include <foo.h>, reconstructed from the tokens between
    // the angle brackets.
    if start.is("<") {
      self.pop();
      let mut toks = vec![];
      while !self.peek().is(">") {
        if self.peek().at_bol() || self.peek().is_eof() {
          return Err(start.error("expected '>'"))
        }
        toks.push(self.pop());
      }
      self.pop();
      self.skip_line();
      return Ok((join_tokens(&toks), false, start))
    }

    // Pattern 3: #include FOO.
    if start.is_ident() {
      let line = self.copy_line();
      let expanded = self.preprocess_tokens(line)?;
      self.push_stream(expanded);
      return self.read_include_path()
    }

    Err(start.error("expected a filename"))
  }

  fn include_file(&mut self, filename: &str, quoted: bool, start: &Token) -> Result<()> {
    let mut candidates: Vec<PathBuf> = vec![];
    if quoted {
      let dir = std::path::Path::new(&start.file.name)
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
      candidates.push(dir.join(filename));
    }
    candidates.extend(self.opts.include_paths.iter().map(|dir| dir.join(filename)));

    let Some(path) = candidates.iter().find(|p| p.exists()) else {
      return Err(start.error(format_args!("'{filename}': file not found")))
    };

    let file = SourceFile::read(&path.to_string_lossy(), self.files.len() + 1)?;
    self.files.push(file.clone());
    let toks = tokenize(file)?;
    self.push_stream(toks);
    Ok(())
  }

  /// Evaluate the controlling expression of `#if`/`#elif`.
  fn eval_const_expr(&mut self, start: &Token) -> Result<i64> {
    let line = self.copy_line();
    if line.is_empty() {
      return Err(start.error("no expression"))
    }

    // Rewrite `defined(X)` and `defined X` before expansion.
    let mut toks = vec![];
    let mut i = 0;
    while i < line.len() {
      if line[i].is("defined") {
        let has_paren = line.get(i + 1).is_some_and(|t| t.is("("));
        let name_idx = if has_paren { i + 2 } else { i + 1 };
        let Some(name_tok) = line.get(name_idx).filter(|t| t.is_ident()) else {
          return Err(line[i].error("macro name must be an identifier"))
        };
        if has_paren && !line.get(name_idx + 1).is_some_and(|t| t.is(")")) {
          return Err(line[i].error("expected ')'"))
        }
        let defined = self.find_macro(name_tok).is_some();
        toks.push(self.new_num_token(i64::from(defined), &line[i]));
        i = name_idx + if has_paren { 2 } else { 1 };
        continue
      }
      toks.push(line[i].clone());
      i += 1;
    }

    let mut expanded = self.preprocess_tokens(toks)?;

    // Identifiers that survive expansion become 0.
    for t in &mut expanded {
      if t.is_ident() {
        *t = self.new_num_token(0, t);
      }
    }
    convert_pp_tokens(&mut expanded)?;
    expanded.extend(tokenize_text("<eof>", start.file.file_no, "").expect("eof"));
    crate::parse::const_expr_tokens(&expanded)
  }

  /// Classify the directive keyword after a line-initial `#`, if any.
  fn peek_directive(&self) -> Option<&'static str> {
    if !self.at_hash() {
      return None
    }
    let t = self.peek2()?;
    for d in ["if", "ifdef", "ifndef", "elif", "else", "endif"] {
      if t.is(d) {
        return Some(d)
      }
    }
    None
  }

  /// Skip tokens until the matching `#endif`, consuming it.
  fn skip_cond_incl2(&mut self) {
    while !self.peek().is_eof() {
      match self.peek_directive() {
        Some("if" | "ifdef" | "ifndef") => {
          self.pop();
          self.pop();
          self.skip_cond_incl2();
        }
        Some("endif") => {
          self.pop();
          self.pop();
          return
        }
        _ => {
          self.pop();
        }
      }
    }
  }

  /// Skip an excluded conditional section, stopping at the `#` of the
  /// matching `#elif`/`#else`/`#endif` (nested groups are skipped whole).
  fn skip_cond_incl(&mut self) {
    while !self.peek().is_eof() {
      match self.peek_directive() {
        Some("if" | "ifdef" | "ifndef") => {
          self.pop();
          self.pop();
          self.skip_cond_incl2();
        }
        Some("elif" | "else" | "endif") => return,
        _ => {
          self.pop();
        }
      }
    }
  }

  // ---------------------------------------------------------------------
  // The main loop

  fn preprocess2(&mut self) -> Result<Vec<Token>> {
    let mut out = vec![];

    while !self.peek().is_eof() {
      if self.expand_macro()? {
        continue
      }

      if !self.at_hash() {
        out.push(self.pop());
        continue
      }

      let start = self.pop();

      // A `#`-only line is a null directive.
      if self.peek().at_bol() || self.peek().is_eof() {
        continue
      }

      let dir = self.peek().clone();

      if dir.is("include") {
        self.pop();
        let (filename, quoted, tok) = self.read_include_path()?;
        self.include_file(&filename, quoted, &tok)?;
        continue
      }

      if dir.is("define") {
        self.pop();
        self.read_macro_definition()?;
        continue
      }

      if dir.is("undef") {
        self.pop();
        let name_tok = self.peek().clone();
        if !name_tok.is_ident() {
          return Err(name_tok.error("macro name must be an identifier"))
        }
        self.pop();
        self.skip_line();
        self.macros.insert(intern(name_tok.text()),
          Macro { body: MacroBody::Obj(vec![]), deleted: true });
        continue
      }

      if dir.is("if") {
        self.pop();
        let val = self.eval_const_expr(&dir)?;
        self.cond_incl.push(CondIncl { ctx: CondCtx::InThen, tok: start, included: val != 0 });
        if val == 0 {
          self.skip_cond_incl();
        }
        continue
      }

      if dir.is("ifdef") || dir.is("ifndef") {
        let negate = dir.is("ifndef");
        self.pop();
        let defined = self.find_macro(self.peek()).is_some();
        let included = defined != negate;
        self.pop();
        self.cond_incl.push(CondIncl { ctx: CondCtx::InThen, tok: start, included });
        self.skip_line();
        if !included {
          self.skip_cond_incl();
        }
        continue
      }

      if dir.is("elif") {
        self.pop();
        let Some(top) = self.cond_incl.last_mut() else {
          return Err(start.error("stray #elif"))
        };
        if top.ctx == CondCtx::InElse {
          return Err(start.error("stray #elif"))
        }
        top.ctx = CondCtx::InElif;
        let was_included = top.included;

        if !was_included && self.eval_const_expr(&dir)? != 0 {
          self.cond_incl.last_mut().expect("conditional stack").included = true;
        } else {
          self.skip_cond_incl();
        }
        continue
      }

      if dir.is("else") {
        self.pop();
        let Some(top) = self.cond_incl.last_mut() else {
          return Err(start.error("stray #else"))
        };
        if top.ctx == CondCtx::InElse {
          return Err(start.error("stray #else"))
        }
        top.ctx = CondCtx::InElse;
        let included = top.included;
        self.skip_line();
        if included {
          self.skip_cond_incl();
        }
        continue
      }

      if dir.is("endif") {
        self.pop();
        if self.cond_incl.pop().is_none() {
          return Err(start.error("stray #endif"))
        }
        self.skip_line();
        continue
      }

      if dir.is("error") {
        self.pop();
        let msg = self.copy_line().iter().map(Token::text).join(" ");
        return Err(start.error(format_args!("#error {msg}")))
      }

      return Err(dir.error("invalid preprocessor directive"))
    }

    Ok(out)
  }
}

/// Concatenate adjacent string literals into single tokens.
fn join_string_literals(toks: Vec<Token>) -> Result<Vec<Token>> {
  let mut out: Vec<Token> = vec![];
  for tok in toks {
    if let TokenKind::Str { bytes, elem } = &tok.kind {
      if let Some(prev) = out.last_mut() {
        if let TokenKind::Str { bytes: prev_bytes, elem: prev_elem } = &mut prev.kind {
          if prev_elem != elem {
            return Err(tok.error("unsupported concatenation of string literals"))
          }
          // Drop the previous terminator and append.
          prev_bytes.truncate(prev_bytes.len() - *elem as usize);
          prev_bytes.extend_from_slice(bytes);
          continue
        }
      }
    }
    out.push(tok);
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tokenize::NumLit;

  fn preprocess(src: &str) -> Vec<Token> {
    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    pp.run_text("test.c", src).expect("preprocess")
  }

  fn rendered(src: &str) -> String {
    render_tokens(&preprocess(src))
  }

  #[test]
  fn objlike_macro_expands() {
    assert_eq!(rendered("#define N 42\nint x = N;\n"), "int x = 42 ;\n");
  }

  #[test]
  fn funclike_macro_expands_args() {
    let out = rendered("#define ADD(a,b) ((a)+(b))\nint main(){return ADD(2,3);}\n");
    assert_eq!(out, "int main ( ) { return ( ( 2 ) + ( 3 ) ) ; }\n");
  }

  #[test]
  fn funclike_name_without_parens_is_an_identifier() {
    let out = rendered("#define F(x) x\nint F = 1; int y = F(2);\n");
    assert_eq!(out, "int F = 1 ; int y = 2 ;\n");
  }

  #[test]
  fn recursive_macro_terminates() {
    // #define X X leaves X as an identifier.
    let out = preprocess("#define X X\nX\n");
    assert!(out[0].is_ident());
    assert_eq!(out[0].text(), "X");
  }

  #[test]
  fn mutually_recursive_macros_terminate() {
    let out = rendered("#define T U\n#define U T\nT U\n");
    assert_eq!(out, "T U\n");
  }

  #[test]
  fn stringize_preserves_spacing() {
    let out = rendered("#define STR(x) #x\nchar *s = STR(a + b);\n");
    assert_eq!(out, "char * s = \"a + b\" ;\n");
  }

  #[test]
  fn paste_forms_one_token() {
    assert_eq!(rendered("#define CAT(a,b) a##b\nint CAT(foo,bar) = 1;\n"),
      "int foobar = 1 ;\n");
  }

  #[test]
  fn paste_with_empty_argument() {
    assert_eq!(rendered("#define CAT(a,b) a##b\nint CAT(foo,) = CAT(,1);\n"),
      "int foo = 1 ;\n");
  }

  #[test]
  fn invalid_paste_is_an_error() {
    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    assert!(pp.run_text("t.c", "#define CAT(a,b) a##b\nint x = CAT(1,=);\n").is_err());
  }

  #[test]
  fn variadic_macro() {
    let out = rendered("#define F(fmt, ...) printf(fmt, __VA_ARGS__)\nF(\"%d\", 1, 2);\n");
    assert_eq!(out, "printf ( \"%d\" , 1 , 2 ) ;\n");
  }

  #[test]
  fn conditional_inclusion() {
    let out = rendered("#if 0\nint a;\n#elif 1\nint b;\n#else\nint c;\n#endif\n");
    assert_eq!(out, "int b ;\n");
  }

  #[test]
  fn ifdef_and_undef() {
    let src = "#define A\n#ifdef A\nint a;\n#endif\n#undef A\n#ifdef A\nint b;\n#endif\n";
    assert_eq!(rendered(src), "int a ;\n");
  }

  #[test]
  fn defined_operator() {
    let src = "#define A 1\n#if defined(A) && defined B\nint x;\n#else\nint y;\n#endif\n";
    assert_eq!(rendered(src), "int y ;\n");
  }

  #[test]
  fn undefined_identifiers_become_zero() {
    assert_eq!(rendered("#if FOO\nint a;\n#else\nint b;\n#endif\n"), "int b ;\n");
  }

  #[test]
  fn unterminated_if_is_an_error() {
    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    assert!(pp.run_text("t.c", "#if 1\nint x;\n").is_err());
    let mut pp = Preprocessor::new(&opts);
    assert!(pp.run_text("t.c", "#endif\n").is_err());
  }

  #[test]
  fn adjacent_strings_are_joined() {
    let out = preprocess("char *s = \"ab\" \"cd\";\n");
    let strs: Vec<_> = out.iter().filter_map(|t| match &t.kind {
      TokenKind::Str { bytes, .. } => Some(bytes.clone()),
      _ => None,
    }).collect();
    assert_eq!(strs, vec![b"abcd\0".to_vec()]);
  }

  #[test]
  fn pp_numbers_become_typed_after_expansion() {
    let out = preprocess("#define N 10\nint x = N;\n");
    assert!(out.iter().any(|t|
      matches!(t.kind, TokenKind::Num(NumLit::Int { val: 10, .. }))));
  }

  #[test]
  fn line_and_file_macros() {
    let out = rendered("int a = __LINE__;\nchar *f = __FILE__;\n");
    assert_eq!(out, "int a = 1 ;\nchar * f = \"test.c\" ;\n");
  }

  #[test]
  fn predefined_macros_exist() {
    assert_eq!(rendered("long v = __STDC_VERSION__;\n"), "long v = 201112L ;\n");
    assert_eq!(rendered("int x = __x86_64__;\n"), "int x = 1 ;\n");
  }

  #[test]
  fn null_directive_is_accepted() {
    assert_eq!(rendered("#\nint x;\n"), "int x ;\n");
  }

  #[test]
  fn hash_not_at_bol_is_not_a_directive() {
    // Only a `#` that begins a line starts a directive.
    assert_eq!(rendered("int a; # define\n"), "int a ; # define\n");
  }

  #[test]
  fn include_searches_the_current_directory_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("header.h"), "int from_header;\n").expect("write");
    let main = dir.path().join("main.c");
    std::fs::write(&main, "#include \"header.h\"\nint x;\n").expect("write");

    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    let toks = pp.run(&main.to_string_lossy()).expect("preprocess");
    assert_eq!(render_tokens(&toks), "int from_header ;\nint x ;\n");
    assert_eq!(pp.input_files().len(), 2);
  }

  #[test]
  fn include_via_search_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("sys.h"), "int from_sys;\n").expect("write");

    let opts = Options { include_paths: vec![dir.path().to_path_buf()], pic: true };
    let mut pp = Preprocessor::new(&opts);
    let toks = pp.run_text("main.c", "#include <sys.h>\nint x;\n").expect("preprocess");
    assert_eq!(render_tokens(&toks), "int from_sys ;\nint x ;\n");
  }

  #[test]
  fn missing_include_is_an_error() {
    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    assert!(pp.run_text("t.c", "#include \"no-such-file.h\"\n").is_err());
  }

  #[test]
  fn error_directive() {
    let opts = Options::default();
    let mut pp = Preprocessor::new(&opts);
    let err = pp.run_text("t.c", "#error unsupported platform\n").unwrap_err();
    assert!(err.to_string().contains("unsupported platform"));
  }

  #[test]
  fn expansion_is_idempotent_under_e() {
    let src = "#define ADD(a,b) ((a)+(b))\nint main(){return ADD(2,3);}\n";
    let first = rendered(src);
    let second = rendered(&first);
    assert_eq!(first, second);
  }
}
