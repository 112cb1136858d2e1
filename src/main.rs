//! The compiler driver: GCC-style argument parsing, the pipeline, the
//! temporary-file dance, and the external assembler.
//!
//! Flags follow the GCC single-dash convention (`-Idir`, `-MD`, `-fpic`),
//! which is why the argument loop is hand-written: `-MD` and `-M D` are
//! different options.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use itertools::Itertools;

use nanocc::preprocess::{Preprocessor, render_tokens};
use nanocc::{Error, Options, Result, SourceFile, codegen, parse};

struct Args {
  input: String,
  output: Option<String>,
  opt_s: bool,
  opt_e: bool,
  opt_m: bool,
  opt_md: bool,
  opt_mp: bool,
  opt_mt: Option<String>,
  opt_mf: Option<String>,
  defines: Vec<String>,
  include_paths: Vec<PathBuf>,
  pic: bool,
}

fn usage(status: u8) -> ! {
  eprintln!("nanocc [ -o <path> ] <file>");
  std::process::exit(i32::from(status))
}

fn parse_args() -> Result<Args> {
  let argv: Vec<String> = std::env::args().collect();
  let mut args = Args {
    input: String::new(),
    output: None,
    opt_s: false, opt_e: false,
    opt_m: false, opt_md: false, opt_mp: false,
    opt_mt: None, opt_mf: None,
    defines: vec![],
    include_paths: vec![],
    pic: true,
  };

  let mut i = 1;
  let take_value = |argv: &[String], i: &mut usize| -> Result<String> {
    *i += 1;
    argv.get(*i).cloned().ok_or_else(|| Error::msg("argument missing"))
  };

  while i < argv.len() {
    let arg = argv[i].as_str();
    match arg {
      "--help" => usage(0),
      "-o" => args.output = Some(take_value(&argv, &mut i)?),
      "-S" => args.opt_s = true,
      // Compile-to-object is the default mode; -c is accepted for
      // compatibility with build systems that pass it.
      "-c" => {}
      "-E" => args.opt_e = true,
      "-M" => {
        args.opt_m = true;
        args.opt_e = true;
      }
      "-MD" => args.opt_md = true,
      "-MP" => args.opt_mp = true,
      "-MT" => args.opt_mt = Some(take_value(&argv, &mut i)?),
      "-MF" => args.opt_mf = Some(take_value(&argv, &mut i)?),
      "-I" => args.include_paths.push(PathBuf::from(take_value(&argv, &mut i)?)),
      "-D" => args.defines.push(take_value(&argv, &mut i)?),
      "-fpic" | "-fPIC" => args.pic = true,
      "-fno-pic" | "-fno-PIC" => args.pic = false,
      _ if arg.starts_with("-MT") => args.opt_mt = Some(arg[3..].to_owned()),
      _ if arg.starts_with("-MF") => args.opt_mf = Some(arg[3..].to_owned()),
      _ if arg.starts_with("-o") => args.output = Some(arg[2..].to_owned()),
      _ if arg.starts_with("-I") => args.include_paths.push(PathBuf::from(&arg[2..])),
      _ if arg.starts_with("-D") => args.defines.push(arg[2..].to_owned()),
      _ if arg.starts_with('-') && arg.len() > 1 =>
        return Err(Error::msg(format!("unknown argument: {arg}"))),
      _ => args.input = arg.to_owned(),
    }
    i += 1;
  }

  if args.input.is_empty() {
    return Err(Error::msg("no input files"))
  }
  Ok(args)
}

/// Default output name: the input with `.c` replaced by `.s` or `.o`.
fn default_output(input: &str, assembly: bool) -> String {
  let ext = if assembly { "s" } else { "o" };
  let base = Path::new(input)
    .file_name()
    .map_or_else(|| input.to_owned(), |f| f.to_string_lossy().into_owned());
  match base.strip_suffix(".c") {
    Some(stem) if !stem.is_empty() => format!("{stem}.{ext}"),
    _ => format!("{base}.{ext}"),
  }
}

/// This compiler's own headers are expected in `include/` next to the
/// executable; the standard system paths follow.
fn default_include_paths() -> Vec<PathBuf> {
  let mut paths = vec![];
  if let Ok(exe) = std::env::current_exe() {
    if let Some(dir) = exe.parent() {
      paths.push(dir.join("include"));
    }
  }
  paths.push(PathBuf::from("/usr/local/include"));
  paths.push(PathBuf::from("/usr/include/x86_64-linux-gnu"));
  paths.push(PathBuf::from("/usr/include"));
  paths
}

/// Write make-style dependency information for `-M`/`-MD`.
fn print_dependencies(args: &Args, files: &[String]) -> Result<()> {
  let target = args.opt_mt.clone()
    .unwrap_or_else(|| default_output(&args.input, args.opt_s));

  let mut text = format!("{target}:");
  for f in files {
    text.push_str(&format!(" \\\n {f}"));
  }
  text.push_str("\n\n");
  if args.opt_mp {
    text.push_str(&files.iter().skip(1).map(|f| format!("{f}:\n")).join("\n"));
  }

  let out_path = match &args.opt_mf {
    Some(f) => Some(f.clone()),
    // -MD without -MF writes next to the output file.
    None if args.opt_md => Some(format!("{}.d",
      args.output.clone().unwrap_or_else(|| default_output(&args.input, args.opt_s)))),
    None => None,
  };
  match out_path {
    Some(path) => std::fs::write(&path, text)
      .map_err(|e| Error::msg(format!("cannot write {path}: {e}")))?,
    None => print!("{text}"),
  }
  Ok(())
}

fn run_assembler(asm: &[u8], output: &str) -> Result<()> {
  let mut tmp = tempfile::Builder::new()
    .prefix("nanocc-")
    .suffix(".s")
    .tempfile()
    .map_err(|e| Error::msg(format!("cannot create a temporary file: {e}")))?;
  tmp.write_all(asm)
    .map_err(|e| Error::msg(format!("cannot write a temporary file: {e}")))?;

  let status = std::process::Command::new("as")
    .arg("-c")
    .arg("-o")
    .arg(output)
    .arg(tmp.path())
    .status()
    .map_err(|e| Error::msg(format!("exec failed: as: {e}")))?;
  if !status.success() {
    return Err(Error::msg("as returned a non-zero status"))
  }
  Ok(())
}

fn run() -> Result<()> {
  let args = parse_args()?;

  let mut opts = Options { include_paths: args.include_paths.clone(), pic: args.pic };
  opts.include_paths.extend(default_include_paths());

  // Tokenize and preprocess.
  let mut pp = Preprocessor::new(&opts);
  for def in &args.defines {
    match def.split_once('=') {
      Some((name, val)) => pp.define(name, val)?,
      None => pp.define(def, "")?,
    }
  }
  let toks = pp.run(&args.input)?;
  let files: Vec<Rc<SourceFile>> = pp.input_files().to_vec();

  if args.opt_m || args.opt_md {
    let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
    print_dependencies(&args, &names)?;
    // -M replaces the preprocessed output; -MD is in addition to
    // compilation.
    if args.opt_m {
      return Ok(())
    }
  }

  if args.opt_e {
    print!("{}", render_tokens(&toks));
    return Ok(())
  }

  // Parse and emit.
  let mut prog = parse::parse(toks)?;
  let mut asm: Vec<u8> = vec![];
  codegen::codegen(&mut prog, &opts, &files, &mut asm)?;

  let output = args.output.clone()
    .unwrap_or_else(|| default_output(&args.input, args.opt_s));

  if args.opt_s {
    if output == "-" {
      std::io::stdout().write_all(&asm)
        .map_err(|e| Error::msg(format!("cannot write to stdout: {e}")))?;
    } else {
      std::fs::write(&output, &asm)
        .map_err(|e| Error::msg(format!("cannot open output file: {output}: {e}")))?;
    }
    return Ok(())
  }

  run_assembler(&asm, &output)
}

fn main() -> ExitCode {
  match run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("{e}");
      ExitCode::FAILURE
    }
  }
}
