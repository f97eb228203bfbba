//! MIL Compiler Library
//!
//! Provides compilation from `.mil` and `.lc` sources to LLVM IR and
//! executable binaries, plus direct interpretation.
//!
//! The pipeline: parse (LC additionally lambda-lifts and lowers onto
//! MIL), check, optimize to a fixpoint, lower representations to machine
//! words, optimize the generated blocks, and emit LLVM IR. `clang` turns
//! the IR into an executable.
//!
//! ```rust,ignore
//! use milc::{compile_to_ir, CompilerConfig, Dialect};
//!
//! let ir = compile_to_ir(source, Dialect::Mil, &CompilerConfig::default())?;
//! ```

pub mod check;
pub mod config;
pub mod display;
pub mod emit;
pub mod facts;
pub mod interp;
pub mod lc;
pub mod lift;
pub mod lower;
pub mod mil;
pub mod parser;
pub mod passes;
pub mod prims;
pub mod repr;
pub mod rewrite;
pub mod types;

pub use config::{CompilerConfig, PassConfig};
pub use emit::EmitError;
pub use interp::{run_program, RunResult, Value};
pub use mil::Program;
pub use parser::Parser;

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

/// Which source dialect a file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mil,
    Lc,
}

impl Dialect {
    /// Pick the dialect from a file extension; `.mil` wins ties.
    pub fn from_path(path: &Path) -> Dialect {
        match path.extension().and_then(|e| e.to_str()) {
            Some("lc") => Dialect::Lc,
            _ => Dialect::Mil,
        }
    }
}

/// The emitted IR relies on opaque pointers, available from LLVM 15 on.
const MIN_LLVM_MAJOR: u32 = 15;

/// One-shot result of probing the local clang; later callers reuse it.
static CLANG_PROBE: OnceLock<Result<(), String>> = OnceLock::new();

/// Make sure a usable clang is on PATH before handing it any IR.
///
/// `clang -dumpversion` prints a bare dotted version, which is enough for
/// the common case. Apple ships clang under its own numbering that trails
/// the LLVM release inside it by one, so a too-low answer gets a second
/// look at the vendor banner before being rejected.
fn ensure_clang() -> Result<(), String> {
    CLANG_PROBE
        .get_or_init(|| {
            let major = clang_major()?;
            if major >= MIN_LLVM_MAJOR {
                return Ok(());
            }
            if major == MIN_LLVM_MAJOR - 1 && clang_is_apple()? {
                return Ok(());
            }
            Err(format!(
                "clang reports major version {}, but emitted modules need \
                 LLVM {} or newer (opaque pointers). Upgrade clang, or \
                 keep the .ll output with --keep-ir and compile it with a \
                 newer toolchain.",
                major, MIN_LLVM_MAJOR
            ))
        })
        .clone()
}

fn run_clang_probe(arg: &str) -> Result<String, String> {
    let out = Command::new("clang").arg(arg).output().map_err(|e| {
        format!(
            "could not invoke clang ({}); install clang {} or newer to \
             build executables",
            e, MIN_LLVM_MAJOR
        )
    })?;
    if !out.status.success() {
        return Err(format!(
            "clang {} exited with status {:?}",
            arg,
            out.status.code()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn clang_major() -> Result<u32, String> {
    let text = run_clang_probe("-dumpversion")?;
    parse_major(&text).ok_or_else(|| {
        format!(
            "unrecognized clang -dumpversion output {:?}; expected a \
             dotted version number",
            text.trim()
        )
    })
}

/// Leading component of a dotted version string.
fn parse_major(text: &str) -> Option<u32> {
    text.trim().split('.').next()?.parse().ok()
}

fn clang_is_apple() -> Result<bool, String> {
    let banner = run_clang_probe("--version")?;
    Ok(banner.contains("Apple"))
}

/// Parse a source string into a checked MIL program.
pub fn load_program(
    source: &str,
    dialect: Dialect,
    config: &CompilerConfig,
) -> Result<Program, String> {
    let prog = match dialect {
        Dialect::Mil => Parser::new(source).parse()?,
        Dialect::Lc => {
            let lc = lc::LcParser::new(source).parse()?;
            let lifted = if config.lift {
                lift::lift_program(&lc, &[])?
            } else {
                lift::skip_lift(&lc)
            };
            lower::lower_program(&lifted)?
        }
    };
    check::check_program(&prog)?;
    Ok(prog)
}

/// Run the optimizer (and, when configured, representation lowering) over
/// a program in place.
pub fn optimize_program(prog: &mut Program, config: &CompilerConfig) -> Result<(), String> {
    passes::optimize(prog, config)?;
    if config.lower_reps {
        repr::lower_program(prog)?;
        debug!("representation lowering complete");
        // Clean up the generated constructor and test blocks.
        passes::optimize(prog, config)?;
    }
    check::check_program(prog)?;
    Ok(())
}

/// Compile a source string to LLVM IR.
pub fn compile_to_ir(
    source: &str,
    dialect: Dialect,
    config: &CompilerConfig,
) -> Result<String, String> {
    let mut prog = load_program(source, dialect, config)?;
    optimize_program(&mut prog, config)?;
    emit::emit_program(&prog).map_err(|e| e.to_string())
}

/// Optimize a source string and render the transformed MIL.
pub fn optimize_to_text(
    source: &str,
    dialect: Dialect,
    config: &CompilerConfig,
) -> Result<String, String> {
    let mut prog = load_program(source, dialect, config)?;
    optimize_program(&mut prog, config)?;
    Ok(display::print_program(&prog))
}

/// Interpret a source string directly, without optimization.
pub fn run_source(source: &str, dialect: Dialect) -> Result<RunResult, String> {
    let prog = load_program(source, dialect, &CompilerConfig::default())?;
    run_program(&prog)
}

/// Compile a source file to an executable.
pub fn compile_file(
    source_path: &Path,
    output_path: &Path,
    keep_ir: bool,
    config: &CompilerConfig,
) -> Result<(), String> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| format!("Failed to read source file: {}", e))?;
    let dialect = Dialect::from_path(source_path);
    let ir = compile_to_ir(&source, dialect, config)?;

    let ir_path = output_path.with_extension("ll");
    fs::write(&ir_path, ir).map_err(|e| format!("Failed to write IR file: {}", e))?;

    ensure_clang()?;

    let output = Command::new("clang")
        .arg("-O2")
        .arg(&ir_path)
        .arg("-o")
        .arg(output_path)
        .output()
        .map_err(|e| format!("Failed to run clang: {}", e))?;

    if !keep_ir {
        fs::remove_file(&ir_path).ok();
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("Clang compilation failed:\n{}", stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTDOWN: &str = "block main() { step(3) }\n\
                             block step(n: word) {\n\
                             \x20 _ <- printWord(n)\n\
                             \x20 f <- primEq(n, 0)\n\
                             \x20 if f then stop() else next(n)\n\
                             }\n\
                             block next(n: word) {\n\
                             \x20 m <- sub(n, 1)\n\
                             \x20 step(m)\n\
                             }\n\
                             block stop() { return }\n";

    #[test]
    fn test_parse_major_from_dumpversion() {
        assert_eq!(parse_major("15.0.7\n"), Some(15));
        assert_eq!(parse_major("17.0.6"), Some(17));
        assert_eq!(parse_major("14"), Some(14));
        assert_eq!(parse_major(""), None);
        assert_eq!(parse_major("clang 15"), None);
    }

    #[test]
    fn test_dialect_from_path() {
        assert_eq!(Dialect::from_path(Path::new("x.lc")), Dialect::Lc);
        assert_eq!(Dialect::from_path(Path::new("x.mil")), Dialect::Mil);
        assert_eq!(Dialect::from_path(Path::new("x")), Dialect::Mil);
    }

    #[test]
    fn test_optimization_preserves_trace() {
        let config = CompilerConfig::default();
        let before = run_source(COUNTDOWN, Dialect::Mil).unwrap();
        let mut prog = load_program(COUNTDOWN, Dialect::Mil, &config).unwrap();
        optimize_program(&mut prog, &config).unwrap();
        let after = run_program(&prog).unwrap();
        assert_eq!(before.trace, after.trace);
        assert_eq!(before.trace, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_compile_to_ir_end_to_end() {
        let ir = compile_to_ir(COUNTDOWN, Dialect::Mil, &CompilerConfig::default()).unwrap();
        assert!(ir.contains("define i32 @main()"), "{}", ir);
        assert!(ir.contains("@mil_print_word"), "{}", ir);
    }

    #[test]
    fn test_lc_pipeline_end_to_end() {
        let src = "def fact n = if primEq n 0 then 1 else mul n (fact (sub n 1))\n\
                   def main = printWord (fact 5)\n";
        let out = run_source(src, Dialect::Lc).unwrap();
        assert_eq!(out.trace, vec![120]);

        let ir = compile_to_ir(src, Dialect::Lc, &CompilerConfig::default()).unwrap();
        assert!(ir.contains("@blk_fact"), "{}", ir);
    }

    #[test]
    fn test_optimize_to_text_folds_constants() {
        let src = "block main() {\n\
                   \x20 x <- add(3, 4)\n\
                   \x20 return x\n\
                   }\n";
        let text = optimize_to_text(src, Dialect::Mil, &CompilerConfig::default()).unwrap();
        assert!(text.contains("return 7"), "{}", text);
    }

    #[test]
    fn test_bitdata_pipeline_preserves_trace() {
        let src = "bitdata Status / 8 {\n\
                   \x20 Ok  [ 0b10 : 2 | payload : 6 ]\n\
                   \x20 Bad [ 0b01 : 2 | other : 6 ]\n\
                   }\n\
                   block main() {\n\
                   \x20 v <- new Ok(42)\n\
                   \x20 p <- sel Ok.0(v)\n\
                   \x20 _ <- printWord(p)\n\
                   \x20 case v of {\n\
                   \x20   Ok -> yes()\n\
                   \x20   Bad -> no()\n\
                   \x20 }\n\
                   }\n\
                   block yes() { _ <- printWord(1) return }\n\
                   block no() { _ <- printWord(0) return }\n";
        let config = CompilerConfig::default();
        let before = run_source(src, Dialect::Mil).unwrap();
        let mut prog = load_program(src, Dialect::Mil, &config).unwrap();
        optimize_program(&mut prog, &config).unwrap();
        let after = run_program(&prog).unwrap();
        assert_eq!(before.trace, after.trace);
        assert_eq!(after.trace, vec![42, 1]);

        let ir = emit::emit_program(&prog).unwrap();
        assert!(ir.contains("define i32 @main()"), "{}", ir);
    }

    #[test]
    fn test_duplicate_tops_merge_in_pipeline() {
        let src = "top a = add(20, 22)\n\
                   top b = add(20, 22)\n\
                   block main() { return b }\n";
        let config = CompilerConfig::default();
        let mut prog = load_program(src, Dialect::Mil, &config).unwrap();
        optimize_program(&mut prog, &config).unwrap();
        // Both tops still exist; the later one projects the earlier.
        let out = run_program(&prog).unwrap();
        assert_eq!(out.result, vec![Value::Word(42)]);
    }

    #[test]
    fn test_disabled_passes_are_skipped() {
        let src = "block main() {\n\
                   \x20 x <- add(3, 4)\n\
                   \x20 return x\n\
                   }\n";
        let config = CompilerConfig::new().without_pass("flow").unwrap();
        let text = optimize_to_text(src, Dialect::Mil, &config).unwrap();
        assert!(text.contains("add(3, 4)"), "{}", text);
    }
}
