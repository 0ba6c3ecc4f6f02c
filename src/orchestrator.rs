// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ties [`crate::child_runner`] and [`crate::reconstructor`] together: for a
//! compilation invocation, run the preprocessor to capture the expanded
//! source, reconstruct a side-car next to the real output, then run the
//! real compiler in `-fpreprocessed` mode over the same expanded text so it
//! is never preprocessed twice.
//!
//! Argument lexing beyond what `gcc`/`cpp` already do, `$PATH` resolution,
//! and top-level CLI wiring are treated as thin external collaborators
//! here; this module only implements the interfaces it needs from them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::child_runner::{self, ChildCtx, ChildMode, ChildRunError};
use crate::linemarker::{self, ParseError};
use crate::reconstructor::{self, ReconstructError};

const EXT_MAPPING: &[(&str, &str)] = &[
    (".c", "cpp-output"),
    (".i", "cpp-output"),
    (".s", "assembler"),
    (".S", "assembler"),
    (".sx", "assembler"),
    (".cc", "c++-cpp-output"),
    (".ii", "c++-cpp-output"),
    (".cp", "c++-cpp-output"),
    (".cxx", "c++-cpp-output"),
    (".cpp", "c++-cpp-output"),
    (".CPP", "c++-cpp-output"),
    (".c++", "c++-cpp-output"),
    (".C", "c++-cpp-output"),
];

/// Environment-driven configuration, read once at startup rather than via
/// scattered `std::env::var` calls scattered through the call graph.
#[derive(Debug, Clone)]
pub struct Config {
    pub real_cc: String,
    pub real_cpp: String,
    pub no_i_files: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            real_cc: env::var("REAL_CC").unwrap_or_else(|_| "gcc".to_string()),
            real_cpp: env::var("REAL_CPP").unwrap_or_else(|_| "cpp".to_string()),
            no_i_files: env::var_os("X_NO_I_FILES").is_some(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("{0} not found on PATH")]
    NotFound(String),
}

/// Resolves `name` to an executable path the same way a shell would:
/// verbatim if it already contains a `/`, otherwise by walking `$PATH`
/// (empty segments and a trailing `:` both mean the current directory).
pub fn locate_file(name: &str) -> Result<PathBuf, LocateError> {
    if name.contains('/') {
        return is_executable(Path::new(name))
            .then(|| PathBuf::from(name))
            .ok_or_else(|| LocateError::NotFound(name.to_string()));
    }

    let path_env = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_env) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(LocateError::NotFound(name.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Compile,
    Assemble,
}

impl Mode {
    fn flag(self) -> &'static str {
        match self {
            Mode::Compile => "-c",
            Mode::Assemble => "-S",
        }
    }
}

/// The result of lexing argv for the two flags the orchestrator cares
/// about (`-o`, and the `-c`/`-S`/`-E` mode letter); everything else is
/// passed through to the compiler untouched.
struct ArgData {
    rest: Vec<String>,
    o_file: String,
    mode: Mode,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgParseError {
    #[error("-o given more than once")]
    DuplicateOutput,
    #[error("-o given with no following value")]
    MissingOutputValue,
    #[error("no -c/-S mode flag given, or -E was requested (pure preprocessing has no side-car)")]
    NoUsableMode,
    #[error("no -o output path given")]
    MissingOutput,
}

fn parse_args(argv: &[String]) -> Result<ArgData, ArgParseError> {
    let mut rest = Vec::new();
    let mut o_file: Option<String> = None;
    let mut mode: Option<Mode> = None;
    let mut saw_e = false;

    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if let Some(stripped) = arg.strip_prefix("-o") {
            if o_file.is_some() {
                return Err(ArgParseError::DuplicateOutput);
            }
            o_file = Some(if stripped.is_empty() {
                iter.next().cloned().ok_or(ArgParseError::MissingOutputValue)?
            } else {
                stripped.to_string()
            });
            continue;
        }
        if arg.len() == 2 && matches!(arg.as_str(), "-c" | "-S" | "-E") {
            if mode.is_some() || saw_e {
                return Err(ArgParseError::NoUsableMode);
            }
            match arg.as_str() {
                "-c" => mode = Some(Mode::Compile),
                "-S" => mode = Some(Mode::Assemble),
                "-E" => saw_e = true,
                _ => unreachable!(),
            }
            continue;
        }
        rest.push(arg.clone());
    }

    if saw_e {
        return Err(ArgParseError::NoUsableMode);
    }
    let mode = mode.ok_or(ArgParseError::NoUsableMode)?;
    let o_file = o_file.ok_or(ArgParseError::MissingOutput)?;

    Ok(ArgData { rest, o_file, mode })
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} could not be located: {1}")]
    CompilerNotFound(&'static str, #[source] LocateError),
    #[error("failed to parse compiler arguments: {0}")]
    BadArguments(#[from] ArgParseError),
    #[error("preprocessing invocation failed: {0}")]
    PreprocessFailed(#[source] ChildRunError),
    #[error("preprocessed output had no usable linemarker")]
    NoInitialMarker(#[source] ParseError),
    #[error(
        "the input file named by the preprocessor's first linemarker ({0:?}) does not appear \
         exactly once in the original arguments"
    )]
    InputFileNotInArgv(String),
    #[error("compiler invocation failed: {0}")]
    CompileFailed(#[source] ChildRunError),
    #[error("passthrough invocation failed: {0}")]
    PassthroughFailed(#[source] ChildRunError),
    #[error("failed to write side-car file {0}: {1}")]
    SideCarWrite(PathBuf, #[source] std::io::Error),
}

/// Exit-code taxonomy documented for the `cc-wrapper` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    CompilerNotFound,
    PassthroughFailed,
    OrchestrationFailed,
}

impl ExitOutcome {
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::CompilerNotFound => libc::ESRCH,
            ExitOutcome::PassthroughFailed => libc::ECHILD,
            ExitOutcome::OrchestrationFailed => libc::EINVAL,
        }
    }
}

/// Runs one compilation invocation end to end and returns the exit outcome
/// to surface to the process. Argument-lexing or reconstruction failures
/// degrade to a plain passthrough compile where the original source
/// intends it (malformed input is non-fatal; it only forfeits the
/// side-car), while a genuinely failed child process propagates its
/// failure back to the caller.
pub fn run(config: &Config, argv: &[String]) -> ExitOutcome {
    let located_cc = match locate_file(&config.real_cc) {
        Ok(p) => p,
        Err(e) => {
            warn!(compiler = %config.real_cc, error = %e, "failed to locate compiler");
            return ExitOutcome::CompilerNotFound;
        }
    };
    let located_cpp = match locate_file(&config.real_cpp) {
        Ok(p) => p,
        Err(e) => {
            warn!(compiler = %config.real_cpp, error = %e, "failed to locate preprocessor");
            return ExitOutcome::CompilerNotFound;
        }
    };

    if config.no_i_files {
        debug!("X_NO_I_FILES set, running passthrough compile");
        return passthrough(&located_cc, argv);
    }

    let parsed = match parse_args(argv) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "argument lexing failed, falling back to passthrough");
            return passthrough(&located_cc, argv);
        }
    };

    match doit(config, &located_cc, &located_cpp, parsed) {
        Ok(()) => ExitOutcome::Success,
        Err(e) => {
            warn!(error = %e, "compilation via the reconstructing path failed");
            ExitOutcome::OrchestrationFailed
        }
    }
}

fn passthrough(located_cc: &Path, argv: &[String]) -> ExitOutcome {
    let mut full_argv = vec![located_cc.to_string_lossy().into_owned()];
    full_argv.extend(argv.iter().cloned());
    let ctx = ChildCtx {
        argv: full_argv,
        mode: ChildMode::None,
        stdin_buf: None,
    };
    match child_runner::run(&ctx) {
        Ok(_) => ExitOutcome::Success,
        Err(e) => {
            warn!(error = %e, "passthrough compiler invocation failed");
            ExitOutcome::PassthroughFailed
        }
    }
}

fn doit(
    config: &Config,
    located_cc: &Path,
    located_cpp: &Path,
    mut args: ArgData,
) -> Result<(), OrchestratorError> {
    let mut cpp_argv = vec![located_cpp.to_string_lossy().into_owned()];
    cpp_argv.extend(args.rest.iter().cloned());
    cpp_argv.push("-o-".to_string());

    let cpp_ctx = ChildCtx {
        argv: cpp_argv,
        mode: ChildMode::FromChild,
        stdin_buf: None,
    };
    let preprocessed = child_runner::run(&cpp_ctx)
        .map_err(OrchestratorError::PreprocessFailed)?
        .unwrap_or_default();

    let i_file = extract_input_file(&preprocessed, &mut args.rest)?;

    let ext_type = EXT_MAPPING
        .iter()
        .find(|(ext, _)| i_file.ends_with(ext))
        .map(|(_, ty)| *ty);

    let mut cc_argv = vec![located_cc.to_string_lossy().into_owned()];
    if let Some(ty) = ext_type {
        cc_argv.push("-x".to_string());
        cc_argv.push(ty.to_string());
    }
    cc_argv.push("-fpreprocessed".to_string());
    cc_argv.push(args.mode.flag().to_string());
    cc_argv.push("-o".to_string());
    cc_argv.push(args.o_file.clone());
    cc_argv.push("-".to_string());

    let cc_ctx = ChildCtx {
        argv: cc_argv,
        mode: ChildMode::ToChild,
        stdin_buf: Some(preprocessed.clone()),
    };
    child_runner::run(&cc_ctx).map_err(OrchestratorError::CompileFailed)?;

    if is_regular_file(&i_file) && is_regular_file(&args.o_file) {
        write_side_car(&i_file, &args.o_file, &preprocessed)?;
    } else {
        trace!(
            input = %i_file,
            output = %args.o_file,
            "skipping side-car: input or output is not a regular file"
        );
    }

    Ok(())
}

fn is_regular_file(path: &str) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

/// Reads the preprocessed buffer's first linemarker to discover the real
/// input file path, substituting `-` for the synthetic `<stdin>` name, then
/// removes it from `rest` (it is about to be re-added as the literal `-`
/// argument to the second invocation).
fn extract_input_file(preprocessed: &[u8], rest: &mut Vec<String>) -> Result<String, OrchestratorError> {
    let (lm, _) = linemarker::parse(preprocessed, 0).map_err(OrchestratorError::NoInitialMarker)?;
    let i_file = if lm.filename == "<stdin>" {
        "-".to_string()
    } else {
        lm.filename
    };

    let mut matches = rest.iter().enumerate().filter(|(_, a)| **a == i_file);
    let first = matches.next().map(|(i, _)| i);
    let is_unique = matches.next().is_none();
    match first {
        Some(idx) if is_unique => {
            rest.remove(idx);
            Ok(i_file)
        }
        _ => Err(OrchestratorError::InputFileNotInArgv(i_file)),
    }
}

/// Derives the side-car path from `o_file` (swap its extension for `.pp`)
/// plus `i_file`'s own suffix (or `.unk` when it has none), then writes the
/// reconstructed text with `O_CREAT|O_EXCL` so a concurrent or repeated
/// invocation never silently clobbers an existing side-car.
fn write_side_car(i_file: &str, o_file: &str, preprocessed: &[u8]) -> Result<(), OrchestratorError> {
    let reconstructed = match reconstructor::reconstruct(preprocessed) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "linemarker reconstruction failed, skipping side-car");
            return Ok(());
        }
    };
    if reconstructed.is_empty() {
        return Ok(());
    }

    let side_car = mangle_filename(i_file, o_file);
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o644)
        .open(&side_car);
    match file {
        Ok(mut f) => {
            if let Err(e) = f.write_all(&reconstructed) {
                let _ = fs::remove_file(&side_car);
                return Err(OrchestratorError::SideCarWrite(side_car, e));
            }
            Ok(())
        }
        Err(e) => {
            debug!(path = %side_car.display(), error = %e, "could not create side-car file");
            Ok(())
        }
    }
}

fn mangle_filename(i_file: &str, o_file: &str) -> PathBuf {
    let stem = match o_file.rfind(['.', '/']) {
        Some(idx) if o_file.as_bytes()[idx] == b'.' => &o_file[..idx],
        _ => o_file,
    };
    let suffix = match i_file.rfind(['.', '/']) {
        Some(idx) if i_file.as_bytes()[idx] == b'.' => &i_file[idx..],
        _ => ".unk",
    };
    PathBuf::from(format!("{stem}.pp{suffix}"))
}
