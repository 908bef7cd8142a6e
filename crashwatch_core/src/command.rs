use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker replaced by the fuzzed file's path in every argument.
pub const FUZZED_FILE_PLACEHOLDER: &str = "{}";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command template is empty")]
    Empty,
    #[error("program {program:?} not found on PATH: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("cannot make program path {program:?} absolute: {source}")]
    Resolve {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// An argv template such as `["viewer", "--open", "{}"]`.
///
/// A relative program path such as `./bin/viewer` is made absolute against
/// the current directory when the template is built, so the binary that is
/// inspected before launch is the one that runs, whatever working directory
/// the target is started in. Bare names are looked up on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(mut args: Vec<String>) -> Result<Self, CommandError> {
        if args.first().is_none_or(|program| program.is_empty()) {
            return Err(CommandError::Empty);
        }
        let raw = args.remove(0);
        let mut program = PathBuf::from(&raw);
        if program.is_relative() && program.components().count() > 1 {
            program = std::path::absolute(&program).map_err(|source| CommandError::Resolve {
                program: raw,
                source,
            })?;
        }
        Ok(Self { program, args })
    }

    /// Builds the argv for one run with `fuzzed_file` substituted. Arguments
    /// are never split, so paths containing spaces survive intact.
    pub fn render(&self, fuzzed_file: &Path) -> Vec<OsString> {
        std::iter::once(self.program.clone().into_os_string())
            .chain(
                self.args
                    .iter()
                    .map(|arg| substitute(arg, fuzzed_file.as_os_str())),
            )
            .collect()
    }

    /// Locates the program the template launches.
    pub fn resolve_program(&self) -> Result<PathBuf, CommandError> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            return Ok(self.program.clone());
        }
        which::which(&self.program).map_err(|source| CommandError::NotFound {
            program: self.program.display().to_string(),
            source,
        })
    }
}

fn substitute(arg: &str, replacement: &OsStr) -> OsString {
    let mut out = OsString::new();
    let mut pieces = arg.split(FUZZED_FILE_PLACEHOLDER);
    if let Some(first) = pieces.next() {
        out.push(first);
    }
    for piece in pieces {
        out.push(replacement);
        out.push(piece);
    }
    out
}

/// Renders an argv for log output.
pub fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
