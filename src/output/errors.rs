// Human-readable error messages for taskscan

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Color output only when stderr is a TTY and NO_COLOR is unset
fn should_use_colors() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// Application-level errors
///
/// Only `Config` stops a scan, and it is raised before anything is submitted.
/// Per-target failures never surface here; they are carried in each host's
/// result instead.
#[derive(Debug)]
pub enum ScanError {
    /// Invalid settings, rejected before any work starts
    Config {
        message: String,
        suggestion: Option<String>,
    },

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Malformed input file (targets list, config file)
    Parse {
        message: String,
        file: Option<String>,
        line: Option<usize>,
    },
}

impl ScanError {
    pub fn config(message: impl Into<String>) -> Self {
        ScanError::Config {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, ScanError::Config { .. })
    }
}

impl std::error::Error for ScanError {}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            ScanError::Config {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            ScanError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ScanError::Parse {
                message,
                file,
                line,
            } => {
                writeln!(f, "{}: {}", "ERROR".red().bold(), message)?;

                if let Some(file) = file {
                    write!(f, "  {} {}", "-->".blue(), file.cyan())?;
                    if let Some(line) = line {
                        write!(f, ":{}", line)?;
                    }
                    writeln!(f)?;
                }

                Ok(())
            }
        }
    }
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Io {
            message: e.to_string(),
            path: None,
        }
    }
}
