//! Command specification and command-line parsing
//!
//! Generated setup commands arrive as plain strings. They are never handed to
//! a shell: [`parse_command_line`] splits them into an argument vector and
//! refuses anything that only makes sense to a shell.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::process::ProcessError;

/// Characters that are rejected outside of quotes
const SHELL_METACHARACTERS: [char; 11] = [';', '|', '&', '$', '`', '<', '>', '(', ')', '\\', '\n'];

/// Builder for an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Create a new command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Create a command from an argument vector (program first)
    pub fn from_argv(argv: &[String]) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        if program.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The command line for logs and step names
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build a tokio command with piped output
    ///
    /// On unix the child leads its own process group so that it can be
    /// terminated together with everything it spawns.
    pub(crate) fn build(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

/// Split a command line into an argument vector without a shell
///
/// Whitespace separates arguments. Single quotes take everything literally;
/// double quotes allow `\"` and `\\`. Shell metacharacters outside quotes and
/// unterminated quotes are errors.
pub fn parse_command_line(line: &str) -> Result<Vec<String>, ProcessError> {
    let unsafe_command = |reason: String| ProcessError::UnsafeCommand {
        command: line.to_string(),
        reason,
    };

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() && c != '\n' => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(unsafe_command("unterminated single quote".into())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(unsafe_command("unterminated double quote".into()));
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(unsafe_command("unterminated double quote".into())),
                    }
                }
            }
            c if SHELL_METACHARACTERS.contains(&c) => {
                return Err(unsafe_command(format!(
                    "shell metacharacter {c:?} is not allowed"
                )));
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        argv.push(current);
    }

    if argv.is_empty() {
        return Err(ProcessError::EmptyCommand);
    }

    Ok(argv)
}

/// Check that the program of `argv` is on the allow-list
///
/// Programs are matched by bare name; anything containing a path separator is
/// refused.
pub fn check_allowed(argv: &[String], allowed: &[String]) -> Result<(), ProcessError> {
    let program = argv.first().ok_or(ProcessError::EmptyCommand)?;

    if program.contains('/') || program.contains('\\') {
        return Err(ProcessError::ProgramNotAllowed(program.clone()));
    }

    if allowed.iter().any(|a| a == program) {
        Ok(())
    } else {
        Err(ProcessError::ProgramNotAllowed(program.clone()))
    }
}
