//! Command existence probing.
//!
//! A command "exists" unless launching it reports exit code 127, the shell
//! convention for command-not-found. The command is actually run (with empty
//! stdin), so only probe commands that are harmless to execute.

use std::collections::HashMap;

use shellpipe_types::{CommandConfig, EXIT_NOT_FOUND};
use tracing::debug;

use crate::command::{IntoArgv, display_argv};
use crate::process::ShellCommand;

/// Run `command` once and report whether it was found.
///
/// Malformed commands and launch errors other than not-found count as absent.
pub fn command_exists(command: impl IntoArgv) -> bool {
    let argv = match command.into_argv() {
        Ok(argv) => argv,
        Err(_) => return false,
    };
    let shown = display_argv(&argv);
    let exit_code = ShellCommand::with_config(argv, CommandConfig::new()).and_then(|mut cmd| {
        cmd.result()?;
        Ok(cmd.exit_code())
    });

    let exists = matches!(exit_code, Ok(Some(code)) if code != EXIT_NOT_FOUND);
    debug!(command = %shown, exists, "existence check");
    exists
}

/// Caller-owned memo of existence checks, keyed by the command's display form.
#[derive(Debug, Default, Clone)]
pub struct ExistenceCache {
    known: HashMap<String, bool>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `command`, running it only the first time it is asked about.
    pub fn exists(&mut self, command: impl IntoArgv) -> bool {
        let argv = match command.into_argv() {
            Ok(argv) => argv,
            Err(_) => return false,
        };
        let key = display_argv(&argv);
        if let Some(&known) = self.known.get(&key) {
            return known;
        }
        let found = command_exists(argv);
        self.known.insert(key, found);
        found
    }

    /// Cached answer, without running anything.
    pub fn cached(&self, command: &str) -> Option<bool> {
        self.known.get(command).copied()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn clear(&mut self) {
        self.known.clear();
    }
}
