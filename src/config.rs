//! CLI and configuration (spec §10.1): a `clap`-derived `Cli` in the
//! style of `conmon-rs`'s own `config.rs`, pared down to the one real
//! positional argument and one real tunable this interpreter has.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// `srvsh <script-path>` (spec §6): a restricted command language
/// interpreter whose commands run wired into a server/client IPC tree.
#[derive(Debug, Parser)]
#[command(name = "srvsh", version, about)]
pub struct Cli {
    /// Path to the script to interpret.
    pub script: PathBuf,

    /// Logging verbosity of the interpreter itself. Never forwarded to
    /// spawned commands.
    #[arg(short = 'l', long, env = "SRVSH_LOG", default_value = "info")]
    pub log_level: LevelFilter,

    /// Spec §6: "arguments beyond the first are ignored" — captured
    /// here (rather than rejected by `clap`'s normal strict parsing)
    /// and then discarded.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub extra: Vec<String>,
}

/// Resolves the opcode database path from the environment (spec §6):
/// `OPCODE_DATABASE`, falling back to the `SRVSH_DATABASE` alias. This
/// is a thin wrapper kept here so `main` and tests have one place to
/// call, distinct from `opcode::OpcodeDb::open`'s own path-taking API.
pub fn opcode_database_path() -> Option<std::ffi::OsString> {
    crate::opcode::env_database_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_script_positional() {
        let cli = Cli::parse_from(["srvsh", "script.sh"]);
        assert_eq!(cli.script, PathBuf::from("script.sh"));
        assert!(cli.extra.is_empty());
    }

    #[test]
    fn trailing_arguments_are_captured_not_rejected() {
        let cli = Cli::parse_from(["srvsh", "script.sh", "--ignored", "-x"]);
        assert_eq!(cli.extra, vec!["--ignored", "-x"]);
    }

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }
}
