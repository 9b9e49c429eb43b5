use std::path::PathBuf;

use clap::Parser;

/// Keeps SPIFFE X.509 and JWT SVIDs on disk and reloads a process when they rotate
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "spiffe-helper", version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        long = "config-file",
        visible_alias = "config",
        default_value = "helper.conf",
        env = "SPIFFE_HELPER_CONFIG"
    )]
    pub config_file: PathBuf,

    /// Run as a daemon rotating credentials (true) or fetch once and exit (false).
    /// Overrides `daemon_mode` from the configuration file when given.
    #[arg(long = "daemon-mode", value_name = "BOOL")]
    pub daemon_mode: Option<bool>,

    /// Run the arguments after `--` as the command, overriding `cmd` and
    /// `cmd_args` from the configuration file
    #[arg(long)]
    pub command: bool,

    /// Command and arguments, used with `--command`
    #[arg(last = true, value_name = "CMD")]
    pub positional: Vec<String>,
}

impl CliArgs {
    /// The positional command as `(program, args)` when `--command` is set.
    pub fn positional_command(&self) -> Option<(String, Vec<String>)> {
        if !self.command {
            return None;
        }
        let (program, args) = self.positional.split_first()?;
        Some((program.clone(), args.to_vec()))
    }
}
