//! Configuration: file schema, CLI flags, merge and validation.
//!
//! The CLI and the TOML file are merged once at startup into an immutable
//! [`RotationConfig`]. Components receive it as `Arc<RotationConfig>`;
//! nothing reads global state afterwards.

mod cli;
mod file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::credential::{AudienceKey, UpdateSlot};
use crate::prelude::warn;
use crate::process::{CommandSpec, Signal};
use crate::workload_api::{AgentAddressError, Endpoint};

pub use cli::CliArgs;
pub use file::{FileConfig, FileHealthChecks, FileJwtSvid};

/// Environment variable consulted when `agent_address` is not configured.
pub const SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Agent address used when neither the file nor the environment names one.
pub const DEFAULT_AGENT_ADDRESS: &str = "unix:///tmp/spire-agent/public/api.sock";

const DEFAULT_CERT_FILE_MODE: u32 = 0o644;
const DEFAULT_KEY_FILE_MODE: u32 = 0o600;
const DEFAULT_JWT_BUNDLE_FILE_MODE: u32 = 0o600;
const DEFAULT_JWT_SVID_FILE_MODE: u32 = 0o600;
const MAX_FILE_MODE: u32 = 0o777;

const DEFAULT_HEALTH_PORT: u16 = 8081;
const DEFAULT_LIVENESS_PATH: &str = "/live";
const DEFAULT_READINESS_PATH: &str = "/ready";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or contains unknown keys.
    #[error("failed to parse configuration{}: {source}", path.as_ref().map(|p| format!(" file {}", p.display())).unwrap_or_default())]
    Parse {
        /// File path, when parsed from a file.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// Only some of the X.509 file names are set.
    #[error("all or none of svid_file_name, svid_key_file_name and svid_bundle_file_name must be set")]
    IncompleteX509Files,

    /// A JWT SVID entry has no audience.
    #[error("jwt_svids[{index}]: jwt_audience must be set")]
    MissingJwtAudience {
        /// Position of the entry.
        index: usize,
    },

    /// A JWT SVID entry has no output file.
    #[error("jwt_svids[{index}]: jwt_svid_file_name must be set")]
    MissingJwtFileName {
        /// Position of the entry.
        index: usize,
    },

    /// No credential output is configured.
    #[error("at least one of the X.509 files, jwt_svids or jwt_bundle_file_name must be configured")]
    NothingToFetch,

    /// `pid_file_name` without a signal to send.
    #[error("pid_file_name requires renew_signal")]
    PidFileWithoutSignal,

    /// `renew_signal` names no known signal.
    #[error("invalid renew_signal: {0}")]
    InvalidSignal(String),

    /// `cmd_forward_exit_code` without a command.
    #[error("cmd_forward_exit_code requires cmd")]
    ForwardExitCodeWithoutCmd,

    /// `--command` without arguments after `--`.
    #[error("--command requires a command after --")]
    MissingPositionalCommand,

    /// A file mode has bits outside `0o777`.
    #[error("{key} must be at most 0o777, got {mode:#o}")]
    InvalidFileMode {
        /// Configuration key.
        key: &'static str,
        /// Rejected value.
        mode: u32,
    },

    /// A duration could not be parsed.
    #[error("invalid duration for {key}: {source}")]
    InvalidDuration {
        /// Configuration key.
        key: &'static str,
        /// Parse error.
        #[source]
        source: humantime::DurationError,
    },

    /// The deprecated `cmd_args` string is malformed.
    #[error("invalid cmd_args: {0}")]
    InvalidCmdArgs(String),

    /// `agent_address` is not a valid endpoint.
    #[error("invalid agent_address: {0}")]
    AgentAddress(#[from] AgentAddressError),
}

/// Whether the helper fetches once or keeps rotating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Write the first complete credential set, then exit.
    OneShot,
    /// Rotate credentials and supervise the command until cancelled.
    Daemon,
}

/// On-disk encoding of a JWT SVID file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JwtSvidEncoding {
    /// The compact JWT as received.
    #[default]
    Raw,
    /// Standard base64 of the compact JWT.
    Base64,
}

/// Names of the X.509 output files, relative to `cert_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Files {
    /// Certificate chain (or leaf only).
    pub svid_file_name: String,
    /// PKCS#8 private key.
    pub svid_key_file_name: String,
    /// Trust bundle.
    pub svid_bundle_file_name: String,
}

/// One JWT SVID output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvidTarget {
    /// Audiences to request.
    pub audience: AudienceKey,
    /// Output file, relative to `cert_dir`.
    pub file_name: String,
    /// Token encoding.
    pub encoding: JwtSvidEncoding,
}

/// Permission bits of each output file kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileModes {
    /// SVID certificate and bundle files.
    pub cert: u32,
    /// Private key file.
    pub key: u32,
    /// JWT bundle file.
    pub jwt_bundle: u32,
    /// JWT SVID files.
    pub jwt_svid: u32,
}

impl Default for FileModes {
    fn default() -> Self {
        Self {
            cert: DEFAULT_CERT_FILE_MODE,
            key: DEFAULT_KEY_FILE_MODE,
            jwt_bundle: DEFAULT_JWT_BUNDLE_FILE_MODE,
            jwt_svid: DEFAULT_JWT_SVID_FILE_MODE,
        }
    }
}

/// The supervised command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    /// Executable.
    pub program: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// Attach the helper's standard input.
    pub attach_stdin: bool,
    /// Exit with the command's exit code instead of restarting it.
    pub forward_exit_code: bool,
    /// Where to write the command's PID.
    pub pid_file: Option<PathBuf>,
    /// Restart backoff bounds. A zero maximum restarts immediately.
    pub restart_backoff: BackoffConfig,
    /// Time between `SIGTERM` and `SIGKILL` on shutdown.
    pub shutdown_grace: Duration,
}

impl CommandConfig {
    /// A command with default policies.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            attach_stdin: false,
            forward_exit_code: false,
            pid_file: None,
            restart_backoff: BackoffConfig::RESTART,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// What to spawn.
    pub fn spec(&self) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            attach_stdin: self.attach_stdin,
        }
    }
}

/// Health listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Serve the health endpoints (daemon mode only).
    pub listener_enabled: bool,
    /// TCP port.
    pub bind_port: u16,
    /// Liveness route.
    pub liveness_path: String,
    /// Readiness route.
    pub readiness_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listener_enabled: false,
            bind_port: DEFAULT_HEALTH_PORT,
            liveness_path: DEFAULT_LIVENESS_PATH.to_owned(),
            readiness_path: DEFAULT_READINESS_PATH.to_owned(),
        }
    }
}

/// Immutable, validated configuration shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    /// Workload API address.
    pub agent_address: String,
    /// Directory relative file names are resolved against.
    pub cert_dir: PathBuf,
    /// Keep rotating after the first write.
    pub daemon_mode: bool,
    /// Exit once every configured credential has been written.
    pub exit_when_ready: bool,
    /// X.509 output files.
    pub x509: Option<X509Files>,
    /// Write intermediates to the bundle file.
    pub add_intermediates_to_bundle: bool,
    /// Append federated CAs to the bundle file.
    pub include_federated_domains: bool,
    /// JWT SVID outputs.
    pub jwt_svids: Vec<JwtSvidTarget>,
    /// JWT bundle output file.
    pub jwt_bundle_file_name: Option<String>,
    /// Output permission bits.
    pub modes: FileModes,
    /// Supervised command.
    pub command: Option<CommandConfig>,
    /// Signal sent on renewal.
    pub renew_signal: Option<Signal>,
    /// PID file of the process to signal on renewal.
    pub pid_file_name: Option<PathBuf>,
    /// Health listener.
    pub health: HealthConfig,
    /// Default log filter.
    pub log_level: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            agent_address: DEFAULT_AGENT_ADDRESS.to_owned(),
            cert_dir: PathBuf::from("."),
            daemon_mode: true,
            exit_when_ready: false,
            x509: None,
            add_intermediates_to_bundle: false,
            include_federated_domains: false,
            jwt_svids: Vec::new(),
            jwt_bundle_file_name: None,
            modes: FileModes::default(),
            command: None,
            renew_signal: None,
            pid_file_name: None,
            health: HealthConfig::default(),
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
        }
    }
}

impl RotationConfig {
    /// Merges the file and CLI into a validated configuration.
    ///
    /// CLI values override file values, which override defaults. `env_socket`
    /// is the value of `SPIFFE_ENDPOINT_SOCKET`, used when the file names no
    /// agent address.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn resolve(
        file: FileConfig,
        cli: &CliArgs,
        env_socket: Option<String>,
    ) -> Result<Self, ConfigError> {
        let agent_address = non_empty(file.agent_address)
            .or_else(|| non_empty(env_socket))
            .unwrap_or_else(|| DEFAULT_AGENT_ADDRESS.to_owned());
        Endpoint::parse(&agent_address)?;

        let x509 = x509_files(
            file.svid_file_name,
            file.svid_key_file_name,
            file.svid_bundle_file_name,
        )?;
        let jwt_svids = jwt_targets(file.jwt_svids)?;
        let jwt_bundle_file_name = non_empty(file.jwt_bundle_file_name);
        if x509.is_none() && jwt_svids.is_empty() && jwt_bundle_file_name.is_none() {
            return Err(ConfigError::NothingToFetch);
        }

        let renew_signal = non_empty(file.renew_signal)
            .map(|name| {
                name.parse::<Signal>()
                    .map_err(|_| ConfigError::InvalidSignal(name))
            })
            .transpose()?;
        let pid_file_name = file.pid_file_name.filter(|p| !p.as_os_str().is_empty());
        if pid_file_name.is_some() && renew_signal.is_none() {
            return Err(ConfigError::PidFileWithoutSignal);
        }

        let modes = FileModes {
            cert: file_mode("cert_file_mode", file.cert_file_mode, DEFAULT_CERT_FILE_MODE)?,
            key: file_mode("key_file_mode", file.key_file_mode, DEFAULT_KEY_FILE_MODE)?,
            jwt_bundle: file_mode(
                "jwt_bundle_file_mode",
                file.jwt_bundle_file_mode,
                DEFAULT_JWT_BUNDLE_FILE_MODE,
            )?,
            jwt_svid: file_mode(
                "jwt_svid_file_mode",
                file.jwt_svid_file_mode,
                DEFAULT_JWT_SVID_FILE_MODE,
            )?,
        };

        let (program, args) = match cli.positional_command() {
            Some((program, args)) => (Some(program), args),
            None if cli.command => return Err(ConfigError::MissingPositionalCommand),
            None => {
                let args = if !file.cmd_args_array.is_empty() {
                    file.cmd_args_array
                } else if let Some(legacy) = non_empty(file.cmd_args) {
                    warn!("cmd_args is deprecated; use cmd_args_array");
                    split_legacy_args(&legacy)?
                } else {
                    Vec::new()
                };
                (non_empty(file.cmd), args)
            }
        };

        let forward_exit_code = file.cmd_forward_exit_code.unwrap_or(false);
        let command = match program {
            Some(program) => {
                let restart_backoff = BackoffConfig {
                    min_backoff: duration(
                        "cmd_restart_min_backoff",
                        file.cmd_restart_min_backoff,
                        BackoffConfig::RESTART.min_backoff,
                    )?,
                    max_backoff: duration(
                        "cmd_restart_max_backoff",
                        file.cmd_restart_max_backoff,
                        BackoffConfig::RESTART.max_backoff,
                    )?,
                };
                Some(CommandConfig {
                    attach_stdin: file.cmd_attach_stdin.unwrap_or(false),
                    forward_exit_code,
                    pid_file: file.cmd_write_pid_file.filter(|p| !p.as_os_str().is_empty()),
                    restart_backoff,
                    shutdown_grace: duration(
                        "cmd_shutdown_grace_period",
                        file.cmd_shutdown_grace_period,
                        DEFAULT_SHUTDOWN_GRACE,
                    )?,
                    ..CommandConfig::new(program, args)
                })
            }
            None if forward_exit_code => return Err(ConfigError::ForwardExitCodeWithoutCmd),
            None => None,
        };

        let daemon_mode = resolve_flag(cli.daemon_mode, file.daemon_mode, true);
        let health = file
            .health_checks
            .map(|h| HealthConfig {
                listener_enabled: h.listener_enabled,
                bind_port: h.bind_port.unwrap_or(DEFAULT_HEALTH_PORT),
                liveness_path: non_empty(h.liveness_path)
                    .unwrap_or_else(|| DEFAULT_LIVENESS_PATH.to_owned()),
                readiness_path: non_empty(h.readiness_path)
                    .unwrap_or_else(|| DEFAULT_READINESS_PATH.to_owned()),
            })
            .unwrap_or_default();

        let config = Self {
            agent_address,
            cert_dir: file
                .cert_dir
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(".")),
            daemon_mode,
            exit_when_ready: file.exit_when_ready.unwrap_or(false),
            x509,
            add_intermediates_to_bundle: file.add_intermediates_to_bundle.unwrap_or(false),
            include_federated_domains: file.include_federated_domains.unwrap_or(false),
            jwt_svids,
            jwt_bundle_file_name,
            modes,
            command,
            renew_signal,
            pid_file_name,
            health,
            log_level: non_empty(file.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        };
        config.warn_on_suspicious_settings();
        Ok(config)
    }

    /// One-shot when daemon mode is off or `exit_when_ready` is set.
    pub fn mode(&self) -> RunMode {
        if !self.daemon_mode || self.exit_when_ready {
            RunMode::OneShot
        } else {
            RunMode::Daemon
        }
    }

    /// Resolves a configured file name against `cert_dir`.
    pub fn path_for(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.cert_dir.join(file_name)
    }

    /// Write slots that have at least one configured output.
    pub fn configured_slots(&self) -> Vec<UpdateSlot> {
        let mut slots = Vec::new();
        if self.x509.is_some() {
            slots.push(UpdateSlot::X509);
        }
        slots.extend(self.audience_keys().into_iter().map(UpdateSlot::JwtSvid));
        if self.jwt_bundle_file_name.is_some() {
            slots.push(UpdateSlot::JwtBundle);
        }
        slots
    }

    /// Distinct audience keys to request, in configuration order.
    pub fn audience_keys(&self) -> Vec<AudienceKey> {
        let mut keys: Vec<AudienceKey> = Vec::new();
        for target in &self.jwt_svids {
            if !keys.contains(&target.audience) {
                keys.push(target.audience.clone());
            }
        }
        keys
    }

    /// Every output path with the setting that names it.
    fn output_paths(&self) -> Vec<(String, PathBuf)> {
        let mut paths = Vec::new();
        if let Some(files) = &self.x509 {
            paths.push(("svid_file_name".to_owned(), self.path_for(&files.svid_file_name)));
            paths.push((
                "svid_key_file_name".to_owned(),
                self.path_for(&files.svid_key_file_name),
            ));
            paths.push((
                "svid_bundle_file_name".to_owned(),
                self.path_for(&files.svid_bundle_file_name),
            ));
        }
        for (i, target) in self.jwt_svids.iter().enumerate() {
            paths.push((
                format!("jwt_svids[{i}].jwt_svid_file_name"),
                self.path_for(&target.file_name),
            ));
        }
        if let Some(name) = &self.jwt_bundle_file_name {
            paths.push(("jwt_bundle_file_name".to_owned(), self.path_for(name)));
        }
        paths
    }

    fn warn_on_suspicious_settings(&self) {
        let mut seen: BTreeMap<PathBuf, String> = BTreeMap::new();
        for (key, path) in self.output_paths() {
            if let Some(first) = seen.get(&path) {
                warn!(
                    "Output files overlap and will overwrite each other: path={}, settings={},{}",
                    path.display(),
                    first,
                    key
                );
            } else {
                seen.insert(path, key);
            }
        }

        if self.health.listener_enabled && !self.daemon_mode {
            warn!("Health checks are only served in daemon mode; listener disabled");
        }
        if let Some(command) = &self.command {
            let backoff = command.restart_backoff.normalize();
            if backoff.min_backoff.is_zero() && !backoff.max_backoff.is_zero() {
                warn!(
                    "cmd_restart_min_backoff is 0s; restarts wait at least min(1s, max): max_backoff={}",
                    humantime::format_duration(backoff.max_backoff)
                );
            }
        }
        if self.renew_signal.is_some() && self.command.is_none() && self.pid_file_name.is_none() {
            warn!("renew_signal is set but there is no cmd or pid_file_name to signal");
        }
    }
}

/// Tri-state merge: CLI overrides file overrides default.
pub fn resolve_flag(cli: Option<bool>, file: Option<bool>, default: bool) -> bool {
    cli.or(file).unwrap_or(default)
}

/// Splits the deprecated `cmd_args` string.
///
/// Fields are separated by single spaces. A field starting with `"` runs to
/// the closing quote and may contain spaces; `""` inside it is a literal
/// quote. Consecutive spaces produce empty arguments.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidCmdArgs`] on unbalanced or stray quotes.
pub fn split_legacy_args(input: &str) -> Result<Vec<String>, ConfigError> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut field = String::new();

        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => {
                        return Err(ConfigError::InvalidCmdArgs(format!(
                            "unterminated quote in {input:?}"
                        )))
                    }
                }
            }
            match chars.next() {
                None => {
                    args.push(field);
                    return Ok(args);
                }
                Some(' ') => args.push(field),
                Some(c) => {
                    return Err(ConfigError::InvalidCmdArgs(format!(
                        "unexpected {c:?} after closing quote in {input:?}"
                    )))
                }
            }
        } else {
            loop {
                match chars.next() {
                    None => {
                        args.push(field);
                        return Ok(args);
                    }
                    Some(' ') => break,
                    Some('"') => {
                        return Err(ConfigError::InvalidCmdArgs(format!(
                            "bare quote in unquoted field in {input:?}"
                        )))
                    }
                    Some(c) => field.push(c),
                }
            }
            args.push(field);
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn x509_files(
    svid: Option<String>,
    key: Option<String>,
    bundle: Option<String>,
) -> Result<Option<X509Files>, ConfigError> {
    match (non_empty(svid), non_empty(key), non_empty(bundle)) {
        (None, None, None) => Ok(None),
        (Some(svid_file_name), Some(svid_key_file_name), Some(svid_bundle_file_name)) => {
            Ok(Some(X509Files {
                svid_file_name,
                svid_key_file_name,
                svid_bundle_file_name,
            }))
        }
        _ => Err(ConfigError::IncompleteX509Files),
    }
}

fn jwt_targets(entries: Vec<FileJwtSvid>) -> Result<Vec<JwtSvidTarget>, ConfigError> {
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            if entry.jwt_audience.trim().is_empty() {
                return Err(ConfigError::MissingJwtAudience { index });
            }
            if entry.jwt_svid_file_name.trim().is_empty() {
                return Err(ConfigError::MissingJwtFileName { index });
            }
            Ok(JwtSvidTarget {
                audience: AudienceKey::new(entry.jwt_audience, entry.jwt_extra_audiences),
                file_name: entry.jwt_svid_file_name,
                encoding: entry.jwt_svid_encoding,
            })
        })
        .collect()
}

fn file_mode(key: &'static str, value: Option<u32>, default: u32) -> Result<u32, ConfigError> {
    match value {
        None | Some(0) => Ok(default),
        Some(mode) if mode > MAX_FILE_MODE => Err(ConfigError::InvalidFileMode { key, mode }),
        Some(mode) => Ok(mode),
    }
}

fn duration(
    key: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match non_empty(value) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw.trim())
            .map_err(|source| ConfigError::InvalidDuration { key, source }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn x509_file() -> FileConfig {
        FileConfig {
            svid_file_name: Some("svid.pem".into()),
            svid_key_file_name: Some("svid_key.pem".into()),
            svid_bundle_file_name: Some("svid_bundle.pem".into()),
            ..FileConfig::default()
        }
    }

    fn resolve(file: FileConfig) -> Result<RotationConfig, ConfigError> {
        RotationConfig::resolve(file, &CliArgs::default(), None)
    }

    #[test]
    fn resolve_flag_prefers_cli_then_file() {
        assert!(resolve_flag(None, None, true));
        assert!(!resolve_flag(None, Some(false), true));
        assert!(resolve_flag(Some(true), Some(false), false));
        assert!(!resolve_flag(Some(false), None, true));
    }

    #[test]
    fn defaults_apply() {
        let cfg = resolve(x509_file()).unwrap();

        assert_eq!(cfg.agent_address, DEFAULT_AGENT_ADDRESS);
        assert!(cfg.daemon_mode);
        assert_eq!(cfg.mode(), RunMode::Daemon);
        assert_eq!(cfg.modes, FileModes::default());
        assert_eq!(cfg.health.bind_port, 8081);
        assert_eq!(cfg.health.readiness_path, "/ready");
        assert_eq!(cfg.path_for("svid.pem"), PathBuf::from("./svid.pem"));
        assert_eq!(cfg.configured_slots(), vec![UpdateSlot::X509]);
    }

    #[test]
    fn env_socket_used_when_file_is_silent() {
        let cfg =
            RotationConfig::resolve(x509_file(), &CliArgs::default(), Some("tcp://127.0.0.1:8080".into()))
                .unwrap();
        assert_eq!(cfg.agent_address, "tcp://127.0.0.1:8080");
    }

    #[test]
    fn rejects_invalid_agent_address() {
        let file = FileConfig {
            agent_address: Some("http://localhost".into()),
            ..x509_file()
        };
        assert!(matches!(resolve(file), Err(ConfigError::AgentAddress(_))));
    }

    #[test]
    fn cli_daemon_mode_overrides_file() {
        let file = FileConfig {
            daemon_mode: Some(true),
            ..x509_file()
        };
        let cli = CliArgs {
            daemon_mode: Some(false),
            ..CliArgs::default()
        };
        let cfg = RotationConfig::resolve(file, &cli, None).unwrap();
        assert_eq!(cfg.mode(), RunMode::OneShot);
    }

    #[test]
    fn exit_when_ready_selects_one_shot() {
        let file = FileConfig {
            exit_when_ready: Some(true),
            ..x509_file()
        };
        assert_eq!(resolve(file).unwrap().mode(), RunMode::OneShot);
    }

    #[test]
    fn x509_files_are_all_or_none() {
        let file = FileConfig {
            svid_bundle_file_name: None,
            ..x509_file()
        };
        assert!(matches!(resolve(file), Err(ConfigError::IncompleteX509Files)));
    }

    #[test]
    fn requires_something_to_fetch() {
        assert!(matches!(
            resolve(FileConfig::default()),
            Err(ConfigError::NothingToFetch)
        ));
    }

    #[test]
    fn jwt_entries_need_audience_and_file() {
        let file = FileConfig {
            jwt_svids: vec![FileJwtSvid {
                jwt_audience: "db".into(),
                ..FileJwtSvid::default()
            }],
            ..FileConfig::default()
        };
        assert!(matches!(
            resolve(file),
            Err(ConfigError::MissingJwtFileName { index: 0 })
        ));

        let file = FileConfig {
            jwt_svids: vec![FileJwtSvid {
                jwt_svid_file_name: "db.token".into(),
                ..FileJwtSvid::default()
            }],
            ..FileConfig::default()
        };
        assert!(matches!(
            resolve(file),
            Err(ConfigError::MissingJwtAudience { index: 0 })
        ));
    }

    #[test]
    fn audience_keys_are_deduplicated() {
        let entry = |file: &str| FileJwtSvid {
            jwt_audience: "db".into(),
            jwt_svid_file_name: file.into(),
            ..FileJwtSvid::default()
        };
        let file = FileConfig {
            jwt_svids: vec![entry("a.token"), entry("b.token")],
            ..FileConfig::default()
        };
        let cfg = resolve(file).unwrap();
        assert_eq!(cfg.audience_keys(), vec![AudienceKey::new("db", vec![])]);
    }

    #[test]
    fn every_audience_is_its_own_slot() {
        let entry = |audience: &str| FileJwtSvid {
            jwt_audience: audience.into(),
            jwt_svid_file_name: format!("{audience}.token"),
            ..FileJwtSvid::default()
        };
        let file = FileConfig {
            jwt_svids: vec![entry("db"), entry("cache")],
            jwt_bundle_file_name: Some("bundle.json".into()),
            ..x509_file()
        };
        let cfg = resolve(file).unwrap();
        assert_eq!(
            cfg.configured_slots(),
            vec![
                UpdateSlot::X509,
                UpdateSlot::JwtSvid(AudienceKey::new("db", vec![])),
                UpdateSlot::JwtSvid(AudienceKey::new("cache", vec![])),
                UpdateSlot::JwtBundle,
            ]
        );
    }

    #[test]
    fn zero_min_restart_backoff_still_throttles() {
        use crate::backoff::{restart_strategy, BackoffStrategy as _};

        let file = FileConfig {
            cmd: Some("/bin/app".into()),
            cmd_restart_min_backoff: Some("0s".into()),
            cmd_restart_max_backoff: Some("5s".into()),
            ..x509_file()
        };
        let cmd = resolve(file).unwrap().command.unwrap();
        assert_eq!(cmd.restart_backoff.min_backoff, Duration::ZERO);

        let mut strategy = restart_strategy(cmd.restart_backoff);
        assert!(strategy.is_throttled());
        assert_eq!(strategy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn pid_file_requires_signal() {
        let file = FileConfig {
            pid_file_name: Some("/run/app.pid".into()),
            ..x509_file()
        };
        assert!(matches!(resolve(file), Err(ConfigError::PidFileWithoutSignal)));
    }

    #[test]
    fn rejects_unknown_signal() {
        let file = FileConfig {
            renew_signal: Some("SIGBOGUS".into()),
            ..x509_file()
        };
        assert!(matches!(resolve(file), Err(ConfigError::InvalidSignal(s)) if s == "SIGBOGUS"));
    }

    #[test]
    fn forward_exit_code_requires_cmd() {
        let file = FileConfig {
            cmd_forward_exit_code: Some(true),
            ..x509_file()
        };
        assert!(matches!(
            resolve(file),
            Err(ConfigError::ForwardExitCodeWithoutCmd)
        ));
    }

    #[test]
    fn file_modes_are_bounded_and_zero_means_default() {
        let file = FileConfig {
            key_file_mode: Some(0o1777),
            ..x509_file()
        };
        assert!(matches!(
            resolve(file),
            Err(ConfigError::InvalidFileMode { key: "key_file_mode", .. })
        ));

        let file = FileConfig {
            cert_file_mode: Some(0),
            ..x509_file()
        };
        assert_eq!(resolve(file).unwrap().modes.cert, 0o644);
    }

    #[test]
    fn command_settings_are_resolved() {
        let file = FileConfig {
            cmd: Some("/bin/app".into()),
            cmd_args: Some("--ignored".into()),
            cmd_args_array: vec!["--flag".into()],
            cmd_restart_max_backoff: Some("0s".into()),
            cmd_shutdown_grace_period: Some("250ms".into()),
            cmd_write_pid_file: Some("/run/app.pid".into()),
            ..x509_file()
        };
        let cmd = resolve(file).unwrap().command.unwrap();

        assert_eq!(cmd.program, "/bin/app");
        assert_eq!(cmd.args, vec!["--flag"]);
        assert_eq!(cmd.restart_backoff.max_backoff, Duration::ZERO);
        assert_eq!(cmd.shutdown_grace, Duration::from_millis(250));
        assert_eq!(cmd.pid_file, Some(PathBuf::from("/run/app.pid")));
    }

    #[test]
    fn rejects_bad_duration() {
        let file = FileConfig {
            cmd: Some("/bin/app".into()),
            cmd_restart_min_backoff: Some("soon".into()),
            ..x509_file()
        };
        assert!(matches!(
            resolve(file),
            Err(ConfigError::InvalidDuration {
                key: "cmd_restart_min_backoff",
                ..
            })
        ));
    }

    #[test]
    fn legacy_args_are_used_when_array_is_empty() {
        let file = FileConfig {
            cmd: Some("/bin/app".into()),
            cmd_args: Some(r#"-c "hello world""#.into()),
            ..x509_file()
        };
        let cmd = resolve(file).unwrap().command.unwrap();
        assert_eq!(cmd.args, vec!["-c", "hello world"]);
    }

    #[test]
    fn positional_command_overrides_file() {
        let file = FileConfig {
            cmd: Some("/bin/app".into()),
            cmd_args_array: vec!["--flag".into()],
            ..x509_file()
        };
        let cli = CliArgs {
            command: true,
            positional: vec!["/bin/other".into(), "x".into()],
            ..CliArgs::default()
        };
        let cmd = RotationConfig::resolve(file, &cli, None)
            .unwrap()
            .command
            .unwrap();
        assert_eq!(cmd.program, "/bin/other");
        assert_eq!(cmd.args, vec!["x"]);

        let cli = CliArgs {
            command: true,
            ..CliArgs::default()
        };
        assert!(matches!(
            RotationConfig::resolve(x509_file(), &cli, None),
            Err(ConfigError::MissingPositionalCommand)
        ));
    }

    #[test]
    fn split_legacy_args_handles_quotes() {
        assert_eq!(split_legacy_args("a b c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            split_legacy_args(r#"-e "x y" "say ""hi""""#).unwrap(),
            vec!["-e", "x y", r#"say "hi""#]
        );
        assert_eq!(split_legacy_args("a  b").unwrap(), vec!["a", "", "b"]);
        assert_eq!(split_legacy_args(r#""""#).unwrap(), vec![""]);
    }

    #[test]
    fn split_legacy_args_rejects_bad_quotes() {
        assert!(split_legacy_args(r#""open"#).is_err());
        assert!(split_legacy_args(r#"a"b"#).is_err());
        assert!(split_legacy_args(r#""a"b"#).is_err());
    }
}
