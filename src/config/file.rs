//! TOML configuration file schema.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{ConfigError, JwtSvidEncoding};

/// Raw configuration file contents. Every field is optional so the CLI and
/// built-in defaults can fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Workload API address (`unix:///path` or `tcp://ip:port`).
    pub agent_address: Option<String>,
    /// Command to supervise.
    pub cmd: Option<String>,
    /// Deprecated space-separated argument string.
    pub cmd_args: Option<String>,
    /// Argument vector. Takes precedence over `cmd_args` when non-empty.
    #[serde(default)]
    pub cmd_args_array: Vec<String>,
    /// Attach the helper's standard input to the command.
    pub cmd_attach_stdin: Option<bool>,
    /// Exit with the command's exit code instead of restarting it.
    pub cmd_forward_exit_code: Option<bool>,
    /// Where to write the supervised command's PID.
    pub cmd_write_pid_file: Option<PathBuf>,
    /// Initial restart delay, e.g. `"1s"`.
    pub cmd_restart_min_backoff: Option<String>,
    /// Maximum restart delay. `"0s"` restarts immediately.
    pub cmd_restart_max_backoff: Option<String>,
    /// Time the command gets to exit after `SIGTERM`.
    pub cmd_shutdown_grace_period: Option<String>,
    /// PID file of an external process to signal on renewal.
    pub pid_file_name: Option<PathBuf>,
    /// Directory the credential files are written to.
    pub cert_dir: Option<PathBuf>,
    /// Rotate credentials continuously (default) or fetch once.
    pub daemon_mode: Option<bool>,
    /// Exit after the first complete set of credentials is written.
    pub exit_when_ready: Option<bool>,
    /// Write intermediates to the bundle file instead of the SVID file.
    pub add_intermediates_to_bundle: Option<bool>,
    /// Append federated CAs to the bundle file.
    pub include_federated_domains: Option<bool>,
    /// Signal sent on renewal, e.g. `"SIGHUP"`.
    pub renew_signal: Option<String>,
    /// X.509 SVID certificate file.
    pub svid_file_name: Option<String>,
    /// X.509 SVID private key file.
    pub svid_key_file_name: Option<String>,
    /// X.509 trust bundle file.
    pub svid_bundle_file_name: Option<String>,
    /// JWT bundle file (JSON).
    pub jwt_bundle_file_name: Option<String>,
    /// JWT SVID requests.
    #[serde(default)]
    pub jwt_svids: Vec<FileJwtSvid>,
    /// Mode of certificate and bundle files.
    pub cert_file_mode: Option<u32>,
    /// Mode of the private key file.
    pub key_file_mode: Option<u32>,
    /// Mode of the JWT bundle file.
    pub jwt_bundle_file_mode: Option<u32>,
    /// Mode of JWT SVID files.
    pub jwt_svid_file_mode: Option<u32>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: Option<String>,
    /// Health listener settings.
    pub health_checks: Option<FileHealthChecks>,
}

/// One `[[jwt_svids]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileJwtSvid {
    /// Primary audience.
    #[serde(default)]
    pub jwt_audience: String,
    /// Additional audiences.
    #[serde(default)]
    pub jwt_extra_audiences: Vec<String>,
    /// Output file.
    #[serde(default)]
    pub jwt_svid_file_name: String,
    /// Token encoding on disk.
    #[serde(default)]
    pub jwt_svid_encoding: JwtSvidEncoding,
}

/// The `[health_checks]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHealthChecks {
    /// Serve health endpoints (daemon mode only).
    #[serde(default)]
    pub listener_enabled: bool,
    /// Listener port.
    pub bind_port: Option<u16>,
    /// Liveness route.
    pub liveness_path: Option<String>,
    /// Readiness route.
    pub readiness_path: Option<String>,
}

impl FileConfig {
    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const FULL: &str = r#"
agent_address = "unix:///tmp/agent.sock"
cmd = "/usr/sbin/nginx"
cmd_args_array = ["-g", "daemon off;"]
cmd_attach_stdin = true
cmd_restart_max_backoff = "0s"
cert_dir = "/certs"
daemon_mode = false
renew_signal = "SIGHUP"
svid_file_name = "svid.pem"
svid_key_file_name = "svid_key.pem"
svid_bundle_file_name = "svid_bundle.pem"
jwt_bundle_file_name = "bundle.json"
cert_file_mode = 0o640
key_file_mode = 0o600

[[jwt_svids]]
jwt_audience = "db"
jwt_extra_audiences = ["cache"]
jwt_svid_file_name = "db.token"
jwt_svid_encoding = "base64"

[health_checks]
listener_enabled = true
bind_port = 9000
"#;

    #[test]
    fn parses_full_file() {
        let cfg = FileConfig::parse(FULL).unwrap();

        assert_eq!(cfg.cmd.as_deref(), Some("/usr/sbin/nginx"));
        assert_eq!(cfg.cmd_args_array, vec!["-g", "daemon off;"]);
        assert_eq!(cfg.daemon_mode, Some(false));
        assert_eq!(cfg.cert_file_mode, Some(0o640));
        assert_eq!(cfg.jwt_svids.len(), 1);
        assert_eq!(cfg.jwt_svids[0].jwt_svid_encoding, JwtSvidEncoding::Base64);
        assert_eq!(cfg.jwt_svids[0].jwt_extra_audiences, vec!["cache"]);
        let health = cfg.health_checks.unwrap();
        assert!(health.listener_enabled);
        assert_eq!(health.bind_port, Some(9000));
        assert_eq!(health.liveness_path, None);
    }

    #[test]
    fn daemon_mode_absent_is_none() {
        let cfg = FileConfig::parse("cert_dir = \"/x\"").unwrap();
        assert_eq!(cfg.daemon_mode, None);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = FileConfig::parse("svid_filename = \"typo.pem\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/helper.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
