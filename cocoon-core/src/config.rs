//! Global configuration surface (spec §6, §10.3).
//!
//! Layered in precedence order: built-in defaults → `--config PATH` (TOML)
//! → `COCOON_*` environment variables → explicit CLI flags. The CLI crate
//! owns flag parsing; this type is the resolved result every backend is
//! constructed from.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resolved global configuration, one instance per CLI invocation (spec §9:
/// "every command reconstructs backends from config").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persistent data root (images, indexes, firmware).
    pub root_dir: PathBuf,
    /// Ephemeral per-VM runtime root (sockets, PID files, COW disks).
    pub run_dir: PathBuf,
    /// Per-VM log root.
    pub log_dir: PathBuf,
    /// Directory containing CNI `.conflist` files.
    pub cni_conf_dir: PathBuf,
    /// Directory containing CNI plugin binaries.
    pub cni_bin_dir: PathBuf,
    /// Path to the `cloud-hypervisor` binary (resolved via `PATH` if a bare
    /// name).
    pub hypervisor_bin: String,
    /// Default root password for cloud-image VMs (cidata `chpasswd`).
    pub root_password: Option<String>,
    /// DNS servers applied to cloud-image netplan configuration.
    pub dns: Vec<String>,
    /// `tracing` filter directive (spec §10.1).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/cocoon"),
            run_dir: PathBuf::from("/var/run/cocoon"),
            log_dir: PathBuf::from("/var/log/cocoon"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            hypervisor_bin: "cloud-hypervisor".to_owned(),
            root_password: None,
            dns: vec!["8.8.8.8".to_owned(), "1.1.1.1".to_owned()],
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    /// Loads and merges a TOML config file on top of [`Config::default`].
    /// Missing file is not an error — callers pass `--config` only when
    /// the user specified one.
    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Validation(format!("{}: {e}", path.display())))
    }

    /// Applies `COCOON_*` environment variable overrides on top of the
    /// current value. Unset variables leave the field untouched.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("COCOON_ROOT_DIR") {
            self.root_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COCOON_RUN_DIR") {
            self.run_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COCOON_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COCOON_CNI_CONF_DIR") {
            self.cni_conf_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COCOON_CNI_BIN_DIR") {
            self.cni_bin_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COCOON_ROOT_PASSWORD") {
            self.root_password = Some(v);
        }
        if let Ok(v) = std::env::var("COCOON_DNS") {
            self.dns = split_dns_list(&v);
        }
        if let Ok(v) = std::env::var("COCOON_LOG_LEVEL") {
            self.log_level = v;
        }
        self
    }

    /// `oci/` subtree under `root_dir`.
    #[must_use]
    pub fn oci_dir(&self) -> PathBuf {
        self.root_dir.join("oci")
    }

    /// `cloudimg/` subtree under `root_dir`.
    #[must_use]
    pub fn cloudimg_dir(&self) -> PathBuf {
        self.root_dir.join("cloudimg")
    }

    /// `cni/` subtree under `root_dir`.
    #[must_use]
    pub fn cni_dir(&self) -> PathBuf {
        self.root_dir.join("cni")
    }

    /// `cloudhypervisor/` subtree under `root_dir`.
    #[must_use]
    pub fn hypervisor_db_dir(&self) -> PathBuf {
        self.root_dir.join("cloudhypervisor")
    }

    /// Per-VM runtime directory `<run_dir>/cloudhypervisor/<id>`.
    #[must_use]
    pub fn vm_run_dir(&self, id: &str) -> PathBuf {
        self.run_dir.join("cloudhypervisor").join(id)
    }

    /// Per-VM log directory `<log_dir>/cloudhypervisor/<id>`.
    #[must_use]
    pub fn vm_log_dir(&self, id: &str) -> PathBuf {
        self.log_dir.join("cloudhypervisor").join(id)
    }

    /// `firmware/CLOUDHV.fd` under `root_dir`.
    #[must_use]
    pub fn firmware_path(&self) -> PathBuf {
        self.root_dir.join("firmware").join("CLOUDHV.fd")
    }
}

/// Splits a comma- or semicolon-separated DNS list, trimming whitespace
/// and dropping empty entries.
#[must_use]
pub fn split_dns_list(s: &str) -> Vec<String> {
    s.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses a human size string (`"1G"`, `"512M"`, `"10240"`) into bytes.
/// Inverse of the CLI's display-side `human_size` helper.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, mult): (&str, u64) = if let Some(n) = s.strip_suffix(['g', 'G']) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix(['m', 'M']) {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix(['k', 'K']) {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid size: {s}")))?;
    if value < 0.0 {
        return Err(Error::Validation(format!("invalid size: {s}")));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((value * mult as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_sizes() {
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("10240").unwrap(), 10240);
    }

    #[test]
    fn splits_dns_on_comma_or_semicolon() {
        assert_eq!(
            split_dns_list("8.8.8.8,1.1.1.1"),
            vec!["8.8.8.8".to_owned(), "1.1.1.1".to_owned()]
        );
        assert_eq!(
            split_dns_list("8.8.8.8; 1.1.1.1 "),
            vec!["8.8.8.8".to_owned(), "1.1.1.1".to_owned()]
        );
    }

    #[test]
    fn default_dirs_are_fhs_paths() {
        let cfg = Config::default();
        assert_eq!(cfg.root_dir, PathBuf::from("/var/lib/cocoon"));
        assert_eq!(cfg.oci_dir(), PathBuf::from("/var/lib/cocoon/oci"));
    }
}
