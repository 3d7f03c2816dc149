//! CNI ADD/DEL plugin invocation (spec §4.5 step 2).
//!
//! There is no CNI client library in this workspace's dependency stack, so
//! this speaks the wire protocol directly: find the first `.conflist` in
//! the conf dir, run each listed plugin binary in order with
//! `CNI_COMMAND`/`CNI_CONTAINERID`/`CNI_NETNS`/`CNI_IFNAME`/`CNI_PATH` set
//! and the merged netconf JSON on stdin, chaining each plugin's result into
//! the next as `prevResult`.

use std::path::Path;

use cocoon_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

/// The ADD result returned by the last plugin in a conflist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CniResult {
    /// CNI spec version echoed back by the plugin chain.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces the plugin chain created or modified.
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    /// IP assignments, indexed by `interface` into `interfaces`.
    #[serde(default)]
    pub ips: Vec<CniIp>,
}

/// One interface entry in a [`CniResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CniInterface {
    /// Interface name as seen inside the sandbox.
    pub name: String,
    /// MAC address, when the plugin reports one.
    pub mac: Option<String>,
    /// Netns path the interface lives in.
    pub sandbox: Option<String>,
}

/// One IP assignment in a [`CniResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CniIp {
    /// Address in CIDR form (`"10.0.0.5/24"`).
    pub address: String,
    /// Gateway address, when IPAM assigned one.
    pub gateway: Option<String>,
    /// Index into the result's `interfaces` this IP belongs to.
    pub interface: Option<usize>,
}

impl CniResult {
    /// The first IP entry's address/gateway/prefix, parsed out of CIDR
    /// form. Fails if IPAM produced no IPs at all.
    pub fn primary_ip(&self) -> Result<(String, String, u8)> {
        let ip = self
            .ips
            .first()
            .ok_or_else(|| Error::Validation("CNI result has no IP assignment".to_owned()))?;
        let (addr, prefix) = ip
            .address
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("CNI address not in CIDR form: {}", ip.address)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Validation(format!("invalid CIDR prefix: {}", ip.address)))?;
        let gateway = ip.gateway.clone().unwrap_or_default();
        Ok((addr.to_owned(), gateway, prefix))
    }
}

/// Locates the first `.conflist` file in `conf_dir`, sorted by filename
/// (spec §4.5 step 2: "the first `.conflist` found in the CNI conf dir").
pub fn find_conflist(conf_dir: &Path) -> Result<Value> {
    let mut candidates: Vec<_> = std::fs::read_dir(conf_dir)
        .map_err(|e| Error::Validation(format!("reading CNI conf dir {}: {e}", conf_dir.display())))?
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "conflist"))
        .map(|e| e.path())
        .collect();
    candidates.sort();
    let path = candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Validation(format!("no .conflist file under {}", conf_dir.display())))?;
    let text = std::fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(Error::from)
}

/// Runs CNI ADD for every plugin in the conflist, in order, chaining
/// `prevResult`. Returns the last plugin's result.
pub async fn add(conf_dir: &Path, bin_dir: &Path, vm_id: &str, netns_path: &str, if_name: &str) -> Result<CniResult> {
    let conflist = find_conflist(conf_dir)?;
    let plugins = plugin_list(&conflist)?;

    let mut prev_result: Option<Value> = None;
    let mut last: Option<Value> = None;
    for plugin in &plugins {
        let netconf = build_netconf(&conflist, plugin, prev_result.as_ref());
        let result = run_plugin("ADD", &netconf, bin_dir, vm_id, netns_path, if_name).await?;
        prev_result = Some(result.clone());
        last = Some(result);
    }

    let result = last.ok_or_else(|| Error::Validation("conflist has no plugins".to_owned()))?;
    serde_json::from_value(result).map_err(Error::from)
}

/// Runs CNI DEL for every plugin in the conflist, in *reverse* order
/// (spec §4.5 Delete). Best-effort: a failing plugin is logged, not
/// propagated, since netns destruction will finish the cleanup anyway.
pub async fn del(conf_dir: &Path, bin_dir: &Path, vm_id: &str, netns_path: &str, if_name: &str) {
    let conflist = match find_conflist(conf_dir) {
        Ok(c) => c,
        Err(error) => {
            tracing::warn!(%error, "cni del: could not load conflist, skipping plugin teardown");
            return;
        }
    };
    let plugins = match plugin_list(&conflist) {
        Ok(p) => p,
        Err(error) => {
            tracing::warn!(%error, "cni del: malformed conflist, skipping plugin teardown");
            return;
        }
    };

    for plugin in plugins.iter().rev() {
        let netconf = build_netconf(&conflist, plugin, None);
        if let Err(error) = run_plugin("DEL", &netconf, bin_dir, vm_id, netns_path, if_name).await {
            tracing::warn!(%error, plugin = %plugin_type(plugin), "cni del: plugin failed, continuing");
        }
    }
}

fn plugin_list(conflist: &Value) -> Result<Vec<Value>> {
    conflist["plugins"]
        .as_array()
        .cloned()
        .ok_or_else(|| Error::Validation("conflist missing \"plugins\" array".to_owned()))
}

fn plugin_type(plugin: &Value) -> String {
    plugin["type"].as_str().unwrap_or("<unknown>").to_owned()
}

/// Merges the conflist's top-level `cniVersion`/`name` into one plugin's
/// config object, attaching `prevResult` when chaining from an earlier
/// plugin in the list.
fn build_netconf(conflist: &Value, plugin: &Value, prev_result: Option<&Value>) -> Value {
    let mut netconf = plugin.clone();
    if let Some(obj) = netconf.as_object_mut() {
        if let Some(version) = conflist.get("cniVersion") {
            obj.entry("cniVersion").or_insert_with(|| version.clone());
        }
        if let Some(name) = conflist.get("name") {
            obj.entry("name").or_insert_with(|| name.clone());
        }
        if let Some(prev) = prev_result {
            obj.insert("prevResult".to_owned(), prev.clone());
        }
    }
    netconf
}

/// Spawns the plugin binary named by `netconf["type"]`, feeding it the
/// netconf JSON on stdin and the CNI env var contract, and parses its
/// stdout as a result object.
async fn run_plugin(
    command: &str,
    netconf: &Value,
    bin_dir: &Path,
    vm_id: &str,
    netns_path: &str,
    if_name: &str,
) -> Result<Value> {
    let plugin_type = netconf["type"]
        .as_str()
        .ok_or_else(|| Error::Validation("plugin config missing \"type\"".to_owned()))?;
    let bin_path = bin_dir.join(plugin_type);

    let mut child = Command::new(&bin_path)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", vm_id)
        .env("CNI_NETNS", netns_path)
        .env("CNI_IFNAME", if_name)
        .env("CNI_PATH", bin_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| Error::Subprocess {
            bin: plugin_type.to_owned(),
            detail: e.to_string(),
        })?;

    let stdin_bytes = serde_json::to_vec(netconf)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&stdin_bytes).await.map_err(|e| Error::Subprocess {
            bin: plugin_type.to_owned(),
            detail: e.to_string(),
        })?;
    }

    let output = child.wait_with_output().await.map_err(|e| Error::Subprocess {
        bin: plugin_type.to_owned(),
        detail: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::Subprocess {
            bin: plugin_type.to_owned(),
            detail: format!(
                "{command} exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_netconf_merges_top_level_fields() {
        let conflist = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "cocoon",
            "plugins": [{"type": "bridge"}],
        });
        let plugin = &conflist["plugins"][0];
        let netconf = build_netconf(&conflist, plugin, None);
        assert_eq!(netconf["cniVersion"], "1.0.0");
        assert_eq!(netconf["name"], "cocoon");
        assert_eq!(netconf["type"], "bridge");
        assert!(netconf.get("prevResult").is_none());
    }

    #[test]
    fn build_netconf_chains_prev_result() {
        let conflist = serde_json::json!({"cniVersion": "1.0.0", "name": "cocoon", "plugins": [{"type": "tuning"}]});
        let plugin = &conflist["plugins"][0];
        let prev = serde_json::json!({"ips": [{"address": "10.0.0.2/24"}]});
        let netconf = build_netconf(&conflist, plugin, Some(&prev));
        assert_eq!(netconf["prevResult"]["ips"][0]["address"], "10.0.0.2/24");
    }

    #[test]
    fn primary_ip_parses_cidr() {
        let result = CniResult {
            cni_version: "1.0.0".to_owned(),
            interfaces: vec![],
            ips: vec![CniIp {
                address: "10.1.2.3/24".to_owned(),
                gateway: Some("10.1.2.1".to_owned()),
                interface: Some(0),
            }],
        };
        let (ip, gw, prefix) = result.primary_ip().unwrap();
        assert_eq!(ip, "10.1.2.3");
        assert_eq!(gw, "10.1.2.1");
        assert_eq!(prefix, 24);
    }

    #[test]
    fn primary_ip_rejects_empty_result() {
        let result = CniResult::default();
        assert!(result.primary_ip().is_err());
    }
}
