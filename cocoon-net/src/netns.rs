//! Network namespace and tap/TC wiring via `ip -n`/`tc -n` (spec §4.5 step
//! 2(a)-(e)).
//!
//! Entering the target netns is done by delegating to iproute2's own
//! `-n`/`--netns` flag rather than calling `setns()` from this process —
//! the same external-process idiom this workspace already uses for
//! `mkfs.erofs`/`qemu-img`. A raw OS-thread-pinned `setns()` is reserved
//! for the hypervisor's detached process spawn, the one place the engine
//! genuinely needs the calling thread itself inside the target namespace.

use std::path::Path;
use std::time::Duration;

use cocoon_core::error::{Error, Result};
use serde_json::Value;
use tokio::process::Command;

/// Named netns mount directory iproute2 manages (`/var/run/netns/<name>`).
const NETNS_DIR: &str = "/var/run/netns";

/// The veth MAC and matched MTU wired onto one NIC, read back from the
/// guest-facing interface after wiring completes.
#[derive(Debug, Clone)]
pub struct WiredNic {
    /// MAC address of the veth; the guest virtio-net must mirror this for
    /// anti-spoofing CNI plugins to pass the packet through.
    pub mac: String,
}

/// Full path to a named netns, as CNI plugins and `ip -n` expect it.
#[must_use]
pub fn netns_path(name: &str) -> String {
    format!("{NETNS_DIR}/{name}")
}

/// Creates a named netns (`ip netns add <name>`).
pub async fn add(name: &str) -> Result<()> {
    run_ip(&["netns", "add", name]).await.map(drop)
}

/// Removes a named netns, tolerating "already gone" and retrying briefly
/// against a network device still settling (spec §4.5 Delete).
pub async fn remove(name: &str) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for attempt in 0..ATTEMPTS {
        match run_ip(&["netns", "delete", name]).await {
            Ok(_) => return Ok(()),
            Err(Error::Subprocess { detail, .. }) if detail.contains("No such file") || detail.contains("not exist") => {
                return Ok(());
            }
            Err(error) => {
                last_err = Some(error);
                if attempt + 1 < ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(Error::Validation(format!("failed to remove netns {name}"))))
}

/// Wires one NIC inside `netns`: flushes addresses from the CNI-created
/// veth, creates a tap device, MTU-matches it, brings both up, and
/// installs bidirectional TC redirect filters so every packet crossing
/// `if_name` is mirrored onto `tap_name` and vice versa.
pub async fn wire_nic(netns: &str, if_name: &str, tap_name: &str, multi_queue: bool) -> Result<WiredNic> {
    run_ip(&["-n", netns, "addr", "flush", "dev", if_name]).await?;

    let mut tuntap_args = vec!["-n", netns, "tuntap", "add", "dev", tap_name, "mode", "tap"];
    if multi_queue {
        tuntap_args.push("multi_queue");
    }
    run_ip(&tuntap_args).await?;

    let link_info = show_link(netns, if_name).await?;
    let mtu = link_info["mtu"]
        .as_u64()
        .ok_or_else(|| Error::Validation(format!("could not read mtu for {if_name} in {netns}")))?;
    let mac = link_info["address"]
        .as_str()
        .ok_or_else(|| Error::Validation(format!("could not read mac for {if_name} in {netns}")))?
        .to_owned();

    run_ip(&["-n", netns, "link", "set", "dev", tap_name, "mtu", &mtu.to_string()]).await?;
    run_ip(&["-n", netns, "link", "set", "dev", if_name, "up"]).await?;
    run_ip(&["-n", netns, "link", "set", "dev", tap_name, "up"]).await?;

    wire_redirect(netns, if_name, tap_name).await?;
    wire_redirect(netns, tap_name, if_name).await?;

    Ok(WiredNic { mac })
}

/// Queries `ip -n <netns> -j link show dev <if_name>` and returns the
/// first (only) element of the JSON array it prints.
async fn show_link(netns: &str, if_name: &str) -> Result<Value> {
    let stdout = run_ip(&["-n", netns, "-j", "link", "show", "dev", if_name]).await?;
    let parsed: Vec<Value> = serde_json::from_slice(&stdout)?;
    parsed
        .into_iter()
        .next()
        .ok_or_else(|| Error::Validation(format!("no link info for {if_name} in {netns}")))
}

/// Attaches an ingress qdisc to `from` (idempotent: "exists" is not an
/// error) and installs a catch-all u32/mirred filter that redirects every
/// ingress packet to `to`'s egress.
async fn wire_redirect(netns: &str, from: &str, to: &str) -> Result<()> {
    match run_tc(&["-n", netns, "qdisc", "add", "dev", from, "ingress"]).await {
        Ok(_) => {}
        Err(Error::Subprocess { detail, .. }) if detail.contains("File exists") => {}
        Err(error) => return Err(error),
    }
    run_tc(&[
        "-n", netns, "filter", "add", "dev", from, "parent", "ffff:", "protocol", "all", "u32", "match", "u32", "0",
        "0", "action", "mirred", "egress", "redirect", "dev", to,
    ])
    .await
    .map(drop)
}

async fn run_ip(args: &[&str]) -> Result<Vec<u8>> {
    run_command("ip", args).await
}

async fn run_tc(args: &[&str]) -> Result<Vec<u8>> {
    run_command("tc", args).await
}

async fn run_command(bin: &str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(bin).args(args).output().await.map_err(|e| Error::Subprocess {
        bin: bin.to_owned(),
        detail: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::Subprocess {
            bin: bin.to_owned(),
            detail: format!(
                "{} exited {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(output.stdout)
}

/// `true` if `path` names an existing named netns directory entry.
#[must_use]
pub fn exists(name: &str) -> bool {
    Path::new(&netns_path(name)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_path_is_under_var_run_netns() {
        assert_eq!(netns_path("cocoon-abc"), "/var/run/netns/cocoon-abc");
    }

    #[test]
    fn exists_is_false_for_unknown_namespace() {
        assert!(!exists("cocoon-definitely-not-a-real-namespace"));
    }
}
