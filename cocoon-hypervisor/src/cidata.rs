//! cloud-init NoCloud `cidata` disk generation (spec §4.6 Create, cloudimg
//! path): a small FAT12 volume containing `meta-data` and `user-data`,
//! matched by guests via the well-known `cidata` volume label.

use std::io::Write as _;
use std::path::Path;

use cocoon_core::error::{Error, Result};
use cocoon_core::model::NetworkConfig;
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};

/// cloud-init's required volume label for NoCloud datasource discovery.
const VOLUME_LABEL: &[u8; 11] = b"cidata     ";
/// Fixed disk size; `meta-data`/`user-data` are a few hundred bytes each.
const IMAGE_SIZE_BYTES: u64 = 1024 * 1024;

/// Everything [`write`] needs to render `meta-data`/`user-data`.
pub struct CidataInput<'a> {
    /// cloud-init `instance-id` (the VM id is used, so a recreated VM with
    /// the same name still gets a fresh cloud-init run).
    pub instance_id: &'a str,
    /// cloud-init `local-hostname`.
    pub hostname: &'a str,
    /// Root password to `chpasswd`, if the deployment configured one.
    pub root_password: Option<&'a str>,
    /// DNS nameservers applied to every configured interface.
    pub dns: &'a [String],
    /// NIC configs to render as netplan `ethernets` entries, matched by
    /// MAC so interface naming order doesn't matter inside the guest.
    pub nics: &'a [NetworkConfig],
}

/// Formats a fresh FAT12 volume at `dest` and writes `meta-data`/
/// `user-data` into it.
pub fn write(dest: &Path, input: &CidataInput<'_>) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(dest)?;
    file.set_len(IMAGE_SIZE_BYTES)?;

    fatfs::format_volume(&mut file, FormatVolumeOptions::new().volume_label(*VOLUME_LABEL))
        .map_err(|e| Error::Validation(format!("formatting cidata volume: {e}")))?;

    let fs = FileSystem::new(&mut file, FsOptions::new()).map_err(|e| Error::Validation(format!("opening cidata volume: {e}")))?;
    let root = fs.root_dir();

    root.create_file("meta-data")
        .map_err(|e| Error::Validation(e.to_string()))?
        .write_all(meta_data(input).as_bytes())?;
    root.create_file("user-data")
        .map_err(|e| Error::Validation(e.to_string()))?
        .write_all(user_data(input).as_bytes())?;

    Ok(())
}

fn meta_data(input: &CidataInput<'_>) -> String {
    format!("instance-id: {}\nlocal-hostname: {}\n", input.instance_id, input.hostname)
}

fn user_data(input: &CidataInput<'_>) -> String {
    let mut out = String::from("#cloud-config\n");

    if let Some(password) = input.root_password {
        out.push_str("chpasswd:\n");
        out.push_str("  list: |\n");
        out.push_str(&format!("    root:{password}\n"));
        out.push_str("  expire: false\n");
        out.push_str("ssh_pwauth: true\n");
    }

    let ethernets: Vec<(usize, &NetworkConfig)> = input
        .nics
        .iter()
        .enumerate()
        .filter(|(_, n)| n.network.is_some())
        .collect();
    if ethernets.is_empty() {
        return out;
    }

    out.push_str("network:\n  version: 2\n  ethernets:\n");
    for (i, nic) in ethernets {
        let Some(attachment) = &nic.network else { continue };
        out.push_str(&format!("    eth{i}:\n"));
        out.push_str("      match:\n");
        out.push_str(&format!("        macaddress: \"{}\"\n", nic.mac));
        out.push_str("      set-name: ");
        out.push_str(&format!("eth{i}\n"));
        out.push_str(&format!("      addresses: [\"{}/{}\"]\n", attachment.ip, attachment.prefix));
        out.push_str(&format!("      gateway4: {}\n", attachment.gateway));
        if !input.dns.is_empty() {
            out.push_str("      nameservers:\n        addresses: [");
            out.push_str(&input.dns.iter().map(|d| format!("\"{d}\"")).collect::<Vec<_>>().join(", "));
            out.push_str("]\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cocoon_core::model::NetworkAttachment;

    #[test]
    fn user_data_omits_network_section_without_nics() {
        let input = CidataInput {
            instance_id: "abc",
            hostname: "web",
            root_password: None,
            dns: &[],
            nics: &[],
        };
        assert_eq!(user_data(&input), "#cloud-config\n");
    }

    #[test]
    fn user_data_includes_chpasswd_when_password_set() {
        let input = CidataInput {
            instance_id: "abc",
            hostname: "web",
            root_password: Some("hunter2"),
            dns: &[],
            nics: &[],
        };
        assert!(user_data(&input).contains("root:hunter2"));
    }

    #[test]
    fn user_data_renders_matched_ethernet_by_mac() {
        let nic = NetworkConfig {
            tap: "tap0".to_owned(),
            mac: "52:54:00:12:34:56".to_owned(),
            queue: false,
            queue_size: 1,
            network: Some(NetworkAttachment {
                id: "cocoon-abc".to_owned(),
                r#type: "cni".to_owned(),
                ip: "10.0.0.5".to_owned(),
                gateway: "10.0.0.1".to_owned(),
                prefix: 24,
                hostname: None,
            }),
        };
        let dns = vec!["8.8.8.8".to_owned()];
        let input = CidataInput {
            instance_id: "abc",
            hostname: "web",
            root_password: None,
            dns: &dns,
            nics: std::slice::from_ref(&nic),
        };
        let rendered = user_data(&input);
        assert!(rendered.contains("macaddress: \"52:54:00:12:34:56\""));
        assert!(rendered.contains("addresses: [\"10.0.0.5/24\"]"));
        assert!(rendered.contains("gateway4: 10.0.0.1"));
        assert!(rendered.contains("\"8.8.8.8\""));
    }

    #[test]
    fn meta_data_contains_instance_id_and_hostname() {
        let input = CidataInput {
            instance_id: "vm-123",
            hostname: "web",
            root_password: None,
            dns: &[],
            nics: &[],
        };
        let rendered = meta_data(&input);
        assert!(rendered.contains("instance-id: vm-123"));
        assert!(rendered.contains("local-hostname: web"));
    }
}
