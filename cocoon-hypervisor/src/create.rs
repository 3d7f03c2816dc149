//! `Create` (spec §4.6: three-phase, rollback on failure).
//!
//! The caller has already resolved the image reference to a `(StorageConfig[],
//! BootConfig)` pair via whichever image backend the image ref names (OCI or
//! cloud image) — this crate never depends on those crates directly, only on
//! the resolved configs and the set of blob ids they're built from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cocoon_core::config::Config;
use cocoon_core::error::{Error, Result};
use cocoon_core::model::{BootConfig, NetworkConfig, StorageConfig, Vm, VmConfig, VmRecord, VmState, now_millis};
use cocoon_core::store::Store;
use tokio::process::Command;

use crate::index::VmIndex;

/// Everything [`create`] needs: the user's requested shape plus the
/// already-resolved image configuration (spec §4.6 Phase A: "captured from
/// the *original* storage/boot configs before COW transformation").
pub struct CreateRequest {
    /// Id this VM will be created under, pre-allocated by the caller via
    /// [`cocoon_core::model::new_vm_id`] so the network provider can name
    /// the VM's netns (`cocoon-<id>`) before Phase A runs (spec §4.5, §4.6
    /// Phase A).
    pub id: String,
    /// User-facing VM config (name, cpu, memory, storage size, image ref).
    pub vm_config: VmConfig,
    /// Read-only storage the image backend resolved (OCI layers, or the
    /// single cloud-image base disk), before this module's COW/overlay step.
    pub image_storage_configs: Vec<StorageConfig>,
    /// Boot mode the image backend resolved. [`BootConfig::is_direct`]
    /// discriminates the OCI path (mkfs.ext4 COW disk) from the cloud-image
    /// path (qcow2 overlay + cidata) inside Phase B.
    pub boot_config: BootConfig,
    /// NIC configs already allocated by the network provider.
    pub network_configs: Vec<NetworkConfig>,
    /// Digests of every blob this VM depends on (spec §3 `image_blob_ids`,
    /// I4) — captured before this module appends its own COW/overlay files,
    /// which are VM-local and never GC-pinned by id.
    pub image_blob_ids: BTreeSet<String>,
    /// Root password for the cidata `chpasswd` module, cloud-image VMs
    /// only (spec §6 `--root-password`).
    pub root_password: Option<String>,
    /// DNS servers for the cidata netplan config, cloud-image VMs only
    /// (spec §6 `--dns`).
    pub dns: Vec<String>,
}

/// `mkfs.ext4` flags for the COW root disk (spec §4.6 Phase B, OCI path):
/// no reserved blocks, lazy init for a fast format of a freshly truncated
/// sparse file.
const MKFS_EXT4_ARGS: &[&str] = &["-F", "-m", "0", "-E", "lazy_itable_init=1,lazy_journal_init=1,discard"];

/// Runs the three-phase Create sequence against `request`, persisting the
/// result into `store`/`index` and laying out `<config.vm_run_dir(id)>`.
pub async fn create(config: &Config, store: &Store<VmIndex>, request: CreateRequest) -> Result<Vm> {
    let id = reserve_placeholder(store, &request).await?;

    match prepare(config, &id, &request).await {
        Ok((storage_configs, boot_config)) => finalize(store, &id, storage_configs, boot_config).await,
        Err(error) => {
            rollback(config, store, &id).await;
            Err(error)
        }
    }
}

/// Phase A: under lock, claim the caller's pre-allocated id (spec §4.6
/// Phase A), reject duplicate names or an id collision, and write a
/// `Creating` placeholder record.
async fn reserve_placeholder(store: &Store<VmIndex>, request: &CreateRequest) -> Result<String> {
    store
        .update(|idx| {
            if idx.name_taken(&request.vm_config.name) {
                return Err(Error::Conflict(format!("name {:?} already in use", request.vm_config.name)));
            }
            if idx.vms.contains_key(&request.id) {
                return Err(Error::Conflict(format!("vm id {:?} already in use", request.id)));
            }

            let id = request.id.clone();
            let now = now_millis();
            let record = VmRecord {
                vm: Vm {
                    id: id.clone(),
                    state: VmState::Creating,
                    config: request.vm_config.clone(),
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    stopped_at: None,
                    console_path: None,
                },
                storage_configs: Vec::new(),
                network_configs: request.network_configs.clone(),
                boot_config: None,
                image_blob_ids: request.image_blob_ids.clone(),
            };
            idx.names.insert(request.vm_config.name.clone(), id.clone());
            idx.vms.insert(id.clone(), record);
            Ok(id)
        })
        .await
}

/// Phase B: no lock held. Creates the per-VM run/log directories and the
/// image-kind-specific disk(s), returning the final storage list and
/// (possibly rewritten) boot config for Phase C to commit.
async fn prepare(config: &Config, id: &str, request: &CreateRequest) -> Result<(Vec<StorageConfig>, BootConfig)> {
    let run_dir = config.vm_run_dir(id);
    let log_dir = config.vm_log_dir(id);
    tokio::fs::create_dir_all(&run_dir).await?;
    tokio::fs::create_dir_all(&log_dir).await?;

    if request.boot_config.is_direct() {
        prepare_oci(&run_dir, request).await
    } else {
        prepare_cloudimg(id, &run_dir, request).await
    }
}

/// OCI path: truncate+format a writable ext4 COW disk, append it to the
/// read-only layer stack, and rewrite the kernel cmdline to describe the
/// overlay boot (spec §4.6 Phase B).
async fn prepare_oci(run_dir: &Path, request: &CreateRequest) -> Result<(Vec<StorageConfig>, BootConfig)> {
    let BootConfig::Direct { kernel_path, initrd_path, .. } = &request.boot_config else {
        return Err(Error::Validation("OCI boot path requires a direct kernel boot config".to_owned()));
    };

    let cow_path = run_dir.join("cow.raw");
    make_sparse_ext4(&cow_path, request.vm_config.storage_bytes).await?;

    let mut storage_configs = request.image_storage_configs.clone();
    storage_configs.push(StorageConfig {
        path: cow_path.display().to_string(),
        read_only: false,
        serial: "cocoon-cow".to_owned(),
    });

    let layer_serials: Vec<&str> = request.image_storage_configs.iter().rev().map(|s| s.serial.as_str()).collect();
    let mut cmdline = format!(
        "console=hvc0 loglevel=3 boot=cocoon-overlay cocoon.layers={} cocoon.cow=cocoon-cow clocksource=kvm-clock rw",
        layer_serials.join(",")
    );
    if !request.network_configs.is_empty() {
        cmdline.push_str(" net.ifnames=0");
        for (i, nic) in request.network_configs.iter().enumerate() {
            if let Some(attachment) = &nic.network {
                let hostname = attachment.hostname.as_deref().unwrap_or("");
                let mask = prefix_to_netmask(attachment.prefix);
                cmdline.push_str(&format!(" ip={}::{}:{}:{}:eth{i}:off", attachment.ip, attachment.gateway, mask, hostname));
            }
        }
    }

    let boot_config = BootConfig::Direct {
        kernel_path: kernel_path.clone(),
        initrd_path: initrd_path.clone(),
        cmdline,
    };
    Ok((storage_configs, boot_config))
}

/// Cloud-image path: clone a qcow2 overlay off the base image, resize it to
/// the requested storage size, and render a cloud-init `cidata` disk.
async fn prepare_cloudimg(id: &str, run_dir: &Path, request: &CreateRequest) -> Result<(Vec<StorageConfig>, BootConfig)> {
    let base = request
        .image_storage_configs
        .first()
        .ok_or_else(|| Error::Validation("cloud-image boot requires exactly one base disk".to_owned()))?;

    let overlay_path = run_dir.join("overlay.qcow2");
    create_qcow2_overlay(Path::new(&base.path), &overlay_path).await?;
    if request.vm_config.storage_bytes > 0 {
        resize_qcow2(&overlay_path, request.vm_config.storage_bytes).await?;
    }

    let cidata_path = run_dir.join("cidata.img");
    crate::cidata::write(
        &cidata_path,
        &crate::cidata::CidataInput {
            instance_id: id,
            hostname: &request.vm_config.name,
            root_password: request.root_password.as_deref(),
            dns: &request.dns,
            nics: &request.network_configs,
        },
    )?;

    let storage_configs = vec![
        StorageConfig {
            path: overlay_path.display().to_string(),
            read_only: false,
            serial: "cocoon-base".to_owned(),
        },
        StorageConfig {
            path: cidata_path.display().to_string(),
            read_only: true,
            serial: "cocoon-cidata".to_owned(),
        },
    ];
    Ok((storage_configs, request.boot_config.clone()))
}

/// Phase C: under lock, replace the placeholder with the full record.
async fn finalize(store: &Store<VmIndex>, id: &str, storage_configs: Vec<StorageConfig>, boot_config: BootConfig) -> Result<Vm> {
    store
        .update(|idx| {
            let record = idx.vms.get_mut(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            record.storage_configs = storage_configs;
            record.boot_config = Some(boot_config);
            record.vm.state = VmState::Created;
            record.vm.updated_at = now_millis();
            Ok(record.vm.clone())
        })
        .await
}

/// Best-effort cleanup after any Phase B/C failure: remove the per-VM
/// directories and reverse the index updates made in Phase A.
async fn rollback(config: &Config, store: &Store<VmIndex>, id: &str) {
    let _ = tokio::fs::remove_dir_all(config.vm_run_dir(id)).await;
    let _ = tokio::fs::remove_dir_all(config.vm_log_dir(id)).await;
    let _ = store
        .update(|idx| {
            if let Some(record) = idx.vms.remove(id) {
                idx.names.remove(&record.vm.config.name);
            }
            Ok(())
        })
        .await;
}

async fn make_sparse_ext4(path: &Path, size_bytes: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new().create(true).truncate(true).write(true).open(path).await?;
    file.set_len(size_bytes).await?;
    drop(file);

    let status = Command::new("mkfs.ext4")
        .args(MKFS_EXT4_ARGS)
        .arg(path)
        .status()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "mkfs.ext4".to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(Error::Subprocess {
            bin: "mkfs.ext4".to_owned(),
            detail: format!("exit status {status}"),
        });
    }
    Ok(())
}

async fn create_qcow2_overlay(base: &Path, overlay: &Path) -> Result<()> {
    let status = Command::new("qemu-img")
        .arg("create")
        .arg("-f")
        .arg("qcow2")
        .arg("-F")
        .arg("qcow2")
        .arg("-b")
        .arg(base)
        .arg(overlay)
        .status()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: format!("create -b {}: exit status {status}", base.display()),
        });
    }
    Ok(())
}

async fn resize_qcow2(path: &Path, size_bytes: u64) -> Result<()> {
    let status = Command::new("qemu-img")
        .arg("resize")
        .arg(path)
        .arg(size_bytes.to_string())
        .status()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: format!("resize: exit status {status}"),
        });
    }
    Ok(())
}

/// Converts a CIDR prefix length to a dotted-quad netmask, for the kernel
/// `ip=` boot parameter's `<mask>` field (spec §4.6 Phase B, OCI path).
fn prefix_to_netmask(prefix: u8) -> String {
    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
    format!("{}.{}.{}.{}", (mask >> 24) & 0xff, (mask >> 16) & 0xff, (mask >> 8) & 0xff, mask & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_to_netmask_matches_common_cidrs() {
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(16), "255.255.0.0");
        assert_eq!(prefix_to_netmask(32), "255.255.255.255");
        assert_eq!(prefix_to_netmask(0), "0.0.0.0");
    }

    fn direct_request(names_taken: &[&str]) -> CreateRequest {
        let _ = names_taken;
        CreateRequest {
            id: cocoon_core::model::new_vm_id(),
            vm_config: VmConfig {
                name: "web".to_owned(),
                cpu: 1,
                memory_bytes: 1 << 30,
                storage_bytes: 1 << 30,
                image: "ubuntu:24.04".to_owned(),
            },
            image_storage_configs: vec![StorageConfig {
                path: "/var/lib/cocoon/oci/blobs/abc.erofs".to_owned(),
                read_only: true,
                serial: "cocoon-layer0".to_owned(),
            }],
            boot_config: BootConfig::Direct {
                kernel_path: "/boot/vmlinuz".to_owned(),
                initrd_path: "/boot/initrd.img".to_owned(),
                cmdline: "console=ttyS0 reboot=k panic=1 rootfstype=erofs".to_owned(),
            },
            network_configs: Vec::new(),
            image_blob_ids: BTreeSet::from(["abc".to_owned()]),
            root_password: None,
            dns: Vec::new(),
        }
    }

    #[tokio::test]
    async fn reserve_placeholder_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<VmIndex> = Store::open(dir.path().join("vms.json"), dir.path().join("vms.lock"));
        let id = reserve_placeholder(&store, &direct_request(&[])).await.unwrap();
        assert!(!id.is_empty());

        let err = reserve_placeholder(&store, &direct_request(&[])).await;
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn rollback_removes_placeholder_and_name_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<VmIndex> = Store::open(dir.path().join("vms.json"), dir.path().join("vms.lock"));
        let request = direct_request(&[]);
        let id = reserve_placeholder(&store, &request).await.unwrap();

        let mut config = Config::default();
        config.run_dir = dir.path().join("run");
        config.log_dir = dir.path().join("log");
        rollback(&config, &store, &id).await;

        let taken = store.with(|idx| idx.name_taken("web")).await.unwrap();
        assert!(!taken);
    }
}
