//! Shared data model (spec §3): the types every backend exchanges with the
//! hypervisor engine, independent of which image source produced them.

use serde::{Deserialize, Serialize};

/// One disk attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the backing file.
    pub path: String,
    /// Whether the hypervisor should mount this read-only.
    pub read_only: bool,
    /// Serial string used for in-guest device identification
    /// (`cocoon-layer<i>`, `cocoon-cow`, `cocoon-base`, ...).
    pub serial: String,
}

/// Either direct kernel+initrd boot or UEFI firmware boot. Exactly one
/// variant is ever populated for a given VM (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum BootConfig {
    /// Direct kernel boot: kernel + initrd supplied to the VMM, no firmware.
    Direct {
        /// Path to the kernel image.
        kernel_path: String,
        /// Path to the initrd image.
        initrd_path: String,
        /// Kernel command line.
        cmdline: String,
    },
    /// UEFI boot: the VMM boots via a firmware blob.
    Uefi {
        /// Path to the firmware blob.
        firmware_path: String,
    },
}

impl BootConfig {
    /// `true` for [`BootConfig::Direct`] — drives serial=Pty/console=Off
    /// vs. serial=Socket/console=Off choice in §4.6 step 4.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }
}

/// A single network the VM's NIC is attached to, resolved by the network
/// provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network id (matches the `NetworkRecord.network` the config was
    /// derived from).
    pub id: String,
    /// Network type (`"cni"` for the one backend this spec ships).
    pub r#type: String,
    /// Assigned IP address.
    pub ip: String,
    /// Gateway address.
    pub gateway: String,
    /// CIDR prefix length.
    pub prefix: u8,
    /// Optional hostname to embed in cidata / kernel cmdline.
    pub hostname: Option<String>,
}

/// One virtual NIC's configuration, as handed from the network provider
/// (C4) to the hypervisor backend (C5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Tap device name (`tap<i>`).
    pub tap: String,
    /// MAC address of the veth the guest must mirror (anti-spoofing).
    pub mac: String,
    /// Whether the device uses multiqueue.
    pub queue: bool,
    /// Queue size, when `queue` is set.
    pub queue_size: u16,
    /// The network this NIC is attached to, if any (absent for isolated
    /// NICs with no IP assignment).
    pub network: Option<NetworkAttachment>,
}

/// VM lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VmState {
    /// Placeholder record written, Phase B/C not yet complete.
    Creating,
    /// Disks prepared, full record committed.
    Created,
    /// Hypervisor process launched and socket-ready.
    Running,
    /// Cleanly stopped.
    Stopped,
    /// Stop or Start failed in a way that left the record in an
    /// indeterminate state; `stop` treats this identically to any other
    /// state (spec §9 open question).
    Error,
}

/// Per-VM configuration captured at `create` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// User-assigned unique name.
    pub name: String,
    /// Number of vCPUs.
    pub cpu: u32,
    /// Memory size in bytes.
    pub memory_bytes: u64,
    /// Root/COW storage size in bytes.
    pub storage_bytes: u64,
    /// The image reference this VM was created from.
    pub image: String,
}

/// The in-memory VM view returned by `list`/`inspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// Random 16-hex-char identifier (8 bytes of entropy).
    pub id: String,
    /// Current lifecycle state.
    pub state: VmState,
    /// Configuration captured at creation.
    pub config: VmConfig,
    /// Unix millis at creation.
    pub created_at: i64,
    /// Unix millis at last update.
    pub updated_at: i64,
    /// Unix millis when last started, if ever.
    pub started_at: Option<i64>,
    /// Unix millis when last stopped, if ever.
    pub stopped_at: Option<i64>,
    /// Discovered console path (Unix socket or PTY device), once running.
    pub console_path: Option<String>,
}

/// The persisted form of [`Vm`]: adds the fields GC and restart-recovery
/// need that aren't part of the user-facing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// User-facing VM view.
    #[serde(flatten)]
    pub vm: Vm,
    /// Disk attachments, in hypervisor attach order.
    pub storage_configs: Vec<StorageConfig>,
    /// NIC attachments, in hypervisor attach order.
    pub network_configs: Vec<NetworkConfig>,
    /// Boot mode, absent only during the brief `Creating` placeholder
    /// window before Phase B runs.
    pub boot_config: Option<BootConfig>,
    /// Digests of every blob this VM depends on, captured from the
    /// *original* storage/boot configs before COW transformation, so GC
    /// can pin them (I4).
    pub image_blob_ids: std::collections::BTreeSet<String>,
}

/// Cross-module GC snapshot contributed by the hypervisor backend under the
/// module name `"hypervisor"`. Image backends downcast to this during
/// `Resolve` to union `used_blob_ids` into their own keep set (spec §4.7:
/// "the image module pin blobs listed in the hypervisor snapshot's
/// UsedBlobIDs"); the network backend downcasts the same snapshot to union
/// `live_vm_ids` into its own, pruning `NetworkRecord`s for VMs that no
/// longer exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HypervisorSnapshot {
    /// Hex digests (no `sha256:` prefix) still referenced by some VM's
    /// `image_blob_ids`.
    pub used_blob_ids: std::collections::BTreeSet<String>,
    /// Every VM id currently present in the VMIndex.
    pub live_vm_ids: std::collections::BTreeSet<String>,
}

/// Generates a random 16-hex-char VM id (8 bytes of entropy, spec §3).
#[must_use]
pub fn new_vm_id() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Current time as Unix millis, the timestamp unit used throughout every
/// persisted record.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_id_is_sixteen_hex_chars() {
        let id = new_vm_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn boot_config_is_direct() {
        let direct = BootConfig::Direct {
            kernel_path: "k".into(),
            initrd_path: "i".into(),
            cmdline: "c".into(),
        };
        assert!(direct.is_direct());
        let uefi = BootConfig::Uefi {
            firmware_path: "f".into(),
        };
        assert!(!uefi.is_direct());
    }
}
