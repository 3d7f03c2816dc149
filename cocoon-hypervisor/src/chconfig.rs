//! Builds the `cloud-hypervisor` CLI invocation from a VM's resolved
//! configuration (spec §4.6 Start step 4).

use std::path::Path;

use cocoon_core::model::{BootConfig, NetworkConfig, StorageConfig, VmConfig};

/// Path consulted to decide whether to request hugepage-backed memory.
const HUGEPAGES_SYSCTL: &str = "/proc/sys/vm/nr_hugepages";
/// Memory floor below which the balloon device is skipped entirely.
const BALLOON_MIN_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Builds the full `cloud-hypervisor` argument vector for one VM launch.
/// `console_socket` is `Some` only for UEFI boot, where the console is a
/// pre-created Unix socket rather than a PTY discovered after boot.
#[must_use]
pub fn build_args(
    vm_config: &VmConfig,
    storage_configs: &[StorageConfig],
    network_configs: &[NetworkConfig],
    boot_config: &BootConfig,
    api_socket: &Path,
    console_socket: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();

    let max_cpus = vm_config.cpu.max(host_num_cpus());
    args.push("--cpus".to_owned());
    args.push(format!("boot={},max={max_cpus}", vm_config.cpu));

    args.push("--memory".to_owned());
    args.push(memory_arg(vm_config.memory_bytes));

    args.push("--rng".to_owned());
    args.push("src=/dev/urandom".to_owned());

    args.push("--watchdog".to_owned());

    if let Some(balloon) = balloon_arg(vm_config.memory_bytes) {
        args.push("--balloon".to_owned());
        args.push(balloon);
    }

    for storage in storage_configs {
        args.push("--disk".to_owned());
        args.push(disk_arg(storage));
    }

    for network in network_configs {
        args.push("--net".to_owned());
        args.push(net_arg(network));
    }

    match boot_config {
        BootConfig::Direct {
            kernel_path,
            initrd_path,
            cmdline,
        } => {
            args.push("--kernel".to_owned());
            args.push(kernel_path.clone());
            args.push("--initramfs".to_owned());
            args.push(initrd_path.clone());
            args.push("--cmdline".to_owned());
            args.push(cmdline.clone());
            args.push("--serial".to_owned());
            args.push("off".to_owned());
            args.push("--console".to_owned());
            args.push("pty".to_owned());
        }
        BootConfig::Uefi { firmware_path } => {
            args.push("--firmware".to_owned());
            args.push(firmware_path.clone());
            let socket = console_socket.expect("UEFI boot always supplies a pre-created console socket");
            args.push("--serial".to_owned());
            args.push(format!("socket={}", socket.display()));
            args.push("--console".to_owned());
            args.push("off".to_owned());
        }
    }

    args.push("--api-socket".to_owned());
    args.push(api_socket.display().to_string());

    args
}

/// Host logical CPU count, the floor `--cpus max=` is raised to so a VM
/// created with few vCPUs can still be hot-plugged up to the host's limit.
fn host_num_cpus() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(1)
}

fn memory_arg(memory_bytes: u64) -> String {
    if hugepages_enabled() {
        format!("size={memory_bytes},hugepages=on")
    } else {
        format!("size={memory_bytes}")
    }
}

/// `true` when the host has any hugepages reserved
/// (`/proc/sys/vm/nr_hugepages > 0`); unreadable or non-numeric content is
/// treated as `0`.
fn hugepages_enabled() -> bool {
    std::fs::read_to_string(HUGEPAGES_SYSCTL)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .is_some_and(|n| n > 0)
}

fn balloon_arg(memory_bytes: u64) -> Option<String> {
    if memory_bytes < BALLOON_MIN_MEMORY_BYTES {
        return None;
    }
    let size = memory_bytes / 4;
    Some(format!("size={size},deflate_on_oom=on,free_page_reporting=on"))
}

fn disk_arg(storage: &StorageConfig) -> String {
    let mut parts = vec![format!("path={}", storage.path)];
    if storage.read_only {
        parts.push("readonly=on".to_owned());
    } else if storage.path.ends_with(".qcow2") {
        parts.push("readonly=off".to_owned());
        parts.push("backing_files=on".to_owned());
    } else {
        parts.push("readonly=off".to_owned());
        parts.push("direct=on".to_owned());
        parts.push("sparse=on".to_owned());
    }
    parts.join(",")
}

fn net_arg(network: &NetworkConfig) -> String {
    let mut parts = vec![format!("tap={}", network.tap), format!("mac={}", network.mac)];
    if network.queue {
        parts.push(format!("num_queues={}", network.queue_size.max(2)));
        parts.push(format!("queue_size={}", network.queue_size));
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn direct_boot() -> BootConfig {
        BootConfig::Direct {
            kernel_path: "/vmlinuz".to_owned(),
            initrd_path: "/initrd".to_owned(),
            cmdline: "console=hvc0".to_owned(),
        }
    }

    fn vm_config() -> VmConfig {
        VmConfig {
            name: "web".to_owned(),
            cpu: 2,
            memory_bytes: 1 << 30,
            storage_bytes: 10 << 30,
            image: "ubuntu:24.04".to_owned(),
        }
    }

    #[test]
    fn direct_boot_uses_pty_console_and_no_serial() {
        let args = build_args(&vm_config(), &[], &[], &direct_boot(), &PathBuf::from("/run/api.sock"), None);
        assert!(args.windows(2).any(|w| w == ["--console".to_owned(), "pty".to_owned()]));
        assert!(args.windows(2).any(|w| w == ["--serial".to_owned(), "off".to_owned()]));
    }

    #[test]
    fn uefi_boot_uses_console_socket() {
        let boot = BootConfig::Uefi {
            firmware_path: "/fw.fd".to_owned(),
        };
        let console = PathBuf::from("/run/console.sock");
        let args = build_args(&vm_config(), &[], &[], &boot, &PathBuf::from("/run/api.sock"), Some(&console));
        assert!(args.iter().any(|a| a == "socket=/run/console.sock"));
        assert!(args.windows(2).any(|w| w == ["--console".to_owned(), "off".to_owned()]));
    }

    #[test]
    fn balloon_is_skipped_below_256mib() {
        assert!(balloon_arg(128 * 1024 * 1024).is_none());
        assert!(balloon_arg(256 * 1024 * 1024).is_some());
    }

    #[test]
    fn writable_qcow2_gets_backing_files_flag() {
        let storage = StorageConfig {
            path: "/run/overlay.qcow2".to_owned(),
            read_only: false,
            serial: "cocoon-base".to_owned(),
        };
        assert_eq!(disk_arg(&storage), "path=/run/overlay.qcow2,readonly=off,backing_files=on");
    }

    #[test]
    fn writable_raw_gets_direct_and_sparse_flags() {
        let storage = StorageConfig {
            path: "/run/cow.raw".to_owned(),
            read_only: false,
            serial: "cocoon-cow".to_owned(),
        };
        assert_eq!(disk_arg(&storage), "path=/run/cow.raw,readonly=off,direct=on,sparse=on");
    }
}
