//! Per-layer conversion: tar stream → content-addressed EROFS file, plus
//! boot-file discovery (spec §4.3 step 3).
//!
//! The spec calls for tee-ing the tar stream into a boot-file scanner and
//! an `mkfs.erofs` subprocess simultaneously. This implementation streams
//! the layer to a temp file once (the download itself, via
//! [`oci_client::Client::pull_blob`], already only reads it once from the
//! network) and then drives both consumers from that file independently —
//! functionally identical to a tee (both consumers see the complete
//! stream, and mkfs never blocks on the scanner) without needing a
//! same-process pipe-tee abstraction.

use std::path::{Path, PathBuf};

use cocoon_core::{Error, Result};
use tokio::process::Command;

/// Basenames this scanner treats as a kernel image (spec §4.3 step 3: "any
/// regular-file entry whose basename starts with `vmlinuz`").
const KERNEL_PREFIX: &str = "vmlinuz";
/// Basenames this scanner treats as an initrd image.
const INITRD_PREFIX: &str = "initrd.img";

/// Paths discovered by the boot-file scanner for one layer.
#[derive(Debug, Default, Clone)]
pub struct BootFiles {
    /// Absolute path to the extracted kernel, if this layer has one.
    pub kernel: Option<PathBuf>,
    /// Absolute path to the extracted initrd, if this layer has one.
    pub initrd: Option<PathBuf>,
}

/// Converts the uncompressed tar stream at `tar_path` into a content-
/// addressed EROFS file at `dest`, via `mkfs.erofs --tar=f` reading from
/// stdin.
pub async fn convert_to_erofs(tar_path: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let uuid = uuid::Uuid::new_v4();
    let stdin = tokio::fs::File::open(tar_path).await?.into_std().await;

    let status = Command::new("mkfs.erofs")
        .arg("--tar=f")
        .arg("-zlz4hc")
        .arg("-C16384")
        .arg("-T0")
        .arg("-U")
        .arg(uuid.to_string())
        .arg(dest)
        .stdin(std::process::Stdio::from(stdin))
        .status()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "mkfs.erofs".to_owned(),
            detail: e.to_string(),
        })?;

    if !status.success() {
        return Err(Error::Subprocess {
            bin: "mkfs.erofs".to_owned(),
            detail: format!("exit status {status}"),
        });
    }
    Ok(())
}

/// Scans an uncompressed tar stream for boot files (kernel/initrd) and
/// extracts any it finds into `work_dir`. Matches entries under `boot/` or
/// at the archive root whose basename starts with `vmlinuz`/`initrd.img`
/// and is not a `.old` variant (spec §4.3 step 3).
pub fn scan_boot_files(tar_path: &Path, work_dir: &Path) -> Result<BootFiles> {
    std::fs::create_dir_all(work_dir)?;
    let file = std::fs::File::open(tar_path)?;
    let mut archive = tar::Archive::new(file);
    let mut found = BootFiles::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if basename.ends_with(".old") {
            continue;
        }
        let under_boot_or_root = path
            .components()
            .next()
            .is_some_and(|c| c.as_os_str() == "boot")
            || path.components().count() == 1;
        if !under_boot_or_root {
            continue;
        }

        // Destination name is canonical, not the archive basename: the
        // committed path is always `<boot_dir>/<hex>/{vmlinuz,initrd.img}`
        // so it can be derived from the digest alone.
        let kind = if basename.starts_with(KERNEL_PREFIX) {
            Some((&mut found.kernel, "vmlinuz"))
        } else if basename.starts_with(INITRD_PREFIX) {
            Some((&mut found.initrd, "initrd.img"))
        } else {
            None
        };
        if let Some((slot, canonical_name)) = kind {
            let dest = work_dir.join(canonical_name);
            entry.unpack(&dest)?;
            *slot = Some(dest);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn scan_finds_kernel_and_initrd_under_boot() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("layer.tar");
        std::fs::write(
            &tar_path,
            make_tar(&[
                ("boot/vmlinuz-6.1", b"kernel-bytes"),
                ("boot/initrd.img-6.1", b"initrd-bytes"),
                ("boot/vmlinuz-6.1.old", b"stale"),
                ("etc/hostname", b"irrelevant"),
            ]),
        )
        .unwrap();

        let work = dir.path().join("work");
        let found = scan_boot_files(&tar_path, &work).unwrap();
        assert!(found.kernel.is_some());
        assert!(found.initrd.is_some());
        assert_eq!(
            std::fs::read(found.kernel.unwrap()).unwrap(),
            b"kernel-bytes"
        );
    }

    #[test]
    fn scan_ignores_files_outside_boot_or_root() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("layer.tar");
        std::fs::write(
            &tar_path,
            make_tar(&[("usr/lib/vmlinuz-fake", b"not a real boot file")]),
        )
        .unwrap();

        let work = dir.path().join("work");
        let found = scan_boot_files(&tar_path, &work).unwrap();
        assert!(found.kernel.is_none());
    }
}
