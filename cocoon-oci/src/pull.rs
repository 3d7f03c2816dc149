//! The `Pull` pipeline (spec §4.3 steps 1-6).

use std::path::Path;
use std::sync::Arc;

use cocoon_core::error::{Error, Result};
use cocoon_core::model::now_millis;
use oci_client::{Client, Reference};
use tokio::sync::Semaphore;

use crate::OciBackend;
use crate::index::{ImageEntry, LayerBootFiles};
use crate::layer::{self, BootFiles};

/// What one layer-processing task learned, fed back into the commit step.
/// Paths here are staging paths under `blobsDir`/`bootDir` (`.tmp-*`) —
/// nothing is visible under its final content-addressed name until commit
/// renames it in.
struct LayerOutcome {
    hex: String,
    boot: BootFiles,
    staged_erofs: Option<std::path::PathBuf>,
}

/// Runs the full pull pipeline for `image_ref`. Callers should go through
/// [`OciBackend::pull`], which wraps this in the per-ref single-flight.
pub(crate) async fn run(
    backend: &OciBackend,
    image_ref: &str,
    on_status: &(dyn Fn(&str) + Sync),
) -> Result<ImageEntry> {
    let reference: Reference = image_ref
        .parse()
        .map_err(|e: oci_client::ParseError| {
            Error::Validation(format!("invalid image reference {image_ref}: {e}"))
        })?;
    let ref_str = reference.to_string();

    on_status(&format!("pulling {ref_str}"));
    let (manifest, manifest_digest, _config_json) = backend
        .client
        .pull_manifest_and_config(&reference, &backend.auth)
        .await
        .map_err(Error::transient)?;

    // Step 2: idempotency check.
    if let Some(entry) = backend.store.with(|idx| idx.resolve(&ref_str).cloned()).await?
        && entry.manifest_digest == manifest_digest
        && backend.layers_present(&entry)
    {
        on_status("already present");
        return Ok(entry);
    }

    on_status(&format!("{} layer(s)", manifest.layers.len()));

    let blobs_dir = backend.blobs_dir();
    let boot_dir = backend.boot_dir();
    tokio::fs::create_dir_all(&blobs_dir).await?;
    tokio::fs::create_dir_all(&boot_dir).await?;

    let concurrency = num_cpus::get().max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = Vec::with_capacity(manifest.layers.len());

    for layer_desc in manifest.layers.clone() {
        let hex = hex_of(&layer_desc.digest);
        let erofs_path = backend.erofs_path(&hex);
        let erofs_cached = is_nonempty_file(&erofs_path);
        let layer_boot_dir = boot_dir.join(&hex);
        let boot_known = backend
            .store
            .with({
                let hex = hex.clone();
                move |idx| idx.layer_boot.contains_key(&hex)
            })
            .await?;
        let has_boot_evidence = layer_boot_dir.exists()
            || backend
                .store
                .with({
                    let hex = hex.clone();
                    move |idx| idx.layer_boot.get(&hex).is_some_and(|b| !b.is_none())
                })
                .await?;
        let boot_complete =
            layer_boot_dir.join("vmlinuz").is_file() || layer_boot_dir.join("initrd.img").is_file();

        if erofs_cached && boot_known && (!has_boot_evidence || boot_complete) {
            // Step 3 fast path: nothing new to learn about this layer.
            on_status(&format!("layer {hex} cached"));
            continue;
        }

        let client = backend.client.clone();
        let reference = reference.clone();
        let sem = Arc::clone(&semaphore);
        let blobs_dir = blobs_dir.clone();
        let boot_dir = boot_dir.clone();
        let need_erofs = !erofs_cached;
        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.map_err(|_| Error::Canceled)?;
            process_layer(&client, &reference, &layer_desc, &blobs_dir, &boot_dir, need_erofs).await
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        let outcome = task
            .await
            .map_err(|e| Error::Subprocess {
                bin: "layer worker".to_owned(),
                detail: e.to_string(),
            })??;
        outcomes.push(outcome);
    }

    // Step 5: post-pass heal. If nothing in this pull run (or the
    // already-cached layers) located a kernel/initrd, rescan every layer
    // sequentially as a last resort.
    let any_boot_found = outcomes.iter().any(|o| o.boot.kernel.is_some() || o.boot.initrd.is_some())
        || backend
            .store
            .with({
                let hexes: Vec<String> = manifest.layers.iter().map(|l| hex_of(&l.digest)).collect();
                move |idx| hexes.iter().any(|h| idx.layer_boot.get(h).is_some_and(|b| !b.is_none()))
            })
            .await?;

    if !any_boot_found {
        on_status("no boot files found, rescanning layers");
        for layer_desc in &manifest.layers {
            let hex = hex_of(&layer_desc.digest);
            let boot = rescan_layer_boot(&backend.client, &reference, layer_desc, &boot_dir, &hex).await?;
            if boot.kernel.is_some() || boot.initrd.is_some() {
                outcomes.push(LayerOutcome {
                    hex,
                    boot,
                    staged_erofs: None,
                });
            }
        }
    }

    // Step 6: commit under the store lock, re-validating every destination.
    let layers: Vec<String> = manifest.layers.iter().map(|l| hex_of(&l.digest)).collect();
    backend
        .store
        .update(move |idx| {
            for outcome in &outcomes {
                commit_layer_outcome(outcome, &blobs_dir, &boot_dir, idx)?;
            }

            for hex in &layers {
                let erofs = blobs_dir.join(format!("{hex}.erofs"));
                if !is_nonempty_file(&erofs) {
                    return Err(Error::Subprocess {
                        bin: "mkfs.erofs".to_owned(),
                        detail: format!("missing or empty output for layer {hex}"),
                    });
                }
            }

            let mut kernel_layer = None;
            let mut initrd_layer = None;
            for hex in &layers {
                let boot = idx.layer_boot.get(hex).copied().unwrap_or_default();
                if boot.kernel {
                    kernel_layer = Some(hex.clone());
                }
                if boot.initrd {
                    initrd_layer = Some(hex.clone());
                }
            }

            let entry = ImageEntry {
                r#ref: ref_str.clone(),
                manifest_digest: manifest_digest.clone(),
                layers: layers.clone(),
                kernel_layer,
                initrd_layer,
                created_at: now_millis(),
            };
            idx.images.insert(ref_str.clone(), entry.clone());
            Ok(entry)
        })
        .await
        .inspect(|_| on_status("done"))
}

/// Renames a layer task's staging outputs into their final content-
/// addressed locations and records what was learned about its boot files.
/// Idempotent: if the final path already exists (another pull committed
/// it first), the staging copy is simply discarded.
fn commit_layer_outcome(
    outcome: &LayerOutcome,
    blobs_dir: &Path,
    boot_dir: &Path,
    idx: &mut crate::index::ImageIndex,
) -> Result<()> {
    if let Some(staged) = &outcome.staged_erofs {
        let final_path = blobs_dir.join(format!("{}.erofs", outcome.hex));
        if final_path.exists() {
            let _ = std::fs::remove_file(staged);
        } else {
            std::fs::rename(staged, &final_path)?;
        }
    }

    let mut learned = LayerBootFiles::default();
    if let Some(staged) = &outcome.boot.kernel {
        let final_dir = boot_dir.join(&outcome.hex);
        std::fs::create_dir_all(&final_dir)?;
        let final_file = final_dir.join("vmlinuz");
        if !final_file.exists() {
            std::fs::rename(staged, &final_file)?;
        }
        learned.kernel = true;
    }
    if let Some(staged) = &outcome.boot.initrd {
        let final_dir = boot_dir.join(&outcome.hex);
        std::fs::create_dir_all(&final_dir)?;
        let final_file = final_dir.join("initrd.img");
        if !final_file.exists() {
            std::fs::rename(staged, &final_file)?;
        }
        learned.initrd = true;
    }

    let entry = idx.layer_boot.entry(outcome.hex.clone()).or_default();
    entry.kernel |= learned.kernel;
    entry.initrd |= learned.initrd;
    Ok(())
}

/// Downloads one layer (if not already a valid cached erofs file), converts
/// it, and scans it for boot files. Runs inside a bounded-concurrency task.
/// Output lands under staging names (`.tmp-<hex>-<uuid>[.erofs]`) inside
/// `blobs_dir`/`boot_dir`; the caller commits them under lock.
async fn process_layer(
    client: &Client,
    reference: &Reference,
    layer_desc: &oci_client::manifest::OciDescriptor,
    blobs_dir: &Path,
    boot_dir: &Path,
    need_erofs: bool,
) -> Result<LayerOutcome> {
    let hex = hex_of(&layer_desc.digest);
    let uuid = uuid::Uuid::new_v4();

    let tar_tmp = tempfile::tempdir()?;
    let tar_path = tar_tmp.path().join("layer.tar");
    {
        let mut file = tokio::fs::File::create(&tar_path).await?;
        client
            .pull_blob(reference, layer_desc, &mut file)
            .await
            .map_err(Error::transient)?;
        file.sync_all().await?;
    }

    let staged_erofs = if need_erofs {
        let staging = blobs_dir.join(format!(".tmp-{hex}-{uuid}.erofs"));
        layer::convert_to_erofs(&tar_path, &staging).await?;
        Some(staging)
    } else {
        None
    };

    let staging_boot_dir = boot_dir.join(format!(".tmp-{hex}-{uuid}"));
    let boot = scan_boot_blocking(tar_path, staging_boot_dir.clone()).await?;
    if boot.kernel.is_none() && boot.initrd.is_none() {
        let _ = std::fs::remove_dir_all(&staging_boot_dir);
    }

    Ok(LayerOutcome {
        hex,
        boot,
        staged_erofs,
    })
}

/// Re-downloads and scans a single layer purely for boot files (spec §4.3
/// step 5: post-pass heal), since by this point its erofs file is already
/// either cached or committed from the main pass.
async fn rescan_layer_boot(
    client: &Client,
    reference: &Reference,
    layer_desc: &oci_client::manifest::OciDescriptor,
    boot_dir: &Path,
    hex: &str,
) -> Result<BootFiles> {
    let tar_tmp = tempfile::tempdir()?;
    let tar_path = tar_tmp.path().join("layer.tar");
    {
        let mut file = tokio::fs::File::create(&tar_path).await?;
        client
            .pull_blob(reference, layer_desc, &mut file)
            .await
            .map_err(Error::transient)?;
    }
    let staging_boot_dir = boot_dir.join(format!(".tmp-{hex}-{}", uuid::Uuid::new_v4()));
    let boot = scan_boot_blocking(tar_path, staging_boot_dir.clone()).await?;
    if boot.kernel.is_none() && boot.initrd.is_none() {
        let _ = std::fs::remove_dir_all(&staging_boot_dir);
    }
    Ok(boot)
}

async fn scan_boot_blocking(tar_path: std::path::PathBuf, work_dir: std::path::PathBuf) -> Result<BootFiles> {
    tokio::task::spawn_blocking(move || layer::scan_boot_files(&tar_path, &work_dir))
        .await
        .map_err(|e| Error::Subprocess {
            bin: "boot scan".to_owned(),
            detail: e.to_string(),
        })?
}

fn hex_of(digest: &str) -> String {
    digest.trim_start_matches("sha256:").to_owned()
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}
