//! `image pull/list/inspect/rm` — dispatches each reference to the OCI or
//! cloud-image backend by ref shape (spec §9 "Polymorphism": image backends
//! are dispatched from the CLI layer, not from inside `cocoon-hypervisor`).

use anyhow::Result;
use cocoon_core::config::Config;
use cocoon_core::error::join_errors;
use oci_client::secrets::RegistryAuth;

use crate::{ImageAction, OutputFormat};

/// `true` if `r#ref` names a cloud image (an HTTP(S) URL) rather than an
/// OCI registry reference.
pub(crate) fn is_cloudimg_ref(r#ref: &str) -> bool {
    r#ref.starts_with("http://") || r#ref.starts_with("https://")
}

pub(crate) fn open_oci(config: &Config) -> cocoon_oci::OciBackend {
    cocoon_oci::OciBackend::open(config.oci_dir(), config.oci_dir().join("images.lock"), RegistryAuth::Anonymous)
}

pub(crate) fn open_cloudimg(config: &Config) -> cocoon_cloudimg::CloudimgBackend {
    cocoon_cloudimg::CloudimgBackend::open(config.cloudimg_dir(), config.cloudimg_dir().join("images.lock"), config.firmware_path())
}

pub async fn dispatch(config: &Config, action: ImageAction) -> Result<()> {
    match action {
        ImageAction::Pull { refs } => pull(config, &refs).await,
        ImageAction::List { format } => list(config, format).await,
        ImageAction::Inspect { r#ref } => inspect(config, &r#ref).await,
        ImageAction::Rm { refs } => rm(config, &refs).await,
    }
}

async fn pull(config: &Config, refs: &[String]) -> Result<()> {
    let oci = open_oci(config);
    let cloudimg = open_cloudimg(config);
    let on_status = |msg: &str| eprintln!("{msg}");

    let mut failures = Vec::new();
    for r#ref in refs {
        let result = if is_cloudimg_ref(r#ref) {
            cloudimg.pull(r#ref, &on_status).await.map(|e| e.r#ref)
        } else {
            oci.pull(r#ref, &on_status).await.map(|e| e.r#ref)
        };
        match result {
            Ok(resolved) => println!("{resolved}"),
            Err(error) => {
                tracing::warn!(%error, r#ref, "pull failed");
                failures.push((r#ref.clone(), error));
            }
        }
    }

    join_errors(failures).map_or(Ok(()), Err)?;
    Ok(())
}

async fn list(config: &Config, format: OutputFormat) -> Result<()> {
    let oci_images = open_oci(config).list().await?;
    let cloudimg_images = open_cloudimg(config).list().await?;

    if matches!(format, OutputFormat::Json) {
        let value = serde_json::json!({ "oci": oci_images, "cloudimg": cloudimg_images });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if oci_images.is_empty() && cloudimg_images.is_empty() {
        println!("No images.");
        return Ok(());
    }
    println!("{:<12} {:<50} {:<20}", "KIND", "REFERENCE", "DIGEST");
    for entry in &oci_images {
        let digest = &entry.manifest_digest[..entry.manifest_digest.len().min(19)];
        println!("{:<12} {:<50} {:<20}", "oci", entry.r#ref, digest);
    }
    for entry in &cloudimg_images {
        let digest = entry.content_sum.trim_start_matches("sha256:");
        println!("{:<12} {:<50} {:<20}", "cloudimg", entry.r#ref, &digest[..digest.len().min(19)]);
    }
    Ok(())
}

async fn inspect(config: &Config, r#ref: &str) -> Result<()> {
    if is_cloudimg_ref(r#ref) {
        let entry = open_cloudimg(config).inspect(r#ref).await?;
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        let entry = open_oci(config).inspect(r#ref).await?;
        println!("{}", serde_json::to_string_pretty(&entry)?);
    }
    Ok(())
}

async fn rm(config: &Config, refs: &[String]) -> Result<()> {
    let oci = open_oci(config);
    let cloudimg = open_cloudimg(config);

    let oci_refs: Vec<String> = refs.iter().filter(|r| !is_cloudimg_ref(r)).cloned().collect();
    let cloudimg_refs: Vec<String> = refs.iter().filter(|r| is_cloudimg_ref(r)).cloned().collect();

    let mut removed = Vec::new();
    if !oci_refs.is_empty() {
        removed.extend(oci.delete(&oci_refs).await?);
    }
    if !cloudimg_refs.is_empty() {
        removed.extend(cloudimg.delete(&cloudimg_refs).await?);
    }
    for r#ref in &removed {
        eprintln!("Removed: {ref}");
    }
    Ok(())
}
