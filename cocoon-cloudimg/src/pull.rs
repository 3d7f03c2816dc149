//! The cloud-image `Pull` pipeline (spec §4.4 steps 1-5).

use cocoon_core::error::Result;
use cocoon_core::model::now_millis;

use crate::CloudimgBackend;
use crate::convert;
use crate::index::ImageEntry;

pub(crate) async fn run(backend: &CloudimgBackend, url: &str, on_status: &(dyn Fn(&str) + Sync)) -> Result<ImageEntry> {
    // Step 1: idempotency check.
    if let Some(entry) = backend.store.with(|idx| idx.resolve(url).cloned()).await?
        && backend.blob_present(&entry)
    {
        on_status("already present");
        return Ok(entry);
    }

    let temp_dir = backend.temp_dir();
    tokio::fs::create_dir_all(&temp_dir).await?;
    let uuid = uuid::Uuid::new_v4();
    let download_path = temp_dir.join(format!(".tmp-download-{uuid}"));

    on_status(&format!("downloading {url}"));
    let url_owned = url.to_owned();
    let (content_sum, size) = convert::download(url, download_path.clone(), move |bytes| {
        tracing::debug!(url = %url_owned, bytes, "cloudimg: download progress");
    })
    .await?;

    on_status("detecting source format");
    let source_format = convert::detect_format(&download_path).await?;

    let converted_path = temp_dir.join(format!(".tmp-qcow2-{uuid}"));
    on_status(&format!("converting from {source_format}"));
    convert::convert_to_qcow2(&download_path, &source_format, &converted_path).await?;
    let _ = tokio::fs::remove_file(&download_path).await;

    let hex = content_sum.hex().to_owned();
    let blobs_dir = backend.blobs_dir();
    tokio::fs::create_dir_all(&blobs_dir).await?;
    let final_path = blobs_dir.join(format!("{hex}.qcow2"));

    let url = url.to_owned();
    backend
        .store
        .update(move |idx| {
            if final_path.exists() {
                let _ = std::fs::remove_file(&converted_path);
            } else {
                std::fs::rename(&converted_path, &final_path)?;
                set_readonly(&final_path)?;
            }

            let entry = ImageEntry {
                r#ref: url.clone(),
                content_sum: content_sum.as_str().to_owned(),
                size,
                created_at: now_millis(),
            };
            idx.images.insert(url.clone(), entry.clone());
            Ok(entry)
        })
        .await
        .inspect(|_| on_status("done"))
}

#[cfg(unix)]
fn set_readonly(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_readonly(path: &std::path::Path) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}
