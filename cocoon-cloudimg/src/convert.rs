//! Streaming download, format detection, and qcow2 conversion (spec §4.4
//! steps 2-4).

use std::io::Read as _;
use std::path::{Path, PathBuf};

use cocoon_core::digest::StreamingHasher;
use cocoon_core::error::{Error, Result};
use tokio::process::Command;

/// Reject any download whose declared or observed size exceeds this.
const MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024 * 1024;
/// Granularity at which [`download`] invokes its progress callback.
const PROGRESS_GRANULARITY: u64 = 1024 * 1024;

/// Downloads `url` into `dest`, computing its SHA-256 digest streamingly
/// and rejecting anything over 20 GiB. `on_progress` is called with the
/// cumulative byte count at roughly 1 MiB granularity.
pub async fn download(url: &str, dest: PathBuf, on_progress: impl Fn(u64) + Send + 'static) -> Result<(cocoon_core::Digest, u64)> {
    let url = url.to_owned();
    tokio::task::spawn_blocking(move || download_blocking(&url, &dest, on_progress))
        .await
        .map_err(|e| Error::Subprocess {
            bin: "download".to_owned(),
            detail: e.to_string(),
        })?
}

fn download_blocking(url: &str, dest: &Path, on_progress: impl Fn(u64)) -> Result<(cocoon_core::Digest, u64)> {
    let response = ureq::get(url).call().map_err(Error::transient)?;
    let reader = response.into_body().into_reader();
    let file = std::fs::File::create(dest)?;
    stream_to_file(reader, file, MAX_DOWNLOAD_BYTES, on_progress).map_err(|e| match e {
        StreamError::TooLarge => Error::Validation(format!("{url} exceeds the 20 GiB cloud-image size cap")),
        StreamError::Io(e) => Error::PermanentIo(e),
    })
}

enum StreamError {
    TooLarge,
    Io(std::io::Error),
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Copies `reader` into `file` while hashing and enforcing the size cap,
/// independent of where the reader comes from (network or test fixture).
fn stream_to_file(
    mut reader: impl std::io::Read,
    mut file: std::fs::File,
    cap: u64,
    on_progress: impl Fn(u64),
) -> std::result::Result<(cocoon_core::Digest, u64), StreamError> {
    let mut hasher = StreamingHasher::new();
    let mut buf = [0_u8; 64 * 1024];
    let mut total = 0_u64;
    let mut last_reported = 0_u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if total > cap {
            return Err(StreamError::TooLarge);
        }
        std::io::Write::write_all(&mut file, &buf[..n])?;
        hasher.update(&buf[..n]);
        if total - last_reported >= PROGRESS_GRANULARITY {
            on_progress(total);
            last_reported = total;
        }
    }
    file.sync_all()?;
    on_progress(total);

    Ok((hasher.finish(), total))
}

/// Detects the image format of `path` via `qemu-img info --output=json`,
/// accepting only `qcow2` or `raw` (spec §4.4 step 3).
pub async fn detect_format(path: &Path) -> Result<String> {
    let output = Command::new("qemu-img")
        .arg("info")
        .arg("--output=json")
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: format!("info exited {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
        });
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let format = parsed
        .get("format")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::Validation(format!("qemu-img info produced no format for {}", path.display())))?
        .to_owned();

    if format != "qcow2" && format != "raw" {
        return Err(Error::Validation(format!(
            "unsupported source image format {format:?}, only qcow2 and raw are accepted"
        )));
    }
    Ok(format)
}

/// Converts `src` (in `source_format`) into a qcow2 image at `dest` via
/// `qemu-img convert -O qcow2 -o compat=1.1` (spec §4.4 step 4).
pub async fn convert_to_qcow2(src: &Path, source_format: &str, dest: &Path) -> Result<()> {
    let status = Command::new("qemu-img")
        .arg("convert")
        .arg("-f")
        .arg(source_format)
        .arg("-O")
        .arg("qcow2")
        .arg("-o")
        .arg("compat=1.1")
        .arg(src)
        .arg(dest)
        .status()
        .await
        .map_err(|e| Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(Error::Subprocess {
            bin: "qemu-img".to_owned(),
            detail: format!("convert exited {status}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_to_file_hashes_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let file = std::fs::File::create(&dest).unwrap();
        let data = b"hello cloud image";
        let (digest, size) = stream_to_file(std::io::Cursor::new(data), file, MAX_DOWNLOAD_BYTES, |_| {})
            .unwrap_or_else(|_| panic!("stream_to_file failed"));
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, cocoon_core::Digest::of(data));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn stream_to_file_rejects_oversized_body() {
        struct Infinite;
        impl std::io::Read for Infinite {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                buf.fill(0);
                Ok(buf.len())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::File::create(dir.path().join("out")).unwrap();
        let err = stream_to_file(Infinite, file, 128 * 1024, |_| {});
        assert!(matches!(err, Err(StreamError::TooLarge)));
    }
}
