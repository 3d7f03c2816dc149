//! `Console` (spec §4.6 Console): resolve a running VM's console endpoint
//! and open a bidirectional byte stream to it.

use std::os::unix::fs::FileTypeExt as _;
use std::path::Path;

use cocoon_core::config::Config;
use cocoon_core::error::{Error, Result};
use cocoon_core::process::pid_file_alive;
use cocoon_core::store::Store;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

use crate::index::VmIndex;

fn binary_basename(hypervisor_bin: &str) -> String {
    Path::new(hypervisor_bin).file_name().and_then(|n| n.to_str()).unwrap_or(hypervisor_bin).to_owned()
}

/// Either endpoint kind a console can resolve to, erased behind the async
/// read/write traits so callers don't need to match on boot mode.
pub enum ConsoleStream {
    /// Direct-boot console: the PTY slave `cloud-hypervisor` allocated.
    Pty(tokio::fs::File),
    /// UEFI console: the pre-created Unix socket.
    Socket(UnixStream),
}

impl AsyncRead for ConsoleStream {
    fn poll_read(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Pty(f) => std::pin::Pin::new(f).poll_read(cx, buf),
            Self::Socket(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConsoleStream {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Pty(f) => std::pin::Pin::new(f).poll_write(cx, buf),
            Self::Socket(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Pty(f) => std::pin::Pin::new(f).poll_flush(cx),
            Self::Socket(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Pty(f) => std::pin::Pin::new(f).poll_shutdown(cx),
            Self::Socket(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Resolves `id` to its console endpoint and opens it. Fails if the VM
/// isn't running or never reported a console path.
pub async fn console(config: &Config, store: &Store<VmIndex>, id: &str) -> Result<ConsoleStream> {
    let basename = binary_basename(&config.hypervisor_bin);
    let pid_path = config.vm_run_dir(id).join("ch.pid");
    if !pid_file_alive(&pid_path, &basename) {
        return Err(Error::Conflict(format!("vm {id} is not running")));
    }

    let record = store.with(|idx| idx.vms.get(id).cloned()).await?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
    let console_path = record.vm.console_path.ok_or_else(|| Error::Validation(format!("vm {id} has no console path recorded")))?;
    open_console(Path::new(&console_path)).await
}

async fn open_console(path: &Path) -> Result<ConsoleStream> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.file_type().is_socket() {
        let stream = UnixStream::connect(path).await?;
        return Ok(ConsoleStream::Socket(stream));
    }

    let file = tokio::fs::OpenOptions::new().read(true).write(true).open(path).await?;
    Ok(ConsoleStream::Pty(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_a_unix_socket_console() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let stream = open_console(&path).await.unwrap();
        assert!(matches!(stream, ConsoleStream::Socket(_)));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_console_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_console(&dir.path().join("nope")).await;
        assert!(err.is_err());
    }
}
