//! `vm console` terminal attach: puts the controlling terminal into raw mode
//! and pipes bytes bidirectionally with the resolved [`cocoon_hypervisor::ConsoleStream`]
//! until the escape sequence is typed or either side closes.

use std::os::fd::AsRawFd as _;

use anyhow::{anyhow, Result};
use cocoon_hypervisor::ConsoleStream;
use nix::sys::termios::{self, SetArg, Termios};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

/// Parses `--escape-char`: a single literal char, or caret notation (`^]`,
/// `^C`) mapping to the corresponding control byte.
pub fn parse_escape_char(s: &str) -> Result<u8> {
    let mut chars = s.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('^'), Some(c), None) => Ok((c.to_ascii_uppercase() as u8) & 0x1f),
        (Some(c), None, None) => Ok(c as u8),
        _ => Err(anyhow!("invalid --escape-char {s:?}: expected a single char or ^X notation")),
    }
}

/// Restores the terminal's original `termios` state on drop, so a panic or
/// early return never leaves the user's shell in raw mode.
struct TermGuard {
    fd: std::os::fd::RawFd,
    original: Termios,
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) }, SetArg::TCSANOW, &self.original);
    }
}

fn enter_raw_mode() -> Result<Option<TermGuard>> {
    let fd = std::io::stdin().as_raw_fd();
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let Ok(original) = termios::tcgetattr(borrowed) else {
        // Not a TTY (e.g. piped input in tests/CI) — run without raw mode.
        return Ok(None);
    };
    let mut raw = original.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(borrowed, SetArg::TCSANOW, &raw)?;
    Ok(Some(TermGuard { fd, original }))
}

/// Attaches the controlling terminal to `stream` until `escape_byte` is
/// typed or either side closes.
pub async fn attach(stream: ConsoleStream, escape_byte: u8) -> Result<()> {
    let _guard = enter_raw_mode()?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let to_guest = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf[..n].contains(&escape_byte) {
                        break;
                    }
                    if writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let from_guest = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).await.is_err() || stdout.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = to_guest => {}
        _ = from_guest => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_caret_notation() {
        assert_eq!(parse_escape_char("^]").unwrap(), 0x1d);
        assert_eq!(parse_escape_char("^C").unwrap(), 0x03);
    }

    #[test]
    fn parses_a_literal_char() {
        assert_eq!(parse_escape_char("q").unwrap(), b'q');
    }

    #[test]
    fn rejects_multi_char_input() {
        assert!(parse_escape_char("abc").is_err());
    }
}
