//! PTY allocation, spawning on the slave side, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd is switched to
//! non-blocking mode so it can be driven by `AsyncFd`.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size and a non-blocking master.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    let flags = OFlag::from_bits_truncate(fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program args...` on the slave side of the PTY.
///
/// The child becomes a session leader (so its pid is also its process group
/// id) with the PTY slave as its controlling terminal and stdio.
pub fn spawn_on_pty(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    working_dir: &str,
    env: &[(&str, &str)],
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let master_fd = pty.master.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(working_dir).kill_on_drop(true);

    // stdio is wired up in pre_exec, so tokio must not create pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.envs(env.iter().copied());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            libc::close(master_fd);
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &impl AsRawFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct we own for the duration of the call.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Non-blocking read from a raw fd.
pub fn read_fd(fd: &impl AsRawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    // SAFETY: buf is a valid writable region of buf.len() bytes.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}

/// Non-blocking write to a raw fd.
pub fn write_fd(fd: &impl AsRawFd, buf: &[u8]) -> std::io::Result<usize> {
    // SAFETY: buf is a valid readable region of buf.len() bytes.
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}
