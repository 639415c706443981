//! Adoption of inherited TCP listener descriptors inside the child.
//!
//! The parent binds every listener before the first spawn and passes the
//! backing files down on fds 5 and up; the name-to-fd mapping arrives
//! out of band in the bootstrap flag. The child turns each fd back into a
//! tokio listener here.

use std::io;
use std::os::fd::{FromRawFd, RawFd};

use tokio::net::TcpListener;
use tracing::info;

/// Adopt an inherited listener fd as a tokio [`TcpListener`].
///
/// The fd is validated with `fstat` before adoption; an fd that is not a
/// socket means the parent's bootstrap map and fd table disagree, which is
/// not recoverable from this side.
///
/// Takes ownership of the descriptor.
pub fn adopt(fd: RawFd) -> io::Result<TcpListener> {
    if !is_socket(fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("inherited fd {fd} is not a socket"),
        ));
    }

    // SAFETY: validated above, and the bootstrap contract hands this fd to
    // the child for exclusive use.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;

    let addr = listener.local_addr().ok();
    info!(fd, addr = ?addr, "adopted inherited listener");
    Ok(listener)
}

/// Whether the descriptor refers to a socket.
fn is_socket(fd: RawFd) -> bool {
    // SAFETY: fstat writes into the zeroed stat buffer or fails.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
