//! Socket helpers shared by both backends, on top of `socket2`.
use std::io;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, IntoRawFd};

use socket2::SockRef;

use crate::backend::IoError;
use crate::event::SocketHandle;

/// Reason reported when the peer closes its end.
pub(crate) const CONNECTION_CLOSED: &str = "Connection closed";

/// Run `f` on a borrowed view of `fd`. Registered handles stay open until
/// they are removed, which outlives any call made here.
fn with_socket<T>(fd: SocketHandle, f: impl FnOnce(&SockRef<'_>) -> T) -> T {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    f(&SockRef::from(&borrowed))
}

pub(crate) fn set_nonblocking(fd: SocketHandle) -> Result<(), IoError> {
    with_socket(fd, |socket| socket.set_nonblocking(true)).map_err(|source| IoError::Os {
        op: "set_nonblocking",
        source,
    })
}

/// Pending error on a socket, or the peer-close reason if there is none.
pub(crate) fn socket_error(fd: SocketHandle) -> String {
    match with_socket(fd, |socket| socket.take_error()) {
        Ok(Some(err)) => err.to_string(),
        _ => CONNECTION_CLOSED.to_string(),
    }
}

pub(crate) fn peer_addr(fd: SocketHandle) -> Option<SocketAddr> {
    with_socket(fd, |socket| socket.peer_addr())
        .ok()
        .and_then(|addr| addr.as_socket())
}

/// Accept one pending connection as a non-blocking, close-on-exec handle.
pub(crate) fn accept(listener: SocketHandle) -> io::Result<(SocketHandle, Option<SocketAddr>)> {
    let (client, addr) = with_socket(listener, |socket| socket.accept())?;
    client.set_nonblocking(true)?;
    Ok((client.into_raw_fd(), addr.as_socket()))
}

pub(crate) fn close(fd: SocketHandle) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_accept_returns_nonblocking_client_and_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let err = accept(listener.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = loop {
            match accept(listener.as_raw_fd()) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert_eq!(peer, Some(client.local_addr().unwrap()));
        assert_eq!(peer_addr(accepted), peer);

        let mut accepted = unsafe { TcpStream::from_raw_fd(accepted) };
        let err = accepted.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_set_nonblocking_and_socket_error() {
        let (_a, mut b) = UnixStream::pair().unwrap();
        set_nonblocking(b.as_raw_fd()).unwrap();
        let err = b.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(socket_error(b.as_raw_fd()), CONNECTION_CLOSED);
        assert_eq!(peer_addr(b.as_raw_fd()), None);
    }
}
