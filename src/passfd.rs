//! Passing open descriptors between processes over a Unix domain socket (`SCM_RIGHTS`).
//!
//! Every message carries exactly one descriptor and one byte of ordinary payload, since some
//! systems refuse to deliver ancillary data on an empty message.

use super::error::{Error, Result};
use super::socket::socket_family;

use nix::sys::socket::{recvmsg, sendmsg, AddressFamily, ControlMessage, ControlMessageOwned,
                       MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Room for a few descriptors, so a misbehaving sender doesn't get its extras silently
/// truncated (and leaked) by the kernel.
const MAX_FDS_PER_MESSAGE: usize = 4;

/// Send `fd` over `channel`. The caller keeps its own copy of `fd` and is expected to close it.
pub fn send_fd(channel: RawFd, fd: RawFd) -> io::Result<()> {
    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(channel, &iov, &cmsgs, SEND_FLAGS, None)?;
    Ok(())
}

/// Receive one descriptor from `channel`. `Ok(None)` means the sender closed the channel.
pub fn recv_fd(channel: RawFd) -> io::Result<Option<OwnedFd>> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);

    let msg = recvmsg::<()>(channel, &mut iov, Some(&mut cmsg_buf), RECV_FLAGS)?;

    let mut raw_fds = vec![];
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            raw_fds.extend(fds);
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!("ancillary data was truncated; some passed descriptors were lost");
    }
    let bytes = msg.bytes;

    // The kernel installed these in our table; they're ours now.
    let mut fds: Vec<OwnedFd> = raw_fds.into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if fds.is_empty() {
        if bytes == 0 {
            return Ok(None);
        }
        return Err(io::Error::new(io::ErrorKind::InvalidData,
                                  "message on descriptor channel carried no descriptor"));
    }
    if fds.len() > 1 {
        warn!("closing {} extra descriptors received in one message", fds.len() - 1);
    }
    Ok(Some(fds.swap_remove(0)))
}

/// The async side of a descriptor-passing Unix socket.
#[derive(Debug)]
pub struct DescriptorChannel {
    stream: UnixStream,
}

impl DescriptorChannel {
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<DescriptorChannel> {
        stream.set_nonblocking(true)?;
        Ok(DescriptorChannel { stream: UnixStream::from_std(stream)? })
    }

    /// Take over an inherited descriptor (typically stdin of a worker process). The descriptor
    /// is checked to be a Unix socket before ownership is taken.
    pub fn from_raw_fd(fd: RawFd) -> Result<DescriptorChannel> {
        let family = socket_family(fd)?;
        if family != AddressFamily::Unix {
            return Err(Error::InvalidDescriptor {
                fd,
                reason: format!("descriptor channel must be a Unix socket, not {:?}", family),
            });
        }
        let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        Ok(DescriptorChannel::from_std(stream)?)
    }

    /// A connected pair, for a parent and the child it is about to spawn.
    pub fn pair() -> io::Result<(DescriptorChannel, std::os::unix::net::UnixStream)> {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
        Ok((DescriptorChannel::from_std(ours)?, theirs))
    }

    pub async fn send(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let channel = self.stream.as_raw_fd();
        let fd = fd.as_raw_fd();
        self.stream.async_io(Interest::WRITABLE, || send_fd(channel, fd)).await
    }

    pub async fn recv(&self) -> io::Result<Option<OwnedFd>> {
        let channel = self.stream.as_raw_fd();
        self.stream.async_io(Interest::READABLE, || recv_fd(channel)).await
    }
}

impl AsRawFd for DescriptorChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsFd;

    #[test]
    fn pass_a_pipe() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let (mut left, right) = std::os::unix::net::UnixStream::pair().unwrap();

        send_fd(a.as_raw_fd(), right.as_raw_fd()).unwrap();
        drop(right);

        let received = recv_fd(b.as_raw_fd()).unwrap().expect("a descriptor");
        let mut right = std::os::unix::net::UnixStream::from(received);
        left.write_all(b"through").unwrap();
        let mut buf = [0u8; 7];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(b"through", &buf);
    }

    #[test]
    fn eof_is_none() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        drop(a);
        assert!(recv_fd(b.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn plain_bytes_are_rejected() {
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();
        let err = recv_fd(b.as_raw_fd()).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[tokio::test]
    async fn async_channel() {
        let (sender, theirs) = DescriptorChannel::pair().unwrap();
        let receiver = DescriptorChannel::from_std(theirs).unwrap();

        let file = tempfile::tempfile().unwrap();
        sender.send(file.as_fd()).await.unwrap();
        let got = receiver.recv().await.unwrap().expect("a descriptor");
        assert!(std::fs::File::from(got).metadata().unwrap().is_file());

        drop(sender);
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[test]
    fn channel_must_be_unix() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        match DescriptorChannel::from_raw_fd(tcp.as_raw_fd()) {
            Err(Error::InvalidDescriptor { .. }) => (),
            other => panic!("expected InvalidDescriptor, got {:?}", other),
        }
    }
}
