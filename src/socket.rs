//! One listener type and one stream type over the three transports we serve on: TCP, Unix
//! domain sockets, and descriptors handed to us by another process.

use super::error::{Error, Result};
use super::passfd::DescriptorChannel;

use nix::errno::Errno;
use nix::sys::socket::{getsockname, shutdown, AddressFamily, Shutdown, SockaddrLike, SockaddrStorage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixSocket, UnixStream};

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

/// Where a server listens, or where a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    /// A filesystem socket; `mode` is applied to the path after a successful listen.
    Unix {
        path: PathBuf,
        mode: Option<u32>,
    },
    /// A Linux abstract-namespace socket (no filesystem entry).
    Abstract(String),
    /// An already-listening socket inherited from the parent process.
    Inherited(RawFd),
    /// A Unix socket over which another process passes us accepted connections.
    Channel(RawFd),
}

impl FromStr for ListenAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<ListenAddress> {
        let invalid = || Error::InvalidAddress(s.to_owned());
        let parse_fd = |fd: &str| fd.parse::<RawFd>().ok().filter(|fd| *fd >= 0).ok_or_else(invalid);

        if let Some(addr) = s.strip_prefix("tcp:") {
            addr.parse().map(ListenAddress::Tcp).map_err(|_| invalid())
        } else if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            Ok(ListenAddress::Unix { path: PathBuf::from(path), mode: None })
        } else if let Some(name) = s.strip_prefix("abstract:") {
            if name.is_empty() {
                return Err(invalid());
            }
            Ok(ListenAddress::Abstract(name.to_owned()))
        } else if let Some(fd) = s.strip_prefix("fd:") {
            parse_fd(fd).map(ListenAddress::Inherited)
        } else if let Some(fd) = s.strip_prefix("channel:") {
            parse_fd(fd).map(ListenAddress::Channel)
        } else {
            s.parse().map(ListenAddress::Tcp).map_err(|_| invalid())
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
            ListenAddress::Unix { path, .. } => write!(f, "unix:{}", path.display()),
            ListenAddress::Abstract(name) => write!(f, "abstract:{}", name),
            ListenAddress::Inherited(fd) => write!(f, "fd:{}", fd),
            ListenAddress::Channel(fd) => write!(f, "channel:{}", fd),
        }
    }
}

/// Look up the address family of the socket behind `fd`, failing if it isn't one.
pub(crate) fn socket_family(fd: RawFd) -> Result<AddressFamily> {
    let addr: SockaddrStorage = getsockname(fd).map_err(|errno| Error::InvalidDescriptor {
        fd,
        reason: errno.to_string(),
    })?;
    addr.family().ok_or_else(|| Error::InvalidDescriptor {
        fd,
        reason: "socket has no address family".to_owned(),
    })
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    Err(io::Error::new(io::ErrorKind::Unsupported,
        "abstract socket addresses are only available on Linux"))
}

/// Listen on an abstract address. std's `bind_addr` has no backlog parameter, so the socket
/// is built by hand. Backlogs beyond what the kernel allows are capped at `SOMAXCONN`.
#[cfg(target_os = "linux")]
fn listen_abstract(name: &str, backlog: u32) -> io::Result<std::os::unix::net::UnixListener> {
    use nix::sys::socket::{bind, listen, socket, Backlog, SockFlag, SockType, UnixAddr};

    let addr = UnixAddr::new_abstract(name.as_bytes())?;
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    bind(fd.as_raw_fd(), &addr)?;
    let backlog = i32::try_from(backlog).ok()
        .and_then(|backlog| Backlog::new(backlog).ok())
        .unwrap_or(Backlog::MAXCONN);
    listen(&fd, backlog)?;
    Ok(std::os::unix::net::UnixListener::from(fd))
}

#[cfg(not(target_os = "linux"))]
fn listen_abstract(name: &str, _backlog: u32) -> io::Result<std::os::unix::net::UnixListener> {
    std::os::unix::net::UnixListener::bind_addr(&abstract_addr(name)?)
}

/// The filesystem entry of a Unix listening socket we created.
///
/// Dropping it unlinks the path, but only if the path still refers to the inode we bound;
/// if something else has since replaced it, it is left alone.
#[derive(Debug)]
pub struct SocketPath {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl SocketPath {
    fn new(path: &Path) -> io::Result<SocketPath> {
        let meta = fs::symlink_metadata(path)?;
        Ok(SocketPath {
            path: path.to_owned(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketPath {
    fn drop(&mut self) {
        match fs::symlink_metadata(&self.path) {
            Ok(ref meta) if meta.dev() == self.dev && meta.ino() == self.ino => {
                debug!("removing socket {}", self.path.display());
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("failed to remove socket {}: {}", self.path.display(), e);
                }
            },
            Ok(_) => {
                debug!("socket {} was replaced by someone else; leaving it", self.path.display());
            },
            Err(_) => (),
        }
    }
}

fn bind_unix(path: &Path, mode: Option<u32>, backlog: u32) -> Result<FastcgiListener> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(Error::AddressInUse { path: path.to_owned() });
            }
            if !meta.file_type().is_socket() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()))));
            }
            info!("removing stale socket {}", path.display());
            fs::remove_file(path)?;
        },
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e.into()),
    }

    let socket = UnixSocket::new_stream()?;
    socket.bind(path)?;
    let listener = socket.listen(backlog)?;
    let guard = SocketPath::new(path)?;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }

    info!("listening on unix:{}", path.display());
    Ok(FastcgiListener::Unix {
        listener,
        path: Some(guard),
    })
}

fn inherited_listener(fd: RawFd) -> Result<FastcgiListener> {
    let family = socket_family(fd)?;
    // getsockname succeeded, so `fd` is an open socket; from here on we own it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    match family {
        AddressFamily::Inet | AddressFamily::Inet6 => {
            let listener = std::net::TcpListener::from(owned);
            listener.set_nonblocking(true)?;
            info!("listening on inherited TCP socket fd {}", fd);
            Ok(FastcgiListener::Tcp(TcpListener::from_std(listener)?))
        },
        AddressFamily::Unix => {
            let listener = std::os::unix::net::UnixListener::from(owned);
            listener.set_nonblocking(true)?;
            info!("listening on inherited Unix socket fd {}", fd);
            Ok(FastcgiListener::Unix {
                listener: UnixListener::from_std(listener)?,
                path: None,
            })
        },
        other => Err(Error::InvalidDescriptor {
            fd,
            reason: format!("unsupported address family {:?}", other),
        }),
    }
}

/// A bound, listening socket, or a descriptor channel standing in for one.
#[derive(Debug)]
pub enum FastcgiListener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        path: Option<SocketPath>,
    },
    Channel(DescriptorChannel),
}

impl FastcgiListener {
    /// Bind and listen with the given backlog.
    ///
    /// An inherited descriptor is already listening, so `backlog` does not apply to it. Must
    /// be called from within a tokio runtime.
    pub fn bind(address: &ListenAddress, backlog: u32) -> Result<FastcgiListener> {
        match *address {
            ListenAddress::Tcp(addr) => {
                let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                let listener = socket.listen(backlog)?;
                info!("listening on tcp:{}", listener.local_addr()?);
                Ok(FastcgiListener::Tcp(listener))
            },
            ListenAddress::Unix { ref path, mode } => bind_unix(path, mode, backlog),
            ListenAddress::Abstract(ref name) => {
                let listener = listen_abstract(name, backlog)?;
                listener.set_nonblocking(true)?;
                info!("listening on abstract:{}", name);
                Ok(FastcgiListener::Unix {
                    listener: UnixListener::from_std(listener)?,
                    path: None,
                })
            },
            ListenAddress::Inherited(fd) => inherited_listener(fd),
            ListenAddress::Channel(fd) => {
                info!("receiving connections over descriptor channel fd {}", fd);
                Ok(FastcgiListener::Channel(DescriptorChannel::from_raw_fd(fd)?))
            },
        }
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> io::Result<FastcgiStream> {
        match self {
            FastcgiListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!("accepted TCP connection from {}", peer);
                Ok(FastcgiStream::from(stream))
            },
            FastcgiListener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                debug!("accepted Unix connection fd {}", stream.as_raw_fd());
                Ok(FastcgiStream::from(stream))
            },
            FastcgiListener::Channel(channel) => loop {
                let fd = channel.recv().await?.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "descriptor channel closed by the front end")
                })?;
                match FastcgiStream::from_owned_fd(fd) {
                    Ok(stream) => {
                        debug!("received connection fd {} over the descriptor channel",
                               stream.as_raw_fd());
                        return Ok(stream);
                    },
                    Err(e) => warn!("discarding passed descriptor: {}", e),
                }
            },
        }
    }

    /// The bound address, for TCP listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            FastcgiListener::Tcp(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// The filesystem path, for Unix listeners we bound ourselves.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            FastcgiListener::Unix { path: Some(path), .. } => Some(path.path()),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum StreamKind {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// One connected socket, whichever transport it came from.
#[derive(Debug)]
pub struct FastcgiStream {
    kind: StreamKind,
    closed: bool,
}

impl From<TcpStream> for FastcgiStream {
    fn from(stream: TcpStream) -> FastcgiStream {
        FastcgiStream { kind: StreamKind::Tcp(stream), closed: false }
    }
}

impl From<UnixStream> for FastcgiStream {
    fn from(stream: UnixStream) -> FastcgiStream {
        FastcgiStream { kind: StreamKind::Unix(stream), closed: false }
    }
}

impl FastcgiStream {
    pub async fn connect(address: &ListenAddress) -> Result<FastcgiStream> {
        match *address {
            ListenAddress::Tcp(addr) => Ok(TcpStream::connect(addr).await?.into()),
            ListenAddress::Unix { ref path, .. } => Ok(UnixStream::connect(path).await?.into()),
            ListenAddress::Abstract(ref name) => {
                let stream = std::os::unix::net::UnixStream::connect_addr(&abstract_addr(name)?)?;
                stream.set_nonblocking(true)?;
                Ok(UnixStream::from_std(stream)?.into())
            },
            ListenAddress::Inherited(fd) => {
                socket_family(fd)?;
                // Validated above; ownership moves into the stream.
                FastcgiStream::from_owned_fd(unsafe { OwnedFd::from_raw_fd(fd) })
            },
            ListenAddress::Channel(_) => Err(Error::InvalidAddress(address.to_string())),
        }
    }

    /// Take ownership of a connected socket descriptor, e.g. one received from another
    /// process. Fails if `fd` is not a TCP or Unix socket.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<FastcgiStream> {
        let raw = fd.as_raw_fd();
        let kind = match socket_family(raw)? {
            AddressFamily::Inet | AddressFamily::Inet6 => {
                let stream = std::net::TcpStream::from(fd);
                stream.set_nonblocking(true)?;
                StreamKind::Tcp(TcpStream::from_std(stream)?)
            },
            AddressFamily::Unix => {
                let stream = std::os::unix::net::UnixStream::from(fd);
                stream.set_nonblocking(true)?;
                StreamKind::Unix(UnixStream::from_std(stream)?)
            },
            other => {
                return Err(Error::InvalidDescriptor {
                    fd: raw,
                    reason: format!("unsupported address family {:?}", other),
                });
            },
        };
        Ok(FastcgiStream { kind, closed: false })
    }

    /// Read some bytes. Zero bytes from the peer is reported as `Error::ConnectionClosed`
    /// rather than as an empty read.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read(buf).await? {
            0 => Err(Error::ConnectionClosed),
            n => Ok(n),
        }
    }

    pub async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.write(buf).await?)
    }

    /// Flush, then shut down both directions so everything already written reaches the peer
    /// before it sees the close. The descriptor itself is released on drop. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = self.flush().await;
        match shutdown(self.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) => flushed,
            Err(errno) => Err(errno.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl AsRawFd for FastcgiStream {
    fn as_raw_fd(&self) -> RawFd {
        match self.kind {
            StreamKind::Tcp(ref s) => s.as_raw_fd(),
            StreamKind::Unix(ref s) => s.as_raw_fd(),
        }
    }
}

impl AsFd for FastcgiStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self.kind {
            StreamKind::Tcp(ref s) => s.as_fd(),
            StreamKind::Unix(ref s) => s.as_fd(),
        }
    }
}

impl AsyncRead for FastcgiStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>)
        -> Poll<io::Result<()>>
    {
        match self.get_mut().kind {
            StreamKind::Tcp(ref mut s) => Pin::new(s).poll_read(cx, buf),
            StreamKind::Unix(ref mut s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FastcgiStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8])
        -> Poll<io::Result<usize>>
    {
        match self.get_mut().kind {
            StreamKind::Tcp(ref mut s) => Pin::new(s).poll_write(cx, buf),
            StreamKind::Unix(ref mut s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().kind {
            StreamKind::Tcp(ref mut s) => Pin::new(s).poll_flush(cx),
            StreamKind::Unix(ref mut s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().kind {
            StreamKind::Tcp(ref mut s) => Pin::new(s).poll_shutdown(cx),
            StreamKind::Unix(ref mut s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
