use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// An IPv4 host/port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    /// Resolve `host` (dotted quad or DNS name) to its first IPv4 address.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Self::from_ip(ip, port));
        }

        let resolve_err = |source| TransportError::Resolve {
            host: host.to_string(),
            source,
        };

        let candidates = (host, port).to_socket_addrs().map_err(resolve_err)?;
        for candidate in candidates {
            if let SocketAddr::V4(v4) = candidate {
                debug!(host, ip = %v4.ip(), "resolved host name");
                return Ok(Self::from_ip(*v4.ip(), port));
            }
        }

        Err(resolve_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no IPv4 address for host",
        )))
    }

    /// Build an address from a raw IPv4 address.
    pub fn from_ip(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Convert a socket address. Only IPv4 is supported by the transport.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::from_ip(*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .map(|ip| Self::from_ip(ip, v6.port())),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// As a socket address, for binding and connecting.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Dotted-quad form of the IP.
    pub fn ip_string(&self) -> String {
        self.ip.to_string()
    }

    /// Host name for the IP by reverse lookup, or the dotted quad if none is registered.
    pub fn hostname(&self) -> String {
        reverse_lookup(self.ip).unwrap_or_else(|| self.ip_string())
    }

    /// Name of the local machine.
    pub fn local_hostname() -> String {
        match local_hostname() {
            Some(name) => name,
            None => {
                warn!("could not determine local host name, using localhost");
                "localhost".to_string()
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_ip(*addr.ip(), addr.port())
    }
}

#[cfg(unix)]
fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid initial value.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        sa.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }

    let mut host = [0 as libc::c_char; 1025];

    // SAFETY: `sa` is a fully initialized sockaddr_in of the advertised length, `host` is
    // writable for its full length, and the service buffer is explicitly omitted.
    let rc = unsafe {
        libc::getnameinfo(
            (&sa as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };

    if rc != 0 {
        return None;
    }

    // SAFETY: getnameinfo succeeded, so `host` holds a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn reverse_lookup(_ip: Ipv4Addr) -> Option<String> {
    None
}

#[cfg(unix)]
fn local_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is writable for its full length; gethostname writes at most that many
    // bytes including the terminator.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return None;
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn local_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}
