//! Socket dialing for HTTPS and DNS traffic
//!
//! All outbound sockets of the client are opened here so that they carry the
//! configured firewall mark. UDP sockets are only ever used for DNS and always
//! go to one of the configured DNS servers, picked at random per dial.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

/// Opens marked TCP and UDP sockets
pub struct Dialer {
    firewall_mark: u32,
    dns_servers: Vec<SocketAddr>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("firewall_mark", &self.firewall_mark)
            .field("dns_servers", &self.dns_servers)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Create a dialer; an empty DNS server list falls back to 1.1.1.1:53
    pub fn new(firewall_mark: u32, dns_servers: Vec<SocketAddr>) -> Self {
        Self::with_rng(firewall_mark, dns_servers, Box::new(StdRng::from_entropy()))
    }

    /// Create a dialer with an explicit random source for DNS server selection
    pub fn with_rng(
        firewall_mark: u32,
        mut dns_servers: Vec<SocketAddr>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        if dns_servers.is_empty() {
            dns_servers.push(SocketAddr::from((Ipv4Addr::new(1, 1, 1, 1), 53)));
        }
        Self {
            firewall_mark,
            dns_servers,
            rng: Mutex::new(rng),
        }
    }

    pub fn firewall_mark(&self) -> u32 {
        self.firewall_mark
    }

    pub fn dns_servers(&self) -> &[SocketAddr] {
        &self.dns_servers
    }

    /// Uniformly random DNS server, drawn fresh on every call
    pub fn pick_dns_server(&self) -> SocketAddr {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.dns_servers[rng.gen_range(0..self.dns_servers.len())]
    }

    /// Open a TCP connection to `addr`
    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.tag(&socket);
        socket.connect(addr).await
    }

    /// Open a UDP socket connected to one of the DNS servers
    pub async fn dial_udp(&self) -> io::Result<UdpSocket> {
        let server = self.pick_dns_server();
        let local = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(local).await?;
        self.tag(&socket);
        socket.connect(server).await?;
        log::debug!("Dial: DNS via {server}");
        Ok(socket)
    }

    #[cfg(unix)]
    fn tag<S: std::os::fd::AsRawFd>(&self, socket: &S) {
        if self.firewall_mark == 0 {
            return;
        }
        if let Err(e) = set_mark(socket.as_raw_fd(), self.firewall_mark) {
            log::error!("Dial: set mark failed, {e}");
        }
    }

    #[cfg(not(unix))]
    fn tag<S>(&self, _socket: &S) {
        if self.firewall_mark != 0 {
            log::error!("Dial: set mark failed, firewall marks are not supported here");
        }
    }
}

#[cfg(target_os = "linux")]
fn set_mark(fd: std::os::fd::RawFd, mark: u32) -> io::Result<()> {
    let value = mark as libc::c_int;
    // SAFETY: fd is an open socket owned by the caller for the duration of the
    // call, and the option value points to a live c_int of the passed length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_mark(_fd: std::os::fd::RawFd, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is only available on Linux",
    ))
}
