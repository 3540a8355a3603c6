//! network transports for queries
//!
//! UDP queries of one context share a socket per address family. Replies are
//! read on a dedicated thread and routed to their owners through the
//! `PendingQueries` table. TCP queries open a connection each, and the
//! exchange runs on its own thread so that neither the caller nor the
//! dispatcher is ever blocked on it.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::Builder;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::dns::client::ClientError;
use crate::dns::netutil::{read_packet, write_packet};
use crate::dns::pending::{Delivery, PendingQueries};
use crate::dns::protocol::{ValidationError, HEADER_LEN};

/// Standard DNS port, used when a server is given without one
pub const DEFAULT_PORT: u16 = 53;

/// Biggest datagram the receiver accepts
const MAX_UDP_PACKET: usize = 4096;

/// How often receiver threads wake up to check whether they should stop
const RECV_POLL: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Udp
    }
}

impl FromStr for Transport {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            _ => Err(ValidationError::BadServer),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// The nameserver a request goes to
///
/// Parses from a bare address ("8.8.8.8", "2001:4860:4860::8888"), an address
/// with port ("8.8.8.8:5353", "[::1]:53"), optionally prefixed with the
/// transport ("tcp://8.8.8.8"). Port defaults to 53 and transport to UDP.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerAddr {
    pub fn new(address: IpAddr, port: u16, transport: Transport) -> ServerAddr {
        ServerAddr {
            address,
            port,
            transport,
        }
    }

    pub fn udp(addr: SocketAddr) -> ServerAddr {
        ServerAddr::new(addr.ip(), addr.port(), Transport::Udp)
    }

    pub fn tcp(addr: SocketAddr) -> ServerAddr {
        ServerAddr::new(addr.ip(), addr.port(), Transport::Tcp)
    }

    pub fn with_transport(mut self, transport: Transport) -> ServerAddr {
        self.transport = transport;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<Transport>()?, rest),
            None => (Transport::Udp, s),
        };

        if let Ok(address) = rest.parse::<IpAddr>() {
            return Ok(ServerAddr::new(address, DEFAULT_PORT, transport));
        }
        match rest.parse::<SocketAddr>() {
            Ok(addr) => Ok(ServerAddr::new(addr.ip(), addr.port(), transport)),
            Err(_) => Err(ValidationError::BadServer),
        }
    }
}

impl TryFrom<&str> for ServerAddr {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketAddr> for ServerAddr {
    fn from(addr: SocketAddr) -> Self {
        ServerAddr::udp(addr)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.socket_addr())
    }
}

type SocketSlot = Mutex<Option<Arc<UdpSocket>>>;

/// Shared UDP sockets of one context
///
/// Sockets are bound on first use, so a context that only ever talks TCP
/// never opens one. Every bound socket gets a receiver thread, which runs
/// until the transport is stopped or dropped.
pub struct UdpTransport {
    pending: Arc<PendingQueries>,
    port_v4: u16,
    port_v6: u16,
    socket_ipv4: SocketSlot,
    socket_ipv6: SocketSlot,
    stopped: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Port 0 lets the OS pick an ephemeral port
    pub fn new(pending: Arc<PendingQueries>, port_v4: u16, port_v6: u16) -> UdpTransport {
        UdpTransport {
            pending,
            port_v4,
            port_v6,
            socket_ipv4: Mutex::new(None),
            socket_ipv6: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends one datagram to `addr` from the socket of the matching family
    pub fn send(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::NotConnected, "UDP transport is stopped"));
        }

        let socket = self.socket(&addr)?;
        let sent = socket.send_to(data, addr)?;
        trace!("Sent {} bytes to {}", sent, addr);

        Ok(())
    }

    /// Address of the socket used for the given family, if it is bound yet
    pub fn local_addr(&self, ipv6: bool) -> Option<SocketAddr> {
        let slot = if ipv6 { &self.socket_ipv6 } else { &self.socket_ipv4 };
        let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn socket(&self, addr: &SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let (slot, bind_addr) = match addr {
            SocketAddr::V4(_) => (&self.socket_ipv4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port_v4)),
            SocketAddr::V6(_) => (&self.socket_ipv6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port_v6)),
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = slot.as_ref() {
            return Ok(Arc::clone(socket));
        }

        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        let socket = Arc::new(socket);
        self.spawn_receiver(Arc::clone(&socket))?;
        debug!("Bound UDP socket {}", socket.local_addr()?);

        *slot = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn spawn_receiver(&self, socket: Arc<UdpSocket>) -> io::Result<()> {
        let pending = Arc::clone(&self.pending);
        let stopped = Arc::clone(&self.stopped);

        Builder::new()
            .name(format!("dns-udp-receiver-{}", socket.local_addr()?.port()))
            .spawn(move || receive_loop(socket, pending, stopped))?;

        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: Arc<UdpSocket>, pending: Arc<PendingQueries>, stopped: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_UDP_PACKET];
    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(e) => {
                if e.kind() != ErrorKind::WouldBlock && e.kind() != ErrorKind::TimedOut {
                    trace!("UDP receive failed: {}", e);
                }
                continue;
            }
        };

        // Only the id is read here, the owner decodes the rest
        if len < HEADER_LEN {
            debug!("Dropping {} byte datagram from {}", len, from);
            continue;
        }
        if buf[2] & 0x80 == 0 {
            debug!("Dropping datagram from {}, it is not a response", from);
            continue;
        }

        let id = BigEndian::read_u16(&buf[0..2]);
        pending.dispatch(id, from, buf[..len].to_vec());
    }

    trace!("UDP receiver stopped");
}

/// Handle to a TCP exchange running on its own thread
///
/// The exchange connects, writes the length-prefixed query and reads one
/// length-prefixed response, then hands the result to its callback. Clones
/// share the connection, so `abort` on any of them closes it, which makes a
/// blocked read return at once.
#[derive(Clone, Default)]
pub struct TcpExchange {
    stream: Arc<Mutex<Option<TcpStream>>>,
    aborted: Arc<AtomicBool>,
}

impl TcpExchange {
    pub fn new() -> TcpExchange {
        TcpExchange::default()
    }

    pub fn start<F>(&self, addr: SocketAddr, data: Vec<u8>, timeout: Duration, on_done: F) -> io::Result<()>
    where
        F: FnOnce(Delivery) + Send + 'static,
    {
        let stream = Arc::clone(&self.stream);
        let aborted = Arc::clone(&self.aborted);
        Builder::new()
            .name(format!("dns-tcp-{}", addr))
            .spawn(move || {
                let result = exchange_tcp(addr, &data, timeout, &stream, &aborted);
                if let Err(ref e) = result {
                    debug!("TCP exchange with {} failed: {}", addr, e);
                }
                on_done(result.map_err(ClientError::from));
            })?;

        Ok(())
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn exchange_tcp(
    addr: SocketAddr,
    data: &[u8],
    timeout: Duration,
    slot: &Mutex<Option<TcpStream>>,
    aborted: &AtomicBool,
) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if aborted.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Interrupted, "exchange aborted"));
        }
        *slot = Some(stream.try_clone()?);
    }

    write_packet(&mut stream, data)?;
    let response = read_packet(&mut stream)?;
    let _ = stream.shutdown(Shutdown::Both);

    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::channel;
    use std::thread;

    use super::*;
    use crate::dns::dispatch::Command;

    #[test]
    fn test_parse_server() {
        let server: ServerAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(ServerAddr::new("8.8.8.8".parse().unwrap(), 53, Transport::Udp), server);

        let server: ServerAddr = "tcp://8.8.4.4:5353".parse().unwrap();
        assert_eq!(ServerAddr::new("8.8.4.4".parse().unwrap(), 5353, Transport::Tcp), server);

        let server: ServerAddr = "[::1]:5300".parse().unwrap();
        assert_eq!(SocketAddr::from((Ipv6Addr::LOCALHOST, 5300)), server.socket_addr());

        let server: ServerAddr = "2001:4860:4860::8888".parse().unwrap();
        assert_eq!(53, server.port);

        assert_eq!(Err(ValidationError::BadServer), "dns.google".parse::<ServerAddr>());
        assert_eq!(Err(ValidationError::BadServer), "quic://8.8.8.8".parse::<ServerAddr>());
        assert_eq!("tcp://8.8.8.8:53", server_string("8.8.8.8").with_transport(Transport::Tcp).to_string());
    }

    fn server_string(s: &str) -> ServerAddr {
        ServerAddr::try_from(s).unwrap()
    }

    #[test]
    fn test_server_from_toml() {
        let server: ServerAddr = toml::from_str("address = \"1.1.1.1\"\ntransport = \"tcp\"").unwrap();
        assert_eq!(ServerAddr::new("1.1.1.1".parse().unwrap(), 53, Transport::Tcp), server);
    }

    #[test]
    fn test_tcp_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let query = read_packet(&mut stream).unwrap();
            let mut reply = query.clone();
            reply.reverse();
            write_packet(&mut stream, &reply).unwrap();
        });

        let (tx, rx) = channel();
        let exchange = TcpExchange::new();
        exchange
            .start(addr, vec![1, 2, 3], Duration::from_secs(2), move |result| tx.send(result).unwrap())
            .unwrap();
        assert_eq!(vec![3, 2, 1], rx.recv().unwrap().unwrap());
    }

    #[test]
    fn test_tcp_short_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf);
            // Announce 100 bytes, deliver 3, hang up
            stream.write_all(&[0, 100, 1, 2, 3]).unwrap();
        });

        let (tx, rx) = channel();
        TcpExchange::new()
            .start(addr, vec![1, 2, 3], Duration::from_secs(2), move |result| tx.send(result).unwrap())
            .unwrap();
        match rx.recv().unwrap() {
            Err(ClientError::Io(e)) => assert_eq!(ErrorKind::UnexpectedEof, e.kind()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_tcp_abort() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            accepted_tx.send(()).unwrap();
            // Keep the connection open without answering
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });

        let (tx, rx) = channel();
        let exchange = TcpExchange::new();
        exchange
            .start(addr, vec![1, 2, 3], Duration::from_secs(10), move |result| tx.send(result).unwrap())
            .unwrap();
        accepted_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        // Aborting through a clone closes the same connection
        exchange.clone().abort();

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_udp_routes_by_id() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();

        let pending = Arc::new(PendingQueries::new());
        let transport = UdpTransport::new(Arc::clone(&pending), 0, 0);

        let (tx, rx) = channel();
        let id = pending.register(Some(server_addr), tx).unwrap().id;
        let mut query = vec![0u8; HEADER_LEN];
        BigEndian::write_u16(&mut query[0..2], id);
        transport.send(&query, server_addr).unwrap();
        assert!(transport.local_addr(false).is_some());
        assert!(transport.local_addr(true).is_none());

        let mut buf = [0u8; 512];
        let (len, client) = server.recv_from(&mut buf).unwrap();
        assert_eq!(query, buf[..len].to_vec());

        // Too short to be a reply, then a query instead of a response
        server.send_to(&[0], client).unwrap();
        server.send_to(&query, client).unwrap();
        let mut reply = query.clone();
        reply[2] |= 0x80;
        server.send_to(&reply, client).unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Command::Complete(completion) => {
                assert_eq!(id, completion.registration.id);
                assert_eq!(reply, completion.result.unwrap());
            }
            Command::Watch(_) => panic!("unexpected watch"),
        }
        assert!(rx.try_recv().is_err());
        // Routing leaves the entry to its owner
        assert!(pending.contains(id));

        transport.stop();
        assert!(transport.send(&query, server_addr).is_err());
    }
}
