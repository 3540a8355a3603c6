//! client for sending DNS queries to other servers

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::dns::context::DnsContext;
use crate::dns::protocol::{validate_name, DnsPacket, DnsQuestion, ProtocolError, QueryType, ValidationError};
use crate::dns::request::Request;
use crate::dns::transport::{ServerAddr, Transport};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(ProtocolError),
    Validation(ValidationError),
    Io(std::io::Error),
    #[display(fmt = "request was already sent")]
    AlreadySent,
    #[display(fmt = "no free transaction id")]
    NoFreeId,
    #[display(fmt = "lookup failed")]
    LookupFailed,
    #[display(fmt = "timed out")]
    TimeOut,
}

impl From<Infallible> for ClientError {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

type Result<T> = std::result::Result<T, ClientError>;

pub trait DnsClient {
    fn get_sent_count(&self) -> usize;
    fn get_failed_count(&self) -> usize;

    fn stop(&self);
    fn send_query(&self, qname: &str, qtype: QueryType, server: &str, recursive: bool) -> Result<DnsPacket>;
}

/// A blocking client on top of `Request`
///
/// Every query is a request of its own, waited for on the calling thread. The
/// requests of one client share the client's context, so any number of
/// threads may query through it at the same time.
pub struct DnsNetworkClient {
    total_sent: AtomicUsize,
    total_failed: AtomicUsize,
    context: Arc<DnsContext>,
}

impl DnsNetworkClient {
    pub fn new(context: Arc<DnsContext>) -> DnsNetworkClient {
        DnsNetworkClient {
            total_sent: AtomicUsize::new(0),
            total_failed: AtomicUsize::new(0),
            context,
        }
    }

    pub fn context(&self) -> &Arc<DnsContext> {
        &self.context
    }

    /// Send a DNS query using UDP transport
    pub fn send_udp_query<A>(&self, qname: &str, qtype: QueryType, server: A, recursive: bool) -> Result<DnsPacket>
    where
        A: TryInto<ServerAddr>,
        ClientError: From<A::Error>,
    {
        let server = server.try_into()?.with_transport(Transport::Udp);
        self.query(qname, qtype, server, recursive)
    }

    /// Send a DNS query using TCP transport
    pub fn send_tcp_query<A>(&self, qname: &str, qtype: QueryType, server: A, recursive: bool) -> Result<DnsPacket>
    where
        A: TryInto<ServerAddr>,
        ClientError: From<A::Error>,
    {
        let server = server.try_into()?.with_transport(Transport::Tcp);
        self.query(qname, qtype, server, recursive)
    }

    fn query(&self, qname: &str, qtype: QueryType, server: ServerAddr, recursive: bool) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let result = self.exchange(qname, qtype, server, recursive);
        if let Err(ref e) = result {
            let _ = self.total_failed.fetch_add(1, Ordering::Release);
            debug!("Lookup of {} {} at {} failed: {}", qname, qtype, server, e);
        }

        result
    }

    fn exchange(&self, qname: &str, qtype: QueryType, server: ServerAddr, recursive: bool) -> Result<DnsPacket> {
        let question = DnsQuestion::new(validate_name(qname)?, qtype);
        let timeout = self.context.default_timeout();
        let mut request = Request::new(Arc::clone(&self.context), question, server, timeout)?;
        request.set_recursion_desired(recursive);
        request.wait()
    }
}

impl DnsClient for DnsNetworkClient {
    fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.context.stop();
    }

    /// Queries `server` over its transport, UDP unless it says otherwise
    ///
    /// With `tcp_fallback` enabled in the settings, a truncated UDP answer is
    /// followed by the same query over TCP.
    fn send_query(&self, qname: &str, qtype: QueryType, server: &str, recursive: bool) -> Result<DnsPacket> {
        let server: ServerAddr = server.parse()?;
        let packet = self.query(qname, qtype, server, recursive)?;
        if server.transport == Transport::Tcp
            || !packet.header.truncated_message
            || !self.context.settings().tcp_fallback
        {
            return Ok(packet);
        }

        info!("Truncated response - resending as TCP");
        self.query(qname, qtype, server.with_transport(Transport::Tcp), recursive)
    }
}
