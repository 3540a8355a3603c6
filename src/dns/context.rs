//! The `DnsContext` holds the state shared by all requests sent through it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::{debug, info};

use crate::dns::dispatch::Dispatcher;
use crate::dns::pending::PendingQueries;
use crate::dns::protocol::{DnsPacket, ProtocolError};
use crate::dns::transport::UdpTransport;
use crate::dns::types::TypeRegistry;
use crate::settings::Settings;

lazy_static! {
    static ref SHARED_CONTEXT: Arc<DnsContext> = Arc::new(DnsContext::new(Settings::default()));
}

/// Resolver context: record type registry, promotion switch, pending query
/// table, UDP sockets and the dispatcher watching sent requests
///
/// Requests created from the same context share its socket and its id space.
/// Separate contexts are fully isolated from each other, which is what tests
/// use; everything else can simply use `DnsContext::shared()`.
pub struct DnsContext {
    settings: Settings,
    registry: TypeRegistry,
    promote: AtomicBool,
    pending: Arc<PendingQueries>,
    udp: UdpTransport,
    dispatcher: Dispatcher,
}

impl DnsContext {
    pub fn new(settings: Settings) -> DnsContext {
        DnsContext::with_pending(settings, PendingQueries::new())
    }

    /// Creates a context around a prepared pending table, e.g. one with a
    /// custom id source
    pub fn with_pending(settings: Settings, pending: PendingQueries) -> DnsContext {
        let pending = Arc::new(pending);
        let udp = UdpTransport::new(Arc::clone(&pending), settings.udp_port_v4, settings.udp_port_v6);

        DnsContext {
            promote: AtomicBool::new(settings.promote),
            registry: TypeRegistry::new(),
            pending,
            udp,
            dispatcher: Dispatcher::new(),
            settings,
        }
    }

    /// The process-wide default context
    pub fn shared() -> Arc<DnsContext> {
        Arc::clone(&SHARED_CONTEXT)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingQueries {
        &self.pending
    }

    pub fn udp(&self) -> &UdpTransport {
        &self.udp
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Switches promotion of decoded records on or off for every request of
    /// this context, including those already in flight
    pub fn set_promote(&self, promote: bool) {
        let previous = self.promote.swap(promote, Ordering::SeqCst);
        if previous != promote {
            debug!("Record promotion {}", if promote { "enabled" } else { "disabled" });
        }
    }

    pub fn promote(&self) -> bool {
        self.promote.load(Ordering::SeqCst)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout)
    }

    /// Decodes a response, promoting records if the switch is on
    ///
    /// The switch and the registry are read once, so the whole message is
    /// decoded against one consistent snapshot.
    pub fn decode(&self, data: &[u8]) -> Result<DnsPacket, ProtocolError> {
        let decoders = match self.promote() {
            true => Some(self.registry.snapshot()),
            false => None,
        };
        DnsPacket::parse(data, decoders.as_ref())
    }

    /// Stops the UDP receiver threads and refuses new requests
    ///
    /// Requests already sent still end with a `Timeout` at the latest.
    pub fn stop(&self) {
        info!("Stopping DNS context");
        self.dispatcher.stop();
        self.udp.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::dns::protocol::{DnsQuestion, DnsRecord, QueryType, RecordData};

    fn response() -> Vec<u8> {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.questions.push(DnsQuestion::new("www.google.com".to_string(), QueryType::A));
        packet.answers.push(DnsRecord::new(
            "www.google.com",
            300,
            RecordData::CNAME { host: "www.l.google.com".to_string() },
        ).unwrap());
        packet.answers.push(DnsRecord::new(
            "www.l.google.com",
            300,
            RecordData::A { addr: Ipv4Addr::new(142, 250, 74, 36) },
        ).unwrap());
        packet.to_bytes(0xFFFF).unwrap()
    }

    #[test]
    fn test_promotion_toggle() {
        let context = DnsContext::new(Settings::default());
        let data = response();

        assert!(!context.promote());
        let packet = context.decode(&data).unwrap();
        assert_eq!(2, packet.answers.len());
        assert!(packet.answers.iter().all(|r| !r.is_promoted()));

        context.set_promote(true);
        let packet = context.decode(&data).unwrap();
        for answer in &packet.answers {
            assert!(answer.is_promoted());
            assert_eq!(answer.data.get_querytype(), Some(answer.get_querytype()));
        }

        // Types without a decoder stay opaque even with promotion on
        context.registry().unregister(QueryType::CNAME);
        let packet = context.decode(&data).unwrap();
        assert!(!packet.answers[0].is_promoted());
        assert!(packet.answers[1].is_promoted());
    }

    #[test]
    fn test_contexts_are_isolated() {
        let first = DnsContext::new(Settings::default());
        let second = DnsContext::new(Settings {
            promote: true,
            ..Settings::default()
        });

        first.set_promote(false);
        assert!(second.promote());
        first.registry().unregister(QueryType::A);
        assert!(second.registry().is_registered(QueryType::A));
    }

    #[test]
    fn test_shared_context() {
        let a = DnsContext::shared();
        let b = DnsContext::shared();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Duration::from_millis(Settings::default().timeout), a.default_timeout());
    }
}
