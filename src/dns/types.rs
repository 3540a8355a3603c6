//! record type registry: mnemonic table and pluggable rdata decoders

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{PoisonError, RwLock};

#[allow(unused_imports)]
use log::{debug, trace};

use crate::dns::buffer::PacketBuffer;
use crate::dns::protocol::{read_character_string, ProtocolError, QueryType, RecordData};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Decodes the rdata of one record
///
/// The buffer is positioned at the start of the rdata, and the decoder must
/// consume exactly `data_len` bytes. Names inside the rdata may use
/// compression pointers into the rest of the message.
pub type RecordDecoder = fn(&mut dyn PacketBuffer, u16) -> Result<RecordData>;

/// A point-in-time copy of the registry, used for decoding a single message
pub type Decoders = HashMap<u16, RecordDecoder>;

/// Mnemonics of the IANA resource record types
const TYPE_NAMES: &[(&str, u16)] = &[
    ("A", 1),
    ("NS", 2),
    ("MD", 3),
    ("MF", 4),
    ("CNAME", 5),
    ("SOA", 6),
    ("MB", 7),
    ("MG", 8),
    ("MR", 9),
    ("NULL", 10),
    ("WKS", 11),
    ("PTR", 12),
    ("HINFO", 13),
    ("MINFO", 14),
    ("MX", 15),
    ("TXT", 16),
    ("RP", 17),
    ("AFSDB", 18),
    ("X25", 19),
    ("ISDN", 20),
    ("RT", 21),
    ("NSAP", 22),
    ("NSAP-PTR", 23),
    ("SIG", 24),
    ("KEY", 25),
    ("PX", 26),
    ("GPOS", 27),
    ("AAAA", 28),
    ("LOC", 29),
    ("NXT", 30),
    ("EID", 31),
    ("NIMLOC", 32),
    ("SRV", 33),
    ("ATMA", 34),
    ("NAPTR", 35),
    ("KX", 36),
    ("CERT", 37),
    ("A6", 38),
    ("DNAME", 39),
    ("SINK", 40),
    ("OPT", 41),
    ("APL", 42),
    ("DS", 43),
    ("SSHFP", 44),
    ("IPSECKEY", 45),
    ("RRSIG", 46),
    ("NSEC", 47),
    ("DNSKEY", 48),
    ("DHCID", 49),
    ("NSEC3", 50),
    ("NSEC3PARAM", 51),
    ("TLSA", 52),
    ("SMIMEA", 53),
    ("HIP", 55),
    ("NINFO", 56),
    ("RKEY", 57),
    ("TALINK", 58),
    ("CDS", 59),
    ("CDNSKEY", 60),
    ("OPENPGPKEY", 61),
    ("CSYNC", 62),
    ("ZONEMD", 63),
    ("SVCB", 64),
    ("HTTPS", 65),
    ("SPF", 99),
    ("UINFO", 100),
    ("UID", 101),
    ("GID", 102),
    ("UNSPEC", 103),
    ("NID", 104),
    ("L32", 105),
    ("L64", 106),
    ("LP", 107),
    ("EUI48", 108),
    ("EUI64", 109),
    ("TKEY", 249),
    ("TSIG", 250),
    ("IXFR", 251),
    ("AXFR", 252),
    ("MAILB", 253),
    ("MAILA", 254),
    ("ANY", 255),
    ("URI", 256),
    ("CAA", 257),
    ("AVC", 258),
    ("TA", 32768),
    ("DLV", 32769),
];

/// Resolves a mnemonic, ignoring case. "*" is accepted for ANY.
pub fn code_for_name(name: &str) -> Option<u16> {
    if name == "*" {
        return Some(255);
    }
    TYPE_NAMES
        .iter()
        .find(|(mnemonic, _)| mnemonic.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
}

pub fn name_for_code(code: u16) -> Option<&'static str> {
    TYPE_NAMES.iter().find(|(_, c)| *c == code).map(|(name, _)| *name)
}

/// Maps record types to the decoders that promote their payload
///
/// Registration replaces any decoder previously stored for the same type.
/// Readers take a `snapshot` so that one message is always decoded against a
/// consistent set of decoders, even while another thread registers new ones.
pub struct TypeRegistry {
    decoders: RwLock<Decoders>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

impl TypeRegistry {
    /// Creates a registry preloaded with the built-in decoders
    pub fn new() -> TypeRegistry {
        let registry = TypeRegistry::empty();
        registry.register(QueryType::A, read_a);
        registry.register(QueryType::NS, read_ns);
        registry.register(QueryType::CNAME, read_cname);
        registry.register(QueryType::SOA, read_soa);
        registry.register(QueryType::PTR, read_ptr);
        registry.register(QueryType::MX, read_mx);
        registry.register(QueryType::TXT, read_txt);
        registry.register(QueryType::AAAA, read_aaaa);
        registry.register(QueryType::SRV, read_srv);
        registry.register(QueryType::NAPTR, read_naptr);
        registry
    }

    pub fn empty() -> TypeRegistry {
        TypeRegistry {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, qtype: QueryType, decoder: RecordDecoder) {
        let mut decoders = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        if decoders.insert(qtype.to_num(), decoder).is_some() {
            debug!("Replaced decoder for {}", qtype);
        } else {
            trace!("Registered decoder for {}", qtype);
        }
    }

    pub fn unregister(&self, qtype: QueryType) -> bool {
        let mut decoders = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        decoders.remove(&qtype.to_num()).is_some()
    }

    pub fn lookup(&self, qtype: QueryType) -> Option<RecordDecoder> {
        let decoders = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        decoders.get(&qtype.to_num()).cloned()
    }

    /// Looks a decoder up by mnemonic, e.g. "mx"
    pub fn lookup_name(&self, name: &str) -> Option<RecordDecoder> {
        QueryType::from_name(name).and_then(|qtype| self.lookup(qtype))
    }

    pub fn is_registered(&self, qtype: QueryType) -> bool {
        self.lookup(qtype).is_some()
    }

    pub fn snapshot(&self) -> Decoders {
        self.decoders.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn read_host(buffer: &mut dyn PacketBuffer) -> Result<String> {
    let mut host = String::new();
    buffer.read_qname(&mut host)?;

    Ok(host)
}

fn read_a(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let addr = Ipv4Addr::from(buffer.read_u32()?);

    Ok(RecordData::A { addr })
}

fn read_aaaa(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let mut raw_addr = 0u128;
    for _ in 0..4 {
        raw_addr = (raw_addr << 32) | buffer.read_u32()? as u128;
    }

    Ok(RecordData::AAAA {
        addr: Ipv6Addr::from(raw_addr),
    })
}

fn read_ns(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    Ok(RecordData::NS { host: read_host(buffer)? })
}

fn read_cname(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    Ok(RecordData::CNAME { host: read_host(buffer)? })
}

fn read_ptr(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    Ok(RecordData::PTR { host: read_host(buffer)? })
}

fn read_mx(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let priority = buffer.read_u16()?;
    let host = read_host(buffer)?;

    Ok(RecordData::MX { priority, host })
}

fn read_txt(buffer: &mut dyn PacketBuffer, data_len: u16) -> Result<RecordData> {
    let end = buffer.pos() + data_len as usize;
    let mut data = Vec::new();
    while buffer.pos() < end {
        data.push(read_character_string(buffer)?);
    }

    Ok(RecordData::TXT { data })
}

fn read_soa(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let m_name = read_host(buffer)?;
    let r_name = read_host(buffer)?;

    Ok(RecordData::SOA {
        m_name,
        r_name,
        serial: buffer.read_u32()?,
        refresh: buffer.read_u32()?,
        retry: buffer.read_u32()?,
        expire: buffer.read_u32()?,
        minimum: buffer.read_u32()?,
    })
}

fn read_srv(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let priority = buffer.read_u16()?;
    let weight = buffer.read_u16()?;
    let port = buffer.read_u16()?;
    let host = read_host(buffer)?;

    Ok(RecordData::SRV {
        priority,
        weight,
        port,
        host,
    })
}

fn read_naptr(buffer: &mut dyn PacketBuffer, _: u16) -> Result<RecordData> {
    let order = buffer.read_u16()?;
    let preference = buffer.read_u16()?;
    let flags = read_character_string(buffer)?;
    let services = read_character_string(buffer)?;
    let regexp = read_character_string(buffer)?;
    let replacement = read_host(buffer)?;

    Ok(RecordData::NAPTR {
        order,
        preference,
        flags,
        services,
        regexp,
        replacement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsPacket, DnsRecord};

    // SPF shares the TXT wire format
    fn read_spf(buffer: &mut dyn PacketBuffer, data_len: u16) -> Result<RecordData> {
        read_txt(buffer, data_len)
    }

    #[test]
    fn test_name_table() {
        assert_eq!(Some(1), code_for_name("a"));
        assert_eq!(Some(15), code_for_name("MX"));
        assert_eq!(Some(23), code_for_name("nsap-ptr"));
        assert_eq!(Some(255), code_for_name("*"));
        assert_eq!(None, code_for_name("nothing"));
        assert_eq!(Some("AAAA"), name_for_code(28));
        assert_eq!(None, name_for_code(65000));

        for (name, code) in TYPE_NAMES {
            assert_eq!(Some(*code), code_for_name(name));
            assert_eq!(Some(*name), name_for_code(*code));
        }
    }

    #[test]
    fn test_builtin_decoders() {
        let registry = TypeRegistry::new();
        for qtype in [
            QueryType::A,
            QueryType::AAAA,
            QueryType::NS,
            QueryType::CNAME,
            QueryType::PTR,
            QueryType::MX,
            QueryType::TXT,
            QueryType::SOA,
            QueryType::SRV,
            QueryType::NAPTR,
        ] {
            assert!(registry.is_registered(qtype), "{} has no decoder", qtype);
        }
        assert!(!registry.is_registered(QueryType::OPT));
        assert!(registry.lookup_name("mx").is_some());
        assert!(registry.lookup_name("caa").is_none());
        assert!(registry.lookup_name("bogus").is_none());
    }

    #[test]
    fn test_register_and_replace() {
        let registry = TypeRegistry::empty();
        let spf = QueryType::from_name("spf").unwrap();

        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::opaque("example.org", spf, 60, b"\x0bv=spf1 -all".to_vec()));
        let data = packet.to_bytes(0xFFFF).unwrap();

        let parsed = DnsPacket::parse(&data, Some(&registry.snapshot())).unwrap();
        assert!(!parsed.answers[0].is_promoted());

        registry.register(spf, read_spf);
        let parsed = DnsPacket::parse(&data, Some(&registry.snapshot())).unwrap();
        assert_eq!(
            RecordData::TXT { data: vec!["v=spf1 -all".to_string()] },
            parsed.answers[0].data
        );
        assert_eq!(99, parsed.answers[0].qtype);

        // A second registration replaces the first one
        registry.register(spf, |buffer, data_len| {
            Ok(RecordData::OPAQUE { data: buffer.read_bytes(data_len as usize)? })
        });
        let parsed = DnsPacket::parse(&data, Some(&registry.snapshot())).unwrap();
        assert_eq!(
            RecordData::OPAQUE { data: b"\x0bv=spf1 -all".to_vec() },
            parsed.answers[0].data
        );

        assert!(registry.unregister(spf));
        assert!(!registry.unregister(spf));
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let registry = TypeRegistry::new();
        let snapshot = registry.snapshot();
        registry.unregister(QueryType::A);

        assert!(snapshot.contains_key(&1));
        assert!(!registry.is_registered(QueryType::A));
    }
}
