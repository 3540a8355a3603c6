//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::dns::buffer::{
    escape_label, escape_text, name_labels, unescape, BufferError, PacketBuffer, VectorPacketBuffer, MAX_NAME_LEN,
};
use crate::dns::types::{self, Decoders};

/// Size of the fixed DNS header
pub const HEADER_LEN: usize = 12;

/// Largest message allowed over plain UDP without EDNS
pub const MAX_UDP_MESSAGE: usize = 512;

#[derive(Debug, Display, From, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    Buffer(BufferError),
    #[display(fmt = "rdata length does not match its contents")]
    RecordLength,
    #[display(fmt = "character string longer than 255 bytes")]
    StringTooLong,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while building a query, before anything touches the network
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[display(fmt = "unknown record type")]
    UnknownType,
    #[display(fmt = "unknown record class")]
    UnknownClass,
    #[display(fmt = "empty label in domain name")]
    EmptyLabel,
    #[display(fmt = "label longer than 63 bytes")]
    LabelTooLong,
    #[display(fmt = "domain name longer than 255 bytes")]
    NameTooLong,
    #[display(fmt = "malformed escape sequence in name")]
    BadEscape,
    #[display(fmt = "malformed server address")]
    BadServer,
    #[display(fmt = "timeout must be greater than zero")]
    ZeroTimeout,
}

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type UNKNOWN that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method. Symbolic names go through the table in `types`.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    UNKNOWN(u16),
    A,     // 1
    NS,    // 2
    CNAME, // 5
    SOA,   // 6
    PTR,   // 12
    MX,    // 15
    TXT,   // 16
    AAAA,  // 28
    SRV,   // 33
    NAPTR, // 35
    OPT,   // 41
    ANY,   // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::SRV => 33,
            QueryType::NAPTR => 35,
            QueryType::OPT => 41,
            QueryType::ANY => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            33 => QueryType::SRV,
            35 => QueryType::NAPTR,
            41 => QueryType::OPT,
            255 => QueryType::ANY,
            _ => QueryType::UNKNOWN(num),
        }
    }

    /// Case-insensitive lookup of a mnemonic such as "a" or "MX"
    pub fn from_name(name: &str) -> Option<QueryType> {
        types::code_for_name(name).map(QueryType::from_num)
    }

    pub fn name(&self) -> Option<&'static str> {
        types::name_for_code(self.to_num())
    }
}

impl FromStr for QueryType {
    type Err = ValidationError;

    /// Accepts either a mnemonic or a numeric code
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(num) = s.parse::<u16>() {
            return Ok(QueryType::from_num(num));
        }
        QueryType::from_name(s).ok_or(ValidationError::UnknownType)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "TYPE{}", self.to_num()),
        }
    }
}

/// The class of a question or record, practically always IN
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryClass {
    UNKNOWN(u16),
    IN,   // 1
    CS,   // 2
    CH,   // 3
    HS,   // 4
    NONE, // 254
    ANY,  // 255
}

impl Default for QueryClass {
    fn default() -> Self {
        QueryClass::IN
    }
}

impl QueryClass {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryClass::UNKNOWN(x) => x,
            QueryClass::IN => 1,
            QueryClass::CS => 2,
            QueryClass::CH => 3,
            QueryClass::HS => 4,
            QueryClass::NONE => 254,
            QueryClass::ANY => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryClass {
        match num {
            1 => QueryClass::IN,
            2 => QueryClass::CS,
            3 => QueryClass::CH,
            4 => QueryClass::HS,
            254 => QueryClass::NONE,
            255 => QueryClass::ANY,
            _ => QueryClass::UNKNOWN(num),
        }
    }
}

impl FromStr for QueryClass {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(num) = s.parse::<u16>() {
            return Ok(QueryClass::from_num(num));
        }
        match s.to_ascii_uppercase().as_str() {
            "IN" | "INTERNET" => Ok(QueryClass::IN),
            "CS" => Ok(QueryClass::CS),
            "CH" | "CHAOS" => Ok(QueryClass::CH),
            "HS" | "HESIOD" => Ok(QueryClass::HS),
            "NONE" => Ok(QueryClass::NONE),
            "ANY" => Ok(QueryClass::ANY),
            _ => Err(ValidationError::UnknownClass),
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueryClass::UNKNOWN(x) => write!(f, "CLASS{}", x),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Checks label and name lengths and escapes, returning the name in its
/// canonical presentation form without a trailing dot
pub fn validate_name(name: &str) -> std::result::Result<String, ValidationError> {
    let labels = name_labels(name).map_err(|e| match e {
        BufferError::LabelTooLong => ValidationError::LabelTooLong,
        BufferError::BadEscape => ValidationError::BadEscape,
        _ => ValidationError::EmptyLabel,
    })?;

    let wire_len = labels.iter().map(|label| label.len() + 1).sum::<usize>() + 1;
    if wire_len > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong);
    }

    let mut canonical = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            canonical.push('.');
        }
        escape_label(label, &mut canonical);
    }

    Ok(canonical)
}

/// Reads a length-prefixed character string, escaping bytes that are not
/// printable ASCII
pub(crate) fn read_character_string(buffer: &mut dyn PacketBuffer) -> Result<String> {
    let len = buffer.read()? as usize;
    let data = buffer.read_bytes(len)?;

    let mut text = String::with_capacity(len);
    escape_text(&data, &mut text);
    Ok(text)
}

fn write_character_string<T: PacketBuffer>(buffer: &mut T, data: &str) -> Result<()> {
    let data = unescape(data)?;
    if data.len() > 255 {
        return Err(ProtocolError::StringTooLong);
    }
    buffer.write_u8(data.len() as u8)?;
    buffer.write_bytes(&data)?;

    Ok(())
}

/// Record payload, either kept opaque or promoted to a typed shape
///
/// `OPAQUE` is what every record decodes to when promotion is off, or when no
/// decoder is registered for its type. The remaining variants are produced by
/// the decoders in `types`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordData {
    OPAQUE {
        data: Vec<u8>,
    },
    A {
        addr: Ipv4Addr,
    },
    NS {
        host: String,
    },
    CNAME {
        host: String,
    },
    SOA {
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    PTR {
        host: String,
    },
    MX {
        priority: u16,
        host: String,
    },
    TXT {
        data: Vec<String>,
    },
    AAAA {
        addr: Ipv6Addr,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
    },
    NAPTR {
        order: u16,
        preference: u16,
        flags: String,
        services: String,
        regexp: String,
        replacement: String,
    },
}

impl RecordData {
    /// The type this payload belongs to, `None` for opaque data
    pub fn get_querytype(&self) -> Option<QueryType> {
        match *self {
            RecordData::OPAQUE { .. } => None,
            RecordData::A { .. } => Some(QueryType::A),
            RecordData::NS { .. } => Some(QueryType::NS),
            RecordData::CNAME { .. } => Some(QueryType::CNAME),
            RecordData::SOA { .. } => Some(QueryType::SOA),
            RecordData::PTR { .. } => Some(QueryType::PTR),
            RecordData::MX { .. } => Some(QueryType::MX),
            RecordData::TXT { .. } => Some(QueryType::TXT),
            RecordData::AAAA { .. } => Some(QueryType::AAAA),
            RecordData::SRV { .. } => Some(QueryType::SRV),
            RecordData::NAPTR { .. } => Some(QueryType::NAPTR),
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        match *self {
            RecordData::OPAQUE { ref data } => buffer.write_bytes(data)?,
            RecordData::A { ref addr } => buffer.write_bytes(&addr.octets())?,
            RecordData::AAAA { ref addr } => buffer.write_bytes(&addr.octets())?,
            RecordData::NS { ref host }
            | RecordData::CNAME { ref host }
            | RecordData::PTR { ref host } => buffer.write_qname(host)?,
            RecordData::MX { priority, ref host } => {
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
            }
            RecordData::TXT { ref data } => {
                for part in data {
                    write_character_string(buffer, part)?;
                }
            }
            RecordData::SOA {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
            }
            RecordData::SRV {
                priority,
                weight,
                port,
                ref host,
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname_plain(host)?;
            }
            RecordData::NAPTR {
                order,
                preference,
                ref flags,
                ref services,
                ref regexp,
                ref replacement,
            } => {
                buffer.write_u16(order)?;
                buffer.write_u16(preference)?;
                write_character_string(buffer, flags)?;
                write_character_string(buffer, services)?;
                write_character_string(buffer, regexp)?;
                buffer.write_qname_plain(replacement)?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            // RFC 3597 notation for data of unknown type
            RecordData::OPAQUE { ref data } => {
                write!(f, "\\# {}", data.len())?;
                if !data.is_empty() {
                    write!(f, " ")?;
                    for b in data {
                        write!(f, "{:02x}", b)?;
                    }
                }
                Ok(())
            }
            RecordData::A { ref addr } => write!(f, "{}", addr),
            RecordData::AAAA { ref addr } => write!(f, "{}", addr),
            RecordData::NS { ref host }
            | RecordData::CNAME { ref host }
            | RecordData::PTR { ref host } => write!(f, "{}.", host),
            RecordData::MX { priority, ref host } => write!(f, "{} {}.", priority, host),
            RecordData::TXT { ref data } => {
                let quoted = data.iter().map(|x| format!("\"{}\"", x)).collect::<Vec<_>>();
                write!(f, "{}", quoted.join(" "))
            }
            RecordData::SOA {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(f, "{}. {}. {} {} {} {} {}", m_name, r_name, serial, refresh, retry, expire, minimum),
            RecordData::SRV {
                priority,
                weight,
                port,
                ref host,
            } => write!(f, "{} {} {} {}.", priority, weight, port, host),
            RecordData::NAPTR {
                order,
                preference,
                ref flags,
                ref services,
                ref regexp,
                ref replacement,
            } => write!(f, "{} {} \"{}\" \"{}\" \"{}\" {}.", order, preference, flags, services, regexp, replacement),
        }
    }
}

/// `DnsRecord` is the primary representation of a DNS resource record
///
/// The common fields are always decoded. The payload is either opaque bytes
/// or, when promotion is enabled and a decoder is registered for `qtype`, one
/// of the typed `RecordData` variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    pub domain: String,
    pub qtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    /// Builds an IN record, taking the type from the payload
    ///
    /// Opaque payloads carry no type and are refused with `UnknownType`;
    /// `DnsRecord::opaque` builds those.
    pub fn new(domain: &str, ttl: u32, data: RecordData) -> std::result::Result<DnsRecord, ValidationError> {
        let qtype = data.get_querytype().ok_or(ValidationError::UnknownType)?;
        Ok(DnsRecord {
            domain: domain.to_string(),
            qtype: qtype.to_num(),
            class: QueryClass::IN.to_num(),
            ttl,
            data,
        })
    }

    pub fn opaque(domain: &str, qtype: QueryType, ttl: u32, data: Vec<u8>) -> DnsRecord {
        DnsRecord {
            domain: domain.to_string(),
            qtype: qtype.to_num(),
            class: QueryClass::IN.to_num(),
            ttl,
            data: RecordData::OPAQUE { data },
        }
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T, decoders: Option<&Decoders>) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype = buffer.read_u16()?;
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        let start = buffer.pos();
        let data = match decoders.and_then(|d| d.get(&qtype)) {
            Some(decode) => {
                // The declared rdata has to be present in full
                buffer.get_range(start, data_len as usize)?;
                let data = decode(buffer, data_len)?;
                if buffer.pos() != start + data_len as usize {
                    return Err(ProtocolError::RecordLength);
                }
                data
            }
            None => RecordData::OPAQUE {
                data: buffer.read_bytes(data_len as usize)?,
            },
        };

        Ok(DnsRecord {
            domain,
            qtype,
            class,
            ttl,
            data,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.domain)?;
        buffer.write_u16(self.qtype)?;
        buffer.write_u16(self.class)?;
        buffer.write_u32(self.ttl)?;

        let pos = buffer.pos();
        buffer.write_u16(0)?;

        self.data.write(buffer)?;

        let size = buffer.pos() - (pos + 2);
        buffer.set_u16(pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        QueryType::from_num(self.qtype)
    }

    /// Whether the payload was promoted to a type specific shape
    pub fn is_promoted(&self) -> bool {
        !matches!(self.data, RecordData::OPAQUE { .. })
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.\t{}\t{}\t{}\t{}",
            self.domain,
            self.ttl,
            QueryClass::from_num(self.class),
            self.get_querytype(),
            self.data
        )
    }
}

/// The result code for a DNS query, as described in RFC 1035 and RFC 2136
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultCode {
    NOERROR,
    FORMERR,
    SERVFAIL,
    NXDOMAIN,
    NOTIMP,
    REFUSED,
    YXDOMAIN,
    YXRRSET,
    NXRRSET,
    NOTAUTH,
    NOTZONE,
    UNKNOWN(u8),
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::NOERROR
    }
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            6 => ResultCode::YXDOMAIN,
            7 => ResultCode::YXRRSET,
            8 => ResultCode::NXRRSET,
            9 => ResultCode::NOTAUTH,
            10 => ResultCode::NOTZONE,
            _ => ResultCode::UNKNOWN(num),
        }
    }

    pub fn to_num(&self) -> u8 {
        match *self {
            ResultCode::NOERROR => 0,
            ResultCode::FORMERR => 1,
            ResultCode::SERVFAIL => 2,
            ResultCode::NXDOMAIN => 3,
            ResultCode::NOTIMP => 4,
            ResultCode::REFUSED => 5,
            ResultCode::YXDOMAIN => 6,
            ResultCode::YXRRSET => 7,
            ResultCode::NXRRSET => 8,
            ResultCode::NOTAUTH => 9,
            ResultCode::NOTZONE => 10,
            ResultCode::UNKNOWN(x) => x & 0x0F,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            self.rescode.to_num()
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn binary_len(&self) -> usize {
        HEADER_LEN
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            ";; opcode: {}, status: {:?}, id: {}",
            self.opcode, self.rescode, self.id
        )?;

        let mut flags = Vec::new();
        for (set, name) in [
            (self.response, "qr"),
            (self.authoritative_answer, "aa"),
            (self.truncated_message, "tc"),
            (self.recursion_desired, "rd"),
            (self.recursion_available, "ra"),
            (self.authed_data, "ad"),
            (self.checking_disabled, "cd"),
        ] {
            if set {
                flags.push(name);
            }
        }
        write!(
            f,
            ";; flags: {}; QUERY: {}, ANSWER: {}, AUTHORITY: {}, ADDITIONAL: {}",
            flags.join(" "),
            self.questions,
            self.answers,
            self.authoritative_entries,
            self.resource_entries
        )
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: QueryClass,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: QueryClass::IN,
        }
    }

    /// Builds a validated question from user input
    ///
    /// `qtype` is a mnemonic in any case ("a", "MX") or a numeric code.
    pub fn parse(name: &str, qtype: &str) -> std::result::Result<DnsQuestion, ValidationError> {
        let name = validate_name(name)?;
        let qtype = qtype.parse::<QueryType>()?;

        Ok(DnsQuestion::new(name, qtype))
    }

    pub fn with_class(mut self, qclass: QueryClass) -> DnsQuestion {
        self.qclass = qclass;
        self
    }

    pub fn binary_len(&self) -> usize {
        let name_len = match self.name.is_empty() {
            true => 1,
            false => self.name.split('.').map(|x| x.len() + 1).sum::<usize>() + 1,
        };
        name_len + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass.to_num())?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = QueryClass::from_num(buffer.read_u16()?);

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.\t\t{}\t{}", self.name, self.qclass, self.qtype)
    }
}

/// Representation of a complete DNS packet
///
/// A DNS packet can be read and written in a single operation. Reading with a
/// set of decoders promotes every record whose type has one; reading without
/// leaves all payloads opaque.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// Builds a single question query
    pub fn query(question: DnsQuestion, recursive: bool) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.recursion_desired = recursive;
        packet.header.questions = 1;
        packet.questions.push(question);
        packet
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        DnsPacket::from_buffer_with(buffer, None)
    }

    pub fn from_buffer_with<T: PacketBuffer>(buffer: &mut T, decoders: Option<&Decoders>) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::UNKNOWN(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer, decoders)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer, decoders)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer, decoders)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// Decodes a message from raw wire bytes
    pub fn parse(data: &[u8], decoders: Option<&Decoders>) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(data);
        DnsPacket::from_buffer_with(&mut buffer, decoders)
    }

    /// Serializes the packet, dropping trailing records and setting the
    /// truncation flag when the result would not fit into `max_size`
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();
        test_buffer.write_bytes(&[0; HEADER_LEN])?;

        for question in &self.questions {
            question.write(&mut test_buffer)?;
        }

        let total = self.answers.len() + self.authorities.len() + self.resources.len();
        let mut record_count = 0;
        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            rec.write(&mut test_buffer)?;
            if test_buffer.pos() > max_size {
                break;
            }
            record_count += 1;
        }

        if record_count < total {
            self.header.truncated_message = true;
        }

        let answers = record_count.min(self.answers.len());
        let authorities = (record_count - answers).min(self.authorities.len());
        let resources = record_count - answers - authorities;

        self.header.questions = self.questions.len() as u16;
        self.header.answers = answers as u16;
        self.header.authoritative_entries = authorities as u16;
        self.header.resource_entries = resources as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }

    /// Encodes the packet into a fresh byte vector
    pub fn to_bytes(&mut self, max_size: usize) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer, max_size)?;

        Ok(buffer.buffer)
    }
}

impl fmt::Display for DnsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;

        let sections = [
            ("QUESTION", None),
            ("ANSWER", Some(&self.answers)),
            ("AUTHORITY", Some(&self.authorities)),
            ("ADDITIONAL", Some(&self.resources)),
        ];
        for (title, records) in sections.iter() {
            match records {
                None => {
                    writeln!(f, "\n;; {} SECTION:", title)?;
                    for q in &self.questions {
                        writeln!(f, ";{}", q)?;
                    }
                }
                Some(records) if !records.is_empty() => {
                    writeln!(f, "\n;; {} SECTION:", title)?;
                    for rec in records.iter() {
                        writeln!(f, "{}", rec)?;
                    }
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}
