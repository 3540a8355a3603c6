pub use crate::dns::client::{ClientError, DnsClient, DnsNetworkClient};
pub use crate::dns::context::DnsContext;
pub use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, RecordData};
pub use crate::dns::request::{Request, RequestEvent, RequestState};
pub use crate::dns::transport::{ServerAddr, Transport};
pub use crate::settings::Settings;

pub mod dns;
pub mod settings;
