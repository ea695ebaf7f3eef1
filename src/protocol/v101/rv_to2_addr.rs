use serde::{Deserialize, Serialize};

use super::{DnsAddress, IpAddress, Port, TransportProtocol};

/// Owner addresses delivered through the rendezvous redirect.
///
/// ```cddl
/// RVTO2Addr = [ + RVTO2AddrEntry ]
/// ```
pub type RvTo2Addr<'a> = Vec<RvTo2AddrEntry<'a>>;

/// ```cddl
/// RVTO2AddrEntry = [
///     RVIP:       IPAddress / null,
///     RVDNS:      DNSAddress / null,
///     RVPort:     Port,
///     RVProtocol: TransportProtocol
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RvTo2AddrEntry<'a> {
    pub rv_ip: Option<IpAddress>,
    pub rv_dns: Option<DnsAddress<'a>>,
    pub rv_port: Port,
    pub rv_protocol: TransportProtocol,
}

impl Serialize for RvTo2AddrEntry<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            rv_ip,
            rv_dns,
            rv_port,
            rv_protocol,
        } = self;

        (rv_ip, rv_dns, rv_port, rv_protocol).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RvTo2AddrEntry<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (rv_ip, rv_dns, rv_port, rv_protocol) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            rv_ip,
            rv_dns,
            rv_port,
            rv_protocol,
        })
    }
}
