use std::borrow::Cow;
use std::fmt::{Debug, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Deref;

use eyre::bail;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteArray;

use super::Hex;

pub mod eat_signature;
pub mod error;
pub mod hash_hmac;
pub mod ownership_voucher;
pub mod key_exchange;
pub mod public_key;
pub mod randezvous_info;
pub mod rv_to2_addr;
pub mod service_info;
pub mod sign_info;
pub mod x509;

pub mod to1;
pub mod to2;

// Type names used in the specification
pub type Protver = u16;
pub type Msgtype = u16;

pub const PROTOCOL_VERSION_MAJOR: Protver = 1;
pub const PROTOCOL_VERSION_MINOR: Protver = 1;
pub const PROTOCOL_VERSION: Protver = PROTOCOL_VERSION_MAJOR * 100 + PROTOCOL_VERSION_MINOR;

pub trait Message: Sized {
    const MSG_TYPE: Msgtype;

    fn decode(buf: &[u8]) -> eyre::Result<Self>;

    fn encode(&self) -> eyre::Result<Vec<u8>>;
}

/// Message sent from the device to the server.
pub trait ClientMessage: Message {
    type Response<'a>: Message;
}

/// Initial message in a protocol (TO1 or TO2).
///
/// This message doesn't require an established session.
pub trait InitialMessage: ClientMessage {}

/// Guid is implemented as a 128-bit cryptographically strong random number.
///
/// The Guid type identifies a Device during onboarding, and is replaced each
/// time onboarding is successful in the Transfer Ownership 2 (TO2) protocol.
///
/// ```cddl
/// Guid = bstr .size 16
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid(ByteArray<16>);

impl Guid {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(ByteArray::new(bytes))
    }

    /// EAT UEID claim form: a type byte of 1 (EAT-RAND) followed by the guid.
    pub fn as_ueid(&self) -> [u8; 17] {
        let mut ueid = [0u8; 17];
        ueid[0] = 1;
        ueid[1..].copy_from_slice(self.0.as_slice());

        ueid
    }

    pub fn from_ueid(ueid: &[u8]) -> eyre::Result<Self> {
        let [1, guid @ ..] = ueid else {
            bail!("invalid UEID, expected EAT-RAND type byte");
        };

        let guid: [u8; 16] = guid.try_into()?;

        Ok(Self::new(guid))
    }
}

impl Deref for Guid {
    type Target = ByteArray<16>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Guid")
            .field(&Hex::new(self.0.as_slice()))
            .finish()
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&Hex::new(self.0.as_slice()), f)
    }
}

/// ```cddl
/// IPAddress = ip4 / ip6
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpAddress {
    Ipv4(Ipv4),
    Ipv6(Ip6),
}

impl From<IpAddress> for IpAddr {
    fn from(value: IpAddress) -> Self {
        match value {
            IpAddress::Ipv4(byte_array) => {
                let bits = u32::from_be_bytes(byte_array.into_array());

                IpAddr::V4(Ipv4Addr::from_bits(bits))
            }
            IpAddress::Ipv6(byte_array) => {
                let bits = u128::from_be_bytes(byte_array.into_array());

                IpAddr::V6(Ipv6Addr::from_bits(bits))
            }
        }
    }
}

/// ```cddl
/// ip4 = bstr .size 4
/// ```
pub type Ipv4 = ByteArray<4>;

/// ```cddl
/// ip6 = bstr .size 16
/// ```
pub type Ip6 = ByteArray<16>;

/// ```cddl
/// DNSAddress = tstr
/// ```
pub type DnsAddress<'a> = Cow<'a, str>;

/// ```cddl
/// Port = uint16
/// ```
pub type Port = u16;

/// ``` cddl
/// TransportProtocol /= (
///     ProtTCP:    1,     ;; bare TCP stream
///     ProtTLS:    2,     ;; bare TLS stream
///     ProtHTTP:   3,
///     ProtCoAP:   4,
///     ProtHTTPS:  5,
///     ProtCoAPS:  6,
/// )
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TransportProtocol {
    ProtTcp = 1,
    ProtTls = 2,
    ProtHttp = 3,
    ProtCoAp = 4,
    ProtHttps = 5,
    ProtCoAps = 6,
}

impl TryFrom<u8> for TransportProtocol {
    type Error = eyre::Report;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let value = match value {
            1 => TransportProtocol::ProtTcp,
            2 => TransportProtocol::ProtTls,
            3 => TransportProtocol::ProtHttp,
            4 => TransportProtocol::ProtCoAp,
            5 => TransportProtocol::ProtHttps,
            6 => TransportProtocol::ProtCoAps,
            _ => bail!("value out of range: {value}"),
        };

        Ok(value)
    }
}

impl From<TransportProtocol> for u8 {
    fn from(value: TransportProtocol) -> Self {
        value as u8
    }
}

/// The protocol keeps several nonces in play during the
/// authentication phase.  Nonces are named in the spec, to make it
/// easier to see where the protocol requires the same nonce value.
///
/// ```cddl
/// Nonce = bstr .size 16
/// ```
pub type Nonce = ByteArray<16>;

/// ```cddl
/// NonceTO1Proof = Nonce
/// ```
pub type NonceTo1Proof = Nonce;

/// ```cddl
/// NonceTO2ProveOV = Nonce
/// ```
pub type NonceTo2ProveOv = Nonce;

/// ```cddl
/// NonceTO2ProveDv = Nonce
/// ```
pub type NonceTo2ProveDv = Nonce;

/// ```cddl
/// NonceTO2SetupDv = Nonce
/// ```
pub type NonceTo2SetupDv = Nonce;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ueid_round_trip() {
        let guid = Guid::new([7; 16]);

        let ueid = guid.as_ueid();
        assert_eq!(ueid[0], 1);
        assert_eq!(Guid::from_ueid(&ueid).unwrap(), guid);
    }

    #[test]
    fn ueid_rejects_wrong_type_byte() {
        let mut ueid = Guid::new([7; 16]).as_ueid();
        ueid[0] = 2;

        assert!(Guid::from_ueid(&ueid).is_err());
    }
}
