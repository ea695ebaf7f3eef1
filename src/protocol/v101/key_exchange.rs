use std::borrow::Cow;

use eyre::{bail, ensure, Context, OptionExt};
use serde::{Deserialize, Serialize};
use serde_bytes::Bytes;

fn parse_len_prefixed_slice(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let (blen, rest) = bytes.split_first_chunk::<2>()?;

    let len = u16::from_be_bytes(*blen);

    rest.split_at_checked(len.into())
}

fn push_len_prefixed(buf: &mut Vec<u8>, field: &[u8]) -> eyre::Result<()> {
    let len = u16::try_from(field.len()).wrap_err("field too long for 2-byte length")?;

    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(field);

    Ok(())
}

/// Key exchange from owner to device.
///
/// ```cddl
/// KeyExchange /= (
///     xAKeyExchange: bstr,
///     xBKeyExchange: bstr
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct XAKeyExchange<'a>(pub Cow<'a, Bytes>);

impl XAKeyExchange<'static> {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Cow::Owned(serde_bytes::ByteBuf::from(bytes)))
    }

    /// ECDH form: each field is prefixed with a 2-byte big-endian length.
    pub fn create_ecdh(ax: &[u8], ay: &[u8], owner_rand: &[u8]) -> eyre::Result<Self> {
        Ok(Self::from_bytes(ecdh_message(ax, ay, owner_rand)?))
    }
}

impl XAKeyExchange<'_> {
    pub fn parse_ecdh(&self) -> eyre::Result<(&[u8], &[u8], &[u8])> {
        parse_ecdh_message(self.as_ref())
    }
}

impl AsRef<[u8]> for XAKeyExchange<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Key exchange from device to owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct XBKeyExchange<'a>(pub Cow<'a, Bytes>);

impl<'a> XBKeyExchange<'a> {
    pub fn from_bytes(bytes: Vec<u8>) -> XBKeyExchange<'static> {
        XBKeyExchange(Cow::Owned(serde_bytes::ByteBuf::from(bytes)))
    }

    /// ECDH form: each field is prefixed with a 2-byte big-endian length.
    pub fn create_ecdh(bx: &[u8], by: &[u8], device_rand: &[u8]) -> eyre::Result<XBKeyExchange<'static>> {
        Ok(XBKeyExchange::from_bytes(ecdh_message(bx, by, device_rand)?))
    }

    pub fn parse_ecdh(&self) -> eyre::Result<(&[u8], &[u8], &[u8])> {
        parse_ecdh_message(self.as_ref())
    }
}

fn ecdh_message(x: &[u8], y: &[u8], rand: &[u8]) -> eyre::Result<Vec<u8>> {
    let mut buf = Vec::new();

    push_len_prefixed(&mut buf, x)?;
    push_len_prefixed(&mut buf, y)?;
    push_len_prefixed(&mut buf, rand)?;

    Ok(buf)
}

fn parse_ecdh_message(rest: &[u8]) -> eyre::Result<(&[u8], &[u8], &[u8])> {
    let (x, rest) = parse_len_prefixed_slice(rest).ok_or_eyre("couldn't parse x coordinate")?;
    let (y, rest) = parse_len_prefixed_slice(rest).ok_or_eyre("couldn't parse y coordinate")?;
    let (rand, rest) = parse_len_prefixed_slice(rest).ok_or_eyre("couldn't parse random")?;

    ensure!(rest.is_empty(), "remaining bytes in input");

    Ok((x, y, rand))
}

impl AsRef<[u8]> for XBKeyExchange<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KexSuiteName {
    Dhkexid14,
    Dhkexid15,
    Asymkex2048,
    Asymkex3072,
    Ecdh256,
    Ecdh384,
}

impl KexSuiteName {
    pub fn as_str(&self) -> &'static str {
        match self {
            KexSuiteName::Dhkexid14 => "DHKEXid14",
            KexSuiteName::Dhkexid15 => "DHKEXid15",
            KexSuiteName::Asymkex2048 => "ASYMKEX2048",
            KexSuiteName::Asymkex3072 => "ASYMKEX3072",
            KexSuiteName::Ecdh256 => "ECDH256",
            KexSuiteName::Ecdh384 => "ECDH384",
        }
    }

    pub fn parse(name: &str) -> eyre::Result<Self> {
        let suite = match name {
            "DHKEXid14" => KexSuiteName::Dhkexid14,
            "DHKEXid15" => KexSuiteName::Dhkexid15,
            "ASYMKEX2048" => KexSuiteName::Asymkex2048,
            "ASYMKEX3072" => KexSuiteName::Asymkex3072,
            "ECDH256" => KexSuiteName::Ecdh256,
            "ECDH384" => KexSuiteName::Ecdh384,
            _ => bail!("unknown key exchange suite: {name}"),
        };

        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_message_round_trip() {
        let xa = XAKeyExchange::create_ecdh(&[1; 32], &[2; 32], &[3; 16]).unwrap();

        // Same framing on both halves of the exchange.
        let xb = XBKeyExchange::from_bytes(xa.as_ref().to_vec());
        let (bx, by, rand) = xb.parse_ecdh().unwrap();

        assert_eq!(bx, &[1; 32]);
        assert_eq!(by, &[2; 32]);
        assert_eq!(rand, &[3; 16]);
    }

    #[test]
    fn truncated_ecdh_message_rejected() {
        let xa = XAKeyExchange::create_ecdh(&[1; 32], &[2; 32], &[3; 16]).unwrap();

        let mut bytes = xa.as_ref().to_vec();
        bytes.truncate(bytes.len() - 1);

        assert!(XBKeyExchange::from_bytes(bytes).parse_ecdh().is_err());
    }

    #[test]
    fn suite_names_round_trip() {
        for suite in [
            KexSuiteName::Dhkexid14,
            KexSuiteName::Dhkexid15,
            KexSuiteName::Asymkex2048,
            KexSuiteName::Asymkex3072,
            KexSuiteName::Ecdh256,
            KexSuiteName::Ecdh384,
        ] {
            assert_eq!(KexSuiteName::parse(suite.as_str()).unwrap(), suite);
        }

        assert!(KexSuiteName::parse("ECDH521").is_err());
    }
}
