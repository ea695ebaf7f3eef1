use std::borrow::Cow;
use std::fmt::Debug;

use eyre::bail;
use serde::{Deserialize, Serialize};
use serde_bytes::Bytes;

use crate::protocol::Hex;

/// Crypto hash
///
/// ```cddl
/// Hash = [
///     hashtype: int, ;; negative values possible
///     hash: bstr
/// ]
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Hash<'a> {
    pub hashtype: Hashtype,
    pub hash: Cow<'a, Bytes>,
}

impl<'a> Hash<'a> {
    pub fn new(hashtype: Hashtype, value: Vec<u8>) -> Self {
        Self {
            hashtype,
            hash: Cow::Owned(serde_bytes::ByteBuf::from(value)),
        }
    }

    pub fn into_owned(self) -> Hash<'static> {
        Hash {
            hashtype: self.hashtype,
            hash: Cow::Owned(self.hash.into_owned()),
        }
    }
}

impl Debug for Hash<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hash")
            .field("hashtype", &self.hashtype)
            .field("hash", &Hex::new(&self.hash))
            .finish()
    }
}

impl Serialize for Hash<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self { hashtype, hash } = self;

        (hashtype, hash).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Hash<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (hashtype, hash) = Deserialize::deserialize(deserializer)?;

        Ok(Self { hashtype, hash })
    }
}

/// A HMAC [RFC2104] is encoded as a hash.
///
/// ```cddl
/// HMac = Hash
/// ```
pub type HMac<'a> = Hash<'a>;

/// ```cddl
/// hashtype = (
///     SHA256: -16,
///     SHA384: -43,
///     HMAC-SHA256: 5,
///     HMAC-SHA384: 6
/// )
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
#[repr(i8)]
pub enum Hashtype {
    Sha256 = -16,
    Sha384 = -43,
    HmacSha256 = 5,
    HmacSha384 = 6,
}

impl Hashtype {
    pub fn is_hmac(&self) -> bool {
        match self {
            Hashtype::HmacSha256 | Hashtype::HmacSha384 => true,
            Hashtype::Sha256 | Hashtype::Sha384 => false,
        }
    }

    pub fn is_hash(&self) -> bool {
        !self.is_hmac()
    }

    /// The plain hash type using the same digest as this type.
    pub fn compatible_hash(&self) -> Hashtype {
        match self {
            Hashtype::Sha256 | Hashtype::HmacSha256 => Hashtype::Sha256,
            Hashtype::Sha384 | Hashtype::HmacSha384 => Hashtype::Sha384,
        }
    }
}

impl TryFrom<i8> for Hashtype {
    type Error = eyre::Report;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        let value = match value {
            -16 => Hashtype::Sha256,
            -43 => Hashtype::Sha384,
            5 => Hashtype::HmacSha256,
            6 => Hashtype::HmacSha384,
            _ => bail!("value out of range: {value}"),
        };

        Ok(value)
    }
}

impl From<Hashtype> for i8 {
    fn from(value: Hashtype) -> Self {
        value as i8
    }
}
