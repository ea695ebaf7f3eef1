use std::fmt::{Debug, Display};
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf, Bytes};

pub use self::v101 as latest;
pub mod v101;

pub mod dispatch;
pub mod to1;
pub mod to2;

/// Wrapper for a `bstr .cbor` field: the inner value travels as a byte
/// string holding its own CBOR encoding.
///
/// The original encoded bytes are kept on decode so hashes computed over the
/// field cover the exact wire bytes, not a re-serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct CborBstr<T> {
    value: T,
    bytes: Vec<u8>,
}

impl<T> CborBstr<T>
where
    T: Serialize,
{
    pub fn new(value: T) -> eyre::Result<Self> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes)?;

        Ok(Self { value, bytes })
    }
}

impl<T> CborBstr<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The encoding that travels on the wire, without the bstr wrapping.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> Serialize for CborBstr<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Bytes::new(&self.bytes).serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for CborBstr<T>
where
    T: for<'a> Deserialize<'a>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = ByteBuf::deserialize(deserializer)?;

        let value = ciborium::from_reader(bytes.as_slice()).map_err(serde::de::Error::custom)?;

        Ok(Self {
            value,
            bytes: bytes.into_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OneOrMore<T>(Vec<T>);

impl<T> OneOrMore<T> {
    pub fn new(values: Vec<T>) -> eyre::Result<Self> {
        eyre::ensure!(!values.is_empty(), "expected one or more values");

        Ok(Self(values))
    }
}

impl<T> Deref for OneOrMore<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> Serialize for OneOrMore<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for OneOrMore<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let values = Vec::deserialize(deserializer)?;

        if values.is_empty() {
            return Err(serde::de::Error::invalid_length(0, &"one or more"));
        }

        Ok(Self(values))
    }
}

pub(crate) struct Hex<'a>(&'a [u8]);

impl<'a> Hex<'a> {
    pub(crate) fn new(items: &'a [u8]) -> Self {
        Self(items)
    }
}

impl Debug for Hex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

impl Display for Hex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}
