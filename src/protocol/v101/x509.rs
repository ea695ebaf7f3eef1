use std::borrow::Cow;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use serde_bytes::Bytes;
use x509_parser::prelude::FromDer;

use crate::protocol::{Hex, OneOrMore};

/// COSE x5chain: a single certificate travels as a bare bstr, an ordered
/// chain as an array of bstr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoseX509<'a> {
    Certs(OneOrMore<X509<'a>>),
    One(X509<'a>),
}

impl<'a> CoseX509<'a> {
    pub fn leaf(&self) -> &X509<'a> {
        match self {
            CoseX509::Certs(certs) => certs.first().expect("one or more certificates"),
            CoseX509::One(cert) => cert,
        }
    }

    /// SubjectPublicKeyInfo of the leaf certificate.
    pub fn cert_key(&self) -> &[u8] {
        self.leaf().key()
    }

    /// Certificates in order, leaf first.
    pub fn certs(&self) -> &[X509<'a>] {
        match self {
            CoseX509::Certs(certs) => certs,
            CoseX509::One(cert) => std::slice::from_ref(cert),
        }
    }
}

/// A DER certificate, with the SubjectPublicKeyInfo extracted at decode.
#[derive(Clone, Eq)]
pub struct X509<'a> {
    cert: Cow<'a, Bytes>,
    key: Vec<u8>,
}

impl<'a> X509<'a> {
    pub fn from_der(cert: Vec<u8>) -> eyre::Result<Self> {
        let (rest, parsed) = x509_parser::parse_x509_certificate(&cert)?;

        eyre::ensure!(rest.is_empty(), "trailing bytes after certificate");

        let key = parsed.subject_pki.raw.to_vec();

        Ok(Self {
            cert: Cow::Owned(serde_bytes::ByteBuf::from(cert)),
            key,
        })
    }

    /// Raw SubjectPublicKeyInfo bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn der(&self) -> &[u8] {
        &self.cert
    }
}

impl Serialize for X509<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.cert.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for X509<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let cert: Cow<'_, Bytes> = Deserialize::deserialize(deserializer)?;

        let (rest, parsed) =
            x509_parser::parse_x509_certificate(&cert).map_err(serde::de::Error::custom)?;

        if !rest.is_empty() {
            return Err(serde::de::Error::custom("trailing bytes after certificate"));
        }

        Ok(Self {
            key: parsed.subject_pki.raw.to_vec(),
            cert,
        })
    }
}

impl Debug for X509<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { cert, key } = self;

        f.debug_struct("X509")
            .field("cert", &Hex::new(cert))
            .field("key", &Hex::new(key))
            .finish()
    }
}

impl PartialEq for X509<'_> {
    fn eq(&self, other: &Self) -> bool {
        let Self { cert, key: _ } = self;

        *cert == other.cert
    }
}

/// Parses the SubjectPublicKeyInfo wrapper, returning the inner key bits.
///
/// For EC keys this is the uncompressed point, for RSA the PKCS#1
/// RSAPublicKey encoding.
pub fn spki_key_bits(spki: &[u8]) -> eyre::Result<Vec<u8>> {
    let (rest, parsed) = x509_parser::x509::SubjectPublicKeyInfo::from_der(spki)
        .map_err(|err| eyre::eyre!("invalid SubjectPublicKeyInfo: {err}"))?;

    eyre::ensure!(rest.is_empty(), "trailing bytes after public key");

    Ok(parsed.subject_public_key.data.to_vec())
}
