use eyre::OptionExt;
use serde_bytes::ByteArray;

use super::{Guid, Nonce};

/// ```cddl
/// ;; This is a COSE_Sign1 object:
/// EAToken = #6.18(EATokenBase)
///
/// EATokenBase  = [
///    protected:   bytes .cbor $EATProtectedHeaders,
///    unprotected: $EATUnprotectedHeaders
///    payload:     bytes .cbor EATPayloadBaseMap
///    signature:   bstr
/// ]
/// EATPayloadBaseMap = { EATPayloadBase }
/// $$EATPayloadBase //= (
///     EAT-FDO => $EATPayloads,
///     EAT-NONCE => Nonce,
///     EAT-UEID  => EAT-GUID,
///     EATOtherClaims
/// )
///
/// ;; EAT GUID is a EAT-UEID with the first byte
/// ;; as EAT-RAND and subsequent bytes containing
/// ;; the FIDO Device Onboard GUID
/// EAT-GUID = bstr .size 17
/// EAT-RAND = 1
///
/// $$EATUnprotectedHeaders //= (
///     EATMAROEPrefix: MAROEPrefix
/// )
/// ```
pub type EaToken = coset::CoseSign1;

// EAT-NONCE      = 10 ;; iana assignment
// EAT-UEID       = 256 ;; iana assignment
// EAT-FDO        = -257 ;; iana assignment
// EATMAROEPrefix = -258 ;; iana assignment
// EUPHNonce      = -259 ;; iana assignment
pub const EAT_NONCE: i64 = 10;
pub const EAT_UEID: i64 = 256;
pub const EAT_FDO: i64 = -257;
pub const EATMAROE_PREFIX: i64 = -258;
pub const EUPH_NONCE: i64 = -259;

/// Claims the server reads out of a device attestation token.
#[derive(Debug, Clone, PartialEq)]
pub struct EatClaims {
    pub nonce: Nonce,
    pub guid: Guid,
    /// EAT-FDO claim, scheme dependent.
    pub fdo: Option<ciborium::Value>,
}

impl EatClaims {
    /// Decodes the claim map out of a token payload.
    pub fn from_token(token: &EaToken) -> eyre::Result<Self> {
        let payload = token.payload.as_deref().ok_or_eyre("missing EAT payload")?;

        let value: ciborium::Value = ciborium::from_reader(payload)?;
        let map = value.as_map().ok_or_eyre("EAT payload is not a map")?;

        let claim = |label: i64| {
            map.iter()
                .find(|(key, _)| key.as_integer() == Some(label.into()))
                .map(|(_, value)| value)
        };

        let nonce = claim(EAT_NONCE)
            .and_then(|value| value.as_bytes())
            .ok_or_eyre("missing EAT-NONCE claim")?;
        let nonce: [u8; 16] = nonce.as_slice().try_into()?;

        let ueid = claim(EAT_UEID)
            .and_then(|value| value.as_bytes())
            .ok_or_eyre("missing EAT-UEID claim")?;
        let guid = Guid::from_ueid(ueid)?;

        Ok(Self {
            nonce: ByteArray::new(nonce),
            guid,
            fdo: claim(EAT_FDO).cloned(),
        })
    }
}

/// Reads an unprotected header value by label, e.g. EUPHNonce or the
/// MAROE prefix.
pub fn unprotected_value(token: &EaToken, label: i64) -> Option<&ciborium::Value> {
    token
        .unprotected
        .rest
        .iter()
        .find_map(|(key, value)| (*key == coset::Label::Int(label)).then_some(value))
}

#[cfg(test)]
mod tests {
    use coset::CoseSign1Builder;

    use super::*;

    fn token_with_payload(payload: ciborium::Value) -> EaToken {
        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();

        CoseSign1Builder::new().payload(buf).build()
    }

    #[test]
    fn claims_parsed_from_payload_map() {
        let guid = Guid::new([3; 16]);
        let payload = ciborium::Value::Map(vec![
            (EAT_NONCE.into(), ciborium::Value::Bytes(vec![9; 16])),
            (
                EAT_UEID.into(),
                ciborium::Value::Bytes(guid.as_ueid().to_vec()),
            ),
            (
                EAT_FDO.into(),
                ciborium::Value::Array(vec![ciborium::Value::Bytes(vec![1, 2, 3])]),
            ),
        ]);

        let claims = EatClaims::from_token(&token_with_payload(payload)).unwrap();

        assert_eq!(claims.nonce.as_slice(), &[9; 16]);
        assert_eq!(claims.guid, guid);
        assert!(claims.fdo.is_some());
    }

    #[test]
    fn missing_nonce_is_an_error() {
        let payload = ciborium::Value::Map(vec![(
            EAT_UEID.into(),
            ciborium::Value::Bytes(Guid::new([3; 16]).as_ueid().to_vec()),
        )]);

        assert!(EatClaims::from_token(&token_with_payload(payload)).is_err());
    }
}
