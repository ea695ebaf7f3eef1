//! Protocol error taxonomy.
//!
//! Every failure aborts the in-progress session. The variants carry the
//! stable numeric codes that go out on the wire in the ERROR message, so a
//! handler deep in an exchange can `bail!` with a [`ProtocolError`] and the
//! dispatch layer recovers the code by walking the report's cause chain.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid ownership voucher: {0}")]
    InvalidVoucher(String),
    #[error("invalid owner sign body: {0}")]
    InvalidOwnerSignBody(String),
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),
    #[error("invalid GUID: {0}")]
    InvalidGuid(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("message body error: {0}")]
    MessageBody(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("credential reuse rejected: {0}")]
    CredReuse(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Stable numeric code carried by the outbound ERROR message.
    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::InvalidToken(_) => 1,
            ProtocolError::InvalidVoucher(_) => 2,
            ProtocolError::InvalidOwnerSignBody(_) => 3,
            ProtocolError::InvalidIpAddress(_) => 4,
            ProtocolError::InvalidGuid(_) => 5,
            ProtocolError::NotFound(_) => 6,
            ProtocolError::MessageBody(_) => 100,
            ProtocolError::InvalidMessage(_) => 101,
            ProtocolError::CredReuse(_) => 102,
            // Unsupported algorithms have no code of their own on the wire.
            ProtocolError::UnsupportedAlgorithm(_) | ProtocolError::Internal(_) => 500,
        }
    }
}

/// Walks the cause chain for the innermost typed error.
///
/// Collaborator failures wrap a [`ProtocolError`] in arbitrary layers of
/// context; the wire code comes from the deepest typed link. Reports without
/// one map to the generic internal-server code.
pub fn innermost_protocol_error(report: &eyre::Report) -> Option<&ProtocolError> {
    report
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ProtocolError>())
        .last()
}

#[cfg(test)]
mod tests {
    use eyre::WrapErr;

    use super::*;

    #[test]
    fn code_recovered_through_context_layers() {
        let res: eyre::Result<()> = Err(ProtocolError::InvalidGuid("mismatch".into()).into());
        let report = res
            .wrap_err("verifying attestation")
            .wrap_err("TO1.ProveToRV")
            .unwrap_err();

        let err = innermost_protocol_error(&report).expect("typed error in chain");
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn untyped_report_has_no_code() {
        let report = eyre::eyre!("io failure");
        assert!(innermost_protocol_error(&report).is_none());
    }

    #[test]
    fn every_variant_maps_to_a_stable_code() {
        let cases = [
            (ProtocolError::InvalidToken(String::new()), 1),
            (ProtocolError::InvalidVoucher(String::new()), 2),
            (ProtocolError::InvalidOwnerSignBody(String::new()), 3),
            (ProtocolError::InvalidIpAddress(String::new()), 4),
            (ProtocolError::InvalidGuid(String::new()), 5),
            (ProtocolError::NotFound(String::new()), 6),
            (ProtocolError::MessageBody(String::new()), 100),
            (ProtocolError::InvalidMessage(String::new()), 101),
            (ProtocolError::CredReuse(String::new()), 102),
            (ProtocolError::UnsupportedAlgorithm(String::new()), 500),
            (ProtocolError::Internal(String::new()), 500),
        ];

        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }
}
