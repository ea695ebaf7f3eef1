//! Intel® EPID group-signature verification.
//!
//! EPID attestations cannot be checked locally, the signature is posted
//! to Intel's online verification service. The service also hands out
//! the group certificates and the signature revocation list the device
//! needs in eBSigInfo.

use eyre::{bail, ensure, OptionExt};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::v101::eat_signature::{unprotected_value, EatClaims, EaToken, EATMAROE_PREFIX};
use crate::protocol::v101::sign_info::{DeviceSgType, SigInfo};

const PROOF_PATH: &str = "v1/epid11/proof";
const MATERIAL_PATH: &str = "v2/epid11";

const GROUPCERTSIGMA10: &str = "groupcertsigma10";
const GROUPCERTSIGMA11: &str = "groupcertsigma11";
const SIGRL: &str = "sigrl";

/// Client for the online verification service.
#[derive(Debug, Clone)]
pub struct EpidVerifier {
    base: Url,
    client: reqwest::Client,
    test_mode: bool,
}

impl EpidVerifier {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            client: reqwest::Client::new(),
            test_mode: false,
        }
    }

    /// Accepts signatures the service rejects as invalid or signed with
    /// an outdated revocation list.
    ///
    /// CONFIGURATION HAZARD: this weakens device attestation to a
    /// reachability check on the verification service and must stay off
    /// outside of test deployments.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;

        self
    }

    /// Expected group id size for the scheme version.
    pub fn group_id_len(sg_type: DeviceSgType) -> eyre::Result<usize> {
        match sg_type {
            DeviceSgType::StEpid10 | DeviceSgType::StEpid11 => Ok(4),
            _ => bail!("not an EPID sgType"),
        }
    }

    /// Verifies a device EAT against the online service.
    pub async fn verify(&self, sign: &EaToken, sig_info: &SigInfo<'_>) -> eyre::Result<()> {
        let group_id: &[u8] = &sig_info.info;
        ensure!(
            group_id.len() == Self::group_id_len(sig_info.sg_type)?,
            "invalid group id size: {}",
            group_id.len()
        );

        let signed_payload = signed_payload(sign, sig_info.sg_type)?;

        // groupId, length prefixed message, empty basename, raw signature
        let mut body = Vec::new();
        body.extend_from_slice(group_id);
        body.extend_from_slice(&u16::try_from(signed_payload.len())?.to_be_bytes());
        body.extend_from_slice(&signed_payload);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&sign.signature);

        let url = self.base.join(PROOF_PATH)?;

        let response = self.client.post(url).body(body).send().await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN | StatusCode::EXPECTATION_FAILED if self.test_mode => {
                warn!(
                    status = %response.status(),
                    "accepting rejected EPID signature in test mode"
                );

                Ok(())
            }
            status => bail!("EPID verification failed with status {status}"),
        }
    }

    /// Builds the eBSigInfo material for an EPID device: the sigma 1.0
    /// and 1.1 group certificates and the signature revocation list,
    /// each with a 2-byte big-endian length prefix.
    ///
    /// Some groups miss a certificate or a revocation list, those fields
    /// are sent empty.
    pub async fn sig_info_material(&self, sig_info: &SigInfo<'_>) -> eyre::Result<SigInfo<'static>> {
        let group_id: &[u8] = &sig_info.info;
        ensure!(
            group_id.len() == Self::group_id_len(sig_info.sg_type)?,
            "invalid group id size: {}",
            group_id.len()
        );

        let mut material = Vec::new();

        for resource in [GROUPCERTSIGMA10, GROUPCERTSIGMA11, SIGRL] {
            let bytes = match self.fetch_resource(group_id, resource).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(resource, %error, "EPID resource unavailable");

                    Vec::new()
                }
            };

            material.extend_from_slice(&u16::try_from(bytes.len())?.to_be_bytes());
            material.extend_from_slice(&bytes);
        }

        Ok(SigInfo::new(sig_info.sg_type, material))
    }

    async fn fetch_resource(&self, group_id: &[u8], resource: &str) -> eyre::Result<Vec<u8>> {
        let group = hex_upper(group_id);

        let url = self
            .base
            .join(&format!("{MATERIAL_PATH}/{group}/{resource}"))?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/octet-stream")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// The message the device signed, reconstructed the way the verification
/// service expects it for each scheme version.
fn signed_payload(sign: &EaToken, sg_type: DeviceSgType) -> eyre::Result<Vec<u8>> {
    let claims = EatClaims::from_token(sign)?;
    let payload = sign.payload.as_deref().ok_or_eyre("missing EAT payload")?;

    let maroe_prefix = unprotected_value(sign, EATMAROE_PREFIX)
        .and_then(|value| value.as_bytes())
        .ok_or_eyre("missing MAROE prefix")?;

    let mut body = Vec::new();

    match sg_type {
        DeviceSgType::StEpid10 => {
            body.push(u8::try_from(maroe_prefix.len())?);
            body.extend_from_slice(maroe_prefix);
            body.extend_from_slice(claims.nonce.as_slice());
            body.extend_from_slice(payload);
        }
        DeviceSgType::StEpid11 => {
            let mut header = [0u8; 48];
            header[4] = 0x48;
            header[8] = 0x08;

            body.extend_from_slice(&header);
            body.extend_from_slice(maroe_prefix);
            body.extend_from_slice(&[0; 16]);
            body.extend_from_slice(claims.nonce.as_slice());
            body.extend_from_slice(&[0; 16]);
            body.extend_from_slice(payload);
        }
        _ => bail!("not an EPID sgType"),
    }

    Ok(body)
}
