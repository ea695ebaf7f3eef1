//! Collaborator traits for persistence and policy.
//!
//! The protocol core never persists anything itself: vouchers, session
//! blobs, keys and redirect blobs are owned by the surrounding service and
//! reached through these traits. Handlers are async only because the
//! collaborators are.
//!
//! [`memory`] holds in-memory implementations, enough for tests and small
//! deployments.

#![allow(async_fn_in_trait)]

use openssl::pkey::{PKey, Private};

use crate::crypto::SigningKey;
use crate::protocol::v101::ownership_voucher::OwnershipVoucher;
use crate::protocol::v101::public_key::PublicKey;
use crate::protocol::v101::randezvous_info::RendezvousInfo;
use crate::protocol::v101::service_info::ServiceInfo;
use crate::protocol::v101::to1::RvRedirect;
use crate::protocol::v101::Guid;

pub mod memory;

/// Ownership voucher persistence on the owner side.
pub trait VoucherStore {
    async fn query(&self, guid: Guid) -> eyre::Result<Option<OwnershipVoucher<'static>>>;

    /// Persists the replacement voucher produced at the end of TO2,
    /// superseding the one stored under `old_guid`.
    async fn replace(
        &self,
        old_guid: Guid,
        voucher: &OwnershipVoucher<'static>,
    ) -> eyre::Result<()>;
}

/// Opaque per-session state, keyed by the session token.
///
/// The store owns the blob between requests and must serialize access per
/// token; the core never holds state across two messages.
pub trait SessionStore {
    async fn get(&self, token: &str) -> eyre::Result<Option<Vec<u8>>>;

    async fn save(&self, token: &str, blob: &[u8]) -> eyre::Result<()>;

    async fn expire(&self, token: &str) -> eyre::Result<()>;
}

/// Lifecycle hooks bracketing every handled message.
///
/// All hooks default to no-ops.
pub trait SessionLifecycle {
    /// A new session is being created.
    async fn starting(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }

    /// The initial message was handled and the session saved.
    async fn started(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }

    /// A message for an existing session is about to be handled.
    async fn continuing(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }

    /// The message was handled and the session saved again.
    async fn continued(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }

    /// The protocol reached its terminal message and the session closed.
    async fn completed(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }

    /// The session aborted; state should be discarded.
    async fn failed(&self, token: &str) -> eyre::Result<()> {
        let _ = token;
        Ok(())
    }
}

/// Resolves owner private keys by their public half.
pub trait KeyResolver {
    /// Signing key matching an owner public key carried by a voucher.
    async fn signing_key(&self, owner: &PublicKey<'_>) -> eyre::Result<Option<SigningKey>>;

    /// Owner RSA private key, needed to unwrap the device random of the
    /// ASYMKEX key exchange suites.
    async fn decryption_key(
        &self,
        owner: &PublicKey<'_>,
    ) -> eyre::Result<Option<PKey<Private>>> {
        let _ = owner;
        Ok(None)
    }
}

/// Replacement credentials handed to the device in TO2.SetupDevice.
///
/// Every method defaults to `None`, meaning "keep the current value",
/// which together select the credential-reuse protocol.
pub trait ReplacementSupplier {
    async fn guid(&self, current: Guid) -> eyre::Result<Option<Guid>> {
        let _ = current;
        Ok(None)
    }

    async fn rendezvous_info(&self, guid: Guid) -> eyre::Result<Option<RendezvousInfo>> {
        let _ = guid;
        Ok(None)
    }

    async fn owner_key(
        &self,
        current: &PublicKey<'_>,
    ) -> eyre::Result<Option<PublicKey<'static>>> {
        let _ = current;
        Ok(None)
    }
}

/// Redirect blobs registered by TO0, consumed by the rendezvous TO1
/// exchange.
pub trait To1RedirectStore {
    /// The signed to1d blob registered for a device.
    async fn redirect(&self, guid: Guid) -> eyre::Result<Option<RvRedirect>>;

    /// SubjectPublicKeyInfo of the device certificate, from the voucher
    /// the owner registered. `None` for devices attesting without a
    /// certificate (e.g. Intel® EPID).
    async fn device_key(&self, guid: Guid) -> eyre::Result<Option<Vec<u8>>>;
}

/// Owner-side service info produced by the module collaborators.
#[derive(Debug, Default)]
pub struct OwnerServiceInfoBatch {
    pub service_info: ServiceInfo<'static>,
    pub is_more: bool,
    pub is_done: bool,
}

/// Service-info module set for the TO2 provisioning loop.
pub trait ServiceInfoModule {
    /// A single key/value pair received from the device.
    async fn device_service_info(
        &self,
        guid: Guid,
        key: &str,
        value: &ciborium::Value,
    ) -> eyre::Result<()>;

    /// The next batch to send, bounded by the device's maximum message
    /// size.
    async fn owner_service_info(
        &self,
        guid: Guid,
        max_size: u16,
    ) -> eyre::Result<OwnerServiceInfoBatch>;
}
