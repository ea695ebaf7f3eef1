//! In-memory collaborator implementations.
//!
//! Everything lives behind a [`std::sync::Mutex`], suitable for tests and
//! single-process deployments without durability requirements.

use std::collections::HashMap;
use std::sync::Mutex;

use eyre::WrapErr;
use openssl::pkey::{PKey, Private};

use crate::crypto::SigningKey;
use crate::protocol::v101::ownership_voucher::OwnershipVoucher;
use crate::protocol::v101::public_key::PublicKey;
use crate::protocol::v101::randezvous_info::RendezvousInfo;
use crate::protocol::v101::sign_info::DeviceSgType;
use crate::protocol::v101::to1::RvRedirect;
use crate::protocol::v101::Guid;

use super::{
    KeyResolver, OwnerServiceInfoBatch, ReplacementSupplier, ServiceInfoModule, SessionLifecycle,
    SessionStore, To1RedirectStore, VoucherStore,
};

/// Session blobs in a map keyed by token.
#[derive(Debug, Default)]
pub struct MemorySessions {
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessions {
    async fn get(&self, token: &str) -> eyre::Result<Option<Vec<u8>>> {
        let sessions = self.sessions.lock().expect("poisoned lock");

        Ok(sessions.get(token).cloned())
    }

    async fn save(&self, token: &str, blob: &[u8]) -> eyre::Result<()> {
        let mut sessions = self.sessions.lock().expect("poisoned lock");

        sessions.insert(token.to_string(), blob.to_vec());

        Ok(())
    }

    async fn expire(&self, token: &str) -> eyre::Result<()> {
        let mut sessions = self.sessions.lock().expect("poisoned lock");

        sessions.remove(token);

        Ok(())
    }
}

/// Vouchers keyed by GUID.
#[derive(Debug, Default)]
pub struct MemoryVouchers {
    vouchers: Mutex<HashMap<Guid, OwnershipVoucher<'static>>>,
}

impl MemoryVouchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, voucher: OwnershipVoucher<'static>) {
        let guid = voucher.header().ov_guid;

        let mut vouchers = self.vouchers.lock().expect("poisoned lock");

        vouchers.insert(guid, voucher);
    }
}

impl VoucherStore for MemoryVouchers {
    async fn query(&self, guid: Guid) -> eyre::Result<Option<OwnershipVoucher<'static>>> {
        let vouchers = self.vouchers.lock().expect("poisoned lock");

        Ok(vouchers.get(&guid).cloned())
    }

    async fn replace(
        &self,
        old_guid: Guid,
        voucher: &OwnershipVoucher<'static>,
    ) -> eyre::Result<()> {
        let mut vouchers = self.vouchers.lock().expect("poisoned lock");

        vouchers.remove(&old_guid);
        vouchers.insert(voucher.header().ov_guid, voucher.clone());

        Ok(())
    }
}

struct KeyEntry {
    owner: PublicKey<'static>,
    sg_type: DeviceSgType,
    pkcs8: Vec<u8>,
    decryption: Option<Vec<u8>>,
}

/// Owner keys held as PKCS#8 documents, loaded on each resolution.
#[derive(Default)]
pub struct MemoryKeys {
    entries: Mutex<Vec<KeyEntry>>,
}

impl MemoryKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_signing_key(
        &self,
        owner: PublicKey<'static>,
        sg_type: DeviceSgType,
        pkcs8: Vec<u8>,
    ) {
        let mut entries = self.entries.lock().expect("poisoned lock");

        entries.push(KeyEntry {
            owner,
            sg_type,
            pkcs8,
            decryption: None,
        });
    }

    /// Registers an RSA owner key usable for both signing and the
    /// ASYMKEX random unwrap.
    pub fn add_rsa_key(&self, owner: PublicKey<'static>, sg_type: DeviceSgType, pkcs8: Vec<u8>) {
        let mut entries = self.entries.lock().expect("poisoned lock");

        entries.push(KeyEntry {
            owner,
            sg_type,
            decryption: Some(pkcs8.clone()),
            pkcs8,
        });
    }
}

impl KeyResolver for MemoryKeys {
    async fn signing_key(&self, owner: &PublicKey<'_>) -> eyre::Result<Option<SigningKey>> {
        let entries = self.entries.lock().expect("poisoned lock");

        entries
            .iter()
            .find(|entry| entry.owner == *owner)
            .map(|entry| SigningKey::from_pkcs8(entry.sg_type, &entry.pkcs8))
            .transpose()
    }

    async fn decryption_key(&self, owner: &PublicKey<'_>) -> eyre::Result<Option<PKey<Private>>> {
        let entries = self.entries.lock().expect("poisoned lock");

        entries
            .iter()
            .find(|entry| entry.owner == *owner)
            .and_then(|entry| entry.decryption.as_deref())
            .map(|der| PKey::private_key_from_pkcs8(der).wrap_err("invalid decryption key"))
            .transpose()
    }
}

/// Redirect blobs and device keys keyed by GUID, as TO0 would register
/// them.
#[derive(Debug, Default)]
pub struct MemoryRedirects {
    redirects: Mutex<HashMap<Guid, (RvRedirect, Option<Vec<u8>>)>>,
}

impl MemoryRedirects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, guid: Guid, redirect: RvRedirect, device_key: Option<Vec<u8>>) {
        let mut redirects = self.redirects.lock().expect("poisoned lock");

        redirects.insert(guid, (redirect, device_key));
    }
}

impl To1RedirectStore for MemoryRedirects {
    async fn redirect(&self, guid: Guid) -> eyre::Result<Option<RvRedirect>> {
        let redirects = self.redirects.lock().expect("poisoned lock");

        Ok(redirects.get(&guid).map(|(redirect, _)| redirect.clone()))
    }

    async fn device_key(&self, guid: Guid) -> eyre::Result<Option<Vec<u8>>> {
        let redirects = self.redirects.lock().expect("poisoned lock");

        Ok(redirects.get(&guid).and_then(|(_, key)| key.clone()))
    }
}

/// Fixed replacement credentials; unset fields keep the device's current
/// values.
#[derive(Debug, Default)]
pub struct FixedReplacements {
    pub guid: Option<Guid>,
    pub rendezvous_info: Option<RendezvousInfo>,
    pub owner_key: Option<PublicKey<'static>>,
}

impl ReplacementSupplier for FixedReplacements {
    async fn guid(&self, _current: Guid) -> eyre::Result<Option<Guid>> {
        Ok(self.guid)
    }

    async fn rendezvous_info(&self, _guid: Guid) -> eyre::Result<Option<RendezvousInfo>> {
        Ok(self.rendezvous_info.clone())
    }

    async fn owner_key(
        &self,
        _current: &PublicKey<'_>,
    ) -> eyre::Result<Option<PublicKey<'static>>> {
        Ok(self.owner_key.clone())
    }
}

/// Records received device pairs and replays queued owner batches.
#[derive(Debug, Default)]
pub struct MemoryServiceInfo {
    received: Mutex<Vec<(String, ciborium::Value)>>,
    queued: Mutex<Vec<OwnerServiceInfoBatch>>,
}

impl MemoryServiceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, batch: OwnerServiceInfoBatch) {
        let mut queued = self.queued.lock().expect("poisoned lock");

        queued.push(batch);
    }

    pub fn received(&self) -> Vec<(String, ciborium::Value)> {
        let received = self.received.lock().expect("poisoned lock");

        received.clone()
    }
}

impl ServiceInfoModule for MemoryServiceInfo {
    async fn device_service_info(
        &self,
        _guid: Guid,
        key: &str,
        value: &ciborium::Value,
    ) -> eyre::Result<()> {
        let mut received = self.received.lock().expect("poisoned lock");

        received.push((key.to_string(), value.clone()));

        Ok(())
    }

    async fn owner_service_info(
        &self,
        _guid: Guid,
        _max_size: u16,
    ) -> eyre::Result<OwnerServiceInfoBatch> {
        let mut queued = self.queued.lock().expect("poisoned lock");

        if queued.is_empty() {
            return Ok(OwnerServiceInfoBatch {
                is_done: true,
                ..Default::default()
            });
        }

        Ok(queued.remove(0))
    }
}

/// Records every lifecycle hook invocation.
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(hook, token)` pairs in invocation order.
    pub fn events(&self) -> Vec<(String, String)> {
        let events = self.events.lock().expect("poisoned lock");

        events.clone()
    }

    fn record(&self, hook: &str, token: &str) {
        let mut events = self.events.lock().expect("poisoned lock");

        events.push((hook.to_string(), token.to_string()));
    }
}

impl SessionLifecycle for RecordingLifecycle {
    async fn starting(&self, token: &str) -> eyre::Result<()> {
        self.record("starting", token);

        Ok(())
    }

    async fn started(&self, token: &str) -> eyre::Result<()> {
        self.record("started", token);

        Ok(())
    }

    async fn continuing(&self, token: &str) -> eyre::Result<()> {
        self.record("continuing", token);

        Ok(())
    }

    async fn continued(&self, token: &str) -> eyre::Result<()> {
        self.record("continued", token);

        Ok(())
    }

    async fn completed(&self, token: &str) -> eyre::Result<()> {
        self.record("completed", token);

        Ok(())
    }

    async fn failed(&self, token: &str) -> eyre::Result<()> {
        self.record("failed", token);

        Ok(())
    }
}
