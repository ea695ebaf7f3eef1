//! Transfer Ownership Protocol 2 messages.
//!
//! The device and the owner onboarding service prove themselves to each
//! other, the voucher chain is transferred entry by entry, and the
//! device credentials are replaced under an encrypted tunnel.

pub mod device_service_info;
pub mod device_service_info_ready;
pub mod done;
pub mod done2;
pub mod get_ov_next_entry;
pub mod hello_device;
pub mod ov_next_entry;
pub mod owner_service_info;
pub mod owner_service_info_ready;
pub mod prove_device;
pub mod prove_ov_hdr;
pub mod setup_device;

pub use self::device_service_info::DeviceServiceInfo;
pub use self::device_service_info_ready::DeviceServiceInfoReady;
pub use self::done::Done;
pub use self::done2::Done2;
pub use self::get_ov_next_entry::GetOvNextEntry;
pub use self::hello_device::HelloDevice;
pub use self::ov_next_entry::OvNextEntry;
pub use self::owner_service_info::OwnerServiceInfo;
pub use self::owner_service_info_ready::OwnerServiceInfoReady;
pub use self::prove_device::ProveDevice;
pub use self::prove_ov_hdr::{ProveOvHdr, PvOvHdrPayload, PvOvHdrUnprotected};
pub use self::setup_device::{SetupDevice, SetupDevicePayload};
