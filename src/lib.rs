//! Server side of the FIDO Device Onboard ownership-transfer handshake.
//!
//! The crate implements the rendezvous TO1 exchange and the owner TO2
//! exchange on top of a shared cryptographic primitives service and the
//! Ownership Voucher chain-of-custody model. Transport, persistence and
//! service-info modules stay outside, reached through the traits in
//! [`storage`].

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod voucher;

pub use crate::crypto::CryptoService;
pub use crate::error::ProtocolError;
pub use crate::protocol::dispatch::{DispatchRequest, DispatchResult, DispatchRunner};
pub use crate::protocol::v101::Message;
pub use crate::voucher::OwnershipVoucher;
