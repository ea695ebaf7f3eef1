//! Transfer Ownership Protocol 1 messages.
//!
//! The device proves its identity to the rendezvous server and receives
//! the owner addresses registered for its guid.

pub mod hello_rv;
pub mod hello_rv_ack;
pub mod prove_to_rv;
pub mod rv_redirect;

pub use self::hello_rv::HelloRv;
pub use self::hello_rv_ack::HelloRvAck;
pub use self::prove_to_rv::ProveToRv;
pub use self::rv_redirect::{RvRedirect, To1dBlob};
