//! # estate
//!
//! A rust library implementing the RAET-derived secure UDP transaction
//! protocol: estates, keeps, packets, transactions, and the stack that
//! coordinates them (see `SPEC_FULL.md` at the workspace root).

pub mod crypto;
pub mod error;
pub mod estate;
pub mod keep;
pub mod packet;
pub mod registry;
pub mod socket;
pub mod stack;
pub mod stats;
pub mod transaction;

pub use crypto::{Boxer, KeyFactory, KeyMaterial, Signer};
pub use error::{Error, Result};
pub use estate::Estate;
pub use packet::{Header, Packet, PacketBuilder};
pub use registry::Registry;
pub use socket::{HostAddr, Socket};
pub use stack::{Builder, Stack};
pub use stats::Stats;
pub use transaction::{Role, Transaction, TxIndex};
