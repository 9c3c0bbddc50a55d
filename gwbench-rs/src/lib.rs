//! Gwbench Base Crate
//!
//! This crate contains the shared type definitions and core logic of the
//! gwbench gateway-appliance pool orchestrator: the pool inventory and its
//! tag-annotation state codec, the reservation controller, the bounded-retry
//! verification primitive, and the IPsec stack policy table. It does not
//! contain any HTTP or SSH implementations; those live in the `gwb` binary
//! behind the [`host::HostClient`] trait and the API client.

pub mod host;
pub mod ipsec;
pub mod pool;
pub mod reserve;
pub mod tag;
pub mod verify;
