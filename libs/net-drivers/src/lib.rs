//! # net-drivers
//!
//! The two driver contracts the floating ip engine calls through:
//!
//! - [`L3Driver`] installs and removes the forwarding rule that maps a
//!   floating address onto a fixed one on a given interface.
//! - [`DnsDriver`] manages DNS domains and the entries in them. The engine
//!   holds two, one for public (floating) domains and one for private
//!   (instance) domains.
//!
//! The implementations here do no packet or DNS work of their own:
//! [`NoopL3Driver`] and [`NoopDnsDriver`] only log, [`MemoryDnsDriver`] keeps
//! zones in process.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod dns;
pub mod l3;

pub use dns::{DnsDriver, DnsError, MemoryDnsDriver, NoopDnsDriver, RecordType};
pub use l3::{DriverError, L3Driver, NoopL3Driver};
