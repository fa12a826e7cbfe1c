//! # host-rpc
//!
//! NATS plumbing between fipd manager hosts:
//! - [`NatsClient`], the shared connection with optional auth modes and
//!   bounded connect retries
//! - [`NatsHostRpc`], the [`HostRpc`] implementation that forwards binding
//!   work to the authoritative host
//! - [`RpcServer`], which serves those requests on this host's subject
//! - [`NatsNotifier`], which publishes lifecycle notifications
//! - [`NatsStore`], the [`Storage`] every host shares through a JetStream KV
//!   bucket
//!
//! [`HostRpc`]: floating_ips::HostRpc
//! [`Storage`]: fip_store::Storage
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

pub mod client;
pub mod error;
pub mod kv_store;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod rpc;
pub mod server;
pub mod subjects;

pub use client::{ConnectionState, NatsClient};
pub use error::{TransportError, TransportResult};
pub use kv_store::{KvStoreError, NatsStore};
pub use models::{RpcEnvelope, RpcReply, RpcRequest};
pub use notifier::NatsNotifier;
pub use rpc::NatsHostRpc;
pub use server::{RpcServer, dispatch};
pub use subjects::SubjectResolver;
