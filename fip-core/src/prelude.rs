//! fipd prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait, chrono, tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{net::IpAddr, sync::Arc};
