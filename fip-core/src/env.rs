//! helpers for reading typed values out of environment variables

use anyhow::Context;

use std::{env, str};

/// Reads `name` from the environment and parses it as `T`, using `default`
/// when the variable is unset.
/// # Examples
/// ```
/// let fmt: String = fip_core::env::parse_var("FIPD_DOC_UNSET_VAR", "standard").unwrap();
/// assert_eq!(fmt, "standard");
/// ```
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    match env::var(name) {
        Ok(val) => val.parse::<T>(),
        Err(_) => default.to_string().parse::<T>(),
    }
}

/// [`parse_var`] with the variable name attached to any parse error
///
/// [`parse_var`]: crate::env::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}
