//! convenience fns for parsing env vars
use anyhow::Context;

use std::{env, str};

/// Returns the value of the environment variable `name` parsed as `T`, or
/// `default` parsed as `T` if it is unset.
///
/// ```
/// let val: u64 = lodestar_core::env::parse_var("LODESTAR_DOC_UNSET_VAR", 42).unwrap();
/// assert_eq!(val, 42);
/// ```
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but gives a default error message with the environment
/// variable name in it
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let name = "LODESTAR_TEST_SURELY_UNSET";
        assert_eq!(parse_var::<u32, _>(name, 7), Ok(7));
        assert_eq!(parse_var_with_err::<String, _>(name, "json").unwrap(), "json");
    }

    #[test]
    fn test_bad_default_reports_var_name() {
        let err = parse_var_with_err::<u32, _>("LODESTAR_TEST_SURELY_UNSET", "x").unwrap_err();
        assert!(err.to_string().contains("LODESTAR_TEST_SURELY_UNSET"));
    }
}
