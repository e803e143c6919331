//! Dependency references in service environments.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Replace dependency references in `KEY=VALUE` entries.
///
/// A value equal to a dependency name (optionally `$`-prefixed) becomes the
/// dependency's address; `name:rest` becomes `address:rest`. Other entries
/// pass through unchanged.
#[must_use]
pub fn rewrite(env: &[String], addresses: &BTreeMap<String, Ipv4Addr>) -> Vec<String> {
    env.iter()
        .map(|entry| {
            let Some((key, value)) = entry.split_once('=') else {
                return entry.clone();
            };
            let reference = value.strip_prefix('$').unwrap_or(value);
            let (name, rest) = match reference.split_once(':') {
                Some((name, rest)) => (name, Some(rest)),
                None => (reference, None),
            };
            match (addresses.get(name), rest) {
                (Some(address), Some(rest)) => format!("{key}={address}:{rest}"),
                (Some(address), None) => format!("{key}={address}"),
                (None, _) => entry.clone(),
            }
        })
        .collect()
}
