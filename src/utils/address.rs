use crate::error::{Pop3Error, Result};

/// Validate a fully-qualified mailbox address (`local@domain`).
pub fn validate_address(address: &str) -> Result<()> {
    parse_address(address).map(|_| ())
}

/// Split an address into its local part and domain.
pub fn parse_address(address: &str) -> Result<(&str, &str)> {
    if address.is_empty() {
        return Err(Pop3Error::InvalidAddress("address is empty".to_string()));
    }

    let Some((local, domain)) = address.split_once('@') else {
        return Err(Pop3Error::InvalidAddress(format!(
            "{address}: missing @domain"
        )));
    };

    if local.is_empty() || domain.is_empty() {
        return Err(Pop3Error::InvalidAddress(format!(
            "{address}: empty local part or domain"
        )));
    }
    if domain.contains('@') {
        return Err(Pop3Error::InvalidAddress(format!(
            "{address}: multiple @ separators"
        )));
    }

    Ok((local, domain))
}

/// Split a local part into its base and optional subaddress extension
/// (`user+folder` → `("user", Some("folder"))`).
pub fn split_subaddress(local: &str) -> (&str, Option<&str>) {
    match local.split_once('+') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => (base, Some(ext)),
        _ => (local, None),
    }
}

/// Domain part of an address, or "unknown" when absent. Used for metrics
/// labels, never for routing.
pub fn extract_domain(address: &str) -> &str {
    match address.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "unknown",
    }
}
