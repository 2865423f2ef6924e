//! Alias Engine
//!
//! Generates plus-suffix and Gmail dot-variant aliases, and routes an
//! arbitrary recipient address back to the physical mailbox that should
//! answer for it (spec.md §4.2).

use crate::account::{AccountRegistry, Provider};
use crate::error::{Error, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;

/// A generated (or routed-to) alias address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub alias_address: String,
    pub base_address: String,
    pub provider: Provider,
    pub suffix: Option<String>,
}

/// The outcome of routing an arbitrary recipient to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub backend: String,
    pub is_alias: bool,
}

const OUTLOOK_DOMAINS: [&str; 2] = ["outlook.com", "hotmail.com"];

/// Split `addr` into `(local, domain)`, both lowercased. Returns `None`
/// if there's no `@`.
fn split_lower(addr: &str) -> Option<(String, String)> {
    let addr = addr.to_lowercase();
    let at = addr.rfind('@')?;
    Some((addr[..at].to_string(), addr[at + 1..].to_string()))
}

/// The portion of a local-part before the first `+`.
fn local_before_plus(local: &str) -> &str {
    local.split('+').next().unwrap_or(local)
}

fn strip_dots(local: &str) -> String {
    local.chars().filter(|c| *c != '.').collect()
}

fn is_valid_custom_suffix(suffix: &str) -> bool {
    suffix.len() >= 2
        && suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Build a plus-alias address: `local+suffix@domain`.
fn plus_alias(local: &str, domain: &str, suffix: &str) -> String {
    format!("{local}+{suffix}@{domain}")
}

/// Build a dot-variant address of a Gmail local-part, or `None` if the
/// dot-stripped local-part is too short to place an interior dot
/// (spec.md §4.2: "falls back to plus-alias if the stripped local has
/// fewer than 2 characters").
fn dot_alias(local: &str, domain: &str) -> Option<String> {
    let stripped = strip_dots(local);
    if stripped.chars().count() < 2 {
        return None;
    }
    let chars: Vec<char> = stripped.chars().collect();
    // Interior position: not before the first char, not after the last.
    let pos = if chars.len() == 2 {
        1
    } else {
        rand::thread_rng().gen_range(1..chars.len())
    };
    let mut out = String::with_capacity(chars.len() + 1);
    out.extend(&chars[..pos]);
    out.push('.');
    out.extend(&chars[pos..]);
    Some(format!("{out}@{domain}"))
}

/// Generate a new alias for `base`.
///
/// - Outlook/Hotmail: always a plus-alias.
/// - Gmail: a plus-alias when `custom_suffix` is given or
///   `use_dot_method` is false; a dot-variant when `use_dot_method` is
///   true and `custom_suffix` is `None` (dot aliases don't carry a
///   suffix).
///
/// # Errors
///
/// `Error::NotRoutable` if `base` is not a known account.
/// `Error::Config` if `provider` doesn't match the registered account's
/// provider, or if `custom_suffix` fails validation
/// (`[a-z0-9_]{2,}`).
pub fn generate_alias(
    registry: &AccountRegistry,
    provider: Provider,
    base: &str,
    custom_suffix: Option<&str>,
    use_dot_method: bool,
) -> Result<Alias> {
    let account = registry
        .lookup_by_address(base)
        .ok_or(Error::NotRoutable)?;
    if account.provider != provider {
        return Err(Error::Config(format!(
            "{base} is registered as {} but {provider} was requested",
            account.provider
        )));
    }

    let Some((local, domain)) = split_lower(&account.address) else {
        return Err(Error::Config(format!("malformed account address {base}")));
    };

    if let Some(suffix) = custom_suffix {
        if !is_valid_custom_suffix(suffix) {
            return Err(Error::Config(format!(
                "custom suffix '{suffix}' must match [a-z0-9_]{{2,}}"
            )));
        }
        let alias_address = plus_alias(&local, &domain, suffix);
        return Ok(Alias {
            alias_address,
            base_address: account.address.clone(),
            provider,
            suffix: Some(suffix.to_string()),
        });
    }

    if provider == Provider::Gmail && use_dot_method {
        if let Some(alias_address) = dot_alias(&local, &domain) {
            return Ok(Alias {
                alias_address,
                base_address: account.address.clone(),
                provider,
                suffix: None,
            });
        }
        // Falls through to plus-alias below when the local-part is too
        // short for an interior dot.
    }

    let suffix = random_suffix();
    let alias_address = plus_alias(&local, &domain, &suffix);
    Ok(Alias {
        alias_address,
        base_address: account.address.clone(),
        provider,
        suffix: Some(suffix),
    })
}

/// Route an arbitrary recipient address to a known backend.
///
/// # Errors
///
/// `Error::NotRoutable` if no registered account's mailbox would receive
/// mail for `recipient`.
pub fn route(registry: &AccountRegistry, recipient: &str) -> Result<Route> {
    let Some((recipient_local, recipient_domain)) = split_lower(recipient) else {
        return Err(Error::NotRoutable);
    };
    let recipient_local_before_plus = local_before_plus(&recipient_local);

    for account in registry.accounts_for_provider(Provider::Gmail) {
        let Some((acct_local, acct_domain)) = split_lower(&account.address) else {
            continue;
        };
        if acct_domain != recipient_domain {
            continue;
        }
        if strip_dots(&acct_local) == strip_dots(recipient_local_before_plus) {
            return Ok(Route {
                is_alias: recipient_local != acct_local || recipient_domain != acct_domain,
                backend: account.address.clone(),
            });
        }
    }

    for account in registry.accounts_for_provider(Provider::Outlook) {
        let Some((acct_local, acct_domain)) = split_lower(&account.address) else {
            continue;
        };
        if !OUTLOOK_DOMAINS.contains(&acct_domain.as_str()) || acct_domain != recipient_domain {
            continue;
        }
        if acct_local == recipient_local_before_plus {
            return Ok(Route {
                is_alias: recipient_local != acct_local || recipient_domain != acct_domain,
                backend: account.address.clone(),
            });
        }
    }

    Err(Error::NotRoutable)
}

/// Whether `recipient` is an alias rather than a backend's own address.
///
/// True when the address carries a `+` suffix, or when routing it lands
/// on a backend whose address differs from `recipient` (spec.md §4.2).
#[must_use]
pub fn is_alias(registry: &AccountRegistry, recipient: &str) -> bool {
    if recipient.contains('+') {
        return true;
    }
    route(registry, recipient).is_ok_and(|r| r.is_alias)
}
