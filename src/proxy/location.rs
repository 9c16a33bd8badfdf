//! Target URL normalization
//!
//! Turns the path a client sent (minus the leading slash) into the absolute
//! URL that should be proxied. Accepted forms:
//!
//! - `http://host/path`, `https://host/path` (scheme kept as given)
//! - `//host/path` (scheme inferred)
//! - `host[:port]/path` (scheme inferred)
//!
//! The scheme is inferred as `https` only when the explicit port is exactly
//! `443`, otherwise `http`.

use std::fmt;
use std::net::IpAddr;

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed proxy target. Replaced, never mutated, on every redirect hop.
///
/// The port is kept as parsed so that out-of-range values can be reported
/// back to the client; it is only guaranteed to fit in a `u16` after the
/// request validator has accepted the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocation {
    scheme: Scheme,
    hostname: String,
    port: Option<u32>,
    path: String,
    href: String,
}

impl TargetLocation {
    fn new(scheme: Scheme, hostname: String, port: Option<u32>, path: String) -> Self {
        let host = format_host(&hostname, port);
        let href = format!("{}://{}{}", scheme, host, path);
        Self {
            scheme,
            hostname,
            port,
            path,
            href,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name without port; IPv6 literals are unbracketed
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> Option<u32> {
        self.port
    }

    /// Path plus query string, always starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    /// `hostname[:port]`, suitable for the `Host` header
    pub fn host(&self) -> String {
        format_host(&self.hostname, self.port)
    }

    /// Port to dial: the explicit one if it fits, else the scheme default
    pub fn port_or_default(&self) -> u16 {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub fn is_ip_literal(&self) -> bool {
        self.hostname.parse::<IpAddr>().is_ok()
    }
}

impl fmt::Display for TargetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href)
    }
}

/// Normalize a raw target, returning `None` when no usable host can be found.
pub fn parse_target(raw: &str) -> Option<TargetLocation> {
    let (scheme, rest) = match strip_explicit_scheme(raw) {
        Some(found) => found,
        None => {
            if has_scheme_prefix(raw) {
                // "http:/host" and "http:///" would otherwise yield host "http:"
                return None;
            }
            let rest = raw.strip_prefix("//").unwrap_or(raw);
            let (authority, _) = split_authority(rest);
            let scheme = match split_host_port(authority) {
                Some((_, Some("443"))) => Scheme::Https,
                _ => Scheme::Http,
            };
            (scheme, rest)
        }
    };

    let (authority, path) = split_authority(rest);
    let (hostname, port) = split_host_port(authority)?;
    if hostname.is_empty() {
        return None;
    }

    let port = match port {
        // Digits past u32 still count as a port so validation can reject them.
        Some(digits) if digits.bytes().all(|b| b.is_ascii_digit()) => {
            Some(digits.parse::<u32>().unwrap_or(u32::MAX))
        }
        Some(_) => return None,
        None => None,
    };

    Some(TargetLocation::new(
        scheme,
        hostname.to_ascii_lowercase(),
        port,
        normalize_path(path),
    ))
}

/// Resolve a `Location` header against the current target and normalize the
/// result. Returns the resolved URL string together with the new target.
pub fn resolve_redirect(
    current: &TargetLocation,
    location: &str,
) -> Option<(String, TargetLocation)> {
    let resolved = Url::parse(current.href()).ok()?.join(location).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    let target = parse_target(resolved.as_str())?;
    Some((resolved.into(), target))
}

fn strip_explicit_scheme(raw: &str) -> Option<(Scheme, &str)> {
    [("https://", Scheme::Https), ("http://", Scheme::Http)]
        .into_iter()
        .find_map(|(prefix, scheme)| {
            let head = raw.get(..prefix.len())?;
            head.eq_ignore_ascii_case(prefix)
                .then(|| (scheme, &raw[prefix.len()..]))
        })
}

fn has_scheme_prefix(raw: &str) -> bool {
    ["http:", "https:"].iter().any(|prefix| {
        raw.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Split `authority/rest` at the first `/`, `?` or `#`
fn split_authority(rest: &str) -> (&str, &str) {
    match rest.find(['/', '?', '#']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    }
}

/// Split an authority into hostname and raw port text. Userinfo is dropped.
fn split_host_port(authority: &str) -> Option<(&str, Option<&str>)> {
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);

    if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        let port = match after {
            "" => None,
            after => Some(after.strip_prefix(':')?),
        };
        return Some((host, port.filter(|p| !p.is_empty())));
    }

    match host_port.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => None,
        Some((host, port)) => Some((host, (!port.is_empty()).then_some(port))),
        None => Some((host_port, None)),
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.split_once('#').map_or(path, |(before, _)| before);
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('?') {
        format!("/{}", path)
    } else {
        path.to_string()
    }
}

fn format_host(hostname: &str, port: Option<u32>) -> String {
    let hostname = if hostname.contains(':') {
        format!("[{}]", hostname)
    } else {
        hostname.to_string()
    };
    match port {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname,
    }
}
