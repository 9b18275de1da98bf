//! Wire grammar for the multi-system sampling header.
//!
//! One header value encodes zero or more systems, semicolon-separated:
//!
//! ```text
//! <system>(:<k>=<v>(,<k>=<v>)*)?  (; <system>...)*
//! ```
//!
//! System names match `[a-z][a-z0-9-]*`. Absent value parts are tolerated on
//! ingress (`edge:` reads as a bare `edge`) and canonicalized on egress.
//! A segment that cannot be parsed is dropped; the rest of the header
//! survives.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

pub(crate) const SAMPLED_PARAM: &str = "sampled";
pub(crate) const TTL_PARAM: &str = "ttl";
pub(crate) const TPS_PARAM: &str = "tps";

lazy_static! {
    static ref SYSTEM_NAME_REGEX: Regex =
        Regex::new(r"^[a-z][a-z0-9-]*$").expect("failed creating regex");
}

/// One system's slice of the sampling header: its name and ordered
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct System {
    pub(crate) name: String,
    pub(crate) params: Vec<(String, String)>,
}

impl System {
    pub(crate) fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_param(&mut self, key: &str, value: String) {
        if let Some(entry) = self.params.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.params.push((key.to_string(), value));
        }
    }
}

/// Parses a header value, dropping malformed segments and merging duplicate
/// system names (later parameters win, the first position is kept).
pub(crate) fn parse(value: &str) -> Vec<System> {
    let mut systems: Vec<System> = Vec::new();
    for segment in value.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match parse_segment(segment) {
            Some(system) => {
                if let Some(existing) = systems.iter_mut().find(|s| s.name == system.name) {
                    existing.params = system.params;
                } else {
                    systems.push(system);
                }
            }
            None => debug!(segment, "dropping unreadable sampling segment"),
        }
    }
    systems
}

fn parse_segment(segment: &str) -> Option<System> {
    let (name, params_raw) = match segment.split_once(':') {
        Some((name, rest)) => (name.trim(), rest.trim()),
        None => (segment, ""),
    };
    if !SYSTEM_NAME_REGEX.is_match(name) {
        return None;
    }

    let mut system = System {
        name: name.to_string(),
        params: Vec::new(),
    };
    for part in params_raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        system.set_param(key, value.trim().to_string());
    }
    Some(system)
}

/// Serializes systems back into one header value. Parameterless systems
/// render as their bare name.
pub(crate) fn serialize(systems: &[System]) -> String {
    let mut out = String::new();
    for system in systems {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(&system.name);
        for (i, (key, value)) in system.params.iter().enumerate() {
            out.push(if i == 0 { ':' } else { ',' });
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// Rewrites a recorded system's parameters into canonical order:
/// `sampled=1` first, then the ttl (replaced when `ttl` is given, otherwise
/// carried over), then `tps` when kept, then unrecognized parameters in
/// ingress order.
pub(crate) fn canonicalize(system: &mut System, ttl: Option<u64>, keep_tps: bool) {
    let mut params: Vec<(String, String)> = Vec::with_capacity(system.params.len() + 1);
    params.push((SAMPLED_PARAM.to_string(), "1".to_string()));
    match ttl {
        Some(ttl) => params.push((TTL_PARAM.to_string(), ttl.to_string())),
        None => {
            if let Some(existing) = system.param(TTL_PARAM) {
                params.push((TTL_PARAM.to_string(), existing.to_string()));
            }
        }
    }
    if keep_tps {
        if let Some(tps) = system.param(TPS_PARAM) {
            params.push((TPS_PARAM.to_string(), tps.to_string()));
        }
    }
    for (key, value) in &system.params {
        if key != SAMPLED_PARAM && key != TTL_PARAM && key != TPS_PARAM {
            params.push((key.clone(), value.clone()));
        }
    }
    system.params = params;
}
