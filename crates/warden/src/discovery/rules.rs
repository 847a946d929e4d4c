//! Router rule parsing
//!
//! Extracts host names from Traefik router rules such as
//! ``Host(`app.example.com`) && PathPrefix(`/api`)``.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Label keys carrying router rules contain this and end in `rule`
const ROUTER_LABEL_MARKER: &str = "traefik.http.routers";

static HOST_MATCHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhost\(([^)]*)\)").unwrap_or_else(|e| panic!("invalid host matcher: {e}"))
});

static BACKTICKED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap_or_else(|e| panic!("invalid name matcher: {e}")));

/// Whether a container label key names a router rule
pub fn is_router_rule_label(key: &str) -> bool {
    key.contains(ROUTER_LABEL_MARKER) && key.ends_with("rule")
}

/// Host names named by `Host(...)` matchers in `rule`, in order
pub fn hosts_in_rule(rule: &str) -> Vec<String> {
    HOST_MATCHER
        .captures_iter(rule)
        .filter_map(|caps| caps.get(1))
        .flat_map(|args| {
            BACKTICKED
                .captures_iter(args.as_str())
                .filter_map(|name| name.get(1))
                .map(|name| name.as_str().trim().to_string())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Host names from every router rule label, sorted and deduplicated
pub fn hosts_in_labels(labels: &HashMap<String, String>) -> Vec<String> {
    let mut hosts: Vec<String> = labels
        .iter()
        .filter(|(key, _)| is_router_rule_label(key))
        .flat_map(|(_, rule)| hosts_in_rule(rule))
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}
