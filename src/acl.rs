//! Access-list collaborator.
//!
//! `contains_ip` / `contains_domain` decide whether a session's destination
//! should bypass the relay entirely and go out `direct`. A missing or empty
//! list degrades to "never direct".

use std::io;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;

/// A flat, line-oriented direct/bypass list: one entry per line, `#`
/// comments and blank lines ignored. An entry that parses as an IP or CIDR
/// range is matched against destination IPs; anything else is matched as an
/// exact-or-suffix domain match (`example.com` also matches
/// `www.example.com`).
#[derive(Debug, Default, Clone)]
pub struct AccessControl {
    networks: Vec<IpNet>,
    domains: Vec<String>,
}

impl AccessControl {
    /// An access list with no entries: `contains_ip`/`contains_domain` are
    /// always `false`, so no destination is ever routed direct by policy.
    pub fn empty() -> AccessControl {
        AccessControl::default()
    }

    pub fn load_from_file(path: &Path) -> io::Result<AccessControl> {
        let text = std::fs::read_to_string(path)?;
        Ok(AccessControl::parse(&text))
    }

    pub(crate) fn parse(text: &str) -> AccessControl {
        let mut acl = AccessControl::default();
        for raw_line in text.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Ok(net) = line.parse::<IpNet>() {
                acl.networks.push(net);
            } else if let Ok(ip) = line.parse::<IpAddr>() {
                acl.networks.push(IpNet::from(ip));
            } else {
                acl.domains.push(line.to_ascii_lowercase());
            }
        }
        acl
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn contains_domain(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}
