//! Account records loaded from the YAML accounts file.
//!
//! ```yaml
//! accounts:
//!   - name: user1
//!     token: '123456'
//!     reuse: false
//!     routes: ['127.0.0.1:8888', '192.168.1.2:5050']
//!     allowedIps: ['127.0.0.1', '172.16.0.0/16']
//! ```
//!
//! Routes are matched by exact string comparison against the
//! `X-Route-Address:X-Route-Port` pair (or `X-Auth-Route`) presented at
//! upgrade time. `allowedIps` entries may be bare addresses or CIDR ranges;
//! both are pre-parsed into [`IpNet`] at load so authentication never parses.
//!
//! Tokens must be unique across the whole file; a duplicate fails the load.

use std::collections::{HashSet, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

/// Why an accounts file could not be turned into a usable generation.
#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("failed to read accounts file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse accounts file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate token shared by accounts {first:?} and {second:?}")]
    DuplicateToken { first: String, second: String },
    #[error("account {account:?} has an invalid allowedIps entry {entry:?}")]
    InvalidAllowedIp { account: String, entry: String },
}

/// One account record, immutable once loaded. Connections hold an
/// `Arc<Account>` for the generation they authenticated against, so a reload
/// never invalidates an in-flight lease.
#[derive(Debug)]
pub struct Account {
    pub name: String,
    pub token: String,
    /// Whether the account may hold more than one lease at a time.
    pub reuse: bool,
    routes: HashSet<String>,
    allowed_ips: Vec<IpNet>,
}

impl Account {
    pub fn allows_route(&self, route: &str) -> bool {
        self.routes.contains(route)
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&ip))
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawAccount {
    name: String,
    token: String,
    #[serde(default)]
    reuse: bool,
    #[serde(default)]
    routes: Vec<String>,
    #[serde(default)]
    allowed_ips: Vec<String>,
}

/// Parse `allowedIps` entries: either a CIDR range or a bare address
/// (treated as a single-host range).
fn parse_allowed_ip(entry: &str) -> Option<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }
    let addr: IpAddr = entry.parse().ok()?;
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, prefix).ok()
}

fn build(file: AccountsFile) -> Result<Vec<Arc<Account>>, AccountsError> {
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for raw in &file.accounts {
        if let Some(first) = seen.insert(raw.token.as_str(), raw.name.as_str()) {
            return Err(AccountsError::DuplicateToken {
                first: first.to_string(),
                second: raw.name.clone(),
            });
        }
    }

    file.accounts
        .into_iter()
        .map(|raw| {
            let allowed_ips = raw
                .allowed_ips
                .iter()
                .map(|entry| {
                    parse_allowed_ip(entry).ok_or_else(|| AccountsError::InvalidAllowedIp {
                        account: raw.name.clone(),
                        entry: entry.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(Account {
                name: raw.name,
                token: raw.token,
                reuse: raw.reuse,
                routes: raw.routes.into_iter().collect(),
                allowed_ips,
            }))
        })
        .collect()
}

/// Load and validate an accounts file from disk.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<Arc<Account>>, AccountsError> {
    let path_str = path.as_ref().display().to_string();
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| AccountsError::Io {
        path: path_str.clone(),
        source,
    })?;
    let file: AccountsFile =
        serde_yaml::from_str(&raw).map_err(|source| AccountsError::Parse {
            path: path_str,
            source,
        })?;
    build(file)
}

/// Parse accounts from an in-memory YAML document.
pub fn parse(yaml: &str) -> Result<Vec<Arc<Account>>, AccountsError> {
    let file: AccountsFile =
        serde_yaml::from_str(yaml).map_err(|source| AccountsError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
    build(file)
}

/// The union of all routes across a set of accounts, used for startup logging.
pub fn all_routes(accounts: &[Arc<Account>]) -> BTreeSet<String> {
    accounts
        .iter()
        .flat_map(|a| a.routes().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
accounts:
  - name: user1
    token: '123456'
    reuse: false
    routes: ['127.0.0.1:8888', '192.168.1.2:5050']
    allowedIps: ['127.0.0.1', '172.16.0.0/16']
  - name: user2
    token: 'abcdef'
    reuse: true
    routes: ['127.0.0.1:8888']
    allowedIps: ['0.0.0.0/0']
";

    #[test]
    fn parses_sample_file() {
        let accounts = parse(SAMPLE).unwrap();
        assert_eq!(accounts.len(), 2);
        let user1 = &accounts[0];
        assert_eq!(user1.name, "user1");
        assert!(!user1.reuse);
        assert!(user1.allows_route("127.0.0.1:8888"));
        assert!(!user1.allows_route("127.0.0.1:9999"));
    }

    #[test]
    fn bare_address_matches_only_itself() {
        let accounts = parse(SAMPLE).unwrap();
        let user1 = &accounts[0];
        assert!(user1.allows_ip("127.0.0.1".parse().unwrap()));
        assert!(!user1.allows_ip("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_range_contains_members() {
        let accounts = parse(SAMPLE).unwrap();
        let user1 = &accounts[0];
        assert!(user1.allows_ip("172.16.5.9".parse().unwrap()));
        assert!(user1.allows_ip("172.16.255.1".parse().unwrap()));
        assert!(!user1.allows_ip("172.17.0.1".parse().unwrap()));
        assert!(!user1.allows_ip("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn duplicate_tokens_fail_load() {
        let yaml = r"
accounts:
  - name: a
    token: 'same'
    routes: ['127.0.0.1:1']
    allowedIps: ['0.0.0.0/0']
  - name: b
    token: 'same'
    routes: ['127.0.0.1:2']
    allowedIps: ['0.0.0.0/0']
";
        match parse(yaml) {
            Err(AccountsError::DuplicateToken { first, second }) => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("expected duplicate-token error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_cidr_fails_load() {
        let yaml = r"
accounts:
  - name: a
    token: 't'
    routes: []
    allowedIps: ['not-an-ip']
";
        assert!(matches!(
            parse(yaml),
            Err(AccountsError::InvalidAllowedIp { .. })
        ));
    }

    #[test]
    fn malformed_yaml_fails_load() {
        assert!(matches!(
            parse("accounts: [/"),
            Err(AccountsError::Parse { .. })
        ));
    }

    #[test]
    fn route_union_spans_accounts() {
        let accounts = parse(SAMPLE).unwrap();
        let routes = all_routes(&accounts);
        assert!(routes.contains("127.0.0.1:8888"));
        assert!(routes.contains("192.168.1.2:5050"));
        assert_eq!(routes.len(), 2);
    }
}
