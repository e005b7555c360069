//! Token authentication and account leasing.
//!
//! [`TokenAuthenticator`] holds one *generation* of accounts at a time: an
//! O(1) token index plus the union of configured routes. `reload` parses the
//! file into a fresh generation and swaps it in atomically — readers observe
//! either the old or the new generation in full, never a mix. A failed reload
//! (parse error, duplicate token) leaves the current generation untouched.
//!
//! Leases are tracked separately from generations. A lease pins the exact
//! [`Account`] object it was granted against (`Arc` identity), so reloading
//! the file does not invalidate connections admitted under the previous
//! generation.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info};

use crate::accounts::{self, Account, AccountsError};

/// Derived indexes for one accounts generation.
struct AccountIndex {
    by_token: HashMap<String, Arc<Account>>,
    routes: HashSet<String>,
}

impl AccountIndex {
    fn build(accounts: &[Arc<Account>]) -> Self {
        let by_token = accounts
            .iter()
            .map(|a| (a.token.clone(), Arc::clone(a)))
            .collect();
        let routes = accounts
            .iter()
            .flat_map(|a| a.routes().map(str::to_string))
            .collect();
        Self { by_token, routes }
    }
}

/// Shared authenticator, safe for concurrent use from every connection task.
pub struct TokenAuthenticator {
    config_file: Option<PathBuf>,
    index: RwLock<Arc<AccountIndex>>,
    /// Currently leased accounts. A `reuse` account may appear more than once.
    active: Mutex<Vec<Arc<Account>>>,
}

impl TokenAuthenticator {
    /// Load the initial generation from the accounts file. Errors here are
    /// fatal; only *re*loads fall back to the previous generation.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, AccountsError> {
        let path = path.into();
        let loaded = accounts::load(&path)?;
        info!(
            accounts = loaded.len(),
            file = %path.display(),
            "loaded account store"
        );
        Ok(Self {
            config_file: Some(path),
            index: RwLock::new(Arc::new(AccountIndex::build(&loaded))),
            active: Mutex::new(Vec::new()),
        })
    }

    /// Build an authenticator directly from account records.
    pub fn from_accounts(accounts: Vec<Arc<Account>>) -> Self {
        Self {
            config_file: None,
            index: RwLock::new(Arc::new(AccountIndex::build(&accounts))),
            active: Mutex::new(Vec::new()),
        }
    }

    fn current(&self) -> Arc<AccountIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Authenticate a token for a route and client IP.
    ///
    /// All failure modes are indistinguishable to the caller (`None`); each
    /// is logged at debug so operators can tell a bad token from a bad route.
    pub fn authenticate(&self, token: &str, route: &str, client_ip: IpAddr) -> Option<Arc<Account>> {
        let index = self.current();
        let Some(account) = index.by_token.get(token) else {
            debug!(%client_ip, "token does not match any account");
            return None;
        };
        if !account.allows_route(route) {
            debug!(%client_ip, account = %account.name, route, "route not allowed for account");
            return None;
        }
        if !account.allows_ip(client_ip) {
            debug!(%client_ip, account = %account.name, "client IP not in any allowed range");
            return None;
        }
        Some(Arc::clone(account))
    }

    /// Whether any account in the current generation has `route` configured.
    pub fn contains_route(&self, route: &str) -> bool {
        self.current().routes.contains(route)
    }

    /// Take a lease on `account`. Fails when the account is already leased
    /// and does not permit reuse.
    pub fn lease(&self, account: &Arc<Account>) -> bool {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !account.reuse && active.iter().any(|a| Arc::ptr_eq(a, account)) {
            return false;
        }
        active.push(Arc::clone(account));
        true
    }

    /// Release one lease on `account`. Returns whether a lease was held.
    pub fn release(&self, account: &Arc<Account>) -> bool {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match active.iter().position(|a| Arc::ptr_eq(a, account)) {
            Some(pos) => {
                active.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Re-parse the accounts file and swap in the new generation. On any
    /// failure the current generation stays in effect.
    pub fn reload(&self) {
        let Some(path) = &self.config_file else {
            debug!("no accounts file configured, skipping reload");
            return;
        };
        match accounts::load(path) {
            Ok(loaded) => {
                let next = Arc::new(AccountIndex::build(&loaded));
                *self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner) = next;
                debug!(accounts = loaded.len(), "account store reloaded");
            }
            Err(err) => {
                error!(file = %path.display(), error = %err, "accounts reload failed, keeping current generation");
            }
        }
    }
}
