//! Account resolution with lazy creation.
//!
//! `resolve` is get-or-create keyed by (organization, code). Creation goes
//! through `INSERT .. ON CONFLICT DO NOTHING` followed by a re-read, so two
//! resolvers racing on the same code (in this process or another one) both end
//! up with the single stored row. The in-memory cache only saves round trips.
//!
//! A cached id is not re-checked here. Another process may deactivate the
//! account after it was cached; the posting transaction re-checks every
//! account and the poster then drops the stale ids via [`AccountRegistry::forget`].

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chart::StandardAccount;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, AccountId, AccountType};
use crate::storage::LedgerStore;

/// Resolves account codes to ids for posting.
pub struct AccountRegistry {
    store: LedgerStore,
    cache: RwLock<HashMap<(String, String), AccountId>>,
}

impl AccountRegistry {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Return the id of (organization_id, code), creating the account with
    /// `fallback_name` and `account_type` if it does not exist yet.
    pub fn resolve(
        &self,
        organization_id: &str,
        code: &str,
        fallback_name: &str,
        account_type: AccountType,
    ) -> LedgerResult<AccountId> {
        if organization_id.trim().is_empty() {
            return Err(LedgerError::configuration(format!(
                "cannot resolve account {} without an organization",
                code
            )));
        }

        let key = (organization_id.to_string(), code.to_string());
        if let Some(id) = self.cache.read().get(&key) {
            return Ok(*id);
        }

        let account = match self.lookup(organization_id, code)? {
            Some(existing) => existing,
            None => self.create(organization_id, code, fallback_name, account_type)?,
        };

        if account.account_type != account_type {
            warn!(
                organization_id = %organization_id,
                code = %code,
                stored = account.account_type.as_str(),
                requested = account_type.as_str(),
                "Account type differs from requested type; keeping stored type"
            );
        }
        ensure_postable(&account)?;

        self.cache.write().insert(key, account.id);
        Ok(account.id)
    }

    /// Resolve one of the fixed chart accounts.
    pub fn resolve_standard(
        &self,
        organization_id: &str,
        account: StandardAccount,
    ) -> LedgerResult<AccountId> {
        self.resolve(
            organization_id,
            account.code(),
            account.fallback_name(),
            account.account_type(),
        )
    }

    /// Create every standard account for an organization up front.
    pub fn seed_standard_chart(&self, organization_id: &str) -> LedgerResult<Vec<AccountId>> {
        StandardAccount::ALL
            .iter()
            .map(|account| self.resolve_standard(organization_id, *account))
            .collect()
    }

    /// Deactivate an account so it can no longer be posted to.
    pub fn deactivate(&self, organization_id: &str, code: &str) -> LedgerResult<bool> {
        let changed = self
            .store
            .deactivate_account(organization_id, code)
            .map_err(|e| storage_failure(code, e))?;
        self.cache
            .write()
            .remove(&(organization_id.to_string(), code.to_string()));
        if changed {
            info!(organization_id = %organization_id, code = %code, "Account deactivated");
        }
        Ok(changed)
    }

    /// Drop cached ids of `organization_id` that point at any of `account_ids`.
    pub fn forget<I>(&self, organization_id: &str, account_ids: I) -> usize
    where
        I: IntoIterator<Item = AccountId>,
    {
        let stale: Vec<AccountId> = account_ids.into_iter().collect();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|(org, _), id| org != organization_id || !stale.contains(id));
        before - cache.len()
    }

    /// Drop all cached ids.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    fn lookup(&self, organization_id: &str, code: &str) -> LedgerResult<Option<Account>> {
        self.store
            .find_account(organization_id, code)
            .map_err(|e| storage_failure(code, e))
    }

    fn create(
        &self,
        organization_id: &str,
        code: &str,
        name: &str,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        let candidate = Account {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            account_type,
            is_group: false,
            is_active: true,
        };

        let created = self
            .store
            .insert_account_if_absent(&candidate)
            .map_err(|e| storage_failure(code, e))?;

        if created {
            info!(
                organization_id = %organization_id,
                code = %code,
                name = %name,
                account_type = account_type.as_str(),
                "Auto-created ledger account"
            );
            return Ok(candidate);
        }

        // Lost the race: another writer created it between lookup and insert.
        debug!(organization_id = %organization_id, code = %code, "Account created concurrently, re-reading");
        self.lookup(organization_id, code)?
            .ok_or_else(|| LedgerError::AccountResolution {
                code: code.to_string(),
                reason: "account vanished after conflicting insert".to_string(),
                retryable: true,
            })
    }
}

fn ensure_postable(account: &Account) -> LedgerResult<()> {
    if account.is_group {
        return Err(LedgerError::AccountResolution {
            code: account.code.clone(),
            reason: "group accounts cannot be posted to".to_string(),
            retryable: false,
        });
    }
    if !account.is_active {
        return Err(LedgerError::AccountResolution {
            code: account.code.clone(),
            reason: "account is deactivated".to_string(),
            retryable: false,
        });
    }
    Ok(())
}

fn storage_failure(code: &str, e: LedgerError) -> LedgerError {
    match e {
        LedgerError::Storage(inner) => LedgerError::account_storage(code, inner),
        other => other,
    }
}
