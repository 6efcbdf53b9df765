use near_sdk::{near, store::IterableMap, AccountId, IntoStorageKey};

use crate::error::BridgeError;
use crate::swap::Balance;

/// Per-sender balance of funds pooled on the registry for swaps whose receiver is the provider.
#[near(serializers = [borsh])]
pub struct DepositLedger {
    // AccountId -> Balance
    deposits: IterableMap<AccountId, Balance>,
    // Sum of all entries, kept in step by credit and debit
    total: Balance,
}

impl DepositLedger {
    pub fn new<S: IntoStorageKey>(prefix: S) -> Self {
        Self {
            deposits: IterableMap::new(prefix),
            total: 0,
        }
    }
}

pub trait HasDeposits {
    fn deposit_of(&self, account_id: &AccountId) -> Balance;
    fn total_deposits(&self) -> Balance;
    fn credit(&mut self, account_id: &AccountId, amount: Balance) -> Result<Balance, BridgeError>;
    fn debit(&mut self, account_id: &AccountId, amount: Balance) -> Result<Balance, BridgeError>;
}

impl HasDeposits for DepositLedger {
    fn deposit_of(&self, account_id: &AccountId) -> Balance {
        self.deposits.get(account_id).copied().unwrap_or(0)
    }

    fn total_deposits(&self) -> Balance {
        self.total
    }

    fn credit(&mut self, account_id: &AccountId, amount: Balance) -> Result<Balance, BridgeError> {
        let balance = self
            .deposit_of(account_id)
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        let total = self.total.checked_add(amount).ok_or(BridgeError::Overflow)?;
        self.deposits.insert(account_id.clone(), balance);
        self.total = total;
        Ok(balance)
    }

    fn debit(&mut self, account_id: &AccountId, amount: Balance) -> Result<Balance, BridgeError> {
        let balance = self
            .deposit_of(account_id)
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientFunds)?;
        if balance == 0 {
            self.deposits.remove(account_id);
        } else {
            self.deposits.insert(account_id.clone(), balance);
        }
        self.total -= amount;
        Ok(balance)
    }
}
