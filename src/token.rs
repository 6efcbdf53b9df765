use std::collections::HashMap;

use near_sdk::json_types::U128;
use near_sdk::{env, AccountId, NearToken, Promise};

use crate::error::BridgeError;
use crate::ext_fungible_token;
use crate::swap::Balance;

/// The fungible token the registry custodies. Both calls are all-or-nothing.
pub trait TokenLedger {
    /// Moves `amount` from `owner` into registry custody, spending the owner's allowance.
    fn transfer_from(&mut self, owner: &AccountId, amount: Balance) -> Result<(), BridgeError>;

    /// Moves `amount` out of registry custody to `receiver`.
    fn transfer(&mut self, receiver: &AccountId, amount: Balance) -> Result<(), BridgeError>;
}

/// In-memory token with balances and allowances, for tests and local simulation.
#[derive(Clone, Debug)]
pub struct MemoryLedger {
    custodian: AccountId,
    balances: HashMap<AccountId, Balance>,
    allowances: HashMap<(AccountId, AccountId), Balance>,
}

impl MemoryLedger {
    /// `custodian` is the account the registry holds funds under.
    pub fn new(custodian: AccountId) -> Self {
        Self {
            custodian,
            balances: HashMap::new(),
            allowances: HashMap::new(),
        }
    }

    pub fn mint(&mut self, account_id: &AccountId, amount: Balance) {
        *self.balances.entry(account_id.clone()).or_default() += amount;
    }

    pub fn approve(&mut self, owner: &AccountId, spender: &AccountId, amount: Balance) {
        self.allowances
            .insert((owner.clone(), spender.clone()), amount);
    }

    pub fn balance_of(&self, account_id: &AccountId) -> Balance {
        self.balances.get(account_id).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Balance {
        self.allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn move_balance(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), BridgeError> {
        let from_balance = self
            .balance_of(from)
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientFunds)?;
        let to_balance = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        self.balances.insert(from.clone(), from_balance);
        self.balances.insert(to.clone(), to_balance);
        Ok(())
    }
}

impl TokenLedger for MemoryLedger {
    fn transfer_from(&mut self, owner: &AccountId, amount: Balance) -> Result<(), BridgeError> {
        let custodian = self.custodian.clone();
        let allowance = self.allowance(owner, &custodian);
        if allowance < amount {
            return Err(BridgeError::InsufficientAuthorization);
        }
        self.move_balance(owner, &custodian, amount)?;
        self.approve(owner, &custodian, allowance - amount);
        Ok(())
    }

    fn transfer(&mut self, receiver: &AccountId, amount: Balance) -> Result<(), BridgeError> {
        let custodian = self.custodian.clone();
        self.move_balance(&custodian, receiver, amount)
    }
}

/// On-chain ledger backed by a NEP-141 token contract.
///
/// Outbound transfers become `ft_transfer` promises joined into one batch.
/// Inbound transfers are never issued from here: the pull has already happened
/// (through `ft_transfer_from` or `ft_transfer_call`) and only the matching
/// funding is accepted.
pub struct PromiseLedger {
    token_id: AccountId,
    funded: Option<(AccountId, Balance)>,
    pending: Option<Promise>,
}

impl PromiseLedger {
    pub fn new(token_id: AccountId) -> Self {
        Self {
            token_id,
            funded: None,
            pending: None,
        }
    }

    /// A ledger that already received `amount` from `owner`.
    pub fn funded(token_id: AccountId, owner: AccountId, amount: Balance) -> Self {
        Self {
            token_id,
            funded: Some((owner, amount)),
            pending: None,
        }
    }

    /// The joined outbound transfers, if any were queued.
    pub fn into_promise(self) -> Option<Promise> {
        self.pending
    }
}

impl TokenLedger for PromiseLedger {
    fn transfer_from(&mut self, owner: &AccountId, amount: Balance) -> Result<(), BridgeError> {
        match self.funded.take() {
            Some((funder, funded)) if &funder == owner && funded == amount => Ok(()),
            _ => Err(BridgeError::InsufficientAuthorization),
        }
    }

    fn transfer(&mut self, receiver: &AccountId, amount: Balance) -> Result<(), BridgeError> {
        let transfer = ext_fungible_token::ext(self.token_id.clone())
            .with_attached_deposit(NearToken::from_yoctonear(1))
            .with_static_gas(env::prepaid_gas().saturating_div(4))
            .ft_transfer(
                receiver.clone(),
                U128(amount),
                Some("Remchain bridge".to_string()),
            );
        self.pending = Some(match self.pending.take() {
            Some(batch) => batch.and(transfer),
            None => transfer,
        });
        Ok(())
    }
}
