use near_sdk::env::log_str;
use near_sdk::json_types::{Base58CryptoHash, Base64VecU8, U128};
use near_sdk::{
    env, ext_contract, near, require, serde_json, AccountId, NearToken, PanicOnDefault, Promise,
    PromiseOrValue,
};

mod deposit;
mod error;
mod registry;
mod swap;
mod timelocks;
mod token;
mod utils;

pub use deposit::{DepositLedger, HasDeposits};
pub use error::BridgeError;
pub use registry::{BridgeConfig, CallContext, SwapRegistry};
pub use swap::{
    Balance, Custody, Settlement, Swap, SwapDetails, SwapId, SwapInfo, SwapState, SwapTerms,
    MAX_ENCRYPTED_CONTACT_LEN, MAX_REMOTE_ADDRESS_LEN, MAX_SECRET_KEY_LEN,
};
pub use timelocks::{KeyHolder, RECEIVER_LOCK_HOURS, SENDER_LOCK_HOURS};
pub use token::{MemoryLedger, PromiseLedger, TokenLedger};

use utils::{log_bridge_event, promises_succeeded};

// External contract interfaces
#[ext_contract(ext_fungible_token)]
pub trait FungibleToken {
    fn ft_transfer(&mut self, receiver_id: AccountId, amount: U128, memo: Option<String>);
    fn ft_transfer_from(
        &mut self,
        owner_id: AccountId,
        new_owner_id: AccountId,
        amount: U128,
        memo: Option<String>,
    );
}

#[ext_contract(ext_self)]
pub trait SelfCallbacks {
    fn on_swap_funded(
        &mut self,
        sender_id: AccountId,
        terms: SwapTerms,
        amount: U128,
        storage_deposit: NearToken,
    ) -> bool;
    fn on_swap_settled(&mut self, swap_id: SwapId, prior_state: SwapState) -> bool;
    fn on_withdrawal_settled(&mut self, amount: U128) -> bool;
    fn on_fee_forwarded(&mut self, amount: U128) -> bool;
    fn on_refund_settled(&mut self, account_id: AccountId, amount: U128) -> bool;
}

#[near(contract_state)]
#[derive(PanicOnDefault)]
pub struct Contract {
    pub registry: SwapRegistry,
}

#[near]
impl Contract {
    #[init]
    pub fn new(config: BridgeConfig) -> Self {
        require!(
            config.provider_id != config.cold_storage_id,
            "Cold storage must differ from the swap provider"
        );
        Self {
            registry: SwapRegistry::new(config),
        }
    }

    /// Opens a swap funded from the caller's allowance on the bridged token.
    /// The pull is asynchronous: the swap exists once `on_swap_funded` succeeds.
    ///
    /// The attached deposit must cover the storage of the new swap. Whatever
    /// exceeds it is forwarded to the provider once the swap is open, and the
    /// whole deposit is returned if the open fails.
    #[payable]
    pub fn open_swap(
        &mut self,
        id: Base58CryptoHash,
        receiver: AccountId,
        secret_lock: Option<Base58CryptoHash>,
        amount: U128,
        remote_address: String,
        encrypted_contact: Base64VecU8,
    ) -> Promise {
        let sender_id = env::predecessor_account_id();
        let terms = SwapTerms {
            id,
            receiver,
            secret_lock,
            remote_address,
            encrypted_contact,
        };
        self.registry
            .check_open(&terms, amount.0)
            .unwrap_or_else(|err| err.panic());
        let storage_deposit = env::attached_deposit();
        require!(
            storage_deposit >= Self::storage_cost(&terms),
            "Attached deposit does not cover swap storage"
        );

        ext_fungible_token::ext(self.registry.config().token_id.clone())
            .with_attached_deposit(NearToken::from_yoctonear(1))
            .with_static_gas(env::prepaid_gas().saturating_div(4))
            .ft_transfer_from(
                sender_id.clone(),
                env::current_account_id(),
                amount,
                Some("Remchain bridge swap".to_string()),
            )
            .then(
                ext_self::ext(env::current_account_id())
                    .with_static_gas(env::prepaid_gas().saturating_div(4))
                    .on_swap_funded(sender_id, terms, amount, storage_deposit),
            )
    }

    /// NEP-141 receiver: opens a swap with tokens sent through `ft_transfer_call`.
    /// `msg` carries the JSON-encoded `SwapTerms`. Any rejection refunds the whole amount.
    pub fn ft_on_transfer(
        &mut self,
        sender_id: AccountId,
        amount: U128,
        msg: String,
    ) -> PromiseOrValue<U128> {
        if env::predecessor_account_id() != self.registry.config().token_id {
            log_str("Rejected transfer of an unsupported token");
            return PromiseOrValue::Value(amount);
        }
        let terms: SwapTerms = match serde_json::from_str(&msg) {
            Ok(terms) => terms,
            Err(_) => {
                log_str("Rejected transfer with invalid swap terms");
                return PromiseOrValue::Value(amount);
            }
        };

        let mut ledger = PromiseLedger::funded(
            self.registry.config().token_id.clone(),
            sender_id.clone(),
            amount.0,
        );
        let fee = self.registry.config().fee.0;
        let ctx = CallContext::new(sender_id, env::block_timestamp());
        match self.registry.open_swap(&ctx, &mut ledger, terms, amount.0) {
            Ok(()) => {
                // The fee transfer settles on its own; the sender's refund does not wait for it.
                Self::settle_fee(ledger, fee);
                PromiseOrValue::Value(U128(0))
            }
            Err(err) => {
                log_str(&format!("Swap open rejected: {}", err));
                PromiseOrValue::Value(amount)
            }
        }
    }

    pub fn set_secret_lock(&mut self, id: Base58CryptoHash, secret_lock: Base58CryptoHash) {
        self.registry
            .set_secret_lock(&CallContext::from_env(), &id.into(), secret_lock.into())
            .unwrap_or_else(|err| err.panic());
    }

    pub fn approve_swap(&mut self, id: Base58CryptoHash) {
        self.registry
            .approve_swap(&CallContext::from_env(), &id.into())
            .unwrap_or_else(|err| err.panic());
    }

    /// Returns `true` once the receiver has been paid, or immediately when the
    /// provider closes a pooled swap.
    pub fn close_swap(
        &mut self,
        id: Base58CryptoHash,
        secret_key: Base64VecU8,
    ) -> PromiseOrValue<bool> {
        let swap_id: SwapId = id.into();
        let mut ledger = PromiseLedger::new(self.registry.config().token_id.clone());
        let settlement = self
            .registry
            .close_swap(&CallContext::from_env(), &mut ledger, &swap_id, secret_key.0)
            .unwrap_or_else(|err| err.panic());
        Self::resolve_settlement(ledger, swap_id, settlement)
    }

    pub fn expire_swap(&mut self, id: Base58CryptoHash) -> PromiseOrValue<bool> {
        let swap_id: SwapId = id.into();
        let mut ledger = PromiseLedger::new(self.registry.config().token_id.clone());
        let settlement = self
            .registry
            .expire_swap(&CallContext::from_env(), &mut ledger, &swap_id)
            .unwrap_or_else(|err| err.panic());
        Self::resolve_settlement(ledger, swap_id, settlement)
    }

    pub fn set_fee(&mut self, fee: U128) {
        self.registry
            .set_fee(&CallContext::from_env(), fee.0)
            .unwrap_or_else(|err| err.panic());
    }

    /// Provider-only payout of funds from swaps it closed as receiver.
    pub fn withdraw_settled(&mut self, amount: U128) -> PromiseOrValue<bool> {
        let mut ledger = PromiseLedger::new(self.registry.config().token_id.clone());
        self.registry
            .withdraw_settled(&CallContext::from_env(), &mut ledger, amount.0)
            .unwrap_or_else(|err| err.panic());
        match ledger.into_promise() {
            Some(transfer) => transfer
                .then(
                    ext_self::ext(env::current_account_id())
                        .with_static_gas(env::prepaid_gas().saturating_div(4))
                        .on_withdrawal_settled(amount),
                )
                .into(),
            None => PromiseOrValue::Value(true),
        }
    }

    /// Provider-only retry of fees that never reached cold storage.
    pub fn forward_fees(&mut self) -> Promise {
        let mut ledger = PromiseLedger::new(self.registry.config().token_id.clone());
        let amount = self
            .registry
            .forward_fees(&CallContext::from_env(), &mut ledger)
            .unwrap_or_else(|err| err.panic());
        Self::settle_fee(ledger, amount)
            .unwrap_or_else(|| BridgeError::InsufficientFunds.panic())
    }

    /// Pays the caller a refund that failed to reach them earlier.
    pub fn claim_refund(&mut self) -> Promise {
        let account_id = env::predecessor_account_id();
        let mut ledger = PromiseLedger::new(self.registry.config().token_id.clone());
        let amount = self
            .registry
            .claim_refund(&CallContext::from_env(), &mut ledger)
            .unwrap_or_else(|err| err.panic());
        Self::settle_refund(ledger, account_id, amount)
            .unwrap_or_else(|| BridgeError::InsufficientFunds.panic())
    }

    // --- VIEWS ---

    pub fn get_swap_info(&self, id: Base58CryptoHash) -> SwapInfo {
        self.registry
            .swap_info(&id.into())
            .unwrap_or_else(|err| err.panic())
    }

    pub fn get_swap_details(&self, id: Base58CryptoHash) -> SwapDetails {
        self.registry
            .swap_details(&id.into())
            .unwrap_or_else(|err| err.panic())
    }

    pub fn get_deposit(&self, account_id: AccountId) -> U128 {
        U128(self.registry.deposit_of(&account_id))
    }

    pub fn get_config(&self) -> BridgeConfig {
        self.registry.config().clone()
    }

    pub fn get_total_custody(&self) -> U128 {
        U128(self.registry.total_custody())
    }

    pub fn get_settled_balance(&self) -> U128 {
        U128(self.registry.settled())
    }

    pub fn get_swap_count(&self) -> u32 {
        self.registry.swap_count()
    }

    pub fn get_unforwarded_fees(&self) -> U128 {
        U128(self.registry.unforwarded_fees())
    }

    pub fn get_pending_refund(&self, account_id: AccountId) -> U128 {
        U128(self.registry.pending_refund_of(&account_id))
    }

    /// Deposit `open_swap` requires for the given field sizes.
    pub fn get_storage_cost(
        &self,
        remote_address: String,
        encrypted_contact: Base64VecU8,
    ) -> NearToken {
        Self::storage_cost(&SwapTerms {
            id: Base58CryptoHash::from([0u8; 32]),
            receiver: self.registry.config().provider_id.clone(),
            secret_lock: None,
            remote_address,
            encrypted_contact,
        })
    }

    // --- PRIVATE CALLBACKS ---
    #[private]
    pub fn on_swap_funded(
        &mut self,
        sender_id: AccountId,
        terms: SwapTerms,
        amount: U128,
        storage_deposit: NearToken,
    ) -> bool {
        if !promises_succeeded() {
            log_str(&format!(
                "Swap funding failed: {}",
                BridgeError::InsufficientAuthorization
            ));
            Self::return_near(&sender_id, storage_deposit);
            return false;
        }

        let storage_cost = Self::storage_cost(&terms);
        let fee = self.registry.config().fee.0;
        let token_id = self.registry.config().token_id.clone();
        let mut ledger = PromiseLedger::funded(token_id.clone(), sender_id.clone(), amount.0);
        let ctx = CallContext::new(sender_id.clone(), env::block_timestamp());
        match self.registry.open_swap(&ctx, &mut ledger, terms, amount.0) {
            Ok(()) => {
                Self::settle_fee(ledger, fee);
                let provider_id = self.registry.config().provider_id.clone();
                Self::return_near(&provider_id, storage_deposit.saturating_sub(storage_cost));
                true
            }
            Err(err) => {
                // Terms changed between the pre-flight and the pull, e.g. the id got taken.
                log_str(&format!("Swap open rejected after funding: {}", err));
                let mut refund = PromiseLedger::new(token_id);
                refund
                    .transfer(&sender_id, amount.0)
                    .unwrap_or_else(|err| err.panic());
                Self::settle_refund(refund, sender_id.clone(), amount.0);
                Self::return_near(&sender_id, storage_deposit);
                false
            }
        }
    }

    #[private]
    pub fn on_swap_settled(&mut self, swap_id: SwapId, prior_state: SwapState) -> bool {
        if promises_succeeded() {
            log_str(&format!(
                "SWAP_SETTLED: id='{}'",
                near_sdk::bs58::encode(&swap_id).into_string()
            ));
            return true;
        }
        // Payout failed: the funds never left custody.
        self.registry
            .rollback_settlement(&swap_id, prior_state)
            .unwrap_or_else(|err| err.panic());
        false
    }

    #[private]
    pub fn on_withdrawal_settled(&mut self, amount: U128) -> bool {
        if promises_succeeded() {
            return true;
        }
        self.registry
            .restore_settled(amount.0)
            .unwrap_or_else(|err| err.panic());
        false
    }

    #[private]
    pub fn on_fee_forwarded(&mut self, amount: U128) -> bool {
        if promises_succeeded() {
            let cold_storage_id = &self.registry.config().cold_storage_id;
            log_bridge_event("FEE_COLLECTED", cold_storage_id, amount.0);
            return true;
        }
        // The fee bounced back and stays in custody until forwarded again.
        self.registry
            .record_unforwarded_fee(amount.0)
            .unwrap_or_else(|err| err.panic());
        false
    }

    #[private]
    pub fn on_refund_settled(&mut self, account_id: AccountId, amount: U128) -> bool {
        if promises_succeeded() {
            log_bridge_event("REFUNDED", &account_id, amount.0);
            return true;
        }
        self.registry
            .record_pending_refund(&account_id, amount.0)
            .unwrap_or_else(|err| err.panic());
        false
    }
}

impl Contract {
    fn resolve_settlement(
        ledger: PromiseLedger,
        swap_id: SwapId,
        settlement: Settlement,
    ) -> PromiseOrValue<bool> {
        match ledger.into_promise() {
            Some(payout) => payout
                .then(
                    ext_self::ext(env::current_account_id())
                        .with_static_gas(env::prepaid_gas().saturating_div(4))
                        .on_swap_settled(swap_id, settlement.prior_state),
                )
                .into(),
            None => PromiseOrValue::Value(true),
        }
    }

    fn storage_cost(terms: &SwapTerms) -> NearToken {
        env::storage_byte_cost().saturating_mul(u128::from(terms.storage_bytes()))
    }

    fn settle_fee(ledger: PromiseLedger, amount: Balance) -> Option<Promise> {
        ledger.into_promise().map(|transfer| {
            transfer.then(
                ext_self::ext(env::current_account_id())
                    .with_static_gas(env::prepaid_gas().saturating_div(4))
                    .on_fee_forwarded(U128(amount)),
            )
        })
    }

    fn settle_refund(
        ledger: PromiseLedger,
        account_id: AccountId,
        amount: Balance,
    ) -> Option<Promise> {
        ledger.into_promise().map(|transfer| {
            transfer.then(
                ext_self::ext(env::current_account_id())
                    .with_static_gas(env::prepaid_gas().saturating_div(4))
                    .on_refund_settled(account_id, U128(amount)),
            )
        })
    }

    fn return_near(account_id: &AccountId, amount: NearToken) {
        if !amount.is_zero() {
            Promise::new(account_id.clone()).transfer(amount);
        }
    }
}
