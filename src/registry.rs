use near_sdk::json_types::U128;
use near_sdk::store::IterableMap;
use near_sdk::{env, near, AccountId, CryptoHash, Timestamp};

use crate::deposit::{DepositLedger, HasDeposits};
use crate::error::BridgeError;
use crate::swap::{
    Balance, Custody, Settlement, Swap, SwapDetails, SwapId, SwapInfo, SwapState, SwapTerms,
    MAX_SECRET_KEY_LEN,
};
use crate::timelocks::KeyHolder;
use crate::token::TokenLedger;
use crate::utils::{log_bridge_event, log_swap_event};

/// Deployment parameters of the bridge.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    pub token_id: AccountId,
    pub provider_id: AccountId,
    pub cold_storage_id: AccountId,
    pub fee: U128,
}

/// Authenticated caller and block time of the current call.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub caller: AccountId,
    pub now: Timestamp,
}

impl CallContext {
    pub fn new(caller: AccountId, now: Timestamp) -> Self {
        Self { caller, now }
    }

    pub fn from_env() -> Self {
        Self::new(env::predecessor_account_id(), env::block_timestamp())
    }
}

/// All swap state and the funds custodied for it.
///
/// Token custody always equals the sum of:
/// pooled deposits of live provider-bound swaps, escrow of live swaps
/// with any other receiver, the settled pool of closed provider-bound
/// swaps awaiting withdrawal by the provider, fees whose transfer to cold
/// storage bounced, and refunds whose transfer to their owner bounced.
#[near(serializers = [borsh])]
pub struct SwapRegistry {
    config: BridgeConfig,
    swaps: IterableMap<SwapId, Swap>,
    deposits: DepositLedger,
    escrowed: Balance,
    settled: Balance,
    unforwarded_fees: Balance,
    // Refunds owed to senders whose funded open was rejected
    refunds: DepositLedger,
}

impl SwapRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            swaps: IterableMap::new(b"s"),
            deposits: DepositLedger::new(b"d"),
            escrowed: 0,
            settled: 0,
            unforwarded_fees: 0,
            refunds: DepositLedger::new(b"r"),
        }
    }

    // --- TRANSITIONS ---

    /// Guards of `open_swap` that do not depend on funds, for use before an asynchronous pull.
    pub fn check_open(&self, terms: &SwapTerms, amount: Balance) -> Result<Balance, BridgeError> {
        terms.validate()?;
        let id: SwapId = terms.id.into();
        if self.swaps.contains_key(&id) {
            return Err(BridgeError::DuplicateId);
        }
        let fee = self.config.fee.0;
        if amount <= fee {
            return Err(BridgeError::InsufficientFunds);
        }
        Ok(amount - fee)
    }

    pub fn open_swap<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
        terms: SwapTerms,
        amount: Balance,
    ) -> Result<(), BridgeError> {
        let net = self.check_open(&terms, amount)?;
        let custody = if terms.receiver == self.config.provider_id {
            Custody::Pooled
        } else {
            Custody::Escrow
        };
        let escrowed = match custody {
            Custody::Pooled => self.escrowed,
            Custody::Escrow => self
                .escrowed
                .checked_add(net)
                .ok_or(BridgeError::Overflow)?,
        };
        if custody == Custody::Pooled
            && self.deposits.deposit_of(&ctx.caller).checked_add(net).is_none()
        {
            return Err(BridgeError::Overflow);
        }

        let fee = self.config.fee.0;
        ledger.transfer_from(&ctx.caller, amount)?;
        if fee > 0 {
            ledger.transfer(&self.config.cold_storage_id, fee)?;
        }

        if custody == Custody::Pooled {
            self.deposits.credit(&ctx.caller, net)?;
        }
        self.escrowed = escrowed;

        let secret_lock: Option<CryptoHash> = terms.secret_lock.map(Into::into);
        let holder = KeyHolder::for_lock(secret_lock.as_ref());
        let key_holder = match holder {
            KeyHolder::Sender => ctx.caller.clone(),
            KeyHolder::Receiver => terms.receiver.clone(),
        };
        let id: SwapId = terms.id.into();
        let swap = Swap {
            id,
            sender: ctx.caller.clone(),
            receiver: terms.receiver,
            key_holder,
            remote_address: terms.remote_address,
            encrypted_contact: terms.encrypted_contact.0,
            amount: net,
            secret_lock,
            secret_key: None,
            timelock: holder.deadline(ctx.now),
            state: SwapState::Opened,
            custody,
        };
        self.swaps.insert(id, swap);

        log_bridge_event("FEE_SKIMMED", &self.config.cold_storage_id, fee);
        log_swap_event("OPENED", &id, &ctx.caller, net);
        Ok(())
    }

    pub fn set_secret_lock(
        &mut self,
        ctx: &CallContext,
        id: &SwapId,
        secret_lock: CryptoHash,
    ) -> Result<(), BridgeError> {
        let swap = self.swaps.get_mut(id).ok_or(BridgeError::NotFound)?;
        if swap.state != SwapState::Opened || swap.is_overdue(ctx.now) {
            return Err(BridgeError::InvalidState);
        }
        if swap.secret_lock.is_some() {
            return Err(BridgeError::LockAlreadySet);
        }
        if ctx.caller != swap.key_holder {
            return Err(BridgeError::Unauthorized);
        }

        swap.secret_lock = Some(secret_lock);
        log_swap_event("LOCK_SET", id, &ctx.caller, swap.amount);
        Ok(())
    }

    pub fn approve_swap(&mut self, ctx: &CallContext, id: &SwapId) -> Result<(), BridgeError> {
        let swap = self.swaps.get_mut(id).ok_or(BridgeError::NotFound)?;
        if swap.state != SwapState::Opened || swap.is_overdue(ctx.now) {
            return Err(BridgeError::InvalidState);
        }
        if ctx.caller != swap.sender {
            return Err(BridgeError::Unauthorized);
        }
        if swap.secret_lock.is_none() {
            return Err(BridgeError::LockNotSet);
        }

        swap.state = SwapState::Approved;
        log_swap_event("APPROVED", id, &ctx.caller, swap.amount);
        Ok(())
    }

    /// Closes the swap for its receiver. An approved swap needs no valid preimage;
    /// an opened one must be unlocked by the preimage of its secret lock.
    pub fn close_swap<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
        id: &SwapId,
        secret_key: Vec<u8>,
    ) -> Result<Settlement, BridgeError> {
        let swap = self.swaps.get(id).ok_or(BridgeError::NotFound)?;
        if swap.state.is_terminal() || swap.is_overdue(ctx.now) {
            return Err(BridgeError::InvalidState);
        }
        if ctx.caller != swap.receiver {
            return Err(BridgeError::Unauthorized);
        }
        if secret_key.len() > MAX_SECRET_KEY_LEN {
            return Err(BridgeError::OversizedField);
        }
        if swap.state == SwapState::Opened
            && swap.secret_lock != Some(env::sha256_array(&secret_key))
        {
            return Err(BridgeError::SecretMismatch);
        }

        let settlement = Settlement {
            recipient: swap.receiver.clone(),
            amount: swap.amount,
            custody: swap.custody,
            prior_state: swap.state,
        };
        let sender = swap.sender.clone();
        match settlement.custody {
            Custody::Pooled => {
                let settled = self
                    .settled
                    .checked_add(settlement.amount)
                    .ok_or(BridgeError::Overflow)?;
                self.deposits.debit(&sender, settlement.amount)?;
                self.settled = settled;
            }
            Custody::Escrow => {
                let escrowed = self
                    .escrowed
                    .checked_sub(settlement.amount)
                    .ok_or(BridgeError::InsufficientFunds)?;
                ledger.transfer(&settlement.recipient, settlement.amount)?;
                self.escrowed = escrowed;
            }
        }

        let swap = self.swaps.get_mut(id).ok_or(BridgeError::NotFound)?;
        swap.secret_key = Some(secret_key);
        swap.state = SwapState::Closed;
        log_swap_event("CLOSED", id, &ctx.caller, settlement.amount);
        Ok(settlement)
    }

    /// Refunds an overdue swap to its sender.
    pub fn expire_swap<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
        id: &SwapId,
    ) -> Result<Settlement, BridgeError> {
        let swap = self.swaps.get(id).ok_or(BridgeError::NotFound)?;
        if swap.state != SwapState::Opened {
            return Err(BridgeError::InvalidState);
        }
        if ctx.caller != swap.sender {
            return Err(BridgeError::Unauthorized);
        }
        if !swap.is_overdue(ctx.now) {
            return Err(BridgeError::NotYetDue);
        }

        let settlement = Settlement {
            recipient: swap.sender.clone(),
            amount: swap.amount,
            custody: swap.custody,
            prior_state: swap.state,
        };
        match settlement.custody {
            Custody::Pooled => {
                if self.deposits.deposit_of(&settlement.recipient) < settlement.amount {
                    return Err(BridgeError::InsufficientFunds);
                }
                ledger.transfer(&settlement.recipient, settlement.amount)?;
                self.deposits
                    .debit(&settlement.recipient, settlement.amount)?;
            }
            Custody::Escrow => {
                let escrowed = self
                    .escrowed
                    .checked_sub(settlement.amount)
                    .ok_or(BridgeError::InsufficientFunds)?;
                ledger.transfer(&settlement.recipient, settlement.amount)?;
                self.escrowed = escrowed;
            }
        }

        let swap = self.swaps.get_mut(id).ok_or(BridgeError::NotFound)?;
        swap.state = SwapState::Expired;
        log_swap_event("EXPIRED", id, &ctx.caller, settlement.amount);
        Ok(settlement)
    }

    pub fn set_fee(&mut self, ctx: &CallContext, fee: Balance) -> Result<(), BridgeError> {
        if ctx.caller != self.config.provider_id {
            return Err(BridgeError::Unauthorized);
        }
        self.config.fee = U128(fee);
        log_bridge_event("FEE_CHANGED", &ctx.caller, fee);
        Ok(())
    }

    /// Pays the provider out of the pool of swaps it closed as receiver.
    pub fn withdraw_settled<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
        amount: Balance,
    ) -> Result<(), BridgeError> {
        if ctx.caller != self.config.provider_id {
            return Err(BridgeError::Unauthorized);
        }
        let settled = self
            .settled
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientFunds)?;
        ledger.transfer(&ctx.caller, amount)?;
        self.settled = settled;
        log_bridge_event("SETTLED_WITHDRAWN", &ctx.caller, amount);
        Ok(())
    }

    /// Retries the transfer of every fee that bounced on its way to cold storage.
    pub fn forward_fees<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
    ) -> Result<Balance, BridgeError> {
        if ctx.caller != self.config.provider_id {
            return Err(BridgeError::Unauthorized);
        }
        let amount = self.unforwarded_fees;
        if amount == 0 {
            return Err(BridgeError::InsufficientFunds);
        }
        ledger.transfer(&self.config.cold_storage_id, amount)?;
        self.unforwarded_fees = 0;
        log_bridge_event("FEE_FORWARDING", &self.config.cold_storage_id, amount);
        Ok(amount)
    }

    /// Pays the caller every refund that bounced on its way back to them.
    pub fn claim_refund<L: TokenLedger>(
        &mut self,
        ctx: &CallContext,
        ledger: &mut L,
    ) -> Result<Balance, BridgeError> {
        let amount = self.refunds.deposit_of(&ctx.caller);
        if amount == 0 {
            return Err(BridgeError::InsufficientFunds);
        }
        ledger.transfer(&ctx.caller, amount)?;
        self.refunds.debit(&ctx.caller, amount)?;
        log_bridge_event("REFUND_CLAIMED", &ctx.caller, amount);
        Ok(amount)
    }

    // --- ROLLBACKS ---

    /// Undoes a close or expiry whose payout transfer failed, returning the swap
    /// to `prior_state` with its funds back in custody.
    pub fn rollback_settlement(
        &mut self,
        id: &SwapId,
        prior_state: SwapState,
    ) -> Result<(), BridgeError> {
        if prior_state.is_terminal() {
            return Err(BridgeError::InvalidState);
        }
        let swap = self.swaps.get(id).ok_or(BridgeError::NotFound)?;
        if !swap.state.is_terminal() {
            return Err(BridgeError::InvalidState);
        }
        let (sender, amount, custody) = (swap.sender.clone(), swap.amount, swap.custody);

        match custody {
            Custody::Pooled => {
                self.deposits.credit(&sender, amount)?;
            }
            Custody::Escrow => {
                self.escrowed = self
                    .escrowed
                    .checked_add(amount)
                    .ok_or(BridgeError::Overflow)?;
            }
        }

        let swap = self.swaps.get_mut(id).ok_or(BridgeError::NotFound)?;
        swap.state = prior_state;
        swap.secret_key = None;
        log_swap_event("SETTLEMENT_REVERTED", id, &sender, amount);
        Ok(())
    }

    /// Returns a failed provider withdrawal to the settled pool.
    pub fn restore_settled(&mut self, amount: Balance) -> Result<(), BridgeError> {
        self.settled = self
            .settled
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        log_bridge_event("WITHDRAWAL_REVERTED", &self.config.provider_id, amount);
        Ok(())
    }

    /// Books a fee whose transfer to cold storage failed; it stays in custody.
    pub fn record_unforwarded_fee(&mut self, amount: Balance) -> Result<(), BridgeError> {
        self.unforwarded_fees = self
            .unforwarded_fees
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        log_bridge_event("FEE_UNFORWARDED", &self.config.cold_storage_id, amount);
        Ok(())
    }

    /// Books a refund to `account_id` whose transfer failed, claimable later.
    pub fn record_pending_refund(
        &mut self,
        account_id: &AccountId,
        amount: Balance,
    ) -> Result<(), BridgeError> {
        self.refunds.credit(account_id, amount)?;
        log_bridge_event("REFUND_PENDING", account_id, amount);
        Ok(())
    }

    // --- VIEWS ---

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn swap(&self, id: &SwapId) -> Result<&Swap, BridgeError> {
        self.swaps.get(id).ok_or(BridgeError::NotFound)
    }

    pub fn swap_info(&self, id: &SwapId) -> Result<SwapInfo, BridgeError> {
        self.swap(id).map(SwapInfo::from)
    }

    pub fn swap_details(&self, id: &SwapId) -> Result<SwapDetails, BridgeError> {
        self.swap(id).map(SwapDetails::from)
    }

    pub fn swap_count(&self) -> u32 {
        self.swaps.len()
    }

    pub fn deposit_of(&self, account_id: &AccountId) -> Balance {
        self.deposits.deposit_of(account_id)
    }

    pub fn escrowed(&self) -> Balance {
        self.escrowed
    }

    pub fn settled(&self) -> Balance {
        self.settled
    }

    pub fn unforwarded_fees(&self) -> Balance {
        self.unforwarded_fees
    }

    pub fn pending_refund_of(&self, account_id: &AccountId) -> Balance {
        self.refunds.deposit_of(account_id)
    }

    /// Everything the registry should hold on the token ledger right now.
    pub fn total_custody(&self) -> Balance {
        self.deposits.total_deposits()
            + self.escrowed
            + self.settled
            + self.unforwarded_fees
            + self.refunds.total_deposits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{MAX_ENCRYPTED_CONTACT_LEN, MAX_REMOTE_ADDRESS_LEN};
    use crate::timelocks::{RECEIVER_LOCK_HOURS, SENDER_LOCK_HOURS};
    use crate::token::MemoryLedger;
    use near_sdk::json_types::{Base58CryptoHash, Base64VecU8};
    use near_sdk::test_utils::accounts;

    const HOUR: u64 = 3_600 * 1_000_000_000;
    const START: Timestamp = 1_000 * HOUR;
    const FEE: Balance = 4_000;

    fn provider() -> AccountId {
        accounts(0)
    }
    fn alice() -> AccountId {
        accounts(1)
    }
    fn bob() -> AccountId {
        accounts(2)
    }
    fn cold_storage() -> AccountId {
        accounts(3)
    }
    fn bridge() -> AccountId {
        accounts(5)
    }

    fn at(caller: AccountId, now: Timestamp) -> CallContext {
        CallContext::new(caller, now)
    }

    fn setup() -> (SwapRegistry, MemoryLedger) {
        let registry = SwapRegistry::new(BridgeConfig {
            token_id: accounts(4),
            provider_id: provider(),
            cold_storage_id: cold_storage(),
            fee: U128(FEE),
        });
        let mut ledger = MemoryLedger::new(bridge());
        for account in [alice(), bob()] {
            ledger.mint(&account, 100_000);
            ledger.approve(&account, &bridge(), 100_000);
        }
        (registry, ledger)
    }

    fn swap_id(seed: u8) -> SwapId {
        [seed; 32]
    }

    fn secret() -> Vec<u8> {
        b"remchain secret".to_vec()
    }

    fn lock() -> CryptoHash {
        env::sha256_array(&secret())
    }

    fn terms(seed: u8, receiver: AccountId, secret_lock: Option<CryptoHash>) -> SwapTerms {
        SwapTerms {
            id: Base58CryptoHash::from(swap_id(seed)),
            receiver,
            secret_lock: secret_lock.map(Base58CryptoHash::from),
            remote_address: "remchain-account".to_string(),
            encrypted_contact: Base64VecU8::from(b"contact".to_vec()),
        }
    }

    fn open(
        registry: &mut SwapRegistry,
        ledger: &mut MemoryLedger,
        sender: AccountId,
        receiver: AccountId,
        secret_lock: Option<CryptoHash>,
    ) -> SwapId {
        registry
            .open_swap(&at(sender, START), ledger, terms(1, receiver, secret_lock), 10_000)
            .unwrap();
        swap_id(1)
    }

    fn assert_conserved(registry: &SwapRegistry, ledger: &MemoryLedger) {
        assert_eq!(registry.total_custody(), ledger.balance_of(&bridge()));
    }

    #[test]
    fn open_skims_fee_to_cold_storage() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);

        let details = registry.swap_details(&id).unwrap();
        assert_eq!(details.amount, U128(6_000));
        assert_eq!(ledger.balance_of(&cold_storage()), FEE);
        assert_eq!(ledger.balance_of(&alice()), 90_000);
        assert_eq!(registry.escrowed(), 6_000);
        assert_eq!(registry.deposit_of(&alice()), 0);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn open_to_provider_credits_sender_deposit() {
        let (mut registry, mut ledger) = setup();
        open(&mut registry, &mut ledger, alice(), provider(), Some(lock()));

        assert_eq!(registry.deposit_of(&alice()), 6_000);
        assert_eq!(registry.escrowed(), 0);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn open_with_lock_gives_sender_the_long_window() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));

        let info = registry.swap_info(&id).unwrap();
        assert_eq!(info.key_holder, alice());
        assert_eq!(info.state, SwapState::Opened);
        assert_eq!(info.remote_address, "remchain-account");
        let details = registry.swap_details(&id).unwrap();
        assert_eq!(details.timelock.0, START + SENDER_LOCK_HOURS * HOUR);
        assert_eq!(details.secret_lock, Some(Base58CryptoHash::from(lock())));
        assert_eq!(details.secret_key, None);
        assert_eq!(details.encrypted_contact.0, b"contact".to_vec());
    }

    #[test]
    fn open_without_lock_gives_receiver_the_short_window() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);

        assert_eq!(registry.swap_info(&id).unwrap().key_holder, bob());
        assert_eq!(
            registry.swap_details(&id).unwrap().timelock.0,
            START + RECEIVER_LOCK_HOURS * HOUR
        );
    }

    #[test]
    fn open_rejects_amount_not_above_fee() {
        let (mut registry, mut ledger) = setup();
        let result =
            registry.open_swap(&at(alice(), START), &mut ledger, terms(1, bob(), None), FEE);
        assert_eq!(result, Err(BridgeError::InsufficientFunds));
        assert_eq!(registry.swap_count(), 0);
        assert_eq!(ledger.balance_of(&alice()), 100_000);
    }

    #[test]
    fn open_rejects_missing_allowance_without_side_effects() {
        let (mut registry, mut ledger) = setup();
        ledger.approve(&alice(), &bridge(), 9_999);
        let result =
            registry.open_swap(&at(alice(), START), &mut ledger, terms(1, bob(), None), 10_000);

        assert_eq!(result, Err(BridgeError::InsufficientAuthorization));
        assert_eq!(registry.swap(&swap_id(1)), Err(BridgeError::NotFound));
        assert_eq!(ledger.balance_of(&cold_storage()), 0);
        assert_eq!(ledger.balance_of(&alice()), 100_000);
    }

    #[test]
    fn open_rejects_duplicate_id() {
        let (mut registry, mut ledger) = setup();
        open(&mut registry, &mut ledger, alice(), bob(), None);
        let result =
            registry.open_swap(&at(bob(), START), &mut ledger, terms(1, alice(), None), 10_000);
        assert_eq!(result, Err(BridgeError::DuplicateId));
        assert_eq!(ledger.balance_of(&bob()), 100_000);
    }

    #[test]
    fn open_rejects_oversized_terms() {
        let (mut registry, mut ledger) = setup();
        let mut long_address = terms(1, bob(), None);
        long_address.remote_address = "r".repeat(MAX_REMOTE_ADDRESS_LEN + 1);
        let mut long_contact = terms(1, bob(), None);
        long_contact.encrypted_contact = Base64VecU8::from(vec![7; MAX_ENCRYPTED_CONTACT_LEN + 1]);

        for oversized in [long_address, long_contact] {
            assert_eq!(
                registry.open_swap(&at(alice(), START), &mut ledger, oversized, 10_000),
                Err(BridgeError::OversizedField)
            );
        }
        assert_eq!(registry.swap_count(), 0);
        assert_eq!(ledger.balance_of(&alice()), 100_000);

        let mut at_limit = terms(1, bob(), None);
        at_limit.remote_address = "r".repeat(MAX_REMOTE_ADDRESS_LEN);
        registry
            .open_swap(&at(alice(), START), &mut ledger, at_limit, 10_000)
            .unwrap();
    }

    #[test]
    fn set_secret_lock_only_by_key_holder_and_once() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);

        assert_eq!(
            registry.set_secret_lock(&at(alice(), START), &id, lock()),
            Err(BridgeError::Unauthorized)
        );
        registry.set_secret_lock(&at(bob(), START), &id, lock()).unwrap();
        assert_eq!(registry.swap(&id).unwrap().secret_lock, Some(lock()));

        for caller in [alice(), bob(), provider()] {
            assert_eq!(
                registry.set_secret_lock(&at(caller, START), &id, [9; 32]),
                Err(BridgeError::LockAlreadySet)
            );
        }
        assert_eq!(registry.swap(&id).unwrap().secret_lock, Some(lock()));
    }

    #[test]
    fn approve_requires_lock_and_sender() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);

        assert_eq!(
            registry.approve_swap(&at(alice(), START), &id),
            Err(BridgeError::LockNotSet)
        );
        registry.set_secret_lock(&at(bob(), START), &id, lock()).unwrap();
        assert_eq!(
            registry.approve_swap(&at(bob(), START), &id),
            Err(BridgeError::Unauthorized)
        );
        registry.approve_swap(&at(alice(), START), &id).unwrap();
        assert_eq!(registry.swap(&id).unwrap().state, SwapState::Approved);

        assert_eq!(
            registry.set_secret_lock(&at(bob(), START), &id, lock()),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.approve_swap(&at(alice(), START), &id),
            Err(BridgeError::InvalidState)
        );
    }

    #[test]
    fn close_with_preimage_pays_receiver() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));

        assert_eq!(
            registry.close_swap(&at(alice(), START), &mut ledger, &id, secret()),
            Err(BridgeError::Unauthorized)
        );
        assert_eq!(
            registry.close_swap(&at(bob(), START), &mut ledger, &id, b"wrong".to_vec()),
            Err(BridgeError::SecretMismatch)
        );

        let settlement = registry
            .close_swap(&at(bob(), START), &mut ledger, &id, secret())
            .unwrap();
        assert_eq!(settlement.recipient, bob());
        assert_eq!(settlement.amount, 6_000);
        assert_eq!(settlement.custody, Custody::Escrow);

        let swap = registry.swap(&id).unwrap();
        assert_eq!(swap.state, SwapState::Closed);
        assert_eq!(swap.secret_key, Some(secret()));
        assert_eq!(ledger.balance_of(&bob()), 106_000);
        assert_eq!(registry.escrowed(), 0);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn close_rejects_oversized_secret_key() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));
        registry.approve_swap(&at(alice(), START), &id).unwrap();

        assert_eq!(
            registry.close_swap(
                &at(bob(), START),
                &mut ledger,
                &id,
                vec![1; MAX_SECRET_KEY_LEN + 1]
            ),
            Err(BridgeError::OversizedField)
        );
        assert_eq!(registry.swap(&id).unwrap().state, SwapState::Approved);
    }

    #[test]
    fn close_without_lock_needs_approval() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);
        assert_eq!(
            registry.close_swap(&at(bob(), START), &mut ledger, &id, secret()),
            Err(BridgeError::SecretMismatch)
        );
    }

    #[test]
    fn close_after_approval_accepts_any_key() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));
        registry.approve_swap(&at(alice(), START), &id).unwrap();

        registry
            .close_swap(&at(bob(), START), &mut ledger, &id, b"anything".to_vec())
            .unwrap();
        assert_eq!(registry.swap(&id).unwrap().state, SwapState::Closed);
        assert_eq!(ledger.balance_of(&bob()), 106_000);
    }

    #[test]
    fn close_to_provider_moves_deposit_into_settled_pool() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), provider(), Some(lock()));

        let settlement = registry
            .close_swap(&at(provider(), START), &mut ledger, &id, secret())
            .unwrap();
        assert_eq!(settlement.custody, Custody::Pooled);
        assert_eq!(registry.deposit_of(&alice()), 0);
        assert_eq!(registry.settled(), 6_000);
        assert_eq!(ledger.balance_of(&provider()), 0);
        assert_conserved(&registry, &ledger);

        assert_eq!(
            registry.withdraw_settled(&at(alice(), START), &mut ledger, 6_000),
            Err(BridgeError::Unauthorized)
        );
        assert_eq!(
            registry.withdraw_settled(&at(provider(), START), &mut ledger, 6_001),
            Err(BridgeError::InsufficientFunds)
        );
        registry
            .withdraw_settled(&at(provider(), START), &mut ledger, 6_000)
            .unwrap();
        assert_eq!(ledger.balance_of(&provider()), 6_000);
        assert_eq!(registry.settled(), 0);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn expire_only_after_timelock() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);
        let timelock = registry.swap(&id).unwrap().timelock;

        assert_eq!(
            registry.expire_swap(&at(alice(), timelock - 1), &mut ledger, &id),
            Err(BridgeError::NotYetDue)
        );
        assert_eq!(
            registry.expire_swap(&at(bob(), timelock), &mut ledger, &id),
            Err(BridgeError::Unauthorized)
        );

        let settlement = registry
            .expire_swap(&at(alice(), timelock), &mut ledger, &id)
            .unwrap();
        assert_eq!(settlement.recipient, alice());
        assert_eq!(registry.swap(&id).unwrap().state, SwapState::Expired);
        assert_eq!(ledger.balance_of(&alice()), 96_000);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn expire_pooled_swap_debits_deposit() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), provider(), None);
        let timelock = registry.swap(&id).unwrap().timelock;

        registry
            .expire_swap(&at(alice(), timelock), &mut ledger, &id)
            .unwrap();
        assert_eq!(registry.deposit_of(&alice()), 0);
        assert_eq!(ledger.balance_of(&alice()), 96_000);
        assert_conserved(&registry, &ledger);
    }

    #[test]
    fn overdue_blocks_everything_but_expiry() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), None);
        let late = registry.swap(&id).unwrap().timelock;

        assert_eq!(
            registry.set_secret_lock(&at(bob(), late), &id, lock()),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.approve_swap(&at(alice(), late), &id),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.close_swap(&at(bob(), late), &mut ledger, &id, secret()),
            Err(BridgeError::InvalidState)
        );
        registry.expire_swap(&at(alice(), late), &mut ledger, &id).unwrap();
    }

    #[test]
    fn approved_swap_is_never_overdue() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));
        registry.approve_swap(&at(alice(), START), &id).unwrap();
        let late = registry.swap(&id).unwrap().timelock + HOUR;

        assert_eq!(
            registry.expire_swap(&at(alice(), late), &mut ledger, &id),
            Err(BridgeError::InvalidState)
        );
        registry
            .close_swap(&at(bob(), late), &mut ledger, &id, secret())
            .unwrap();
    }

    #[test]
    fn terminal_states_reject_everything() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), bob(), Some(lock()));
        registry
            .close_swap(&at(bob(), START), &mut ledger, &id, secret())
            .unwrap();
        let late = START + 100 * HOUR;

        assert_eq!(
            registry.set_secret_lock(&at(alice(), START), &id, lock()),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.approve_swap(&at(alice(), START), &id),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.close_swap(&at(bob(), START), &mut ledger, &id, secret()),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(
            registry.expire_swap(&at(alice(), late), &mut ledger, &id),
            Err(BridgeError::InvalidState)
        );
        assert_eq!(ledger.balance_of(&bob()), 106_000);
    }

    #[test]
    fn unknown_swap_is_not_found() {
        let (mut registry, mut ledger) = setup();
        let id = swap_id(7);
        assert_eq!(registry.swap_info(&id), Err(BridgeError::NotFound));
        assert_eq!(registry.swap_details(&id), Err(BridgeError::NotFound));
        assert_eq!(
            registry.approve_swap(&at(alice(), START), &id),
            Err(BridgeError::NotFound)
        );
        assert_eq!(
            registry.expire_swap(&at(alice(), START), &mut ledger, &id),
            Err(BridgeError::NotFound)
        );
    }

    #[test]
    fn fee_is_provider_only() {
        let (mut registry, mut ledger) = setup();
        assert_eq!(
            registry.set_fee(&at(alice(), START), 1),
            Err(BridgeError::Unauthorized)
        );
        assert_eq!(registry.config().fee, U128(FEE));

        registry.set_fee(&at(provider(), START), 1).unwrap();
        open(&mut registry, &mut ledger, alice(), bob(), None);
        assert_eq!(registry.swap(&swap_id(1)).unwrap().amount, 9_999);
        assert_eq!(ledger.balance_of(&cold_storage()), 1);
    }

    #[test]
    fn rollback_restores_custody_and_state() {
        let (mut registry, mut ledger) = setup();
        let id = open(&mut registry, &mut ledger, alice(), provider(), None);
        let timelock = registry.swap(&id).unwrap().timelock;
        let settlement = registry
            .expire_swap(&at(alice(), timelock), &mut ledger, &id)
            .unwrap();

        registry
            .rollback_settlement(&id, settlement.prior_state)
            .unwrap();
        assert_eq!(registry.swap(&id).unwrap().state, SwapState::Opened);
        assert_eq!(registry.deposit_of(&alice()), 6_000);
        assert_eq!(
            registry.rollback_settlement(&id, SwapState::Opened),
            Err(BridgeError::InvalidState)
        );
    }

    #[test]
    fn bounced_fee_stays_in_custody_until_forwarded() {
        let (mut registry, mut ledger) = setup();
        open(&mut registry, &mut ledger, alice(), bob(), None);
        // The fee transfer bounced back to the bridge
        ledger.mint(&bridge(), FEE);
        registry.record_unforwarded_fee(FEE).unwrap();
        assert_eq!(registry.unforwarded_fees(), FEE);
        assert_conserved(&registry, &ledger);

        assert_eq!(
            registry.forward_fees(&at(alice(), START), &mut ledger),
            Err(BridgeError::Unauthorized)
        );
        assert_eq!(
            registry.forward_fees(&at(provider(), START), &mut ledger),
            Ok(FEE)
        );
        assert_eq!(registry.unforwarded_fees(), 0);
        assert_eq!(ledger.balance_of(&cold_storage()), 2 * FEE);
        assert_conserved(&registry, &ledger);

        assert_eq!(
            registry.forward_fees(&at(provider(), START), &mut ledger),
            Err(BridgeError::InsufficientFunds)
        );
    }

    #[test]
    fn bounced_refund_is_claimable_by_its_owner() {
        let (mut registry, mut ledger) = setup();
        ledger.mint(&bridge(), 10_000);
        registry.record_pending_refund(&alice(), 10_000).unwrap();
        assert_eq!(registry.pending_refund_of(&alice()), 10_000);
        assert_conserved(&registry, &ledger);

        assert_eq!(
            registry.claim_refund(&at(bob(), START), &mut ledger),
            Err(BridgeError::InsufficientFunds)
        );
        assert_eq!(
            registry.claim_refund(&at(alice(), START), &mut ledger),
            Ok(10_000)
        );
        assert_eq!(registry.pending_refund_of(&alice()), 0);
        assert_eq!(ledger.balance_of(&alice()), 110_000);
        assert_conserved(&registry, &ledger);
    }
}
