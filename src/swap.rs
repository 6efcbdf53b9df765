use near_sdk::json_types::{Base58CryptoHash, Base64VecU8, U128, U64};
use near_sdk::{near, AccountId, CryptoHash, Timestamp};

use crate::error::BridgeError;
use crate::timelocks;

// Caller-chosen identifier of a swap.
pub type SwapId = CryptoHash;

// Token amounts in the smallest unit of the bridged token.
pub type Balance = u128;

pub const MAX_REMOTE_ADDRESS_LEN: usize = 256;
pub const MAX_ENCRYPTED_CONTACT_LEN: usize = 1024;
pub const MAX_SECRET_KEY_LEN: usize = 256;

// Fixed part of a stored swap: map key and record overhead, id, three account ids,
// amount, lock, the largest accepted secret key, timelock, state and custody.
const SWAP_RECORD_BYTES: u64 =
    (40 + 33) + 32 + 3 * (4 + 64) + 16 + 33 + (5 + MAX_SECRET_KEY_LEN as u64) + 8 + 2;

#[near(serializers = [json, borsh])]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapState {
    Opened,
    Approved,
    Closed,
    Expired,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::Closed | SwapState::Expired)
    }
}

/// Where the funds of a swap sit while it is live.
#[near(serializers = [json, borsh])]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Custody {
    /// Receiver is the provider: funds are pooled under the sender's deposit entry.
    Pooled,
    /// Funds are earmarked for this swap and paid out to the receiver on close.
    Escrow,
}

#[near(serializers = [borsh])]
#[derive(Clone, Debug, PartialEq)]
pub struct Swap {
    pub id: SwapId,
    pub sender: AccountId,
    pub receiver: AccountId,
    pub key_holder: AccountId,
    pub remote_address: String,
    pub encrypted_contact: Vec<u8>,
    // Net of the provider fee, fixed at open
    pub amount: Balance,
    pub secret_lock: Option<CryptoHash>,
    pub secret_key: Option<Vec<u8>>,
    pub timelock: Timestamp,
    pub state: SwapState,
    pub custody: Custody,
}

impl Swap {
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.state == SwapState::Opened && timelocks::is_reached(self.timelock, now)
    }
}

/// Terms of a new swap as supplied by its sender.
/// Also the `msg` payload of `ft_transfer_call` when funding through NEP-141.
#[near(serializers = [json])]
#[derive(Clone)]
pub struct SwapTerms {
    pub id: Base58CryptoHash,
    pub receiver: AccountId,
    pub secret_lock: Option<Base58CryptoHash>,
    pub remote_address: String,
    pub encrypted_contact: Base64VecU8,
}

impl SwapTerms {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.remote_address.len() > MAX_REMOTE_ADDRESS_LEN
            || self.encrypted_contact.0.len() > MAX_ENCRYPTED_CONTACT_LEN
        {
            return Err(BridgeError::OversizedField);
        }
        Ok(())
    }

    /// Upper bound of the bytes a swap opened with these terms occupies in state.
    pub fn storage_bytes(&self) -> u64 {
        SWAP_RECORD_BYTES
            + (4 + self.remote_address.len() as u64)
            + (4 + self.encrypted_contact.0.len() as u64)
    }
}

#[near(serializers = [json])]
#[derive(Clone, Debug, PartialEq)]
pub struct SwapInfo {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub key_holder: AccountId,
    pub remote_address: String,
    pub state: SwapState,
}

#[near(serializers = [json])]
#[derive(Clone, Debug, PartialEq)]
pub struct SwapDetails {
    pub amount: U128,
    pub encrypted_contact: Base64VecU8,
    pub secret_lock: Option<Base58CryptoHash>,
    pub secret_key: Option<Base64VecU8>,
    pub timelock: U64,
}

impl From<&Swap> for SwapInfo {
    fn from(swap: &Swap) -> Self {
        Self {
            sender: swap.sender.clone(),
            receiver: swap.receiver.clone(),
            key_holder: swap.key_holder.clone(),
            remote_address: swap.remote_address.clone(),
            state: swap.state,
        }
    }
}

impl From<&Swap> for SwapDetails {
    fn from(swap: &Swap) -> Self {
        Self {
            amount: U128(swap.amount),
            encrypted_contact: swap.encrypted_contact.clone().into(),
            secret_lock: swap.secret_lock.map(Base58CryptoHash::from),
            secret_key: swap.secret_key.clone().map(Base64VecU8::from),
            timelock: U64(swap.timelock),
        }
    }
}

/// Funds movement produced by a close or an expiry.
#[derive(Clone, Debug, PartialEq)]
pub struct Settlement {
    pub recipient: AccountId,
    pub amount: Balance,
    pub custody: Custody,
    /// State the swap was in before the transition, used to roll back a failed payout.
    pub prior_state: SwapState,
}
