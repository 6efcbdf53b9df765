use thiserror::Error;

/// Rejections raised by the swap registry. Every variant leaves state untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Swap not found")]
    NotFound,

    #[error("Swap with this id already exists")]
    DuplicateId,

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Insufficient allowance for transfer")]
    InsufficientAuthorization,

    #[error("Caller is not allowed to perform this action")]
    Unauthorized,

    #[error("Operation is not allowed in the current swap state")]
    InvalidState,

    #[error("Secret lock is already set")]
    LockAlreadySet,

    #[error("Secret lock is not set")]
    LockNotSet,

    #[error("Secret key does not match the secret lock")]
    SecretMismatch,

    #[error("Swap timelock has not been reached")]
    NotYetDue,

    #[error("Field exceeds the size limit")]
    OversizedField,

    #[error("Balance arithmetic overflow")]
    Overflow,
}

impl BridgeError {
    /// Aborts the current call; the host reverts every write made by it.
    pub fn panic(&self) -> ! {
        near_sdk::env::panic_str(&self.to_string())
    }
}
