use near_sdk::{bs58, env, AccountId, CryptoHash, PromiseResult};

use crate::swap::Balance;

// Helper for consistent logging
pub fn log_swap_event(event: &str, id: &CryptoHash, actor: &AccountId, amount: Balance) {
    env::log_str(&format!(
        "SWAP_{}: id='{}', actor='{}', amount='{}'",
        event,
        bs58::encode(id).into_string(),
        actor,
        amount
    ));
}

pub fn log_bridge_event(event: &str, actor: &AccountId, amount: Balance) {
    env::log_str(&format!(
        "BRIDGE_{}: actor='{}', amount='{}'",
        event, actor, amount
    ));
}

// True when every promise this callback was chained on succeeded
pub fn promises_succeeded() -> bool {
    (0..env::promise_results_count())
        .all(|idx| matches!(env::promise_result(idx), PromiseResult::Successful(_)))
}
