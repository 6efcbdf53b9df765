use near_sdk::Timestamp;

const NANOS_IN_SEC: u64 = 1_000_000_000;
const SECS_IN_HOUR: u64 = 60 * 60;

/// Window granted when the sender stakes the secret lock at open time.
pub const SENDER_LOCK_HOURS: u64 = 48;
/// Window granted to the receiver to produce the secret lock.
pub const RECEIVER_LOCK_HOURS: u64 = 24;

/// The party responsible for producing the secret lock of a swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyHolder {
    Sender,
    Receiver,
}

impl KeyHolder {
    /// A lock supplied at open time makes the sender the key holder.
    pub fn for_lock<T>(secret_lock: Option<&T>) -> Self {
        match secret_lock {
            Some(_) => KeyHolder::Sender,
            None => KeyHolder::Receiver,
        }
    }

    pub fn window(&self) -> u64 {
        let hours = match self {
            KeyHolder::Sender => SENDER_LOCK_HOURS,
            KeyHolder::Receiver => RECEIVER_LOCK_HOURS,
        };
        hours * SECS_IN_HOUR * NANOS_IN_SEC
    }

    /// Absolute timelock for a swap opened at `now`. Computed once and never revisited.
    pub fn deadline(&self, now: Timestamp) -> Timestamp {
        now.saturating_add(self.window())
    }
}

/// True once block time has caught up with the timelock.
pub fn is_reached(timelock: Timestamp, now: Timestamp) -> bool {
    now >= timelock
}
