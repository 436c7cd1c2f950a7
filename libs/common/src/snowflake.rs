use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z in milliseconds since Unix epoch.
const KESTREL_EPOCH_MS: u64 = 1_704_067_200_000;

const INSTANCE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit snowflake generator used for request echo tokens.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits): ms since the Kestrel epoch
/// - Bits 21–12: Instance ID (10 bits)
/// - Bits 11–0:  Sequence (12 bits)
///
/// The timestamp is a logical clock: it never moves backwards, and when the
/// sequence for a millisecond is exhausted generation borrows the next
/// millisecond instead of spinning. Every value handed out by one generator is
/// strictly greater than the previous one.
pub struct SnowflakeGenerator {
    instance_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Create a generator. Instance IDs wider than 10 bits are masked.
    pub fn new(instance_id: u16) -> Self {
        Self {
            instance_id: u64::from(instance_id) & ((1 << INSTANCE_BITS) - 1),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        } else {
            state.sequence = 0;
            state.last_ms = now_ms;
        }

        let ts = state.last_ms.saturating_sub(KESTREL_EPOCH_MS);
        (ts << (INSTANCE_BITS + SEQUENCE_BITS))
            | (self.instance_id << SEQUENCE_BITS)
            | state.sequence
    }

    /// Next value rendered as a decimal string, the form placed in `echo`.
    pub fn next_token(&self) -> String {
        self.generate().to_string()
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(KESTREL_EPOCH_MS)
}

/// Extract the creation timestamp (ms since Unix epoch) from a snowflake ID.
pub fn snowflake_timestamp_ms(id: u64) -> u64 {
    (id >> (INSTANCE_BITS + SEQUENCE_BITS)) + KESTREL_EPOCH_MS
}
