use std::time::Duration;

use super::PumpConfig;

/// Per-block retry delay: starts at `initial + jitter(0..=initial_jitter)`, grows by 1.5x
/// plus up to another half of the grown value, and never exceeds `max_backoff`.
///
/// Jitter is derived from a per-block seed so pumps retrying at the same moment spread
/// out without shared random state.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current_ms: u64,
    max_ms: u64,
    seed: u64,
    step: u32,
}

impl Backoff {
    pub(crate) fn new(config: &PumpConfig, seed: u64) -> Self {
        let max_ms = duration_ms(config.max_backoff);
        let jitter = deterministic_jitter(seed, 0, duration_ms(config.initial_jitter));
        Self {
            current_ms: duration_ms(config.initial_backoff)
                .saturating_add(jitter)
                .min(max_ms),
            max_ms,
            seed,
            step: 0,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    pub(crate) fn grow(&mut self) {
        self.step = self.step.saturating_add(1);
        let grown = self.current_ms.saturating_mul(3) / 2;
        let jitter = deterministic_jitter(self.seed, self.step, grown / 2);
        self.current_ms = grown.saturating_add(jitter).min(self.max_ms);
    }
}

/// Seed for one block's jitter sequence.
pub(crate) fn jitter_seed(table_name: &str, partition_id: i32, seq: i64) -> u64 {
    // FNV-1a over the table name, then fold in the partition and block sequence.
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in table_name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash ^ (partition_id as u64).rotate_left(32) ^ (seq as u64)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn deterministic_jitter(seed: u64, step: u32, jitter_cap: u64) -> u64 {
    if jitter_cap == 0 {
        return 0;
    }

    let mut x = seed ^ u64::from(step).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;

    x % (jitter_cap.saturating_add(1))
}
