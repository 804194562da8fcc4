use std::time::Duration;

/// Reconnect delays in seconds. The last rung repeats.
pub const LADDER: [u64; 6] = [1, 2, 5, 10, 30, 60];

/// Position on the reconnect ladder.
#[derive(Debug, Default)]
pub struct Backoff {
    idx: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next dial; advances the ladder.
    pub fn next_delay(&mut self) -> Duration {
        let secs = LADDER[self.idx.min(LADDER.len() - 1)];
        if self.idx < LADDER.len() - 1 {
            self.idx += 1;
        }
        Duration::from_secs(secs)
    }

    /// Called once a handshake succeeds.
    pub fn reset(&mut self) {
        self.idx = 0;
    }
}
