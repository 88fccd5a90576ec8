//! Process-wide statistics counters (spec §5: "updated under a single
//! process-wide lock at transaction end").

use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub body_bytes_in: u64,
    pub body_bytes_out: u64,
}

static COUNTERS: Mutex<Counters> = Mutex::new(Counters {
    requests_total: 0,
    requests_failed: 0,
    bytes_in: 0,
    bytes_out: 0,
    body_bytes_in: 0,
    body_bytes_out: 0,
});

/// Records the outcome of one finished transaction. Called exactly
/// once per transaction, success or failure, from the server state
/// machine.
pub fn record_transaction(failed: bool, bytes_in: u64, bytes_out: u64, body_bytes_in: u64, body_bytes_out: u64) {
    let mut c = COUNTERS.lock().unwrap_or_else(|poison| poison.into_inner());
    c.requests_total += 1;
    if failed {
        c.requests_failed += 1;
    }
    c.bytes_in += bytes_in;
    c.bytes_out += bytes_out;
    c.body_bytes_in += body_bytes_in;
    c.body_bytes_out += body_bytes_out;
}

pub fn snapshot() -> Counters {
    *COUNTERS.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = snapshot();
        record_transaction(false, 100, 50, 80, 40);
        let after = snapshot();
        assert_eq!(after.requests_total, before.requests_total + 1);
        assert_eq!(after.bytes_in, before.bytes_in + 100);
    }
}
