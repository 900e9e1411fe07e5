use crate::ledger::PROGRESS_TOTAL;

/// Highest percentage an unfinished run may report.
pub const PROGRESS_CEILING: u8 = PROGRESS_TOTAL - 1;

fn random_u32() -> u32 {
    let mut bytes = [0_u8; 4];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes),
        Err(_) => 0,
    }
}

/// Percentage for the step after `previous`: `0` for the first step, then a
/// random value in `(previous, 99]`, pinned at `99` once reached.
pub fn next_percentage(previous: Option<u8>) -> u8 {
    let Some(previous) = previous else {
        return 0;
    };
    if previous >= PROGRESS_CEILING {
        return PROGRESS_CEILING;
    }
    let span = u32::from(PROGRESS_CEILING - previous);
    previous + 1 + (random_u32() % span) as u8
}

/// Percentage cursor for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressCursor {
    current: Option<u8>,
}

impl ProgressCursor {
    pub fn advance(&mut self) -> u8 {
        let next = next_percentage(self.current);
        self.current = Some(next);
        next
    }
}
