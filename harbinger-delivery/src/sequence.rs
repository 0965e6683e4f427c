//! Process-wide file-name sequencer.

use parking_lot::Mutex;

/// Rolling 31-bit counter. Wraps back to 1 past `i32::MAX`; callers combine
/// the value with wall-clock seconds and the hostname, so uniqueness is only
/// needed within a wrap window.
#[derive(Debug, Default)]
pub struct Sequencer {
    current: Mutex<i32>,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i32 {
        let mut current = self.current.lock();
        if *current >= i32::MAX {
            *current = 1;
        } else {
            *current += 1;
        }
        *current
    }
}
