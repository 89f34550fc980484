use std::time::Duration;

use tracing::info;

/// Bounded grace for a transition's stop phase before the start phase is
/// forced.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// What to do with the machine once a final runlevel (0 or 6) quiesces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltKind {
    None,
    Halt,
    PowerOff,
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Steady,
    /// Records ineligible at the new level are stopping; no new starts.
    Stopping,
}

/// Current runlevel in [0..9] plus the previous level. Level 0 is
/// reserved for halt/poweroff, 6 for reboot and 0 doubles as the
/// bootstrap level entered once at boot.
pub struct Governor {
    level: u8,
    prev: u8,
    phase: Phase,
    halt: HaltKind,
}

impl Governor {
    pub fn new() -> Governor {
        Governor {
            level: 0,
            prev: 0,
            phase: Phase::Steady,
            halt: HaltKind::None,
        }
    }

    pub fn current(&self) -> u8 {
        self.level
    }

    pub fn prev(&self) -> u8 {
        self.prev
    }

    pub fn bootstrapping(&self) -> bool {
        self.level == 0 && self.halt == HaltKind::None
    }

    pub fn halt_kind(&self) -> HaltKind {
        self.halt
    }

    pub fn in_stop_phase(&self) -> bool {
        self.phase == Phase::Stopping
    }

    /// Serialize a transition request. Requesting the current level is a
    /// no-op; 0 and 6 arm their final system action.
    pub fn request(&mut self, level: u8) -> bool {
        if level > 9 || level == self.level {
            return false;
        }

        info!("runlevel {} -> {}", self.level, level);
        self.prev = self.level;
        self.level = level;
        self.phase = Phase::Stopping;
        match level {
            0 if self.halt == HaltKind::None => self.halt = HaltKind::PowerOff,
            6 => self.halt = HaltKind::Reboot,
            _ => {}
        }
        true
    }

    /// Override the final action before requesting level 0 (halt vs
    /// poweroff, per the received signal).
    pub fn set_halt(&mut self, kind: HaltKind) {
        self.halt = kind;
    }

    /// Stop phase done (all ineligible records halted, or grace expired);
    /// newly eligible records may start.
    pub fn finish_stop_phase(&mut self) {
        self.phase = Phase::Steady;
    }

    /// Leaving bootstrap: same stop/start sequencing, keeps prev at 0.
    pub fn leave_bootstrap(&mut self, target: u8) -> bool {
        if !self.bootstrapping() {
            return false;
        }
        self.request(target)
    }
}

impl Default for Governor {
    fn default() -> Self {
        Governor::new()
    }
}

/// Map a runlevel character from the legacy wire protocol; `S`/`s` is
/// single user, an alias for level 1.
pub fn level_from_char(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        'S' | 's' => Some(1),
        _ => None,
    }
}
