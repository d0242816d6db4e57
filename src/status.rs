//! Machine run-state tracking from periodic status reports.
//!
//! The tracker owns two pieces of connection-wide state: the feedhold flag
//! (entered on `Hold`, cleared when `Run` follows a hold) and the last
//! executed line number, kept for diagnostics only. Stop/End are not acted
//! on here; the streaming session consumes those to decide completion.
//! Alarm is latched so the fatal transition is reported exactly once.

use crate::protocol::{MachineState, StatusReport};

#[derive(Debug, Default)]
pub struct StatusTracker {
    in_hold: bool,
    alarmed: bool,
    last_line: Option<i64>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one status report; returns `true` when this report is the
    /// transition into alarm state.
    pub fn observe(&mut self, report: &StatusReport) -> bool {
        if let Some(line) = report.line {
            self.last_line = Some(line);
        }

        match report.machine_state() {
            Some(MachineState::Hold) => {
                self.in_hold = true;
                false
            }
            Some(MachineState::Run) => {
                if self.in_hold {
                    self.in_hold = false;
                }
                false
            }
            Some(MachineState::Alarm) => {
                let entered = !self.alarmed;
                self.alarmed = true;
                entered
            }
            _ => false,
        }
    }

    pub fn in_hold(&self) -> bool {
        self.in_hold
    }

    pub fn alarmed(&self) -> bool {
        self.alarmed
    }

    /// Last line number the controller reported executing.
    pub fn last_line(&self) -> Option<i64> {
        self.last_line
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
