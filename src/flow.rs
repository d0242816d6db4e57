//! Flow-control credit accounting and the pending line queue.
//!
//! The controller's onboard buffer only holds a handful of lines, so
//! outbound G-code is queued here and released against a send-credit
//! counter. Credit is replenished two ways:
//!
//! - **Packet mode** (single channel): the device posts explicit `rx`
//!   buffer-availability reports; credit becomes `rx - 1`. A credit of -1
//!   is legitimate and means "wait for two acknowledgements before
//!   resuming"; the floor guards degenerate reports from going lower.
//! - **Line counting** (dual channel): every acknowledged response that is
//!   not an out-of-band acknowledgement adds one credit.
//!
//! Out-of-band writes (control bytes, direct structured records) bypass the
//! queue entirely but still consume one ignored-response slot so their
//! acknowledgement neither inflates credit nor satisfies a request. In
//! timed-sends-only mode responses never grant credit; timers do.

use serde_json::Value;
use std::collections::VecDeque;

/// Result of one drain pass over the pending queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Lines released for transmission, in enqueue order.
    pub sent: Vec<String>,
    /// End-of-input observed and the queue is now empty. Reported once per
    /// session.
    pub done: bool,
    /// The queue holds fewer lines than remaining credit; the producer
    /// should top it up by this many.
    pub need: Option<usize>,
}

#[derive(Debug)]
pub struct FlowControl {
    buffer: VecDeque<String>,
    credit: i64,
    packet_mode: bool,
    timed_sends_only: bool,
    ignored_responses: u32,
    done_reading: bool,
    completion_sent: bool,
    draining: bool,
}

impl FlowControl {
    pub fn new(packet_mode: bool, timed_sends_only: bool) -> Self {
        Self {
            buffer: VecDeque::new(),
            credit: 0,
            packet_mode,
            timed_sends_only,
            ignored_responses: 0,
            done_reading: false,
            completion_sent: false,
            draining: false,
        }
    }

    /// Append a line to the pending queue. Call [`Self::drain`] afterwards
    /// to release whatever credit allows.
    pub fn enqueue(&mut self, line: String) {
        self.buffer.push_back(line);
    }

    /// Release queued lines while credit remains.
    ///
    /// A drain in progress must not be re-entered by a nested write fired
    /// from one of its own callbacks; the guard makes the nested call a
    /// no-op instead.
    pub fn drain(&mut self) -> DrainOutcome {
        if self.draining {
            return DrainOutcome::default();
        }
        self.draining = true;

        let mut sent = Vec::new();
        while self.credit > 0 {
            match self.buffer.pop_front() {
                Some(line) => {
                    sent.push(line);
                    self.credit -= 1;
                }
                None => break,
            }
        }

        let mut done = false;
        let mut need = None;
        if self.done_reading {
            if self.buffer.is_empty() && !self.completion_sent {
                self.completion_sent = true;
                done = true;
            }
        } else if (self.buffer.len() as i64) < self.credit {
            need = Some((self.credit - self.buffer.len() as i64) as usize);
        }

        self.draining = false;
        DrainOutcome { sent, done, need }
    }

    /// Account for one acknowledged response; returns `true` when a drain
    /// should follow.
    pub fn on_response(&mut self, body: &Value) -> bool {
        if self.packet_mode && body.get("rx").is_some() {
            // Buffer-availability answer to our own rx query: consumes an
            // ignored slot and (outside timed mode) resets credit outright.
            self.ignored_responses = self.ignored_responses.saturating_sub(1);
            if !self.timed_sends_only {
                if let Some(rx) = body.get("rx").and_then(Value::as_i64) {
                    self.credit = (rx - 1).max(-1);
                }
            }
        } else if self.ignored_responses > 0 {
            self.ignored_responses -= 1;
            return false;
        } else if !self.timed_sends_only {
            self.credit += 1;
        }

        !self.timed_sends_only && self.credit > 0
    }

    /// Record an out-of-band command whose acknowledgement must be ignored.
    pub fn note_out_of_band(&mut self) {
        self.ignored_responses += 1;
    }

    /// Mark (or clear) end-of-input for the current streaming session.
    pub fn set_done_reading(&mut self, done: bool) {
        self.done_reading = done;
        if !done {
            self.completion_sent = false;
        }
    }

    pub fn set_credit(&mut self, credit: i64) {
        self.credit = credit;
    }

    /// Timer-granted credit in timed-sends-only mode.
    pub fn add_credit(&mut self, lines: i64) {
        self.credit += lines;
    }

    pub fn credit(&self) -> i64 {
        self.credit
    }

    pub fn queue_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.credit = 0;
        self.ignored_responses = 0;
        self.done_reading = false;
        self.completion_sent = false;
        self.draining = false;
    }
}
