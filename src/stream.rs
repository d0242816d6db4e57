//! File and stream sending with backpressure.
//!
//! A streaming session reads the input in chunks, feeds whole lines into
//! the flow-controlled write path, and otherwise sits on the event stream.
//! Reading is demand driven: the session holds a count of lines the flow
//! layer asked for and only touches the input while that count is positive,
//! so a slow machine never pulls the whole file into memory.
//!
//! Completion needs two independent signals, in either order: the driver
//! must report that the last queued line went out, and the machine must
//! report that motion reached a program stop or end. An alarm fails the
//! session immediately.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::driver::Tinyg;
use crate::error::{Result, TinygError};
use crate::event::Event;
use crate::framing::LineSplitter;
use crate::protocol::MachineState;

const READ_CHUNK: usize = 4096;

/// Any existing line number is stripped before the session assigns its own.
#[allow(clippy::unwrap_used)]
static LINE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[nN][0-9]+\s*").unwrap());

impl Tinyg {
    /// Stream a G-code file to the machine and wait for it to finish
    /// executing.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "sending gcode file");
        let file = File::open(path)
            .await
            .map_err(|err| TinygError::Input(format!("{}: {err}", path.display())))?;
        self.send_stream(file).await
    }

    /// Stream G-code from any async reader. Resolves once every line has
    /// been sent and the machine reports stop or end; fails on alarm.
    pub async fn send_stream<R>(&self, input: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        // Subscribe before the first write so no flow signal is missed.
        let events = self.subscribe();
        if !self.is_open().await {
            return Err(TinygError::NotOpen);
        }
        let timed = {
            let state = self.shared.state.lock().await;
            state.timed_sends_only
        };

        let result = self.run_stream(input, events, timed).await;

        // Leave the flow layer ready for the next session.
        {
            let mut state = self.shared.state.lock().await;
            state.flow.set_done_reading(false);
        }
        result
    }

    async fn run_stream<R>(
        &self,
        mut input: R,
        mut events: tokio::sync::broadcast::Receiver<Event>,
        timed: bool,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; READ_CHUNK];
        let mut next_line: i64 = 1;

        // Demand from the flow layer; primed at one so the first line goes
        // out and starts the credit conversation.
        let mut needed: usize = 1;
        let mut input_ended = false;
        let mut done_reading_marked = false;

        // The two completion signals.
        let mut done_sending = false;
        let mut stop_or_end = false;

        loop {
            while needed > 0 && !input_ended {
                match input.read(&mut buf).await {
                    Ok(0) => {
                        input_ended = true;
                        if let Some(rest) = splitter.flush() {
                            self.send_numbered(&rest, &mut next_line, timed).await?;
                        }
                        debug!(lines = next_line - 1, "input exhausted");
                    }
                    Ok(n) => {
                        for line in splitter.push(&buf[..n]) {
                            if self.send_numbered(&line, &mut next_line, timed).await? {
                                needed = needed.saturating_sub(1);
                            }
                        }
                    }
                    Err(err) => return Err(TinygError::Input(err.to_string())),
                }
            }

            if input_ended && !done_reading_marked {
                done_reading_marked = true;
                let mut state = self.shared.state.lock().await;
                state.flow.set_done_reading(true);
                let outcome = state.drain_and_send(&self.shared.events).await?;
                // Take this drain's completion from the outcome directly.
                // Its broadcast copy queues behind whatever this receiver
                // has not caught up on yet, including a Close from a device
                // that hung up right after reporting stop.
                if outcome.done {
                    done_sending = true;
                }
            }

            if done_sending && stop_or_end {
                info!(lines = next_line - 1, "gcode stream complete");
                return Ok(());
            }

            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "streaming session lagged; resyncing from flow state");
                    // Skipped events may have carried NeedLines or
                    // DoneSending; recover both from the flow layer.
                    let state = self.shared.state.lock().await;
                    let (need, drained) = resync_flow(
                        state.flow.credit(),
                        state.flow.queue_len(),
                        done_reading_marked,
                    );
                    if let Some(n) = need {
                        needed = n;
                    }
                    if drained {
                        done_sending = true;
                    }
                    continue;
                }
                Err(RecvError::Closed) => return Err(TinygError::Closed),
            };

            match event {
                Event::NeedLines(n) => needed = n,
                Event::DoneSending => done_sending = true,
                Event::StatusChanged(report) => match report.machine_state() {
                    Some(MachineState::Stop) => stop_or_end = true,
                    Some(MachineState::End) => {
                        // End means the machine is finished with input,
                        // whether or not we were.
                        stop_or_end = true;
                        input_ended = true;
                    }
                    Some(MachineState::Alarm) => return Err(TinygError::Alarm),
                    // Hold and a later resume both mean motion is not done.
                    Some(MachineState::Hold) | Some(MachineState::Run) => stop_or_end = false,
                    _ => {}
                },
                Event::Error(TinygError::Alarm) => return Err(TinygError::Alarm),
                Event::Close => return Err(TinygError::Closed),
                _ => {}
            }
        }
    }

    /// Queue one line, renumbered. Blank lines are skipped; timed-sends
    /// input keeps its own numbering and timecodes.
    async fn send_numbered(&self, line: &str, next_line: &mut i64, timed: bool) -> Result<bool> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }
        if timed {
            self.write(trimmed).await?;
        } else {
            let body = LINE_NUMBER_RE.replace(trimmed, "");
            let numbered = format!("N{next_line} {body}");
            *next_line += 1;
            self.write(&numbered).await?;
        }
        Ok(true)
    }
}

/// Recover the demand and drain-complete signals a lagged receiver may have
/// missed, from a flow-control snapshot.
fn resync_flow(credit: i64, queued: usize, done_reading: bool) -> (Option<usize>, bool) {
    let drained = done_reading && queued == 0;
    let shortfall = credit - queued as i64;
    let need = if !done_reading && shortfall > 0 {
        Some(shortfall as usize)
    } else {
        None
    };
    (need, drained)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_line_numbers_are_stripped() {
        assert_eq!(LINE_NUMBER_RE.replace("N10 g0 x1", ""), "g0 x1");
        assert_eq!(LINE_NUMBER_RE.replace("n2g1f200", ""), "g1f200");
        assert_eq!(LINE_NUMBER_RE.replace("g0 x1", ""), "g0 x1");
    }

    #[test]
    fn resync_recovers_missed_demand_while_reading() {
        assert_eq!(resync_flow(5, 2, false), (Some(3), false));
        // Queue already covers the credit: nothing to ask for.
        assert_eq!(resync_flow(2, 2, false), (None, false));
        assert_eq!(resync_flow(0, 1, false), (None, false));
    }

    #[test]
    fn resync_recovers_missed_drain_completion() {
        assert_eq!(resync_flow(3, 0, true), (None, true));
        // Lines still queued: not drained yet, and no further demand
        // after end of input.
        assert_eq!(resync_flow(0, 2, true), (None, false));
    }
}
