//! The TinyG connection object.
//!
//! [`Tinyg`] owns one or two serial channels to a single controller, runs a
//! reader task that feeds the frame decoder, and fans every decoded
//! consequence out on a broadcast channel. All protocol state (line queue,
//! send credit, hold flag, outstanding requests) lives behind one async
//! mutex, so decoder events and caller writes mutate it strictly one at a
//! time, in arrival order.
//!
//! Write paths, mirroring the device's expectations:
//! - plain G-code lines go through the pending queue and flow control;
//! - structured records and single control bytes bypass the queue
//!   (out-of-band), with the record acknowledgements consumed via the
//!   ignored-response counter;
//! - with a data port present, queued lines go out on the data channel
//!   while records and control bytes stay on the command channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex as SyncMutex;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::error::{Result, TinygError};
use crate::event::{Event, PortChannel};
use crate::flow::{DrainOutcome, FlowControl};
use crate::framing::LineSplitter;
use crate::gcode::{self, GcodeContext};
use crate::protocol::{self, MachineState, WireEvent};
use crate::request::RequestTracker;
use crate::serial::{self, DynSerial};
use crate::status::StatusTracker;

/// Capacity of the broadcast event channel. Streaming sessions read it
/// continuously; the headroom covers bursts while they are mid-read.
const EVENT_CAPACITY: usize = 1024;

/// Dual-channel connections start with effectively unlimited credit; the
/// device throttles via RTS/CTS on the data port instead.
const INITIAL_DUAL_CHANNEL_CREDIT: i64 = 1000;

/// Single-character writes that bypass the pending queue.
#[allow(clippy::unwrap_used)]
static SPECIAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[{}!~%\x03\x04]$").unwrap());

/// The subset of specials the device never acknowledges.
#[allow(clippy::unwrap_used)]
static NO_RESPONSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[!~%\x03\x04]$").unwrap());

/// Lines that must go out on the command channel even when a data port
/// exists: structured records and control bytes, optionally N-prefixed.
#[allow(clippy::unwrap_used)]
static CONTROL_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(N[0-9]+\s*)?[{}!~\x01-\x19]").unwrap());

/// Exception to the above: queue-clear records belong on the data channel.
#[allow(clippy::unwrap_used)]
static CLEAR_RECORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(N[0-9]+\s*)?\{\s*(clr|clear)\s*:\s*n(ull)?\s*\}").unwrap());

/// `[[G<ms>]]` / `[[C<ms>]]` timecode prefix used by timed-sends mode.
#[allow(clippy::unwrap_used)]
static TIMECODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(N[0-9]+\s*)?\[\[([GC])([0-9]+)\]\](.*)$").unwrap());

/// `\xNN` escapes accepted in timed-send lines.
#[allow(clippy::unwrap_used)]
static HEX_ESCAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\x([0-9a-fA-F]+)").unwrap());

fn default_baud_rate() -> u32 {
    115_200
}

/// Options accepted by [`Tinyg::open`].
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOptions {
    /// Path of the optional high-volume data port. Without one, all
    /// traffic shares the command port and packet-mode flow control
    /// (explicit `rx` reports) is used.
    #[serde(default)]
    pub data_port_path: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Pace sends purely by `[[G<ms>]]` timecodes; responses grant no
    /// credit.
    #[serde(default)]
    pub timed_sends_only: bool,
    /// Skip the open-time device setup sequence.
    #[serde(default)]
    pub dont_setup: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            data_port_path: None,
            baud_rate: default_baud_rate(),
            timed_sends_only: false,
            dont_setup: false,
        }
    }
}

/// Handle to one TinyG controller. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct Tinyg {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Tinyg {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    pub(crate) events: broadcast::Sender<Event>,
}

pub(crate) struct State {
    control_tx: Option<WriteHalf<DynSerial>>,
    data_tx: Option<WriteHalf<DynSerial>>,
    splitter: LineSplitter,
    pub(crate) flow: FlowControl,
    status: StatusTracker,
    requests: RequestTracker,
    timed: TimedSends,
    pub(crate) timed_sends_only: bool,
    tasks: Vec<JoinHandle<()>>,
    pub(crate) open: bool,
}

impl State {
    fn new() -> Self {
        Self {
            control_tx: None,
            data_tx: None,
            splitter: LineSplitter::new(),
            flow: FlowControl::new(true, false),
            status: StatusTracker::new(),
            requests: RequestTracker::new(),
            timed: TimedSends::default(),
            timed_sends_only: false,
            tasks: Vec::new(),
            open: false,
        }
    }

    /// Write one line (newline-terminated if not already) to the channel
    /// its shape routes it to.
    async fn write_direct(&mut self, value: &str, events: &broadcast::Sender<Event>) -> Result<()> {
        let mut line = value.to_string();
        if !line.ends_with('\n') && !line.ends_with('\r') {
            line.push('\n');
        }

        let to_control = routes_to_control(&line, self.data_tx.is_some());
        let (port, channel) = if to_control {
            (self.control_tx.as_mut(), PortChannel::Control)
        } else {
            (self.data_tx.as_mut(), PortChannel::Data)
        };
        let Some(port) = port else {
            return Err(TinygError::NotOpen);
        };

        port.write_all(line.as_bytes())
            .await
            .map_err(|err| TinygError::Transport(err.to_string()))?;
        port.flush()
            .await
            .map_err(|err| TinygError::Transport(err.to_string()))?;

        debug!(?channel, line = line.trim_end(), "sent");
        let _ = events.send(Event::SentRaw {
            data: line,
            channel,
        });
        Ok(())
    }

    /// Release whatever credit allows from the pending queue and report
    /// the resulting need/completion signals.
    ///
    /// The outcome is both broadcast and returned: a caller that triggered
    /// the drain itself must not depend on reading its own signal back off
    /// the event channel, where it would queue behind anything already
    /// in flight.
    pub(crate) async fn drain_and_send(
        &mut self,
        events: &broadcast::Sender<Event>,
    ) -> Result<DrainOutcome> {
        let outcome = self.flow.drain();

        let mut last_line = None;
        for line in &outcome.sent {
            self.write_direct(line, events).await?;
            let mut ctx = GcodeContext::default();
            if let Some(parsed) = gcode::annotate(line, &mut ctx) {
                let _ = events.send(Event::SentGcode(parsed));
            }
            last_line = ctx.line;
        }
        let _ = events.send(Event::SentLine(last_line));

        if outcome.done {
            let _ = events.send(Event::DoneSending);
        } else if let Some(need) = outcome.need {
            let _ = events.send(Event::NeedLines(need));
        }
        Ok(outcome)
    }

    async fn handle_line(&mut self, line: String, events: &broadcast::Sender<Event>) -> Result<()> {
        let _ = events.send(Event::Data(line.clone()));

        if !line.starts_with('{') {
            return Ok(());
        }

        let wire_events = match protocol::decode_record(&line) {
            Ok(events) => events,
            Err(err) => {
                // Malformed line: dropped, no state touched.
                debug!(error = %err, "discarding undecodable report line");
                let _ = events.send(Event::Error(err));
                return Ok(());
            }
        };

        for wire_event in wire_events {
            match wire_event {
                WireEvent::Error(err) => {
                    self.requests.fail_all(&err);
                    let _ = events.send(Event::Error(err));
                }
                WireEvent::Response { body, footer } => {
                    self.requests.resolve(&body);
                    let should_drain = self.flow.on_response(&body);
                    let _ = events.send(Event::Response { body, footer });
                    if should_drain {
                        self.drain_and_send(events).await?;
                    }
                }
                WireEvent::ErrorReport(report) => {
                    let _ = events.send(Event::ErrorReport(report));
                }
                WireEvent::StatusChanged(report) => {
                    let entered_alarm = self.status.observe(&report);
                    let _ = events.send(Event::StatusChanged(report));
                    if entered_alarm {
                        let err = TinygError::Alarm;
                        self.requests.fail_all(&err);
                        let _ = events.send(Event::Error(err));
                    }
                }
                WireEvent::GcodeReceived(echoed) => {
                    let _ = events.send(Event::GcodeReceived(echoed));
                }
                WireEvent::RxReceived(available) => {
                    let _ = events.send(Event::RxReceived(available));
                }
            }
        }
        Ok(())
    }
}

impl Shared {
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn handle_chunk(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let lines = state.splitter.push(bytes);
        for line in lines {
            state.handle_line(line, &self.events).await?;
        }
        Ok(())
    }

    /// Tear the connection down: drop ports, fail anything outstanding,
    /// stop the reader tasks, announce `Close`.
    async fn mark_closed(&self, reason: Option<TinygError>) {
        let tasks = {
            let mut state = self.state.lock().await;
            if !state.open {
                return;
            }
            state.open = false;
            state.control_tx = None;
            state.data_tx = None;
            state.flow.reset();
            state
                .requests
                .fail_all(&reason.unwrap_or(TinygError::Closed));
            state.tasks.drain(..).collect::<Vec<_>>()
        };

        self.emit(Event::Close);
        info!("tinyg connection closed");
        for task in tasks {
            task.abort();
        }
    }
}

impl Tinyg {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                events,
            }),
        }
    }

    /// Subscribe to the driver's event stream. Only events emitted after
    /// the call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub async fn is_open(&self) -> bool {
        self.shared.state.lock().await.open
    }

    /// Whether the machine is currently in feedhold.
    pub async fn in_hold(&self) -> bool {
        self.shared.state.lock().await.status.in_hold()
    }

    /// Last line number the controller reported executing.
    pub async fn last_status_line(&self) -> Option<i64> {
        self.shared.state.lock().await.status.last_line()
    }

    /// Current send credit. Diagnostic only.
    pub async fn send_credit(&self) -> i64 {
        self.shared.state.lock().await.flow.credit()
    }

    /// Lines waiting in the pending queue. Diagnostic only.
    pub async fn queued_lines(&self) -> usize {
        self.shared.state.lock().await.flow.queue_len()
    }

    /// Open the controller at `path`, plus the data port named in
    /// `options` if any.
    pub async fn open(&self, path: &str, options: OpenOptions) -> Result<()> {
        if self.is_open().await {
            return Err(TinygError::AlreadyOpen(path.to_string()));
        }

        info!(
            path,
            data_port = options.data_port_path.as_deref(),
            "opening tinyg"
        );
        let control = serial::open_serial_async(path, options.baud_rate).await?;
        let data = match &options.data_port_path {
            Some(data_path) => Some(serial::open_serial_async(data_path, options.baud_rate).await?),
            None => None,
        };
        self.open_with_transport(control, data, &options).await
    }

    /// Autodetect a controller and open the first one found.
    pub async fn open_first(&self, fail_if_more: bool, mut options: OpenOptions) -> Result<()> {
        let mut found = discovery::list()?;
        if found.is_empty() {
            return Err(TinygError::NoDeviceFound);
        }
        if fail_if_more && found.len() > 1 {
            return Err(TinygError::MultipleDevices(found.len()));
        }
        let device = found.remove(0);
        if options.data_port_path.is_none() {
            options.data_port_path = device.data_port_path;
        }
        self.open(&device.path, options).await
    }

    /// Attach already-open channels instead of serial paths.
    ///
    /// This is the transport seam: anything `AsyncRead + AsyncWrite` works,
    /// which is how tests drive the driver over in-memory duplex pairs.
    pub async fn open_with_transport(
        &self,
        control: DynSerial,
        data: Option<DynSerial>,
        options: &OpenOptions,
    ) -> Result<()> {
        let single_channel = data.is_none();

        let (control_rx, control_tx) = tokio::io::split(control);
        let mut data_rx = None;
        let mut data_tx = None;
        if let Some(stream) = data {
            let (rx, tx) = tokio::io::split(stream);
            data_rx = Some(rx);
            data_tx = Some(tx);
        }

        {
            let mut state = self.shared.state.lock().await;
            if state.open {
                return Err(TinygError::AlreadyOpen("<transport>".to_string()));
            }
            *state = State::new();
            state.open = true;
            state.timed_sends_only = options.timed_sends_only;
            state.flow = FlowControl::new(single_channel, options.timed_sends_only);
            state.control_tx = Some(control_tx);
            state.data_tx = data_tx;
        }

        let mut tasks = Vec::new();
        let shared = Arc::clone(&self.shared);
        tasks.push(tokio::spawn(read_loop(shared, control_rx)));
        if let Some(rx) = data_rx {
            let shared = Arc::clone(&self.shared);
            tasks.push(tokio::spawn(data_read_loop(shared, rx)));
        }
        self.shared.state.lock().await.tasks = tasks;

        // Prime flow control: packet mode asks the device how much room it
        // has; dual channel starts wide open.
        if single_channel {
            self.write_record(json!({ "rx": null })).await?;
        } else if !options.timed_sends_only {
            let mut state = self.shared.state.lock().await;
            state.flow.set_credit(INITIAL_DUAL_CHANNEL_CREDIT);
        }

        if !options.dont_setup {
            let mut setup: Vec<(String, Value)> = vec![
                ("jv".to_string(), json!(4)), // JSON verbosity
                ("ex".to_string(), json!(2)), // RTS/CTS flow control
                ("qv".to_string(), json!(2)), // queue report verbosity
            ];
            if single_channel {
                setup.push(("rxm".to_string(), json!(1))); // packet mode
            }
            let _ = self.set_many(setup).await;
        }

        self.shared.emit(Event::Open);
        info!("tinyg connection open");
        Ok(())
    }

    /// Close the connection. Everything still queued or outstanding fails
    /// with [`TinygError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if !self.is_open().await {
            return Err(TinygError::NotOpen);
        }
        self.shared.mark_closed(None).await;
        Ok(())
    }

    /// Write a line of G-code (queued, flow controlled) or a single
    /// control character (out-of-band).
    pub async fn write(&self, value: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.open {
            return Err(TinygError::NotOpen);
        }

        if state.timed_sends_only {
            let line = self.prepare_timed_line(&mut state, value);
            state.flow.enqueue(ensure_newline(&line));
            state.drain_and_send(&self.shared.events).await?;
            return Ok(());
        }

        if SPECIAL_RE.is_match(value) {
            // Specials bypass the queue. Bare control characters get no
            // acknowledgement, so only the others consume an ignored slot.
            if !NO_RESPONSE_RE.is_match(value) {
                state.flow.note_out_of_band();
            }
            return state.write_direct(value, &self.shared.events).await;
        }

        state.flow.enqueue(ensure_newline(value));
        state.drain_and_send(&self.shared.events).await?;
        Ok(())
    }

    /// Write a structured record directly, bypassing the queue. Its
    /// acknowledgement is consumed without granting credit.
    pub async fn write_record(&self, record: Value) -> Result<()> {
        let line =
            serde_json::to_string(&record).map_err(|err| TinygError::Serialize(err.to_string()))?;
        let mut state = self.shared.state.lock().await;
        if !state.open {
            return Err(TinygError::NotOpen);
        }
        state.flow.note_out_of_band();
        state.write_direct(&line, &self.shared.events).await
    }

    /// Set one configuration field and resolve with the echoed value.
    pub async fn set(&self, key: &str, value: Value) -> Result<Value> {
        let receiver = {
            let mut state = self.shared.state.lock().await;
            if !state.open {
                return Err(TinygError::NotOpen);
            }
            state.requests.register(key)
        };

        let mut record = serde_json::Map::new();
        record.insert(key.to_string(), value);
        if let Err(err) = self.write_record(Value::Object(record)).await {
            // The request never went out; drop its entry so it cannot
            // swallow a response meant for a later request on this key.
            drop(receiver);
            self.shared.state.lock().await.requests.prune_dead();
            return Err(err);
        }

        receiver.await.map_err(|_| TinygError::Closed)?
    }

    /// Read one configuration field.
    pub async fn get(&self, key: &str) -> Result<Value> {
        self.set(key, Value::Null).await
    }

    /// Set several fields sequentially. A failure on one key is logged and
    /// the chain continues; the caller gets every per-key outcome.
    pub async fn set_many<I>(&self, pairs: I) -> Vec<(String, Result<Value>)>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut outcomes = Vec::new();
        for (key, value) in pairs {
            let result = self.set(&key, value).await;
            if let Err(err) = &result {
                warn!(key = %key, error = %err, "set failed, continuing with remaining keys");
            }
            outcomes.push((key, result));
        }
        outcomes
    }

    /// Write one or more lines and wait for the machine to report a
    /// program stop.
    pub async fn write_and_wait(&self, lines: &[&str]) -> Result<()> {
        self.write_and_wait_for(lines, |event| {
            matches!(event, Event::StatusChanged(sr)
                if sr.machine_state() == Some(MachineState::Stop))
        })
        .await
    }

    /// Write one or more lines and wait until `fulfilled` matches an
    /// emitted event.
    pub async fn write_and_wait_for<F>(&self, lines: &[&str], mut fulfilled: F) -> Result<()>
    where
        F: FnMut(&Event) -> bool,
    {
        let mut events = self.subscribe();
        for line in lines {
            self.write(line).await?;
        }
        loop {
            match events.recv().await {
                Ok(Event::Close) => return Err(TinygError::Closed),
                Ok(event) => {
                    if fulfilled(&event) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(TinygError::Closed),
            }
        }
    }

    /// Timed-sends preprocessing: strip and schedule a timecode prefix,
    /// decode hex escapes. Timing state is owned by this connection.
    fn prepare_timed_line(&self, state: &mut State, value: &str) -> String {
        let Some(caps) = TIMECODE_RE.captures(value) else {
            state.timed.note_line();
            return unescape_hex(value);
        };

        let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let timecode: u64 = caps[3].parse().unwrap_or(0);
        let rest = caps.get(4).map(|m| m.as_str()).unwrap_or("");

        // A fired predecessor hands its accumulated lines to this slot;
        // an unfired one still owns them and will release them itself.
        let carried = state.timed.carried_lines();
        let slot = Arc::new(SyncMutex::new(TimecodeSlot {
            lines: 1 + carried,
            fired: false,
        }));
        state.timed.current = Some(Arc::clone(&slot));
        let delay = state.timed.delay_for(timecode);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.state.lock().await;
            if !state.open {
                return;
            }
            let granted = {
                let mut slot = slot.lock();
                let lines = i64::from(slot.lines);
                slot.lines = 0;
                slot.fired = true;
                lines
            };
            state.flow.add_credit(granted);
            if let Err(err) = state.drain_and_send(&shared.events).await {
                shared.emit(Event::Error(err));
            }
        });

        unescape_hex(&format!("{prefix}{rest}"))
    }
}

async fn read_loop(shared: Arc<Shared>, mut port: ReadHalf<DynSerial>) {
    let mut buf = [0u8; 1024];
    loop {
        match port.read(&mut buf).await {
            Ok(0) => {
                debug!("command channel reached end of stream");
                shared.mark_closed(None).await;
                break;
            }
            Ok(n) => {
                if let Err(err) = shared.handle_chunk(&buf[..n]).await {
                    shared.emit(Event::Error(err));
                }
            }
            Err(err) => {
                let err = TinygError::Transport(err.to_string());
                shared.emit(Event::Error(err.clone()));
                shared.mark_closed(Some(err)).await;
                break;
            }
        }
    }
}

/// The data channel should never talk back; surface whatever shows up.
async fn data_read_loop(shared: Arc<Shared>, mut port: ReadHalf<DynSerial>) {
    let mut buf = [0u8; 1024];
    loop {
        match port.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => shared.emit(Event::Data(String::from_utf8_lossy(&buf[..n]).to_string())),
        }
    }
}

fn routes_to_control(line: &str, has_data_port: bool) -> bool {
    !has_data_port || (CONTROL_LINE_RE.is_match(line) && !CLEAR_RECORD_RE.is_match(line))
}

fn ensure_newline(value: &str) -> String {
    if value.ends_with('\n') || value.ends_with('\r') {
        value.to_string()
    } else {
        format!("{value}\n")
    }
}

fn unescape_hex(value: &str) -> String {
    HEX_ESCAPE_RE
        .replace_all(value, |caps: &Captures| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Per-connection timed-sends state. Process-wide timing globals would
/// bleed schedule state across connections, so the epoch and the pending
/// timecode slot live here.
#[derive(Debug, Default)]
struct TimedSends {
    epoch: Option<(u64, Instant)>,
    current: Option<Arc<SyncMutex<TimecodeSlot>>>,
}

#[derive(Debug)]
struct TimecodeSlot {
    lines: u32,
    fired: bool,
}

impl TimedSends {
    /// A plain line rides with the most recent timecode slot.
    fn note_line(&mut self) {
        if let Some(slot) = &self.current {
            slot.lock().lines += 1;
        }
    }

    /// Lines a fired predecessor hands over to the next timecode.
    fn carried_lines(&self) -> u32 {
        match &self.current {
            Some(slot) => {
                let slot = slot.lock();
                if slot.fired {
                    slot.lines
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    fn delay_for(&mut self, timecode: u64) -> Duration {
        let (start_code, start_at) = *self.epoch.get_or_insert((timecode, Instant::now()));
        let elapsed = start_at.elapsed().as_millis() as i64;
        let delay = timecode as i64 - start_code as i64 - elapsed;
        Duration::from_millis(delay.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn single_channel_routes_everything_to_control() {
        assert!(routes_to_control("N1 G0 X1\n", false));
        assert!(routes_to_control("{jv:4}\n", false));
    }

    #[test]
    fn dual_channel_routes_gcode_to_data_and_records_to_control() {
        assert!(!routes_to_control("N1 G0 X1\n", true));
        assert!(!routes_to_control("G0 X1\n", true));
        assert!(routes_to_control("{jv:4}\n", true));
        assert!(routes_to_control("!\n", true));
        assert!(routes_to_control("N12 {sr:null}\n", true));
    }

    #[test]
    fn clear_records_go_to_the_data_channel() {
        assert!(!routes_to_control("{clr:n}\n", true));
        assert!(!routes_to_control("{clear:null}\n", true));
        assert!(!routes_to_control("N5 { clr : null }\n", true));
    }

    #[test]
    fn specials_are_single_characters_only() {
        for special in ["!", "~", "%", "{", "}"] {
            assert!(SPECIAL_RE.is_match(special), "{special} should bypass");
        }
        assert!(!SPECIAL_RE.is_match("!!"));
        assert!(!SPECIAL_RE.is_match("{jv:4}"));
        // Feedhold and friends never get a response; braces do.
        assert!(NO_RESPONSE_RE.is_match("!"));
        assert!(!NO_RESPONSE_RE.is_match("{"));
    }

    #[test]
    fn hex_escapes_decode_to_bytes() {
        assert_eq!(unescape_hex(r"g0 x1\x0a"), "g0 x1\n");
        assert_eq!(unescape_hex(r"\x7e"), "~");
        assert_eq!(unescape_hex("plain"), "plain");
    }

    #[test]
    fn timecode_lines_parse_into_prefix_and_remainder() {
        let caps = TIMECODE_RE
            .captures("N5 [[G1500]]g0 x10")
            .unwrap_or_else(|| panic!("timecode should match"));
        assert_eq!(&caps[1], "N5 ");
        assert_eq!(&caps[2], "G");
        assert_eq!(&caps[3], "1500");
        assert_eq!(&caps[4], "g0 x10");
    }

    #[test]
    fn timed_sends_epoch_is_relative_to_first_timecode() {
        let mut timed = TimedSends::default();
        // First timecode anchors the epoch: fires immediately.
        assert_eq!(timed.delay_for(5000), Duration::from_millis(0));
        // A later timecode waits out the difference.
        let delay = timed.delay_for(5100);
        assert!(delay <= Duration::from_millis(100));
    }

    #[test]
    fn unfired_slot_keeps_its_lines_fired_slot_hands_them_over() {
        let mut timed = TimedSends::default();
        let slot = Arc::new(SyncMutex::new(TimecodeSlot {
            lines: 3,
            fired: false,
        }));
        timed.current = Some(Arc::clone(&slot));
        assert_eq!(timed.carried_lines(), 0);
        slot.lock().fired = true;
        assert_eq!(timed.carried_lines(), 3);
        timed.note_line();
        assert_eq!(timed.carried_lines(), 4);
    }
}
