//! Driver events.
//!
//! Every consequence of decoding, pacing and lifecycle is published as one
//! closed [`Event`] enum on a `tokio::sync::broadcast` channel, so any
//! number of subscribers (streaming sessions, request correlators, UIs)
//! observe the same ordered stream without the driver knowing about them.

use serde_json::Value;

use crate::error::TinygError;
use crate::gcode::AnnotatedLine;
use crate::protocol::{Footer, StatusReport};

/// Which physical channel a raw write went out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChannel {
    /// The command port (always present).
    Control,
    /// The optional high-volume data port.
    Data,
}

/// Everything the driver can tell its subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection finished opening (ports up, setup sequence done).
    Open,
    /// The connection closed; anything still pending has failed.
    Close,
    /// A complete raw line arrived from the device.
    Data(String),
    /// A decode, device, transport or alarm error.
    Error(TinygError),
    /// A response envelope arrived: inner object plus footer.
    Response {
        body: Value,
        footer: Option<Footer>,
    },
    /// The device posted an `er` exception report.
    ErrorReport(Value),
    /// A periodic status report arrived.
    StatusChanged(StatusReport),
    /// The device echoed a G-code line back.
    GcodeReceived(String),
    /// The device reported how many bytes its receive buffer can accept.
    RxReceived(i64),
    /// A drain pass finished; carries the last G-code line number sent.
    SentLine(Option<i64>),
    /// A queued G-code line was written and annotated.
    SentGcode(AnnotatedLine),
    /// Raw bytes were written to a channel (queued or out-of-band).
    SentRaw { data: String, channel: PortChannel },
    /// The pending queue has room for this many more lines.
    NeedLines(usize),
    /// End-of-input was reached and the pending queue fully drained.
    DoneSending,
}
