//! Structured-record decoding for the TinyG wire protocol.
//!
//! Protocol overview:
//! - Lines are delimited by any run of CR/LF bytes (see [`crate::framing`]).
//! - A line beginning with `{` is a structured record in relaxed JSON:
//!   unquoted keys, trailing commas and comments are all accepted, so the
//!   parse goes through `json5` into a `serde_json::Value`.
//! - Response envelope: `{r: {...}, f: [category, code, byteCount]}`. Due to
//!   a firmware quirk the footer may instead appear nested as `r.f`.
//! - Reports are dispatched by field presence on the (possibly unwrapped)
//!   object: `er` error report, `sr` status report, `gc` G-code echo, `rx`
//!   buffer-availability count.
//!
//! A parse failure discards the line and produces a single
//! [`TinygError::Decode`]; no partial interpretation is attempted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TinygError};

/// Footer codes with a dedicated error classification.
const FOOTER_OK: i64 = 0;
const FOOTER_SYNTAX_ERROR: i64 = 108;
const FOOTER_INTERNAL_ERROR: i64 = 20;
const FOOTER_MOVE_TOO_SHORT: i64 = 202;

/// Trailing `[category, code, byteCount]` triplet of a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    pub category: i64,
    pub code: i64,
    pub bytes_read: i64,
}

impl Footer {
    /// Extract a footer from the `f` value of a record, if well-formed.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        Some(Self {
            category: items.first()?.as_i64()?,
            code: items.get(1)?.as_i64()?,
            bytes_read: items.get(2)?.as_i64()?,
        })
    }
}

/// Machine run states reported in the `stat` field of a status report.
///
/// Codes follow the TinyG status-report enumeration. `Alarm` is terminal
/// for the current operation; `Stop`/`End` signal program completion to a
/// streaming session; `Hold`/`Run` drive the feedhold flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Initializing,
    Ready,
    Alarm,
    Stop,
    End,
    Run,
    Hold,
    Probe,
    Cycle,
    Homing,
    Other(i64),
}

impl MachineState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MachineState::Initializing,
            1 => MachineState::Ready,
            2 => MachineState::Alarm,
            3 => MachineState::Stop,
            4 => MachineState::End,
            5 => MachineState::Run,
            6 => MachineState::Hold,
            7 => MachineState::Probe,
            8 => MachineState::Cycle,
            9 => MachineState::Homing,
            other => MachineState::Other(other),
        }
    }
}

/// Snapshot parsed from a periodic `{sr: {...}}` report.
///
/// Only the fields the driver acts on are typed; everything else the device
/// includes (velocity, units, coordinate system, ...) is kept in `extra` so
/// subscribers still see it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<i64>,
    /// Last line number the controller executed; monotonically
    /// non-decreasing while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posx: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posa: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vel: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StatusReport {
    /// Typed view of the `stat` code, when the report carries one.
    pub fn machine_state(&self) -> Option<MachineState> {
        self.stat.map(MachineState::from_code)
    }
}

/// One decoded consequence of a structured record.
///
/// A single record can produce several of these: a response envelope with a
/// non-zero footer yields an error event and a response event, and any `rx`
/// field is dispatched independently of the rest.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Device-reported execution error classified from the footer.
    Error(TinygError),
    /// Response envelope: the inner `r` object plus its footer.
    Response {
        body: Value,
        footer: Option<Footer>,
    },
    /// `er` exception report.
    ErrorReport(Value),
    /// `sr` status report.
    StatusChanged(StatusReport),
    /// `gc` G-code echo.
    GcodeReceived(String),
    /// `rx` buffer-availability report (bytes the device can accept).
    RxReceived(i64),
}

/// Decode one `{`-prefixed line into its wire events.
///
/// Errors only on a failed relaxed-JSON parse; a record that parses but
/// carries none of the known fields simply yields no events.
pub fn decode_record(line: &str) -> Result<Vec<WireEvent>> {
    let record: Value = json5::from_str(line).map_err(|err| TinygError::Decode {
        line: line.to_string(),
        reason: err.to_string(),
    })?;

    let mut events = Vec::new();
    let mut body = record;

    if let Some(inner) = body.get("r").cloned() {
        // The footer belongs at the top level, but some firmware revisions
        // nest it under r.
        let footer = body
            .get("f")
            .and_then(Footer::from_value)
            .or_else(|| inner.get("f").and_then(Footer::from_value));

        if let Some(footer) = footer {
            if footer.code != FOOTER_OK {
                events.push(WireEvent::Error(classify_footer(&footer, &inner)));
            }
        }

        events.push(WireEvent::Response {
            body: inner.clone(),
            footer,
        });

        body = inner;
    }

    if let Some(er) = body.get("er") {
        events.push(WireEvent::ErrorReport(er.clone()));
    } else if let Some(sr) = body.get("sr") {
        match serde_json::from_value::<StatusReport>(sr.clone()) {
            Ok(report) => events.push(WireEvent::StatusChanged(report)),
            Err(err) => events.push(WireEvent::Error(TinygError::Decode {
                line: line.to_string(),
                reason: format!("malformed status report: {err}"),
            })),
        }
    } else if let Some(gc) = body.get("gc") {
        let echoed = gc
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| gc.to_string());
        events.push(WireEvent::GcodeReceived(echoed));
    }

    // rx reports ride alongside the other fields.
    if let Some(rx) = body.get("rx").and_then(Value::as_i64) {
        events.push(WireEvent::RxReceived(rx));
    }

    Ok(events)
}

fn classify_footer(footer: &Footer, response: &Value) -> TinygError {
    match footer.code {
        FOOTER_SYNTAX_ERROR => TinygError::DeviceSyntax {
            response: response.to_string(),
            bytes_read: footer.bytes_read,
        },
        FOOTER_INTERNAL_ERROR => TinygError::DeviceInternal {
            response: response.to_string(),
            bytes_read: footer.bytes_read,
        },
        FOOTER_MOVE_TOO_SHORT => TinygError::DeviceMoveTooShort {
            line: response.get("n").and_then(Value::as_i64),
        },
        code => TinygError::Device {
            code,
            response: response.to_string(),
            bytes_read: footer.bytes_read,
        },
    }
}
