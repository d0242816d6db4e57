//! Host-side driver for the TinyG CNC motion controller.
//!
//! The TinyG talks relaxed JSON over a serial line: commands go down as
//! single-line records or bare G-code, and the controller answers with
//! response envelopes, status reports, and exception reports. This crate
//! handles the plumbing between "a serial port" and "a machine you can
//! program":
//!
//! - [`Tinyg`] opens one or two serial channels, decodes the device's
//!   line-oriented reports, and broadcasts every consequence as an
//!   [`Event`];
//! - writes are flow controlled so the controller's small line buffer
//!   never overflows, with either buffer-report (`rx`) accounting on a
//!   single channel or wide-open credit plus hardware flow control when a
//!   dedicated data port exists;
//! - [`Tinyg::set`] and [`Tinyg::get`] give request/response configuration
//!   access on top of the shared report stream;
//! - [`Tinyg::send_file`] streams a whole G-code program with demand
//!   driven reads and waits for the machine to actually finish moving.
//!
//! ```no_run
//! use tinyg_driver::{OpenOptions, Tinyg};
//!
//! # async fn run() -> tinyg_driver::Result<()> {
//! let tinyg = Tinyg::new();
//! tinyg.open("/dev/ttyUSB0", OpenOptions::default()).await?;
//! tinyg.set("xvm", serde_json::json!(12000)).await?;
//! tinyg.send_file("part.gcode").await?;
//! tinyg.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod driver;
pub mod error;
pub mod event;
pub mod flow;
pub mod framing;
pub mod gcode;
pub mod protocol;
pub mod request;
pub mod serial;
pub mod status;
pub mod stream;

pub use driver::{OpenOptions, Tinyg};
pub use error::{Result, TinygError};
pub use event::{Event, PortChannel};
pub use gcode::{strip_gcode, AnnotatedLine, GcodeCommand};
pub use protocol::{Footer, MachineState, StatusReport};
pub use serial::{DynSerial, SerialPortIO};
