//! Serial-port plumbing.
//!
//! The driver never names a concrete port type past this module: anything
//! `AsyncRead + AsyncWrite + Unpin + Send` is a usable channel, which keeps
//! real hardware (`tokio_serial::SerialStream`) and test doubles
//! (`tokio::io::duplex`) interchangeable behind [`DynSerial`].

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;

use crate::error::{Result, TinygError};

/// Trait alias for async serial port I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial channel.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a TinyG serial port asynchronously.
///
/// Opening goes through `spawn_blocking` so port initialization cannot
/// stall the runtime. Settings are the controller's: 8N1 with RTS/CTS
/// hardware flow control.
pub async fn open_serial_async(port_path: &str, baud_rate: u32) -> Result<DynSerial> {
    let path = port_path.to_string();

    let port = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .open_native_async()
            .map_err(|err| TinygError::Transport(format!("failed to open '{path}': {err}")))
    })
    .await
    .map_err(|err| TinygError::Transport(format!("port open task failed: {err}")))??;

    Ok(Box::new(port))
}
