//! Serial port plumbing shared by every instrument link.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite
//! - [`DynSerial`]: type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port with spawn_blocking (requires the `serial` feature)
//! - [`drain_serial_buffer`]: discard stale bytes, e.g. a streaming balance's backlog
//!
//! Tests substitute a `tokio::io::duplex` stream for the port; anything that
//! implements the async I/O traits can stand in for hardware.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream` (real hardware) and
/// `tokio::io::DuplexStream` (fake firmware in tests).
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. All workcell
/// instruments (pump board, gantry and fluid sketches, balance, thermal
/// regulator) use this framing.
///
/// # Errors
///
/// Returns [`ElyteError::Hardware`](crate::error::ElyteError::Hardware) if the
/// port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> crate::error::ElyteResult<DynSerial> {
    use crate::error::ElyteError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device = device_name.to_string();

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| format!("failed to open serial port {}: {}", port_path_owned, e))
    })
    .await
    .map_err(|e| ElyteError::hardware(&device, format!("serial open task failed: {}", e)))?;

    match opened {
        Ok(stream) => Ok(Box::new(stream)),
        Err(message) => Err(ElyteError::hardware(device, message)),
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards bytes until nothing arrives within `timeout_ms`.
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_discards_backlog() {
        let (mut balance, mut host) = tokio::io::duplex(64);

        balance.write_all(b"  12.01 g\r\n  12.02 g\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut host, 50).await;
        assert_eq!(discarded, 22);

        let mut buf = [0u8; 1];
        let pending =
            tokio::time::timeout(Duration::from_millis(10), host.read(&mut buf)).await;
        assert!(pending.is_err(), "backlog should be empty after drain");
    }

    #[tokio::test]
    async fn test_drain_on_quiet_port_returns_zero() {
        let (_balance, mut host) = tokio::io::duplex(64);
        assert_eq!(drain_serial_buffer(&mut host, 20).await, 0);
    }
}
