//! Serial transport helpers shared by the device drivers.
//!
//! Drivers are written against [`DynSerial`], so the same code runs over a
//! `tokio_serial::SerialStream` on real hardware and over `tokio::io::duplex`
//! in tests. Opening ports and resolving them by USB serial number needs the
//! `serial` feature.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

#[cfg(feature = "serial")]
use crate::error::{AppResult, FluidicsError};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Async serial port I/O.
///
/// Implemented for everything that is `AsyncRead + AsyncWrite + Unpin + Send`,
/// including `tokio_serial::SerialStream` and `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial port with buffered reading for line-oriented ASCII protocols.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a port for line-oriented access.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Read and discard whatever is pending on `port` for up to `timeout_ms`.
///
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

/// Open a serial port (8N1, no flow control) without blocking the runtime.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                FluidicsError::hardware(
                    device_name_owned.clone(),
                    format!("Failed to open serial port {}: {}", port_path_owned, e),
                )
            })
    })
    .await
    .map_err(|e| FluidicsError::EngineTask(format!("serial open task failed: {}", e)))?
}

/// Find the port whose USB serial number equals `serial_number`.
#[cfg(feature = "serial")]
pub fn find_port_by_serial_number(serial_number: &str, device_name: &str) -> AppResult<String> {
    let ports = serialport::available_ports().map_err(|e| {
        FluidicsError::hardware(device_name, format!("Cannot enumerate serial ports: {}", e))
    })?;

    ports
        .into_iter()
        .find(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                usb.serial_number.as_deref() == Some(serial_number)
            }
            _ => false,
        })
        .map(|port| port.port_name)
        .ok_or_else(|| {
            FluidicsError::hardware(
                device_name,
                format!("No serial port with USB serial number '{}'", serial_number),
            )
        })
}

/// Resolve a port by USB serial number and open it.
#[cfg(feature = "serial")]
pub async fn open_by_serial_number(
    serial_number: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<DynSerial> {
    let path = find_port_by_serial_number(serial_number, device_name)?;
    tracing::info!(device = device_name, port = %path, serial_number, "Opening serial port");
    let stream = open_serial_async(&path, baud_rate, device_name).await?;
    Ok(Box::new(stream))
}
