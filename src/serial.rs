//! Host-side serial link, for running the bootloader core against a real
//! sender.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPortSettings, StopBits};

use crate::io::{ByteOutcome, BytePort};
use crate::Error;

/// The serial settings the wire protocol is specified for: 8N1, no flow
/// control.
pub fn port_settings(baud_rate: u32) -> SerialPortSettings {
    SerialPortSettings {
        baud_rate,
        data_bits: DataBits::Eight,
        flow_control: FlowControl::None,
        parity: Parity::None,
        stop_bits: StopBits::One,
        timeout: Duration::from_millis(1000),
    }
}

/// A [`BytePort`] over a host serial port.
pub struct HostSerialPort {
    port: Box<dyn serialport::SerialPort>,
    timeout_ms: u32,
}

impl HostSerialPort {
    /// Opens the given `port` and configures it with the settings the wire
    /// protocol expects.
    pub fn open<T: AsRef<OsStr> + ?Sized>(
        port: &T,
        baud_rate: u32,
    ) -> Result<HostSerialPort, Error> {
        debug!("Opening serial port {:?}", port.as_ref());

        let settings = port_settings(baud_rate);

        debug!("Setting baud rate to {}", settings.baud_rate);
        let port = serialport::open_with_settings(port, &settings)?;

        Ok(HostSerialPort {
            port,
            timeout_ms: 1000,
        })
    }
}

impl BytePort for HostSerialPort {
    fn recv_byte(&mut self, timeout_ms: u32) -> Result<ByteOutcome, Error> {
        if timeout_ms != self.timeout_ms {
            self.port
                .set_timeout(Duration::from_millis(u64::from(timeout_ms)))?;
            self.timeout_ms = timeout_ms;
        }

        let mut buf = [0u8; 1];

        match self.port.read_exact(&mut buf) {
            Ok(()) => Ok(ByteOutcome::Got(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(ByteOutcome::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.port.write_all(&[byte])?;

        Ok(())
    }
}
