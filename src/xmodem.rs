//! Receiver side of the XMODEM-CRC file-transfer protocol.
//!
//! The variant spoken here is the classic 128-byte-payload CRC flavour: the
//! receiver opens by sending `C`, the sender frames every packet as
//! `SOH seq !seq data[128] crc_hi crc_lo` with `seq` starting at 1 and
//! wrapping through 8-bit arithmetic, and the transfer ends with an `EOT`
//! that the receiver acknowledges.

use std::convert::TryFrom;

use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::io::{ByteOutcome, BytePort};
use crate::Error;

/// Payload bytes carried by one packet.
pub const PAYLOAD_SIZE: usize = 128;

/// Protocol control bytes.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Control {
    /// Start of a 128-byte packet
    Soh = 0x01,
    /// End of transmission
    Eot = 0x04,
    /// Packet accepted
    Ack = 0x06,
    /// Packet rejected, send it again
    Nak = 0x15,
    /// Abort the transfer
    Can = 0x18,
    /// Receiver-side announcement of CRC mode
    Crc = 0x43,
}

/// Session-level outcome of a receive call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    /// A new packet was accepted into the caller's buffer.
    Packet,
    /// The sender finished the transfer; the EOT has been acknowledged.
    Eot,
    /// The sender cancelled the transfer.
    Cancelled,
    /// The retry budget ran out or the sender misbehaved; a CAN was sent.
    Aborted,
    /// No sender showed up within the initial-poll window.
    InitialTimeout,
}

/// Per-frame outcome of the framing layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PacketStatus {
    Accepted,
    /// A valid frame carrying the previous sequence number again.
    Repeated,
    Eot,
    Can,
    PacketTimeout,
    DataTimeout,
    BadData,
    /// Sequence number matches neither the expected packet nor its
    /// predecessor.
    Fatal,
}

/// Retry and purge settings of the transfer session.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// How long the link must stay quiet for a purge to finish, in ms.
    pub purge_timeout_ms: u32,
    /// How many times a packet is re-requested before the session aborts.
    pub retry: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            purge_timeout_ms: 100,
            retry: 10,
        }
    }
}

/// XMODEM-CRC receiver over a raw byte port.
pub struct Receiver<P> {
    pub port: P,
    config: Config,
}

impl<P: BytePort> Receiver<P> {
    pub fn new(port: P, config: Config) -> Receiver<P> {
        Receiver { port, config }
    }

    /// Polls for the first packet of a transfer.
    ///
    /// Drains stale bytes off the link, announces CRC mode and waits up to
    /// `pkt_timeout_ms` for packet 1. Bad frames are NAKed up to the retry
    /// limit; a clean timeout before the first byte means no sender is
    /// there, which the caller may treat as permission to boot.
    pub fn recv_begin(
        &mut self,
        buf: &mut [u8],
        pkt_timeout_ms: u32,
        data_timeout_ms: u32,
    ) -> Result<Status, Error> {
        self.purge()?;
        self.send(Control::Crc)?;

        let mut retry = 0;

        loop {
            match self.recv_packet(buf, 1, pkt_timeout_ms, data_timeout_ms)? {
                PacketStatus::Accepted => return Ok(Status::Packet),
                PacketStatus::Can => return Ok(Status::Cancelled),
                PacketStatus::Eot => {
                    self.send(Control::Ack)?;
                    return Ok(Status::Eot);
                }
                PacketStatus::PacketTimeout => return Ok(Status::InitialTimeout),
                PacketStatus::BadData | PacketStatus::DataTimeout => {
                    if retry < self.config.retry {
                        retry += 1;
                        self.purge()?;
                        self.send(Control::Nak)?;
                        continue;
                    }

                    self.send(Control::Can)?;
                    return Ok(Status::Aborted);
                }
                // A retransmission of packet 0 before packet 1 ever arrived
                // makes no sense; treat it like a fatal sequence error.
                PacketStatus::Repeated | PacketStatus::Fatal => {
                    self.send(Control::Can)?;
                    return Ok(Status::Aborted);
                }
            }
        }
    }

    /// Acknowledges the previous packet and waits for the next one.
    pub fn recv_next(
        &mut self,
        buf: &mut [u8],
        expected_seq: u8,
        pkt_timeout_ms: u32,
        data_timeout_ms: u32,
    ) -> Result<Status, Error> {
        self.send(Control::Ack)?;

        let mut retry = 0;

        loop {
            match self.recv_packet(buf, expected_seq, pkt_timeout_ms, data_timeout_ms)? {
                PacketStatus::Accepted => return Ok(Status::Packet),
                PacketStatus::Eot => {
                    self.send(Control::Ack)?;
                    return Ok(Status::Eot);
                }
                PacketStatus::Can => return Ok(Status::Cancelled),
                PacketStatus::Repeated => {
                    // Our ACK got lost. The re-ACK covers the
                    // retransmission, and a sender that retransmits is
                    // alive, so the retry budget starts over.
                    retry = 0;
                    self.send(Control::Ack)?;
                }
                PacketStatus::PacketTimeout
                | PacketStatus::DataTimeout
                | PacketStatus::BadData => {
                    if retry < self.config.retry {
                        retry += 1;
                        self.purge()?;
                        self.send(Control::Nak)?;
                        continue;
                    }

                    self.send(Control::Can)?;
                    return Ok(Status::Aborted);
                }
                PacketStatus::Fatal => {
                    self.send(Control::Can)?;
                    return Ok(Status::Aborted);
                }
            }
        }
    }

    /// Tells the sender to stop; used when a received block fails
    /// validation above the transport.
    pub fn recv_cancel(&mut self) -> Result<(), Error> {
        self.send(Control::Can)
    }

    fn send(&mut self, control: Control) -> Result<(), Error> {
        self.port.send_byte(control.into())
    }

    /// Reads and discards bytes until the link has been quiet for the purge
    /// window.
    fn purge(&mut self) -> Result<(), Error> {
        while let ByteOutcome::Got(_) = self.port.recv_byte(self.config.purge_timeout_ms)? {}

        Ok(())
    }

    /// Receives one frame into `buf`, which must hold [`PAYLOAD_SIZE`]
    /// bytes.
    fn recv_packet(
        &mut self,
        buf: &mut [u8],
        expected_seq: u8,
        pkt_timeout_ms: u32,
        data_timeout_ms: u32,
    ) -> Result<PacketStatus, Error> {
        debug_assert_eq!(buf.len(), PAYLOAD_SIZE);

        // Frame type
        match self.port.recv_byte(pkt_timeout_ms)? {
            ByteOutcome::Timeout => return Ok(PacketStatus::PacketTimeout),
            ByteOutcome::Got(byte) => match Control::try_from(byte) {
                Ok(Control::Soh) => {}
                Ok(Control::Eot) => return Ok(PacketStatus::Eot),
                Ok(Control::Can) => return Ok(PacketStatus::Can),
                _ => return Ok(PacketStatus::BadData),
            },
        }

        // Sequence number. The predecessor is tolerated here and reported
        // as a retransmission once the rest of the frame checks out.
        let seq = match self.port.recv_byte(data_timeout_ms)? {
            ByteOutcome::Timeout => return Ok(PacketStatus::DataTimeout),
            ByteOutcome::Got(byte)
                if byte == expected_seq || byte == expected_seq.wrapping_sub(1) =>
            {
                byte
            }
            ByteOutcome::Got(_) => return Ok(PacketStatus::Fatal),
        };

        // Sequence complement
        match self.port.recv_byte(data_timeout_ms)? {
            ByteOutcome::Timeout => return Ok(PacketStatus::DataTimeout),
            ByteOutcome::Got(byte) if byte == !seq => {}
            ByteOutcome::Got(_) => return Ok(PacketStatus::BadData),
        }

        // Payload
        for slot in buf.iter_mut() {
            match self.port.recv_byte(data_timeout_ms)? {
                ByteOutcome::Timeout => return Ok(PacketStatus::DataTimeout),
                ByteOutcome::Got(byte) => *slot = byte,
            }
        }

        // CRC, high byte first
        let mut crc = 0u16;
        for _ in 0..2 {
            match self.port.recv_byte(data_timeout_ms)? {
                ByteOutcome::Timeout => return Ok(PacketStatus::DataTimeout),
                ByteOutcome::Got(byte) => crc = crc << 8 | u16::from(byte),
            }
        }

        if crc16(buf) != crc {
            return Ok(PacketStatus::BadData);
        }

        if seq == expected_seq {
            Ok(PacketStatus::Accepted)
        } else {
            debug!("packet {} received again", seq);
            Ok(PacketStatus::Repeated)
        }
    }
}

/// Calculates the CRC-16/XMODEM checksum for the given slice of `bytes`
///
/// The CRC is implemented with the polynomial 0x1021 and an initial value
/// of 0; it travels high byte first on the wire.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for byte in bytes {
        crc ^= u16::from(*byte) << 8;

        for _ in 0..8 {
            if crc & 0x8000 > 0 {
                crc = crc << 1 ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
