//! Microcontroller packet framing.
//!
//! Every command is a fixed 8-byte packet:
//!
//! ```text
//! [cmd_id, code, p0, p1, p2, p3, p4, crc8]
//! ```
//!
//! and every response is 8 bytes as well:
//!
//! ```text
//! [cmd_id, status, p0, p1, p2, p3, p4, crc8]
//! ```
//!
//! `cmd_id` rolls over modulo 256. The trailing byte is CRC-8 (poly 0x07, init 0)
//! over the seven preceding bytes.

use crc::{Crc, CRC_8_SMBUS};
use thiserror::Error;

/// Length of a command packet in bytes
pub const COMMAND_LENGTH: usize = 8;
/// Length of a response packet in bytes
pub const RESPONSE_LENGTH: usize = 8;
/// Payload bytes carried by each packet
pub const PAYLOAD_LENGTH: usize = 5;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Compute the packet checksum.
pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Framing errors on the microcontroller link
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Trailing CRC byte does not match the packet contents
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    BadChecksum {
        /// CRC computed over the packet
        expected: u8,
        /// CRC carried by the packet
        actual: u8,
    },
    /// Command code not in the command set
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    /// Status byte not in the status set
    #[error("unknown execution status {0}")]
    UnknownStatus(u8),
}

/// Command codes understood by the fluidics microcontroller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    /// Reset the command queue
    Clear = 0,
    /// Home every rotary valve
    InitializeValves = 1,
    /// Move one rotary valve to a position
    SetRotaryValve = 2,
    /// Set disc pump drive power (0 stops the pump)
    SetDiscPumpPower = 3,
    /// Query controller status
    ReadStatus = 4,
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandCode::Clear),
            1 => Ok(CommandCode::InitializeValves),
            2 => Ok(CommandCode::SetRotaryValve),
            3 => Ok(CommandCode::SetDiscPumpPower),
            4 => Ok(CommandCode::ReadStatus),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Execution status reported in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionStatus {
    /// Command finished without error
    Completed = 0,
    /// Command accepted, still executing
    InProgress = 1,
    /// Command packet failed its checksum; resend
    ChecksumError = 2,
    /// Command code or payload rejected
    InvalidCommand = 3,
    /// Device fault while executing
    ExecutionError = 4,
}

impl TryFrom<u8> for ExecutionStatus {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExecutionStatus::Completed),
            1 => Ok(ExecutionStatus::InProgress),
            2 => Ok(ExecutionStatus::ChecksumError),
            3 => Ok(ExecutionStatus::InvalidCommand),
            4 => Ok(ExecutionStatus::ExecutionError),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

/// A command with its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Reset the command queue
    Clear,
    /// Home every rotary valve
    InitializeValves,
    /// Move valve `valve` to `position` (1-based)
    SetRotaryValve {
        /// Valve address
        valve: u8,
        /// Target position
        position: u8,
    },
    /// Set disc pump power (0-100)
    SetDiscPumpPower {
        /// Drive power in percent
        power: u8,
    },
    /// Query controller status
    ReadStatus,
}

impl Command {
    /// Command code for this command.
    pub fn code(&self) -> CommandCode {
        match self {
            Command::Clear => CommandCode::Clear,
            Command::InitializeValves => CommandCode::InitializeValves,
            Command::SetRotaryValve { .. } => CommandCode::SetRotaryValve,
            Command::SetDiscPumpPower { .. } => CommandCode::SetDiscPumpPower,
            Command::ReadStatus => CommandCode::ReadStatus,
        }
    }

    /// Short name used in logs, errors and fault injection.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Clear => "clear",
            Command::InitializeValves => "initialize_valves",
            Command::SetRotaryValve { .. } => "set_rotary_valve",
            Command::SetDiscPumpPower { .. } => "set_disc_pump_power",
            Command::ReadStatus => "read_status",
        }
    }

    fn payload(&self) -> [u8; PAYLOAD_LENGTH] {
        match *self {
            Command::SetRotaryValve { valve, position } => [valve, position, 0, 0, 0],
            Command::SetDiscPumpPower { power } => [power, 0, 0, 0, 0],
            Command::Clear | Command::InitializeValves | Command::ReadStatus => [0; PAYLOAD_LENGTH],
        }
    }

    /// Frame this command with the given id.
    pub fn encode(&self, command_id: u8) -> [u8; COMMAND_LENGTH] {
        let mut packet = [0u8; COMMAND_LENGTH];
        packet[0] = command_id;
        packet[1] = self.code() as u8;
        packet[2..2 + PAYLOAD_LENGTH].copy_from_slice(&self.payload());
        packet[COMMAND_LENGTH - 1] = crc8(&packet[..COMMAND_LENGTH - 1]);
        packet
    }

    /// Parse a command packet, returning its id and command.
    pub fn decode(packet: &[u8; COMMAND_LENGTH]) -> Result<(u8, Command), FrameError> {
        verify_checksum(packet)?;
        let payload = &packet[2..2 + PAYLOAD_LENGTH];
        let command = match CommandCode::try_from(packet[1])? {
            CommandCode::Clear => Command::Clear,
            CommandCode::InitializeValves => Command::InitializeValves,
            CommandCode::SetRotaryValve => Command::SetRotaryValve {
                valve: payload[0],
                position: payload[1],
            },
            CommandCode::SetDiscPumpPower => Command::SetDiscPumpPower { power: payload[0] },
            CommandCode::ReadStatus => Command::ReadStatus,
        };
        Ok((packet[0], command))
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetRotaryValve { valve, position } => {
                write!(f, "set_rotary_valve(valve={}, position={})", valve, position)
            }
            Command::SetDiscPumpPower { power } => write!(f, "set_disc_pump_power({})", power),
            other => f.write_str(other.name()),
        }
    }
}

/// Response packet from the microcontroller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Id of the command this response belongs to
    pub command_id: u8,
    /// Execution status
    pub status: ExecutionStatus,
    /// Status-dependent payload
    pub payload: [u8; PAYLOAD_LENGTH],
}

impl Response {
    /// Response with an empty payload.
    pub fn new(command_id: u8, status: ExecutionStatus) -> Self {
        Self {
            command_id,
            status,
            payload: [0; PAYLOAD_LENGTH],
        }
    }

    /// Frame this response.
    pub fn encode(&self) -> [u8; RESPONSE_LENGTH] {
        let mut packet = [0u8; RESPONSE_LENGTH];
        packet[0] = self.command_id;
        packet[1] = self.status as u8;
        packet[2..2 + PAYLOAD_LENGTH].copy_from_slice(&self.payload);
        packet[RESPONSE_LENGTH - 1] = crc8(&packet[..RESPONSE_LENGTH - 1]);
        packet
    }

    /// Parse a response packet.
    pub fn decode(packet: &[u8; RESPONSE_LENGTH]) -> Result<Self, FrameError> {
        verify_checksum(packet)?;
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload.copy_from_slice(&packet[2..2 + PAYLOAD_LENGTH]);
        Ok(Self {
            command_id: packet[0],
            status: ExecutionStatus::try_from(packet[1])?,
            payload,
        })
    }
}

fn verify_checksum(packet: &[u8; 8]) -> Result<(), FrameError> {
    let expected = crc8(&packet[..7]);
    let actual = packet[7];
    if expected != actual {
        return Err(FrameError::BadChecksum { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_check_value() {
        // CRC-8 (poly 0x07) check value
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn valve_command_layout() {
        let packet = Command::SetRotaryValve {
            valve: 1,
            position: 7,
        }
        .encode(42);
        assert_eq!(&packet[..7], &[42, 2, 1, 7, 0, 0, 0]);
        assert_eq!(packet[7], crc8(&packet[..7]));
    }

    #[test]
    fn decode_rejects_corrupted_packet() {
        let mut packet = Command::Clear.encode(3);
        packet[2] ^= 0xFF;
        assert!(matches!(
            Command::decode(&packet),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_code() {
        let mut packet = [9u8, 200, 0, 0, 0, 0, 0, 0];
        packet[7] = crc8(&packet[..7]);
        assert_eq!(
            Command::decode(&packet),
            Err(FrameError::UnknownCommand(200))
        );
    }

    #[test]
    fn response_status_is_parsed() {
        let packet = Response::new(17, ExecutionStatus::ChecksumError).encode();
        let response = Response::decode(&packet).unwrap();
        assert_eq!(response.command_id, 17);
        assert_eq!(response.status, ExecutionStatus::ChecksumError);
    }

    #[test]
    fn display_includes_arguments() {
        let command = Command::SetDiscPumpPower { power: 60 };
        assert_eq!(command.to_string(), "set_disc_pump_power(60)");
        assert_eq!(Command::Clear.to_string(), "clear");
    }
}
