//! Binary framing spoken with the charging stations.
//!
//! Every frame is `u16 length | u8 type | u32 message id | payload`, all
//! big-endian, where `length` counts the bytes after the length field.
//! A frame is either decoded completely or rejected; there is no partial
//! result.

use fleet_core::{PilotVoltage, ProximityPilotAmps, Telemetry};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 4096;
const HEADER_LEN: usize = 5;
/// Largest firmware chunk that still fits a frame.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_FRAME_LEN - HEADER_LEN - 10;
const MAX_CLIENT_ID_LEN: usize = 64;

const HELLO: u8 = 0x01;
const DATA: u8 = 0x02;
const ACK: u8 = 0x03;
const SET_CURRENT: u8 = 0x81;
const FIRMWARE_CHUNK: u8 = 0x82;
const DISABLE: u8 = 0x83;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Frame length {length} is outside 5..=4096")]
    InvalidLength { length: usize },
    #[error("Unknown frame type {frame_type:#04x}")]
    UnknownFrameType { frame_type: u8 },
    #[error("Frame {frame_type:#04x} is truncated")]
    Truncated { frame_type: u8 },
    #[error("Frame {frame_type:#04x} has {extra} trailing bytes")]
    TrailingBytes { frame_type: u8, extra: usize },
    #[error("Unknown pilot voltage code {code}")]
    InvalidPilotVoltage { code: u8 },
    #[error("Unknown disable reason {code}")]
    InvalidDisableReason { code: u8 },
    #[error("Field {field} is not valid UTF-8")]
    InvalidText { field: &'static str },
    #[error("Client id must be 1..=64 bytes, got {length}")]
    InvalidClientId { length: usize },
    #[error("Expected a {expected} frame")]
    UnexpectedFrame { expected: &'static str },
}

/// Station to controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Hello {
        client_id: String,
        firmware_version: String,
    },
    Data(Telemetry),
    Ack {
        message_id: u32,
        status: AckStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    Rejected(u8),
}

/// Controller to station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    SetCurrent {
        amps: u8,
    },
    FirmwareChunk {
        sequence: u16,
        total: u16,
        payload: Vec<u8>,
    },
    Disable {
        reason: DisableReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    PilotFault,
    Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    pub message_id: u32,
    pub body: T,
}

/// Checksum carried by firmware chunks: the wrapping sum of all bytes.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// Read the next frame body (everything after the length field).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let length = match reader.read_u16().await {
        Ok(length) => usize::from(length),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed);
        }
        Err(e) => return Err(e.into()),
    };
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&length) {
        return Err(ProtocolError::InvalidLength { length });
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub fn decode_inbound(body: &[u8]) -> Result<Frame<Inbound>, ProtocolError> {
    let mut payload = Payload::new(body)?;
    let inbound = match payload.frame_type {
        HELLO => {
            let client_id = payload.text("clientId")?;
            if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
                return Err(ProtocolError::InvalidClientId {
                    length: client_id.len(),
                });
            }
            let firmware_version = payload.text("firmwareVersion")?;
            Inbound::Hello {
                client_id,
                firmware_version,
            }
        }
        DATA => Inbound::Data(decode_telemetry(&mut payload)?),
        ACK => {
            let message_id = payload.u32()?;
            let status = match payload.u8()? {
                0 => AckStatus::Accepted,
                code => AckStatus::Rejected(code),
            };
            Inbound::Ack { message_id, status }
        }
        frame_type => return Err(ProtocolError::UnknownFrameType { frame_type }),
    };
    payload.finish()?;
    Ok(Frame {
        message_id: payload.message_id,
        body: inbound,
    })
}

fn decode_telemetry(payload: &mut Payload<'_>) -> Result<Telemetry, ProtocolError> {
    let flags = payload.u8()?;
    let duty_cycle = payload.u32()?;
    let pilot_voltage = match payload.u8()? {
        0 => PilotVoltage::Volt12,
        1 => PilotVoltage::Volt9,
        2 => PilotVoltage::Volt6,
        3 => PilotVoltage::Volt3,
        4 => PilotVoltage::Fault,
        code => return Err(ProtocolError::InvalidPilotVoltage { code }),
    };
    let proximity_pilot_amps = match payload.u8()? {
        0 => ProximityPilotAmps::Amp13,
        1 => ProximityPilotAmps::Amp20,
        2 => ProximityPilotAmps::Amp32,
        _ => ProximityPilotAmps::Unknown,
    };
    let phase_millivolts = [payload.u32()?, payload.u32()?, payload.u32()?];
    let phase_milliamps = [payload.u32()?, payload.u32()?, payload.u32()?];
    let signal_strength_dbm = payload.i8()?;
    let health_counter = payload.u32()?;
    let count = payload.u8()?;
    let diagnostics = (0..count)
        .map(|_| payload.text("diagnostics"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Telemetry {
        charge_active: flags & 0x01 != 0,
        duty_cycle,
        pilot_voltage,
        proximity_pilot_amps,
        phase_millivolts,
        phase_milliamps,
        signal_strength_dbm,
        health_counter,
        diagnostics,
    })
}

pub fn encode_outbound(frame: &Frame<Outbound>) -> Vec<u8> {
    let mut out = FrameWriter::default();
    match &frame.body {
        Outbound::SetCurrent { amps } => {
            out.start(SET_CURRENT, frame.message_id);
            out.u8(*amps);
        }
        Outbound::FirmwareChunk {
            sequence,
            total,
            payload,
        } => {
            out.start(FIRMWARE_CHUNK, frame.message_id);
            out.u16(*sequence);
            out.u16(*total);
            out.u16(payload.len() as u16);
            out.bytes(payload);
            out.u32(checksum(payload));
        }
        Outbound::Disable { reason } => {
            out.start(DISABLE, frame.message_id);
            out.u8(match reason {
                DisableReason::PilotFault => 1,
                DisableReason::Operator => 2,
            });
        }
    }
    out.finish()
}

/// Station side of [`encode_outbound`].
pub fn decode_outbound(body: &[u8]) -> Result<Frame<Outbound>, ProtocolError> {
    let mut payload = Payload::new(body)?;
    let outbound = match payload.frame_type {
        SET_CURRENT => Outbound::SetCurrent {
            amps: payload.u8()?,
        },
        FIRMWARE_CHUNK => {
            let sequence = payload.u16()?;
            let total = payload.u16()?;
            let length = usize::from(payload.u16()?);
            let bytes = payload.bytes(length)?.to_vec();
            let expected = payload.u32()?;
            if expected != checksum(&bytes) {
                return Err(ProtocolError::UnexpectedFrame {
                    expected: "firmware chunk with a matching checksum",
                });
            }
            Outbound::FirmwareChunk {
                sequence,
                total,
                payload: bytes,
            }
        }
        DISABLE => Outbound::Disable {
            reason: match payload.u8()? {
                1 => DisableReason::PilotFault,
                2 => DisableReason::Operator,
                code => return Err(ProtocolError::InvalidDisableReason { code }),
            },
        },
        frame_type => return Err(ProtocolError::UnknownFrameType { frame_type }),
    };
    payload.finish()?;
    Ok(Frame {
        message_id: payload.message_id,
        body: outbound,
    })
}

/// Station side of [`decode_inbound`].
pub fn encode_inbound(frame: &Frame<Inbound>) -> Vec<u8> {
    let mut out = FrameWriter::default();
    match &frame.body {
        Inbound::Hello {
            client_id,
            firmware_version,
        } => {
            out.start(HELLO, frame.message_id);
            out.text(client_id);
            out.text(firmware_version);
        }
        Inbound::Data(telemetry) => {
            out.start(DATA, frame.message_id);
            out.u8(u8::from(telemetry.charge_active));
            out.u32(telemetry.duty_cycle);
            out.u8(match telemetry.pilot_voltage {
                PilotVoltage::Volt12 => 0,
                PilotVoltage::Volt9 => 1,
                PilotVoltage::Volt6 => 2,
                PilotVoltage::Volt3 => 3,
                PilotVoltage::Fault => 4,
            });
            out.u8(match telemetry.proximity_pilot_amps {
                ProximityPilotAmps::Amp13 => 0,
                ProximityPilotAmps::Amp20 => 1,
                ProximityPilotAmps::Amp32 => 2,
                ProximityPilotAmps::Unknown => 0xff,
            });
            for value in telemetry
                .phase_millivolts
                .iter()
                .chain(telemetry.phase_milliamps.iter())
            {
                out.u32(*value);
            }
            out.u8(telemetry.signal_strength_dbm as u8);
            out.u32(telemetry.health_counter);
            let diagnostics = &telemetry.diagnostics[..telemetry.diagnostics.len().min(255)];
            out.u8(diagnostics.len() as u8);
            for line in diagnostics {
                out.text(line);
            }
        }
        Inbound::Ack { message_id, status } => {
            out.start(ACK, frame.message_id);
            out.u32(*message_id);
            out.u8(match status {
                AckStatus::Accepted => 0,
                AckStatus::Rejected(code) => *code,
            });
        }
    }
    out.finish()
}

/// Cursor over one frame body.
struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
    frame_type: u8,
    message_id: u32,
}

impl<'a> Payload<'a> {
    fn new(body: &'a [u8]) -> Result<Self, ProtocolError> {
        if body.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidLength { length: body.len() });
        }
        Ok(Payload {
            buf: body,
            pos: HEADER_LEN,
            frame_type: body[0],
            message_id: u32::from_be_bytes([body[1], body[2], body[3], body[4]]),
        })
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated {
                frame_type: self.frame_type,
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn text(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let length = usize::from(self.u8()?);
        let bytes = self.bytes(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidText { field })
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::TrailingBytes {
                frame_type: self.frame_type,
                extra: self.buf.len() - self.pos,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn start(&mut self, frame_type: u8, message_id: u32) {
        // Length placeholder, patched in finish()
        self.buf.extend_from_slice(&[0, 0]);
        self.u8(frame_type);
        self.u32(message_id);
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    fn text(&mut self, value: &str) {
        let mut end = value.len().min(255);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.u8(end as u8);
        self.bytes(&value.as_bytes()[..end]);
    }

    fn finish(mut self) -> Vec<u8> {
        let length = (self.buf.len() - 2) as u16;
        self.buf[..2].copy_from_slice(&length.to_be_bytes());
        self.buf
    }
}
