//! Tunnel frame codec.
//!
//! Each frame has a 5-byte header followed by a command-specific payload:
//!
//! ```text
//! byte 0     command
//! bytes 1-2  slot index      (LE u16)
//! bytes 3-4  generation tag  (LE u16)
//! bytes 5..  payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proxy::TargetAddr;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Address type announced in a create notice. The relay only knows one.
const CREATE_ADDRESS_TYPE: u8 = 1;

/// Tunnel commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Flow data. From the relay: seq(4) + bytes. To the relay: bytes
    Data,
    /// New flow announcement. Payload: addr_type(1) + addr_len(1) + addr + port(2)
    Created,
    /// Flow aborted
    ClientClosed,
    /// Local side finished sending
    ClientFinished,
    /// Relay finished sending. Payload: final seq(4)
    ServerFinished,
    /// Relay closed the flow. Payload: final seq(4)
    ServerClosed,
    /// Flow-control report. Payload: count(2)
    Quota,
    /// Anything this client does not know about
    Unknown(u8),
}

impl Command {
    /// Wire value of the command.
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Data => 1,
            Command::Created => 2,
            Command::ClientClosed => 3,
            Command::ClientFinished => 4,
            Command::ServerFinished => 5,
            Command::ServerClosed => 6,
            Command::Quota => 7,
            Command::Unknown(v) => v,
        }
    }
}

impl From<u8> for Command {
    fn from(v: u8) -> Self {
        match v {
            1 => Command::Data,
            2 => Command::Created,
            3 => Command::ClientClosed,
            4 => Command::ClientFinished,
            5 => Command::ServerFinished,
            6 => Command::ServerClosed,
            7 => Command::Quota,
            other => Command::Unknown(other),
        }
    }
}

/// A tunnel frame addressed to one flow slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte
    pub command: Command,
    /// Flow slot index
    pub index: u16,
    /// Generation tag of the slot occupant
    pub generation: u16,
    /// Command-specific payload
    pub payload: Bytes,
}

impl Frame {
    fn new(command: Command, index: u16, generation: u16, payload: Bytes) -> Self {
        Self {
            command,
            index,
            generation,
            payload,
        }
    }

    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.command.as_u8());
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.generation);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame from a transport message.
    ///
    /// Unknown commands decode successfully; only a short header fails.
    pub fn decode(data: Bytes) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::invalid_frame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let command = Command::from(data[0]);
        let index = u16::from_le_bytes([data[1], data[2]]);
        let generation = u16::from_le_bytes([data[3], data[4]]);

        Ok(Self::new(
            command,
            index,
            generation,
            data.slice(FRAME_HEADER_SIZE..),
        ))
    }

    /// Split a data payload into its sequence number and bytes.
    pub fn sequenced(&self) -> Result<(u32, Bytes)> {
        let seq = self.leading_u32("data")?;
        Ok((seq, self.payload.slice(4..)))
    }

    /// Final sequence number carried by a server half-close or close.
    pub fn final_sequence(&self) -> Result<u32> {
        self.leading_u32("close")
    }

    /// Count carried by a quota report.
    pub fn quota_count(&self) -> Result<u16> {
        if self.payload.len() < 2 {
            return Err(Error::invalid_frame("quota payload too short"));
        }
        Ok(u16::from_le_bytes([self.payload[0], self.payload[1]]))
    }

    fn leading_u32(&self, what: &str) -> Result<u32> {
        if self.payload.len() < 4 {
            return Err(Error::invalid_frame(format!(
                "{} payload too short: {} bytes",
                what,
                self.payload.len()
            )));
        }
        Ok(u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Create a Data frame for the client direction: the chunk follows the
    /// header as is, with no sequence number.
    pub fn outbound_data(index: u16, generation: u16, data: &[u8]) -> Self {
        Self::new(Command::Data, index, generation, Bytes::copy_from_slice(data))
    }

    /// Create a sequenced Data frame, as sent by the relay.
    pub fn data(index: u16, generation: u16, seq: u32, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(4 + data.len());
        payload.put_u32_le(seq);
        payload.put_slice(data);
        Self::new(Command::Data, index, generation, payload.freeze())
    }

    /// Create a Created frame announcing the flow's destination.
    pub fn created(index: u16, generation: u16, target: &TargetAddr) -> Result<Self> {
        let host = target.host_bytes();
        let host_len = u8::try_from(host.len())
            .map_err(|_| Error::invalid_frame(format!("address too long: {} bytes", host.len())))?;

        let mut payload = BytesMut::with_capacity(2 + host.len() + 2);
        payload.put_u8(CREATE_ADDRESS_TYPE);
        payload.put_u8(host_len);
        payload.put_slice(&host);
        payload.put_u16_le(target.port());
        Ok(Self::new(Command::Created, index, generation, payload.freeze()))
    }

    /// Create a ClientClosed frame.
    pub fn client_closed(index: u16, generation: u16) -> Self {
        Self::new(Command::ClientClosed, index, generation, Bytes::new())
    }

    /// Create a ClientFinished frame.
    pub fn client_finished(index: u16, generation: u16) -> Self {
        Self::new(Command::ClientFinished, index, generation, Bytes::new())
    }

    /// Create a ServerFinished frame.
    pub fn server_finished(index: u16, generation: u16, last_seq: u32) -> Self {
        let payload = Bytes::copy_from_slice(&last_seq.to_le_bytes());
        Self::new(Command::ServerFinished, index, generation, payload)
    }

    /// Create a ServerClosed frame.
    pub fn server_closed(index: u16, generation: u16, last_seq: u32) -> Self {
        let payload = Bytes::copy_from_slice(&last_seq.to_le_bytes());
        Self::new(Command::ServerClosed, index, generation, payload)
    }

    /// Create a Quota frame.
    pub fn quota(index: u16, generation: u16, count: u16) -> Self {
        let payload = Bytes::copy_from_slice(&count.to_le_bytes());
        Self::new(Command::Quota, index, generation, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let encoded = Frame::quota(0x0102, 0x0304, 20).encode();
        assert_eq!(&encoded[..], &[7, 0x02, 0x01, 0x04, 0x03, 20, 0]);
    }

    #[test]
    fn test_outbound_data_is_raw() {
        let encoded = Frame::outbound_data(3, 9, b"hello").encode();
        assert_eq!(&encoded[..], &[1, 3, 0, 9, 0, b'h', b'e', b'l', b'l', b'o']);

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.command, Command::Data);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn test_data_frame() {
        let encoded = Frame::data(3, 9, 42, b"hello").encode();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.command, Command::Data);
        assert_eq!(decoded.index, 3);
        assert_eq!(decoded.generation, 9);

        let (seq, data) = decoded.sequenced().unwrap();
        assert_eq!(seq, 42);
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn test_created_domain() {
        let target = TargetAddr::Domain("example.com".into(), 443);
        let frame = Frame::created(1, 2, &target).unwrap();

        let mut expected = vec![1u8, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&443u16.to_le_bytes());
        assert_eq!(&frame.payload[..], &expected[..]);
    }

    #[test]
    fn test_created_ipv6_uses_raw_octets() {
        let target = TargetAddr::Ip("[::1]:8080".parse().unwrap());
        let frame = Frame::created(0, 1, &target).unwrap();

        assert_eq!(frame.payload[0], 1);
        assert_eq!(frame.payload[1], 16);
        assert_eq!(frame.payload.len(), 2 + 16 + 2);
        assert_eq!(&frame.payload[18..], &8080u16.to_le_bytes());
    }

    #[test]
    fn test_unknown_command_decodes() {
        let decoded = Frame::decode(Bytes::from_static(&[0x42, 1, 0, 1, 0, 9, 9])).unwrap();
        assert_eq!(decoded.command, Command::Unknown(0x42));
        assert_eq!(decoded.command.as_u8(), 0x42);
        assert_eq!(&decoded.payload[..], &[9, 9]);
    }

    #[test]
    fn test_short_frames() {
        assert!(Frame::decode(Bytes::from_static(&[1, 0, 0, 0])).is_err());

        let frame = Frame::decode(Bytes::from_static(&[1, 0, 0, 0, 0, 1, 2])).unwrap();
        assert!(frame.sequenced().is_err());
        assert!(frame.final_sequence().is_err());
    }

    #[test]
    fn test_close_frames_carry_final_sequence() {
        let frame = Frame::decode(Frame::server_closed(5, 6, 77).encode()).unwrap();
        assert_eq!(frame.command, Command::ServerClosed);
        assert_eq!(frame.final_sequence().unwrap(), 77);

        let frame = Frame::decode(Frame::server_finished(5, 6, 12).encode()).unwrap();
        assert_eq!(frame.command, Command::ServerFinished);
        assert_eq!(frame.final_sequence().unwrap(), 12);
    }
}
