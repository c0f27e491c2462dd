
use super::channum::*;
use crate::error::*;

/// CHANNEL_DATA_HEADER_SIZE is the fixed-size prefix of a ChannelData message:
/// 2 bytes channel number, 2 bytes payload length.
pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// ChannelData represents the ChannelData message framing.
///
/// The ChannelData message is used to carry application data between the
/// client and the server. It consists of the channel number, the length of
/// the data and the data itself.
///
/// RFC 5766 Section 11.4
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ChannelData {
    pub data: Vec<u8>,
    pub number: ChannelNumber,
    pub raw: Vec<u8>,
}

impl ChannelData {
    /// Resets length, data and the raw buffer.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.data.clear();
    }

    /// Encodes the channel number, length and payload to `raw`.
    pub fn encode(&mut self) {
        self.raw.clear();
        self.raw
            .extend_from_slice(&self.number.0.to_be_bytes());
        self.raw
            .extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        self.raw.extend_from_slice(&self.data);
    }

    /// Decodes `raw` into the channel number and payload.
    pub fn decode(&mut self) -> Result<()> {
        let buf = &self.raw;
        if buf.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::ErrUnexpectedEof);
        }

        let number = ChannelNumber(u16::from_be_bytes([buf[0], buf[1]]));
        if !number.valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }

        let l = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if l != buf.len() - CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::ErrBadChannelDataLength);
        }

        self.number = number;
        self.data = buf[CHANNEL_DATA_HEADER_SIZE..].to_vec();

        Ok(())
    }

    /// `true` if `buf` looks like a ChannelData message: the leading two
    /// bytes fall in the channel number range and the length field matches
    /// the remaining payload exactly. STUN messages start with two zero bits
    /// and never match; anything else is garbage to the demultiplexer.
    pub fn is_channel_data(buf: &[u8]) -> bool {
        if buf.len() < CHANNEL_DATA_HEADER_SIZE {
            return false;
        }

        if !ChannelNumber(u16::from_be_bytes([buf[0], buf[1]])).valid() {
            return false;
        }

        let l = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        l == buf.len() - CHANNEL_DATA_HEADER_SIZE
    }
}
