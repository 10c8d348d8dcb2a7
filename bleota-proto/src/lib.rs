//! BLE OTA wire protocol - message types and framing

pub mod ble;

// Message tags
pub const TAG_START: u8 = 0x01;
pub const TAG_END: u8 = 0x02;
pub const TAG_START_ACK: u8 = 0x81;
pub const TAG_END_ACK: u8 = 0x82;

// Ack status codes
pub const STATUS_ACCEPT: u8 = 0x00;
pub const STATUS_REFUSE: u8 = 0x01;

/// Command written by the controller to the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    End,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Start => f.write_str("start"),
            Command::End => f.write_str("end"),
        }
    }
}

/// Device verdict on a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    Accept,
    Refuse,
}

impl AckStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            AckStatus::Accept => STATUS_ACCEPT,
            AckStatus::Refuse => STATUS_REFUSE,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            STATUS_ACCEPT => Ok(AckStatus::Accept),
            STATUS_REFUSE => Ok(AckStatus::Refuse),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// Every message that travels over the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Start,
    End,
    StartAck(AckStatus),
    EndAck(AckStatus),
}

impl Message {
    pub fn ack(command: Command, status: AckStatus) -> Self {
        match command {
            Command::Start => Message::StartAck(status),
            Command::End => Message::EndAck(status),
        }
    }

    /// The command this message carries or acknowledges
    pub fn command(&self) -> Command {
        match self {
            Message::Start | Message::StartAck(_) => Command::Start,
            Message::End | Message::EndAck(_) => Command::End,
        }
    }

    /// Ack status, or `None` for a command
    pub fn status(&self) -> Option<AckStatus> {
        match self {
            Message::StartAck(status) | Message::EndAck(status) => Some(*status),
            Message::Start | Message::End => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::Start => vec![TAG_START],
            Message::End => vec![TAG_END],
            Message::StartAck(status) => vec![TAG_START_ACK, status.to_byte()],
            Message::EndAck(status) => vec![TAG_END_ACK, status.to_byte()],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        match data {
            [] => Err(DecodeError::Malformed("empty message".to_string())),
            [TAG_START] => Ok(Message::Start),
            [TAG_END] => Ok(Message::End),
            [TAG_START_ACK, status] => Ok(Message::StartAck(AckStatus::from_byte(*status)?)),
            [TAG_END_ACK, status] => Ok(Message::EndAck(AckStatus::from_byte(*status)?)),
            [tag @ (TAG_START | TAG_END | TAG_START_ACK | TAG_END_ACK), ..] => {
                Err(DecodeError::Malformed(format!(
                    "tag 0x{tag:02x} with unexpected length {}",
                    data.len()
                )))
            }
            [tag, ..] => Err(DecodeError::Malformed(format!("unknown tag 0x{tag:02x}"))),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Start => f.write_str("START"),
            Message::End => f.write_str("END"),
            Message::StartAck(status) => write!(f, "START_ACK({status:?})"),
            Message::EndAck(status) => write!(f, "END_ACK({status:?})"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown ack status 0x{0:02x}")]
    UnknownStatus(u8),
}

/// Byte-level framing of commands, acks and firmware chunks
///
/// The framing is dictated by the device firmware, so controllers take it as
/// a parameter. Implementations must be stateless and must never truncate or
/// pad the chunk bytes handed to [`FrameCodec::encode_data_chunk`].
pub trait FrameCodec: Send + Sync {
    /// Framing bytes added to every data chunk
    fn overhead(&self) -> usize;

    fn encode_start_command(&self) -> Vec<u8>;

    fn encode_end_command(&self) -> Vec<u8>;

    fn encode_data_chunk(&self, chunk: &[u8]) -> Vec<u8>;

    fn decode(&self, data: &[u8]) -> Result<Message, DecodeError>;
}

/// One tag byte per command, tag + status for acks, chunks passed through raw
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedCodec;

impl FrameCodec for TaggedCodec {
    fn overhead(&self) -> usize {
        0
    }

    fn encode_start_command(&self) -> Vec<u8> {
        Message::Start.to_bytes()
    }

    fn encode_end_command(&self) -> Vec<u8> {
        Message::End.to_bytes()
    }

    fn encode_data_chunk(&self, chunk: &[u8]) -> Vec<u8> {
        chunk.to_vec()
    }

    fn decode(&self, data: &[u8]) -> Result<Message, DecodeError> {
        Message::from_bytes(data)
    }
}
