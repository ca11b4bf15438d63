use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

pub const PROTOCOL_VERSION: u8 = 1;

/// Offsets travel as seven big-endian bytes on the wire.
pub const MAX_OFFSET: u64 = (1 << 56) - 1;

pub const MSG_CLIENT_REQUEST: u8 = 0;
pub const MSG_SERVER_METADATA: u8 = 1;
pub const MSG_SERVER_PAYLOAD: u8 = 2;
pub const MSG_CLIENT_ACK: u8 = 3;
pub const MSG_CLOSE: u8 = 4;

/// Bit 0 of the ClientAck status byte: the client has not seen metadata for
///  the acknowledged file yet.
pub const ACK_STATUS_METADATA_MISSING: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("offset {0} exceeds the 56-bit wire range")]
    OffsetTooLarge(u64),
    #[error("{0} options do not fit the 8-bit option count")]
    TooManyOptions(usize),
    #[error("buffer too short for {0}")]
    Truncated(&'static str),
    #[error("option length overruns the buffer")]
    OptionMalformed,
    #[error("{0} does not fit its wire field")]
    ValueOutOfRange(&'static str),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

fn put_offset(buf: &mut BytesMut, offset: u64) -> Result<(), WireError> {
    if offset > MAX_OFFSET {
        return Err(WireError::OffsetTooLarge(offset));
    }
    buf.put_uint(offset, 7);
    Ok(())
}

fn get_offset(buf: &mut impl Buf) -> u64 {
    buf.get_uint(7)
}

/// A header option. Unknown option types are carried opaquely and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgOption {
    pub otype: u8,
    pub value: Vec<u8>,
}

/// The shared frame header: version and message type packed into one byte,
///  the piggybacked ack number, and an option count followed by the options.
///
/// The ack number is meaningful for metadata, payload and ack frames and is
///  0 on the wire otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub version: u8,
    pub msg_type: u8,
    pub ack_number: u8,
    pub options: Vec<MsgOption>,
}

impl MsgHeader {
    pub fn new(msg_type: u8, ack_number: u8) -> MsgHeader {
        MsgHeader {
            version: PROTOCOL_VERSION,
            msg_type,
            ack_number,
            options: Vec::new(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.options.len() > 255 {
            return Err(WireError::TooManyOptions(self.options.len()));
        }
        buf.put_u8((self.version << 4) | (self.msg_type & 0x0F));
        buf.put_u8(self.ack_number);
        buf.put_u8(self.options.len() as u8);
        for o in &self.options {
            if o.value.len() > 255 {
                return Err(WireError::OptionMalformed);
            }
            buf.put_u8(o.otype);
            buf.put_u8(o.value.len() as u8);
            buf.put_slice(&o.value);
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MsgHeader, WireError> {
        if buf.remaining() < 3 {
            return Err(WireError::Truncated("message header"));
        }
        let vt = buf.get_u8();
        let ack_number = buf.get_u8();
        let option_count = buf.get_u8();

        let mut options = Vec::with_capacity(option_count as usize);
        for _ in 0..option_count {
            if buf.remaining() < 2 {
                return Err(WireError::OptionMalformed);
            }
            let otype = buf.get_u8();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(WireError::OptionMalformed);
            }
            let mut value = vec![0u8; len];
            buf.copy_to_slice(&mut value);
            options.push(MsgOption { otype, value });
        }

        Ok(MsgHeader {
            version: vt >> 4,
            msg_type: vt & 0x0F,
            ack_number,
            options,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStatus {
    NoError,
    FileNotExistent,
    FileEmpty,
    AccessDenied,
    OffsetTooLarge,
    Other(u8),
}

impl MetadataStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            MetadataStatus::NoError => 0,
            MetadataStatus::FileNotExistent => 1,
            MetadataStatus::FileEmpty => 2,
            MetadataStatus::AccessDenied => 3,
            MetadataStatus::OffsetTooLarge => 4,
            MetadataStatus::Other(raw) => raw,
        }
    }

    pub fn from_u8(raw: u8) -> MetadataStatus {
        match raw {
            0 => MetadataStatus::NoError,
            1 => MetadataStatus::FileNotExistent,
            2 => MetadataStatus::FileEmpty,
            3 => MetadataStatus::AccessDenied,
            4 => MetadataStatus::OffsetTooLarge,
            raw => MetadataStatus::Other(raw),
        }
    }
}

impl Display for MetadataStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataStatus::NoError => write!(f, "no error"),
            MetadataStatus::FileNotExistent => write!(f, "file does not exist"),
            MetadataStatus::FileEmpty => write!(f, "file is empty"),
            MetadataStatus::AccessDenied => write!(f, "access denied"),
            MetadataStatus::OffsetTooLarge => write!(f, "offset is past the end of the file"),
            MetadataStatus::Other(raw) => write!(f, "status {}", raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    NoReason,
    ApplicationClosed,
    UnsupportedVersion,
    UnknownRequest,
    WrongChecksum,
    DownloadFinished,
    Timeout,
    Other(u16),
}

impl CloseReason {
    pub fn to_u16(self) -> u16 {
        match self {
            CloseReason::NoReason => 0,
            CloseReason::ApplicationClosed => 1,
            CloseReason::UnsupportedVersion => 2,
            CloseReason::UnknownRequest => 3,
            CloseReason::WrongChecksum => 4,
            CloseReason::DownloadFinished => 5,
            CloseReason::Timeout => 6,
            CloseReason::Other(raw) => raw,
        }
    }

    pub fn from_u16(raw: u16) -> CloseReason {
        match raw {
            0 => CloseReason::NoReason,
            1 => CloseReason::ApplicationClosed,
            2 => CloseReason::UnsupportedVersion,
            3 => CloseReason::UnknownRequest,
            4 => CloseReason::WrongChecksum,
            5 => CloseReason::DownloadFinished,
            6 => CloseReason::Timeout,
            raw => CloseReason::Other(raw),
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::NoReason => write!(f, "no reason"),
            CloseReason::ApplicationClosed => write!(f, "application closed"),
            CloseReason::UnsupportedVersion => write!(f, "unsupported version"),
            CloseReason::UnknownRequest => write!(f, "unknown request"),
            CloseReason::WrongChecksum => write!(f, "wrong checksum"),
            CloseReason::DownloadFinished => write!(f, "download finished"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Other(raw) => write!(f, "reason {}", raw),
        }
    }
}

/// One requested file: a byte offset to resume from, and the file's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub offset: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub max_transmission_rate: u32,
    pub files: Vec<FileDescriptor>,
}

impl ClientRequest {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.files.len() > u16::MAX as usize {
            return Err(WireError::ValueOutOfRange("file count"));
        }
        buf.put_u32(self.max_transmission_rate);
        buf.put_u16(self.files.len() as u16);
        for file in &self.files {
            put_offset(buf, file.offset)?;
            let name = file.name.as_bytes();
            if name.len() > u16::MAX as usize {
                return Err(WireError::ValueOutOfRange("file name length"));
            }
            buf.put_u16(name.len() as u16);
            buf.put_slice(name);
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ClientRequest, WireError> {
        if buf.remaining() < 6 {
            return Err(WireError::Truncated("client request"));
        }
        let max_transmission_rate = buf.get_u32();
        let file_count = buf.get_u16();

        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            if buf.remaining() < 9 {
                return Err(WireError::Truncated("file descriptor"));
            }
            let offset = get_offset(buf);
            let name_len = buf.get_u16() as usize;
            if buf.remaining() < name_len {
                return Err(WireError::Truncated("file name"));
            }
            let mut name = vec![0u8; name_len];
            buf.copy_to_slice(&mut name);
            files.push(FileDescriptor {
                offset,
                name: String::from_utf8_lossy(&name).into_owned(),
            });
        }

        Ok(ClientRequest {
            max_transmission_rate,
            files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMetadata {
    pub ack_number: u8,
    pub status: MetadataStatus,
    pub file_index: u16,
    pub size: u64,
    pub checksum: [u8; 16],
}

impl ServerMetadata {
    const FIXED_LEN: usize = 28;

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(0); // reserved
        buf.put_u8(self.status.to_u8());
        buf.put_u16(self.file_index);
        buf.put_u64(self.size);
        buf.put_slice(&self.checksum);
        Ok(())
    }

    pub fn deser(ack_number: u8, buf: &mut impl Buf) -> Result<ServerMetadata, WireError> {
        if buf.remaining() < Self::FIXED_LEN {
            return Err(WireError::Truncated("server metadata"));
        }
        let _reserved = buf.get_u8();
        let status = MetadataStatus::from_u8(buf.get_u8());
        let file_index = buf.get_u16();
        let size = buf.get_u64();
        let mut checksum = [0u8; 16];
        buf.copy_to_slice(&mut checksum);

        Ok(ServerMetadata {
            ack_number,
            status,
            file_index,
            size,
            checksum,
        })
    }
}

/// One chunk of file content. `offset` counts 1024-byte chunks, not bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPayload {
    pub ack_number: u8,
    pub file_index: u16,
    pub offset: u64,
    pub data: Bytes,
}

impl ServerPayload {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(self.file_index);
        put_offset(buf, self.offset)?;
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn deser(ack_number: u8, buf: &mut impl Buf) -> Result<ServerPayload, WireError> {
        if buf.remaining() < 9 {
            return Err(WireError::Truncated("server payload"));
        }
        let file_index = buf.get_u16();
        let offset = get_offset(buf);
        let data = buf.copy_to_bytes(buf.remaining());

        Ok(ServerPayload {
            ack_number,
            file_index,
            offset,
            data,
        })
    }
}

/// "Please resend `length + 1` chunks starting at `offset` of `file_index`."
///  A lone entry with `length == 0` additionally asks for the file's metadata
///  to be re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendEntry {
    pub file_index: u16,
    pub offset: u64,
    pub length: u8,
}

impl ResendEntry {
    const WIRE_LEN: usize = 10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAck {
    pub ack_number: u8,
    pub file_index: u16,
    pub status: u8,
    pub max_transmission_rate: u32,
    pub offset: u64,
    pub resend_entries: Vec<ResendEntry>,
}

impl ClientAck {
    const FIXED_LEN: usize = 14;

    pub fn metadata_missing(&self) -> bool {
        self.status & ACK_STATUS_METADATA_MISSING != 0
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(self.file_index);
        buf.put_u8(self.status);
        buf.put_u32(self.max_transmission_rate);
        put_offset(buf, self.offset)?;
        for entry in &self.resend_entries {
            buf.put_u16(entry.file_index);
            put_offset(buf, entry.offset)?;
            buf.put_u8(entry.length);
        }
        Ok(())
    }

    pub fn deser(ack_number: u8, buf: &mut impl Buf) -> Result<ClientAck, WireError> {
        if buf.remaining() < Self::FIXED_LEN {
            return Err(WireError::Truncated("client ack"));
        }
        let file_index = buf.get_u16();
        let status = buf.get_u8();
        let max_transmission_rate = buf.get_u32();
        let offset = get_offset(buf);

        // a trailing partial entry is ignored
        let mut resend_entries = Vec::with_capacity(buf.remaining() / ResendEntry::WIRE_LEN);
        while buf.remaining() >= ResendEntry::WIRE_LEN {
            resend_entries.push(ResendEntry {
                file_index: buf.get_u16(),
                offset: get_offset(buf),
                length: buf.get_u8(),
            });
        }

        Ok(ClientAck {
            ack_number,
            file_index,
            status,
            max_transmission_rate,
            offset,
            resend_entries,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseConnection {
    pub reason: CloseReason,
}

impl CloseConnection {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(self.reason.to_u16());
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> Result<CloseConnection, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated("close connection"));
        }
        Ok(CloseConnection {
            reason: CloseReason::from_u16(buf.get_u16()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(ClientRequest),
    Metadata(ServerMetadata),
    Payload(ServerPayload),
    Ack(ClientAck),
    Close(CloseConnection),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Request(_) => MSG_CLIENT_REQUEST,
            Message::Metadata(_) => MSG_SERVER_METADATA,
            Message::Payload(_) => MSG_SERVER_PAYLOAD,
            Message::Ack(_) => MSG_CLIENT_ACK,
            Message::Close(_) => MSG_CLOSE,
        }
    }

    /// The ack number stamped into the frame header. Request and close
    ///  frames do not carry one.
    pub fn ack_number(&self) -> u8 {
        match self {
            Message::Metadata(m) => m.ack_number,
            Message::Payload(p) => p.ack_number,
            Message::Ack(a) => a.ack_number,
            Message::Request(_) | Message::Close(_) => 0,
        }
    }

    fn ser_body(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Message::Request(m) => m.ser(buf),
            Message::Metadata(m) => m.ser(buf),
            Message::Payload(m) => m.ser(buf),
            Message::Ack(m) => m.ser(buf),
            Message::Close(m) => m.ser(buf),
        }
    }
}

/// Serialize a full frame: header (with the message's piggybacked ack number)
///  followed by the message body.
pub fn encode_frame(msg: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
    MsgHeader::new(msg.msg_type(), msg.ack_number()).ser(buf)?;
    msg.ser_body(buf)
}

/// Decode a message body given an already-parsed header. The transport layer
///  dispatches on the header's message type; this is the one-stop variant used
///  where all message kinds arrive on the same path.
pub fn decode_body(header: &MsgHeader, buf: &mut impl Buf) -> Result<Message, WireError> {
    match header.msg_type {
        MSG_CLIENT_REQUEST => Ok(Message::Request(ClientRequest::deser(buf)?)),
        MSG_SERVER_METADATA => Ok(Message::Metadata(ServerMetadata::deser(
            header.ack_number,
            buf,
        )?)),
        MSG_SERVER_PAYLOAD => Ok(Message::Payload(ServerPayload::deser(
            header.ack_number,
            buf,
        )?)),
        MSG_CLIENT_ACK => Ok(Message::Ack(ClientAck::deser(header.ack_number, buf)?)),
        MSG_CLOSE => Ok(Message::Close(CloseConnection::deser(buf)?)),
        other => Err(WireError::UnknownMessageType(other)),
    }
}
