//! ThreadFree wire protocol - CoAP message framing

use std::fmt;
use std::io;

pub mod payload;

pub const COAP_VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LEN: usize = 8;

// Option numbers
pub const OPT_URI_HOST: u16 = 3;
pub const OPT_URI_PATH: u16 = 11;
pub const OPT_CONTENT_FORMAT: u16 = 12;
pub const OPT_ACCEPT: u16 = 17;

// Content formats
pub const FORMAT_TEXT_PLAIN: u16 = 0;
pub const FORMAT_JSON: u16 = 50;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method or response code, `class.detail` packed into one byte
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    pub const fn from_u8(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn to_u8(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self != Code::EMPTY
    }

    pub fn is_response(self) -> bool {
        (2..=5).contains(&self.class())
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A single CoAP message as carried in one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            msg_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Confirmable request carrying `token`
    pub fn request(method: Code, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            token,
            ..Self::new(MessageType::Confirmable, method, message_id)
        }
    }

    /// Empty acknowledgement for a confirmable message we received
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.push(CoapOption { number, value });
    }

    /// Replace the Uri-Path options with the segments of `path`
    pub fn set_path(&mut self, path: &str) {
        self.options.retain(|o| o.number != OPT_URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OPT_URI_PATH, segment.as_bytes().to_vec());
        }
    }

    pub fn path(&self) -> String {
        self.option_values(OPT_URI_PATH)
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.options.retain(|o| o.number != OPT_CONTENT_FORMAT);
        self.add_option(OPT_CONTENT_FORMAT, encode_uint(format as u32));
    }

    pub fn content_format(&self) -> Option<u16> {
        self.option_values(OPT_CONTENT_FORMAT)
            .next()
            .map(|v| decode_uint(v) as u16)
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let token_len = self.token.len().min(MAX_TOKEN_LEN);
        let mut buf = Vec::with_capacity(4 + token_len + self.payload.len() + 32);
        buf.push((COAP_VERSION << 6) | (self.msg_type.bits() << 4) | token_len as u8);
        buf.push(self.code.to_u8());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token[..token_len]);

        // Stable sort keeps repeated options (Uri-Path segments) in order
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for option in options {
            let (delta_nibble, delta_ext) = encode_nibble((option.number - previous) as usize);
            let (len_nibble, len_ext) = encode_nibble(option.value.len());
            buf.push((delta_nibble << 4) | len_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&len_ext);
            buf.extend_from_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 4 {
            return Err(invalid("CoAP message too short"));
        }
        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(invalid("unsupported CoAP version"));
        }
        let msg_type = MessageType::from_bits(data[0] >> 4);
        let token_len = (data[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(invalid("token length out of range"));
        }
        let code = Code::from_u8(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = 4;
        if data.len() < pos + token_len {
            return Err(invalid("token truncated"));
        }
        let token = data[pos..pos + token_len].to_vec();
        pos += token_len;

        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut number: u32 = 0;
        while pos < data.len() {
            let header = data[pos];
            pos += 1;
            if header == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(invalid("payload marker without payload"));
                }
                payload = data[pos..].to_vec();
                break;
            }

            let delta = read_extended(data, &mut pos, header >> 4)?;
            let length = read_extended(data, &mut pos, header & 0x0F)?;
            if data.len() < pos + length {
                return Err(invalid("option value truncated"));
            }
            number += delta as u32;
            if number > u16::MAX as u32 {
                return Err(invalid("option number out of range"));
            }
            options.push(CoapOption {
                number: number as u16,
                value: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(Self {
            msg_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn encode_nibble(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn read_extended(data: &[u8], pos: &mut usize, nibble: u8) -> io::Result<usize> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let byte = *data.get(*pos).ok_or_else(|| invalid("option header truncated"))?;
            *pos += 1;
            Ok(byte as usize + 13)
        }
        14 => {
            if data.len() < *pos + 2 {
                return Err(invalid("option header truncated"));
            }
            let value = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            *pos += 2;
            Ok(value as usize + 269)
        }
        _ => Err(invalid("reserved option nibble")),
    }
}

/// Minimal big-endian encoding, zero is the empty string
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(value: &[u8]) -> u32 {
    value
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_light_update_request() {
        let mut msg = Message::request(Code::PUT, 0x1234, vec![0xAB]);
        msg.set_path("15001/65537");
        msg.set_content_format(FORMAT_JSON);
        msg.payload = b"{}".to_vec();

        let mut expected = vec![0x41, 0x03, 0x12, 0x34, 0xAB];
        expected.push(0xB5);
        expected.extend_from_slice(b"15001");
        expected.push(0x05);
        expected.extend_from_slice(b"65537");
        expected.extend_from_slice(&[0x11, 0x32]);
        expected.push(0xFF);
        expected.extend_from_slice(b"{}");

        assert_eq!(msg.to_bytes(), expected);
    }

    #[test]
    fn options_are_written_in_number_order() {
        let mut msg = Message::request(Code::POST, 1, vec![]);
        msg.set_content_format(FORMAT_JSON);
        msg.set_path("/15011/9063");
        msg.add_option(OPT_URI_HOST, b"hub".to_vec());

        let decoded = Message::from_bytes(&msg.to_bytes()).unwrap();
        let numbers: Vec<u16> = decoded.options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![OPT_URI_HOST, OPT_URI_PATH, OPT_URI_PATH, OPT_CONTENT_FORMAT]);
        assert_eq!(decoded.path(), "15011/9063");
        assert_eq!(decoded.content_format(), Some(FORMAT_JSON));
    }

    #[test]
    fn extended_delta_and_length() {
        let mut msg = Message::new(MessageType::NonConfirmable, Code::GET, 7);
        msg.add_option(OPT_URI_PATH, vec![b'a'; 20]);
        msg.add_option(300, vec![b'b'; 300]);
        let bytes = msg.to_bytes();

        // delta 11, length 13 + 7
        assert_eq!(bytes[4], 0xBD);
        assert_eq!(bytes[5], 7);
        // delta 289 = 269 + 20, length 300 = 269 + 31
        assert_eq!(bytes[26], 0xEE);
        assert_eq!(&bytes[27..31], &[0x00, 0x14, 0x00, 0x1F]);

        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn piggybacked_response() {
        // ACK 2.05, mid 0x0001, token 0x0102, content-format 50, payload
        let data = [0x62, 0x45, 0x00, 0x01, 0x01, 0x02, 0xC1, 0x32, 0xFF, b'{', b'}'];
        let msg = Message::from_bytes(&data).unwrap();
        assert_eq!(msg.msg_type, MessageType::Acknowledgement);
        assert_eq!(msg.code, Code::CONTENT);
        assert_eq!(msg.message_id, 1);
        assert_eq!(msg.token, vec![1, 2]);
        assert_eq!(msg.content_format(), Some(FORMAT_JSON));
        assert_eq!(msg.payload, b"{}");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Message::from_bytes(&[0x40, 0x01]).is_err());
        // version 2
        assert!(Message::from_bytes(&[0x80, 0x01, 0x00, 0x01]).is_err());
        // token length 9
        assert!(Message::from_bytes(&[0x49, 0x01, 0x00, 0x01]).is_err());
        // token shorter than declared
        assert!(Message::from_bytes(&[0x44, 0x01, 0x00, 0x01, 0xAA]).is_err());
        // option claims 5 bytes, has 2
        assert!(Message::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0xB5, b'1', b'5']).is_err());
        // marker with nothing after it
        assert!(Message::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0xFF]).is_err());
        // reserved length nibble
        assert!(Message::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0x1F]).is_err());
    }

    #[test]
    fn code_display() {
        assert_eq!(Code::CHANGED.to_string(), "2.04");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert!(Code::CREATED.is_success());
        assert!(Code::PUT.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(!Code::EMPTY.is_response());
    }

    #[test]
    fn uint_options_are_minimal() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(50), vec![50]);
        assert_eq!(encode_uint(0x0100), vec![1, 0]);
        assert_eq!(decode_uint(&[1, 0]), 256);
        assert_eq!(decode_uint(&[]), 0);
    }
}
