//! Schema driven header token codec.
//!
//! A header block on the wire is a sequence of `(id, type, value)` triples
//! running to the end of the block:
//!
//! ```text
//! [id: u16-le][type: u8][value: fixed width | length prefix + bytes] ...
//! ```
//!
//! Each block is interpreted against a schema (a [`Header`] enum) that names
//! the known ids, their wire type and whether they are required.  Ids the
//! schema does not know are kept verbatim so that re-encoding a decoded
//! stream reproduces them.

use {
    crate::error::{Result, TransportError},
    bytes::{Buf, BufMut, Bytes, BytesMut},
    std::{collections::BTreeMap, fmt, hash::Hash, sync::OnceLock},
    uuid::Uuid,
};

/// Size of the `(id, type)` prefix in front of every token value.
const TOKEN_PREFIX_LEN: usize = 3;

/// Primitive wire types of header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    Byte = 0x00,
    UShort = 0x01,
    ULong = 0x02,
    Long = 0x03,
    ULongLong = 0x04,
    LongLong = 0x05,
    Guid = 0x06,
    SmallString = 0x07,
    String = 0x08,
    ULongString = 0x09,
    SmallBytes = 0x0A,
    Bytes = 0x0B,
    ULongBytes = 0x0C,
    Float = 0x0D,
    Double = 0x0E,
    Invalid = 0xFF,
}

impl TokenType {
    pub fn from_id(id: u8) -> Result<Self> {
        Ok(match id {
            0x00 => Self::Byte,
            0x01 => Self::UShort,
            0x02 => Self::ULong,
            0x03 => Self::Long,
            0x04 => Self::ULongLong,
            0x05 => Self::LongLong,
            0x06 => Self::Guid,
            0x07 => Self::SmallString,
            0x08 => Self::String,
            0x09 => Self::ULongString,
            0x0A => Self::SmallBytes,
            0x0B => Self::Bytes,
            0x0C => Self::ULongBytes,
            0x0D => Self::Float,
            0x0E => Self::Double,
            other => {
                return Err(TransportError::CorruptedFrame(format!(
                    "unknown token type 0x{other:02x}"
                )))
            }
        })
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Width of the value for fixed-size types.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::UShort => Some(2),
            Self::ULong | Self::Long | Self::Float => Some(4),
            Self::ULongLong | Self::LongLong | Self::Double => Some(8),
            Self::Guid => Some(16),
            _ => None,
        }
    }

    /// Width of the length prefix for variable-size types.
    fn prefix_width(self) -> Option<usize> {
        match self {
            Self::SmallString | Self::SmallBytes => Some(1),
            Self::String | Self::Bytes => Some(2),
            Self::ULongString | Self::ULongBytes => Some(4),
            _ => None,
        }
    }

    fn max_variable_len(self) -> usize {
        match self.prefix_width() {
            Some(1) => u8::MAX as usize,
            Some(2) => u16::MAX as usize,
            _ => u32::MAX as usize,
        }
    }

    /// Number of bytes the value occupies at the front of `input`.
    fn value_span(self, input: &[u8]) -> Result<usize> {
        if let Some(width) = self.fixed_width() {
            return Ok(width);
        }
        let prefix = self.prefix_width().ok_or_else(|| {
            TransportError::CorruptedFrame(format!("token type {self:?} has no value encoding"))
        })?;
        ensure_remaining(input.len(), prefix, self)?;
        let len = match prefix {
            1 => input[0] as usize,
            2 => u16::from_le_bytes([input[0], input[1]]) as usize,
            _ => u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize,
        };
        Ok(prefix.saturating_add(len))
    }
}

/// A typed header value.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Guid(Uuid),
    SmallString(String),
    String(String),
    ULongString(String),
    SmallBytes(Bytes),
    Bytes(Bytes),
    ULongBytes(Bytes),
    Float(f32),
    Double(f64),
}

impl TokenValue {
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::Byte(_) => TokenType::Byte,
            Self::UShort(_) => TokenType::UShort,
            Self::ULong(_) => TokenType::ULong,
            Self::Long(_) => TokenType::Long,
            Self::ULongLong(_) => TokenType::ULongLong,
            Self::LongLong(_) => TokenType::LongLong,
            Self::Guid(_) => TokenType::Guid,
            Self::SmallString(_) => TokenType::SmallString,
            Self::String(_) => TokenType::String,
            Self::ULongString(_) => TokenType::ULongString,
            Self::SmallBytes(_) => TokenType::SmallBytes,
            Self::Bytes(_) => TokenType::Bytes,
            Self::ULongBytes(_) => TokenType::ULongBytes,
            Self::Float(_) => TokenType::Float,
            Self::Double(_) => TokenType::Double,
        }
    }

    fn variable_len(&self) -> Option<usize> {
        match self {
            Self::SmallString(s) | Self::String(s) | Self::ULongString(s) => Some(s.len()),
            Self::SmallBytes(b) | Self::Bytes(b) | Self::ULongBytes(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Encoded size of the value, excluding the `(id, type)` prefix.
    pub fn encoded_len(&self) -> usize {
        let token_type = self.token_type();
        match (token_type.fixed_width(), self.variable_len()) {
            (Some(width), _) => width,
            (None, Some(len)) => token_type
                .prefix_width()
                .unwrap_or_default()
                .saturating_add(len),
            (None, None) => 0,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::Byte(v) => out.put_u8(*v),
            Self::UShort(v) => out.put_u16_le(*v),
            Self::ULong(v) => out.put_u32_le(*v),
            Self::Long(v) => out.put_i32_le(*v),
            Self::ULongLong(v) => out.put_u64_le(*v),
            Self::LongLong(v) => out.put_i64_le(*v),
            Self::Guid(v) => out.put_slice(&v.to_bytes_le()),
            Self::SmallString(s) => {
                out.put_u8(s.len() as u8);
                out.put_slice(s.as_bytes());
            }
            Self::String(s) => {
                out.put_u16_le(s.len() as u16);
                out.put_slice(s.as_bytes());
            }
            Self::ULongString(s) => {
                out.put_u32_le(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
            Self::SmallBytes(b) => {
                out.put_u8(b.len() as u8);
                out.put_slice(b);
            }
            Self::Bytes(b) => {
                out.put_u16_le(b.len() as u16);
                out.put_slice(b);
            }
            Self::ULongBytes(b) => {
                out.put_u32_le(b.len() as u32);
                out.put_slice(b);
            }
            Self::Float(v) => out.put_f32_le(*v),
            Self::Double(v) => out.put_f64_le(*v),
        }
    }

    fn decode(token_type: TokenType, input: &mut Bytes) -> Result<Self> {
        let span = token_type.value_span(&input[..])?;
        ensure_remaining(input.len(), span, token_type)?;
        let prefix = token_type.prefix_width().unwrap_or_default();
        Ok(match token_type {
            TokenType::Byte => Self::Byte(input.get_u8()),
            TokenType::UShort => Self::UShort(input.get_u16_le()),
            TokenType::ULong => Self::ULong(input.get_u32_le()),
            TokenType::Long => Self::Long(input.get_i32_le()),
            TokenType::ULongLong => Self::ULongLong(input.get_u64_le()),
            TokenType::LongLong => Self::LongLong(input.get_i64_le()),
            TokenType::Guid => {
                let mut raw = [0u8; 16];
                input.copy_to_slice(&mut raw);
                Self::Guid(Uuid::from_bytes_le(raw))
            }
            TokenType::Float => Self::Float(input.get_f32_le()),
            TokenType::Double => Self::Double(input.get_f64_le()),
            TokenType::SmallString | TokenType::String | TokenType::ULongString => {
                input.advance(prefix);
                let raw = input.split_to(span.saturating_sub(prefix));
                let text = String::from_utf8(raw.to_vec()).map_err(|e| {
                    TransportError::CorruptedFrame(format!("invalid utf-8 in string token: {e}"))
                })?;
                match token_type {
                    TokenType::SmallString => Self::SmallString(text),
                    TokenType::String => Self::String(text),
                    _ => Self::ULongString(text),
                }
            }
            TokenType::SmallBytes | TokenType::Bytes | TokenType::ULongBytes => {
                input.advance(prefix);
                let raw = input.split_to(span.saturating_sub(prefix));
                match token_type {
                    TokenType::SmallBytes => Self::SmallBytes(raw),
                    TokenType::Bytes => Self::Bytes(raw),
                    _ => Self::ULongBytes(raw),
                }
            }
            TokenType::Invalid => {
                return Err(TransportError::CorruptedFrame(
                    "token with invalid type on the wire".to_string(),
                ))
            }
        })
    }
}

fn ensure_remaining(available: usize, needed: usize, token_type: TokenType) -> Result<()> {
    if available < needed {
        return Err(TransportError::CorruptedFrame(format!(
            "truncated {token_type:?} token: need {needed} bytes, have {available}"
        )));
    }
    Ok(())
}

/// A header schema: one implementation per header block kind.
pub trait Header: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn id(self) -> u16;
    fn token_type(self) -> TokenType;
    fn is_required(self) -> bool;
    fn name(self) -> &'static str;
    fn from_id(id: u16) -> Option<Self>;
    fn all() -> &'static [Self];
}

#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Value(TokenValue),
    /// Value bytes of an id the schema does not define, kept as received.
    Raw(Bytes),
}

/// One present header of a [`TokenStream`].
#[derive(Debug)]
pub struct Token<H> {
    header: Option<H>,
    id: u16,
    token_type: TokenType,
    payload: Payload,
    length: OnceLock<usize>,
}

impl<H: Header> Token<H> {
    fn known(header: H, value: TokenValue) -> Self {
        Self {
            header: Some(header),
            id: header.id(),
            token_type: header.token_type(),
            payload: Payload::Value(value),
            length: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    pub fn header(&self) -> Option<H> {
        self.header
    }

    pub fn value(&self) -> Option<&TokenValue> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Full encoded size including the `(id, type)` prefix.  Memoized until
    /// the value is reassigned.
    pub fn encoded_len(&self) -> usize {
        *self.length.get_or_init(|| {
            let value_len = match &self.payload {
                Payload::Value(value) => value.encoded_len(),
                Payload::Raw(raw) => raw.len(),
            };
            TOKEN_PREFIX_LEN.saturating_add(value_len)
        })
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u16_le(self.id);
        out.put_u8(self.token_type.id());
        match &self.payload {
            Payload::Value(value) => value.encode(out),
            Payload::Raw(raw) => out.put_slice(raw),
        }
    }
}

impl<H: Header> Clone for Token<H> {
    fn clone(&self) -> Self {
        Self {
            header: self.header,
            id: self.id,
            token_type: self.token_type,
            payload: self.payload.clone(),
            length: OnceLock::new(),
        }
    }
}

impl<H: Header> PartialEq for Token<H> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.token_type == other.token_type
            && self.payload == other.payload
    }
}

/// A decoded or under-construction header block for schema `H`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenStream<H: Header> {
    tokens: BTreeMap<u16, Token<H>>,
}

impl<H: Header> Default for TokenStream<H> {
    fn default() -> Self {
        Self {
            tokens: BTreeMap::new(),
        }
    }
}

impl<H: Header> TokenStream<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a header value, checking it against the schema's wire type.
    pub fn set(&mut self, header: H, value: TokenValue) -> Result<()> {
        if value.token_type() != header.token_type() {
            return Err(TransportError::InvalidHeader(format!(
                "{} expects {:?}, got {:?}",
                header.name(),
                header.token_type(),
                value.token_type()
            )));
        }
        if let Some(len) = value.variable_len() {
            let max = header.token_type().max_variable_len();
            if len > max {
                return Err(TransportError::InvalidHeader(format!(
                    "{} value of {len} bytes exceeds {max}",
                    header.name()
                )));
            }
        }
        self.tokens.insert(header.id(), Token::known(header, value));
        Ok(())
    }

    pub fn set_byte(&mut self, header: H, value: u8) -> Result<()> {
        self.set(header, TokenValue::Byte(value))
    }

    pub fn set_u16(&mut self, header: H, value: u16) -> Result<()> {
        self.set(header, TokenValue::UShort(value))
    }

    pub fn set_u32(&mut self, header: H, value: u32) -> Result<()> {
        self.set(header, TokenValue::ULong(value))
    }

    pub fn set_i32(&mut self, header: H, value: i32) -> Result<()> {
        self.set(header, TokenValue::Long(value))
    }

    pub fn set_u64(&mut self, header: H, value: u64) -> Result<()> {
        self.set(header, TokenValue::ULongLong(value))
    }

    pub fn set_i64(&mut self, header: H, value: i64) -> Result<()> {
        self.set(header, TokenValue::LongLong(value))
    }

    pub fn set_guid(&mut self, header: H, value: Uuid) -> Result<()> {
        self.set(header, TokenValue::Guid(value))
    }

    pub fn set_f64(&mut self, header: H, value: f64) -> Result<()> {
        self.set(header, TokenValue::Double(value))
    }

    /// Sets a string header using whichever string width its schema declares.
    pub fn set_str(&mut self, header: H, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        let value = match header.token_type() {
            TokenType::SmallString => TokenValue::SmallString(value),
            TokenType::String => TokenValue::String(value),
            TokenType::ULongString => TokenValue::ULongString(value),
            other => {
                return Err(TransportError::InvalidHeader(format!(
                    "{} is {other:?}, not a string",
                    header.name()
                )))
            }
        };
        self.set(header, value)
    }

    /// Sets a byte-string header using whichever width its schema declares.
    pub fn set_bytes(&mut self, header: H, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        let value = match header.token_type() {
            TokenType::SmallBytes => TokenValue::SmallBytes(value),
            TokenType::Bytes => TokenValue::Bytes(value),
            TokenType::ULongBytes => TokenValue::ULongBytes(value),
            other => {
                return Err(TransportError::InvalidHeader(format!(
                    "{} is {other:?}, not a byte string",
                    header.name()
                )))
            }
        };
        self.set(header, value)
    }

    pub fn remove(&mut self, header: H) -> Option<TokenValue> {
        self.tokens
            .remove(&header.id())
            .and_then(|token| match token.payload {
                Payload::Value(value) => Some(value),
                Payload::Raw(_) => None,
            })
    }

    pub fn is_present(&self, header: H) -> bool {
        self.tokens.contains_key(&header.id())
    }

    pub fn get(&self, header: H) -> Option<&TokenValue> {
        self.tokens.get(&header.id()).and_then(Token::value)
    }

    pub fn get_byte(&self, header: H) -> Option<u8> {
        match self.get(header)? {
            TokenValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, header: H) -> Option<u32> {
        match self.get(header)? {
            TokenValue::ULong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, header: H) -> Option<i64> {
        match self.get(header)? {
            TokenValue::LongLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, header: H) -> Option<f64> {
        match self.get(header)? {
            TokenValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, header: H) -> Option<&str> {
        match self.get(header)? {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn get_bytes(&self, header: H) -> Option<&Bytes> {
        match self.get(header)? {
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                Some(b)
            }
            _ => None,
        }
    }

    /// Iterates all present tokens in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Token<H>> {
        self.tokens.values()
    }

    /// Ids received on the wire that the schema does not define.
    pub fn unknown_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.tokens
            .values()
            .filter(|token| token.header.is_none())
            .map(|token| token.id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        self.tokens
            .values()
            .fold(0usize, |sum, token| sum.saturating_add(token.encoded_len()))
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        for token in self.tokens.values() {
            token.encode(out);
        }
    }

    /// Decodes a complete header block.
    ///
    /// Fails with [`TransportError::CorruptedFrame`] when a token is
    /// truncated, a known id arrives with the wrong wire type, or a required
    /// header is missing once the block is exhausted.
    pub fn decode(mut input: Bytes) -> Result<Self> {
        let mut stream = Self::new();

        while input.has_remaining() {
            if input.remaining() < TOKEN_PREFIX_LEN {
                return Err(TransportError::CorruptedFrame(format!(
                    "truncated token prefix: {} trailing bytes",
                    input.remaining()
                )));
            }
            let id = input.get_u16_le();
            let token_type = TokenType::from_id(input.get_u8())?;

            let token = match H::from_id(id) {
                Some(header) => {
                    if header.token_type() != token_type {
                        return Err(TransportError::CorruptedFrame(format!(
                            "{} arrived as {token_type:?}, expected {:?}",
                            header.name(),
                            header.token_type()
                        )));
                    }
                    Token::known(header, TokenValue::decode(token_type, &mut input)?)
                }
                None => {
                    let span = token_type.value_span(&input[..])?;
                    ensure_remaining(input.remaining(), span, token_type)?;
                    Token {
                        header: None,
                        id,
                        token_type,
                        payload: Payload::Raw(input.split_to(span)),
                        length: OnceLock::new(),
                    }
                }
            };
            stream.tokens.insert(id, token);
        }

        if let Some(missing) = H::all()
            .iter()
            .find(|header| header.is_required() && !stream.is_present(**header))
        {
            return Err(TransportError::CorruptedFrame(format!(
                "required header not found on token stream: {}",
                missing.name()
            )));
        }

        Ok(stream)
    }
}
