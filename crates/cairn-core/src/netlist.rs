//! Nested length-prefixed list encoding — the persisted peer-list format.
//!
//! An item is either a byte string or a list of items. Both carry a one-byte
//! tag and a big-endian u32 payload length, so a reader can skip or validate
//! any item without interpreting it:
//!
//!   bytes:  0x00 | len: u32 BE | raw bytes
//!   list:   0x01 | len: u32 BE | concatenated child encodings
//!
//! Unsigned integers are carried as minimal big-endian byte strings (zero is
//! the empty string). The decoder is strict: truncation, trailing garbage,
//! unknown tags, and nesting deeper than [`MAX_DEPTH`] are all errors.

const TAG_BYTES: u8 = 0x00;
const TAG_LIST: u8 = 0x01;

/// Nesting bound for the decoder. The peer-list format needs three levels.
pub const MAX_DEPTH: usize = 16;

/// A single encodable item: raw bytes or a nested list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    /// Encode an unsigned integer as a minimal big-endian byte string.
    pub fn uint(value: u64) -> Item {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Item::Bytes(bytes[skip..].to_vec())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Item {
        Item::Bytes(data.into())
    }

    pub fn list(items: impl Into<Vec<Item>>) -> Item {
        Item::List(items.into())
    }

    pub fn as_bytes(&self) -> Result<&[u8], NetlistError> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(NetlistError::ExpectedBytes),
        }
    }

    pub fn as_list(&self) -> Result<&[Item], NetlistError> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(NetlistError::ExpectedList),
        }
    }

    /// Decode a minimal big-endian unsigned integer.
    pub fn as_uint(&self) -> Result<u64, NetlistError> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 {
            return Err(NetlistError::UintTooWide(bytes.len()));
        }
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
        Ok(value)
    }

    /// Serialize this item into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Item::Bytes(data) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            Item::List(items) => {
                let mut body = Vec::new();
                for item in items {
                    item.encode_into(&mut body);
                }
                out.push(TAG_LIST);
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&body);
            }
        }
    }

    /// Decode exactly one item from `buf`, rejecting trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Item, NetlistError> {
        let (item, rest) = decode_one(buf, 0)?;
        if !rest.is_empty() {
            return Err(NetlistError::TrailingBytes(rest.len()));
        }
        Ok(item)
    }
}

fn decode_one(buf: &[u8], depth: usize) -> Result<(Item, &[u8]), NetlistError> {
    if depth > MAX_DEPTH {
        return Err(NetlistError::TooDeep);
    }
    if buf.len() < 5 {
        return Err(NetlistError::Truncated);
    }
    let tag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let rest = &buf[5..];
    if rest.len() < len {
        return Err(NetlistError::Truncated);
    }
    let (payload, rest) = rest.split_at(len);
    match tag {
        TAG_BYTES => Ok((Item::Bytes(payload.to_vec()), rest)),
        TAG_LIST => {
            let mut items = Vec::new();
            let mut inner = payload;
            while !inner.is_empty() {
                let (item, next) = decode_one(inner, depth + 1)?;
                items.push(item);
                inner = next;
            }
            Ok((Item::List(items), rest))
        }
        other => Err(NetlistError::UnknownTag(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetlistError {
    #[error("truncated input")]
    Truncated,

    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),

    #[error("unknown item tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("nesting deeper than {}", MAX_DEPTH)]
    TooDeep,

    #[error("expected byte string, found list")]
    ExpectedBytes,

    #[error("expected list, found byte string")]
    ExpectedList,

    #[error("integer wider than 8 bytes ({0})")]
    UintTooWide(usize),
}
