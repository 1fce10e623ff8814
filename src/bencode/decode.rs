use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 64;

/// Decodes a complete bencode value, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingBytes(data.len() - used));
    }
    Ok(value)
}

/// Decodes one bencode value from the front of `data` and returns it along
/// with the number of bytes consumed. Used for extension messages where raw
/// payload bytes follow the bencoded header.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    /// Advances past the next `stop` byte and returns the bytes before it.
    fn until(&mut self, stop: u8) -> Result<&'_ [u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != stop {
            self.bump();
        }
        let end = self.pos;
        self.pos = end + 1;
        Ok(&self.data[start..end])
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthLimit(MAX_DEPTH));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dictionary(depth),
            b'0'..=b'9' => self.byte_string(),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump();
        let digits = self.until(b'e')?;
        Ok(Value::Int(parse_i64(digits)?))
    }

    fn byte_string(&mut self) -> Result<Value, BencodeError> {
        let digits = self.until(b':')?;
        let len = parse_len(digits)?;
        if self.data.len() - self.pos < len {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(Value::Bytes(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.bump();
        Ok(Value::List(items))
    }

    fn dictionary(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.value(depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(BencodeError::NonStringKey),
            };
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.bump();
        Ok(Value::Dict(map))
    }
}

fn parse_i64(digits: &[u8]) -> Result<i64, BencodeError> {
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInt)?;
    // BEP-3 forbids leading zeros and negative zero.
    if text.is_empty()
        || text == "-"
        || text.starts_with("-0")
        || (text.starts_with('0') && text.len() > 1)
    {
        return Err(BencodeError::InvalidInt);
    }
    text.parse().map_err(|_| BencodeError::InvalidInt)
}

fn parse_len(digits: &[u8]) -> Result<usize, BencodeError> {
    if digits.is_empty() {
        return Err(BencodeError::InvalidLength);
    }
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
    text.parse().map_err(|_| BencodeError::InvalidLength)
}
