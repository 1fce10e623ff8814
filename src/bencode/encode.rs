use super::value::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes a value into a fresh buffer.
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::with_capacity(guess_len(value));
    encode_into(value, &mut buf);
    buf.freeze()
}

/// Appends the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Int(i) => {
            buf.put_u8(b'i');
            buf.put_slice(itoa(*i).as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => {
            buf.put_slice(itoa(b.len() as i64).as_bytes());
            buf.put_u8(b':');
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(map) => {
            buf.put_u8(b'd');
            for (key, item) in map {
                buf.put_slice(itoa(key.len() as i64).as_bytes());
                buf.put_u8(b':');
                buf.put_slice(key);
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn itoa(i: i64) -> String {
    i.to_string()
}

fn guess_len(value: &Value) -> usize {
    match value {
        Value::Int(_) => 16,
        Value::Bytes(b) => b.len() + 8,
        Value::List(items) => 2 + items.iter().map(guess_len).sum::<usize>(),
        Value::Dict(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 8 + guess_len(v))
                .sum::<usize>()
        }
    }
}
