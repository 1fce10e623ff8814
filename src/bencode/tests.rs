use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

fn roundtrip(value: Value) {
    let bytes = encode(&value);
    assert_eq!(decode(&bytes).unwrap(), value);
}

#[test]
fn integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
    assert_eq!(decode(b"i-17e").unwrap(), Value::Int(-17));
    assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    roundtrip(Value::Int(i64::MAX));
    roundtrip(Value::Int(i64::MIN));
}

#[test]
fn rejects_malformed_integers() {
    assert_eq!(decode(b"ie"), Err(BencodeError::InvalidInt));
    assert_eq!(decode(b"i-0e"), Err(BencodeError::InvalidInt));
    assert_eq!(decode(b"i007e"), Err(BencodeError::InvalidInt));
    assert_eq!(decode(b"i1x2e"), Err(BencodeError::InvalidInt));
    assert_eq!(decode(b"i42"), Err(BencodeError::UnexpectedEof));
}

#[test]
fn byte_strings() {
    assert_eq!(decode(b"4:spam").unwrap(), Value::bytes(&b"spam"[..]));
    assert_eq!(decode(b"0:").unwrap(), Value::bytes(&b""[..]));
    // Binary content is fine; strings are bytes, not UTF-8.
    roundtrip(Value::bytes(vec![0u8, 1, 2, 255]));
}

#[test]
fn rejects_truncated_strings() {
    assert_eq!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof));
    assert_eq!(decode(b"4spam"), Err(BencodeError::UnexpectedEof));
}

#[test]
fn lists_and_dicts() {
    let value = decode(b"l4:spami42ee").unwrap();
    assert_eq!(
        value,
        Value::List(vec![Value::bytes(&b"spam"[..]), Value::Int(42)])
    );

    let value = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
    assert_eq!(value.get_str("bar"), Some("spam"));
    assert_eq!(value.get_int("foo"), Some(42));
    assert_eq!(value.get("missing"), None);
}

#[test]
fn nested_roundtrip() {
    let mut inner = BTreeMap::new();
    inner.insert(Bytes::from_static(b"ut_metadata"), Value::Int(3));
    let mut outer = BTreeMap::new();
    outer.insert(Bytes::from_static(b"m"), Value::Dict(inner));
    outer.insert(Bytes::from_static(b"metadata_size"), Value::Int(31235));
    outer.insert(
        Bytes::from_static(b"peers"),
        Value::List(vec![Value::bytes(vec![127, 0, 0, 1, 0x1a, 0xe1])]),
    );
    roundtrip(Value::Dict(outer));
}

#[test]
fn dict_keys_encode_sorted() {
    let value = decode(b"d1:bi2e1:ai1ee").unwrap();
    assert_eq!(&encode(&value)[..], b"d1:ai1e1:bi2ee");
}

#[test]
fn rejects_non_string_keys() {
    assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey));
}

#[test]
fn rejects_trailing_bytes() {
    assert_eq!(decode(b"i1exx"), Err(BencodeError::TrailingBytes(2)));
}

#[test]
fn depth_limit() {
    let mut data = vec![b'l'; 80];
    data.extend(vec![b'e'; 80]);
    assert!(matches!(decode(&data), Err(BencodeError::DepthLimit(_))));
}

#[test]
fn prefix_decoding_reports_consumed_length() {
    let data = b"d8:msg_typei1e5:piecei0ee\x01\x02\x03";
    let (value, used) = decode_prefix(data).unwrap();
    assert_eq!(value.get_int("msg_type"), Some(1));
    assert_eq!(used, data.len() - 3);
    assert_eq!(&data[used..], &[1, 2, 3]);
}
