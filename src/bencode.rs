//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used by every BitTorrent surface this
//! crate touches: KRPC datagrams, extension-protocol payloads, and client
//! state files. Four data types: integers (`i42e`), byte strings (`4:spam`),
//! lists (`l...e`), and dictionaries (`d...e`) with byte-string keys in
//! sorted order.
//!
//! # Examples
//!
//! ```
//! use btfetch::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d5:counti7e3:foo3:bare").unwrap();
//! assert_eq!(value.get_str("foo"), Some("bar"));
//! assert_eq!(value.get_int("count"), Some(7));
//!
//! let bytes = encode(&value);
//! assert_eq!(&bytes[..], b"d5:counti7e3:foo3:bare");
//! ```
//!
//! Extension messages carry raw piece bytes after the bencoded header;
//! [`decode_prefix`] decodes a single value and reports how many bytes it
//! consumed so the caller can slice off the remainder.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;

pub(crate) use value::dict;

#[cfg(test)]
mod tests;
