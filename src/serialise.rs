use bytes::{BufMut, BytesMut};

use crate::parse::BencodeType;

/// Serialise [`BencodeType`] to its canonical bencoding
///
/// Dictionary keys are written in lexicographic byte order regardless of the
/// order they were decoded in.
pub fn serialise(data: &BencodeType) -> Vec<u8> {
    let mut buf = BytesMut::new();
    serialise_into(data, &mut buf);
    buf.to_vec()
}

fn serialise_byte_string(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}

fn serialise_into(data: &BencodeType, buf: &mut BytesMut) {
    match data {
        BencodeType::ByteString(bytes) => serialise_byte_string(bytes, buf),
        BencodeType::Integer(int) => {
            buf.put_u8(b'i');
            buf.put_slice(int.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        BencodeType::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                serialise_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        BencodeType::Dict(dict) => {
            let mut pairs = dict.iter().collect::<Vec<_>>();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            buf.put_u8(b'd');
            for (key, value) in pairs {
                serialise_byte_string(key, buf);
                serialise_into(value, buf);
            }
            buf.put_u8(b'e');
        }
    }
}
