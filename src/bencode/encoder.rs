use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

/// Encodes a byte slice as a bencode string (`<len>:<bytes>`, no escaping).
#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an `i64` as a bencode integer (`i<digits>e`, no leading zeros, no `+`).
#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary with keys sorted by raw byte value, as required for
/// a canonical encoding (the info-hash SHA-1 must be reproducible regardless
/// of the decoder's key insertion order).
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &HashMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(writer, key)?;
        let value = dict
            .get(key)
            .ok_or_else(|| BencodeError::InvalidFormat("Missing dict value for key".to_string()))?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes any [`BencodeValue`] tree. The client always runs this over a
/// preserved `info` sub-tree (structural round-trip), never a model-level
/// reconstruction that could reorder keys or drop unknown fields.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_string() {
        let mut buf = Vec::new();
        encode(&mut buf, &BencodeValue::String(b"hello".to_vec())).unwrap();
        assert_eq!(buf, b"5:hello");
    }

    #[test]
    fn encodes_integer() {
        let mut buf = Vec::new();
        encode(&mut buf, &BencodeValue::Integer(-42)).unwrap();
        assert_eq!(buf, b"i-42e");
    }

    #[test]
    fn encodes_list() {
        let mut buf = Vec::new();
        let value = BencodeValue::List(vec![
            BencodeValue::String(b"hello".to_vec()),
            BencodeValue::Integer(52),
        ]);
        encode(&mut buf, &value).unwrap();
        assert_eq!(buf, b"l5:helloi52ee");
    }
}
