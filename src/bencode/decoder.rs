use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use super::MAX_DEPTH;

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::rc::Rc;
use tracing::instrument;

/// A `Read` wrapper over a byte slice that records how many bytes have been
/// consumed through a shared counter, so the top-level [`decode`] can report
/// `bytes_consumed` for splicing the next value out of a stream without
/// hand-rolling length arithmetic (the source of the reference decoder's
/// off-by-one on multi-digit string lengths, see `torrent::file` notes).
struct CountingReader<'a> {
    data: &'a [u8],
    pos: Rc<Cell<usize>>,
}

impl<'a> Read for CountingReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.pos.get();
        let mut remaining = &self.data[start..];
        let n = remaining.read(buf)?;
        self.pos.set(start + n);
        Ok(n)
    }
}

/// Tracks how many input bytes remain so a declared string length can be
/// rejected as `MalformedInput` before any allocation is attempted, rather
/// than handing an attacker-controlled length straight to the allocator.
struct RemainingBytes {
    total_len: usize,
    pos: Rc<Cell<usize>>,
}

impl RemainingBytes {
    fn get(&self) -> usize {
        self.total_len.saturating_sub(self.pos.get())
    }
}

/// Decodes a single bencoded value from `bytes`, returning the value and the
/// number of bytes consumed for it. Extra trailing bytes are not an error;
/// the caller splices the next value starting at the returned offset.
#[instrument(skip(bytes), level = "debug")]
pub fn decode(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let pos = Rc::new(Cell::new(0usize));
    let counting = CountingReader {
        data: bytes,
        pos: Rc::clone(&pos),
    };
    let remaining = RemainingBytes {
        total_len: bytes.len(),
        pos: Rc::clone(&pos),
    };
    let mut reader = counting.bytes().peekable();
    let value = decode_next(&mut reader, 0, &remaining)?;
    Ok((value, pos.get()))
}

/// Decodes a bencode string from the input stream.
///
/// This function reads a bencode string in the format `<length>:<data>` where:
/// - `<length>` is a decimal number indicating the length of the string
/// - `<data>` is the actual string data of the specified length
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
///
/// # Returns
/// * `Result<Vec<u8>>` - The decoded string as a byte vector, or an error if:
///   - The length prefix is invalid or missing
///   - The input ends unexpectedly
///   - An I/O error occurs
///
/// # Example
/// For input "5:hello", this function will return a Vec<u8> containing [104, 101, 108, 108, 111]

#[instrument(skip(reader, remaining), level = "trace")]
pub fn decode_string<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    remaining: &RemainingBytes,
) -> BencodeResult<Vec<u8>> {
    let length_str = read_until(reader, b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    // Reject before allocating: a declared length longer than the bytes
    // actually left in the input is malformed, not merely truncated, and
    // must not be handed to `Vec` as a fresh allocation request (an
    // adversarial length like `99999999999999:x` would otherwise trigger a
    // capacity overflow panic or an allocator abort).
    if length > remaining.get() {
        return Err(BencodeError::InvalidFormat(format!(
            "string length {length} exceeds {} remaining input bytes",
            remaining.get()
        )));
    }

    let mut string_bytes = vec![0; length];
    for i in 0..length {
        string_bytes[i] = reader
            .next()
            .ok_or(BencodeError::UnexpectedEOI)?
            .map_err(|e| BencodeError::Io(e.kind().into()))?;
    }
    Ok(string_bytes)
}

/// Reads bytes from the reader until a specified delimiter is encountered.
///
/// This function reads bytes one at a time from the input stream until it finds
/// the specified delimiter byte. It collects all bytes read (excluding the delimiter)
/// into a buffer and returns them as a UTF-8 string.
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
/// * `delimiter` - The byte value that marks the end of the reading
///
/// # Returns
/// * `Result<String>` - The collected bytes as a UTF-8 string, or an error if:
///   - The input ends unexpectedly
///   - An I/O error occurs
///   - The collected bytes are not valid UTF-8

#[instrument(skip(reader), level = "trace")]
pub fn read_until<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    delimiter: u8,
) -> BencodeResult<String> {
    let mut buffer = Vec::new();

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == delimiter {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        } else {
            buffer.push(
                reader
                    .next()
                    .ok_or(BencodeError::UnexpectedEOI)?
                    .map_err(|e| BencodeError::Io(e.kind().into()))?,
            );
        }
    }

    String::from_utf8(buffer).map_err(|e| {
        BencodeError::InvalidFormat(format!("Non-UTF8 characters in length/integer: {}", e))
    })
}

/// Decodes a bencode integer from the input stream.
///
/// This function reads a bencode integer in the format `i<number>e` where:
/// - `i` is the literal character 'i' marking the start of an integer
/// - `<number>` is the actual integer value
/// - `e` is the literal character 'e' marking the end of the integer
///
/// The function performs several validations:
/// - Ensures the integer starts with 'i'
/// - Rejects leading zeros (except for single '0')
/// - Rejects "-0" as invalid
/// - Rejects empty integers
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
///
/// # Returns
/// * `Result<i64>` - The decoded integer value, or an error if:
///   - The format is invalid
///   - The integer value is invalid
///   - The input ends unexpectedly
///   - An I/O error occurs
///
/// # Example
/// For input "i42e", this function will return Ok(42)

#[instrument(skip(reader), level = "trace")]
pub fn decode_integer<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<i64> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    if first_byte != b'i' {
        return Err(BencodeError::InvalidFormat(
            "Integer must start with 'i'".to_string(),
        ));
    }

    let num_str = read_until(reader, b'e')?;

    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }

    num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list from the input stream.
///
/// This function reads a bencode list in the format `l<items>e` where:
/// - `l` is the literal character 'l' marking the start of a list
/// - `<items>` is a sequence of bencode values (integers, strings, lists, or dictionaries)
/// - `e` is the literal character 'e' marking the end of the list
///
/// The function recursively decodes each item in the list using `decode_next()`.
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
///
/// # Returns
/// * `Result<Vec<BencodeValue>>` - A vector of decoded bencode values, or an error if:
///   - The format is invalid
///   - Any item in the list fails to decode
///   - The input ends unexpectedly
///   - An I/O error occurs
///
/// # Example
/// For input "li42ei-1ee", this function will return Ok(vec![Integer(42), Integer(-1)])

#[instrument(skip(reader, remaining), level = "trace")]
fn decode_list<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    depth: usize,
    remaining: &RemainingBytes,
) -> BencodeResult<Vec<BencodeValue>> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;
    if first_byte != b'l' {
        return Err(BencodeError::InvalidFormat(
            "List must start with 'l'".to_string(),
        ));
    }

    let mut list = Vec::new();

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == b'e' {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        }

        let item = decode_next(reader, depth + 1, remaining)?;
        list.push(item);
    }

    Ok(list)
}

/// Decodes a bencode dictionary from the input stream.
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
///
/// # Returns
/// * `Result<HashMap<Vec<u8>, BencodeValue>>` - A hashmap containing the decoded key-value pairs, or an error if:
///   - The format is invalid (doesn't start with 'd')
///   - Any key or value fails to decode
///   - The input ends unexpectedly
///   - An I/O error occurs
///
/// # Example
/// For input "d3:keyi42ee", this function will return Ok({ "key" => Integer(42) })
///
/// # Format
/// Dictionaries in bencode format start with 'd' and end with 'e'. Keys must be strings,
/// and values can be any valid bencode value. Keys must be sorted in lexicographical order.
#[instrument(skip(reader, remaining), level = "trace")]
fn decode_dict<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    depth: usize,
    remaining: &RemainingBytes,
) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    if first_byte != b'd' {
        return Err(BencodeError::InvalidFormat(
            "Dictionary must start with 'd'".to_string(),
        ));
    }

    let mut dict = HashMap::new();

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == b'e' {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        }

        let key = decode_string(reader, remaining)?;

        let value = decode_next(reader, depth + 1, remaining)?;

        dict.insert(key, value);
    }

    Ok(dict)
}

#[instrument(skip(reader, remaining), level = "trace")]
fn decode_next<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    depth: usize,
    remaining: &RemainingBytes,
) -> BencodeResult<BencodeValue> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::MaxDepthExceeded(MAX_DEPTH));
    }

    let &first_byte = reader
        .peek()
        .ok_or(BencodeError::UnexpectedEOI)?
        .as_ref()
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    match first_byte {
        b'0'..=b'9' => decode_string(reader, remaining).map(BencodeValue::String),
        b'i' => decode_integer(reader).map(BencodeValue::Integer),
        b'l' => decode_list(reader, depth, remaining).map(BencodeValue::List),
        b'd' => decode_dict(reader, depth, remaining).map(BencodeValue::Dict),
        _ => Err(BencodeError::InvalidFormat(format!(
            "Unexpected character: {}",
            first_byte as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        let (value, consumed) = decode(b"5:hello").unwrap();
        assert_eq!(value, BencodeValue::String(b"hello".to_vec()));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn decodes_negative_integer() {
        let (value, _) = decode(b"i-42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-42));
    }

    #[test]
    fn decodes_list() {
        let (value, _) = decode(b"l5:helloi52ee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::String(b"hello".to_vec()),
                BencodeValue::Integer(52),
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let (value, _) = decode(b"d3:foo3:bar5:helloi52ee").unwrap();
        let BencodeValue::Dict(dict) = value else {
            panic!("expected a dict");
        };
        assert_eq!(
            dict.get(b"foo".as_slice()),
            Some(&BencodeValue::String(b"bar".to_vec()))
        );
        assert_eq!(
            dict.get(b"hello".as_slice()),
            Some(&BencodeValue::Integer(52))
        );
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(matches!(
            decode(b"i012e"),
            Err(BencodeError::InvalidInteger)
        ));
    }

    #[test]
    fn rejects_negative_zero_integer() {
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_truncated_string() {
        // The declared length (10) exceeds the 5 bytes actually left after
        // the colon, so this is caught as malformed before any read is
        // attempted, rather than surfacing as an I/O-level EOI.
        assert!(matches!(
            decode(b"10:short"),
            Err(BencodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_string_length_exceeding_remaining_input_without_allocating() {
        // A declared length many times larger than any real input must be
        // rejected up front; previously this allocated `vec![0; length]`
        // before checking anything, which panics or aborts the process for
        // an adversarial length like this one.
        let input = b"99999999999999999:x";
        assert!(matches!(
            decode(input),
            Err(BencodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn multi_digit_string_length_consumes_exact_byte_count() {
        let input = [b"12:", &[b'a'; 12][..], b"i1e"].concat();
        let (value, consumed) = decode(&input).unwrap();
        assert_eq!(value, BencodeValue::String(vec![b'a'; 12]));
        assert_eq!(consumed, 3 + 12);
    }

    #[test]
    fn rejects_nesting_past_max_depth() {
        let mut input = "l".repeat(MAX_DEPTH + 2);
        input.push_str(&"e".repeat(MAX_DEPTH + 2));
        assert!(matches!(
            decode(input.as_bytes()),
            Err(BencodeError::MaxDepthExceeded(_))
        ));
    }
}
