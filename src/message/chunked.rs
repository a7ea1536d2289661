//! Chunked transfer-coding helpers.

use bytes::{Bytes, BytesMut};

use super::{HeaderCollection, Reader};
use crate::{Error, Result};

/// Number of chunks produced by [`create_many_big_chunks`].
pub const MANY_CHUNKS: usize = 8;

/// Size from a chunk-size line such as `1a;name=value\r\n`.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = String::from_utf8_lossy(line);
    let size = text.trim_end_matches(['\r', '\n']).split(';').next().unwrap_or_default().trim();
    let bad_size = || Error::parse(format!("Error in chunked body: bad chunk size {:?}", size));
    // from_str_radix would also take a sign.
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad_size());
    }
    usize::from_str_radix(size, 16).map_err(|_| bad_size())
}

/// Consumes the line end that must follow chunk data.
pub(crate) fn read_eol<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8]> {
    match reader.peek(2) {
        b"\r\n" => Ok(reader.read(2)),
        [b'\n', ..] => Ok(reader.read(1)),
        b"" | b"\r" => Err(Error::incomplete("Incomplete chunk in chunked body")),
        _ => Err(Error::parse("Error in chunked body: chunk data longer than its size")),
    }
}

/// Splits a complete chunked body into its payload and trailer.
pub fn decode_chunked(data: &[u8]) -> Result<(Bytes, HeaderCollection)> {
    let mut reader = Reader::new(data);
    let mut payload = BytesMut::new();
    loop {
        let line = reader.read_line();
        if line.last() != Some(&b'\n') {
            return Err(Error::incomplete("Incomplete chunk size line."));
        }
        let size = parse_chunk_size(line)?;
        if size == 0 {
            break;
        }
        let chunk = reader.read(size);
        if chunk.len() < size {
            return Err(Error::incomplete("Incomplete chunk in chunked body"));
        }
        payload.extend_from_slice(chunk);
        read_eol(&mut reader)?;
    }
    // A message body stops after the last chunk when its trailer is kept
    // apart, so the input may end there.
    let trailer = match reader.peek(2) {
        b"" | b"\r\n" | [b'\n', ..] => HeaderCollection::new(),
        b"\r" => return Err(Error::incomplete("Incomplete last CRLF in chunked body.")),
        _ => HeaderCollection::parse(&mut reader, false)?,
    };
    Ok((payload.freeze(), trailer))
}

/// Encodes `data` as `chunk_size` sized chunks followed by the last chunk
/// and the final CRLF.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Bytes {
    let mut out = BytesMut::new();
    for chunk in data.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out.freeze()
}

/// A chunked body carrying `size` bytes of `x` in one chunk.
pub fn create_one_big_chunk(size: usize) -> String {
    format!("{:x}\r\n{}\r\n0\r\n\r\n", size, "x".repeat(size))
}

/// A chunked body carrying `size` bytes of `x` split into eight chunks; the
/// last chunk takes the remainder. Below eight bytes every chunk is one byte,
/// so there are `size` of them.
pub fn create_many_big_chunks(size: usize) -> String {
    let count = MANY_CHUNKS.min(size);
    let mut out = String::new();
    if count > 0 {
        let base = size / count;
        for i in 0..count {
            let len = if i == count - 1 { size - base * (count - 1) } else { base };
            out.push_str(&format!("{:x}\r\n{}\r\n", len, "x".repeat(len)));
        }
    }
    out.push_str("0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_big_chunk_dechunks_to_size() {
        let (payload, trailer) = decode_chunked(create_one_big_chunk(3000).as_bytes()).unwrap();
        assert_eq!(payload.len(), 3000);
        assert!(payload.iter().all(|&b| b == b'x'));
        assert!(trailer.is_empty());
    }

    #[test]
    fn test_many_big_chunks_dechunks_to_size() {
        for size in [8, 1000, 65537] {
            let body = create_many_big_chunks(size);
            let chunks = body.matches("\r\nx").count();
            assert_eq!(chunks, MANY_CHUNKS);
            let (payload, _) = decode_chunked(body.as_bytes()).unwrap();
            assert_eq!(payload.len(), size);
        }
    }

    #[test]
    fn test_many_big_chunks_below_eight_bytes() {
        for size in 1..MANY_CHUNKS {
            let body = create_many_big_chunks(size);
            assert_eq!(body.matches("1\r\nx\r\n").count(), size);
            assert_eq!(decode_chunked(body.as_bytes()).unwrap().0.len(), size);
        }
        assert_eq!(create_many_big_chunks(0), "0\r\n\r\n");
    }

    #[test]
    fn test_encode_chunked() {
        let encoded = encode_chunked(b"abcde", 2);
        assert_eq!(&encoded[..], b"2\r\nab\r\n2\r\ncd\r\n1\r\ne\r\n0\r\n\r\n");
        assert_eq!(&encode_chunked(b"", 4)[..], b"0\r\n\r\n");
    }

    #[test]
    fn test_decode_keeps_binary_payload() {
        let encoded = encode_chunked(b"a\r\nb\n\x00", 3);
        let (payload, _) = decode_chunked(&encoded).unwrap();
        assert_eq!(&payload[..], b"a\r\nb\n\x00");
    }

    #[test]
    fn test_decode_trailer() {
        let (payload, trailer) = decode_chunked(b"3\r\nabc\r\n0\r\nX-Token: 1\r\n\r\n").unwrap();
        assert_eq!(&payload[..], b"abc");
        assert_eq!(trailer.get("x-token"), Some("1"));

        for cut in [b"3\r\nabc\r\n0\r\nX-Token: 1\r\n" as &[u8], b"3\r\nabc\r\n0\r\nX-Token: 1\r\n\r", b"0\r\n\r"] {
            assert!(decode_chunked(cut).unwrap_err().is_incomplete(), "{:?}", cut);
        }
    }

    #[test]
    fn test_chunk_size_with_extension() {
        assert_eq!(parse_chunk_size(b"1A;foo=bar\r\n").unwrap(), 26);
        assert!(parse_chunk_size(b"-1\r\n").is_err());
        assert!(parse_chunk_size(b"+5\r\n").is_err());
        assert!(parse_chunk_size(b"\r\n").is_err());
    }
}
