// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by a
// JSON-serialized message payload. Serialization happens here so both ends
// read and write typed messages directly off a blocking stream.
//
// A `MAX_MESSAGE_SIZE` constant (4 MB) protects against unbounded allocation
// from malformed length prefixes. The largest expected message is a
// `StateSync` carrying a full session state, which stays far below that.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum allowed message size (4 MB). Protects against unbounded
/// allocation from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Serialize a message and write it length-delimited: 4-byte big-endian
/// length, then JSON payload.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message and deserialize it.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message, `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE` or the
/// payload does not decode (a protocol-version mismatch surfaces here).
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_string_message() {
        let original = String::from("hello, authority!");
        let mut buf = Vec::new();
        write_message(&mut buf, &original).unwrap();

        let mut cursor = Cursor::new(&buf);
        let recovered: String = read_message(&mut cursor).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn rejects_oversized_read() {
        // Craft a length prefix that exceeds MAX_MESSAGE_SIZE.
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_message::<_, String>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        // Only 2 bytes when 4 are needed for the length prefix.
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_message::<_, String>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn undecodable_payload_is_invalid_data() {
        // A frame whose payload is not the expected type.
        let mut buf = Vec::new();
        write_message(&mut buf, &42u32).unwrap();
        let mut cursor = Cursor::new(&buf);
        let err = read_message::<_, String>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn multiple_messages_in_sequence() {
        let messages = [String::from("first"), "second".into(), "third".into()];
        let mut buf = Vec::new();
        for msg in &messages {
            write_message(&mut buf, msg).unwrap();
        }

        let mut cursor = Cursor::new(&buf);
        for expected in &messages {
            let recovered: String = read_message(&mut cursor).unwrap();
            assert_eq!(&recovered, expected);
        }
    }
}
