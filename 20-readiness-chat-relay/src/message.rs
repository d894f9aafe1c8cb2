use std::{
    fmt,
    io::{self, Read, Write},
};

/// Size of each non-blocking read while draining a connection.
const READ_CHUNK: usize = 1024;

/// Text captured from one drain of one connection.
///
/// There is no framing on the wire, so a message is simply whatever bytes
/// were available when the connection was read. It may hold several lines
/// the sender typed, or only part of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(String);

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Decodes accumulated bytes once, replacing invalid UTF-8 sequences.
    fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self(text),
            Err(err) => Self(String::from_utf8_lossy(err.as_bytes()).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of draining a non-blocking reader.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Everything that was readable, if anything was.
    pub message: Option<Message>,
    /// The peer reached end-of-stream during the drain.
    pub closed: bool,
}

/// Reads from `reader` until it reports `WouldBlock` or end-of-stream,
/// concatenating every chunk into a single message.
///
/// Any other error is returned as-is and the partial bytes are discarded.
pub fn read_available<R>(reader: &mut R) -> io::Result<Drained>
where
    R: Read + ?Sized,
{
    let mut accumulated = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut closed = false;

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => accumulated.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    let message = (!accumulated.is_empty()).then(|| Message::from_bytes(accumulated));
    Ok(Drained { message, closed })
}

/// Writes the UTF-8 bytes of `message` and flushes.
///
/// On a non-blocking socket a full send buffer shows up as `WouldBlock`;
/// nothing is retried.
pub fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: Write + ?Sized,
{
    writer.write_all(message.as_bytes())?;
    writer.flush()
}
