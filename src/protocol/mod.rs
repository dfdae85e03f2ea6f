//! Handler command protocol.
//!
//! Handlers write commands to file descriptor 3:
//!
//! ```text
//! PUB <topic> <qos> <length>\n<payload>[\n]
//! KILL <topic>\n
//! ```
//!
//! Keywords are case-insensitive. `<qos>` is 0 to 3 and `<length>` is the
//! exact number of payload bytes that follow, so payloads may contain any
//! byte including newlines. The newline after a payload is optional.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Highest QoS accepted in a `PUB` command.
pub const MAX_QOS: u8 = 3;

const PUB_KEYWORD: &str = "PUB";
const KILL_KEYWORD: &str = "KILL";

/// Errors that can occur while reading handler commands.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid command ({0})")]
    UnknownCommand(String),

    #[error("can't parse {field}: unexpected end of stream")]
    UnexpectedEof { field: &'static str },

    #[error("can't parse {field}: not valid UTF-8")]
    NotUtf8 { field: &'static str },

    #[error("can't parse topic: empty topic")]
    EmptyTopic,

    #[error("can't parse QoS: {0:?}")]
    UnparsableQos(String),

    #[error("invalid QoS: {0}")]
    InvalidQos(i64),

    #[error("can't parse payload length: {0:?}")]
    InvalidLength(String),

    #[error("payload too short: expected {expected}, got {got}")]
    ShortPayload { expected: usize, got: usize },

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A command emitted by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish a message on behalf of the handler.
    Publish { topic: String, qos: u8, payload: Bytes },
    /// Kill the other handlers running for a topic.
    Kill { topic: String },
}

impl Command {
    /// Wire encoding, including the optional newline after a payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Publish {
                topic,
                qos,
                payload,
            } => {
                let mut out =
                    format!("{} {} {} {}\n", PUB_KEYWORD, topic, qos, payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out.push(b'\n');
                out
            }
            Command::Kill { topic } => format!("{} {}\n", KILL_KEYWORD, topic).into_bytes(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Publish {
                topic,
                qos,
                payload,
            } => write!(
                f,
                "{} {} {}: {}",
                PUB_KEYWORD,
                topic,
                qos,
                String::from_utf8_lossy(payload)
            ),
            Command::Kill { topic } => write!(f, "{} {}", KILL_KEYWORD, topic),
        }
    }
}

/// Incremental command parser over a handler's pipe.
///
/// Reads block until a full command is available; payloads split across
/// several pipe writes are reassembled.
pub struct ProtoReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> ProtoReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Give back the underlying stream. Bytes already buffered are lost.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Read the next command.
    ///
    /// Returns `Ok(None)` when the handler closed its end of the pipe
    /// between commands. Any error leaves the stream in an unknown
    /// position; callers should stop reading.
    pub async fn next_command(&mut self) -> Result<Option<Command>, ProtoError> {
        let Some(keyword) = self.read_field(b' ', "command").await? else {
            return Ok(None);
        };
        let keyword = keyword.trim().to_ascii_uppercase();

        if keyword.is_empty() {
            // Only whitespace before end of stream
            return Ok(None);
        }

        match keyword.as_str() {
            PUB_KEYWORD => self.read_publish().await.map(Some),
            KILL_KEYWORD => self.read_kill().await.map(Some),
            _ => Err(ProtoError::UnknownCommand(keyword)),
        }
    }

    async fn read_publish(&mut self) -> Result<Command, ProtoError> {
        let topic = self.read_topic(b' ').await?;

        let qos_field = self.read_required(b' ', "QoS").await?;
        let qos = parse_qos(qos_field.trim())?;

        let length_field = self.read_required(b'\n', "payload length").await?;
        let length = length_field
            .trim()
            .parse::<usize>()
            .map_err(|_| ProtoError::InvalidLength(length_field.trim().to_string()))?;

        let mut payload = Vec::new();
        (&mut self.reader)
            .take(length as u64)
            .read_to_end(&mut payload)
            .await?;
        if payload.len() < length {
            return Err(ProtoError::ShortPayload {
                expected: length,
                got: payload.len(),
            });
        }

        // Drop the optional newline if it already arrived. Waiting for it
        // would hold back the command until the handler writes again; a
        // late newline is trimmed with the next keyword instead.
        if self.reader.buffer().first() == Some(&b'\n') {
            self.reader.consume(1);
        }

        Ok(Command::Publish {
            topic,
            qos,
            payload: Bytes::from(payload),
        })
    }

    async fn read_kill(&mut self) -> Result<Command, ProtoError> {
        let topic = self.read_topic(b'\n').await?;
        Ok(Command::Kill { topic })
    }

    async fn read_topic(&mut self, delimiter: u8) -> Result<String, ProtoError> {
        let topic = self.read_required(delimiter, "topic").await?;
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ProtoError::EmptyTopic);
        }
        Ok(topic.to_string())
    }

    /// Read a field that must be terminated by `delimiter`.
    async fn read_required(
        &mut self,
        delimiter: u8,
        field: &'static str,
    ) -> Result<String, ProtoError> {
        match self.read_field(delimiter, field).await? {
            Some(value) if value.ends_with(delimiter as char) => Ok(value),
            _ => Err(ProtoError::UnexpectedEof { field }),
        }
    }

    /// Read up to and including `delimiter`, or to end of stream.
    ///
    /// Returns `None` if the stream ended before any byte was read.
    async fn read_field(
        &mut self,
        delimiter: u8,
        field: &'static str,
    ) -> Result<Option<String>, ProtoError> {
        let mut buf = Vec::new();
        if self.reader.read_until(delimiter, &mut buf).await? == 0 {
            return Ok(None);
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| ProtoError::NotUtf8 { field })
    }
}

fn parse_qos(field: &str) -> Result<u8, ProtoError> {
    let qos: i64 = field
        .parse()
        .map_err(|_| ProtoError::UnparsableQos(field.to_string()))?;
    match u8::try_from(qos) {
        Ok(qos) if qos <= MAX_QOS => Ok(qos),
        _ => Err(ProtoError::InvalidQos(qos)),
    }
}

#[cfg(test)]
mod tests;
