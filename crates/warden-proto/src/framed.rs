use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The peer closed the stream (clean EOF).
    #[error("link closed")]
    Closed,
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A line arrived that is not valid JSON. The stream itself is still
    /// usable; the caller decides whether to keep reading.
    #[error("invalid json frame: {0}")]
    Parse(serde_json::Error),
    #[error("encode message: {0}")]
    Encode(serde_json::Error),
}

impl LinkError {
    pub fn is_parse(&self) -> bool {
        matches!(self, LinkError::Parse(_))
    }
}

/// Newline-framed JSON messages over a TCP stream, buffered both ways.
///
/// `send` and `recv` take `&self`: the writer mutex makes each send atomic
/// per message under concurrent senders, the reader mutex keeps `recv` a
/// single-consumer operation.
pub struct FramedLink {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
}

impl FramedLink {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), LinkError> {
        let mut buf = serde_json::to_vec(msg).map_err(LinkError::Encode)?;
        buf.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Message, LinkError> {
        let mut line = String::new();
        let mut reader = self.reader.lock().await;
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        serde_json::from_str(&line).map_err(LinkError::Parse)
    }
}
