//! Line-delimited transport for the MCP server.
//!
//! Each message is one line of UTF-8 JSON. Over stdio, stdin carries client
//! messages, stdout carries ours and stderr is left to logging.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Reads and writes newline-delimited JSON messages.
pub struct LineTransport<R, W> {
    reader: Lines<R>,
    writer: W,
}

/// The transport used by the binary.
pub type StdioTransport = LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdioTransport {
    /// Creates a transport over the process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a transport over any buffered reader and writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: reader.lines(),
            writer,
        }
    }

    /// Reads the next line without its terminator.
    ///
    /// Returns `None` at end of input. Cancel safe: a partly read line is
    /// kept for the next call, so this can race other branches in
    /// `tokio::select!`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.reader.next_line().await
    }

    /// Serialises `message` and writes it as one line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // serde_json escapes newlines inside strings
        debug_assert!(!json.contains('\n'));

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcResponse, RequestId};
    use serde_json::json;

    #[tokio::test]
    async fn reads_lines_without_terminators() {
        let input: &[u8] = b"first\r\nsecond\nlast";
        let mut transport = LineTransport::new(input, Vec::new());

        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(transport.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_one_line_per_message() {
        let mut transport = LineTransport::new(&b""[..], Vec::new());
        let response =
            JsonRpcResponse::success(RequestId::Number(1), json!({"text": "two\nlines"}));

        transport.write_message(&response).await.unwrap();

        let written = String::from_utf8(transport.writer).unwrap();
        assert_eq!(written.matches('\n').count(), 1);
        assert!(written.ends_with('\n'));
    }
}
