//! DAP wire framing: `Content-Length` headers + CRLF, over stdio or TCP.
//!
//! Strictly a convenience for hosts; the session consumes parsed values and
//! never touches a transport itself.

use crate::dap::MessageSink;
use anyhow::anyhow;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Stdin, Stdout, Write};
use std::net::TcpStream;

/// A framed DAP byte stream.
pub trait DapTransport: Send {
    /// Read a single DAP message (with Content-Length framing).
    fn read_message(&mut self) -> anyhow::Result<Value>;

    /// Write a single DAP message (with Content-Length framing).
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()>;
}

impl<T: DapTransport> MessageSink for T {
    fn send(&mut self, message: &Value) -> anyhow::Result<()> {
        self.write_message(message)
    }
}

fn read_framed(reader: &mut impl BufRead) -> anyhow::Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(anyhow!("DAP connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse()?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

fn write_framed(writer: &mut impl Write, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Stdio transport, for adapters spawned directly by the front-end.
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: Stdout,
}

impl StdioTransport {
    pub fn new() -> StdioTransport {
        StdioTransport {
            reader: BufReader::new(std::io::stdin()),
            writer: std::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DapTransport for StdioTransport {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        read_framed(&mut self.reader)
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        write_framed(&mut self.writer, message)
    }
}

/// TCP transport, for adapters running in server mode.
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> anyhow::Result<TcpTransport> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(TcpTransport { stream, reader })
    }
}

impl DapTransport for TcpTransport {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        read_framed(&mut self.reader)
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        write_framed(&mut self.stream, message)
    }
}
