use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::{Error, LOAD_PROBE, LOAD_PROBE_TIMEOUT};

/// Persistent client connection to one module server. Workers cache one
/// client per `(host, port)` and drop the entry on any transport error.
pub struct ModuleClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ModuleClient {
    /// Open a connection to a module server.
    pub async fn connect(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(ModuleClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one module-call frame and await the single response frame.
    /// A JSON `null` reply maps to `None`.
    pub async fn call(&mut self, payload: &Value) -> Result<Option<Value>, Error> {
        let mut frame = serde_json::to_string(payload)?;
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await?;

        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        let value: Value = serde_json::from_str(line.trim_end())?;
        Ok(if value.is_null() { None } else { Some(value) })
    }
}

/// Probe one server's load with the fixed 250 ms budget. Connection timeout,
/// refusal, or a non-numeric reply all mean "skip this server" and come back
/// as `None`.
pub async fn probe_load(host: &str, port: u16) -> Option<f64> {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(LOAD_PROBE.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let _ = reader.read_line(&mut line).await?;
        Ok::<String, std::io::Error>(line)
    };
    match timeout(LOAD_PROBE_TIMEOUT, attempt).await {
        Ok(Ok(line)) => match line.trim().parse::<f64>() {
            Ok(load) => Some(load),
            Err(_) => {
                debug!(host, port, reply = line.trim(), "non-numeric load reply");
                None
            }
        },
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "load probe failed");
            None
        }
        Err(_) => {
            debug!(host, port, "load probe timed out");
            None
        }
    }
}
