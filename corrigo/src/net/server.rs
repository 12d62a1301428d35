use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info};

use crate::{Error, Module, LOAD_PROBE};

/// Run one module server: an accepting loop owning one loaded module
/// instance, servicing each accepted connection in an independent task.
/// Per-connection failures are logged and never terminate the server.
pub async fn serve(module: Arc<dyn Module>, addr: SocketAddr) -> Result<(), Error> {
    let listener = bind_reuseaddr(addr)?;
    info!(%addr, "module server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let module = Arc::clone(&module);
        let _ = tokio::spawn(async move {
            if let Err(e) = handle_connection(module, stream).await {
                error!(%peer, error = %e, "connection handler failed");
            }
        });
    }
}

fn bind_reuseaddr(addr: SocketAddr) -> Result<TcpListener, Error> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn handle_connection(module: Arc<dyn Module>, stream: TcpStream) -> Result<(), Error> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            debug!("client closed the connection");
            return Ok(());
        }
        let request = line.trim_end_matches('\n');

        let response = if request == LOAD_PROBE {
            format!("{}\n", module.server_load())
        } else {
            match handle_call(&module, request).await {
                Ok(Some(value)) => {
                    let mut frame = serde_json::to_string(&value)?;
                    frame.push('\n');
                    frame
                }
                Ok(None) => "null\n".into(),
                Err(e) => {
                    // contain the failure; the client sees a miss
                    let mut chain = format!("{e}");
                    let mut source = std::error::Error::source(&e);
                    while let Some(s) = source {
                        chain.push_str(&format!(": {s}"));
                        source = s.source();
                    }
                    error!(error = chain, "module call failed");
                    "null\n".into()
                }
            }
        };

        write_half.write_all(response.as_bytes()).await?;
    }
}

async fn handle_call(module: &Arc<dyn Module>, request: &str) -> Result<Option<Value>, Error> {
    let payload: Value = serde_json::from_str(request)?;
    module.run(payload).await
}
