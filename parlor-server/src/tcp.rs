//! Plain TCP front end.
//!
//! Each connection is line oriented: the client is asked for a name (and
//! the passphrase, when one is configured), admitted by the [`Host`], and
//! then every further line is chat input. TCP clients present no public
//! key, so a server in whitelist mode only admits them by passphrase.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use parlor::conn::{LineTerminal, Peer, Terminal, TerminalError};
use parlor::host::Host;

/// Client version reported for TCP sessions.
pub const CLIENT_VERSION: &str = "parlor-tcp";

/// Binds `addr` and serves clients into `host` from a spawned task.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn start_server(
    addr: &str,
    host: Arc<Host>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let handle = tokio::spawn(accept_loop(listener, host));
    Ok((bound_addr, handle))
}

async fn accept_loop(listener: TcpListener, host: Arc<Host>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted connection");
                let host = Arc::clone(&host);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, addr, &host).await {
                        tracing::debug!(%addr, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, host: &Host) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut term = LineTerminal::new(BufReader::new(reader));

    let Some(name) = ask(&mut term, &mut writer, "Name: ").await? else {
        return Ok(());
    };
    let passphrase = if host.auth().accept_passphrase() {
        match ask(&mut term, &mut writer, "Passphrase: ").await? {
            Some(passphrase) => Some(passphrase),
            None => return Ok(()),
        }
    } else {
        None
    };

    let peer = Peer::new(name).with_addr(addr).with_client(CLIENT_VERSION);
    if let Err(e) = host.admit(&peer, passphrase.as_deref()) {
        writer.write_all(format!("Refused: {e}\r\n").as_bytes()).await?;
        writer.shutdown().await?;
        return Ok(());
    }

    if let Err(e) = host.connect(&peer, &mut term, writer).await {
        tracing::info!(%addr, error = %e, "session refused");
    }
    Ok(())
}

/// Writes `prompt` and reads one line. `None` means the client hung up.
async fn ask<R, W>(
    term: &mut LineTerminal<R>,
    writer: &mut W,
    prompt: &str,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin,
{
    writer.write_all(prompt.as_bytes()).await?;
    writer.flush().await?;
    match term.read_line().await {
        Ok(line) => Ok(Some(line.trim().to_string())),
        Err(TerminalError::Eof) => Ok(None),
        Err(TerminalError::Io(e)) => Err(e),
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
    }
}
