use byteorder::{BigEndian, ByteOrder};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ProtocolError, ProtocolSession, Request, Response};
use crate::source::BlockLog;

/// Largest frame either side may send.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed frame. `None` means the peer closed the connection
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = BigEndian::read_u32(&len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            length,
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = vec![0u8; length];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            length: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, body.len() as u32);
    writer.write_all(&len_buf).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Accepts consumer connections until `shutdown` fires, one session per connection.
pub async fn serve(
    listener: TcpListener,
    log: Arc<dyn BlockLog>,
    members: Vec<String>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(event = "protocol_server_started", addr = %local_addr, "raw protocol server listening");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session = ProtocolSession::new(log.clone(), members.clone())
                    .with_holder(format!("protocol consumer {peer}"));
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, session, shutdown).await {
                        warn!(
                            event = "protocol_connection_failed",
                            peer = %peer,
                            error = %err,
                            "protocol connection ended with an error"
                        );
                    }
                });
            }
            Err(err) => error!(event = "protocol_accept_failed", error = %err, "failed to accept connection"),
        }
    }

    info!(event = "protocol_server_stopped", addr = %local_addr, "raw protocol server stopped");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut session: ProtocolSession,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError> {
    debug!(event = "protocol_connection_opened", peer = %peer, "consumer connected");

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut stream) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(event = "protocol_connection_closed", peer = %peer, "consumer disconnected");
                break;
            }
            Err(err @ ProtocolError::FrameTooLarge { .. }) => {
                let response = Response::ProtocolError {
                    message: err.to_string(),
                };
                session.close();
                write_frame(&mut stream, &response).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => session.handle(request).await,
            Err(err) => {
                session.close();
                Response::ProtocolError {
                    message: format!("malformed request: {err}"),
                }
            }
        };
        write_frame(&mut stream, &response).await?;
    }

    // Outstanding blocks are requeued when the session drops.
    Ok(())
}
