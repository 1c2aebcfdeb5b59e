use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::ConnectionId;

const READ_CHUNK: usize = 16 * 1024;

/// Everything the network tasks report to the engine task.
pub(crate) enum NetEvent {
    Accepted {
        stream: TcpStream,
        address: SocketAddr,
    },
    Data {
        conn: ConnectionId,
        bytes: Bytes,
    },
    Closed {
        conn: ConnectionId,
    },
    Datagram {
        from: SocketAddr,
        bytes: Bytes,
    },
}

/// Pump one connection until either side closes.
///
/// Inbound bytes go to the engine unframed; the engine reassembles frames.
/// The loop ends when the peer closes, a socket error occurs, or the engine
/// drops the write queue. A `Closed` event is always sent on the way out.
pub(crate) async fn run(
    conn: ConnectionId,
    stream: TcpStream,
    mut out_rx: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<NetEvent>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            // outbound writer
            maybe_out = out_rx.recv() => {
                let Some(bytes) = maybe_out else { break; };
                if let Err(e) = wr.write_all(&bytes).await {
                    debug!(%conn, error = %e, "write failed");
                    break;
                }
            }

            // inbound reader
            read = rd.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let bytes = buf.split().freeze();
                        buf.reserve(READ_CHUNK);
                        if events.send(NetEvent::Data { conn, bytes }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%conn, error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = wr.shutdown().await;
    let _ = events.send(NetEvent::Closed { conn }).await;
}
