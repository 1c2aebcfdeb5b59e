//! Tokio driver: one task per client owning the engine and both sockets.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use chanrelay_core::protocol::message::BinaryMessage;
use chanrelay_core::{ChannelId, ClientId, Delivery};

use crate::engine::{RelayClient, Transmit};
use crate::error::ClientError;
use crate::handlers::RelayClientHandlers;

/// UDPHello retry period while the datagram path is unconfirmed.
pub const UDP_HELLO_INTERVAL: Duration = Duration::from_millis(500);

const COMMAND_QUEUE: usize = 256;
const READ_CHUNK: usize = 16 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;

type Call<H> = Box<dyn FnOnce(&mut RelayClient<H>) + Send>;

/// Cloneable handle to a running client. Commands run on the driver task in
/// the order they were issued.
pub struct ClientHandle<H> {
    calls: mpsc::Sender<Call<H>>,
}

impl<H> Clone for ClientHandle<H> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
        }
    }
}

impl<H: RelayClientHandlers + Send + 'static> ClientHandle<H> {
    /// Run `f` against the engine, e.g. to read the channel mirror.
    pub async fn call<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&mut RelayClient<H>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call: Call<H> = Box::new(move |client| {
            let _ = tx.send(f(client));
        });
        self.calls.send(call).await.map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    async fn command<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut RelayClient<H>) -> Result<(), ClientError> + Send + 'static,
    {
        self.call(f).await?
    }

    pub async fn set_name(&self, name: impl Into<String>) -> Result<(), ClientError> {
        let name = name.into();
        self.command(move |c| c.set_name(&name)).await
    }

    pub async fn join(
        &self,
        name: impl Into<String>,
        hidden: bool,
        auto_close: bool,
    ) -> Result<(), ClientError> {
        let name = name.into();
        self.command(move |c| c.join(&name, hidden, auto_close))
            .await
    }

    pub async fn leave(&self, channel: ChannelId) -> Result<(), ClientError> {
        self.command(move |c| c.leave(channel)).await
    }

    pub async fn list_channels(&self) -> Result<(), ClientError> {
        self.command(|c| c.list_channels()).await
    }

    pub async fn send_server(&self, delivery: Delivery, message: BinaryMessage) -> Result<(), ClientError> {
        self.command(move |c| c.send_server(delivery, message))
            .await
    }

    pub async fn send_channel(
        &self,
        channel: ChannelId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<(), ClientError> {
        self.command(move |c| c.send_channel(channel, delivery, message))
            .await
    }

    pub async fn send_peer(
        &self,
        channel: ChannelId,
        peer: ClientId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<(), ClientError> {
        self.command(move |c| c.send_peer(channel, peer, delivery, message))
            .await
    }

    /// Close the connection. `on_disconnect` fires once the stream is down.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.call(|c| c.disconnect()).await
    }

    /// Resolves once the driver task has stopped.
    pub async fn closed(&self) {
        self.calls.closed().await
    }
}

/// Connect to a relay at `addr` and start the driver task.
///
/// Returns once the stream is connected and Connect has been queued; the
/// handshake completes in the background and is reported through
/// `on_connect` or `on_connection_denied`.
pub async fn connect<H>(addr: SocketAddr, handlers: H) -> Result<ClientHandle<H>, ClientError>
where
    H: RelayClientHandlers + Send + 'static,
{
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    // Same host address as the stream so the server can tie datagrams to it.
    let udp = UdpSocket::bind(SocketAddr::new(stream.local_addr()?.ip(), 0)).await?;

    let mut client = RelayClient::new(handlers);
    client.transport_connected();

    let (calls_tx, calls_rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(run(client, stream, udp, addr, calls_rx));

    Ok(ClientHandle { calls: calls_tx })
}

async fn run<H: RelayClientHandlers>(
    mut client: RelayClient<H>,
    stream: TcpStream,
    udp: UdpSocket,
    server: SocketAddr,
    mut calls_rx: mpsc::Receiver<Call<H>>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut dgram = vec![0u8; MAX_DATAGRAM];

    let mut hello_tick = interval(UDP_HELLO_INTERVAL);
    hello_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if !flush(&mut client, &mut wr, &udp, server).await {
            break;
        }

        tokio::select! {
            call = calls_rx.recv() => {
                // Every handle dropped: nobody can drive this client any more.
                let Some(call) = call else { break; };
                call(&mut client);
            }

            read = rd.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        client.receive(&buf);
                        buf.clear();
                    }
                    Err(e) => {
                        client.handlers_mut().on_error(&ClientError::from(e));
                        break;
                    }
                }
            }

            recv = udp.recv_from(&mut dgram) => {
                match recv {
                    Ok((n, from)) if from.ip() == server.ip() => {
                        client.receive_datagram(Bytes::copy_from_slice(&dgram[..n]));
                    }
                    Ok((_, from)) => debug!(%from, "datagram from unexpected source dropped"),
                    Err(e) => debug!(error = %e, "datagram receive failed"),
                }
            }

            _ = hello_tick.tick() => client.udp_tick(),
        }
    }

    let _ = wr.shutdown().await;
    client.transport_closed();
}

/// Write out everything the engine queued. Returns false once the stream
/// should be closed.
async fn flush<H: RelayClientHandlers>(
    client: &mut RelayClient<H>,
    wr: &mut OwnedWriteHalf,
    udp: &UdpSocket,
    server: SocketAddr,
) -> bool {
    while let Some(transmit) = client.poll_transmit() {
        match transmit {
            Transmit::Stream(bytes) => {
                if let Err(e) = wr.write_all(&bytes).await {
                    client.handlers_mut().on_error(&ClientError::from(e));
                    return false;
                }
            }
            Transmit::Datagram(bytes) => {
                if let Err(e) = udp.send_to(&bytes, server).await {
                    debug!(error = %e, "datagram not sent");
                }
            }
            Transmit::Close => return false,
        }
    }
    true
}
