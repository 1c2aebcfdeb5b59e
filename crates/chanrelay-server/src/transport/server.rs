use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use chanrelay_core::{RelayError, Result};

use crate::config::ServerSection;
use crate::engine::{ConnectionId, Outbox, RelayServer, RelayServerHandlers, ServerOptions};
use crate::obs::RelayMetrics;

use super::connection::{self, NetEvent};
use super::outbox::ChannelOutbox;

const EVENT_QUEUE: usize = 4096;
const CALL_QUEUE: usize = 256;
const WRITE_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 64 * 1024;

type Call<H> = Box<dyn FnOnce(&mut RelayServer<H, ChannelOutbox>) + Send>;

/// Handle to a running relay. Dropping it leaves the relay running until the
/// runtime shuts down; call [`RelayHandle::shutdown`] to stop it.
pub struct RelayHandle<H> {
    local_addr: SocketAddr,
    calls: mpsc::Sender<Call<H>>,
    stop: Option<oneshot::Sender<()>>,
    // Taken once the task has been awaited.
    task: Option<JoinHandle<Result<()>>>,
}

impl<H: RelayServerHandlers + Send + 'static> RelayHandle<H> {
    /// Bound address, shared by the stream listener and the datagram socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `f` on the engine task between events, e.g. to message clients or
    /// close channels from application code.
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RelayServer<H, ChannelOutbox>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call: Call<H> = Box::new(move |server| {
            let _ = tx.send(f(server));
        });
        self.calls.send(call).await.map_err(|_| not_running())?;
        rx.await.map_err(|_| not_running())
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Resolve when the relay stops without being asked to, which means a
    /// fatal engine error. Returns that error. Cancel safe.
    pub async fn stopped(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Err(not_running());
        };
        let result = join(task).await;
        self.task = None;
        result
    }

    /// Drop every client and stop serving. Returns the error that stopped
    /// the engine early, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(mut task) => join(&mut task).await,
            None => Ok(()),
        }
    }
}

async fn join(task: &mut JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|e| RelayError::Internal(format!("relay task failed: {e}")))?
}

fn not_running() -> RelayError {
    RelayError::Internal("relay engine is not running".into())
}

/// Bind the stream listener and the datagram socket on `cfg.listen` and start
/// serving. With port 0 the datagram socket takes the port the listener got.
pub async fn start<H>(
    cfg: &ServerSection,
    handlers: H,
    metrics: Arc<RelayMetrics>,
) -> Result<RelayHandle<H>>
where
    H: RelayServerHandlers + Send + 'static,
{
    let listener = TcpListener::bind(cfg.listen_addr()?).await?;
    let local_addr = listener.local_addr()?;
    let udp = Arc::new(UdpSocket::bind(local_addr).await?);

    let server = RelayServer::new(
        ServerOptions::from(cfg),
        handlers,
        ChannelOutbox::new(Arc::clone(&udp)),
    )
    .with_metrics(metrics);

    let (net_tx, net_rx) = mpsc::channel(EVENT_QUEUE);
    let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE);
    let (stop_tx, stop_rx) = oneshot::channel();

    let accept_task = tokio::spawn(accept_loop(listener, net_tx.clone()));
    let udp_task = tokio::spawn(datagram_loop(udp, net_tx.clone()));

    let engine = Engine {
        server,
        net_tx,
        next_conn: 0,
    };
    let ping_every = Duration::from_millis(cfg.ping_interval_ms);
    let task = tokio::spawn(async move {
        let result = engine.run(net_rx, calls_rx, stop_rx, ping_every).await;
        accept_task.abort();
        udp_task.abort();
        // Wait for the sockets to actually be dropped.
        let _ = accept_task.await;
        let _ = udp_task.await;
        result
    });

    info!(%local_addr, "relay listening");
    Ok(RelayHandle {
        local_addr,
        calls: calls_tx,
        stop: Some(stop_tx),
        task: Some(task),
    })
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%address, error = %e, "set_nodelay failed");
                }
                if events
                    .send(NetEvent::Accepted { stream, address })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn datagram_loop(udp: Arc<UdpSocket>, events: mpsc::Sender<NetEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let bytes = Bytes::copy_from_slice(&buf[..n]);
                if events
                    .send(NetEvent::Datagram { from, bytes })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => debug!(error = %e, "datagram receive failed"),
        }
    }
}

struct Engine<H> {
    server: RelayServer<H, ChannelOutbox>,
    net_tx: mpsc::Sender<NetEvent>,
    next_conn: u64,
}

impl<H: RelayServerHandlers + Send + 'static> Engine<H> {
    async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut calls_rx: mpsc::Receiver<Call<H>>,
        mut stop_rx: oneshot::Receiver<()>,
        ping_every: Duration,
    ) -> Result<()> {
        let mut ping_tick = interval_at(Instant::now() + ping_every, ping_every);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Set once the handle is gone without asking for a stop.
        let mut detached = false;

        let result = loop {
            tokio::select! {
                stop = &mut stop_rx, if !detached => match stop {
                    Ok(()) => break Ok(()),
                    Err(_) => {
                        debug!("relay handle dropped, serving until the runtime stops");
                        detached = true;
                    }
                },

                _ = ping_tick.tick() => self.server.ping_sweep(),

                Some(call) = calls_rx.recv() => call(&mut self.server),

                event = net_rx.recv() => {
                    let Some(event) = event else { break Ok(()); };
                    if let Err(e) = self.handle(event) {
                        error!(error = %e, class = e.class().as_str(), "fatal engine error, relay stopping");
                        break Err(e);
                    }
                }
            }
        };

        let dropped = self.server.disconnect_all();
        info!(clients = dropped, "relay stopped");
        result
    }

    fn handle(&mut self, event: NetEvent) -> Result<()> {
        match event {
            NetEvent::Accepted { stream, address } => {
                let conn = ConnectionId(self.next_conn);
                self.next_conn += 1;

                let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE);
                self.server.outbox_mut().register(conn, out_tx);
                self.server.accept(conn, address)?;
                tokio::spawn(connection::run(conn, stream, out_rx, self.net_tx.clone()));
                Ok(())
            }
            NetEvent::Data { conn, bytes } => self.server.receive(conn, &bytes),
            NetEvent::Closed { conn } => {
                self.server.disconnect(conn);
                self.server.outbox_mut().close(conn);
                Ok(())
            }
            NetEvent::Datagram { from, bytes } => self.server.receive_datagram(from, bytes),
        }
    }
}
