use crate::config::RECV_BUFFER_LEN;
use crate::messages::{encode_frame, Message, MsgHeader, MsgOption};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Abstraction over the unreliable datagram substrate, introduced to
///  facilitate exercising the dispatch machinery against an in-memory socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Consulted once per received datagram before any decoding; dropping here
///  simulates wire loss for testing.
pub trait LossSimulator: Send + Sync + 'static {
    fn should_drop(&self) -> bool;
}

pub struct NoopLossSimulator;

impl LossSimulator for NoopLossSimulator {
    fn should_drop(&self) -> bool {
        false
    }
}

/// Drops each datagram independently with the configured probability, from a
///  seeded generator so test runs are reproducible.
pub struct RandomLossSimulator {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomLossSimulator {
    pub fn new(probability: f64, seed: u64) -> RandomLossSimulator {
        RandomLossSimulator {
            probability,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl LossSimulator for RandomLossSimulator {
    fn should_drop(&self) -> bool {
        self.rng.lock().unwrap().gen_bool(self.probability)
    }
}

/// One received datagram after header decode: the opaque options, the
///  piggybacked ack number, and the undecoded message body.
#[derive(Debug, Clone)]
pub struct Packet {
    pub options: Vec<MsgOption>,
    pub ack_number: u8,
    pub data: Bytes,
    pub remote_addr: SocketAddr,
}

/// Per-message-type receiver callback. Each datagram is dispatched in its own
///  task together with a write capability bound to the sender's address.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle(&self, reply: ResponseWriter, packet: Packet);
}

/// Write capability bound to one peer address.
#[derive(Clone)]
pub struct ResponseWriter {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
}

impl ResponseWriter {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_LEN);
        encode_frame(msg, &mut buf)?;
        self.socket.send_to(&buf, self.peer).await?;
        Ok(())
    }
}

/// The datagram endpoint: binds or dials, runs the receive loop that decodes
///  headers and fans datagrams out to the registered handlers, and offers a
///  send path for the dialed peer.
pub struct Connection {
    socket: Arc<dyn DatagramSocket>,
    handlers: FxHashMap<u8, Arc<dyn PacketHandler>>,
    loss_sim: Arc<dyn LossSimulator>,
    remote: Option<SocketAddr>,
    closing: AtomicBool,
    close_requested: Notify,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Bind a listening IPv4 UDP socket.
    pub async fn listen(host: &str) -> anyhow::Result<Connection> {
        let addr = lookup_host(host)
            .await?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| anyhow::anyhow!("no IPv4 address for '{}'", host))?;
        let socket = UdpSocket::bind(addr).await?;
        debug!("bound receive socket to {:?}", socket.local_addr()?);
        Ok(Self::from_socket(Arc::new(socket), None))
    }

    /// Bind an ephemeral socket and remember `host` as the send target.
    pub async fn connect_to(host: &str) -> anyhow::Result<Connection> {
        let remote = lookup_host(host)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("cannot resolve '{}'", host))?;
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::from_socket(Arc::new(socket), Some(remote)))
    }

    pub fn from_socket(socket: Arc<dyn DatagramSocket>, remote: Option<SocketAddr>) -> Connection {
        Connection {
            socket,
            handlers: FxHashMap::default(),
            loss_sim: Arc::new(NoopLossSimulator),
            remote,
            closing: AtomicBool::new(false),
            close_requested: Notify::new(),
            closed: watch::channel(false).0,
        }
    }

    pub fn addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register the handler for one message type. Datagrams of unregistered
    ///  types are logged and discarded.
    pub fn handle(&mut self, msg_type: u8, handler: Arc<dyn PacketHandler>) {
        self.handlers.insert(msg_type, handler);
    }

    pub fn set_loss_simulator(&mut self, sim: Arc<dyn LossSimulator>) {
        self.loss_sim = sim;
    }

    /// Send a message to the dialed peer.
    pub async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let remote = self
            .remote
            .ok_or_else(|| anyhow::anyhow!("connection has no dialed peer"))?;
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_LEN);
        encode_frame(msg, &mut buf)?;
        self.socket.send_to(&buf, remote).await?;
        Ok(())
    }

    /// The blocking receive loop. Returns cleanly after `close`, with an
    ///  error on unexpected socket failure. Every dispatched handler runs in
    ///  its own task; on close the loop waits for all of them to finish
    ///  before returning.
    pub async fn receive(&self) -> anyhow::Result<()> {
        let mut handler_tasks = JoinSet::new();
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        let result = loop {
            if self.closing.load(Ordering::SeqCst) {
                break Ok(());
            }

            let (num_read, from) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) => {
                        if self.closing.load(Ordering::SeqCst) {
                            break Ok(());
                        }
                        error!("socket error: {}", e);
                        break Err(e.into());
                    }
                },
                _ = self.close_requested.notified() => break Ok(()),
            };

            // reap finished handler tasks
            while handler_tasks.try_join_next().is_some() {}

            if self.loss_sim.should_drop() {
                trace!("loss simulator dropped datagram from {:?}", from);
                continue;
            }

            let mut parse_buf = &buf[..num_read];
            let header = match MsgHeader::deser(&mut parse_buf) {
                Ok(header) => header,
                Err(e) => {
                    // be liberal in what we accept: a garbled header costs
                    //  only this datagram
                    warn!("unparsable header from {:?} ({}) - dropping", from, e);
                    continue;
                }
            };

            if header.version != crate::messages::PROTOCOL_VERSION {
                debug!("unsupported protocol version {} from {:?} - dropping", header.version, from);
                continue;
            }

            let Some(handler) = self.handlers.get(&header.msg_type) else {
                debug!("no handler for message type {} - discarding", header.msg_type);
                continue;
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram", ?correlation_id);
            trace!(parent: &span, "dispatching type {} from {:?}, {} body bytes",
                header.msg_type, from, parse_buf.len());

            let handler = handler.clone();
            let writer = ResponseWriter {
                socket: self.socket.clone(),
                peer: from,
            };
            let packet = Packet {
                options: header.options,
                ack_number: header.ack_number,
                data: Bytes::copy_from_slice(parse_buf),
                remote_addr: from,
            };
            handler_tasks.spawn(
                async move { handler.handle(writer, packet).await }.instrument(span),
            );
        };

        while handler_tasks.join_next().await.is_some() {}
        self.closed.send(true).ok();
        result
    }

    /// Signal `receive` to return and wait for it (and all in-flight
    ///  handlers) up to `deadline`. On timeout the handlers keep running,
    ///  only the wait gives up.
    pub async fn close(&self, deadline: Duration) -> anyhow::Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            anyhow::bail!("connection already closed");
        }
        // notify_one leaves a stored permit, so the signal is not lost if the
        //  receive loop is mid-dispatch rather than parked in its select
        self.close_requested.notify_one();

        let mut closed = self.closed.subscribe();
        let result = tokio::time::timeout(deadline, closed.wait_for(|done| *done)).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => anyhow::bail!("timeout while closing connection"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::mpsc;

    /// In-memory stand-in for a UDP socket: datagrams are fed in and read
    ///  back out through channels.
    pub struct ChannelSocket {
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
        outgoing: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        local: SocketAddr,
    }

    pub struct ChannelSocketDriver {
        pub incoming: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        pub outgoing: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    }

    impl ChannelSocket {
        pub fn new(local: SocketAddr) -> (Arc<ChannelSocket>, ChannelSocketDriver) {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            (
                Arc::new(ChannelSocket {
                    incoming: tokio::sync::Mutex::new(in_rx),
                    outgoing: out_tx,
                    local,
                }),
                ChannelSocketDriver {
                    incoming: in_tx,
                    outgoing: out_rx,
                },
            )
        }
    }

    #[async_trait]
    impl DatagramSocket for ChannelSocket {
        async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            match self.incoming.lock().await.recv().await {
                Some((data, from)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from))
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "test socket closed",
                )),
            }
        }

        async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
            self.outgoing
                .send((buf.to_vec(), to))
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "driver gone"))?;
            Ok(buf.len())
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(self.local)
        }
    }
}
