use crate::cleaner::Cleaner;
use crate::config::{DuplicateRequestPolicy, ServerConfig, CHUNK_LEN};
use crate::congestion::AimdRateController;
use crate::connection::{Connection, Packet, PacketHandler, ResponseWriter};
use crate::file_provider::{FileProvider, OpenOutcome, SourceFile};
use crate::messages::{
    ClientAck, ClientRequest, CloseConnection, CloseReason, FileDescriptor, Message,
    MetadataStatus, ServerMetadata, ServerPayload, MSG_CLIENT_ACK, MSG_CLIENT_REQUEST, MSG_CLOSE,
};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::max;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const ACK_CHANNEL_CAPACITY: usize = 1024;
const RESCHEDULE_CHANNEL_CAPACITY: usize = 1024;
/// Payload-bearing channels are sized so the producer effectively never waits
///  on the scheduler; backpressure comes from the rate controller.
const PAYLOAD_CHANNEL_CAPACITY: usize = 1 << 20;

/// Everything the router retains per live peer; the session's tasks own the
///  rest of the state.
struct Session {
    ack_tx: mpsc::Sender<ClientAck>,
    cleaner: Cleaner,
}

type SessionMap = Arc<Mutex<FxHashMap<String, Session>>>;

/// Sent payloads and metadata kept for retransmission. Written by the
///  scheduler, read by the rescheduler.
#[derive(Default)]
struct SessionCaches {
    payloads: Mutex<FxHashMap<u16, FxHashMap<u64, Arc<ServerPayload>>>>,
    metadata: Mutex<FxHashMap<u16, ServerMetadata>>,
}

impl SessionCaches {
    fn store_payload(&self, payload: &Arc<ServerPayload>) {
        self.payloads
            .lock()
            .unwrap()
            .entry(payload.file_index)
            .or_default()
            .insert(payload.offset, payload.clone());
    }

    fn payload(&self, file_index: u16, offset: u64) -> Option<Arc<ServerPayload>> {
        self.payloads
            .lock()
            .unwrap()
            .get(&file_index)
            .and_then(|per_file| per_file.get(&offset))
            .cloned()
    }

    fn store_metadata(&self, metadata: &ServerMetadata) {
        self.metadata
            .lock()
            .unwrap()
            .insert(metadata.file_index, metadata.clone());
    }

    fn metadata(&self, file_index: u16) -> Option<ServerMetadata> {
        self.metadata.lock().unwrap().get(&file_index).cloned()
    }

    /// Drop cached chunks the peer has positively acknowledged. Everything
    ///  below the high-water offset is contiguously received and can never be
    ///  requested again.
    fn evict_below(&self, file_index: u16, offset: u64) {
        if offset == 0 {
            return;
        }
        if let Some(per_file) = self.payloads.lock().unwrap().get_mut(&file_index) {
            per_file.retain(|&cached_offset, _| cached_offset >= offset);
        }
    }
}

/// The server router: owns the peer-keyed session map, spins up a session
///  per new ClientRequest and feeds acks and closes into the right one.
pub struct Server {
    provider: Arc<dyn FileProvider>,
    config: ServerConfig,
    sessions: SessionMap,
}

impl Server {
    pub fn new(provider: Arc<dyn FileProvider>, config: ServerConfig) -> anyhow::Result<Arc<Server>> {
        config.validate()?;
        Ok(Arc::new(Server {
            provider,
            config,
            sessions: Arc::new(Mutex::new(FxHashMap::default())),
        }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Register the protocol handlers on a connection. Split out of `listen`
    ///  so tests can run the server over an arbitrary socket.
    pub fn register_handlers(self: &Arc<Self>, conn: &mut Connection) {
        conn.handle(MSG_CLIENT_REQUEST, Arc::new(RequestHandler { server: self.clone() }));
        conn.handle(MSG_CLIENT_ACK, Arc::new(AckHandler { server: self.clone() }));
        conn.handle(MSG_CLOSE, Arc::new(CloseHandler { server: self.clone() }));
    }

    /// Bind `host` and run the receive loop until the connection is closed.
    pub async fn listen(self: &Arc<Self>, host: &str) -> anyhow::Result<()> {
        let mut conn = Connection::listen(host).await?;
        self.register_handlers(&mut conn);
        info!("running server on {:?}", conn.addr()?);
        conn.receive().await
    }

    /// Atomically create and start a session for `key`, or report that one
    ///  already exists. Session construction happens under the map lock so
    ///  two concurrently dispatched requests cannot both win.
    fn start_session(
        self: &Arc<Self>,
        key: String,
        request: ClientRequest,
        writer: ResponseWriter,
    ) -> bool {
        let file_count = request.files.len();

        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);
        let (resend_tx, resend_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);
        let (resend_done_tx, resend_done_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);
        let (metadata_tx, metadata_rx) = mpsc::channel(max(file_count, 1));
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (reschedule_tx, reschedule_rx) = mpsc::channel(RESCHEDULE_CHANNEL_CAPACITY);

        let caches = Arc::new(SessionCaches::default());

        // the cleanup callback reaches back only through the map handle and
        //  the peer key, not through the server
        let sessions = self.sessions.clone();
        let cleanup_key = key.clone();
        let cleaner = Cleaner::new(move || {
            let mut map = sessions.lock().unwrap();
            map.remove(&cleanup_key);
            info!("session {} closed, {} session(s) live", cleanup_key, map.len());
        });

        {
            let mut map = self.sessions.lock().unwrap();
            if map.contains_key(&key) {
                return false;
            }
            map.insert(key.clone(), Session { ack_tx, cleaner: cleaner.clone() });
        }
        info!(
            "new session {}: {} file(s), advertised rate {}",
            key, file_count, request.max_transmission_rate
        );

        cleaner.refresh(self.config.idle_timeout);
        cleaner.spawn_timeout_watch();

        let initial_rate = match request.max_transmission_rate {
            0 => self.config.initial_rate,
            advertised => self.config.initial_rate.min(advertised),
        };
        let rate = AimdRateController::with_rate(initial_rate);
        tokio::spawn(producer(
            self.provider.clone(),
            request.files,
            payload_tx,
            metadata_tx.clone(),
            cleaner.clone(),
        ));
        tokio::spawn(scheduler(
            writer,
            caches.clone(),
            cleaner.clone(),
            self.config.clone(),
            rate,
            payload_rx,
            metadata_rx,
            resend_rx,
            ack_rx,
            reschedule_tx,
            resend_done_tx,
        ));
        tokio::spawn(rescheduler(
            caches,
            cleaner,
            reschedule_rx,
            resend_done_rx,
            resend_tx,
            metadata_tx,
        ));
        true
    }
}

struct RequestHandler {
    server: Arc<Server>,
}

#[async_trait]
impl PacketHandler for RequestHandler {
    async fn handle(&self, reply: ResponseWriter, packet: Packet) {
        let mut body = packet.data.clone();
        let request = match ClientRequest::deser(&mut body) {
            Ok(request) => request,
            Err(e) => {
                warn!("unparsable request from {:?}: {}", packet.remote_addr, e);
                return;
            }
        };

        let key = packet.remote_addr.to_string();
        if self.server.start_session(key.clone(), request, reply.clone()) {
            return;
        }

        match self.server.config.duplicate_request_policy {
            DuplicateRequestPolicy::Ignore => {
                debug!("duplicate request from live session {} - ignoring", key);
            }
            DuplicateRequestPolicy::CloseUnknownRequest => {
                debug!("duplicate request from live session {} - rejecting", key);
                let close = Message::Close(CloseConnection {
                    reason: CloseReason::UnknownRequest,
                });
                if let Err(e) = reply.send(&close).await {
                    warn!("failed to reject duplicate request from {}: {}", key, e);
                }
            }
        }
    }
}

struct AckHandler {
    server: Arc<Server>,
}

#[async_trait]
impl PacketHandler for AckHandler {
    async fn handle(&self, _reply: ResponseWriter, packet: Packet) {
        let mut body = packet.data.clone();
        let ack = match ClientAck::deser(packet.ack_number, &mut body) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("unparsable ack from {:?}: {}", packet.remote_addr, e);
                return;
            }
        };

        let key = packet.remote_addr.to_string();
        let ack_tx = self
            .server
            .sessions
            .lock()
            .unwrap()
            .get(&key)
            .map(|session| session.ack_tx.clone());

        match ack_tx {
            Some(tx) => {
                tx.send(ack).await.ok();
            }
            None => debug!("ack from {} without a session - dropping", key),
        }
    }
}

struct CloseHandler {
    server: Arc<Server>,
}

#[async_trait]
impl PacketHandler for CloseHandler {
    async fn handle(&self, _reply: ResponseWriter, packet: Packet) {
        let mut body = packet.data.clone();
        let close = match CloseConnection::deser(&mut body) {
            Ok(close) => close,
            Err(e) => {
                warn!("unparsable close from {:?}: {}", packet.remote_addr, e);
                return;
            }
        };

        let key = packet.remote_addr.to_string();
        info!("peer {} closed the connection: {}", key, close.reason);

        let cleaner = self
            .server
            .sessions
            .lock()
            .unwrap()
            .get(&key)
            .map(|session| session.cleaner.clone());
        if let Some(cleaner) = cleaner {
            cleaner.close();
        }
    }
}

async fn send_or_close<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    close_rx: &mut mpsc::Receiver<()>,
) -> bool {
    tokio::select! {
        sent = tx.send(value) => sent.is_ok(),
        _ = close_rx.recv() => false,
    }
}

/// Fill `buf` from `source` at chunk `chunk_index`, looping over short reads.
///  Returns the byte count and whether the file is exhausted; a read error
///  ends the file with whatever was read so far.
fn read_chunk(source: &mut dyn SourceFile, buf: &mut [u8], chunk_index: u64) -> (usize, bool) {
    let base = chunk_index * CHUNK_LEN as u64;
    let mut filled = 0usize;
    while filled < buf.len() {
        match source.read_at(&mut buf[filled..], base + filled as u64) {
            Ok(0) => return (filled, true),
            Ok(n) => filled += n,
            Err(e) => {
                warn!("read error at chunk {}: {} - ending file early", chunk_index, e);
                return (filled, true);
            }
        }
    }
    (filled, false)
}

/// Walks the requested files in order, streaming 1024-byte chunks into the
///  payload channel and a terminal metadata (size + MD5) per file. Chunk
///  offsets count chunks from the requested resume offset.
async fn producer(
    provider: Arc<dyn FileProvider>,
    files: Vec<FileDescriptor>,
    payload_tx: mpsc::Sender<Arc<ServerPayload>>,
    metadata_tx: mpsc::Sender<ServerMetadata>,
    cleaner: Cleaner,
) {
    let mut close_rx = cleaner.subscribe();

    for (index, descriptor) in files.into_iter().enumerate() {
        if cleaner.closed() {
            return;
        }
        let file_index = index as u16;

        let error_status = |status: MetadataStatus| ServerMetadata {
            ack_number: 0,
            status,
            file_index,
            size: 0,
            checksum: [0; 16],
        };

        let mut source = match provider.open(&descriptor.name, descriptor.offset) {
            OpenOutcome::File(source) => source,
            OpenOutcome::NotFound => {
                debug!("'{}' does not exist", descriptor.name);
                send_or_close(&metadata_tx, error_status(MetadataStatus::FileNotExistent), &mut close_rx).await;
                continue;
            }
            OpenOutcome::AccessDenied => {
                debug!("'{}' is not readable", descriptor.name);
                send_or_close(&metadata_tx, error_status(MetadataStatus::AccessDenied), &mut close_rx).await;
                continue;
            }
            OpenOutcome::OffsetTooLarge => {
                debug!("'{}' is shorter than offset {}", descriptor.name, descriptor.offset);
                send_or_close(&metadata_tx, error_status(MetadataStatus::OffsetTooLarge), &mut close_rx).await;
                continue;
            }
        };

        if source.size() == 0 {
            debug!("'{}' is empty", descriptor.name);
            send_or_close(&metadata_tx, error_status(MetadataStatus::FileEmpty), &mut close_rx).await;
            continue;
        }

        let size = source.size();
        let mut hasher = Md5::new();
        let mut chunk_index = 0u64;
        loop {
            let mut buf = vec![0u8; CHUNK_LEN];
            let (n, exhausted) = read_chunk(source.as_mut(), &mut buf, chunk_index);
            if n > 0 {
                buf.truncate(n);
                hasher.update(&buf);
                let payload = Arc::new(ServerPayload {
                    ack_number: 0,
                    file_index,
                    offset: chunk_index,
                    data: Bytes::from(buf),
                });
                if !send_or_close(&payload_tx, payload, &mut close_rx).await {
                    return;
                }
                chunk_index += 1;
            }
            if exhausted {
                break;
            }
        }

        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&hasher.finalize());
        let terminal = ServerMetadata {
            ack_number: 0,
            status: MetadataStatus::NoError,
            file_index,
            size,
            checksum,
        };
        if !send_or_close(&metadata_tx, terminal, &mut close_rx).await {
            return;
        }
        trace!("file {} fully produced ({} chunks)", file_index, chunk_index);
    }
    debug!("producer finished all requested files");
}

/// The single socket writer for one session. Serialises `lastAck` updates
///  with dispatch: every outgoing frame carries the most recent ack number
///  observed before it was sent.
#[allow(clippy::too_many_arguments)]
async fn scheduler(
    writer: ResponseWriter,
    caches: Arc<SessionCaches>,
    cleaner: Cleaner,
    config: ServerConfig,
    rate: AimdRateController,
    mut payload_rx: mpsc::Receiver<Arc<ServerPayload>>,
    mut metadata_rx: mpsc::Receiver<ServerMetadata>,
    mut resend_rx: mpsc::Receiver<Arc<ServerPayload>>,
    mut ack_rx: mpsc::Receiver<ClientAck>,
    reschedule_tx: mpsc::Sender<ClientAck>,
    resend_done_tx: mpsc::Sender<Arc<ServerPayload>>,
) {
    let mut last_ack = 0u8;
    rate.start();
    let mut close_rx = cleaner.subscribe();

    async fn handle_ack(
        last_ack: &mut u8,
        rate: &AimdRateController,
        reschedule_tx: &mpsc::Sender<ClientAck>,
        ack: ClientAck,
    ) {
        *last_ack = ack.ack_number;
        rate.on_ack(&ack);
        reschedule_tx.send(ack).await.ok();
    }

    async fn send_payload(
        writer: &ResponseWriter,
        payload: &ServerPayload,
        last_ack: u8,
    ) {
        let mut stamped = payload.clone();
        stamped.ack_number = last_ack;
        trace!(
            "sending payload for file {} at offset {} with ack {}",
            stamped.file_index, stamped.offset, last_ack
        );
        if let Err(e) = writer.send(&Message::Payload(stamped)).await {
            warn!("payload send failed: {}", e);
        }
    }

    while !cleaner.closed() {
        cleaner.refresh(config.idle_timeout);

        if rate.is_available() {
            // retransmissions take precedence over fresh data
            if let Ok(payload) = resend_rx.try_recv() {
                send_payload(&writer, &payload, last_ack).await;
                rate.on_send();
                resend_done_tx.send(payload).await.ok();
                continue;
            }
            if let Ok(ack) = ack_rx.try_recv() {
                handle_ack(&mut last_ack, &rate, &reschedule_tx, ack).await;
            }

            tokio::select! {
                Some(payload) = resend_rx.recv() => {
                    send_payload(&writer, &payload, last_ack).await;
                    rate.on_send();
                    resend_done_tx.send(payload).await.ok();
                }
                Some(mut metadata) = metadata_rx.recv() => {
                    metadata.ack_number = last_ack;
                    caches.store_metadata(&metadata);
                    debug!(
                        "sending metadata for file {}: {}, size {}, checksum {:02x?}",
                        metadata.file_index, metadata.status, metadata.size, metadata.checksum
                    );
                    if let Err(e) = writer.send(&Message::Metadata(metadata)).await {
                        warn!("metadata send failed: {}", e);
                    }
                    rate.on_send();
                }
                Some(payload) = payload_rx.recv() => {
                    caches.store_payload(&payload);
                    send_payload(&writer, &payload, last_ack).await;
                    rate.on_send();
                }
                Some(ack) = ack_rx.recv() => {
                    handle_ack(&mut last_ack, &rate, &reschedule_tx, ack).await;
                }
                _ = close_rx.recv() => break,
            }
        } else {
            tokio::select! {
                _ = rate.await_available() => continue,
                Some(ack) = ack_rx.recv() => {
                    handle_ack(&mut last_ack, &rate, &reschedule_tx, ack).await;
                }
                _ = close_rx.recv() => break,
            }
        }
    }
    rate.stop();
}

/// Turns incoming acks into resend work: requeues cached chunks for every
///  gap entry and flags metadata re-issues, deduplicating through the
///  rescheduled set until the scheduler confirms each resend.
async fn rescheduler(
    caches: Arc<SessionCaches>,
    cleaner: Cleaner,
    mut reschedule_rx: mpsc::Receiver<ClientAck>,
    mut resend_done_rx: mpsc::Receiver<Arc<ServerPayload>>,
    resend_tx: mpsc::Sender<Arc<ServerPayload>>,
    metadata_tx: mpsc::Sender<ServerMetadata>,
) {
    let mut close_rx = cleaner.subscribe();
    let mut rescheduled: FxHashMap<u16, FxHashSet<u64>> = FxHashMap::default();

    loop {
        tokio::select! {
            _ = close_rx.recv() => return,
            Some(done) = resend_done_rx.recv() => {
                if let Some(per_file) = rescheduled.get_mut(&done.file_index) {
                    per_file.remove(&done.offset);
                }
            }
            Some(ack) = reschedule_rx.recv() => {
                caches.evict_below(ack.file_index, ack.offset);

                let mut metadata_wanted: Vec<u16> = Vec::new();
                let mut metadata_seen: FxHashSet<u16> = FxHashSet::default();
                if ack.metadata_missing() && metadata_seen.insert(ack.file_index) {
                    metadata_wanted.push(ack.file_index);
                }

                let mut entries = ack.resend_entries.clone();
                entries.sort_by_key(|entry| entry.offset);
                trace!("rescheduling {} sorted entries for ack {}", entries.len(), ack.ack_number);

                if entries.is_empty() {
                    // no gaps reported: nudge the high-water chunk back out
                    //  in case the last send got lost
                    if let Some(payload) = caches.payload(ack.file_index, ack.offset) {
                        resend_tx.send(payload).await.ok();
                    }
                }

                for (i, entry) in entries.iter().enumerate() {
                    if ack.max_transmission_rate > 0 && i as u32 > ack.max_transmission_rate {
                        break;
                    }
                    if entry.length == 0 && metadata_seen.insert(entry.file_index) {
                        metadata_wanted.push(entry.file_index);
                    }

                    let scheduled = rescheduled.entry(entry.file_index).or_default();
                    for k in 0..=entry.length as u64 {
                        let offset = entry.offset + k;
                        if scheduled.contains(&offset) {
                            continue;
                        }
                        match caches.payload(entry.file_index, offset) {
                            Some(payload) => {
                                scheduled.insert(offset);
                                trace!("rescheduled file {} chunk {}", entry.file_index, offset);
                                resend_tx.send(payload).await.ok();
                            }
                            None => {
                                // the producer has not reached this chunk yet;
                                //  the client will re-ack
                                debug!(
                                    "file {} chunk {} not cached - stopping this run",
                                    entry.file_index, offset
                                );
                                break;
                            }
                        }
                    }
                }

                for file_index in metadata_wanted {
                    if let Some(metadata) = caches.metadata(file_index) {
                        debug!("re-issuing metadata for file {}", file_index);
                        metadata_tx.send(metadata).await.ok();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RECV_BUFFER_LEN;
    use crate::connection::test_support::{ChannelSocket, ChannelSocketDriver};
    use crate::file_provider::MemoryFileProvider;
    use crate::messages::{decode_body, encode_frame, MsgHeader, ResendEntry};
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 4000))
    }

    fn frame(msg: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(msg, &mut buf).unwrap();
        buf.to_vec()
    }

    fn decode(raw: &[u8]) -> Message {
        let mut b = raw;
        let header = MsgHeader::deser(&mut b).unwrap();
        decode_body(&header, &mut b).unwrap()
    }

    fn request(files: &[&str]) -> Message {
        Message::Request(ClientRequest {
            max_transmission_rate: 0,
            files: files
                .iter()
                .map(|name| FileDescriptor { offset: 0, name: name.to_string() })
                .collect(),
        })
    }

    struct Fixture {
        server: Arc<Server>,
        conn: Arc<Connection>,
        driver: ChannelSocketDriver,
        receive: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Fixture {
        fn start(provider: MemoryFileProvider, config: ServerConfig) -> Fixture {
            let (socket, driver) = ChannelSocket::new(SocketAddr::from(([10, 0, 0, 2], 8080)));
            let server = Server::new(Arc::new(provider), config).unwrap();
            let mut conn = Connection::from_socket(socket, None);
            server.register_handlers(&mut conn);
            let conn = Arc::new(conn);

            let recv_conn = conn.clone();
            let receive = tokio::spawn(async move { recv_conn.receive().await });
            Fixture { server, conn, driver, receive }
        }

        fn send(&self, msg: &Message) {
            self.driver.incoming.send((frame(msg), peer())).unwrap();
        }

        async fn next_message(&mut self) -> Message {
            let (raw, to) = tokio::time::timeout(Duration::from_secs(5), self.driver.outgoing.recv())
                .await
                .expect("timed out waiting for a server frame")
                .expect("socket driver closed");
            assert_eq!(to, peer());
            assert!(raw.len() <= RECV_BUFFER_LEN);
            decode(&raw)
        }

        async fn shutdown(self) {
            self.conn.close(Duration::from_secs(1)).await.unwrap();
            self.receive.await.unwrap().unwrap();
        }
    }

    fn short_timeout_config() -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_small_file_streams_chunks_and_metadata() {
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut provider = MemoryFileProvider::new();
        provider.insert("a", content.clone());

        let mut fx = Fixture::start(provider, ServerConfig::default());
        fx.send(&request(&["a"]));

        let mut payloads = Vec::new();
        let mut metadata = None;
        while metadata.is_none() || payloads.len() < 3 {
            match fx.next_message().await {
                Message::Payload(p) => payloads.push(p),
                Message::Metadata(md) => metadata = Some(md),
                other => panic!("unexpected message {:?}", other),
            }
        }

        let offsets: Vec<u64> = payloads.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(payloads[0].data.len(), 1024);
        assert_eq!(payloads[1].data.len(), 1024);
        assert_eq!(payloads[2].data.len(), 452);
        let reassembled: Vec<u8> = payloads.iter().flat_map(|p| p.data.to_vec()).collect();
        assert_eq!(reassembled, content);

        let metadata = metadata.unwrap();
        assert_eq!(metadata.status, MetadataStatus::NoError);
        assert_eq!(metadata.size, 2500);
        let expected: [u8; 16] = Md5::digest(&content).into();
        assert_eq!(metadata.checksum, expected);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_file_yields_single_not_found_metadata() {
        let mut fx = Fixture::start(MemoryFileProvider::new(), short_timeout_config());
        fx.send(&request(&["missing"]));

        match fx.next_message().await {
            Message::Metadata(md) => {
                assert_eq!(md.status, MetadataStatus::FileNotExistent);
                assert_eq!(md.file_index, 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(fx.server.session_count(), 1);

        // nothing further arrives and the session idles out
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(fx.driver.outgoing.try_recv().is_err());
        assert_eq!(fx.server.session_count(), 0);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_offset_past_end_is_reported() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("short", vec![1, 2, 3]);

        let mut fx = Fixture::start(provider, short_timeout_config());
        fx.send(&Message::Request(ClientRequest {
            max_transmission_rate: 0,
            files: vec![FileDescriptor { offset: 100, name: "short".to_string() }],
        }));

        match fx.next_message().await {
            Message::Metadata(md) => assert_eq!(md.status, MetadataStatus::OffsetTooLarge),
            other => panic!("unexpected message {:?}", other),
        }
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_file_is_reported() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("empty", vec![]);

        let mut fx = Fixture::start(provider, short_timeout_config());
        fx.send(&request(&["empty"]));

        match fx.next_message().await {
            Message::Metadata(md) => assert_eq!(md.status, MetadataStatus::FileEmpty),
            other => panic!("unexpected message {:?}", other),
        }
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_request_creates_one_session() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("a", vec![7; 100]);

        let mut fx = Fixture::start(provider, short_timeout_config());
        fx.send(&request(&["a"]));
        fx.send(&request(&["a"]));

        // first session's chunk and metadata; a second producer would have
        //  duplicated them
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(fx.next_message().await);
        }
        assert_eq!(fx.server.session_count(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.driver.outgoing.try_recv().is_err());
        assert_eq!(fx.server.session_count(), 1);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_request_rejection_policy() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("a", vec![7; 100]);

        let config = ServerConfig {
            duplicate_request_policy: DuplicateRequestPolicy::CloseUnknownRequest,
            ..short_timeout_config()
        };
        let mut fx = Fixture::start(provider, config);
        fx.send(&request(&["a"]));
        fx.send(&request(&["a"]));

        let mut close_seen = false;
        for _ in 0..3 {
            if let Message::Close(close) = fx.next_message().await {
                assert_eq!(close.reason, CloseReason::UnknownRequest);
                close_seen = true;
                break;
            }
        }
        assert!(close_seen, "expected a CloseConnection(unknownRequest) reply");
        assert_eq!(fx.server.session_count(), 1);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_gap_triggers_resend() {
        let content: Vec<u8> = (0..5120u32).map(|i| (i % 127) as u8).collect();
        let mut provider = MemoryFileProvider::new();
        provider.insert("b", content);

        let mut fx = Fixture::start(provider, ServerConfig::default());
        fx.send(&request(&["b"]));

        // drain the initial stream: 5 chunks + metadata
        let mut initial = 0;
        while initial < 6 {
            fx.next_message().await;
            initial += 1;
        }

        // claim chunks 1 and 3 never arrived
        fx.send(&Message::Ack(ClientAck {
            ack_number: 1,
            file_index: 0,
            status: 0,
            max_transmission_rate: 0,
            offset: 0,
            resend_entries: vec![
                ResendEntry { file_index: 0, offset: 1, length: 0 },
                ResendEntry { file_index: 0, offset: 3, length: 0 },
            ],
        }));

        let mut resent = Vec::new();
        while resent.len() < 2 {
            match fx.next_message().await {
                Message::Payload(p) => resent.push(p.offset),
                Message::Metadata(_) => {} // length-0 entries also re-flag metadata
                other => panic!("unexpected message {:?}", other),
            }
        }
        resent.sort_unstable();
        assert_eq!(resent, vec![1, 3]);

        // the resends carry the newest observed ack number
        fx.send(&Message::Ack(ClientAck {
            ack_number: 2,
            file_index: 0,
            status: 0,
            max_transmission_rate: 0,
            offset: 1,
            resend_entries: vec![ResendEntry { file_index: 0, offset: 2, length: 0 }],
        }));
        loop {
            match fx.next_message().await {
                Message::Payload(p) if p.offset == 2 => {
                    assert_eq!(p.ack_number, 2);
                    break;
                }
                _ => {}
            }
        }

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_inclusive_resend_run() {
        let content: Vec<u8> = vec![9; 6 * 1024];
        let mut provider = MemoryFileProvider::new();
        provider.insert("c", content);

        let mut fx = Fixture::start(provider, ServerConfig::default());
        fx.send(&request(&["c"]));
        for _ in 0..7 {
            fx.next_message().await; // 6 chunks + metadata
        }

        // one entry covering chunks 1..=3
        fx.send(&Message::Ack(ClientAck {
            ack_number: 1,
            file_index: 0,
            status: 0,
            max_transmission_rate: 0,
            offset: 0,
            resend_entries: vec![ResendEntry { file_index: 0, offset: 1, length: 2 }],
        }));

        let mut resent = Vec::new();
        while resent.len() < 3 {
            if let Message::Payload(p) = fx.next_message().await {
                resent.push(p.offset);
            }
        }
        resent.sort_unstable();
        assert_eq!(resent, vec![1, 2, 3]);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_from_peer_tears_session_down() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("a", vec![1; 10]);

        let mut fx = Fixture::start(provider, ServerConfig::default());
        fx.send(&request(&["a"]));
        fx.next_message().await; // chunk
        fx.next_message().await; // metadata
        assert_eq!(fx.server.session_count(), 1);

        fx.send(&Message::Close(CloseConnection {
            reason: CloseReason::DownloadFinished,
        }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.server.session_count() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "session not torn down");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_metadata_missing_bit_reissues_metadata() {
        let mut provider = MemoryFileProvider::new();
        provider.insert("a", vec![1; 10]);

        let mut fx = Fixture::start(provider, ServerConfig::default());
        fx.send(&request(&["a"]));
        fx.next_message().await; // chunk
        fx.next_message().await; // metadata (now cached)

        fx.send(&Message::Ack(ClientAck {
            ack_number: 1,
            file_index: 0,
            status: crate::messages::ACK_STATUS_METADATA_MISSING,
            max_transmission_rate: 0,
            offset: 0,
            resend_entries: vec![],
        }));

        loop {
            match fx.next_message().await {
                Message::Metadata(md) => {
                    assert_eq!(md.file_index, 0);
                    assert_eq!(md.ack_number, 1);
                    break;
                }
                Message::Payload(_) => {} // the empty-entry high-water nudge
                other => panic!("unexpected message {:?}", other),
            }
        }

        fx.shutdown().await;
    }
}
