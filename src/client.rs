use crate::chunk_queue::{missing_runs, ChunkQueue};
use crate::cleaner::Cleaner;
use crate::config::{ClientConfig, CHUNK_LEN};
use crate::connection::{Connection, LossSimulator, Packet, PacketHandler, ResponseWriter};
use crate::messages::{
    decode_body, ClientAck, ClientRequest, CloseConnection, CloseReason, FileDescriptor, Message,
    MetadataStatus, MsgHeader, ResendEntry, ServerMetadata, ACK_STATUS_METADATA_MISSING,
    MSG_CLOSE, MSG_SERVER_METADATA, MSG_SERVER_PAYLOAD,
};
use anyhow::bail;
use async_trait::async_trait;
use md5::{Digest, Md5};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Receives the reassembled bytes of one downloaded file. `byte_offset` is
///  absolute within the target file (the requested resume offset is already
///  folded in).
pub trait ChunkSink: Send + 'static {
    fn write_chunk(&mut self, byte_offset: u64, data: &[u8]) -> std::io::Result<()>;

    /// MD5 over the bytes this download has written, in ascending offset
    ///  order. Called once, after the last chunk has been written.
    fn digest(&mut self) -> std::io::Result<[u8; 16]>;
}

/// One file to download: the remote name, the byte offset to resume from and
///  the sink receiving the content.
pub struct FileRequest {
    pub name: String,
    pub offset: u64,
    pub sink: Box<dyn ChunkSink>,
}

/// Per-file result of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// All chunks received and the checksum matched.
    Completed,
    /// The server reported an empty file; nothing was written.
    Empty,
    NotFound,
    AccessDenied,
    OffsetTooLarge,
}

struct FileState {
    base_offset: u64,
    sink: Box<dyn ChunkSink>,
    chunks: ChunkQueue,
    metadata: Option<ServerMetadata>,
    bytes_received: u64,
    outcome: Option<FileOutcome>,
}

impl FileState {
    fn settled(&self) -> bool {
        self.outcome.is_some()
    }

    fn expected_chunks(&self) -> Option<u64> {
        let metadata = self.metadata.as_ref()?;
        if metadata.status != MetadataStatus::NoError {
            return None;
        }
        Some(metadata.size.div_ceil(CHUNK_LEN as u64))
    }

    /// Entries for everything known to be missing: the gaps between received
    ///  chunks, and once the size is known, the tail beyond the highest
    ///  received chunk.
    fn resend_entries(&self, file_index: u16) -> Vec<ResendEntry> {
        let watermark = self.chunks.watermark();
        let mut entries = self.chunks.gaps(watermark);
        if let Some(expected) = self.expected_chunks() {
            let next = self.chunks.top().map(|top| top + 1).unwrap_or(0);
            if next < expected {
                entries.extend(missing_runs(file_index, next, expected - next));
            }
        }
        entries
    }
}

/// Simple smoothed round-trip estimate from the server echoing the client's
///  ack numbers back on its frames.
struct RttEstimator {
    sent_at: FxHashMap<u8, Instant>,
    smoothed: Option<Duration>,
}

impl RttEstimator {
    fn new() -> RttEstimator {
        RttEstimator {
            sent_at: FxHashMap::default(),
            smoothed: None,
        }
    }

    fn on_ack_sent(&mut self, ack_number: u8) {
        self.sent_at.insert(ack_number, Instant::now());
    }

    fn on_echo(&mut self, ack_number: u8) {
        let Some(sent) = self.sent_at.remove(&ack_number) else {
            return;
        };
        let sample = sent.elapsed();
        let smoothed = match self.smoothed {
            None => sample,
            // standard 7/8 exponential smoothing
            Some(prev) => (prev * 7 + sample) / 8,
        };
        self.smoothed = Some(smoothed);
        trace!("rtt sample {:?}, smoothed {:?}", sample, smoothed);
    }
}

struct ForwardHandler {
    msg_type: u8,
    events: mpsc::Sender<Message>,
}

#[async_trait]
impl PacketHandler for ForwardHandler {
    async fn handle(&self, _reply: ResponseWriter, packet: Packet) {
        let header = MsgHeader::new(self.msg_type, packet.ack_number);
        let mut body = packet.data.clone();
        match decode_body(&header, &mut body) {
            Ok(msg) => {
                self.events.send(msg).await.ok();
            }
            Err(e) => warn!("dropping malformed message of type {}: {}", self.msg_type, e),
        }
    }
}

/// The client side of a transfer session: one request, then reassembly of the
///  streamed files with gap-driven acknowledgements until every file settles.
pub struct Client {
    config: ClientConfig,
    loss_sim: Option<Arc<dyn LossSimulator>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;
        Ok(Client {
            config,
            loss_sim: None,
        })
    }

    /// Inject packet-loss simulation at the socket edge, for testing.
    pub fn set_loss_simulator(&mut self, sim: Arc<dyn LossSimulator>) {
        self.loss_sim = Some(sim);
    }

    /// Download `files` from the server at `host`. Returns the per-file
    ///  outcomes, or an error on timeout, server-side close, or a checksum
    ///  mismatch.
    pub async fn download(
        &self,
        host: &str,
        files: Vec<FileRequest>,
    ) -> anyhow::Result<Vec<FileOutcome>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Message>(1024);
        let mut conn = Connection::connect_to(host).await?;
        if let Some(sim) = &self.loss_sim {
            conn.set_loss_simulator(sim.clone());
        }
        for msg_type in [MSG_SERVER_METADATA, MSG_SERVER_PAYLOAD, MSG_CLOSE] {
            conn.handle(
                msg_type,
                Arc::new(ForwardHandler { msg_type, events: event_tx.clone() }),
            );
        }
        let conn = Arc::new(conn);
        let receive_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_conn.receive().await {
                warn!("client receive loop failed: {}", e);
            }
        });

        let request = ClientRequest {
            max_transmission_rate: self.config.max_transmission_rate,
            files: files
                .iter()
                .map(|f| FileDescriptor { offset: f.offset, name: f.name.clone() })
                .collect(),
        };
        info!("requesting {} file(s) from {}", files.len(), host);
        conn.send(&Message::Request(request)).await?;

        let mut states: Vec<FileState> = files
            .into_iter()
            .enumerate()
            .map(|(index, f)| FileState {
                base_offset: f.offset,
                sink: f.sink,
                chunks: ChunkQueue::new(index as u16),
                metadata: None,
                bytes_received: 0,
                outcome: None,
            })
            .collect();

        let cleaner = Cleaner::new(|| {});
        cleaner.refresh(self.config.idle_timeout);
        cleaner.spawn_timeout_watch();
        let mut close_rx = cleaner.subscribe();

        let mut ack_timer = interval(self.config.ack_interval);
        ack_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_ack_number: u8 = 1;
        let mut rtt = RttEstimator::new();

        let result = loop {
            if states.iter().all(FileState::settled) {
                break Ok(());
            }

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    cleaner.refresh(self.config.idle_timeout);
                    match event {
                        Message::Payload(payload) => {
                            rtt.on_echo(payload.ack_number);
                            if let Err(e) = on_payload(&mut states, &payload) {
                                break Err(e);
                            }
                        }
                        Message::Metadata(metadata) => {
                            rtt.on_echo(metadata.ack_number);
                            if let Err(e) = on_metadata(&mut states, metadata) {
                                break Err(e);
                            }
                        }
                        Message::Close(close) => {
                            break Err(ServerClosed { reason: close.reason }.into());
                        }
                        _ => {}
                    }
                }
                _ = ack_timer.tick() => {
                    if let Some(ack) = build_ack(
                        &states,
                        &mut next_ack_number,
                        self.config.max_transmission_rate,
                    ) {
                        rtt.on_ack_sent(ack.ack_number);
                        trace!(
                            "acking file {} up to {}, {} resend entries",
                            ack.file_index, ack.offset, ack.resend_entries.len()
                        );
                        conn.send(&Message::Ack(ack)).await.ok();
                    }
                }
                _ = close_rx.recv() => {
                    break Err(anyhow::anyhow!("download timed out"));
                }
            }
        };

        // the server already tore its session down when it sent us a close,
        //  so only the remaining endings are announced
        let close_reason = match &result {
            Ok(()) => Some(CloseReason::DownloadFinished),
            Err(e) if e.is::<ChecksumMismatch>() => Some(CloseReason::WrongChecksum),
            Err(e) if e.is::<ServerClosed>() => None,
            Err(_) => Some(CloseReason::Timeout),
        };
        if let Some(reason) = close_reason {
            conn.send(&Message::Close(CloseConnection { reason }))
                .await
                .ok();
        }
        cleaner.close();
        conn.close(Duration::from_secs(1)).await.ok();

        result?;
        Ok(states
            .into_iter()
            .map(|s| s.outcome.expect("all files settled"))
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("file {file_index}: size or checksum mismatch")]
struct ChecksumMismatch {
    file_index: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("server closed the session: {reason}")]
struct ServerClosed {
    reason: CloseReason,
}

fn on_payload(states: &mut [FileState], payload: &crate::messages::ServerPayload) -> anyhow::Result<()> {
    let file_index = payload.file_index;
    let Some(state) = states.get_mut(file_index as usize) else {
        debug!("payload for unknown file {} - dropping", file_index);
        return Ok(());
    };
    if state.settled() || state.chunks.contains(payload.offset) {
        return Ok(());
    }
    if let Some(expected) = state.expected_chunks() {
        if payload.offset >= expected {
            debug!("file {}: chunk {} is past the announced size - dropping", file_index, payload.offset);
            return Ok(());
        }
    }

    let Some(byte_offset) = payload
        .offset
        .checked_mul(CHUNK_LEN as u64)
        .and_then(|rel| rel.checked_add(state.base_offset))
    else {
        debug!("file {}: chunk offset {} overflows - dropping", file_index, payload.offset);
        return Ok(());
    };
    state.sink.write_chunk(byte_offset, &payload.data)?;
    state.bytes_received += payload.data.len() as u64;
    state.chunks.push(payload.offset);
    trace!("file {}: chunk {} ({} bytes)", file_index, payload.offset, payload.data.len());

    try_settle(state, file_index)
}

fn on_metadata(states: &mut [FileState], metadata: ServerMetadata) -> anyhow::Result<()> {
    let file_index = metadata.file_index;
    let Some(state) = states.get_mut(file_index as usize) else {
        debug!("metadata for unknown file {} - dropping", file_index);
        return Ok(());
    };
    if state.settled() {
        return Ok(());
    }

    debug!(
        "file {}: metadata {}, size {}",
        file_index, metadata.status, metadata.size
    );
    match metadata.status {
        MetadataStatus::NoError => {
            state.metadata = Some(metadata);
            try_settle(state, file_index)
        }
        MetadataStatus::FileNotExistent => {
            state.outcome = Some(FileOutcome::NotFound);
            Ok(())
        }
        MetadataStatus::FileEmpty => {
            state.outcome = Some(FileOutcome::Empty);
            Ok(())
        }
        MetadataStatus::AccessDenied => {
            state.outcome = Some(FileOutcome::AccessDenied);
            Ok(())
        }
        MetadataStatus::OffsetTooLarge => {
            state.outcome = Some(FileOutcome::OffsetTooLarge);
            Ok(())
        }
        MetadataStatus::Other(raw) => {
            warn!("file {}: unknown metadata status {} - treating as not found", file_index, raw);
            state.outcome = Some(FileOutcome::NotFound);
            Ok(())
        }
    }
}

/// Settle the file once the terminal metadata is known and every chunk up to
///  the expected count has arrived; verifies size and MD5.
fn try_settle(state: &mut FileState, file_index: u16) -> anyhow::Result<()> {
    let Some(expected) = state.expected_chunks() else {
        return Ok(());
    };
    // watermark() is 0 both for "only chunk 0" and "nothing yet", so the
    //  presence of chunk 0 needs its own check
    let complete =
        expected > 0 && state.chunks.contains(0) && state.chunks.watermark() == expected - 1;
    if !complete {
        return Ok(());
    }

    let metadata = state.metadata.as_ref().expect("checked by expected_chunks");
    if state.bytes_received != metadata.size {
        bail!(ChecksumMismatch { file_index });
    }
    let digest = state.sink.digest()?;
    if digest != metadata.checksum {
        warn!("file {}: checksum mismatch", file_index);
        bail!(ChecksumMismatch { file_index });
    }

    info!("file {} complete ({} bytes)", file_index, metadata.size);
    state.outcome = Some(FileOutcome::Completed);
    Ok(())
}

/// The periodic acknowledgement: watermark of the first unsettled file, the
///  metadata-missing bit for it, and the concatenated gap entries of every
///  unsettled file.
fn build_ack(
    states: &[FileState],
    next_ack_number: &mut u8,
    max_transmission_rate: u32,
) -> Option<ClientAck> {
    let current_index = states.iter().position(|s| !s.settled())?;
    let current = &states[current_index];

    let mut status = 0u8;
    if current.metadata.is_none() {
        status |= ACK_STATUS_METADATA_MISSING;
    }

    let mut resend_entries = Vec::new();
    for (index, state) in states.iter().enumerate() {
        if !state.settled() {
            resend_entries.extend(state.resend_entries(index as u16));
        }
    }

    let ack_number = *next_ack_number;
    *next_ack_number = next_ack_number.wrapping_add(1);

    Some(ClientAck {
        ack_number,
        file_index: current_index as u16,
        status,
        max_transmission_rate,
        offset: current.chunks.watermark(),
        resend_entries,
    })
}

/// In-memory sink; keeps the whole file in a buffer.
#[derive(Default)]
pub struct MemorySink {
    base_offset: u64,
    content: Vec<u8>,
}

impl MemorySink {
    pub fn new(base_offset: u64) -> MemorySink {
        MemorySink {
            base_offset,
            content: Vec::new(),
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }
}

impl ChunkSink for MemorySink {
    fn write_chunk(&mut self, byte_offset: u64, data: &[u8]) -> std::io::Result<()> {
        let relative = (byte_offset - self.base_offset) as usize;
        if self.content.len() < relative + data.len() {
            self.content.resize(relative + data.len(), 0);
        }
        self.content[relative..relative + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn digest(&mut self) -> std::io::Result<[u8; 16]> {
        Ok(Md5::digest(&self.content).into())
    }
}

/// A sink that shares its buffer, so tests can keep a handle while the
///  download owns the sink.
#[derive(Clone, Default)]
pub struct SharedMemorySink {
    inner: Arc<std::sync::Mutex<MemorySink>>,
}

impl SharedMemorySink {
    pub fn new(base_offset: u64) -> SharedMemorySink {
        SharedMemorySink {
            inner: Arc::new(std::sync::Mutex::new(MemorySink::new(base_offset))),
        }
    }

    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().unwrap().content().to_vec()
    }
}

impl ChunkSink for SharedMemorySink {
    fn write_chunk(&mut self, byte_offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.inner.lock().unwrap().write_chunk(byte_offset, data)
    }

    fn digest(&mut self) -> std::io::Result<[u8; 16]> {
        self.inner.lock().unwrap().digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn state_with(chunks: &[u64], metadata_size: Option<u64>) -> FileState {
        let mut state = FileState {
            base_offset: 0,
            sink: Box::new(MemorySink::new(0)),
            chunks: ChunkQueue::new(0),
            metadata: None,
            bytes_received: 0,
            outcome: None,
        };
        for &c in chunks {
            state.chunks.push(c);
        }
        if let Some(size) = metadata_size {
            state.metadata = Some(ServerMetadata {
                ack_number: 0,
                status: MetadataStatus::NoError,
                file_index: 0,
                size,
                checksum: [0; 16],
            });
        }
        state
    }

    #[rstest]
    #[case::gaps_only(&[0, 2, 4][..], None, vec![(1, 0), (3, 0)])]
    #[case::tail_after_metadata(&[0, 1, 2][..], Some(4 * 1024), vec![(3, 0)])]
    #[case::gap_and_tail(&[0, 2][..], Some(5 * 1024), vec![(1, 0), (3, 1)])]
    #[case::nothing_received(&[][..], Some(2 * 1024), vec![(0, 1)])]
    #[case::complete(&[0, 1][..], Some(2 * 1024), vec![])]
    fn test_resend_entries(
        #[case] chunks: &[u64],
        #[case] metadata_size: Option<u64>,
        #[case] expected: Vec<(u64, u8)>,
    ) {
        let expected: Vec<ResendEntry> = expected
            .into_iter()
            .map(|(offset, length)| ResendEntry { file_index: 0, offset, length })
            .collect();
        assert_eq!(state_with(chunks, metadata_size).resend_entries(0), expected);
    }

    #[test]
    fn test_build_ack_reports_first_unsettled_file() {
        let mut states = vec![state_with(&[0, 1], Some(2 * 1024)), state_with(&[0, 2], None)];
        states[0].outcome = Some(FileOutcome::Completed);

        let mut next = 1u8;
        let ack = build_ack(&states, &mut next, 0).unwrap();
        assert_eq!(ack.ack_number, 1);
        assert_eq!(next, 2);
        assert_eq!(ack.file_index, 1);
        assert_eq!(ack.offset, 0);
        assert!(ack.metadata_missing());
        assert_eq!(
            ack.resend_entries,
            vec![ResendEntry { file_index: 1, offset: 1, length: 0 }]
        );
    }

    #[test]
    fn test_build_ack_none_when_all_settled() {
        let mut states = vec![state_with(&[], None)];
        states[0].outcome = Some(FileOutcome::NotFound);
        let mut next = 1u8;
        assert!(build_ack(&states, &mut next, 0).is_none());
        assert_eq!(next, 1);
    }

    #[test]
    fn test_ack_number_wraps_mod_256() {
        let states = vec![state_with(&[0], None)];
        let mut next = 255u8;
        assert_eq!(build_ack(&states, &mut next, 0).unwrap().ack_number, 255);
        assert_eq!(build_ack(&states, &mut next, 0).unwrap().ack_number, 0);
        assert_eq!(build_ack(&states, &mut next, 0).unwrap().ack_number, 1);
    }

    #[test]
    fn test_payload_settles_file_after_metadata() {
        let content: Vec<u8> = (0..1500u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut states = vec![state_with(&[], None)];

        let mut metadata = ServerMetadata {
            ack_number: 0,
            status: MetadataStatus::NoError,
            file_index: 0,
            size: 1500,
            checksum: [0; 16],
        };
        metadata.checksum = Md5::digest(&content).into();
        on_metadata(&mut states, metadata).unwrap();
        assert!(!states[0].settled());

        on_payload(
            &mut states,
            &crate::messages::ServerPayload {
                ack_number: 0,
                file_index: 0,
                offset: 1,
                data: Bytes::copy_from_slice(&content[1024..]),
            },
        )
        .unwrap();
        assert!(!states[0].settled());

        on_payload(
            &mut states,
            &crate::messages::ServerPayload {
                ack_number: 0,
                file_index: 0,
                offset: 0,
                data: Bytes::copy_from_slice(&content[..1024]),
            },
        )
        .unwrap();
        assert_eq!(states[0].outcome, Some(FileOutcome::Completed));
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let mut states = vec![state_with(&[], None)];
        on_metadata(
            &mut states,
            ServerMetadata {
                ack_number: 0,
                status: MetadataStatus::NoError,
                file_index: 0,
                size: 3,
                checksum: [0xFF; 16],
            },
        )
        .unwrap();

        let result = on_payload(
            &mut states,
            &crate::messages::ServerPayload {
                ack_number: 0,
                file_index: 0,
                offset: 0,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        );
        assert!(result.unwrap_err().is::<ChecksumMismatch>());
    }

    #[test]
    fn test_duplicate_payload_is_ignored() {
        let mut states = vec![state_with(&[], None)];
        let payload = crate::messages::ServerPayload {
            ack_number: 0,
            file_index: 0,
            offset: 0,
            data: Bytes::from_static(&[1, 2, 3]),
        };
        on_payload(&mut states, &payload).unwrap();
        on_payload(&mut states, &payload).unwrap();
        assert_eq!(states[0].bytes_received, 3);
    }

    #[test]
    fn test_error_statuses_settle_without_content() {
        let mut states = vec![state_with(&[], None)];
        on_metadata(
            &mut states,
            ServerMetadata {
                ack_number: 0,
                status: MetadataStatus::FileNotExistent,
                file_index: 0,
                size: 0,
                checksum: [0; 16],
            },
        )
        .unwrap();
        assert_eq!(states[0].outcome, Some(FileOutcome::NotFound));
    }

    #[test]
    fn test_rtt_estimator_smooths_echoes() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sent(1);
        rtt.on_echo(1);
        assert!(rtt.smoothed.is_some());
        // an echo that was never sent is ignored
        rtt.on_echo(99);
    }
}
