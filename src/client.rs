use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::channel::{mpsc, oneshot};
use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::FsError;
use crate::protocol::{self, FileStat, FsOp, FsRequest, ListOptions, RpcData};
use crate::transport::Payload;

/// Block size for streaming reads.
const READ_BLOCK_SIZE: u64 = 32 * 1024;

/// Number of block reads issued ahead of consumption. Bounds the bytes in
/// flight at `READ_PREFETCH * READ_BLOCK_SIZE`.
const READ_PREFETCH: usize = 16;

/// Largest write sub-block whose base64 text encoding still fits one read
/// block. Must stay a multiple of 3 so sub-blocks encode without padding.
const WRITE_BLOCK_SIZE: usize = 32768 / 4 * 3;

/// Grace period between losing the last channel and flipping unavailable,
/// so a quick reconnect is invisible to callers.
const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

struct ClientInner {
    seq: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<RpcData, FsError>>>>,
    sockets: Mutex<Vec<mpsc::UnboundedSender<Payload>>>,
    available_tx: watch::Sender<bool>,
    disconnect_grace: Duration,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
}

/// Multiplexed RPC client for one remote filesystem endpoint.
///
/// Requests are serialized as JSON control messages on the primary bound
/// channel and correlated back by request id; bulk read payloads come back
/// as binary frames. The client is cheap to clone and all clones share the
/// same pending table and availability flag.
#[derive(Clone)]
pub struct FsClient {
    inner: Arc<ClientInner>,
}

impl FsClient {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_DISCONNECT_GRACE)
    }

    pub fn with_grace(disconnect_grace: Duration) -> Self {
        let (available_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                seq: AtomicU32::new(0),
                pending: Mutex::new(HashMap::new()),
                sockets: Mutex::new(Vec::new()),
                available_tx,
                disconnect_grace,
                grace_timer: Mutex::new(None),
            }),
        }
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let data = self
            .call(FsOp::Stat, path, None, None, None, None)
            .await?;
        expect_json(data)
    }

    pub async fn files(
        &self,
        path: &str,
        offset: u64,
        limit: i64,
        options: Option<ListOptions>,
    ) -> Result<Vec<FileStat>, FsError> {
        let data = self
            .call(FsOp::Files, path, Some(offset), Some(limit), None, options)
            .await?;
        expect_json(data)
    }

    pub async fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, FsError> {
        let data = self
            .call(FsOp::Read, path, Some(offset), Some(len as i64), None, None)
            .await?;
        decode_read_data(data)
    }

    /// Writes `data` at `offset`, returning the byte count the server
    /// reports. The payload travels base64-encoded.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        let encoded = protocol::to_base64(data);
        let reply = self
            .call(FsOp::Write, path, Some(offset), None, Some(encoded), None)
            .await?;
        expect_json(reply)
    }

    pub async fn remove(&self, path: &str) -> Result<bool, FsError> {
        let data = self
            .call(FsOp::Remove, path, None, None, None, None)
            .await?;
        expect_json(data)
    }

    async fn call(
        &self,
        op: FsOp,
        path: &str,
        p: Option<u64>,
        l: Option<i64>,
        b: Option<String>,
        options: Option<ListOptions>,
    ) -> Result<RpcData, FsError> {
        let rx = self.begin_call(op, path, p, l, b, options)?;
        match rx.await {
            Ok(result) => result,
            // Sender dropped without settling: the table was torn down.
            Err(_) => Err(FsError::Reset),
        }
    }

    /// Allocates the next request id, stores the deferred pair, and sends
    /// the request. The returned receiver is settled exactly once.
    fn begin_call(
        &self,
        op: FsOp,
        path: &str,
        p: Option<u64>,
        l: Option<i64>,
        b: Option<String>,
        options: Option<ListOptions>,
    ) -> Result<oneshot::Receiver<Result<RpcData, FsError>>, FsError> {
        let socket = self
            .inner
            .sockets
            .lock()
            .first()
            .cloned()
            .ok_or(FsError::NoConnection)?;
        let rid = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let req = FsRequest {
            op,
            path: path.to_owned(),
            rid,
            p,
            l,
            b,
            options,
        };
        let text = serde_json::to_string(&req).map_err(|e| FsError::protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(rid, tx);
        if socket.unbounded_send(Payload::Text(text)).is_err() {
            self.inner.pending.lock().remove(&rid);
            return Err(FsError::NoConnection);
        }
        Ok(rx)
    }

    /// Feeds one incoming channel message through the pending table.
    /// Responses with unknown ids are stale and dropped silently.
    pub fn handle_payload(&self, payload: &Payload) {
        match protocol::decode_reply(payload) {
            Ok(reply) => {
                let entry = self.inner.pending.lock().remove(&reply.rid);
                match entry {
                    Some(tx) => {
                        let _ = tx.send(reply.result);
                    }
                    None => tracing::debug!(rid = reply.rid, "dropping stale response"),
                }
            }
            Err(e) => tracing::warn!("undecodable message: {e}"),
        }
    }

    /// Rejects every pending request with `Reset` and clears the bound
    /// sockets. Invoked whenever the underlying channel disappears, so no
    /// caller hangs on a dead transport.
    pub fn reset(&self) {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(FsError::Reset));
        }
        self.inner.sockets.lock().clear();
    }

    pub fn add_socket(&self, socket: mpsc::UnboundedSender<Payload>, ready: bool) {
        if let Some(timer) = self.inner.grace_timer.lock().take() {
            timer.abort();
        }
        self.inner.sockets.lock().push(socket);
        if ready {
            self.set_available(true);
        }
    }

    pub fn remove_socket(&self, socket: &mpsc::UnboundedSender<Payload>) {
        let now_empty = {
            let mut sockets = self.inner.sockets.lock();
            sockets.retain(|s| !s.same_receiver(socket));
            sockets.is_empty()
        };
        if !now_empty {
            return;
        }
        self.reset();
        let client = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(client.inner.disconnect_grace).await;
            if client.inner.sockets.lock().is_empty() {
                client.set_available(false);
            }
        });
        if let Some(old) = self.inner.grace_timer.lock().replace(timer) {
            old.abort();
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available_tx.send_replace(available);
    }

    pub fn available(&self) -> bool {
        *self.inner.available_tx.borrow()
    }

    pub fn subscribe_available(&self) -> watch::Receiver<bool> {
        self.inner.available_tx.subscribe()
    }

    /// Suspends until the endpoint is usable. Returns immediately when
    /// already available, so callers can issue I/O right after construction
    /// without racing the handshake.
    pub async fn wait(&self) {
        let mut rx = self.inner.available_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Lazy, finite byte-chunk stream over `start..end` of `path`.
    ///
    /// Up to [`READ_PREFETCH`] block reads are in flight ahead of the
    /// consumer. Chunks are delivered in the order their reads were issued,
    /// never in network completion order. The stream ends when a zero-length
    /// chunk arrives or the range is exhausted.
    pub fn read_stream(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> impl Stream<Item = Result<Vec<u8>, FsError>> + Send + 'static {
        let client = self.clone();
        let path = path.to_owned();
        stream! {
            let mut pos = start;
            let mut queue = VecDeque::with_capacity(READ_PREFETCH);
            let mut issue_err = None;
            while queue.len() < READ_PREFETCH && issue_err.is_none() {
                match issue_block(&client, &path, &mut pos, end) {
                    Some(Ok(rx)) => queue.push_back(rx),
                    Some(Err(e)) => issue_err = Some(e),
                    None => break,
                }
            }
            while let Some(block) = queue.pop_front() {
                let chunk = match block.await {
                    Ok(result) => result.and_then(decode_read_data),
                    Err(_) => Err(FsError::Reset),
                };
                match chunk {
                    Ok(bytes) if bytes.is_empty() => return,
                    Ok(bytes) => {
                        yield Ok(bytes);
                        if issue_err.is_none() {
                            match issue_block(&client, &path, &mut pos, end) {
                                Some(Ok(rx)) => queue.push_back(rx),
                                Some(Err(e)) => issue_err = Some(e),
                                None => {}
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if let Some(e) = issue_err {
                yield Err(e);
            }
        }
    }

    /// Sequential write cursor starting at `start`. See [`FsWriteStream`].
    pub fn write_stream(&self, path: &str, start: u64) -> FsWriteStream {
        FsWriteStream {
            client: self.clone(),
            path: path.to_owned(),
            pos: start,
        }
    }
}

impl Default for FsClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds one data channel to an [`FsClient`]: incoming messages feed the
/// pending table and the outbound handle is registered as the socket.
/// The socket is added not-yet-ready; availability is flipped by whoever
/// owns the handshake outcome.
pub struct FsChannelDelegate {
    client: FsClient,
    socket: Option<mpsc::UnboundedSender<Payload>>,
}

impl FsChannelDelegate {
    pub fn new(client: FsClient) -> Self {
        Self {
            client,
            socket: None,
        }
    }
}

impl crate::connection::ChannelDelegate for FsChannelDelegate {
    fn on_open(&mut self, ctx: &mut crate::connection::ChannelCtx<'_>) {
        let socket = ctx.sender();
        self.client.add_socket(socket.clone(), false);
        self.socket = Some(socket);
    }

    fn on_message(&mut self, payload: Payload, _ctx: &mut crate::connection::ChannelCtx<'_>) {
        self.client.handle_payload(&payload);
    }

    fn on_close(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.client.remove_socket(&socket);
        }
    }
}

/// Issues one block read and advances the cursor. `None` once the range is
/// exhausted.
fn issue_block(
    client: &FsClient,
    path: &str,
    pos: &mut u64,
    end: u64,
) -> Option<Result<oneshot::Receiver<Result<RpcData, FsError>>, FsError>> {
    if *pos >= end {
        return None;
    }
    let len = READ_BLOCK_SIZE.min(end - *pos);
    let issued = client.begin_call(FsOp::Read, path, Some(*pos), Some(len as i64), None, None);
    *pos += len;
    Some(issued)
}

fn decode_read_data(data: RpcData) -> Result<Vec<u8>, FsError> {
    match data {
        RpcData::Bytes(bytes) => Ok(bytes),
        // Some endpoints answer reads over a text-only channel.
        RpcData::Json(Value::String(b64)) => protocol::from_base64(&b64),
        RpcData::Json(_) => Err(FsError::protocol("unexpected read response")),
    }
}

/// An input accepted by [`FsWriteStream::push`]: either bytes appended at
/// the cursor or a repositioning of the cursor without flushing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Data(Vec<u8>),
    Seek(u64),
}

/// Streaming write adapter. Chunks are split into sub-blocks of
/// [`WRITE_BLOCK_SIZE`] bytes and the writes for one chunk are issued and
/// awaited sequentially, preserving offset order within the chunk. Distinct
/// instances make no ordering guarantee relative to each other.
pub struct FsWriteStream {
    client: FsClient,
    path: String,
    pos: u64,
}

impl FsWriteStream {
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), FsError> {
        for block in chunk.chunks(WRITE_BLOCK_SIZE) {
            self.client.write(&self.path, self.pos, block).await?;
            self.pos += block.len() as u64;
        }
        Ok(())
    }

    pub async fn push(&mut self, op: WriteOp) -> Result<(), FsError> {
        match op {
            WriteOp::Seek(pos) => {
                self.seek(pos);
                Ok(())
            }
            WriteOp::Data(data) => self.write(&data).await,
        }
    }
}

fn expect_json<T: DeserializeOwned>(data: RpcData) -> Result<T, FsError> {
    match data {
        RpcData::Json(value) => {
            serde_json::from_value(value).map_err(|e| FsError::protocol(e.to_string()))
        }
        RpcData::Bytes(_) => Err(FsError::protocol("expected json response")),
    }
}
