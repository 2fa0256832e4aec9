//! In-memory fakes standing in for the signaling layer and the remote
//! endpoint, shared by the unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, watch};

use crate::auth::{hmac_sha256_base64, AuthState};
use crate::connection::{ChannelCtx, ChannelDelegate, ConnectionState, StateChange};
use crate::error::FsError;
use crate::protocol::{self, ControlMessage, FileStat, FsOp, FsRequest};
use crate::transport::{ChannelEvent, DataChannel, Payload, PeerSession, SessionEvent, Signaler};

const FAKE_UPDATED_TIME: u64 = 1_700_000_000_000;

struct FakeFile {
    data: Vec<u8>,
    updated_time: u64,
}

/// Flat in-memory file tree keyed by full path.
#[derive(Default)]
pub(crate) struct FakeFs {
    files: Mutex<BTreeMap<String, FakeFile>>,
}

impl FakeFs {
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.insert_with_time(path, data, FAKE_UPDATED_TIME);
    }

    pub fn insert_with_time(&self, path: &str, data: Vec<u8>, updated_time: u64) {
        self.files
            .lock()
            .insert(path.to_owned(), FakeFile { data, updated_time });
    }

    pub fn bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|f| f.data.clone())
    }

    fn stat(&self, path: &str) -> Option<FileStat> {
        self.files.lock().get(path).map(|file| FileStat {
            name: path.rsplit('/').next().unwrap_or(path).to_owned(),
            kind: "file".to_owned(),
            size: file.data.len() as u64,
            updated_time: file.updated_time,
            metadata: None,
        })
    }

    fn list(&self, dir: &str, offset: u64, limit: i64, sort: Option<&str>) -> Vec<FileStat> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut stats: Vec<FileStat> = self
            .files
            .lock()
            .iter()
            .filter(|(path, _)| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(path, file)| FileStat {
                name: path[prefix.len()..].to_owned(),
                kind: "file".to_owned(),
                size: file.data.len() as u64,
                updated_time: file.updated_time,
                metadata: None,
            })
            .collect();

        if let Some(sort) = sort {
            let descending = sort.starts_with('-');
            let field = sort.trim_start_matches('-');
            match field {
                "size" => stats.sort_by_key(|s| s.size),
                "updatedTime" => stats.sort_by_key(|s| s.updated_time),
                _ => stats.sort_by(|a, b| a.name.cmp(&b.name)),
            }
            if descending {
                stats.reverse();
            }
        }

        let take = if limit < 0 { usize::MAX } else { limit as usize };
        stats.into_iter().skip(offset as usize).take(take).collect()
    }

    fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, String> {
        let files = self.files.lock();
        let file = files.get(path).ok_or_else(|| "noent".to_owned())?;
        let start = (offset as usize).min(file.data.len());
        let end = (start + len as usize).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }

    fn write(&self, path: &str, offset: u64, data: &[u8]) -> usize {
        let mut files = self.files.lock();
        let file = files.entry(path.to_owned()).or_insert_with(|| FakeFile {
            data: Vec::new(),
            updated_time: FAKE_UPDATED_TIME,
        });
        let end = offset as usize + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(data);
        data.len()
    }

    fn remove(&self, path: &str) -> bool {
        self.files.lock().remove(path).is_some()
    }
}

struct FakeInner {
    secret: Option<String>,
    fingerprint: Option<String>,
    no_connect_event: bool,
    /// `(from_room, to_room)`: the first auth attempt on `from_room` is
    /// answered with a redirect instead of an auth result.
    redirect: Mutex<Option<(String, String)>>,
    /// Buffer this many read requests, then answer them in reverse order.
    reorder_reads: Option<usize>,
    fs: FakeFs,
    connects: Mutex<Vec<String>>,
    links: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

/// Scriptable signaling collaborator. Sessions immediately report `Open`
/// (and `Connect` unless disabled); each created channel gets a server task
/// that speaks the control or fileServer protocol against [`FakeFs`].
pub(crate) struct FakeSignaler {
    inner: Arc<FakeInner>,
}

impl FakeSignaler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                secret: None,
                fingerprint: Some("sha-256 AB:CD:EF:01".to_owned()),
                no_connect_event: false,
                redirect: Mutex::new(None),
                reorder_reads: None,
                fs: FakeFs::default(),
                connects: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    fn inner_mut(&mut self) -> &mut FakeInner {
        Arc::get_mut(&mut self.inner).expect("configure before sharing")
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.inner_mut().secret = Some(secret.to_owned());
        self
    }

    pub fn without_fingerprint(mut self) -> Self {
        self.inner_mut().fingerprint = None;
        self
    }

    pub fn without_connect_event(mut self) -> Self {
        self.inner_mut().no_connect_event = true;
        self
    }

    pub fn with_redirect(self, from: &str, to: &str) -> Self {
        *self.inner.redirect.lock() = Some((from.to_owned(), to.to_owned()));
        self
    }

    pub fn with_reorder_reads(mut self, batch: usize) -> Self {
        self.inner_mut().reorder_reads = Some(batch);
        self
    }

    pub fn fs(&self) -> &FakeFs {
        &self.inner.fs
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.lock().len()
    }

    pub fn connected_rooms(&self) -> Vec<String> {
        self.inner.connects.lock().clone()
    }

    /// Simulates the transport losing the current link.
    pub fn drop_link(&self, reason: Option<&str>) {
        if let Some(link) = self.inner.links.lock().last() {
            let _ = link.unbounded_send(SessionEvent::Disconnect(reason.map(str::to_owned)));
        }
    }
}

#[async_trait]
impl Signaler for FakeSignaler {
    async fn connect(
        &self,
        room_id: &str,
        _signaling_key: Option<&str>,
    ) -> Result<Box<dyn PeerSession>, FsError> {
        self.inner.connects.lock().push(room_id.to_owned());
        let (event_tx, event_rx) = mpsc::unbounded();
        event_tx
            .unbounded_send(SessionEvent::Open)
            .expect("fresh event queue");
        if !self.inner.no_connect_event {
            let _ = event_tx.unbounded_send(SessionEvent::Connect);
        }
        self.inner.links.lock().push(event_tx);
        Ok(Box::new(FakeSession {
            inner: self.inner.clone(),
            room_id: room_id.to_owned(),
            event_rx,
        }))
    }
}

struct FakeSession {
    inner: Arc<FakeInner>,
    room_id: String,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn create_data_channel(&mut self, label: &str) -> Result<DataChannel, FsError> {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (in_tx, in_rx) = mpsc::unbounded();
        tokio::spawn(run_channel_server(
            self.inner.clone(),
            self.room_id.clone(),
            label.to_owned(),
            out_rx,
            in_tx,
        ));
        Ok(DataChannel {
            label: label.to_owned(),
            tx: out_tx,
            events: in_rx,
        })
    }

    fn fingerprint(&self) -> Option<String> {
        self.inner.fingerprint.clone()
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.next().await
    }

    async fn close(&mut self) {
        self.event_rx.close();
    }
}

async fn run_channel_server(
    inner: Arc<FakeInner>,
    room_id: String,
    label: String,
    mut requests: mpsc::UnboundedReceiver<Payload>,
    reply: mpsc::UnboundedSender<ChannelEvent>,
) {
    let _ = reply.unbounded_send(ChannelEvent::Open);
    let mut buffered_reads: Vec<(u32, Vec<u8>)> = Vec::new();
    while let Some(payload) = requests.next().await {
        match label.as_str() {
            crate::auth::CONTROL_CHANNEL => handle_control(&inner, &room_id, payload, &reply),
            _ => handle_file(&inner, payload, &reply, &mut buffered_reads),
        }
    }
}

fn handle_control(
    inner: &Arc<FakeInner>,
    room_id: &str,
    payload: Payload,
    reply: &mpsc::UnboundedSender<ChannelEvent>,
) {
    let Payload::Text(text) = payload else { return };
    let Ok(msg) = serde_json::from_str::<ControlMessage>(&text) else {
        return;
    };
    match msg {
        ControlMessage::Auth {
            fingerprint,
            hmac,
            token,
            ..
        } => {
            let redirect = {
                let mut scripted = inner.redirect.lock();
                if scripted.as_ref().is_some_and(|(from, _)| from == room_id) {
                    scripted.take()
                } else {
                    None
                }
            };
            if let Some((_, to)) = redirect {
                send_message(reply, &ControlMessage::Redirect { room_id: to });
                return;
            }
            let granted = match &inner.secret {
                None => true,
                Some(secret) => match (fingerprint, hmac, token) {
                    (Some(fp), Some(mac), _) => mac == hmac_sha256_base64(secret, &fp),
                    (_, _, Some(tok)) => tok == *secret,
                    _ => false,
                },
            };
            send_message(
                reply,
                &ControlMessage::AuthResult {
                    result: granted,
                    services: granted.then(|| vec!["file".to_owned()]),
                },
            );
        }
        ControlMessage::Rpc {
            name,
            req_id,
            params,
        } => match name.as_str() {
            "echo" => send_message(
                reply,
                &ControlMessage::RpcResult {
                    req_id,
                    value: Some(params),
                    error: None,
                },
            ),
            "slowEcho" => {
                let reply = reply.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    send_message(
                        &reply,
                        &ControlMessage::RpcResult {
                            req_id,
                            value: Some(params),
                            error: None,
                        },
                    );
                });
            }
            _ => send_message(
                reply,
                &ControlMessage::RpcResult {
                    req_id,
                    value: None,
                    error: Some(json!("unknown_rpc")),
                },
            ),
        },
        _ => {}
    }
}

fn handle_file(
    inner: &Arc<FakeInner>,
    payload: Payload,
    reply: &mpsc::UnboundedSender<ChannelEvent>,
    buffered_reads: &mut Vec<(u32, Vec<u8>)>,
) {
    let Payload::Text(text) = payload else { return };
    let Ok(req) = serde_json::from_str::<FsRequest>(&text) else {
        return;
    };
    let rid = req.rid;
    match req.op {
        FsOp::Stat => match inner.fs.stat(&req.path) {
            Some(stat) => send_data(reply, rid, json!(stat)),
            None => send_error(reply, rid, "noent"),
        },
        FsOp::Files => {
            let stats = inner.fs.list(
                &req.path,
                req.p.unwrap_or(0),
                req.l.unwrap_or(-1),
                req.options.as_ref().and_then(|o| o.sort.as_deref()),
            );
            send_data(reply, rid, json!(stats));
        }
        FsOp::Read => match inner.fs.read(&req.path, req.p.unwrap_or(0), req.l.unwrap_or(0) as u64)
        {
            Ok(bytes) => {
                if let Some(batch) = inner.reorder_reads {
                    buffered_reads.push((rid, bytes));
                    if buffered_reads.len() >= batch {
                        for (rid, body) in buffered_reads.drain(..).rev() {
                            send_frame(reply, rid, &body);
                        }
                    }
                } else {
                    send_frame(reply, rid, &bytes);
                }
            }
            Err(code) => send_error(reply, rid, &code),
        },
        FsOp::Write => match req.b.as_deref().map(protocol::from_base64) {
            Some(Ok(data)) => {
                let written = inner.fs.write(&req.path, req.p.unwrap_or(0), &data);
                send_data(reply, rid, json!(written));
            }
            _ => send_error(reply, rid, "bad_request"),
        },
        FsOp::Remove => {
            let removed = inner.fs.remove(&req.path);
            send_data(reply, rid, json!(removed));
        }
    }
}

fn send_message<T: serde::Serialize>(reply: &mpsc::UnboundedSender<ChannelEvent>, msg: &T) {
    let text = serde_json::to_string(msg).expect("fake messages serialize");
    let _ = reply.unbounded_send(ChannelEvent::Message(Payload::Text(text)));
}

fn send_data(reply: &mpsc::UnboundedSender<ChannelEvent>, rid: u32, data: serde_json::Value) {
    send_message(reply, &json!({"rid": rid, "data": data}));
}

fn send_error(reply: &mpsc::UnboundedSender<ChannelEvent>, rid: u32, code: &str) {
    send_message(reply, &json!({"rid": rid, "error": code}));
}

fn send_frame(reply: &mpsc::UnboundedSender<ChannelEvent>, rid: u32, body: &[u8]) {
    let _ = reply.unbounded_send(ChannelEvent::Message(Payload::Binary(
        protocol::encode_binary_frame(rid, body),
    )));
}

/// Delegate that ignores everything; used where only lifecycle matters.
pub(crate) struct NullDelegate;

impl ChannelDelegate for NullDelegate {
    fn on_open(&mut self, _ctx: &mut ChannelCtx<'_>) {}
    fn on_message(&mut self, _payload: Payload, _ctx: &mut ChannelCtx<'_>) {}
}

pub(crate) async fn collect_states(
    rx: &mut broadcast::Receiver<StateChange>,
    count: usize,
) -> Vec<ConnectionState> {
    let mut states = Vec::with_capacity(count);
    while states.len() < count {
        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for state change")
            .expect("state channel closed");
        states.push(change.state);
    }
    states
}

/// Receives transitions until `target` shows up, returning that change.
pub(crate) async fn wait_for_state(
    rx: &mut broadcast::Receiver<StateChange>,
    target: ConnectionState,
) -> StateChange {
    loop {
        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
        if change.state == target {
            return change;
        }
    }
}

pub(crate) async fn wait_for_auth(rx: &mut watch::Receiver<AuthState>) -> AuthState {
    loop {
        let state = rx.borrow_and_update().clone();
        if state != AuthState::Pending {
            return state;
        }
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("timed out waiting for auth")
            .expect("auth channel closed");
    }
}
