use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthDelegate, AuthState, ControlRpc, CONTROL_CHANNEL};
use crate::client::{FsChannelDelegate, FsClient};
use crate::connection::{ConnectionConfig, ConnectionEngine, ConnectionHandle, ConnectionState};
use crate::error::FsError;
use crate::protocol::{FileStat, ListOptions};
use crate::transport::Signaler;

/// Channel label carrying filesystem traffic.
pub const FILE_CHANNEL: &str = "fileServer";

/// Default byte range fetched for a thumbnail stream.
const THUMBNAIL_RANGE: u64 = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Size,
    UpdatedTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOptions {
    pub field: SortField,
    pub ascending: bool,
}

impl SortOptions {
    fn to_list_options(self) -> ListOptions {
        let field = match self.field {
            SortField::Name => "name",
            SortField::Size => "size",
            SortField::UpdatedTime => "updatedTime",
        };
        ListOptions {
            sort: Some(if self.ascending {
                field.to_owned()
            } else {
                format!("-{field}")
            }),
        }
    }
}

/// One page of a listing. `next` is the offset to resume from; `None`
/// means the listing is exhausted.
pub struct FilePage {
    pub items: Vec<FileInfo>,
    pub next: Option<u64>,
}

#[derive(Clone)]
struct RemoteOps {
    client: FsClient,
    path: String,
    thumbnail: Option<String>,
}

/// A listed entry plus its derived capabilities, bound to the owning
/// client and path. Created per list response, never persisted.
#[derive(Clone)]
pub struct FileInfo {
    pub name: String,
    /// `"folder"` for directories, otherwise the entry's content type.
    pub kind: String,
    pub size: u64,
    pub updated_time: u64,
    pub tags: Vec<String>,
    /// Full path including the mount prefix, resolvable via the registry.
    pub path: String,
    remote: Option<RemoteOps>,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.kind == "folder"
    }

    /// Byte-chunk stream over `start..end` of this entry; `end` defaults to
    /// the entry size.
    pub fn fetch(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, FsError>>, FsError> {
        let ops = self.remote.as_ref().ok_or(FsError::InvalidOperation)?;
        let end = end.unwrap_or(self.size);
        Ok(Box::pin(ops.client.read_stream(&ops.path, start, end)))
    }

    /// Replaces the entry's content, returning the byte count written.
    pub async fn update(&self, data: &[u8]) -> Result<u64, FsError> {
        let ops = self.remote.as_ref().ok_or(FsError::InvalidOperation)?;
        ops.client.write(&ops.path, 0, data).await
    }

    pub async fn remove(&self) -> Result<bool, FsError> {
        let ops = self.remote.as_ref().ok_or(FsError::InvalidOperation)?;
        ops.client.remove(&ops.path).await
    }

    pub fn thumbnail(&self) -> Option<Thumbnail> {
        let ops = self.remote.as_ref()?;
        let suffix = ops.thumbnail.as_deref()?;
        Some(Thumbnail {
            client: ops.client.clone(),
            path: format!("{}{suffix}", ops.path),
        })
    }
}

/// Small pre-rendered preview some endpoints expose next to an entry.
pub struct Thumbnail {
    client: FsClient,
    path: String,
}

impl Thumbnail {
    pub const CONTENT_TYPE: &'static str = "image/jpeg";

    pub fn fetch(&self, start: u64, end: Option<u64>) -> BoxStream<'static, Result<Vec<u8>, FsError>> {
        Box::pin(
            self.client
                .read_stream(&self.path, start, end.unwrap_or(THUMBNAIL_RANGE)),
        )
    }
}

/// A uniform directory listing: pagination, sort order, uploads.
#[async_trait]
pub trait Folder: Send + Sync {
    async fn get_files(
        &self,
        offset: u64,
        limit: u64,
        sort: Option<SortOptions>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FilePage, FsError>;

    /// Path of the parent listing, or `None` at a root.
    fn parent_path(&self) -> Option<String>;

    async fn write_file(&self, _name: &str, _data: &[u8]) -> Result<(), FsError> {
        Err(FsError::InvalidOperation)
    }
}

/// Folder view over one path of a remote endpoint.
pub struct RemoteFolder {
    client: FsClient,
    path: String,
    prefix: String,
}

impl RemoteFolder {
    pub fn new(client: FsClient, path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    fn file_info(&self, dir: &str, stat: FileStat) -> FileInfo {
        let FileStat {
            name,
            kind,
            size,
            updated_time,
            metadata,
        } = stat;
        let kind = if kind == "directory" {
            "folder".to_owned()
        } else {
            kind
        };
        let (thumbnail, tags) = metadata
            .map(|m| (m.thumbnail, m.tags.unwrap_or_default()))
            .unwrap_or((None, Vec::new()));
        let remote_path = format!("{dir}{name}");
        FileInfo {
            path: format!("{}{remote_path}", self.prefix),
            name,
            kind,
            size,
            updated_time,
            tags,
            remote: Some(RemoteOps {
                client: self.client.clone(),
                path: remote_path,
                thumbnail,
            }),
        }
    }
}

#[async_trait]
impl Folder for RemoteFolder {
    async fn get_files(
        &self,
        offset: u64,
        limit: u64,
        sort: Option<SortOptions>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FilePage, FsError> {
        self.client.wait().await;
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(FsError::Aborted);
        }
        let options = sort.map(SortOptions::to_list_options);
        let stats = self
            .client
            .files(&self.path, offset, limit as i64, options)
            .await?;
        let dir = if self.path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.path)
        };
        let items: Vec<FileInfo> = stats
            .into_iter()
            .map(|stat| self.file_info(&dir, stat))
            .collect();
        let next = if items.len() >= limit as usize {
            Some(offset + limit)
        } else {
            None
        };
        Ok(FilePage { items, next })
    }

    fn parent_path(&self) -> Option<String> {
        if self.path.is_empty() || self.path == "/" {
            return None;
        }
        let parent = &self.path[..self.path.rfind('/').unwrap_or(0)];
        Some(format!("{}{parent}", self.prefix))
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), FsError> {
        let path = if self.path.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{name}", self.path)
        };
        self.client.write_stream(&path, 0).write(data).await
    }
}

/// Per-endpoint connection settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub room_id: String,
    pub signaling_key: Option<String>,
    pub secret: Option<String>,
    pub reconnect_wait: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl EndpointConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            signaling_key: None,
            secret: None,
            reconnect_wait: None,
            connect_timeout: None,
        }
    }
}

/// One remote endpoint fully wired: the connection engine with the control
/// handshake and file channel registered, the shared RPC client, and the
/// handshake outcome. Auth grant flips the client available.
pub struct FsConnection {
    pub client: FsClient,
    pub handle: ConnectionHandle,
    pub rpc: ControlRpc,
    pub auth: watch::Receiver<AuthState>,
}

impl FsConnection {
    /// Assembles and spawns the engine. `connect` still has to be called on
    /// the returned handle.
    pub fn open(signaler: Arc<dyn Signaler>, config: &EndpointConfig) -> FsConnection {
        let client = FsClient::new();
        let rpc = ControlRpc::new();
        let (auth_delegate, auth_rx) = AuthDelegate::new(config.secret.clone(), rpc.clone());

        let mut conn_config = ConnectionConfig::new(config.room_id.clone());
        conn_config.signaling_key = config.signaling_key.clone();
        conn_config.reconnect_wait = config.reconnect_wait;
        conn_config.connect_timeout = config.connect_timeout;

        let (handle, mut engine) = ConnectionEngine::new(signaler, conn_config);
        engine.register_channel(CONTROL_CHANNEL, Box::new(auth_delegate));
        engine.register_channel(FILE_CHANNEL, Box::new(FsChannelDelegate::new(client.clone())));
        tokio::spawn(engine.run());

        {
            let client = client.clone();
            let mut auth_rx = auth_rx.clone();
            tokio::spawn(async move {
                loop {
                    if let AuthState::Granted(_) = auth_rx.borrow_and_update().clone() {
                        client.set_available(true);
                    }
                    if auth_rx.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        FsConnection {
            client,
            handle,
            rpc,
            auth: auth_rx,
        }
    }
}

/// One registered endpoint within the aggregate registry.
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves a folder under this mount. `prefix` is prepended to the
    /// paths of the returned entries.
    fn get_folder(&self, path: &str, prefix: &str) -> Option<Box<dyn Folder>>;

    /// Called when the mount is removed from the registry.
    fn detach(&self) {}
}

/// Lazily-connected remote mount. The connection is created on first
/// folder access, dropped once the engine gives up on it, and disposed
/// when the mount is removed.
pub struct RemoteStorage {
    name: String,
    signaler: Arc<dyn Signaler>,
    config: EndpointConfig,
    conn: Arc<Mutex<Option<FsConnection>>>,
}

impl RemoteStorage {
    pub fn new(name: impl Into<String>, signaler: Arc<dyn Signaler>, config: EndpointConfig) -> Self {
        Self {
            name: name.into(),
            signaler,
            config,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn ensure_connection(&self) -> FsClient {
        let mut slot = self.conn.lock();
        if let Some(conn) = slot.as_ref() {
            return conn.client.clone();
        }

        let conn = FsConnection::open(self.signaler.clone(), &self.config);

        // Drop the connection object once the engine stops retrying; the
        // next folder access reconnects from scratch.
        {
            let mut changes = conn.handle.subscribe();
            let slot_ref = self.conn.clone();
            let retry_configured = self.config.reconnect_wait.is_some();
            tokio::spawn(async move {
                while let Ok(change) = changes.recv().await {
                    if change.state != ConnectionState::Disconnected {
                        continue;
                    }
                    let reason = change.reason.as_deref();
                    if reason == Some("redirect") {
                        continue;
                    }
                    let retrying = retry_configured
                        && !matches!(reason, Some("dispose") | Some("auth_failed"));
                    if !retrying {
                        if let Some(dead) = slot_ref.lock().take() {
                            let handle = dead.handle.clone();
                            tokio::spawn(async move { handle.dispose().await });
                        }
                        break;
                    }
                }
            });
        }

        let handle = conn.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.connect().await {
                tracing::warn!(error = %e, "endpoint connect failed");
            }
        });

        let client = conn.client.clone();
        *slot = Some(conn);
        client
    }
}

impl Storage for RemoteStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_folder(&self, path: &str, prefix: &str) -> Option<Box<dyn Folder>> {
        let client = self.ensure_connection();
        Some(Box::new(RemoteFolder::new(client, path, prefix)))
    }

    fn detach(&self) {
        if let Some(conn) = self.conn.lock().take() {
            let handle = conn.handle.clone();
            tokio::spawn(async move { handle.dispose().await });
        }
    }
}

struct Mount {
    id: String,
    storage: Arc<dyn Storage>,
}

/// Ordered mapping of mount id to endpoint, aggregated into one namespace.
/// Insertion order defines display order. The registry root is itself a
/// synthetic folder whose entries are the mount points.
#[derive(Clone)]
pub struct StorageRegistry {
    mounts: Arc<Mutex<Vec<Mount>>>,
    revision: Arc<watch::Sender<u64>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            mounts: Arc::new(Mutex::new(Vec::new())),
            revision: Arc::new(revision),
        }
    }

    pub fn add_storage(&self, id: impl Into<String>, storage: Arc<dyn Storage>) {
        let id = id.into();
        {
            let mut mounts = self.mounts.lock();
            match mounts.iter_mut().find(|m| m.id == id) {
                Some(mount) => mount.storage = storage,
                None => mounts.push(Mount { id, storage }),
            }
        }
        self.notify();
    }

    pub fn remove_storage(&self, id: &str) -> bool {
        let removed = {
            let mut mounts = self.mounts.lock();
            mounts
                .iter()
                .position(|m| m.id == id)
                .map(|i| mounts.remove(i))
        };
        match removed {
            Some(mount) => {
                mount.storage.detach();
                self.notify();
                true
            }
            None => false,
        }
    }

    pub fn mount_ids(&self) -> Vec<String> {
        self.mounts.lock().iter().map(|m| m.id.clone()).collect()
    }

    /// Bumped once per registry mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Resolves a folder anywhere in the namespace. The empty path is the
    /// registry root; otherwise the first segment selects the mount.
    pub fn get_folder(&self, path: &str) -> Option<Box<dyn Folder>> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Some(Box::new(self.root()));
        }
        let (mount_id, rest) = match path.split_once('/') {
            Some((mount_id, rest)) => (mount_id, rest),
            None => (path, ""),
        };
        let storage = self
            .mounts
            .lock()
            .iter()
            .find(|m| m.id == mount_id)?
            .storage
            .clone();
        storage.get_folder(rest, &format!("{mount_id}/"))
    }

    pub fn root(&self) -> RegistryFolder {
        RegistryFolder {
            registry: self.clone(),
        }
    }

    fn entries(&self) -> Vec<FileInfo> {
        self.mounts
            .lock()
            .iter()
            .map(|mount| FileInfo {
                name: mount.storage.name().to_owned(),
                kind: "folder".to_owned(),
                size: 0,
                updated_time: 0,
                tags: Vec::new(),
                path: mount.id.clone(),
                remote: None,
            })
            .collect()
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The synthetic root folder listing the mount points.
pub struct RegistryFolder {
    registry: StorageRegistry,
}

#[async_trait]
impl Folder for RegistryFolder {
    async fn get_files(
        &self,
        offset: u64,
        limit: u64,
        sort: Option<SortOptions>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FilePage, FsError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(FsError::Aborted);
        }
        let mut items = self.registry.entries();
        if let Some(sort) = sort {
            sort_items(&mut items, sort);
        }
        let total = items.len() as u64;
        let limit = if limit == 0 { total } else { limit };
        let items: Vec<FileInfo> = items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        let next = (offset + limit < total).then_some(offset + limit);
        Ok(FilePage { items, next })
    }

    fn parent_path(&self) -> Option<String> {
        None
    }
}

fn sort_items(items: &mut [FileInfo], sort: SortOptions) {
    match sort.field {
        SortField::Name => items.sort_by(|a, b| a.name.cmp(&b.name)),
        SortField::Size => items.sort_by_key(|i| i.size),
        SortField::UpdatedTime => items.sort_by_key(|i| i.updated_time),
    }
    if !sort.ascending {
        items.reverse();
    }
}
