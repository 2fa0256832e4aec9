//! Remote filesystem access over peer-to-peer data channels.
//!
//! The signaling layer that negotiates the underlying peer link is supplied
//! by the caller through the [`Signaler`] trait; this crate provides the
//! connection lifecycle (reconnect, timeout, redirect), the authenticated
//! control channel, the multiplexed file-transfer protocol with streaming
//! read/write adapters, and an aggregate registry that mounts several
//! remote endpoints into one browsable namespace.

pub mod auth;
pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod settings;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use auth::{AuthState, ControlRpc, CONTROL_CHANNEL};
pub use client::{FsClient, FsWriteStream, WriteOp};
pub use connection::{
    ChannelCtx, ChannelDelegate, ConnectionConfig, ConnectionEngine, ConnectionHandle,
    ConnectionState, StateChange,
};
pub use error::FsError;
pub use protocol::{FileMetadata, FileStat};
pub use settings::{register_devices, DeviceSettings, Settings};
pub use storage::{
    EndpointConfig, FileInfo, FilePage, Folder, FsConnection, RemoteFolder, RemoteStorage,
    SortField, SortOptions, Storage, StorageRegistry, FILE_CHANNEL,
};
pub use transport::{ChannelEvent, DataChannel, Payload, PeerSession, SessionEvent, Signaler};
