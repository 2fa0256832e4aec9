use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::watch;

use crate::connection::{ChannelCtx, ChannelDelegate};
use crate::error::FsError;
use crate::protocol::{self, ControlMessage};
use crate::transport::Payload;

/// Reserved channel label used for the handshake and generic RPC.
pub const CONTROL_CHANNEL: &str = "controlEvent";

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

/// base64(HMAC-SHA256(secret, fingerprint)): the handshake proof that we
/// hold the shared secret, bound to this session's certificate.
pub fn hmac_sha256_base64(secret: &str, fingerprint: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(fingerprint.as_bytes());
    protocol::to_base64(&mac.finalize().into_bytes())
}

/// Outcome of the handshake for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    /// Authenticated; carries the service names the server granted.
    Granted(Vec<String>),
    Denied,
}

struct ControlRpcInner {
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, FsError>>>>,
    channel: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
}

/// Generic request/response calls over the control channel. Ids are
/// client-local and monotonic; each call carries its own timeout, after
/// which the pending entry is removed and a late result is ignored.
#[derive(Clone)]
pub struct ControlRpc {
    inner: Arc<ControlRpcInner>,
}

impl ControlRpc {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlRpcInner {
                seq: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                channel: Mutex::new(None),
            }),
        }
    }

    pub async fn call(&self, name: &str, params: Value) -> Result<Value, FsError> {
        self.call_with_timeout(name, params, DEFAULT_RPC_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, FsError> {
        let channel = self
            .inner
            .channel
            .lock()
            .clone()
            .ok_or(FsError::NoConnection)?;
        let req_id = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = ControlMessage::Rpc {
            name: name.to_owned(),
            req_id,
            params,
        };
        let text = serde_json::to_string(&msg).map_err(|e| FsError::protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(req_id, tx);
        if channel.unbounded_send(Payload::Text(text)).is_err() {
            self.inner.pending.lock().remove(&req_id);
            return Err(FsError::NoConnection);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FsError::Reset),
            Err(_) => {
                self.inner.pending.lock().remove(&req_id);
                Err(FsError::Timeout)
            }
        }
    }

    fn bind(&self, channel: mpsc::UnboundedSender<Payload>) {
        *self.inner.channel.lock() = Some(channel);
    }

    fn unbind(&self) {
        *self.inner.channel.lock() = None;
    }

    fn settle(&self, req_id: u64, result: Result<Value, FsError>) {
        match self.inner.pending.lock().remove(&req_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(req_id, "ignoring late rpc result"),
        }
    }
}

impl Default for ControlRpc {
    fn default() -> Self {
        Self::new()
    }
}

/// Delegate for the reserved control channel: sends the handshake when the
/// channel opens and dispatches server messages by type. With a session
/// fingerprint available the proof is an HMAC keyed by the shared secret;
/// without one it falls back to sending the secret as a plaintext token.
pub struct AuthDelegate {
    secret: Option<String>,
    request_services: Vec<String>,
    rpc: ControlRpc,
    auth_tx: watch::Sender<AuthState>,
}

impl AuthDelegate {
    pub fn new(secret: Option<String>, rpc: ControlRpc) -> (Self, watch::Receiver<AuthState>) {
        let (auth_tx, auth_rx) = watch::channel(AuthState::Pending);
        (
            Self {
                secret,
                request_services: vec!["file".to_owned()],
                rpc,
                auth_tx,
            },
            auth_rx,
        )
    }
}

impl ChannelDelegate for AuthDelegate {
    fn on_open(&mut self, ctx: &mut ChannelCtx<'_>) {
        self.rpc.bind(ctx.sender());
        let msg = match ctx.fingerprint() {
            Some(fingerprint) => {
                tracing::debug!(%fingerprint, "authenticating with fingerprint hmac");
                ControlMessage::Auth {
                    fingerprint: Some(fingerprint.to_owned()),
                    hmac: self
                        .secret
                        .as_deref()
                        .map(|secret| hmac_sha256_base64(secret, fingerprint)),
                    token: None,
                    request_services: self.request_services.clone(),
                }
            }
            None => {
                tracing::warn!("no session fingerprint; falling back to plaintext token auth");
                ControlMessage::Auth {
                    fingerprint: None,
                    hmac: None,
                    token: self.secret.clone(),
                    request_services: self.request_services.clone(),
                }
            }
        };
        if let Err(e) = ctx.send_json(&msg) {
            tracing::warn!(error = %e, "failed to send auth handshake");
        }
    }

    fn on_message(&mut self, payload: Payload, ctx: &mut ChannelCtx<'_>) {
        let Payload::Text(text) = payload else {
            tracing::debug!("ignoring binary control message");
            return;
        };
        let msg: ControlMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable control message");
                return;
            }
        };
        match msg {
            ControlMessage::AuthResult { result, services } => {
                if result {
                    let services = services.unwrap_or_default();
                    tracing::debug!(?services, "authenticated");
                    self.auth_tx.send_replace(AuthState::Granted(services));
                } else {
                    tracing::warn!("authentication denied");
                    self.auth_tx.send_replace(AuthState::Denied);
                    ctx.disconnect("auth_failed");
                }
            }
            ControlMessage::Redirect { room_id } => ctx.redirect(room_id),
            ControlMessage::RpcResult {
                req_id,
                value,
                error,
            } => {
                let result = match error {
                    Some(err) => Err(FsError::Remote(protocol::error_code(&err))),
                    None => Ok(value.unwrap_or(Value::Null)),
                };
                self.rpc.settle(req_id, result);
            }
            other => tracing::debug!(?other, "unhandled control message"),
        }
    }

    fn on_close(&mut self) {
        self.rpc.unbind();
    }
}
