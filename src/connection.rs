use std::sync::Arc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::future;
use futures::stream::{BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::FsError;
use crate::transport::{ChannelEvent, DataChannel, Payload, PeerSession, SessionEvent, Signaler};

/// Lifecycle of one peer session. `Waiting` means the link is open but no
/// data channel has confirmed readiness yet; `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Waiting,
    Connected,
    Disposed,
}

/// One reported transition. `room_id` is the room the connection was bound
/// to when the transition happened, which differs across a redirect.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: ConnectionState,
    pub previous: ConnectionState,
    pub reason: Option<String>,
    pub room_id: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub room_id: String,
    pub signaling_key: Option<String>,
    /// Delay before an automatic reconnect; `None` disables auto-reconnect.
    pub reconnect_wait: Option<Duration>,
    /// Abort a connect attempt that makes no progress within this window.
    pub connect_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            signaling_key: None,
            reconnect_wait: None,
            connect_timeout: None,
        }
    }
}

/// Actions a delegate can hand back to the engine.
#[derive(Debug)]
enum EngineAction {
    Redirect(String),
    Disconnect(Option<String>),
}

/// What a delegate sees while handling a channel event: the channel's
/// outbound handle, the session fingerprint, and a way to request
/// engine-level actions (redirect, teardown).
pub struct ChannelCtx<'a> {
    label: &'a str,
    fingerprint: Option<&'a str>,
    outbound: &'a mpsc::UnboundedSender<Payload>,
    actions: &'a mut Vec<EngineAction>,
}

impl ChannelCtx<'_> {
    pub fn label(&self) -> &str {
        self.label
    }

    /// Digest of the local session description, when the transport has one.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint
    }

    /// Clonable outbound handle for sending outside the delegate callbacks.
    pub fn sender(&self) -> mpsc::UnboundedSender<Payload> {
        self.outbound.clone()
    }

    pub fn send(&self, payload: Payload) -> Result<(), FsError> {
        self.outbound
            .unbounded_send(payload)
            .map_err(|_| FsError::NoConnection)
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<(), FsError> {
        let text = serde_json::to_string(msg).map_err(|e| FsError::protocol(e.to_string()))?;
        self.send(Payload::Text(text))
    }

    /// Tear down and immediately reconnect to another room.
    pub fn redirect(&mut self, room_id: String) {
        self.actions.push(EngineAction::Redirect(room_id));
    }

    /// Tear the session down with the given reason.
    pub fn disconnect(&mut self, reason: impl Into<String>) {
        self.actions
            .push(EngineAction::Disconnect(Some(reason.into())));
    }
}

/// Per-channel strategy injected into the connection engine. One delegate
/// owns one label; the engine calls it as the channel's events arrive.
/// Handshakes, RPC dispatch and client wiring all live behind this seam
/// instead of in connection subclasses.
pub trait ChannelDelegate: Send + 'static {
    fn on_open(&mut self, ctx: &mut ChannelCtx<'_>);
    fn on_message(&mut self, payload: Payload, ctx: &mut ChannelCtx<'_>);
    fn on_close(&mut self) {}
}

enum Command {
    Connect {
        done: oneshot::Sender<Result<(), FsError>>,
    },
    Disconnect {
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
    ConnectTimeout {
        attempt: u64,
    },
    Reconnect {
        attempt: u64,
    },
}

enum Step {
    Command(Option<Command>),
    Session(Option<SessionEvent>),
    Channel(Option<(u64, String, ChannelEvent)>),
}

/// Cloneable handle onto a running [`ConnectionEngine`].
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    changes_tx: broadcast::Sender<StateChange>,
}

impl ConnectionHandle {
    /// Starts a connect attempt. Fails with `InvalidOperation` unless the
    /// connection is currently disconnected (and not disposed).
    pub async fn connect(&self) -> Result<(), FsError> {
        let (done, rx) = oneshot::channel();
        let mut tx = self.cmd_tx.clone();
        tx.send(Command::Connect { done })
            .await
            .map_err(|_| FsError::InvalidOperation)?;
        rx.await.map_err(|_| FsError::InvalidOperation)?
    }

    pub async fn disconnect(&self, reason: Option<&str>) {
        let (done, rx) = oneshot::channel();
        let mut tx = self.cmd_tx.clone();
        if tx
            .send(Command::Disconnect {
                reason: reason.map(str::to_owned),
                done,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Tears the session down for good. Terminal: no further transitions
    /// are honored or reported and no reconnect is scheduled.
    pub async fn dispose(&self) {
        let (done, rx) = oneshot::channel();
        let mut tx = self.cmd_tx.clone();
        if tx.send(Command::Dispose { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }
}

/// Owns the lifecycle of one peer session: connect, channel binding,
/// reconnect with backoff, timeout, redirect, dispose. Channel behavior is
/// composed in through [`ChannelDelegate`]s registered per label; the
/// engine itself knows nothing about handshakes or file traffic.
pub struct ConnectionEngine {
    signaler: Arc<dyn Signaler>,
    config: ConnectionConfig,
    delegates: Vec<(String, Box<dyn ChannelDelegate>)>,
    session: Option<Box<dyn PeerSession>>,
    outbound: Vec<(String, mpsc::UnboundedSender<Payload>)>,
    channel_events: SelectAll<BoxStream<'static, (u64, String, ChannelEvent)>>,
    /// Binding generation; events stamped with an older one are stale.
    generation: u64,
    /// Connect attempt counter guarding timer identity.
    attempt: u64,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    changes_tx: broadcast::Sender<StateChange>,
    connect_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ConnectionEngine {
    pub fn new(
        signaler: Arc<dyn Signaler>,
        config: ConnectionConfig,
    ) -> (ConnectionHandle, ConnectionEngine) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (changes_tx, _) = broadcast::channel(32);
        let handle = ConnectionHandle {
            cmd_tx: cmd_tx.clone(),
            state_rx,
            changes_tx: changes_tx.clone(),
        };
        let engine = ConnectionEngine {
            signaler,
            config,
            delegates: Vec::new(),
            session: None,
            outbound: Vec::new(),
            channel_events: SelectAll::new(),
            generation: 0,
            attempt: 0,
            cmd_tx,
            cmd_rx,
            state: ConnectionState::Disconnected,
            state_tx,
            changes_tx,
            connect_timer: None,
            reconnect_timer: None,
        };
        (handle, engine)
    }

    /// Registers the delegate owning `label`. Channels are created in
    /// registration order on every (re)connect.
    pub fn register_channel(&mut self, label: impl Into<String>, delegate: Box<dyn ChannelDelegate>) {
        self.delegates.push((label.into(), delegate));
    }

    pub async fn run(mut self) {
        loop {
            let step = {
                let session = &mut self.session;
                let cmd_rx = &mut self.cmd_rx;
                let channels = &mut self.channel_events;
                tokio::select! {
                    cmd = cmd_rx.next() => Step::Command(cmd),
                    ev = async {
                        match session.as_mut() {
                            Some(s) => s.next_event().await,
                            None => future::pending().await,
                        }
                    } => Step::Session(ev),
                    ev = channels.next(), if !channels.is_empty() => Step::Channel(ev),
                }
            };
            match step {
                // All handles dropped: nothing can reach this engine anymore.
                Step::Command(None) => return,
                Step::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        return;
                    }
                }
                Step::Session(Some(event)) => self.handle_session_event(event).await,
                Step::Session(None) => {
                    // Session stream ended without a disconnect event.
                    self.session = None;
                    self.teardown(Some("transport_closed".into()), true).await;
                }
                Step::Channel(Some((generation, label, event))) => {
                    if generation == self.generation {
                        self.handle_channel_event(&label, event).await;
                    }
                }
                Step::Channel(None) => {}
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { done } => {
                let result = if self.state == ConnectionState::Disconnected {
                    self.do_connect().await
                } else {
                    Err(FsError::InvalidOperation)
                };
                let _ = done.send(result);
                false
            }
            Command::Disconnect { reason, done } => {
                self.close_session().await;
                self.teardown(reason, true).await;
                let _ = done.send(());
                false
            }
            Command::Dispose { done } => {
                self.close_session().await;
                self.teardown(Some("dispose".into()), true).await;
                self.update_state(ConnectionState::Disposed, None);
                self.cancel_timers();
                let _ = done.send(());
                true
            }
            Command::ConnectTimeout { attempt } => {
                if attempt == self.attempt
                    && matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::Waiting
                    )
                {
                    tracing::debug!(room = %self.config.room_id, "connect timed out");
                    self.close_session().await;
                    self.teardown(Some("timeout".into()), true).await;
                }
                false
            }
            Command::Reconnect { attempt } => {
                if attempt == self.attempt && self.state == ConnectionState::Disconnected {
                    let _ = self.do_connect().await;
                }
                false
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open => {
                let labels: Vec<String> =
                    self.delegates.iter().map(|(l, _)| l.clone()).collect();
                for label in labels {
                    let created = match self.session.as_mut() {
                        Some(session) => session.create_data_channel(&label).await,
                        None => return,
                    };
                    match created {
                        Ok(channel) => self.bind_channel(channel),
                        Err(e) => {
                            tracing::warn!(%label, error = %e, "failed to create channel")
                        }
                    }
                }
                self.update_state(ConnectionState::Waiting, None);
            }
            SessionEvent::Connect => {
                self.cancel_connect_timer();
                self.update_state(ConnectionState::Connected, None);
            }
            SessionEvent::DataChannel(channel) => self.bind_channel(channel),
            SessionEvent::Disconnect(reason) => {
                self.session = None;
                self.teardown(reason, true).await;
            }
        }
    }

    async fn handle_channel_event(&mut self, label: &str, event: ChannelEvent) {
        let mut actions = Vec::new();
        match event {
            ChannelEvent::Closed => {
                self.outbound.retain(|(l, _)| l != label);
                if let Some(delegate) = delegate_mut(&mut self.delegates, label) {
                    delegate.on_close();
                }
            }
            ChannelEvent::Open | ChannelEvent::Message(_) => {
                let fingerprint = self.session.as_ref().and_then(|s| s.fingerprint());
                let Some(outbound) = self
                    .outbound
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, tx)| tx)
                else {
                    return;
                };
                let Some(delegate) = delegate_mut(&mut self.delegates, label) else {
                    return;
                };
                let mut ctx = ChannelCtx {
                    label,
                    fingerprint: fingerprint.as_deref(),
                    outbound,
                    actions: &mut actions,
                };
                match event {
                    ChannelEvent::Open => delegate.on_open(&mut ctx),
                    ChannelEvent::Message(payload) => delegate.on_message(payload, &mut ctx),
                    ChannelEvent::Closed => unreachable!(),
                }
            }
        }
        self.apply_actions(actions).await;
    }

    async fn apply_actions(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Disconnect(reason) => {
                    self.close_session().await;
                    self.teardown(reason, true).await;
                }
                EngineAction::Redirect(room_id) => {
                    tracing::info!(from = %self.config.room_id, to = %room_id, "redirected");
                    self.close_session().await;
                    self.teardown(Some("redirect".into()), false).await;
                    self.config.room_id = room_id;
                    let _ = self.do_connect().await;
                }
            }
        }
    }

    async fn do_connect(&mut self) -> Result<(), FsError> {
        tracing::debug!(room = %self.config.room_id, "connecting");
        self.cancel_timers();
        self.attempt += 1;
        let attempt = self.attempt;
        self.update_state(ConnectionState::Connecting, None);
        if let Some(timeout) = self.config.connect_timeout {
            let mut cmd_tx = self.cmd_tx.clone();
            self.connect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = cmd_tx.send(Command::ConnectTimeout { attempt }).await;
            }));
        }
        let connected = self
            .signaler
            .connect(&self.config.room_id, self.config.signaling_key.as_deref())
            .await;
        match connected {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(room = %self.config.room_id, error = %e, "connect failed");
                self.teardown(Some("connect_error".into()), true).await;
                Err(e)
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    /// Clears the channel bindings (notifying their delegates so pending
    /// tables unblock), reports `disconnected`, and schedules the automatic
    /// reconnect when allowed for this reason.
    async fn teardown(&mut self, reason: Option<String>, allow_reconnect: bool) {
        self.cancel_timers();
        self.attempt += 1;
        self.generation += 1;
        let bound: Vec<String> = self.outbound.drain(..).map(|(label, _)| label).collect();
        self.channel_events = SelectAll::new();
        for label in bound {
            if let Some(delegate) = delegate_mut(&mut self.delegates, &label) {
                delegate.on_close();
            }
        }

        let reconnect = allow_reconnect
            && !matches!(reason.as_deref(), Some("dispose") | Some("auth_failed"))
            && self.state != ConnectionState::Disconnected
            && self.config.reconnect_wait.is_some();
        if reconnect {
            let wait = self.config.reconnect_wait.unwrap_or_default();
            let attempt = self.attempt;
            let mut cmd_tx = self.cmd_tx.clone();
            self.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = cmd_tx.send(Command::Reconnect { attempt }).await;
            }));
        }
        self.update_state(ConnectionState::Disconnected, reason);
    }

    fn bind_channel(&mut self, channel: DataChannel) {
        let DataChannel { label, tx, events } = channel;
        if !self.delegates.iter().any(|(l, _)| *l == label) {
            tracing::debug!(%label, "ignoring unregistered channel");
            return;
        }
        if self.outbound.iter().any(|(l, _)| *l == label) {
            return;
        }
        tracing::debug!(%label, "channel bound");
        let generation = self.generation;
        let stream_label = label.clone();
        self.outbound.push((label, tx));
        self.channel_events.push(
            events
                .map(move |ev| (generation, stream_label.clone(), ev))
                .boxed(),
        );
    }

    fn update_state(&mut self, state: ConnectionState, reason: Option<String>) {
        if state == self.state || self.state == ConnectionState::Disposed {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        tracing::debug!(
            room = %self.config.room_id,
            ?previous,
            ?state,
            reason = reason.as_deref().unwrap_or(""),
            "state change"
        );
        self.state_tx.send_replace(state);
        let _ = self.changes_tx.send(StateChange {
            state,
            previous,
            reason,
            room_id: self.config.room_id.clone(),
        });
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_connect_timer();
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

fn delegate_mut<'a>(
    delegates: &'a mut [(String, Box<dyn ChannelDelegate>)],
    label: &str,
) -> Option<&'a mut Box<dyn ChannelDelegate>> {
    delegates
        .iter_mut()
        .find(|(l, _)| l == label)
        .map(|(_, d)| d)
}
