// RelayTransport — TURN allocation driven by a background task
//
// The constructor only validates parameters and spawns the polling task; all
// network work happens on that task and is reported through callbacks.
// Callbacks and shutdown serialize on one mutex, so once `shutdown` has taken
// it no callback is running and none will run again.

use super::codec::{StunCodec, StunFrame};
use super::session::{RequestKind, SessionEvent, TurnSession};
use super::state::{ReadinessTracker, RelayState};
use super::stun::{Class, Method, StunError, HEADER_LEN};
use super::DEFAULT_TURN_PORT;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Lifetime requested on refresh, in seconds
const ALLOCATION_LIFETIME: u32 = 600;
/// Refresh this long before the allocation expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Permissions expire after 5 minutes on the server
const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(240);
const DEALLOCATE_TIMEOUT: Duration = Duration::from_secs(2);
/// Largest payload that still fits one STUN message with its attributes
pub const MAX_RELAY_PAYLOAD: usize = u16::MAX as usize - 512;
/// Unread data kept per peer, in packets of `max_packet_size`
const INBOUND_BUFFER_PACKETS: usize = 64;
/// Peers with unread data buffered at the same time
const MAX_INBOUND_PEERS: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay server address is empty")]
    MissingServer,
    #[error("No Tokio runtime available")]
    NoRuntime,
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(IpAddr),
    #[error("Relay is not ready")]
    NotReady,
    #[error("Peer {0} is not permitted")]
    PeerNotPermitted(IpAddr),
    #[error("No relayed connection from peer {0}")]
    NoPeerConnection(SocketAddr),
    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },
    #[error("Relay transport closed")]
    Closed,
    #[error("Relay session failed: {0}")]
    Session(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),
}

// ============================================================================
// PARAMETERS & HANDLERS
// ============================================================================

/// Transport used between the relay and remote peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionMode {
    #[default]
    Udp,
    Tcp,
}

impl PeerConnectionMode {
    /// IANA protocol number for REQUESTED-TRANSPORT
    pub fn protocol_number(self) -> u8 {
        match self {
            PeerConnectionMode::Udp => 17,
            PeerConnectionMode::Tcp => 6,
        }
    }
}

#[derive(Clone)]
pub struct RelayTransportParams {
    pub server: String,
    /// Defaults to [`DEFAULT_TURN_PORT`]
    pub port: Option<u16>,
    pub realm: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub peer_connection_mode: PeerConnectionMode,
    /// Largest payload accepted by `send_to`, capped at [`MAX_RELAY_PAYLOAD`]
    pub max_packet_size: usize,
    /// Report failure if the allocation is not ready in time
    pub allocation_timeout: Duration,
    /// Per-request response deadline
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RelayTransportParams {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: None,
            realm: String::new(),
            username: String::new(),
            password: Zeroizing::new(String::new()),
            peer_connection_mode: PeerConnectionMode::Udp,
            max_packet_size: 16 * 1024,
            allocation_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl RelayTransportParams {
    pub fn server_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TURN_PORT)
    }

    /// Largest STUN frame we expect on the wire
    fn frame_limit(&self) -> usize {
        (self.max_packet_size + 512).min(u16::MAX as usize + HEADER_LEN)
    }
}

impl fmt::Debug for RelayTransportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransportParams")
            .field("server", &self.server)
            .field("port", &self.server_port())
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("peer_connection_mode", &self.peer_connection_mode)
            .finish_non_exhaustive()
    }
}

pub type ReadyCallback = Box<dyn FnOnce(bool) + Send>;
pub type PeerConnectionCallback = Box<dyn Fn(u32, SocketAddr) + Send + Sync>;
pub type StateChangeCallback = Box<dyn Fn(RelayState, RelayState) + Send + Sync>;

/// Callbacks invoked from the polling task
#[derive(Default)]
pub struct RelayHandlers {
    on_ready: Option<ReadyCallback>,
    on_peer_connection: Option<PeerConnectionCallback>,
    on_state_change: Option<StateChangeCallback>,
}

impl RelayHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once: `true` when the allocation first becomes ready,
    /// `false` if it fails before that
    pub fn on_ready(mut self, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    /// Called with the connection id and address of each peer that connects
    /// to the relayed address (TCP mode)
    pub fn on_peer_connection(mut self, callback: impl Fn(u32, SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_peer_connection = Some(Box::new(callback));
        self
    }

    /// Called with `(old, new)` on every state transition
    pub fn on_state_change(
        mut self,
        callback: impl Fn(RelayState, RelayState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(callback));
        self
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct CallbackGate {
    readiness: ReadinessTracker,
    handlers: RelayHandlers,
}

#[derive(Default)]
struct Addresses {
    relayed: Option<SocketAddr>,
    mapped: Option<SocketAddr>,
}

/// Bytes received from one peer, not yet read
#[derive(Default)]
struct PeerBuffer {
    data: Mutex<Vec<u8>>,
    notify: Notify,
}

struct Shared {
    state: watch::Sender<RelayState>,
    addresses: RwLock<Addresses>,
    permitted: RwLock<BTreeSet<IpAddr>>,
    inbound: Mutex<HashMap<SocketAddr, Arc<PeerBuffer>>>,
    /// Per-peer cap of unread bytes
    max_buffered: usize,
    /// Writers for TCP peer data connections
    connections: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>,
    /// Held while a callback runs
    gate: Mutex<CallbackGate>,
    /// Checked without the gate, so a callback may drop its own transport
    callbacks_closed: AtomicBool,
    /// Cancelled once no more data can arrive
    io_closed: CancellationToken,
}

impl Shared {
    fn new(handlers: RelayHandlers, max_packet_size: usize) -> Self {
        let (state, _) = watch::channel(RelayState::Uninitialized);
        Self {
            state,
            addresses: RwLock::new(Addresses::default()),
            permitted: RwLock::new(BTreeSet::new()),
            inbound: Mutex::new(HashMap::new()),
            max_buffered: max_packet_size.max(1) * INBOUND_BUFFER_PACKETS,
            connections: Mutex::new(HashMap::new()),
            gate: Mutex::new(CallbackGate {
                readiness: ReadinessTracker::default(),
                handlers,
            }),
            callbacks_closed: AtomicBool::new(false),
            io_closed: CancellationToken::new(),
        }
    }

    fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    fn set_state(&self, new: RelayState) {
        let old = self.state.send_replace(new);
        if old == new {
            return;
        }
        info!(from = %old, to = %new, "Relay state changed");

        if self.callbacks_closed() {
            return;
        }
        let mut gate = self.gate.lock();
        if self.callbacks_closed() {
            return;
        }
        if let Some(callback) = &gate.handlers.on_state_change {
            callback(old, new);
        }
        if self.callbacks_closed() {
            return;
        }
        if let Some(ready) = gate.readiness.on_transition(old, new) {
            if let Some(callback) = gate.handlers.on_ready.take() {
                callback(ready);
            }
        }
    }

    fn callbacks_closed(&self) -> bool {
        self.callbacks_closed.load(Ordering::Acquire)
    }

    /// Stop future callbacks without waiting. Safe to call from inside one.
    fn mute_callbacks(&self) {
        self.callbacks_closed.store(true, Ordering::Release);
    }

    /// After this returns no callback is running and none will run.
    /// Must not be called from a callback.
    fn close_callbacks(&self) {
        self.mute_callbacks();
        let mut gate = self.gate.lock();
        gate.readiness.close();
        gate.handlers = RelayHandlers::default();
    }

    fn notify_peer_connection(&self, connection_id: u32, peer: SocketAddr) {
        if self.callbacks_closed() {
            return;
        }
        let gate = self.gate.lock();
        if self.callbacks_closed() {
            return;
        }
        if let Some(callback) = &gate.handlers.on_peer_connection {
            callback(connection_id, peer);
        }
    }

    fn buffer(&self, peer: SocketAddr) -> Arc<PeerBuffer> {
        self.inbound.lock().entry(peer).or_default().clone()
    }

    fn deliver(&self, peer: SocketAddr, payload: &[u8]) {
        let buffer = {
            let mut inbound = self.inbound.lock();
            if !inbound.contains_key(&peer) && inbound.len() >= MAX_INBOUND_PEERS {
                warn!(peer = %peer, "Too many peers with unread relay data, dropping");
                return;
            }
            inbound.entry(peer).or_default().clone()
        };
        {
            let mut data = buffer.data.lock();
            if data.len() + payload.len() > self.max_buffered {
                warn!(peer = %peer, buffered = data.len(), dropped = payload.len(), "Relay receive buffer full, dropping data");
                return;
            }
            data.extend_from_slice(payload);
        }
        buffer.notify.notify_waiters();
    }

    /// Forget the buffer of `peer` once it is drained and nobody waits on it
    fn release_buffer(&self, peer: SocketAddr) {
        let mut inbound = self.inbound.lock();
        let idle = inbound
            .get(&peer)
            .map_or(false, |buffer| Arc::strong_count(buffer) == 1 && buffer.data.lock().is_empty());
        if idle {
            inbound.remove(&peer);
        }
    }
}

// ============================================================================
// RELAY TRANSPORT
// ============================================================================

enum Command {
    Permit(IpAddr),
    Send { peer: SocketAddr, data: Bytes },
}

pub struct RelayTransport {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    mode: PeerConnectionMode,
    max_packet_size: usize,
}

impl RelayTransport {
    /// Start allocating with a single readiness callback
    pub fn new(
        params: RelayTransportParams,
        on_ready: impl FnOnce(bool) + Send + 'static,
    ) -> Result<Self, RelayError> {
        Self::with_handlers(params, RelayHandlers::new().on_ready(on_ready))
    }

    /// Start allocating. Fails immediately only on invalid parameters or
    /// when called outside a Tokio runtime.
    pub fn with_handlers(params: RelayTransportParams, handlers: RelayHandlers) -> Result<Self, RelayError> {
        if params.server.trim().is_empty() {
            return Err(RelayError::MissingServer);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RelayError::NoRuntime)?;

        let mut params = params;
        if params.max_packet_size > MAX_RELAY_PAYLOAD {
            warn!(
                requested = params.max_packet_size,
                max = MAX_RELAY_PAYLOAD,
                "Relay packet size too large, capping"
            );
            params.max_packet_size = MAX_RELAY_PAYLOAD;
        }
        let shared = Arc::new(Shared::new(handlers, params.max_packet_size));

        info!(
            server = %params.server,
            port = params.server_port(),
            mode = ?params.peer_connection_mode,
            "Starting relay allocation"
        );

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let mode = params.peer_connection_mode;
        let max_packet_size = params.max_packet_size;
        let driver = Driver::new(shared.clone(), params, cancel.clone(), command_rx);
        let worker = runtime.spawn(driver.run());

        Ok(Self {
            shared,
            cancel,
            commands,
            worker: tokio::sync::Mutex::new(Some(worker)),
            mode,
            max_packet_size,
        })
    }

    pub fn state(&self) -> RelayState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Resolve once the allocation is ready (`true`) or has failed (`false`)
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.shared.state.subscribe();
        let ready = match rx.wait_for(|s| s.is_ready() || s.is_finished()).await {
            Ok(state) => state.is_ready(),
            Err(_) => false,
        };
        ready
    }

    pub fn peer_connection_mode(&self) -> PeerConnectionMode {
        self.mode
    }

    /// Address the relay allocated for us; peers send here
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.shared.addresses.read().relayed
    }

    /// Our address as seen by the relay server
    pub fn mapped_addr(&self) -> Option<SocketAddr> {
        self.shared.addresses.read().mapped
    }

    /// Allow traffic from/to `addr`. Permissions requested before the
    /// allocation is ready are installed when it becomes ready.
    pub fn permit_peer(&self, addr: IpAddr) -> Result<(), RelayError> {
        if addr.is_unspecified() {
            return Err(RelayError::InvalidPeerAddress(addr));
        }
        if let Some(relayed) = self.relayed_addr() {
            if relayed.is_ipv4() != addr.is_ipv4() {
                warn!(peer = %addr, relayed = %relayed, "Peer address family does not match relayed address, ignoring");
                return Ok(());
            }
        }
        if !self.shared.permitted.write().insert(addr) {
            return Ok(());
        }
        debug!(peer = %addr, "Peer permitted");
        // The polling task may already be gone; the set is still updated
        let _ = self.commands.send(Command::Permit(addr));
        Ok(())
    }

    pub fn permitted_peers(&self) -> Vec<IpAddr> {
        self.shared.permitted.read().iter().copied().collect()
    }

    /// Queue `data` for `peer`; returns without waiting for the network
    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result<(), RelayError> {
        if data.len() > self.max_packet_size {
            return Err(RelayError::PacketTooLarge {
                size: data.len(),
                max: self.max_packet_size,
            });
        }
        if !self.is_ready() {
            return Err(RelayError::NotReady);
        }
        if !self.shared.permitted.read().contains(&peer.ip()) {
            return Err(RelayError::PeerNotPermitted(peer.ip()));
        }

        let data = Bytes::copy_from_slice(data);
        match self.mode {
            PeerConnectionMode::Udp => self
                .commands
                .send(Command::Send { peer, data })
                .map_err(|_| RelayError::Closed),
            PeerConnectionMode::Tcp => {
                let writer = self
                    .shared
                    .connections
                    .lock()
                    .get(&peer)
                    .cloned()
                    .ok_or(RelayError::NoPeerConnection(peer))?;
                writer.send(data).map_err(|_| RelayError::Closed)
            }
        }
    }

    /// `send_to` with a trailing newline
    pub fn writeline_to(&self, peer: SocketAddr, line: &[u8]) -> Result<(), RelayError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line);
        data.push(b'\n');
        self.send_to(peer, &data)
    }

    /// Wait for data from `peer` and return everything buffered so far
    pub async fn recv_from(&self, peer: SocketAddr) -> Result<Vec<u8>, RelayError> {
        self.read_with(peer, |buf| {
            if buf.is_empty() {
                None
            } else {
                Some(std::mem::take(buf))
            }
        })
        .await
    }

    /// Wait for a full line from `peer`, returned without the newline
    pub async fn readline_from(&self, peer: SocketAddr) -> Result<Vec<u8>, RelayError> {
        self.read_with(peer, |buf| {
            let end = buf.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = buf.drain(..=end).collect();
            line.pop();
            Some(line)
        })
        .await
    }

    async fn read_with<T>(
        &self,
        peer: SocketAddr,
        mut take: impl FnMut(&mut Vec<u8>) -> Option<T>,
    ) -> Result<T, RelayError> {
        let buffer = self.shared.buffer(peer);
        loop {
            let notified = buffer.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = {
                let mut data = buffer.data.lock();
                take(&mut *data)
            };
            if let Some(out) = taken {
                return Ok(out);
            }
            if self.shared.io_closed.is_cancelled() {
                return Err(RelayError::Closed);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.io_closed.cancelled() => {}
            }
        }
    }

    /// Release the allocation and stop the polling task. Safe to call more
    /// than once; later calls wait for the first to finish.
    pub async fn shutdown(&self) {
        let mut worker = self.worker.lock().await;
        self.shared.close_callbacks();
        self.cancel.cancel();

        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                warn!("Relay polling task ended abnormally: {}", e);
            }
            self.shared.set_state(RelayState::Destroying);
            self.shared.io_closed.cancel();
            info!("Relay transport shut down");
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        // May run inside one of our own callbacks, so never wait on the gate
        self.shared.mute_callbacks();
        self.cancel.cancel();
    }
}

// ============================================================================
// POLLING TASK
// ============================================================================

type ControlStream = Framed<TcpStream, StunCodec>;

struct Driver {
    shared: Arc<Shared>,
    params: RelayTransportParams,
    session: TurnSession,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    started: Instant,
    server: Option<SocketAddr>,
    refresh_at: Option<Instant>,
    permissions_refresh_at: Option<Instant>,
    awaiting_permissions: bool,
    data_connections: JoinSet<()>,
}

impl Driver {
    fn new(
        shared: Arc<Shared>,
        params: RelayTransportParams,
        cancel: CancellationToken,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let session = TurnSession::new(
            &params.username,
            &params.password,
            &params.realm,
            params.peer_connection_mode.protocol_number(),
        );
        Self {
            shared,
            params,
            session,
            cancel,
            commands,
            started: Instant::now(),
            server: None,
            refresh_at: None,
            permissions_refresh_at: None,
            awaiting_permissions: false,
            data_connections: JoinSet::new(),
        }
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let deadline = tokio::time::Instant::from_std(self.started + self.params.allocation_timeout);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = tokio::time::timeout_at(deadline, self.connect()) => match result {
                Ok(Ok(control)) => Ok(Some(control)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RelayError::Session("allocation timed out".to_string())),
            },
        };

        match connected {
            Ok(Some(mut control)) => match self.serve(&mut control).await {
                Ok(()) => self.teardown(Some(&mut control)).await,
                Err(e) => self.fail(e),
            },
            Ok(None) => self.teardown(None).await,
            Err(e) => self.fail(e),
        }

        self.data_connections.shutdown().await;
        self.shared.connections.lock().clear();
        self.shared.io_closed.cancel();
        debug!("Relay polling task stopped");
    }

    fn fail(&self, error: RelayError) {
        warn!(server = %self.params.server, error = %error, "Relay session failed");
        self.shared.set_state(RelayState::Disconnected);
    }

    async fn connect(&mut self) -> Result<ControlStream, RelayError> {
        self.shared.set_state(RelayState::Resolving);
        let request_timeout = self.params.request_timeout;
        let host = (self.params.server.as_str(), self.params.server_port());

        let server = timeout(request_timeout, tokio::net::lookup_host(host))
            .await
            .map_err(|_| RelayError::Session("server lookup timed out".to_string()))?
            .map_err(|e| RelayError::Io(e.to_string()))?
            .next()
            .ok_or_else(|| RelayError::Session(format!("no address for {}", self.params.server)))?;
        debug!(server = %server, "Relay server resolved");
        self.server = Some(server);

        let stream = timeout(request_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| RelayError::Session("connect timed out".to_string()))?
            .map_err(|e| RelayError::Io(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut control = Framed::new(stream, StunCodec::new(self.params.frame_limit()));
        self.shared.set_state(RelayState::Sending);
        let request = self.session.allocate(Instant::now())?;
        control.send(request).await?;
        Ok(control)
    }

    /// Service the control connection until cancelled (`Ok`) or failed
    async fn serve(&mut self, control: &mut ControlStream) -> Result<(), RelayError> {
        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(self.params.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = control.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(control, frame).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(RelayError::Session("relay server closed the connection".to_string())),
                },
                Some(command) = self.commands.recv() => self.on_command(control, command).await?,
                _ = tick.tick() => self.on_tick(control).await?,
            }
        }
    }

    async fn on_frame(&mut self, control: &mut ControlStream, frame: StunFrame) -> Result<(), RelayError> {
        let events = self.session.handle(&frame.message, &frame.raw, Instant::now());
        for event in events {
            self.on_event(control, event).await?;
        }
        Ok(())
    }

    async fn on_event(&mut self, control: &mut ControlStream, event: SessionEvent) -> Result<(), RelayError> {
        match event {
            SessionEvent::Transmit(bytes) => control.send(bytes).await?,
            SessionEvent::Challenged => self.shared.set_state(RelayState::Configuring),
            SessionEvent::Allocated {
                relayed,
                mapped,
                lifetime,
            } => {
                {
                    let mut addresses = self.shared.addresses.write();
                    addresses.relayed = Some(relayed);
                    addresses.mapped = mapped;
                }
                info!(relayed = %relayed, mapped = ?mapped, lifetime = ?lifetime, "Relay allocation granted");
                self.schedule_refresh(lifetime);
                self.shared.set_state(RelayState::Creating);
                self.install_queued_permissions(control, relayed).await?;
            }
            SessionEvent::Refreshed { lifetime } => {
                debug!(lifetime = ?lifetime, "Relay allocation refreshed");
                self.schedule_refresh(lifetime);
                if self.shared.state() == RelayState::Refreshing {
                    self.shared.set_state(RelayState::Ready);
                }
            }
            SessionEvent::Deallocated => debug!("Relay allocation released"),
            SessionEvent::PermissionsInstalled(peers) => {
                debug!(count = peers.len(), "Relay permissions installed");
                if self.awaiting_permissions {
                    self.become_ready();
                }
            }
            SessionEvent::Failed {
                request: RequestKind::CreatePermission,
                code,
                reason,
            } => {
                warn!(code, reason = %reason, "Relay permission request rejected");
                if self.awaiting_permissions {
                    self.become_ready();
                }
            }
            SessionEvent::Failed { request, code, reason } => {
                return Err(RelayError::Session(format!(
                    "{:?} rejected: {} {}",
                    request, code, reason
                )));
            }
            SessionEvent::Data { peer, payload } => self.shared.deliver(peer, &payload),
            SessionEvent::ConnectionAttempt { connection_id, peer } => {
                self.accept_peer_connection(connection_id, peer)?
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, control: &mut ControlStream, command: Command) -> Result<(), RelayError> {
        match command {
            Command::Permit(peer) => {
                // Before allocation the permission stays queued in the shared set
                let relayed = self.shared.addresses.read().relayed;
                if relayed.map_or(false, |r| r.is_ipv4() == peer.is_ipv4()) {
                    let request = self.session.create_permission(vec![peer], Instant::now())?;
                    control.send(request).await?;
                }
            }
            Command::Send { peer, data } => match self.session.send_indication(peer, &data) {
                Ok(indication) => control.send(indication).await?,
                Err(e) => warn!(peer = %peer, size = data.len(), error = %e, "Dropping relay packet"),
            },
        }
        Ok(())
    }

    async fn on_tick(&mut self, control: &mut ControlStream) -> Result<(), RelayError> {
        let now = Instant::now();

        if self.shared.state().is_pre_ready()
            && now.saturating_duration_since(self.started) >= self.params.allocation_timeout
        {
            return Err(RelayError::Session("allocation timed out".to_string()));
        }

        for kind in self.session.expire(now, self.params.request_timeout) {
            match kind {
                RequestKind::CreatePermission => {
                    warn!("Relay permission request timed out");
                    if self.awaiting_permissions {
                        self.become_ready();
                    }
                }
                other => {
                    return Err(RelayError::Session(format!("{:?} request timed out", other)));
                }
            }
        }

        if self.shared.state() != RelayState::Ready {
            return Ok(());
        }

        if self.refresh_at.map_or(false, |at| now >= at) {
            let request = self.session.refresh(ALLOCATION_LIFETIME, now)?;
            control.send(request).await?;
            self.shared.set_state(RelayState::Refreshing);
        }

        if self.permissions_refresh_at.map_or(false, |at| now >= at) {
            self.permissions_refresh_at = Some(now + PERMISSION_REFRESH_INTERVAL);
            let peers = self.shared.permitted.read().iter().copied().collect::<Vec<_>>();
            if !peers.is_empty() {
                debug!(count = peers.len(), "Refreshing relay permissions");
                let request = self.session.create_permission(peers, now)?;
                control.send(request).await?;
            }
        }
        Ok(())
    }

    fn schedule_refresh(&mut self, lifetime: Duration) {
        let lead = if lifetime > REFRESH_MARGIN * 2 {
            lifetime - REFRESH_MARGIN
        } else {
            lifetime / 2
        };
        self.refresh_at = Some(Instant::now() + lead);
    }

    fn become_ready(&mut self) {
        self.awaiting_permissions = false;
        self.permissions_refresh_at = Some(Instant::now() + PERMISSION_REFRESH_INTERVAL);
        self.shared.set_state(RelayState::Ready);
    }

    async fn install_queued_permissions(
        &mut self,
        control: &mut ControlStream,
        relayed: SocketAddr,
    ) -> Result<(), RelayError> {
        let peers: Vec<IpAddr> = {
            let mut permitted = self.shared.permitted.write();
            let mismatched: Vec<IpAddr> = permitted
                .iter()
                .filter(|ip| ip.is_ipv4() != relayed.is_ipv4())
                .copied()
                .collect();
            for ip in mismatched {
                warn!(peer = %ip, relayed = %relayed, "Dropping queued permission with mismatched address family");
                permitted.remove(&ip);
            }
            permitted.iter().copied().collect()
        };

        if peers.is_empty() {
            self.become_ready();
            return Ok(());
        }
        self.awaiting_permissions = true;
        let request = self.session.create_permission(peers, Instant::now())?;
        control.send(request).await?;
        Ok(())
    }

    fn accept_peer_connection(&mut self, connection_id: u32, peer: SocketAddr) -> Result<(), RelayError> {
        let Some(server) = self.server else {
            return Ok(());
        };
        if self.params.peer_connection_mode != PeerConnectionMode::Tcp {
            debug!(connection_id, "Ignoring ConnectionAttempt on a UDP allocation");
            return Ok(());
        }
        let (_, bind) = self.session.connection_bind(connection_id)?;
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let request_timeout = self.params.request_timeout;
        let frame_limit = self.params.frame_limit();

        debug!(connection_id, peer = %peer, "Binding peer data connection");
        self.data_connections.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = run_data_connection(shared, server, connection_id, peer, bind, request_timeout, frame_limit) => {
                    if let Err(e) = result {
                        warn!(connection_id, peer = %peer, error = %e, "Peer data connection failed");
                    }
                }
            }
        });
        Ok(())
    }

    async fn teardown(&mut self, control: Option<&mut ControlStream>) {
        self.shared.set_state(RelayState::Deallocating);

        if let (Some(control), Some(_)) = (control, self.refresh_at) {
            match self.session.refresh(0, Instant::now()) {
                Ok(request) => {
                    if control.send(request).await.is_ok() {
                        let session = &mut self.session;
                        let released = timeout(DEALLOCATE_TIMEOUT, async {
                            while let Some(Ok(frame)) = control.next().await {
                                let events = session.handle(&frame.message, &frame.raw, Instant::now());
                                if events.contains(&SessionEvent::Deallocated) {
                                    return true;
                                }
                            }
                            false
                        })
                        .await;
                        if !matches!(released, Ok(true)) {
                            debug!("Relay did not confirm deallocation");
                        }
                    }
                }
                Err(e) => debug!("Failed to build deallocation request: {}", e),
            }
        }

        self.shared.set_state(RelayState::Destroying);
    }
}

/// RFC 6062 data connection: bind it to `connection_id`, then pump raw
/// bytes between the peer and its buffers
async fn run_data_connection(
    shared: Arc<Shared>,
    server: SocketAddr,
    connection_id: u32,
    peer: SocketAddr,
    bind: Bytes,
    request_timeout: Duration,
    frame_limit: usize,
) -> Result<(), RelayError> {
    let stream = timeout(request_timeout, TcpStream::connect(server))
        .await
        .map_err(|_| RelayError::Session("data connection timed out".to_string()))?
        .map_err(|e| RelayError::Io(e.to_string()))?;

    let mut framed = Framed::new(stream, StunCodec::new(frame_limit));
    framed.send(bind).await?;
    let response = timeout(request_timeout, framed.next())
        .await
        .map_err(|_| RelayError::Session("ConnectionBind timed out".to_string()))?
        .ok_or_else(|| RelayError::Session("relay closed the data connection".to_string()))??;

    let message = &response.message;
    if message.method != Method::ConnectionBind || message.class != Class::Success {
        return Err(RelayError::Session(format!(
            "ConnectionBind rejected: {:?}",
            message.error_code()
        )));
    }

    // Anything read past the response already belongs to the peer stream
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        shared.deliver(peer, &parts.read_buf);
    }
    let (mut reader, mut writer) = parts.io.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    shared.connections.lock().insert(peer, tx);
    info!(connection_id, peer = %peer, "Peer connected through relay");
    shared.notify_peer_connection(connection_id, peer);

    let mut buf = vec![0u8; frame_limit];
    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => shared.deliver(peer, &buf[..n]),
                Err(e) => break Err(RelayError::Io(e.to_string())),
            },
            Some(data) = rx.recv() => {
                if let Err(e) = writer.write_all(&data).await {
                    break Err(RelayError::Io(e.to_string()));
                }
            }
        }
    };

    shared.connections.lock().remove(&peer);
    shared.release_buffer(peer);
    debug!(connection_id, peer = %peer, "Peer data connection closed");
    result
}
