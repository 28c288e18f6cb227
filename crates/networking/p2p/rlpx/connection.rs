use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use ethereum_types::{H256, H512};
use ethwire_rlp::{decode::RLPDecode, encode::RLPEncode};
use k256::SecretKey;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinSet,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use super::{
    dispatcher::{Dispatcher, MessageKind, ProtocolRegistry},
    error::RLPxError,
    frame::{self, EgressState, IngressState},
    handshake::{
        decode_ack_message, decode_ack_message_legacy, decode_auth_message,
        decode_auth_message_legacy, encode_ack_message, encode_auth_message, AckMessage,
        AuthMessage, Secrets, LEGACY_ACK_SIZE, LEGACY_AUTH_SIZE,
    },
    message::{Message, RLPxMessage, BASE_PROTOCOL_LENGTH},
    p2p::{
        DisconnectMessage, DisconnectReason, HelloMessage, PingMessage, PongMessage,
        P2P_PROTOCOL_VERSION,
    },
    requests::{prepend_request_id, split_request_id, RequestTable},
    utils::{id2pubkey, pubkey2id, snappy_compress, snappy_decompress},
};
use k256::PublicKey;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_CLIENT_ID: &str = concat!("ethwire/", env!("CARGO_PKG_VERSION"));

/// Message ids of the base devp2p protocol.
const HELLO_ID: u16 = 0x00;
const DISCONNECT_ID: u16 = 0x01;
const PING_ID: u16 = 0x02;
const PONG_ID: u16 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

enum Role {
    Initiator { remote_node_id: H512 },
    Receiver,
}

/// The outbound half of an established session. Sends from any task are
/// serialized by the surrounding mutex; a send in progress completes before
/// the next begins.
pub(crate) struct Egress {
    state: EgressState,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Egress {
    pub(crate) async fn send(
        &mut self,
        msg_id: u16,
        body: Vec<u8>,
        snappy: bool,
    ) -> Result<(), RLPxError> {
        // the size cap applies before compression
        if body.len() > crate::MAX_MESSAGE_SIZE {
            return Err(RLPxError::MessageTooBig(crate::MAX_MESSAGE_SIZE));
        }
        let mut frame_data = Vec::with_capacity(body.len() + 4);
        (msg_id as u64).encode(&mut frame_data);
        // hello is the one message that is never compressed
        let body = if snappy && msg_id != HELLO_ID {
            snappy_compress(body)?
        } else {
            body
        };
        frame_data.extend_from_slice(&body);
        frame::write(frame_data, &mut self.state, &mut self.writer).await
    }
}

struct DisconnectSignal {
    notify: Notify,
    reason: StdMutex<Option<DisconnectReason>>,
}

impl DisconnectSignal {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            reason: StdMutex::new(None),
        }
    }

    fn request(&self, reason: DisconnectReason) {
        let mut slot = self.reason.lock().expect("disconnect reason lock poisoned");
        // the first requested reason wins
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.notify.notify_one();
    }

    fn requested_reason(&self) -> DisconnectReason {
        self.reason
            .lock()
            .expect("disconnect reason lock poisoned")
            .unwrap_or(DisconnectReason::DisconnectRequested)
    }
}

/// Cloneable access to an established peer, handed to sub-protocol handlers
/// and anything else that needs to talk to the remote.
#[derive(Clone)]
pub struct PeerHandle {
    remote_node_id: H512,
    snappy_enabled: bool,
    dispatcher: Arc<Dispatcher>,
    requests: Arc<StdMutex<RequestTable>>,
    egress: Arc<AsyncMutex<Egress>>,
    disconnect_signal: Arc<DisconnectSignal>,
}

impl PeerHandle {
    pub fn remote_node_id(&self) -> H512 {
        self.remote_node_id
    }

    fn requests_lock(&self) -> MutexGuard<'_, RequestTable> {
        self.requests.lock().expect("request table lock poisoned")
    }

    async fn send_raw(&self, msg_id: u16, body: Vec<u8>) -> Result<(), RLPxError> {
        self.egress
            .lock()
            .await
            .send(msg_id, body, self.snappy_enabled)
            .await
    }

    /// Sends a sub-protocol message. `body` is the RLP-encoded message body.
    pub async fn send(&self, protocol: &str, local_id: u16, body: Vec<u8>) -> Result<(), RLPxError> {
        let msg_id = self.absolute_id(protocol, local_id)?;
        self.send_raw(msg_id, body).await
    }

    /// Sends a request and waits for its response, up to `timeout_after`.
    /// For protocols with explicit request ids a fresh id is allocated and
    /// written into the body; otherwise responses resolve oldest-first.
    pub async fn request(
        &self,
        protocol: &str,
        local_id: u16,
        body: Vec<u8>,
        timeout_after: Duration,
    ) -> Result<Vec<u8>, RLPxError> {
        let msg_id = self.absolute_id(protocol, local_id)?;
        let info = self
            .dispatcher
            .message_info(protocol, local_id)
            .ok_or_else(|| {
                RLPxError::InvalidState(format!("unknown message {local_id} of {protocol}"))
            })?;
        let MessageKind::Request {
            response_local_id,
            explicit_request_id,
        } = info.kind
        else {
            return Err(RLPxError::InvalidState(format!(
                "{} message {local_id} of {protocol} is not a request",
                info.name
            )));
        };
        let response_msg_id = self.absolute_id(protocol, response_local_id)?;

        let (receiver, wire_body) = {
            let mut table = self.requests_lock();
            let req_id = explicit_request_id.then(|| table.allocate_request_id());
            let receiver =
                table.register(response_msg_id, req_id, Instant::now() + timeout_after);
            let wire_body = match req_id {
                Some(req_id) => prepend_request_id(req_id, &body)?,
                None => body,
            };
            (receiver, wire_body)
        };

        self.send_raw(msg_id, wire_body).await?;

        match timeout(timeout_after, receiver).await {
            Err(_elapsed) => Err(RLPxError::RequestTimeout),
            Ok(Err(_closed)) => Err(RLPxError::RequestTimeout),
            Ok(Ok(resolution)) => resolution,
        }
    }

    /// Waits for the next inbound message of the given type. At most one
    /// waiter per message type may be pending.
    pub async fn next_msg(&self, protocol: &str, local_id: u16) -> Result<Vec<u8>, RLPxError> {
        let msg_id = self.absolute_id(protocol, local_id)?;
        let receiver = self.requests_lock().register_awaited(msg_id)?;
        receiver
            .await
            .map_err(|_| RLPxError::PeerDisconnected(DisconnectReason::DisconnectRequested))
    }

    /// Sends a devp2p ping and waits for the pong.
    pub async fn ping(&self, timeout_after: Duration) -> Result<(), RLPxError> {
        let receiver = self.requests_lock().register_awaited(PONG_ID)?;
        let mut body = Vec::new();
        PingMessage::new().encode(&mut body)?;
        self.send_raw(PING_ID, body).await?;
        match timeout(timeout_after, receiver).await {
            Err(_elapsed) => Err(RLPxError::RequestTimeout),
            Ok(Err(_closed)) => {
                Err(RLPxError::PeerDisconnected(DisconnectReason::DisconnectRequested))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Asks the peer task to tear the session down.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.disconnect_signal.request(reason);
    }

    fn absolute_id(&self, protocol: &str, local_id: u16) -> Result<u16, RLPxError> {
        self.dispatcher
            .absolute_id(protocol, local_id)
            .ok_or_else(|| {
                RLPxError::InvalidState(format!("protocol {protocol} was not negotiated"))
            })
    }
}

/// An RLPx session over a full-duplex byte stream.
///
/// Lifecycle: `Connecting` through [`handshake`](Self::handshake), then
/// `Connected` while [`handle_peer`](Self::handle_peer) dispatches inbound
/// messages, and finally `Disconnecting`/`Disconnected` through
/// [`disconnect`](Self::disconnect) or a peer-initiated close.
pub struct RLPxConnection<S> {
    signer: SecretKey,
    client_id: String,
    role: Role,
    state: ConnectionState,
    registry: Arc<ProtocolRegistry>,
    stream: Option<S>,
    reader: Option<ReadHalf<S>>,
    ingress: Option<IngressState>,
    egress: Option<Arc<AsyncMutex<Egress>>>,
    remote_node_id: Option<H512>,
    dispatcher: Option<Arc<Dispatcher>>,
    requests: Arc<StdMutex<RequestTable>>,
    snappy_enabled: bool,
    disconnect_signal: Arc<DisconnectSignal>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> RLPxConnection<S> {
    fn new(signer: SecretKey, stream: S, role: Role, registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            signer,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            role,
            state: ConnectionState::Connecting,
            registry,
            stream: Some(stream),
            reader: None,
            ingress: None,
            egress: None,
            remote_node_id: None,
            dispatcher: None,
            requests: Arc::new(StdMutex::new(RequestTable::new())),
            snappy_enabled: false,
            disconnect_signal: Arc::new(DisconnectSignal::new()),
        }
    }

    /// A connection where we dial out and send the auth message.
    pub fn initiator(
        signer: SecretKey,
        remote_node_id: H512,
        stream: S,
        registry: Arc<ProtocolRegistry>,
    ) -> Self {
        Self::new(signer, stream, Role::Initiator { remote_node_id }, registry)
    }

    /// A connection accepted from a listener; the remote sends the auth
    /// message and identifies itself through it.
    pub fn receiver(signer: SecretKey, stream: S, registry: Arc<ProtocolRegistry>) -> Self {
        Self::new(signer, stream, Role::Receiver, registry)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_node_id(&self) -> Option<H512> {
        self.remote_node_id
    }

    fn requests_lock(&self) -> MutexGuard<'_, RequestTable> {
        self.requests.lock().expect("request table lock poisoned")
    }

    /// Runs the full session handshake: auth/ack, hello exchange, capability
    /// negotiation and the sub-protocol session handlers.
    pub async fn handshake(&mut self) -> Result<(), RLPxError> {
        if self.state != ConnectionState::Connecting {
            return Err(RLPxError::InvalidState(
                "handshake already performed".to_string(),
            ));
        }
        let result = match timeout(HANDSHAKE_TIMEOUT, self.perform_handshake()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(RLPxError::HandshakeTimeout),
        };
        if result.is_err() {
            self.teardown();
        }
        result
    }

    async fn perform_handshake(&mut self) -> Result<(), RLPxError> {
        let mut rng = rand::thread_rng();
        let local_nonce = H256(rng.gen());
        let local_ephemeral_key = SecretKey::random(&mut rng);
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| RLPxError::InvalidState("transport already consumed".to_string()))?;

        let secrets = match &self.role {
            Role::Initiator { remote_node_id } => {
                let remote_node_id = *remote_node_id;
                let remote_pubkey =
                    id2pubkey(remote_node_id).ok_or(RLPxError::InvalidIdentity)?;
                let auth = encode_auth_message(
                    &self.signer,
                    local_nonce,
                    &remote_pubkey,
                    &local_ephemeral_key,
                )?;
                stream.write_all(&auth).await?;
                debug!("sent auth message");

                let (ack, ack_bytes) = Self::receive_ack(&self.signer, &mut stream).await?;
                let remote_ephemeral_key = ack.get_ephemeral_pubkey().ok_or_else(|| {
                    RLPxError::HandshakeError("invalid ephemeral key in ack".to_string())
                })?;
                self.remote_node_id = Some(remote_node_id);
                Secrets::for_initiator(
                    &auth,
                    local_nonce,
                    &local_ephemeral_key,
                    &ack_bytes,
                    ack.nonce,
                    &remote_ephemeral_key,
                )
            }
            Role::Receiver => {
                let (auth, remote_ephemeral_key, auth_bytes) =
                    Self::receive_auth(&self.signer, &mut stream).await?;
                let remote_pubkey = id2pubkey(auth.node_id).ok_or(RLPxError::InvalidIdentity)?;
                let ack = encode_ack_message(&local_ephemeral_key, local_nonce, &remote_pubkey)?;
                stream.write_all(&ack).await?;
                debug!("sent ack message");

                self.remote_node_id = Some(auth.node_id);
                Secrets::for_receiver(
                    &ack,
                    local_nonce,
                    &local_ephemeral_key,
                    &auth_bytes,
                    auth.nonce,
                    &remote_ephemeral_key,
                )
            }
        };
        debug!("completed the auth/ack exchange");

        let (ingress, egress_state) = secrets.split();
        let (read_half, write_half) = tokio::io::split(stream);
        self.reader = Some(read_half);
        self.ingress = Some(ingress);
        self.egress = Some(Arc::new(AsyncMutex::new(Egress {
            state: egress_state,
            writer: Box::new(write_half),
        })));

        self.exchange_hello_messages().await?;

        // session-establishment handlers (e.g. a status exchange) run before
        // the dispatch loop starts
        self.run_handshake_handlers().await?;
        Ok(())
    }

    /// Reads an auth packet, accepting both the EIP-8 and the legacy
    /// fixed-size format. The legacy decode is attempted first on the fixed
    /// packet size; when it fails, the first two bytes are the EIP-8 length
    /// prefix and the remainder of the packet is still in flight.
    async fn receive_auth(
        signer: &SecretKey,
        stream: &mut S,
    ) -> Result<(AuthMessage, PublicKey, Vec<u8>), RLPxError> {
        let mut buf = vec![0; LEGACY_AUTH_SIZE];
        stream.read_exact(&mut buf).await?;
        match decode_auth_message_legacy(signer, &buf) {
            Ok((auth, remote_ephemeral_key)) => {
                debug!("peer sent a pre-EIP-8 auth packet");
                Ok((auth, remote_ephemeral_key, buf))
            }
            Err(_) => {
                let total = u16::from_be_bytes([buf[0], buf[1]]) as usize + 2;
                if total < LEGACY_AUTH_SIZE {
                    return Err(RLPxError::HandshakeError(
                        "undecodable auth packet".to_string(),
                    ));
                }
                buf.resize(total, 0);
                stream.read_exact(&mut buf[LEGACY_AUTH_SIZE..]).await?;
                let (auth, remote_ephemeral_key) =
                    decode_auth_message(signer, &buf[2..], &buf[..2])?;
                Ok((auth, remote_ephemeral_key, buf))
            }
        }
    }

    /// Reads an ack packet; same format detection as [`Self::receive_auth`].
    async fn receive_ack(
        signer: &SecretKey,
        stream: &mut S,
    ) -> Result<(AckMessage, Vec<u8>), RLPxError> {
        let mut buf = vec![0; LEGACY_ACK_SIZE];
        stream.read_exact(&mut buf).await?;
        match decode_ack_message_legacy(signer, &buf) {
            Ok(ack) => {
                debug!("peer sent a pre-EIP-8 ack packet");
                Ok((ack, buf))
            }
            Err(_) => {
                let total = u16::from_be_bytes([buf[0], buf[1]]) as usize + 2;
                if total < LEGACY_ACK_SIZE {
                    return Err(RLPxError::HandshakeError(
                        "undecodable ack packet".to_string(),
                    ));
                }
                buf.resize(total, 0);
                stream.read_exact(&mut buf[LEGACY_ACK_SIZE..]).await?;
                let ack = decode_ack_message(signer, &buf[2..], &buf[..2])?;
                Ok((ack, buf))
            }
        }
    }

    async fn exchange_hello_messages(&mut self) -> Result<(), RLPxError> {
        let hello = HelloMessage::new(
            self.client_id.clone(),
            self.registry.capabilities(),
            pubkey2id(&self.signer.public_key()),
        );
        self.send_message(Message::Hello(hello)).await?;
        debug!("hello message sent");

        let (msg_id, body) = self.read_raw_message().await?;
        let message = Message::decode(msg_id, &body).map_err(|error| {
            RLPxError::BreachOfProtocol(format!("undecodable handshake message: {error}"))
        })?;
        match message {
            Message::Hello(remote_hello) => {
                debug!(client = %remote_hello.client_id, "hello message received");

                // the identity proven by the crypto handshake must match the
                // announced one
                let expected = self
                    .remote_node_id
                    .ok_or_else(|| RLPxError::InvalidState("no handshake identity".to_string()))?;
                if remote_hello.node_id != expected {
                    return Err(RLPxError::InvalidIdentity);
                }

                self.snappy_enabled = remote_hello.protocol_version >= 5
                    && P2P_PROTOCOL_VERSION >= 5;

                let dispatcher =
                    Dispatcher::negotiate(&self.registry, &remote_hello.capabilities);
                if !dispatcher.has_active_protocols() {
                    // let the remote know before giving up
                    let _ = self
                        .send_message(Message::Disconnect(DisconnectMessage::new(Some(
                            DisconnectReason::UselessPeer,
                        ))))
                        .await;
                    return Err(RLPxError::UselessPeer);
                }
                self.dispatcher = Some(Arc::new(dispatcher));
                self.state = ConnectionState::Connected;
                info!(peer = %expected, snappy = self.snappy_enabled, "session established");
                Ok(())
            }
            Message::Disconnect(msg) => Err(RLPxError::PeerDisconnected(
                msg.reason.unwrap_or(DisconnectReason::DisconnectRequested),
            )),
            other => Err(RLPxError::HandshakeError(format!(
                "expected hello, got {other}"
            ))),
        }
    }

    async fn run_handshake_handlers(&mut self) -> Result<(), RLPxError> {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return Ok(());
        };
        let handle = self.peer_handle()?;
        for protocol in dispatcher.active_protocols() {
            if let Some(handler) = &protocol.handshake_handler {
                (handler)(handle.clone(), None).await.map_err(|error| {
                    RLPxError::HandshakeError(format!(
                        "{} session setup failed: {error}",
                        protocol.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// A handle for talking to this peer; available once the session is
    /// established.
    pub fn peer_handle(&self) -> Result<PeerHandle, RLPxError> {
        let not_ready = || RLPxError::InvalidState("session not established".to_string());
        Ok(PeerHandle {
            remote_node_id: self.remote_node_id.ok_or_else(not_ready)?,
            snappy_enabled: self.snappy_enabled,
            dispatcher: self.dispatcher.clone().ok_or_else(not_ready)?,
            requests: self.requests.clone(),
            egress: self.egress.clone().ok_or_else(not_ready)?,
            disconnect_signal: self.disconnect_signal.clone(),
        })
    }

    /// The dispatch loop. Processes inbound messages in wire order, awaiting
    /// each handler to completion before reading the next message, until the
    /// session ends.
    pub async fn handle_peer(&mut self) -> Result<(), RLPxError> {
        if self.state != ConnectionState::Connected {
            return Err(RLPxError::InvalidState("peer is not connected".to_string()));
        }
        let mut ingress = self
            .ingress
            .take()
            .ok_or_else(|| RLPxError::InvalidState("no ingress state".to_string()))?;
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| RLPxError::InvalidState("no transport reader".to_string()))?;
        let signal = self.disconnect_signal.clone();
        let snappy = self.snappy_enabled;

        let result = loop {
            // a pending read is abandoned when a disconnect comes in; the
            // stream is going away with it
            let next = tokio::select! {
                _ = signal.notify.notified() => None,
                read_result = Self::read_message_from(&mut ingress, &mut reader, snappy) => {
                    Some(read_result)
                }
            };
            match next {
                None => {
                    let reason = signal.requested_reason();
                    self.disconnect_with(&mut ingress, reason, true).await;
                    break Ok(());
                }
                Some(Ok((msg_id, body))) => {
                    if let Err(error) = self.handle_message(msg_id, body).await {
                        break Err(error);
                    }
                }
                Some(Err(error)) => break Err(error),
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                let reason = error.disconnect_reason();
                // no point notifying a dead transport or a peer that already
                // said goodbye
                let notify_other = !matches!(
                    error,
                    RLPxError::TcpError(_) | RLPxError::PeerDisconnected(_)
                );
                self.disconnect_with(&mut ingress, reason, notify_other).await;
                Err(error)
            }
        }
    }

    async fn read_raw_message(&mut self) -> Result<(u16, Vec<u8>), RLPxError> {
        let snappy = self.snappy_enabled;
        let ingress = self
            .ingress
            .as_mut()
            .ok_or_else(|| RLPxError::InvalidState("no ingress state".to_string()))?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| RLPxError::InvalidState("no transport reader".to_string()))?;
        Self::read_message_from(ingress, reader, snappy).await
    }

    async fn read_message_from(
        ingress: &mut IngressState,
        reader: &mut ReadHalf<S>,
        snappy: bool,
    ) -> Result<(u16, Vec<u8>), RLPxError> {
        let frame_data = frame::read(ingress, reader).await?;
        let (raw_id, rest): (u32, &[u8]) = RLPDecode::decode_unfinished(&frame_data)
            .map_err(|_| RLPxError::BreachOfProtocol("undecodable message id".to_string()))?;
        let msg_id: u16 = raw_id
            .try_into()
            .map_err(|_| RLPxError::BreachOfProtocol(format!("message id {raw_id:#x} out of range")))?;
        let body = if snappy && msg_id != HELLO_ID {
            snappy_decompress(rest).map_err(|error| {
                RLPxError::BreachOfProtocol(format!("undecodable compressed body: {error}"))
            })?
        } else {
            rest.to_vec()
        };
        Ok((msg_id, body))
    }

    async fn handle_message(&mut self, msg_id: u16, body: Vec<u8>) -> Result<(), RLPxError> {
        if msg_id >= BASE_PROTOCOL_LENGTH {
            return self.dispatch_subprotocol(msg_id, body).await;
        }
        let message = Message::decode(msg_id, &body).map_err(|error| {
            RLPxError::BreachOfProtocol(format!("undecodable message {msg_id:#x}: {error}"))
        })?;
        match message {
            Message::Hello(_) => {
                debug!("unexpected hello after session establishment, ignoring");
                Ok(())
            }
            Message::Disconnect(msg) => {
                let reason = msg.reason.unwrap_or(DisconnectReason::DisconnectRequested);
                info!(%reason, "peer requested disconnect");
                Err(RLPxError::PeerDisconnected(reason))
            }
            Message::Ping(_) => {
                self.send_message(Message::Pong(PongMessage::new())).await
            }
            Message::Pong(_) => {
                self.requests_lock().deliver_awaited(PONG_ID, &body);
                Ok(())
            }
            Message::Subprotocol { msg_id, data } => self.dispatch_subprotocol(msg_id, data).await,
        }
    }

    async fn dispatch_subprotocol(&mut self, msg_id: u16, data: Vec<u8>) -> Result<(), RLPxError> {
        let dispatcher = self
            .dispatcher
            .clone()
            .ok_or_else(|| RLPxError::InvalidState("dispatcher not built".to_string()))?;
        let (protocol, _local_id, info) = dispatcher.lookup(msg_id)?;

        let mut request_id = None;
        let mut payload = data;
        match info.kind {
            MessageKind::Response { explicit_request_id } => {
                if explicit_request_id {
                    let (req_id, rest) = split_request_id(&payload)?;
                    request_id = Some(req_id);
                    payload = rest;
                }
                self.requests_lock()
                    .resolve_response(msg_id, request_id, &payload);
            }
            MessageKind::Request {
                explicit_request_id: true,
                ..
            } => {
                let (req_id, rest) = split_request_id(&payload)?;
                request_id = Some(req_id);
                payload = rest;
            }
            _ => {}
        }

        self.requests_lock().deliver_awaited(msg_id, &payload);

        if let Some(handler) = info.handler.clone() {
            let handle = self.peer_handle()?;
            let protocol_name = protocol.name;
            if let Err(error) = (handler)(handle, request_id, payload).await {
                match error {
                    breach @ (RLPxError::BreachOfProtocol(_) | RLPxError::MessageTooBig(_)) => {
                        return Err(breach)
                    }
                    other => warn!(protocol = protocol_name, "message handler failed: {other}"),
                }
            }
        }
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> Result<(), RLPxError> {
        let egress = self
            .egress
            .clone()
            .ok_or_else(|| RLPxError::InvalidState("no established transport".to_string()))?;
        let mut body = Vec::new();
        message.encode_body(&mut body)?;
        let result = egress
            .lock()
            .await
            .send(message.msg_id(), body, self.snappy_enabled)
            .await;
        result
    }

    /// Tears the session down. Idempotent: a second call returns without
    /// doing anything. Runs the sub-protocol disconnect handlers, optionally
    /// notifies the remote, fails every outstanding request with
    /// [`RLPxError::PeerDisconnected`] and scrubs the symmetric secrets.
    pub async fn disconnect(&mut self, reason: DisconnectReason, notify_other: bool) {
        let mut ingress = self.ingress.take();
        self.disconnect_inner(ingress.as_mut(), reason, notify_other)
            .await;
    }

    async fn disconnect_with(
        &mut self,
        ingress: &mut IngressState,
        reason: DisconnectReason,
        notify_other: bool,
    ) {
        self.disconnect_inner(Some(ingress), reason, notify_other)
            .await;
    }

    async fn disconnect_inner(
        &mut self,
        ingress: Option<&mut IngressState>,
        reason: DisconnectReason,
        notify_other: bool,
    ) {
        if matches!(
            self.state,
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        ) {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        info!(%reason, notify_other, "disconnecting peer");

        // sub-protocol disconnect handlers run concurrently; their failures
        // are logged, never propagated
        if let (Some(dispatcher), Ok(handle)) = (self.dispatcher.clone(), self.peer_handle()) {
            let mut handlers = JoinSet::new();
            for protocol in dispatcher.active_protocols() {
                if let Some(handler) = protocol.disconnect_handler.clone() {
                    let handle = handle.clone();
                    handlers.spawn(async move { (handler)(handle, Some(reason)).await });
                }
            }
            while let Some(joined) = handlers.join_next().await {
                match joined {
                    Ok(Err(error)) => warn!("disconnect handler failed: {error}"),
                    Err(error) => warn!("disconnect handler panicked: {error}"),
                    Ok(Ok(())) => {}
                }
            }
        }

        if let Some(egress) = self.egress.clone() {
            if notify_other {
                let snappy = self.snappy_enabled;
                let notify = async {
                    let mut body = Vec::new();
                    DisconnectMessage::new(Some(reason)).encode(&mut body)?;
                    egress.lock().await.send(DISCONNECT_ID, body, snappy).await
                };
                match timeout(DISCONNECT_GRACE_PERIOD, notify).await {
                    Ok(Err(error)) => debug!("failed to notify peer of disconnect: {error}"),
                    Err(_elapsed) => debug!("disconnect notification timed out"),
                    Ok(Ok(())) => {}
                }
            }
            let mut guard = egress.lock().await;
            let _ = guard.writer.shutdown().await;
            guard.state.wipe();
        }
        if let Some(ingress) = ingress {
            ingress.wipe();
        }

        self.requests_lock().fail_all(reason);
        self.state = ConnectionState::Disconnected;
        info!("peer disconnected");
    }

    /// Drops any partially established state after a failed handshake.
    fn teardown(&mut self) {
        if let Some(mut ingress) = self.ingress.take() {
            ingress.wipe();
        }
        if let Some(egress) = self.egress.take() {
            // no handles exist before the session is established, so the
            // lock cannot be contended
            if let Ok(mut guard) = egress.try_lock() {
                guard.state.wipe();
            }
        }
        self.reader = None;
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::dispatcher::{MessageHandler, MessageInfo, Protocol};
    use ethwire_rlp::structs::Encoder;
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::DuplexStream;

    const GET_ITEMS: u16 = 0;
    const ITEMS: u16 = 1;

    fn echo_handler() -> MessageHandler {
        Arc::new(|handle: PeerHandle, _req_id, body: Vec<u8>| {
            Box::pin(async move { handle.send("prb", ITEMS, body).await })
        })
    }

    fn probe_protocol() -> Protocol {
        Protocol::new(
            "prb",
            1,
            vec![
                MessageInfo::request("get-items", ITEMS, false, echo_handler()),
                MessageInfo::response("items", false),
            ],
        )
    }

    fn probe_registry() -> Arc<ProtocolRegistry> {
        Arc::new(ProtocolRegistry::new(vec![probe_protocol()]))
    }

    type Pair = (
        RLPxConnection<DuplexStream>,
        RLPxConnection<DuplexStream>,
    );

    async fn connected_pair(
        registry_a: Arc<ProtocolRegistry>,
        registry_b: Arc<ProtocolRegistry>,
    ) -> Pair {
        let (stream_a, stream_b) = tokio::io::duplex(1 << 20);
        let key_a = SecretKey::random(&mut OsRng);
        let key_b = SecretKey::random(&mut OsRng);

        let mut a = RLPxConnection::initiator(
            key_a,
            pubkey2id(&key_b.public_key()),
            stream_a,
            registry_a,
        );
        let mut b = RLPxConnection::receiver(key_b, stream_b, registry_b);

        let (result_a, result_b) = tokio::join!(a.handshake(), b.handshake());
        result_a.unwrap();
        result_b.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn handshake_establishes_the_session() {
        let registry = probe_registry();
        let (a, b) = connected_pair(registry.clone(), registry).await;

        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
        assert!(a.remote_node_id().is_some());
        assert!(b.remote_node_id().is_some());
        // snappy negotiated since both sides speak p2p v5
        assert!(a.snappy_enabled);
        assert!(b.snappy_enabled);
    }

    #[tokio::test]
    async fn no_common_capabilities_is_a_useless_peer() {
        let registry_a = Arc::new(ProtocolRegistry::new(vec![Protocol::new(
            "aaa",
            1,
            vec![MessageInfo::response("nothing", false)],
        )]));
        let registry_b = Arc::new(ProtocolRegistry::new(vec![Protocol::new(
            "bbb",
            1,
            vec![MessageInfo::response("nothing", false)],
        )]));

        let (stream_a, stream_b) = tokio::io::duplex(1 << 20);
        let key_a = SecretKey::random(&mut OsRng);
        let key_b = SecretKey::random(&mut OsRng);
        let mut a = RLPxConnection::initiator(
            key_a,
            pubkey2id(&key_b.public_key()),
            stream_a,
            registry_a,
        );
        let mut b = RLPxConnection::receiver(key_b, stream_b, registry_b);

        let (result_a, result_b) = tokio::join!(a.handshake(), b.handshake());
        assert!(matches!(result_a, Err(RLPxError::UselessPeer)));
        assert!(matches!(result_b, Err(RLPxError::UselessPeer)));
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn ping_pong_keeps_both_peers_connected() {
        let registry = probe_registry();
        let (mut a, mut b) = connected_pair(registry.clone(), registry).await;
        let handle_a = a.peer_handle().unwrap();

        let task_a = tokio::spawn(async move {
            let _ = a.handle_peer().await;
            a
        });
        let task_b = tokio::spawn(async move {
            let _ = b.handle_peer().await;
            b
        });

        // two round trips, well under the 2 second budget
        handle_a.ping(Duration::from_secs(2)).await.unwrap();
        handle_a.ping(Duration::from_secs(2)).await.unwrap();

        handle_a.disconnect(DisconnectReason::DisconnectRequested);
        let a = task_a.await.unwrap();
        let b = task_b.await.unwrap();
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert_eq!(b.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn request_resolves_with_the_handler_response() {
        let registry = probe_registry();
        let (mut a, mut b) = connected_pair(registry.clone(), registry).await;
        let handle_a = a.peer_handle().unwrap();

        let task_a = tokio::spawn(async move {
            let _ = a.handle_peer().await;
        });
        let task_b = tokio::spawn(async move {
            let _ = b.handle_peer().await;
        });

        let mut body = Vec::new();
        Encoder::new(&mut body).encode_field(&42u8).finish();

        let response = handle_a
            .request("prb", GET_ITEMS, body.clone(), Duration::from_secs(2))
            .await
            .unwrap();
        // the probe handler echoes the request body
        assert_eq!(response, body);

        handle_a.disconnect(DisconnectReason::DisconnectRequested);
        let _ = task_a.await;
        let _ = task_b.await;
    }

    #[tokio::test]
    async fn unknown_message_id_breaches_the_protocol() {
        let registry = probe_registry();
        let (mut a, mut b) = connected_pair(registry.clone(), registry).await;
        let handle_a = a.peer_handle().unwrap();

        let task_b = tokio::spawn(async move { b.handle_peer().await });

        // an id far outside the negotiated space
        handle_a
            .egress
            .lock()
            .await
            .send(0xff, vec![0xc0], handle_a.snappy_enabled)
            .await
            .unwrap();

        let result = task_b.await.unwrap();
        assert!(matches!(result, Err(RLPxError::BreachOfProtocol(_))));
        drop(a);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = probe_registry();
        let (mut a, mut b) = connected_pair(registry.clone(), registry).await;

        a.disconnect(DisconnectReason::TooManyPeers, true).await;
        assert_eq!(a.state(), ConnectionState::Disconnected);
        a.disconnect(DisconnectReason::TooManyPeers, true).await;
        assert_eq!(a.state(), ConnectionState::Disconnected);

        // exactly one disconnect message made it onto the wire
        let (msg_id, body) = b.read_raw_message().await.unwrap();
        assert_eq!(msg_id, DISCONNECT_ID);
        let msg = DisconnectMessage::decode(&body).unwrap();
        assert_eq!(msg.reason, Some(DisconnectReason::TooManyPeers));
        // the stream is shut down afterwards, there is no second message
        assert!(b.read_raw_message().await.is_err());
    }

    #[tokio::test]
    async fn disconnect_runs_protocol_handlers_and_fails_requests() {
        let called = Arc::new(AtomicBool::new(false));
        let called_probe = called.clone();
        let protocol = Protocol::new(
            "prb",
            1,
            vec![
                MessageInfo::request("get-items", ITEMS, false, echo_handler()),
                MessageInfo::response("items", false),
            ],
        )
        .with_disconnect_handler(Arc::new(move |_handle, reason| {
            let called = called_probe.clone();
            Box::pin(async move {
                assert_eq!(reason, Some(DisconnectReason::ClientQuitting));
                called.store(true, Ordering::SeqCst);
                Ok(())
            })
        }));
        let registry = Arc::new(ProtocolRegistry::new(vec![protocol]));
        let (mut a, b) = connected_pair(registry.clone(), probe_registry()).await;

        // a request that will never be answered
        let handle_a = a.peer_handle().unwrap();
        let pending = tokio::spawn(async move {
            handle_a
                .request("prb", GET_ITEMS, vec![0xc0], Duration::from_secs(30))
                .await
        });
        // give the request task a chance to register
        tokio::task::yield_now().await;

        a.disconnect(DisconnectReason::ClientQuitting, false).await;

        assert!(called.load(Ordering::SeqCst));
        match pending.await.unwrap() {
            Err(RLPxError::PeerDisconnected(DisconnectReason::ClientQuitting)) => {}
            other => panic!("unexpected request resolution: {other:?}"),
        }
        drop(b);
    }
}
