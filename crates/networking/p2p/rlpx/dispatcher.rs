use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock},
};

use tracing::debug;

use super::{
    connection::PeerHandle,
    error::RLPxError,
    message::BASE_PROTOCOL_LENGTH,
    p2p::{Capability, DisconnectReason},
};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), RLPxError>> + Send>>;

/// Handler thunk for one inbound message: `(peer, request-id, body)`.
/// The body is the decompressed RLP list, with the request id already
/// stripped off for request/response messages that carry one.
pub type MessageHandler =
    Arc<dyn Fn(PeerHandle, Option<u64>, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Handler invoked on session establishment (reason is `None`) or on
/// disconnect (reason is `Some`).
pub type LifecycleHandler =
    Arc<dyn Fn(PeerHandle, Option<DisconnectReason>) -> HandlerFuture + Send + Sync>;

/// How a message participates in request/response correlation.
#[derive(Clone, Copy)]
pub enum MessageKind {
    /// A request whose response arrives as `response_local_id`. With
    /// `explicit_request_id`, a fresh request id is written as the first
    /// list element (LES style); without, responses resolve FIFO (eth
    /// style).
    Request {
        response_local_id: u16,
        explicit_request_id: bool,
    },
    /// A response; resolves the matching outstanding request.
    Response { explicit_request_id: bool },
    /// Neither side of a request pair.
    Notification,
}

#[derive(Clone)]
pub struct MessageInfo {
    pub name: &'static str,
    pub kind: MessageKind,
    pub handler: Option<MessageHandler>,
}

impl MessageInfo {
    pub fn notification(name: &'static str, handler: MessageHandler) -> Self {
        Self {
            name,
            kind: MessageKind::Notification,
            handler: Some(handler),
        }
    }

    pub fn request(
        name: &'static str,
        response_local_id: u16,
        explicit_request_id: bool,
        handler: MessageHandler,
    ) -> Self {
        Self {
            name,
            kind: MessageKind::Request {
                response_local_id,
                explicit_request_id,
            },
            handler: Some(handler),
        }
    }

    pub fn response(name: &'static str, explicit_request_id: bool) -> Self {
        Self {
            name,
            kind: MessageKind::Response {
                explicit_request_id,
            },
            handler: None,
        }
    }
}

/// An immutable sub-protocol descriptor, registered once at startup.
pub struct Protocol {
    pub name: &'static str,
    pub version: u64,
    pub messages: Vec<MessageInfo>,
    pub handshake_handler: Option<LifecycleHandler>,
    pub disconnect_handler: Option<LifecycleHandler>,
}

impl Protocol {
    pub fn new(name: &'static str, version: u64, messages: Vec<MessageInfo>) -> Self {
        Self {
            name,
            version,
            messages,
            handshake_handler: None,
            disconnect_handler: None,
        }
    }

    pub fn with_handshake_handler(mut self, handler: LifecycleHandler) -> Self {
        self.handshake_handler = Some(handler);
        self
    }

    pub fn with_disconnect_handler(mut self, handler: LifecycleHandler) -> Self {
        self.disconnect_handler = Some(handler);
        self
    }

    pub fn capability(&self) -> Capability {
        Capability::new(self.name, self.version)
    }
}

/// The ordered set of sub-protocols this node speaks, sorted by name.
pub struct ProtocolRegistry {
    protocols: Vec<Arc<Protocol>>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<ProtocolRegistry>> = OnceLock::new();

impl ProtocolRegistry {
    pub fn new(mut protocols: Vec<Protocol>) -> Self {
        protocols.sort_by(|a, b| a.name.cmp(b.name).then(a.version.cmp(&b.version)));
        Self {
            protocols: protocols.into_iter().map(Arc::new).collect(),
        }
    }

    /// Installs the process-wide registry. May only succeed once; all later
    /// calls are rejected, the registry is immutable after that.
    pub fn install(protocols: Vec<Protocol>) -> Result<Arc<ProtocolRegistry>, RLPxError> {
        let registry = Arc::new(Self::new(protocols));
        GLOBAL_REGISTRY
            .set(registry.clone())
            .map_err(|_| RLPxError::InvalidState("protocol registry already installed".to_string()))?;
        Ok(registry)
    }

    /// The installed process-wide registry, if any.
    pub fn global() -> Option<Arc<ProtocolRegistry>> {
        GLOBAL_REGISTRY.get().cloned()
    }

    pub fn protocols(&self) -> &[Arc<Protocol>] {
        &self.protocols
    }

    /// The capability list announced in our hello message.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.protocols.iter().map(|p| p.capability()).collect()
    }
}

struct TableEntry {
    protocol_index: usize,
    local_id: u16,
}

/// Per-peer routing table built from the remote's capability list. Maps the
/// contiguous per-peer message-id space onto the negotiated sub-protocols.
pub struct Dispatcher {
    protocols: Vec<Arc<Protocol>>,
    /// Offset assigned to each registry protocol; `None` when the remote did
    /// not announce it.
    offsets: Vec<Option<u16>>,
    /// Flat table indexed by per-peer message id. The first
    /// `BASE_PROTOCOL_LENGTH` slots are reserved for devp2p.
    table: Vec<Option<TableEntry>>,
}

impl Dispatcher {
    /// Assigns message-id offsets to every registry protocol the remote also
    /// announced, in registry order, starting right after the reserved ids.
    pub fn negotiate(registry: &ProtocolRegistry, remote_capabilities: &[Capability]) -> Self {
        let protocols: Vec<_> = registry.protocols().to_vec();
        let mut offsets = Vec::with_capacity(protocols.len());
        let mut table: Vec<Option<TableEntry>> = Vec::new();
        for _ in 0..BASE_PROTOCOL_LENGTH {
            table.push(None);
        }

        let mut next_offset = BASE_PROTOCOL_LENGTH;
        for (protocol_index, protocol) in protocols.iter().enumerate() {
            if !remote_capabilities.contains(&protocol.capability()) {
                debug!(
                    "protocol {} not announced by the remote, skipping",
                    protocol.capability()
                );
                offsets.push(None);
                continue;
            }
            offsets.push(Some(next_offset));
            for local_id in 0..protocol.messages.len() as u16 {
                table.push(Some(TableEntry {
                    protocol_index,
                    local_id,
                }));
            }
            next_offset += protocol.messages.len() as u16;
        }

        Self {
            protocols,
            offsets,
            table,
        }
    }

    /// True when at least one sub-protocol was accepted by both sides.
    pub fn has_active_protocols(&self) -> bool {
        self.offsets.iter().any(Option::is_some)
    }

    /// The protocols accepted by both sides, in registry order.
    pub fn active_protocols(&self) -> impl Iterator<Item = &Arc<Protocol>> {
        self.protocols
            .iter()
            .zip(&self.offsets)
            .filter(|(_, offset)| offset.is_some())
            .map(|(protocol, _)| protocol)
    }

    /// The negotiated offset of a protocol, or `None` if the remote did not
    /// accept it.
    pub fn offset_of(&self, name: &str, version: u64) -> Option<u16> {
        self.protocols
            .iter()
            .position(|p| p.name == name && p.version == version)
            .and_then(|i| self.offsets[i])
    }

    /// Maps `(protocol, local id)` to the per-peer message id.
    pub fn absolute_id(&self, name: &str, local_id: u16) -> Option<u16> {
        let index = self.protocols.iter().position(|p| p.name == name)?;
        let offset = self.offsets[index]?;
        (usize::from(local_id) < self.protocols[index].messages.len())
            .then(|| offset + local_id)
    }

    /// Metadata for `(protocol, local id)`, negotiated or not.
    pub fn message_info(&self, name: &str, local_id: u16) -> Option<&MessageInfo> {
        let protocol = self.protocols.iter().find(|p| p.name == name)?;
        protocol.messages.get(usize::from(local_id))
    }

    /// Routes a per-peer message id to its protocol and message metadata.
    /// An out-of-range or unassigned id is a protocol breach.
    pub fn lookup(&self, msg_id: u16) -> Result<(&Arc<Protocol>, u16, &MessageInfo), RLPxError> {
        let entry = self
            .table
            .get(usize::from(msg_id))
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                RLPxError::BreachOfProtocol(format!("unknown message id {msg_id:#x}"))
            })?;
        let protocol = &self.protocols[entry.protocol_index];
        let info = &protocol.messages[usize::from(entry.local_id)];
        Ok((protocol, entry.local_id, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_protocols() -> Vec<Protocol> {
        let zed = Protocol::new(
            "zed",
            1,
            vec![
                MessageInfo::response("data", true),
                MessageInfo::request("get-data", 0, true, noop_handler()),
            ],
        );
        let abc = Protocol::new(
            "abc",
            7,
            vec![
                MessageInfo::notification("status", noop_handler()),
                MessageInfo::request("get-items", 2, false, noop_handler()),
                MessageInfo::response("items", false),
            ],
        );
        vec![zed, abc]
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_, _, _| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn registry_sorts_by_name() {
        let registry = ProtocolRegistry::new(probe_protocols());
        let names: Vec<_> = registry.protocols().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["abc", "zed"]);
    }

    #[test]
    fn offsets_follow_registry_order() {
        let registry = ProtocolRegistry::new(probe_protocols());
        let remote = vec![Capability::new("abc", 7), Capability::new("zed", 1)];
        let dispatcher = Dispatcher::negotiate(&registry, &remote);

        assert_eq!(dispatcher.offset_of("abc", 7), Some(16));
        assert_eq!(dispatcher.offset_of("zed", 1), Some(19));
        assert_eq!(dispatcher.absolute_id("zed", 1), Some(20));
        assert!(dispatcher.has_active_protocols());
    }

    #[test]
    fn rejected_protocols_get_no_offset() {
        let registry = ProtocolRegistry::new(probe_protocols());
        // remote announces zed with the wrong version and abc not at all
        let remote = vec![Capability::new("zed", 2)];
        let dispatcher = Dispatcher::negotiate(&registry, &remote);

        assert_eq!(dispatcher.offset_of("abc", 7), None);
        assert_eq!(dispatcher.offset_of("zed", 1), None);
        assert!(!dispatcher.has_active_protocols());
        assert_eq!(dispatcher.absolute_id("zed", 0), None);
    }

    #[test]
    fn partial_overlap_compacts_the_id_space() {
        let registry = ProtocolRegistry::new(probe_protocols());
        let remote = vec![Capability::new("zed", 1)];
        let dispatcher = Dispatcher::negotiate(&registry, &remote);

        // abc was skipped, so zed starts right after the reserved ids
        assert_eq!(dispatcher.offset_of("zed", 1), Some(16));
        let (protocol, local_id, info) = dispatcher.lookup(17).unwrap();
        assert_eq!(protocol.name, "zed");
        assert_eq!(local_id, 1);
        assert_eq!(info.name, "get-data");
    }

    #[test]
    fn the_global_registry_installs_exactly_once() {
        let first = ProtocolRegistry::install(probe_protocols());
        assert!(first.is_ok());
        assert!(ProtocolRegistry::global().is_some());
        // mutation after installation is forbidden
        let second = ProtocolRegistry::install(Vec::new());
        assert!(second.is_err());
        assert_eq!(ProtocolRegistry::global().unwrap().protocols().len(), 2);
    }

    #[test]
    fn unknown_ids_are_a_breach() {
        let registry = ProtocolRegistry::new(probe_protocols());
        let remote = vec![Capability::new("abc", 7)];
        let dispatcher = Dispatcher::negotiate(&registry, &remote);

        // reserved range is unassigned
        assert!(dispatcher.lookup(0x0c).is_err());
        // one past the last assigned id
        assert!(dispatcher.lookup(19).is_err());
        // way out of range (scenario: msg id 0xff)
        assert!(matches!(
            dispatcher.lookup(0xff),
            Err(RLPxError::BreachOfProtocol(_))
        ));
    }
}
