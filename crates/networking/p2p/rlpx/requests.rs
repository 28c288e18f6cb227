use std::collections::HashMap;

use ethwire_rlp::{
    decode::{decode_rlp_item, RLPDecode},
    structs::Encoder,
};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::{error::RLPxError, p2p::DisconnectReason};

pub(crate) struct OutstandingRequest {
    /// Explicit request id carried in the message body, if the protocol uses
    /// them. `None` for protocols that resolve responses in FIFO order.
    req_id: Option<u64>,
    sender: oneshot::Sender<Result<Vec<u8>, RLPxError>>,
    deadline: Instant,
    /// Monotonic insertion order, so FIFO resolution survives the
    /// swap-removal of expired entries.
    seq: u64,
}

/// Tracks requests waiting for a response and one-shot message waiters,
/// both keyed by the per-peer id of the expected message.
pub struct RequestTable {
    outstanding: HashMap<u16, Vec<OutstandingRequest>>,
    awaited: HashMap<u16, oneshot::Sender<Vec<u8>>>,
    last_req_id: u64,
    next_seq: u64,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
            awaited: HashMap::new(),
            last_req_id: 0,
            next_seq: 0,
        }
    }

    /// Allocates a fresh request id. Ids increase monotonically for the
    /// lifetime of the peer.
    pub fn allocate_request_id(&mut self) -> u64 {
        self.last_req_id += 1;
        self.last_req_id
    }

    /// Registers a request waiting for `response_msg_id` and returns the
    /// future half.
    pub fn register(
        &mut self,
        response_msg_id: u16,
        req_id: Option<u64>,
        deadline: Instant,
    ) -> oneshot::Receiver<Result<Vec<u8>, RLPxError>> {
        let (sender, receiver) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding
            .entry(response_msg_id)
            .or_default()
            .push(OutstandingRequest {
                req_id,
                sender,
                deadline,
                seq,
            });
        receiver
    }

    /// Registers interest in the next message with the given id. At most one
    /// waiter per id may be pending.
    pub fn register_awaited(
        &mut self,
        msg_id: u16,
    ) -> Result<oneshot::Receiver<Vec<u8>>, RLPxError> {
        // a closed slot belongs to a waiter that gave up
        if let Some(pending) = self.awaited.get(&msg_id) {
            if !pending.is_closed() {
                return Err(RLPxError::InvalidState(format!(
                    "a message waiter for id {msg_id:#x} is already pending"
                )));
            }
        }
        let (sender, receiver) = oneshot::channel();
        self.awaited.insert(msg_id, sender);
        Ok(receiver)
    }

    /// Hands an inbound response to the request it resolves. Unmatched and
    /// late responses are logged and dropped, never an error.
    pub fn resolve_response(&mut self, msg_id: u16, req_id: Option<u64>, body: &[u8]) {
        let now = Instant::now();
        let Some(entries) = self.outstanding.get_mut(&msg_id) else {
            debug!("response with message id {msg_id:#x} matches no outstanding request, dropping");
            return;
        };

        // lazy sweep of expired entries, swap-with-last removal
        let mut i = 0;
        while i < entries.len() {
            if entries[i].deadline <= now {
                entries.swap_remove(i);
            } else {
                i += 1;
            }
        }

        match req_id {
            Some(req_id) => {
                // explicit-id style: the response names its request
                if let Some(at) = entries.iter().position(|r| r.req_id == Some(req_id)) {
                    let request = entries.swap_remove(at);
                    if request.sender.send(Ok(body.to_vec())).is_err() {
                        debug!("request {req_id} was resolved concurrently, dropping response");
                    }
                } else if req_id > self.last_req_id {
                    debug!("response carries request id {req_id} that was never issued, dropping");
                } else {
                    debug!("late or duplicate response for request id {req_id}, dropping");
                }
            }
            None => {
                // FIFO style: the oldest request that still has a waiting
                // future wins
                loop {
                    let Some(at) = entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| r.seq)
                        .map(|(at, _)| at)
                    else {
                        debug!(
                            "response with message id {msg_id:#x} has no outstanding request, dropping"
                        );
                        break;
                    };
                    let request = entries.swap_remove(at);
                    if request.sender.send(Ok(body.to_vec())).is_ok() {
                        break;
                    }
                    // that future was abandoned (timed out); try the next oldest
                }
            }
        }
    }

    /// Wakes the one-shot waiter for `msg_id`, if any.
    pub fn deliver_awaited(&mut self, msg_id: u16, body: &[u8]) {
        if let Some(sender) = self.awaited.remove(&msg_id) {
            if sender.send(body.to_vec()).is_err() {
                debug!("message waiter for id {msg_id:#x} gave up before delivery");
            }
        }
    }

    /// Resolves every pending future with a disconnect error. Called exactly
    /// once, when the peer is torn down.
    pub fn fail_all(&mut self, reason: DisconnectReason) {
        for (_, entries) in self.outstanding.drain() {
            for request in entries {
                let _ = request
                    .sender
                    .send(Err(RLPxError::PeerDisconnected(reason)));
            }
        }
        // dropping the senders wakes the waiters with a closed-channel error
        self.awaited.clear();
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrites a request body so the allocated request id is its first element:
/// `[a, b, ...]` becomes `[req-id, a, b, ...]`.
pub(crate) fn prepend_request_id(req_id: u64, body: &[u8]) -> Result<Vec<u8>, RLPxError> {
    let (is_list, payload, _rest) = decode_rlp_item(body)?;
    if !is_list {
        return Err(RLPxError::InvalidState(
            "request bodies must be RLP lists".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(body.len() + 9);
    Encoder::new(&mut out)
        .encode_field(&req_id)
        .encode_raw(payload)
        .finish();
    Ok(out)
}

/// Splits the leading request id off a message body, returning it along with
/// the remaining elements re-framed as a list.
pub(crate) fn split_request_id(body: &[u8]) -> Result<(u64, Vec<u8>), RLPxError> {
    let (is_list, payload, _rest) = decode_rlp_item(body)
        .map_err(|_| RLPxError::BreachOfProtocol("undecodable message body".to_string()))?;
    if !is_list {
        return Err(RLPxError::BreachOfProtocol(
            "message body is not an RLP list".to_string(),
        ));
    }
    let (req_id, remaining) = u64::decode_unfinished(payload)
        .map_err(|_| RLPxError::BreachOfProtocol("undecodable request id".to_string()))?;
    let mut out = Vec::with_capacity(remaining.len() + 9);
    Encoder::new(&mut out).encode_raw(remaining).finish();
    Ok((req_id, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn request_id_framing_round_trips() {
        let mut body = Vec::new();
        Encoder::new(&mut body)
            .encode_field(&"payload")
            .encode_field(&7u8)
            .finish();

        let framed = prepend_request_id(42, &body).unwrap();
        let (req_id, rest) = split_request_id(&framed).unwrap();
        assert_eq!(req_id, 42);
        assert_eq!(rest, body);
    }

    #[tokio::test]
    async fn fifo_resolution_hits_the_oldest_request() {
        let mut table = RequestTable::new();
        let first = table.register(0x14, None, later());
        let second = table.register(0x14, None, later());

        table.resolve_response(0x14, None, &[0xc0]);

        // the first request resolves, the second stays pending
        assert_eq!(first.await.unwrap().unwrap(), vec![0xc0]);
        let mut second = second;
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn fifo_resolution_skips_abandoned_requests() {
        let mut table = RequestTable::new();
        let first = table.register(0x14, None, later());
        let second = table.register(0x14, None, later());
        drop(first); // as if it timed out

        table.resolve_response(0x14, None, &[0xc0]);
        assert_eq!(second.await.unwrap().unwrap(), vec![0xc0]);
    }

    #[tokio::test]
    async fn explicit_ids_match_out_of_order() {
        let mut table = RequestTable::new();
        let id_a = table.allocate_request_id();
        let id_b = table.allocate_request_id();
        let a = table.register(0x20, Some(id_a), later());
        let b = table.register(0x20, Some(id_b), later());

        table.resolve_response(0x20, Some(id_b), &[0x0b]);
        table.resolve_response(0x20, Some(id_a), &[0x0a]);

        assert_eq!(a.await.unwrap().unwrap(), vec![0x0a]);
        assert_eq!(b.await.unwrap().unwrap(), vec![0x0b]);
    }

    #[tokio::test]
    async fn unknown_future_request_ids_are_dropped() {
        let mut table = RequestTable::new();
        let id = table.allocate_request_id();
        let mut rx = table.register(0x20, Some(id), later());

        // an id we never issued
        table.resolve_response(0x20, Some(id + 100), &[0xc0]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        tokio::time::pause();
        let mut table = RequestTable::new();
        let expired = table.register(0x14, None, Instant::now() + Duration::from_millis(10));
        tokio::time::advance(Duration::from_secs(1)).await;

        let live = table.register(0x14, None, later());
        table.resolve_response(0x14, None, &[0x01]);

        assert_eq!(live.await.unwrap().unwrap(), vec![0x01]);
        // the expired entry was removed without being resolved
        assert!(expired.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_resolves_with_the_disconnect_reason() {
        let mut table = RequestTable::new();
        let rx = table.register(0x14, None, later());
        let awaited = table.register_awaited(0x03).unwrap();

        table.fail_all(DisconnectReason::TooManyPeers);

        match rx.await.unwrap() {
            Err(RLPxError::PeerDisconnected(DisconnectReason::TooManyPeers)) => {}
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert!(awaited.await.is_err());
    }

    #[tokio::test]
    async fn one_awaited_slot_per_message_id() {
        let mut table = RequestTable::new();
        let _first = table.register_awaited(0x03).unwrap();
        assert!(table.register_awaited(0x03).is_err());

        // a slot whose waiter gave up can be taken over
        drop(_first);
        let second = table.register_awaited(0x03).unwrap();
        table.deliver_awaited(0x03, &[0xc0]);
        assert_eq!(second.await.unwrap(), vec![0xc0]);
    }
}
