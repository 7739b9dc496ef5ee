// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-connection in-flight tracker: correlates outbound packet identifiers with the
//! acknowledgement type awaited, drives retry/timeout, and holds QoS 2 received-but-unreleased
//! messages (receiver-side storage keyed by packet id).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use codec::{v5, EncodePacket, Packet, PacketId};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};
use crate::stream::WriteStream;

/// The single ack type a pending identifier is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitedAck {
    PublishAck,
    PublishReceived,
    PublishComplete,
    SubscribeAck,
}

/// Sum type over the possible ack payloads, delivered to a waiting `start()` call.
#[derive(Debug, Clone)]
pub enum AckValue {
    PublishAck(v5::PublishAckPacket),
    PublishReceived(v5::PublishReceivedPacket),
    PublishComplete(v5::PublishCompletePacket),
    SubscribeAck(v5::SubscribeAckPacket),
}

impl AckValue {
    const fn awaited(&self) -> AwaitedAck {
        match self {
            Self::PublishAck(..) => AwaitedAck::PublishAck,
            Self::PublishReceived(..) => AwaitedAck::PublishReceived,
            Self::PublishComplete(..) => AwaitedAck::PublishComplete,
            Self::SubscribeAck(..) => AwaitedAck::SubscribeAck,
        }
    }
}

struct Inflight {
    awaited: AwaitedAck,
    tx: oneshot::Sender<AckValue>,
}

/// A packet that may be retransmitted with the `DUP` bit set.
///
/// Only `PUBLISH` carries a meaningful, settable `DUP` bit; every other packet type is a no-op.
pub trait Retryable: EncodePacket + Packet + Clone {
    fn mark_duplicate(&mut self) {}
}

impl Retryable for v5::PublishPacket {
    fn mark_duplicate(&mut self) {
        // QoS 0 never retries (no ack is awaited), so this is always valid.
        let _ignore = self.set_dup(true);
    }
}

impl Retryable for v5::PublishReleasePacket {}
impl Retryable for v5::SubscribePacket {}

/// RAII guard marking the session as "inside a retrying `start()` call" for its lifetime.
/// A counter rather than a bare flag, so nested/concurrent `start()` calls on the same
/// session (e.g. the QoS 2 PUBREC phase and PUBREL phase run back to back) can't clear the
/// flag out from under one another.
struct RetryGuard<'a>(&'a AtomicUsize);

impl<'a> RetryGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-connection in-flight packet-identifier tracker, per specification component 4.2.
pub struct Session {
    inflight: StdMutex<HashMap<PacketId, Inflight>>,
    qos2_received: StdMutex<HashMap<PacketId, v5::PublishPacket>>,
    stream: AsyncMutex<WriteStream>,
    next_id: StdMutex<PacketId>,
    ack_timeout: Duration,
    retry_delay: Duration,
    /// Non-zero while a `start()` call is somewhere in its retry loop. While this is set,
    /// `write()` swallows write failures instead of returning them, so a transient write
    /// error can't abandon the flow mid-retry; the ack timeout is the authoritative failure
    /// signal instead.
    retrying: AtomicUsize,
}

impl Session {
    #[must_use]
    pub fn new(stream: WriteStream, ack_timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            inflight: StdMutex::new(HashMap::new()),
            qos2_received: StdMutex::new(HashMap::new()),
            stream: AsyncMutex::new(stream),
            next_id: StdMutex::new(PacketId::new(0)),
            ack_timeout,
            retry_delay,
            retrying: AtomicUsize::new(0),
        }
    }

    fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::Acquire) > 0
    }

    /// Allocate the next outbound packet identifier, wrapping `0xFFFF -> 1`.
    pub fn next_packet_id(&self) -> PacketId {
        let mut guard = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *guard = guard.next();
        *guard
    }

    /// Serialise outgoing writes via the connection-local lock, encode, and write `packet`.
    ///
    /// While a `start()` retry loop is active on this session, a failure here is logged and
    /// swallowed (returns `Ok(())`) rather than propagated: the retry loop's ack timeout is
    /// the authoritative failure signal, so a transient write error must not abandon the flow
    /// mid-retry. Outside of a retry loop the error is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the underlying socket write fails and no retry loop is
    /// currently active.
    pub async fn write<P: EncodePacket>(&self, packet: &P) -> Result<(), Error> {
        match self.write_once(packet).await {
            Ok(()) => Ok(()),
            Err(err) if self.is_retrying() => {
                log::debug!("session: write error swallowed while a retry loop is active: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn write_once<P: EncodePacket>(&self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        let mut stream = self.stream.lock().await;
        stream.write_all(&buf).await
    }

    /// Register `id -> awaitedType`, write `packet`, and wait up to the ack timeout for a
    /// matching `meet()` call. On timeout, mark the packet as a duplicate, back off, and retry
    /// up to `retries` additional times.
    ///
    /// Registration happens before the write so a fast acknowledgement is never missed.
    ///
    /// # Errors
    ///
    /// Returns error if retries are exhausted or the underlying write fails.
    pub async fn start<P: Retryable>(
        &self,
        id: PacketId,
        awaited: AwaitedAck,
        mut packet: P,
        mut retries: u32,
    ) -> Result<AckValue, Error> {
        let _retrying = RetryGuard::new(&self.retrying);
        loop {
            let (tx, rx) = oneshot::channel();
            self.inflight.lock().unwrap_or_else(|e| e.into_inner()).insert(
                id,
                Inflight { awaited, tx },
            );

            // A write failure here is swallowed by `write()` while `_retrying` is held; the
            // ack timeout below is what ultimately surfaces a dead connection.
            let _ignore = self.write(&packet).await;

            match timeout(self.ack_timeout, rx).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(_)) | Err(_) => {
                    self.inflight.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    if retries == 0 {
                        return Err(Error::new(
                            ErrorKind::TimeoutError,
                            "session: ack timeout, retries exhausted",
                        ));
                    }
                    retries -= 1;
                    packet.mark_duplicate();
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Deliver `value` to the task waiting on `id`, if any.
    ///
    /// Fails if no entry exists for `id`, or if the received ack type does not match what was
    /// awaited (e.g. a `PUBCOMP` arriving while a `PUBREC` is awaited).
    ///
    /// # Errors
    ///
    /// Returns error on missing or mismatched entries.
    pub fn meet(&self, id: PacketId, value: AckValue) -> Result<(), Error> {
        let mut guard = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = guard.remove(&id) else {
            return Err(Error::new(
                ErrorKind::ClientNotFound,
                "session: no in-flight entry for packet id",
            ));
        };
        if entry.awaited != value.awaited() {
            return Err(Error::new(
                ErrorKind::ClientNotFound,
                "session: unexpected ack type for packet id",
            ));
        }
        drop(entry.tx.send(value));
        Ok(())
    }

    /// Store an inbound QoS 2 `PUBLISH` awaiting a matching `PUBREL` (receiver path).
    pub fn store_message(&self, publish: v5::PublishPacket) {
        self.qos2_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(publish.packet_id(), publish);
    }

    /// Look up a stored QoS 2 `PUBLISH` by packet id without removing it.
    #[must_use]
    pub fn load_message(&self, id: PacketId) -> Option<v5::PublishPacket> {
        self.qos2_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Remove a stored QoS 2 `PUBLISH`, returning it if present.
    pub fn delete_message(&self, id: PacketId) -> Option<v5::PublishPacket> {
        self.qos2_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub async fn shutdown(&self) {
        self.stream.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::{AckValue, AwaitedAck};
    use codec::v5;

    #[test]
    fn test_ack_value_awaited() {
        let ack = AckValue::PublishAck(v5::PublishAckPacket::new(1.into()));
        assert_eq!(ack.awaited(), AwaitedAck::PublishAck);
    }
}
