//! External port allocation.
//!
//! The main process owns the configured port range through a [`PortPool`].
//! Child bridges own no range: their [`RemotePortClient`] forwards every
//! request to the main process over the child's message channel.

use crate::config::PortRange;
use crate::identity::BridgeIdentity;
use crate::ipc::{ChannelSender, Envelope, PortAllocated, PortRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How long a child waits for the main process to answer a port request.
pub const PORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Port allocator of one process: the authoritative pool in the main
/// process, a delegating client in child bridges.
#[derive(Clone)]
pub enum PortService {
    Local(Arc<PortPool>),
    Remote(RemotePortClient),
}

impl PortService {
    pub fn local(range: Option<PortRange>) -> Self {
        PortService::Local(Arc::new(PortPool::new(range)))
    }

    /// Port for `identity`, or `None` to let the protocol runtime pick one.
    pub async fn request_port(&self, identity: &BridgeIdentity) -> Option<u16> {
        match self {
            PortService::Local(pool) => pool.request_port(identity),
            PortService::Remote(client) => client.request_port(identity).await,
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Last port handed out; `None` until the first allocation. Kept wider
    /// than `u16` so stepping past 65535 cannot wrap.
    cursor: Option<u32>,
    allocations: HashMap<BridgeIdentity, Option<u16>>,
}

/// Inclusive port range handed out one port per identity.
///
/// The first result recorded for an identity, including "no port", is
/// returned for every later request of that identity. Ports are never
/// reclaimed, so once the cursor passes `end` the pool stays exhausted.
pub struct PortPool {
    range: Option<PortRange>,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(range: Option<PortRange>) -> Self {
        Self {
            range,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn range(&self) -> Option<PortRange> {
        self.range
    }

    pub fn request_port(&self, identity: &BridgeIdentity) -> Option<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.allocations.get(identity) {
            return *existing;
        }

        let port = self.next_free_port(&mut state);
        state.allocations.insert(identity.clone(), port);
        debug!(identity = %identity, port = ?port, "Recorded port allocation");
        port
    }

    fn next_free_port(&self, state: &mut PoolState) -> Option<u16> {
        let range = self.range?;
        let next = match state.cursor {
            None => u32::from(range.start),
            Some(cursor) => cursor.saturating_add(1),
        };
        state.cursor = Some(next);

        if next <= u32::from(range.end) {
            u16::try_from(next).ok()
        } else {
            warn!("External port pool ran out of ports. Falling back to random port assignment.");
            None
        }
    }
}

type PendingRequests = HashMap<BridgeIdentity, oneshot::Sender<Option<u16>>>;

/// Child-side allocator: sends `PORT_REQUEST` to the main process and waits
/// for the matching `PORT_ALLOCATED`, correlated by identity.
#[derive(Clone)]
pub struct RemotePortClient {
    sender: ChannelSender<Envelope>,
    pending: Arc<Mutex<PendingRequests>>,
    timeout: Duration,
}

impl RemotePortClient {
    pub fn new(sender: ChannelSender<Envelope>) -> Self {
        Self::with_timeout(sender, PORT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(sender: ChannelSender<Envelope>, timeout: Duration) -> Self {
        Self {
            sender,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn request_port(&self, identity: &BridgeIdentity) -> Option<u16> {
        let (tx, rx) = oneshot::channel();
        // A second request for the same identity replaces the first waiter.
        self.pending().insert(identity.clone(), tx);

        let request = Envelope::PortRequest(PortRequest {
            username: identity.clone(),
        });
        if self.sender.send(request).is_err() {
            self.pending().remove(identity);
            warn!(identity = %identity, "Parent process is not connected - assigning random port.");
            return None;
        }

        let reply = tokio::time::timeout(self.timeout, rx).await;
        match reply {
            Ok(Ok(port)) => port,
            Ok(Err(_)) => None,
            Err(_) => {
                // Only drop our own waiter; a newer request may have replaced it.
                let mut pending = self.pending();
                if pending.get(identity).is_some_and(oneshot::Sender::is_closed) {
                    pending.remove(identity);
                }
                drop(pending);
                warn!(
                    "Parent process did not respond to port allocation request within {} seconds - assigning random port.",
                    self.timeout.as_secs()
                );
                None
            }
        }
    }

    /// Route a `PORT_ALLOCATED` reply to its waiting request. Replies nobody
    /// waits for any more are dropped.
    pub fn handle_allocated(&self, allocated: PortAllocated) {
        let waiter = self.pending().remove(&allocated.username);
        match waiter {
            Some(tx) => {
                let _ = tx.send(allocated.port);
            }
            None => debug!(identity = %allocated.username, "Discarding late port allocation"),
        }
    }
}
