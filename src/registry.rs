use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tracing::{debug, info};
use crate::config::PeerNetConfig;
use crate::dispatch::{DatagramReceiver, PacketSink};
use crate::lock::{BlockingLock, LockStrategy};
use crate::peer::{PacketHandler, Peer};

/// All known peers by address. A peer is created on first contact, in either direction, and
///  there is never more than one peer per address.
pub struct PeerRegistry<L: LockStrategy = BlockingLock> {
    config: Arc<PeerNetConfig>,
    sink: Arc<dyn PacketSink>,
    handler: Arc<dyn PacketHandler<L>>,
    runtime: Handle,
    peers: RwLock<FxHashMap<SocketAddr, Arc<Peer<L>>>>,
    myself: Weak<PeerRegistry<L>>,
}

impl<L: LockStrategy> PeerRegistry<L> {
    /// `runtime` is where the peers' tick tasks are spawned
    pub fn new(
        config: Arc<PeerNetConfig>,
        sink: Arc<dyn PacketSink>,
        handler: Arc<dyn PacketHandler<L>>,
        runtime: Handle,
    ) -> Arc<PeerRegistry<L>> {
        Arc::new_cyclic(|myself| PeerRegistry {
            config,
            sink,
            handler,
            runtime,
            peers: Default::default(),
            myself: myself.clone(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<SocketAddr, Arc<Peer<L>>>> {
        self.peers.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<SocketAddr, Arc<Peer<L>>>> {
        self.peers.write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<Peer<L>>> {
        self.read().get(&addr).cloned()
    }

    pub fn get_or_create(&self, addr: SocketAddr) -> Arc<Peer<L>> {
        if let Some(peer) = self.get(addr) {
            return peer;
        }

        // double-checked: another thread may have created the peer in the meantime
        match self.write().entry(addr) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                info!("new peer {:?}", addr);
                let peer = Peer::new(addr, self.config.clone(), self.sink.clone(), self.handler.clone(), self.myself.clone());
                peer.start_ticking(&self.runtime);
                e.insert(peer).clone()
            }
        }
    }

    /// Removes a peer and closes it. The caller can still `stop()` the returned peer to wait
    ///  for a tick that is currently running.
    pub fn remove(&self, addr: SocketAddr) -> Option<Arc<Peer<L>>> {
        let removed = self.write().remove(&addr);
        if let Some(peer) = &removed {
            debug!("removing peer {:?}", addr);
            peer.close();
        }
        removed
    }

    /// removes and closes all peers
    pub fn remove_all(&self) -> Vec<Arc<Peer<L>>> {
        let removed = self.write()
            .drain()
            .map(|(_, peer)| peer)
            .collect::<Vec<_>>();
        for peer in &removed {
            peer.close();
        }
        removed
    }

    pub fn all(&self) -> Vec<Arc<Peer<L>>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<L: LockStrategy> DatagramReceiver for PeerRegistry<L> {
    fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        self.get_or_create(from)
            .receive_datagram(datagram);
    }
}
