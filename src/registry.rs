//! Channel registry: the one byte channel per peer, by peer id.
//!
//! Purely a lookup table owned by the session coordinator. Closing is
//! idempotent and safe on a channel that is already closed.

use crate::transport::ByteChannel;
use crate::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<PeerId, Arc<dyn ByteChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `channel` to `peer`, replacing any previous channel.
    pub async fn register(&self, peer: &PeerId, channel: Arc<dyn ByteChannel>) {
        debug!(event = "channel_registered", peer = %peer, channel = %channel.label());
        self.channels.lock().await.insert(peer.clone(), channel);
    }

    pub async fn get(&self, peer: &PeerId) -> Option<Arc<dyn ByteChannel>> {
        self.channels.lock().await.get(peer).cloned()
    }

    /// Close and forget the peer's channel. No-op for unknown peers.
    pub async fn close(&self, peer: &PeerId) {
        let removed = self.channels.lock().await.remove(peer);
        if let Some(channel) = removed {
            debug!(event = "channel_closed", peer = %peer);
            channel.close().await;
        }
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.channels.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    #[tokio::test]
    async fn register_get_close_roundtrip() {
        let registry = ChannelRegistry::new();
        let peer: PeerId = "p1".into();
        let (a, _b) = MemoryChannel::pair("transfer");

        registry.register(&peer, a).await;
        assert!(registry.get(&peer).await.is_some());
        assert_eq!(registry.peers().await, vec![peer.clone()]);

        registry.close(&peer).await;
        assert!(registry.get(&peer).await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = ChannelRegistry::new();
        let peer: PeerId = "p1".into();
        let (a, _b) = MemoryChannel::pair("transfer");

        registry.register(&peer, a.clone()).await;
        a.close().await;
        // Closing an already-closed channel and an unknown peer are both fine.
        registry.close(&peer).await;
        registry.close(&peer).await;
        registry.close(&"ghost".to_string()).await;
    }
}
