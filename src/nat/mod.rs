//! Reflexive (NAT-mapped) address discovery over the shared P2P socket
//!
//! The STUN server is registered as an ordinary peer session. Its payload
//! generator emits binding requests every keepalive tick, which also keeps
//! the NAT binding of the shared socket open. Its listener decodes each
//! response and publishes the mapped address on a `watch` channel.

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use tokio::sync::watch;
use crate::error::DecodeError;
use crate::session::registry::SessionOptions;
use crate::session::{PayloadGenerator, SessionEvent, SessionHandle, SessionListener, SessionRegistry, Timing};
use crate::utils;

pub mod stun;

pub use stun::StunBinding;

/// Request/response codec of a reflexive-address service
///
/// `request` must not depend on session state: it is called on every tick.
pub trait ReflexiveResolver: Send + Sync {
    fn request(&self) -> Vec<u8>;
    fn decode(&self, response: &[u8]) -> Result<SocketAddr, DecodeError>;
}

/// Keepalive generator producing resolver requests
struct ResolverProbe(Arc<dyn ReflexiveResolver>);

impl PayloadGenerator for ResolverProbe {
    fn generate(&self) -> crate::Result<Vec<u8>> {
        Ok(self.0.request())
    }
}

/// Listener decoding resolver responses into the published mapped address
struct ResolverListener {
    resolver: Arc<dyn ReflexiveResolver>,
    mapped_tx: watch::Sender<Option<SocketAddr>>,
}

impl SessionListener for ResolverListener {
    fn on_event(&self, event: SessionEvent) -> crate::Result<()> {
        match event {
            SessionEvent::Message(server, payload) => match self.resolver.decode(&payload) {
                Ok(mapped) => {
                    let changed = self.mapped_tx.send_if_modified(|current| {
                        let changed = *current != Some(mapped);
                        *current = Some(mapped);
                        changed
                    });
                    if changed {
                        tracing::info!("Reflexive address {} (via {})", mapped, server);
                    }
                }
                Err(e) => tracing::warn!("Invalid STUN response from {}: {}", server, e),
            },
            SessionEvent::Connected(server) => tracing::info!("STUN server {} reachable", server),
            SessionEvent::Disconnected(server) => {
                tracing::warn!("STUN server {} stopped answering", server);
            }
        }
        Ok(())
    }
}

/// Register `server` as the reflexive-address pseudo-peer
///
/// Returns the session (not started) and a receiver of the latest mapped address.
pub async fn attach_resolver(
    registry: &SessionRegistry,
    server: SocketAddr,
    resolver: Arc<dyn ReflexiveResolver>,
    timing: Timing,
) -> (SessionHandle, watch::Receiver<Option<SocketAddr>>) {
    let (mapped_tx, mapped_rx) = watch::channel(None);
    let options = SessionOptions {
        timing: Some(timing),
        generator: Some(Arc::new(ResolverProbe(resolver.clone()))),
        listener: Some(Arc::new(ResolverListener { resolver, mapped_tx })),
    };
    let session = registry.add_with(server, options).await;
    (session, mapped_rx)
}

/// Resolve the STUN server address
pub async fn resolve_server(server: &str) -> anyhow::Result<SocketAddr> {
    utils::resolve_addr(server)
        .await
        .with_context(|| format!("Failed to resolve STUN server {}", server))
}
