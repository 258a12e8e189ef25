use crate::timing::Checkpoints;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};

type Lookup = Shared<BoxFuture<'static, Result<Vec<SocketAddr>, Arc<anyhow::Error>>>>;

/// System resolver that merges concurrent lookups of the same name.
///
/// A caller that joins a lookup already in flight is told its answer was
/// coalesced.
#[derive(Clone, Default)]
pub struct CoalescingResolver {
    in_flight: Arc<Mutex<HashMap<String, Lookup>>>,
}

impl CoalescingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        checkpoints: &impl Checkpoints,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        checkpoints.dns_started();
        let key = format!("{}:{}", host, port);
        let (lookup, coalesced) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(lookup) => (lookup.clone(), true),
                None => {
                    let lookup = system_lookup(host.to_string(), port);
                    in_flight.insert(key.clone(), lookup.clone());
                    (lookup, false)
                }
            }
        };
        if coalesced {
            debug!("Joining in-flight DNS lookup for {}", key);
        } else {
            debug!("Resolving DNS for: {}", key);
        }

        let result = lookup.await;
        if !coalesced {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
        checkpoints.dns_done(coalesced);

        let addresses = result.map_err(|e| anyhow!("DNS lookup for {} failed: {}", host, e))?;
        for (i, addr) in addresses.iter().enumerate() {
            if i == 0 {
                debug!("Resolved IP: {}", addr.ip());
            } else {
                trace!("Resolved IP (alternative): {}", addr.ip());
            }
        }
        Ok(addresses)
    }
}

fn system_lookup(host: String, port: u16) -> Lookup {
    async move {
        let name = host.clone();
        let addresses: Vec<SocketAddr> =
            tokio::task::spawn_blocking(move || (name.as_str(), port).to_socket_addrs())
                .await
                .map_err(|e| Arc::new(anyhow!(e)))?
                .map_err(|e| Arc::new(anyhow!(e)))?
                .collect();
        if addresses.is_empty() {
            error!("DNS resolution for {} returned no addresses.", host);
            return Err(Arc::new(anyhow!("No IP addresses found for host {}", host)));
        }
        Ok(addresses)
    }
    .boxed()
    .shared()
}
