//! Lease-bound node registration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::etcd::EtcdGatewayStore;
use crate::store::{CoordinationStore, LeaseId};

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub node_name: String,
    pub advertise_address: String,
    pub ttl: Duration,
    /// Namespace prepended to the node name to form the key.
    pub key_prefix: String,
}

impl RegistrationConfig {
    pub fn new<N: Into<String>, A: Into<String>>(node_name: N, advertise_address: A, ttl: Duration) -> Self {
        Self {
            node_name: node_name.into(),
            advertise_address: advertise_address.into(),
            ttl,
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key(&self) -> String {
        format!("{}{}", self.key_prefix, self.node_name)
    }

    /// Renewal period: a third of the TTL, never below 100ms.
    pub fn keepalive_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_KEEPALIVE_INTERVAL)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(RegistryError::InvalidConfig("node name must not be empty".into()));
        }
        if self.node_name.contains('/') {
            return Err(RegistryError::InvalidConfig(format!(
                "node name {} must not contain '/'",
                self.node_name
            )));
        }
        if self.advertise_address.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "advertise address must not be empty".into(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(RegistryError::InvalidConfig("lease ttl must be positive".into()));
        }
        Ok(())
    }
}

/// Registers nodes in a coordination store.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Grants a lease, writes `name -> address` under it and starts renewal.
    ///
    /// Any failure revokes what was acquired and closes the store client
    /// before returning.
    pub async fn register(&self, config: RegistrationConfig) -> Result<Registration> {
        if let Err(err) = config.validate() {
            self.store.close().await;
            return Err(err);
        }
        let key = config.key();

        let lease = match self.store.grant_lease(config.ttl).await {
            Ok(lease) => lease,
            Err(err) => {
                self.store.close().await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .store
            .put(&key, &config.advertise_address, Some(lease))
            .await
        {
            if let Err(revoke_err) = self.store.revoke_lease(lease).await {
                warn!(lease, error = %revoke_err, "failed to revoke lease after put failure");
            }
            self.store.close().await;
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let liveness_lost = CancellationToken::new();
        let keepalive = tokio::spawn(run_keepalive_loop(
            self.store.clone(),
            lease,
            key.clone(),
            config.keepalive_interval(),
            cancel.clone(),
            liveness_lost.clone(),
        ));

        info!(
            node = %config.node_name,
            address = %config.advertise_address,
            lease,
            ttl_secs = config.ttl.as_secs(),
            "node registered"
        );

        Ok(Registration {
            store: self.store.clone(),
            key,
            lease,
            cancel,
            liveness_lost,
            keepalive: Some(keepalive),
        })
    }
}

/// Connects to etcd at `endpoint` and registers `node_name -> advertise_address`.
pub async fn register_with_etcd(
    endpoint: &str,
    advertise_address: &str,
    node_name: &str,
    ttl_secs: u64,
    dial_timeout_secs: u64,
) -> Result<Registration> {
    let store = EtcdGatewayStore::connect(endpoint, Duration::from_secs(dial_timeout_secs)).await?;
    Registry::new(Arc::new(store))
        .register(RegistrationConfig::new(
            node_name,
            advertise_address,
            Duration::from_secs(ttl_secs),
        ))
        .await
}

/// A live registration. Dropping it stops renewal and lets the lease expire;
/// [`Registration::deregister`] removes the key immediately.
pub struct Registration {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease: LeaseId,
    cancel: CancellationToken,
    liveness_lost: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Fires once renewal has failed and the key can no longer be trusted
    /// to exist. The registration is not re-established.
    pub fn liveness_lost(&self) -> CancellationToken {
        self.liveness_lost.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.liveness_lost.is_cancelled()
    }

    /// Stops renewal, deletes the key, revokes the lease and closes the
    /// store client. Failures are logged.
    pub async fn deregister(mut self) {
        self.cancel.cancel();
        if let Some(keepalive) = self.keepalive.take() {
            if let Err(err) = keepalive.await {
                warn!(error = %err, "keepalive task ended abnormally");
            }
        }

        match self.store.delete(&self.key).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %self.key, "registration key already gone"),
            Err(err) => warn!(key = %self.key, error = %err, "failed to delete registration key"),
        }
        if let Err(err) = self.store.revoke_lease(self.lease).await {
            debug!(lease = self.lease, error = %err, "lease revoke failed");
        }
        self.store.close().await;
        info!(key = %self.key, "node deregistered");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_keepalive_loop(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    key: String,
    period: Duration,
    cancel: CancellationToken,
    liveness_lost: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(lease, period_ms = period.as_millis() as u64, "keepalive started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(lease, "keepalive stopped");
                return;
            }
            _ = ticker.tick() => {
                let renewed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(lease, "keepalive stopped during renewal");
                        return;
                    }
                    renewed = store.keep_alive(lease) => renewed,
                };
                match renewed {
                    Ok(Some(ttl)) => {
                        debug!(lease, ttl_secs = ttl.as_secs(), "lease renewed");
                    }
                    Ok(None) => {
                        warn!(lease, key = %key, "keepalive lost: lease expired or revoked");
                        break;
                    }
                    Err(err) => {
                        warn!(lease, key = %key, error = %err, "keepalive lost: store unavailable");
                        break;
                    }
                }
            }
        }
    }

    counter!("filemesh_registry_keepalive_failures_total").increment(1);
    liveness_lost.cancel();
}
