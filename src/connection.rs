//! Connection management.
//!
//! Owns the connection environment, the circuit breaker and the list of
//! discovered domain controllers. Hands out `DirectoryConnection` guards
//! that release their session on every exit path.
//!
//! Optional idle pool for service-credential sessions, enabled by
//! `connectionPoolingEnabled`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, BreakerStatus, CircuitBreaker};
use crate::config::{ReferralPolicy, StoreConfig};
use crate::directory::{
    AttributeChange, DirectoryConnector, DirectorySession, SearchPage, SearchRequest,
    TransportOptions,
};
use crate::domain_discovery::DomainControllerRecord;
use crate::errors::{DirectoryError, Result};
use crate::latency::LatencyLoggingConnector;
use crate::secure_types::{Credentials, SecureString};

/// Immutable per-store connection snapshot.
///
/// Caller-credential operations get a rebuilt copy through
/// `with_credentials`; the shared snapshot is never mutated.
#[derive(Debug, Clone)]
pub struct ConnectionEnvironment {
    pub provider_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub pooling: bool,
    pub transport: TransportOptions,
    pub referral: ReferralPolicy,
    pub idle_timeout: Duration,
    pub discovered_scheme: &'static str,
}

impl ConnectionEnvironment {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            provider_url: config
                .connection_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            credentials: config.service_credentials(),
            pooling: config.connection_pooling_enabled,
            transport: TransportOptions {
                connect_timeout: config.connect_timeout(),
                read_timeout: config.read_timeout(),
                start_tls: config.start_tls,
                no_tls_verify: config.no_tls_verify,
            },
            referral: config.referral,
            idle_timeout: config.idle_timeout(),
            discovered_scheme: config.discovered_scheme(),
        }
    }

    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            pooling: false,
            ..self.clone()
        }
    }
}

/// Where one connect-and-bind attempt stopped.
///
/// Only failures to reach the server count against the breaker. A bind
/// that fails or times out after the connection opened is handed back to
/// the caller untouched.
#[derive(Debug)]
enum AttemptError {
    Connect(DirectoryError),
    Bind(DirectoryError),
}

impl AttemptError {
    fn trips_breaker(&self) -> bool {
        matches!(self, AttemptError::Connect(e) if e.trips_breaker())
    }

    fn error(&self) -> &DirectoryError {
        match self {
            AttemptError::Connect(e) | AttemptError::Bind(e) => e,
        }
    }

    fn into_error(self) -> DirectoryError {
        match self {
            AttemptError::Connect(e) | AttemptError::Bind(e) => e,
        }
    }
}

struct IdleSession {
    session: Box<dyn DirectorySession>,
    parked_at: Instant,
    id: u64,
}

struct IdlePool {
    sessions: Mutex<Vec<IdleSession>>,
    idle_timeout: Duration,
}

impl IdlePool {
    fn take(&self) -> Option<(Box<dyn DirectorySession>, u64)> {
        let mut sessions = self.sessions.lock().ok()?;
        let before = sessions.len();
        sessions.retain(|s| s.parked_at.elapsed() <= self.idle_timeout);
        if sessions.len() < before {
            debug!("Dropped {} expired idle connections", before - sessions.len());
        }
        sessions.pop().map(|s| (s.session, s.id))
    }

    fn park(&self, session: Box<dyn DirectorySession>, id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(IdleSession {
                session,
                parked_at: Instant::now(),
                id,
            });
        }
    }

    fn drain(&self) -> Vec<Box<dyn DirectorySession>> {
        match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain(..).map(|s| s.session).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A session owned by one logical operation.
///
/// Dropping the guard releases the session: pooled sessions go back to the
/// idle pool, others are unbound on the runtime. Sessions that saw a
/// connectivity failure are never pooled.
pub struct DirectoryConnection {
    session: Option<Box<dyn DirectorySession>>,
    pool: Option<Arc<IdlePool>>,
    id: u64,
    url: String,
    broken: bool,
}

impl std::fmt::Debug for DirectoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryConnection")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("pooled", &self.pool.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

impl DirectoryConnection {
    fn new(
        session: Box<dyn DirectorySession>,
        pool: Option<Arc<IdlePool>>,
        id: u64,
        url: String,
    ) -> Self {
        Self {
            session: Some(session),
            pool,
            id,
            url,
            broken: false,
        }
    }

    /// Provider URL this session is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn session(&mut self) -> Result<&mut Box<dyn DirectorySession>> {
        self.session
            .as_mut()
            .ok_or_else(|| DirectoryError::Internal("connection already released".to_string()))
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.trips_breaker() {
                self.broken = true;
            }
        }
        result
    }

    pub async fn search(&mut self, request: &SearchRequest) -> Result<SearchPage> {
        let result = self.session()?.search(request).await;
        self.note(result)
    }

    pub async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> Result<()> {
        let result = self.session()?.add(dn, attributes).await;
        self.note(result)
    }

    pub async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let result = self.session()?.modify(dn, changes).await;
        self.note(result)
    }

    pub async fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<()> {
        let result = self.session()?.rename(dn, new_rdn).await;
        self.note(result)
    }

    pub async fn delete(&mut self, dn: &str) -> Result<()> {
        let result = self.session()?.delete(dn).await;
        self.note(result)
    }

    /// Releases the session now instead of at drop.
    pub async fn release(mut self) {
        if let Some(mut session) = self.session.take() {
            match self.pool.take() {
                Some(pool) if !self.broken => pool.park(session, self.id),
                _ => {
                    if let Err(e) = session.unbind().await {
                        debug!("Unbind of connection id={} failed: {}", self.id, e);
                    }
                }
            }
        }
    }
}

impl Drop for DirectoryConnection {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match self.pool.take() {
            Some(pool) if !self.broken => pool.park(session, self.id),
            _ => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let id = self.id;
                    handle.spawn(async move {
                        if let Err(e) = session.unbind().await {
                            debug!("Unbind of connection id={} failed: {}", id, e);
                        }
                    });
                }
            }
        }
    }
}

pub struct ConnectionManager {
    environment: ConnectionEnvironment,
    connector: Arc<dyn DirectoryConnector>,
    breaker: CircuitBreaker,
    controllers: Vec<DomainControllerRecord>,
    pool: Option<Arc<IdlePool>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Builds a manager for one store.
    ///
    /// `controllers` comes from DNS discovery; when empty the configured
    /// connection URL is used.
    pub fn new(
        config: &StoreConfig,
        connector: Arc<dyn DirectoryConnector>,
        controllers: Vec<DomainControllerRecord>,
    ) -> Result<Self> {
        let environment = ConnectionEnvironment::from_config(config);
        if controllers.is_empty() && environment.provider_url.is_none() {
            return Err(DirectoryError::Configuration(
                "No connection URL configured and no domain controllers discovered".to_string(),
            ));
        }

        let connector: Arc<dyn DirectoryConnector> = if config.latency_logging {
            Arc::new(LatencyLoggingConnector::new(connector))
        } else {
            connector
        };

        let pool = environment.pooling.then(|| {
            Arc::new(IdlePool {
                sessions: Mutex::new(Vec::new()),
                idle_timeout: environment.idle_timeout,
            })
        });

        Ok(Self {
            breaker: CircuitBreaker::new(config.retry_delay()),
            environment,
            connector,
            controllers,
            pool,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn environment(&self) -> &ConnectionEnvironment {
        &self.environment
    }

    pub fn controllers(&self) -> &[DomainControllerRecord] {
        &self.controllers
    }

    pub async fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status().await
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// A session bound with the store's service credentials.
    pub async fn acquire(&self) -> Result<DirectoryConnection> {
        if let Some(pool) = &self.pool {
            if let Some((session, id)) = pool.take() {
                debug!("Reusing pooled connection id={}", id);
                let url = self.environment.provider_url.clone().unwrap_or_default();
                return Ok(DirectoryConnection::new(session, Some(Arc::clone(pool)), id, url));
            }
        }
        let (session, url) = self.establish(&self.environment).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!("Created new directory connection id={} to {}", id, url);
        Ok(DirectoryConnection::new(session, self.pool.clone(), id, url))
    }

    /// A session bound as `principal`. Never pooled.
    pub async fn acquire_with_credentials(
        &self,
        principal: &str,
        secret: &SecureString,
    ) -> Result<DirectoryConnection> {
        let environment = self
            .environment
            .with_credentials(Credentials::new(principal, secret.clone()));
        let (session, url) = self.establish(&environment).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Opened connection id={} to {} as {}", id, url, principal);
        Ok(DirectoryConnection::new(session, None, id, url))
    }

    async fn establish(
        &self,
        environment: &ConnectionEnvironment,
    ) -> Result<(Box<dyn DirectorySession>, String)> {
        match self.breaker.admit().await? {
            Admission::Probe => {
                let outcome = self.connect_any(environment).await;
                match &outcome {
                    Err(e) if e.trips_breaker() => self.breaker.record_failure().await,
                    // Reaching the server is enough, even if the bind failed.
                    _ => self.breaker.record_success().await,
                }
                outcome.map_err(AttemptError::into_error)
            }
            Admission::Closed => match self.connect_any(environment).await {
                Err(first) if first.trips_breaker() => {
                    warn!("Connection attempt failed ({}), retrying once", first.error());
                    let second = self.connect_any(environment).await;
                    if let Err(e) = &second {
                        if e.trips_breaker() {
                            self.breaker.record_failure().await;
                        }
                    }
                    second.map_err(AttemptError::into_error)
                }
                other => other.map_err(AttemptError::into_error),
            },
        }
    }

    /// One pass over the configured URL or every discovered controller.
    async fn connect_any(
        &self,
        environment: &ConnectionEnvironment,
    ) -> std::result::Result<(Box<dyn DirectorySession>, String), AttemptError> {
        if self.controllers.is_empty() {
            let url = environment.provider_url.clone().ok_or_else(|| {
                AttemptError::Connect(DirectoryError::Configuration(
                    "No connection URL configured".to_string(),
                ))
            })?;
            let session = self.connect_and_bind(&url, environment).await?;
            return Ok((session, url));
        }

        let mut last_error = None;
        for controller in &self.controllers {
            let url = controller.url(environment.discovered_scheme);
            match self.connect_and_bind(&url, environment).await {
                Ok(session) => return Ok((session, url)),
                Err(e) if e.trips_breaker() => {
                    warn!(
                        "Domain controller {} ({}) failed: {}",
                        controller.hostname,
                        url,
                        e.error()
                    );
                    last_error = Some(e.into_error());
                }
                Err(e) => return Err(e),
            }
        }
        Err(AttemptError::Connect(DirectoryError::Connectivity(format!(
            "All {} domain controllers failed; last error: {}",
            self.controllers.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))))
    }

    async fn connect_and_bind(
        &self,
        url: &str,
        environment: &ConnectionEnvironment,
    ) -> std::result::Result<Box<dyn DirectorySession>, AttemptError> {
        let connect_timeout = environment.transport.connect_timeout;
        let mut session = timeout(
            connect_timeout,
            self.connector.connect(url, &environment.transport),
        )
        .await
        .map_err(|_| {
            AttemptError::Connect(DirectoryError::Timeout(format!(
                "Connection to {} did not complete within {} ms",
                url,
                connect_timeout.as_millis()
            )))
        })?
        .map_err(AttemptError::Connect)?;

        if let Some(credentials) = &environment.credentials {
            if let Err(e) = session.bind(credentials.principal(), credentials.secret()).await {
                if let Err(unbind_err) = session.unbind().await {
                    debug!("Unbind after failed bind to {} failed: {}", url, unbind_err);
                }
                return Err(AttemptError::Bind(e.with_context("bind", credentials.principal())));
            }
        }
        Ok(session)
    }

    /// Unbinds every idle pooled session.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            let sessions = pool.drain();
            let count = sessions.len();
            for mut session in sessions {
                if let Err(e) = session.unbind().await {
                    debug!("Unbind during close failed: {}", e);
                }
            }
            info!("Connection manager closed, {} idle connections released", count);
        }
    }
}
