//! Cache de access tokens OAuth2 por proveedor
//!
//! El token vive solo en memoria del proceso. Las lecturas usan el valor
//! cacheado; un refresh es exclusivo (un único request de token en vuelo por
//! proveedor) y los callers concurrentes reciben el resultado de ese refresh.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clients::error::ProviderResult;
use crate::models::Provider;

/// Token recién emitido por el proveedor
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: SecretString,
    pub expires_in: Duration,
}

/// Origen de tokens (client-credentials grant del proveedor)
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn issue_token(&self) -> ProviderResult<IssuedToken>;
}

/// Access token cacheado
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub provider: Provider,
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
    /// Se incrementa con cada refresh; permite saber si un token rechazado
    /// ya fue reemplazado
    pub generation: u64,
}

impl AccessToken {
    /// Expirado o a punto de expirar dentro del margen
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

pub struct TokenCache {
    provider: Provider,
    source: Arc<dyn TokenSource>,
    current: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
    refresh_margin: Duration,
}

impl TokenCache {
    pub fn new(
        provider: Provider,
        source: Arc<dyn TokenSource>,
        refresh_margin: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            source,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            refresh_margin: Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    /// Obtener un token válido, renovándolo si hace falta
    pub async fn get(&self) -> ProviderResult<AccessToken> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }
        self.refresh(None).await
    }

    /// Renovar después de que el proveedor rechazara `rejected` con un 401.
    /// Si otro caller ya lo reemplazó, se devuelve el token nuevo sin pedir otro.
    pub async fn refresh_after_rejection(
        &self,
        rejected: &AccessToken,
    ) -> ProviderResult<AccessToken> {
        self.refresh(Some(rejected.generation)).await
    }

    async fn cached(&self) -> Option<AccessToken> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|token| !token.is_expired(self.refresh_margin))
            .cloned()
    }

    async fn refresh(&self, rejected_generation: Option<u64>) -> ProviderResult<AccessToken> {
        let _guard = self.refresh_lock.lock().await;

        // Otro caller pudo haber renovado mientras esperábamos el lock
        if let Some(token) = self.cached().await {
            let replaced = match rejected_generation {
                Some(rejected) => token.generation > rejected,
                None => true,
            };
            if replaced {
                debug!("🔑 Token {} ya renovado por otro caller", self.provider);
                return Ok(token);
            }
        }

        let issued = self.source.issue_token().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = AccessToken {
            provider: self.provider,
            token: issued.access_token,
            expires_at: Utc::now() + issued.expires_in,
            generation,
        };

        *self.current.write().await = Some(token.clone());
        info!(
            "🔑 Token {} renovado (generación {}, expira {})",
            self.provider,
            generation,
            token.expires_at.to_rfc3339()
        );

        Ok(token)
    }
}
