//! Resolutor de credenciales de comercio.
//!
//! Cachea (merchant, MAC secret) con TTL y coalesce de misses concurrentes
//! (singleflight): N tareas pidiendo el mismo comercio producen UNA ida al
//! store y al secret store. La invalidación es explícita y síncrona ante
//! mutaciones del comercio. Cache local al proceso.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::entities::Merchant;
use crate::domain::error::PaymentError;
use crate::domain::gateways::{GatewayCredentials, SecretStore};
use crate::domain::repository::MerchantRepository;

#[derive(Clone, Debug)]
pub struct ResolvedMerchant {
    pub merchant: Merchant,
    pub credentials: GatewayCredentials,
}

#[derive(Clone)]
struct CacheEntry {
    resolved: ResolvedMerchant,
    expires_at: Instant,
}

pub struct CredentialResolver {
    merchants: Arc<dyn MerchantRepository>,
    secrets: Arc<dyn SecretStore>,
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, CacheEntry>>,
    slug_index: RwLock<HashMap<String, Uuid>>,
    // Un candado por clave para coalescer misses concurrentes
    inflight: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CredentialResolver {
    pub fn new(
        merchants: Arc<dyn MerchantRepository>,
        secrets: Arc<dyn SecretStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            merchants,
            secrets,
            ttl,
            entries: RwLock::new(HashMap::new()),
            slug_index: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, merchant_id: Uuid) -> Result<ResolvedMerchant, PaymentError> {
        if let Some(entry) = self.fresh_entry(merchant_id).await {
            return Ok(entry.resolved);
        }

        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(merchant_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // Releer: otra tarea pudo habernos ganado mientras esperábamos el candado
        if let Some(entry) = self.fresh_entry(merchant_id).await {
            return Ok(entry.resolved);
        }

        let resolved = self.fetch(merchant_id).await?;
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                merchant_id,
                CacheEntry {
                    resolved: resolved.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        {
            let mut slugs = self.slug_index.write().await;
            slugs.insert(resolved.merchant.slug.clone(), merchant_id);
        }

        Ok(resolved)
    }

    /// Resuelve por slug; el índice slug→id es cacheado igual que las entradas.
    pub async fn get_by_slug(&self, slug: &str) -> Result<ResolvedMerchant, PaymentError> {
        let cached_id = { self.slug_index.read().await.get(slug).copied() };
        if let Some(id) = cached_id {
            return self.get(id).await;
        }

        let merchant = self
            .merchants
            .find_by_slug(slug)
            .await?
            .ok_or_else(|| PaymentError::Validation(format!("unknown merchant slug {}", slug)))?;
        self.get(merchant.id).await
    }

    /// Invalidación explícita ante mutaciones del comercio.
    pub async fn invalidate(&self, merchant_id: Uuid) {
        let removed = { self.entries.write().await.remove(&merchant_id) };
        if let Some(entry) = removed {
            self.slug_index
                .write()
                .await
                .remove(&entry.resolved.merchant.slug);
        }
    }

    async fn fresh_entry(&self, merchant_id: Uuid) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        entries
            .get(&merchant_id)
            .filter(|e| e.expires_at > Instant::now())
            .cloned()
    }

    async fn fetch(&self, merchant_id: Uuid) -> Result<ResolvedMerchant, PaymentError> {
        let merchant = self
            .merchants
            .find_by_id(merchant_id)
            .await?
            .ok_or(PaymentError::NotFound(merchant_id))?;

        if !merchant.active {
            return Err(PaymentError::Unauthorized(format!(
                "merchant {} is inactive",
                merchant_id
            )));
        }

        let mac_secret = self.secrets.fetch_mac_secret(&merchant.mac_secret_ref).await?;

        Ok(ResolvedMerchant {
            credentials: GatewayCredentials {
                cust_nbr: merchant.cust_nbr.clone(),
                merch_nbr: merchant.merch_nbr.clone(),
                dba_nbr: merchant.dba_nbr.clone(),
                terminal_nbr: merchant.terminal_nbr.clone(),
                mac_secret,
            },
            merchant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};

    mock! {
        pub MerchantRepositoryImpl {}

        #[async_trait]
        impl MerchantRepository for MerchantRepositoryImpl {
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, PaymentError>;
            async fn find_by_slug(&self, slug: &str) -> Result<Option<Merchant>, PaymentError>;
        }
    }

    struct CountingSecretStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SecretStore for CountingSecretStore {
        async fn fetch_mac_secret(&self, _secret_ref: &str) -> Result<String, PaymentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Fetch lento para que los misses concurrentes se solapen
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("mac-secret".to_string())
        }
    }

    fn merchant(id: Uuid) -> Merchant {
        Merchant {
            id,
            slug: "acme".to_string(),
            cust_nbr: "1000".to_string(),
            merch_nbr: "2000".to_string(),
            dba_nbr: "1".to_string(),
            terminal_nbr: "3".to_string(),
            mac_secret_ref: "ref-1".to_string(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let id = Uuid::new_v4();
        let mut merchants = MockMerchantRepositoryImpl::new();
        merchants
            .expect_find_by_id()
            .times(1)
            .returning(move |id| Ok(Some(merchant(id))));
        let secrets = Arc::new(CountingSecretStore {
            calls: AtomicU32::new(0),
        });

        let resolver = Arc::new(CredentialResolver::new(
            Arc::new(merchants),
            secrets.clone(),
            Duration::from_secs(300),
        ));

        let a = tokio::spawn({
            let r = resolver.clone();
            async move { r.get(id).await }
        });
        let b = tokio::spawn({
            let r = resolver.clone();
            async move { r.get(id).await }
        });

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra.credentials.mac_secret, "mac-secret");
        assert_eq!(rb.merchant.id, id);
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched() {
        let id = Uuid::new_v4();
        let mut merchants = MockMerchantRepositoryImpl::new();
        merchants
            .expect_find_by_id()
            .times(2)
            .returning(move |id| Ok(Some(merchant(id))));
        let secrets = Arc::new(CountingSecretStore {
            calls: AtomicU32::new(0),
        });

        let resolver = CredentialResolver::new(
            Arc::new(merchants),
            secrets.clone(),
            Duration::from_secs(300),
        );

        resolver.get(id).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        resolver.get(id).await.unwrap();
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_a_refetch() {
        let id = Uuid::new_v4();
        let mut merchants = MockMerchantRepositoryImpl::new();
        merchants
            .expect_find_by_id()
            .times(2)
            .returning(move |id| Ok(Some(merchant(id))));
        let secrets = Arc::new(CountingSecretStore {
            calls: AtomicU32::new(0),
        });

        let resolver = CredentialResolver::new(
            Arc::new(merchants),
            secrets.clone(),
            Duration::from_secs(300),
        );

        resolver.get(id).await.unwrap();
        resolver.invalidate(id).await;
        resolver.get(id).await.unwrap();
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inactive_merchant_is_unauthorized() {
        let id = Uuid::new_v4();
        let mut merchants = MockMerchantRepositoryImpl::new();
        merchants.expect_find_by_id().returning(move |id| {
            Ok(Some(Merchant {
                active: false,
                ..merchant(id)
            }))
        });
        let secrets = Arc::new(CountingSecretStore {
            calls: AtomicU32::new(0),
        });

        let resolver =
            CredentialResolver::new(Arc::new(merchants), secrets, Duration::from_secs(300));
        let err = resolver.get(id).await.unwrap_err();
        assert!(matches!(err, PaymentError::Unauthorized(_)));
    }
}
