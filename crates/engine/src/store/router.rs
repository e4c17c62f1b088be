use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::store::{create_store_for_url, Store};

/// Routes each tenant to its store. Tenants without a dedicated database
/// share the default store.
///
/// Stores are opened once at startup and closed through [`TenantStores::close`];
/// nothing here is global.
#[derive(Clone)]
pub struct TenantStores {
    default: Arc<dyn Store>,
    tenants: HashMap<String, Arc<dyn Store>>,
}

impl TenantStores {
    pub fn new(default: Arc<dyn Store>) -> Self {
        Self {
            default,
            tenants: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.tenants.insert(tenant_id.into(), store);
        self
    }

    /// Opens a store for every `tenant -> url` entry.
    pub async fn connect(
        default: Arc<dyn Store>,
        tenant_urls: &HashMap<String, String>,
        max_connections: u32,
    ) -> crate::Result<Self> {
        let mut stores = Self::new(default);
        for (tenant, url) in tenant_urls {
            info!(tenant_id = %tenant, "Opening dedicated tenant store");
            let store = create_store_for_url(url, max_connections).await?;
            stores.tenants.insert(tenant.clone(), store);
        }
        Ok(stores)
    }

    pub fn for_tenant(&self, tenant_id: &str) -> Arc<dyn Store> {
        self.tenants
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Every distinct store, default first. Sweeps poll each of them.
    pub fn all(&self) -> Vec<Arc<dyn Store>> {
        let mut stores = vec![self.default.clone()];
        for store in self.tenants.values() {
            if !stores.iter().any(|s| Arc::ptr_eq(s, store)) {
                stores.push(store.clone());
            }
        }
        stores
    }

    pub async fn init(&self) -> crate::Result<()> {
        for store in self.all() {
            store.init().await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        for store in self.all() {
            store.close().await;
        }
    }
}
