use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{self, AuthError};
use crate::clock::Clock;
use crate::config::AdminSeed;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::Role;
use crate::sweeper;

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("tenant name too long")]
    NameTooLong,
    #[error("empty tenant name")]
    EmptyName,
    #[error("tenant name {0:?} may only contain ASCII letters, digits, '_' and '-'")]
    InvalidName(String),
    #[error("too many tenants")]
    TooMany,
    #[error("cannot open tenant: {0}")]
    Io(#[from] std::io::Error),
    #[error("admin bootstrap failed: {0}")]
    Engine(#[from] EngineError),
    #[error("admin bootstrap failed: {0}")]
    Auth(#[from] AuthError),
}

/// Per-tenant engine settings shared by every database.
#[derive(Debug, Clone)]
pub struct TenantOptions {
    pub compact_threshold: u64,
    /// `None` leaves reconciliation to an external scheduler.
    pub sweep_interval: Option<Duration>,
    pub admin: Option<AdminSeed>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL and
/// background tasks. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Serializes creation so two first connections cannot open one WAL twice.
    creating: tokio::sync::Mutex<()>,
    data_dir: PathBuf,
    options: TenantOptions,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            creating: tokio::sync::Mutex::new(()),
            data_dir,
            options,
            clock,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub async fn get_or_create(&self, tenant: &str) -> Result<Arc<Engine>, TenantError> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        validate_tenant_name(tenant)?;

        let _creating = self.creating.lock().await;
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(TenantError::TooMany);
        }

        // Validated names map one-to-one onto WAL files.
        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let engine = Arc::new(Engine::with_clock(wal_path, self.clock.clone())?);

        if let Some(seed) = &self.options.admin {
            bootstrap_admin(&engine, seed).await?;
        }

        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            self.options.compact_threshold,
        ));
        tokio::spawn(sweeper::run_token_pruner(engine.clone()));
        if let Some(every) = self.options.sweep_interval {
            tokio::spawn(sweeper::run_sweeper(engine.clone(), every));
        }

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "opened tenant");
        Ok(engine)
    }
}

/// Tenant names become file names, so only a path-safe alphabet is accepted.
/// Anything else is refused rather than rewritten: two names must never
/// land on the same WAL.
fn validate_tenant_name(tenant: &str) -> Result<(), TenantError> {
    if tenant.is_empty() {
        return Err(TenantError::EmptyName);
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(TenantError::NameTooLong);
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TenantError::InvalidName(tenant.to_string()));
    }
    Ok(())
}

/// Create the configured admin unless the tenant already has one.
async fn bootstrap_admin(engine: &Engine, seed: &AdminSeed) -> Result<(), TenantError> {
    if engine.list_accounts().iter().any(|a| a.role == Role::Admin) {
        return Ok(());
    }
    if engine.account_by_email(&seed.email).is_some() {
        warn!(email = %seed.email, "bootstrap admin email belongs to a customer; skipping");
        return Ok(());
    }
    auth::check_password_policy(&seed.password)?;
    let password = seed.password.clone();
    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))??;
    engine
        .register_account(Ulid::new(), &seed.email, "Administrator", hash, Role::Admin)
        .await?;
    info!(email = %seed.email, "created bootstrap admin");
    Ok(())
}
