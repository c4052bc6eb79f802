pub mod auth;
pub mod cache;
pub mod error;
pub mod ghost;
pub mod keys;
pub mod location;
pub mod membership;
pub mod rooms;

use std::sync::Arc;

use kinpoint_db::{RepoConfig, Repository};
use kinpoint_kv::KvClient;
use tokio::sync::Notify;

pub use error::CoreError;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_address: String,
    pub port: u16,
    pub redis_url: String,
    /// Verification key for app-minted bearer tokens. `None` rejects every
    /// authenticated request.
    pub jwt_secret: Option<String>,
    pub cache_enabled: bool,
    pub repository: RepoConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3001,
            redis_url: "redis://localhost:6379".to_string(),
            jwt_secret: Some("your-secret-key".to_string()),
            cache_enabled: true,
            repository: RepoConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub kv: Arc<KvClient>,
    pub repo: Arc<Repository>,
    pub cache: Arc<cache::FamilyCache>,
    pub ghost: Arc<ghost::GhostService>,
    pub locations: Arc<location::LocationService>,
    pub verifier: Arc<auth::TokenVerifier>,
    pub registry: rooms::RoomRegistry,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    /// Wire the service graph on top of already-connected backends.
    pub fn assemble(config: AppConfig, kv: KvClient, repo: Repository) -> Self {
        let kv = Arc::new(kv);
        let repo = Arc::new(repo);
        let cache = Arc::new(cache::FamilyCache::new(
            kv.clone(),
            repo.clone(),
            config.cache_enabled,
        ));
        let ghost = Arc::new(ghost::GhostService::new(
            kv.clone(),
            repo.clone(),
            cache.clone(),
        ));
        let locations = Arc::new(location::LocationService::new(
            kv.clone(),
            cache.clone(),
            ghost.clone(),
        ));
        let verifier = Arc::new(auth::TokenVerifier::new(config.jwt_secret.clone()));
        Self {
            config,
            kv,
            repo,
            cache,
            ghost,
            locations,
            verifier,
            registry: rooms::RoomRegistry::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}
