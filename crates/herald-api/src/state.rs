//! Shared application state, built once at boot in dependency order.

use std::sync::Arc;

use herald_core::auth::{ApiKeyRegistry, JwtVerifier};
use herald_core::broker::{Broker, Publisher};
use herald_core::cache::{RateLimiter, RedisPool, TokenBlacklist};
use herald_core::dlq::ReplayController;
use herald_core::observability::PrometheusHandle;
use herald_core::repository::{NotificationStore, PreferenceStore, TemplateStore};
use herald_core::scheduler::Scheduler;
use herald_core::template::TemplateCache;
use herald_core::Config;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: PgPool,
    pub store: Arc<dyn NotificationStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub template_store: Arc<dyn TemplateStore>,
    pub templates: Arc<TemplateCache>,
    pub cache: RedisPool,
    pub broker: Arc<Broker>,
    pub publisher: Publisher,
    pub rate_limiter: RateLimiter,
    pub blacklist: TokenBlacklist,
    pub jwt: JwtVerifier,
    pub api_keys: ApiKeyRegistry,
    pub scheduler: Arc<Scheduler>,
    pub replay: Arc<ReplayController>,
    pub metrics: PrometheusHandle,
}
