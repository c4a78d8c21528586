//! Two-tier template cache.
//!
//! Tier one is a process-local `DashMap`; tier two is the shared Redis
//! cache. Compiled templates and rendered output are cached
//! separately. Cache failures never fail a render: the lookup degrades
//! to the store and a direct compile. Nulls (template not found) are
//! never cached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::cache::{CacheNamespace, RedisPool};
use crate::notification::Channel;
use crate::repository::{Template, TemplateStore};
use crate::template::renderer::{self, Rendered};
use crate::{Error, Result};

struct CachedEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> CachedEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> Option<T> {
        (Instant::now() < self.expires_at).then(|| self.value.clone())
    }
}

/// Hit/miss counters flushed periodically by the scheduler
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Template cache and rendering entry point.
pub struct TemplateCache {
    store: Arc<dyn TemplateStore>,
    pool: RedisPool,

    local_compiled: DashMap<String, CachedEntry<Template>>,
    local_rendered: DashMap<String, CachedEntry<Rendered>>,

    compiled_ttl: Duration,
    rendered_ttl: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl TemplateCache {
    pub fn new(
        store: Arc<dyn TemplateStore>,
        pool: RedisPool,
        compiled_ttl_hours: u64,
        rendered_ttl_hours: u64,
    ) -> Self {
        Self {
            store,
            pool,
            local_compiled: DashMap::new(),
            local_rendered: DashMap::new(),
            compiled_ttl: Duration::from_secs(compiled_ttl_hours * 3600),
            rendered_ttl: Duration::from_secs(rendered_ttl_hours * 3600),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Render through the cache. The happy path never touches the
    /// database: compiled template from tier one, rendered output from
    /// tier one or two.
    pub async fn render(
        &self,
        template_id: &str,
        channel: Channel,
        locale: Option<&str>,
        vars: &serde_json::Value,
    ) -> Result<Rendered> {
        let started = Instant::now();

        let template = self.resolve_template(template_id, channel, locale).await?;
        let key = renderer::render_key(&template, vars);

        if let Some(entry) = self.local_rendered.get(&key) {
            if let Some(rendered) = entry.live() {
                self.record_hit();
                return Ok(rendered);
            }
        }

        if let Some(rendered) = self.shared_rendered_lookup(&key).await {
            self.record_hit();
            self.local_rendered
                .insert(key, CachedEntry::new(rendered.clone(), self.rendered_ttl));
            return Ok(rendered);
        }

        self.record_miss();

        let rendered = renderer::render(&template, vars)?;

        self.local_rendered
            .insert(key.clone(), CachedEntry::new(rendered.clone(), self.rendered_ttl));
        self.shared_rendered_store(&key, &rendered).await;

        metrics::histogram!("render.latency_seconds", "channel" => channel.as_str())
            .record(started.elapsed().as_secs_f64());

        Ok(rendered)
    }

    /// Compiled-template lookup with locale fallback.
    async fn resolve_template(
        &self,
        template_id: &str,
        channel: Channel,
        locale: Option<&str>,
    ) -> Result<Template> {
        let local_key = compiled_key(template_id, channel, locale);

        if let Some(entry) = self.local_compiled.get(&local_key) {
            if let Some(template) = entry.live() {
                self.record_hit();
                return Ok(template);
            }
        }

        if let Some(template) = self.shared_compiled_lookup(&local_key).await {
            self.record_hit();
            self.local_compiled
                .insert(local_key, CachedEntry::new(template.clone(), self.compiled_ttl));
            return Ok(template);
        }

        self.record_miss();

        let template = self
            .store
            .find_with_fallback(template_id, channel, locale)
            .await?
            .ok_or_else(|| {
                Error::TemplateNotFound(format!(
                    "{}/{}/{}",
                    template_id,
                    channel,
                    locale.unwrap_or("default")
                ))
            })?;

        self.local_compiled
            .insert(local_key.clone(), CachedEntry::new(template.clone(), self.compiled_ttl));
        self.shared_compiled_store(&local_key, &template).await;

        Ok(template)
    }

    /// Drop cache entries for a template after an admin update. The
    /// bumped version keeps stale rendered entries from ever matching
    /// a new render key.
    pub async fn invalidate(&self, template_id: &str) {
        self.local_compiled
            .retain(|key, _| !key.starts_with(&format!("{}/", template_id)));
        self.local_rendered
            .retain(|key, _| !key.starts_with(&format!("{}/", template_id)));

        if let Ok(mut conn) = self.pool.get().await {
            for channel in Channel::ALL {
                for locale in ["default", "en"] {
                    let key = CacheNamespace::TemplateCompiled.key(
                        self.pool.key_prefix(),
                        &compiled_key(template_id, channel, Some(locale)),
                    );
                    let _ = conn.del(&key).await;
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache.hits").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache.misses").increment(1);
    }

    async fn shared_rendered_lookup(&self, key: &str) -> Option<Rendered> {
        let full_key = CacheNamespace::TemplateRendered.key(self.pool.key_prefix(), key);
        match self.pool.get().await {
            Ok(mut conn) => match conn.get_bytes(&full_key).await {
                Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
                Ok(None) => None,
                Err(e) => {
                    debug!(error = %e, "Shared rendered-cache read failed, degrading");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "Shared cache unavailable, degrading to direct render");
                None
            }
        }
    }

    async fn shared_rendered_store(&self, key: &str, rendered: &Rendered) {
        let full_key = CacheNamespace::TemplateRendered.key(self.pool.key_prefix(), key);
        let Ok(bytes) = serde_json::to_vec(rendered) else {
            return;
        };
        if let Ok(mut conn) = self.pool.get().await {
            if let Err(e) = conn
                .set_ex(&full_key, &bytes, self.rendered_ttl.as_secs())
                .await
            {
                debug!(error = %e, "Shared rendered-cache write failed");
            }
        }
    }

    async fn shared_compiled_lookup(&self, key: &str) -> Option<Template> {
        let full_key = CacheNamespace::TemplateCompiled.key(self.pool.key_prefix(), key);
        match self.pool.get().await {
            Ok(mut conn) => match conn.get_bytes(&full_key).await {
                Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
                _ => None,
            },
            Err(_) => None,
        }
    }

    async fn shared_compiled_store(&self, key: &str, template: &Template) {
        let full_key = CacheNamespace::TemplateCompiled.key(self.pool.key_prefix(), key);
        let Ok(bytes) = serde_json::to_vec(template) else {
            return;
        };
        if let Ok(mut conn) = self.pool.get().await {
            if let Err(e) = conn
                .set_ex(&full_key, &bytes, self.compiled_ttl.as_secs())
                .await
            {
                debug!(error = %e, "Shared compiled-cache write failed");
            }
        }
    }
}

fn compiled_key(template_id: &str, channel: Channel, locale: Option<&str>) -> String {
    format!("{}/{}/{}", template_id, channel, locale.unwrap_or("default"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_entry_expiry() {
        let entry = CachedEntry::new(1u32, Duration::from_secs(60));
        assert_eq!(entry.live(), Some(1));

        let expired = CachedEntry::new(1u32, Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(expired.live(), None);
    }

    #[test]
    fn test_compiled_key_includes_locale_fallback() {
        assert_eq!(
            compiled_key("welcome", Channel::Email, Some("de")),
            "welcome/email/de"
        );
        assert_eq!(
            compiled_key("welcome", Channel::Email, None),
            "welcome/email/default"
        );
    }
}
