//! Periodic maintenance jobs.
//!
//! Interval loops with cooperative shutdown: retention
//! cleanup/archival (also triggerable from the admin API), the token
//! blacklist sweep (functionally a no-op, TTL does the work), and the
//! cache statistics flush.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::repository::NotificationStore;
use crate::template::TemplateCache;
use crate::Result;

/// Outcome of a cleanup run
#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub processed: u64,
    pub archived: u64,
    pub deleted: u64,
    pub duration_ms: u64,
}

/// Result of asking for a cleanup run
#[derive(Debug)]
pub enum CleanupRun {
    Completed(CleanupResult),

    /// Another run holds the single-flight lock
    AlreadyRunning,
}

/// Scheduler owning the periodic jobs.
pub struct Scheduler {
    store: Arc<dyn NotificationStore>,
    templates: Arc<TemplateCache>,
    retention: RetentionConfig,

    /// Single-flight guard for cleanup runs
    cleanup_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        templates: Arc<TemplateCache>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            store,
            templates,
            retention,
            cleanup_lock: Mutex::new(()),
        }
    }

    /// Spawn the periodic loops. Returns the join handles.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        // Cleanup/archival
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            let interval = Duration::from_secs(self.retention.cleanup_interval_hours * 3600);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the immediate first tick
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                        }
                        _ = ticker.tick() => {
                            match scheduler.run_cleanup().await {
                                Ok(CleanupRun::Completed(result)) => {
                                    info!(?result, "Scheduled cleanup finished");
                                }
                                Ok(CleanupRun::AlreadyRunning) => {
                                    debug!("Cleanup already running, skipping tick");
                                }
                                Err(e) => error!(error = %e, "Scheduled cleanup failed"),
                            }
                        }
                    }
                }
            }));
        }

        // Cache statistics flush
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(300));
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                        }
                        _ = ticker.tick() => {
                            let stats = scheduler.templates.stats();
                            info!(hits = stats.hits, misses = stats.misses, "Template cache statistics");
                        }
                    }
                }
            }));
        }

        // Blacklist sweep: eviction is TTL-driven in the cache, the
        // sweep only leaves an audit trail that it ran.
        {
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                        }
                        _ = ticker.tick() => {
                            info!("Blacklist sweep: TTL-driven, nothing to evict manually");
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Archive old notifications, then drop archived rows past the
    /// hard horizon. Single-writer: concurrent calls get
    /// `AlreadyRunning`.
    pub async fn run_cleanup(&self) -> Result<CleanupRun> {
        let Ok(_guard) = self.cleanup_lock.try_lock() else {
            return Ok(CleanupRun::AlreadyRunning);
        };

        let started = Instant::now();

        let archive_cutoff = Utc::now() - chrono::Duration::days(self.retention.days);
        let delete_cutoff = Utc::now() - chrono::Duration::days(self.retention.hard_delete_days);

        let archived = self.store.archive_older_than(archive_cutoff).await?;
        let deleted = self.store.delete_archived_older_than(delete_cutoff).await?;

        let result = CleanupResult {
            processed: archived + deleted,
            archived,
            deleted,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            archived = result.archived,
            deleted = result.deleted,
            duration_ms = result.duration_ms,
            "Cleanup run complete"
        );

        Ok(CleanupRun::Completed(result))
    }

    /// Cleanup restricted to one user, for the admin surface.
    pub async fn run_cleanup_for_user(&self, user_id: Uuid) -> Result<CleanupRun> {
        let Ok(_guard) = self.cleanup_lock.try_lock() else {
            return Ok(CleanupRun::AlreadyRunning);
        };

        let started = Instant::now();
        let cutoff = Utc::now() - chrono::Duration::days(self.retention.days);

        let archived = self.store.archive_user_older_than(user_id, cutoff).await?;

        Ok(CleanupRun::Completed(CleanupResult {
            processed: archived,
            archived,
            deleted: 0,
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }

    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }
}
