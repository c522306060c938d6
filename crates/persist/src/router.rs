//! Primary/replica routing with health-checked read fan-out.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::counter;
use sqlx::PgPool;
use tracing::warn;

/// Walk `pools` from `start`, returning the first that passes `probe`
/// plus the cursor the next call should resume from. Kept free of any
/// database type so rotation and fallback stay testable on their own.
pub async fn select_read<'a, P, F, Fut>(pools: &'a [P], start: usize, probe: F) -> (Option<&'a P>, usize)
where
    F: Fn(&'a P) -> Fut,
    Fut: Future<Output = bool>,
{
    if pools.is_empty() {
        return (None, start);
    }
    for i in 0..pools.len() {
        let idx = (start + i) % pools.len();
        if probe(&pools[idx]).await {
            return (Some(&pools[idx]), (idx + 1) % pools.len());
        }
    }
    // nothing healthy; advance anyway so the next attempt rotates too
    (None, (start + 1) % pools.len())
}

/// One write pool plus zero or more read pools. Reads rotate over the
/// replicas with a liveness probe per call and fall back to the primary
/// when every replica fails, so replica loss is invisible to callers as
/// long as the primary is up. The probe is advisory: a passing probe
/// does not guarantee the query that follows, callers still treat read
/// failures as retryable.
pub struct DbRouter {
    primary: PgPool,
    replicas: Vec<PgPool>,
    cursor: AtomicUsize,
}

impl DbRouter {
    pub fn new(primary: PgPool, replicas: Vec<PgPool>) -> Self {
        Self { primary, replicas, cursor: AtomicUsize::new(0) }
    }

    /// Writes always go to the primary.
    pub fn write_db(&self) -> &PgPool {
        &self.primary
    }

    /// Next healthy replica, or the primary when none pass the probe.
    pub async fn read_db(&self) -> &PgPool {
        let start = self.cursor.load(Ordering::Relaxed);
        let (choice, next) = select_read(&self.replicas, start, probe).await;
        self.cursor.store(next, Ordering::Relaxed);
        match choice {
            Some(pool) => pool,
            None => {
                if !self.replicas.is_empty() {
                    counter!("db_read_fallback_total", 1u64);
                    warn!("db: no replica passed the probe, reading from primary");
                }
                &self.primary
            }
        }
    }
}

async fn probe(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await.is_ok()
}
