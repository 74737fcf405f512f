//! Optional connection pooling
//!
//! Idle connections are kept per [`ConnectionSpec`], so reuse never crosses
//! distinct URIs. A semaphore per spec bounds how many connections are
//! checked out at once; the permit travels with the connection and is
//! released on checkin or when the connection is dropped. A spec's slot is
//! removed once it holds no idle connections and no permit is out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rela_core::{ConnectionSpec, EngineError, EngineResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::engine::connection::Connection;

/// How long a checkout may wait for a free slot
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Forever,
    Until(Duration),
    Never,
}

struct PoolSlot {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
}

pub(crate) struct Pool {
    config: PoolConfig,
    slots: Mutex<HashMap<ConnectionSpec, Arc<PoolSlot>>>,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn default_wait(&self) -> Wait {
        match self.config.checkout_timeout() {
            Some(d) => Wait::Until(d),
            None => Wait::Forever,
        }
    }

    fn slot(&self, spec: &ConnectionSpec) -> Arc<PoolSlot> {
        let mut slots = self.slots.lock();
        self.slot_in(&mut slots, spec).clone()
    }

    fn slot_in<'a>(
        &self,
        slots: &'a mut HashMap<ConnectionSpec, Arc<PoolSlot>>,
        spec: &ConnectionSpec,
    ) -> &'a Arc<PoolSlot> {
        slots.entry(spec.clone()).or_insert_with(|| {
            Arc::new(PoolSlot {
                permits: Arc::new(Semaphore::new(self.config.max_open)),
                idle: Mutex::new(VecDeque::new()),
            })
        })
    }

    /// Drops the slot for `spec` when nothing references it: no idle
    /// connection, no permit checked out and nobody waiting for one.
    pub(crate) fn evict_unused(&self, spec: &ConnectionSpec) {
        let mut slots = self.slots.lock();
        let unused = slots.get(spec).is_some_and(|slot| {
            // every permit and every pending acquire holds a clone
            Arc::strong_count(&slot.permits) == 1 && slot.idle.lock().is_empty()
        });
        if unused {
            slots.remove(spec);
        }
    }

    /// Number of specs the pool currently tracks.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) async fn acquire(
        &self,
        spec: &ConnectionSpec,
        wait: Wait,
    ) -> EngineResult<OwnedSemaphorePermit> {
        // Cloned under the map lock so eviction sees this waiter
        let permits = {
            let mut slots = self.slots.lock();
            self.slot_in(&mut slots, spec).permits.clone()
        };
        let exhausted = || {
            EngineError::pool_exhausted(format!(
                "all {} connections to {} are checked out",
                self.config.max_open, spec
            ))
        };

        match wait {
            Wait::Never => permits.try_acquire_owned().map_err(|_| exhausted()),
            Wait::Forever => permits.acquire_owned().await.map_err(|_| exhausted()),
            Wait::Until(limit) => match tokio::time::timeout(limit, permits.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                _ => Err(exhausted()),
            },
        }
    }

    /// Most recently returned idle connection for `spec`, if any.
    pub(crate) fn take_idle(&self, spec: &ConnectionSpec) -> Option<Connection> {
        let slot = self.slots.lock().get(spec).cloned()?;
        let conn = slot.idle.lock().pop_back();
        conn
    }

    /// Returns a connection. Kept only if still open and the idle list has
    /// room; otherwise closed.
    pub(crate) async fn release(&self, mut conn: Connection) {
        let permit = conn.take_permit();
        let spec = conn.spec().clone();
        let rejected = if conn.is_open() {
            let slot = self.slot(conn.spec());
            let mut idle = slot.idle.lock();
            if idle.len() < self.config.max_idle {
                idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        } else {
            Some(conn)
        };

        if let Some(mut conn) = rejected {
            conn.close().await;
        }
        drop(permit);
        self.evict_unused(&spec);
    }

    /// Number of idle connections held for `spec`.
    pub(crate) fn idle_count(&self, spec: &ConnectionSpec) -> usize {
        self.slots
            .lock()
            .get(spec)
            .map(|slot| slot.idle.lock().len())
            .unwrap_or(0)
    }

    /// Removes every idle connection, and every slot left unused.
    pub(crate) fn drain(&self) -> Vec<Connection> {
        let mut slots = self.slots.lock();
        let idle = slots
            .values()
            .flat_map(|slot| slot.idle.lock().drain(..).collect::<Vec<_>>())
            .collect();
        slots.retain(|_, slot| Arc::strong_count(&slot.permits) > 1);
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::EngineDescriptor;
    use crate::engine::drivers::UnavailableAdapter;
    use rela_core::SessionId;
    use rela_sql::Dialect;

    fn pool(max_open: usize, max_idle: usize) -> Pool {
        Pool::new(PoolConfig {
            max_open,
            max_idle,
            checkout_timeout_ms: Some(50),
        })
    }

    fn connection(spec: &ConnectionSpec) -> Connection {
        Connection::new(
            SessionId::new(),
            Arc::new(EngineDescriptor::new("vertica", "Vertica", Dialect::Vertica)),
            Arc::new(UnavailableAdapter::new("vertica", "Vertica")),
            spec.clone(),
            None,
        )
    }

    fn spec(uri: &str) -> ConnectionSpec {
        rela_sql::parse(uri).unwrap()
    }

    #[tokio::test]
    async fn test_released_spec_is_evicted_when_nothing_is_idle() {
        let pool = pool(2, 0);
        let a = spec("vertica://u@a/db");
        let b = spec("vertica://u@b/db");

        for spec in [&a, &b] {
            let permit = pool.acquire(spec, Wait::Never).await.unwrap();
            let mut conn = connection(spec);
            conn.attach_permit(permit);
            pool.release(conn).await;
        }
        assert_eq!(pool.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_kept_while_idle_or_checked_out() {
        let pool = pool(2, 1);
        let spec = spec("vertica://u@a/db");

        let held = pool.acquire(&spec, Wait::Never).await.unwrap();
        let permit = pool.acquire(&spec, Wait::Never).await.unwrap();
        let mut conn = connection(&spec);
        conn.attach_permit(permit);
        pool.release(conn).await;
        assert_eq!(pool.idle_count(&spec), 1);
        assert_eq!(pool.slot_count(), 1);

        let mut idle = pool.take_idle(&spec).unwrap();
        idle.close().await;
        pool.evict_unused(&spec);
        // `held` is still out
        assert_eq!(pool.slot_count(), 1);

        drop(held);
        pool.evict_unused(&spec);
        assert_eq!(pool.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_survives_eviction() {
        let pool = pool(1, 0);
        let spec = spec("vertica://u@a/db");

        let held = pool.acquire(&spec, Wait::Never).await.unwrap();
        pool.evict_unused(&spec);
        let err = pool.acquire(&spec, Wait::Never).await.unwrap_err();
        assert_eq!(err.kind(), rela_core::ErrorKind::PoolExhausted);

        drop(held);
        assert!(pool.acquire(&spec, Wait::Never).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_clears_unused_slots() {
        let pool = pool(2, 2);
        let spec = spec("vertica://u@a/db");
        let permit = pool.acquire(&spec, Wait::Never).await.unwrap();
        let mut conn = connection(&spec);
        conn.attach_permit(permit);
        pool.release(conn).await;
        assert_eq!(pool.slot_count(), 1);

        let mut idle = pool.drain();
        assert_eq!(idle.len(), 1);
        for conn in idle.iter_mut() {
            conn.close().await;
        }
        assert_eq!(pool.slot_count(), 0);
    }
}
