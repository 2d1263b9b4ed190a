use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::time::Instant;

/// A physical connection plus the bookkeeping the pool needs to recycle it.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    created_at: Instant,
    idle_since: Instant,
    inner: C,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(id: u64, inner: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            idle_since: now,
            inner,
        }
    }

    /// Pool-unique identity, assigned at creation.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// How long the connection has been sitting in the idle set.
    #[inline]
    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    #[inline]
    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Idle longer than `timeout`; a zero timeout disables reclamation.
    #[inline]
    pub(crate) fn is_expired(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(t) if !t.is_zero() => self.idle_for() > t,
            _ => false,
        }
    }

    #[inline]
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
