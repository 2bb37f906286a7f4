use std::fmt;
use std::sync::Arc;

/// Decides whether an idle, fully persisted entity may be evicted from the cache.
pub trait ExpireEvaluator<E>: Send + Sync {
    fn can_expire(&self, entity: &E) -> bool;
}

impl<E, F> ExpireEvaluator<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn can_expire(&self, entity: &E) -> bool {
        self(entity)
    }
}

/// The expiration policy of an entity type.
pub enum ExpirePolicy<E> {
    /// Entities are never evicted, and no expiration sweep runs for the type.
    Never,
    /// Entities are evicted whenever they are idle and have no unsaved changes.
    Idle,
    /// Like [`Idle`](Self::Idle), but the evaluator has the final say.
    Evaluate(Arc<dyn ExpireEvaluator<E>>),
}

impl<E> ExpirePolicy<E> {
    pub fn evaluate<F>(evaluator: F) -> Self
    where
        F: ExpireEvaluator<E> + 'static,
    {
        Self::Evaluate(Arc::new(evaluator))
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    pub fn can_expire(&self, entity: &E) -> bool {
        match self {
            Self::Never => false,
            Self::Idle => true,
            Self::Evaluate(evaluator) => evaluator.can_expire(entity),
        }
    }
}

impl<E> Default for ExpirePolicy<E> {
    fn default() -> Self {
        Self::Idle
    }
}

impl<E> Clone for ExpirePolicy<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Never => Self::Never,
            Self::Idle => Self::Idle,
            Self::Evaluate(evaluator) => Self::Evaluate(Arc::clone(evaluator)),
        }
    }
}

impl<E> fmt::Debug for ExpirePolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Idle => f.write_str("Idle"),
            Self::Evaluate(_) => f.write_str("Evaluate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies() {
        let never = ExpirePolicy::<u32>::Never;
        assert!(never.is_never());
        assert!(!never.can_expire(&1));

        assert!(ExpirePolicy::<u32>::default().can_expire(&1));

        let even_only = ExpirePolicy::<u32>::evaluate(|n: &u32| n % 2 == 0);
        assert!(even_only.can_expire(&2));
        assert!(!even_only.can_expire(&3));
        assert!(!even_only.is_never());
    }
}
