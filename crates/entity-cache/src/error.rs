use std::time::Duration;

use thiserror::Error;

/// An error reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store did not answer in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The store could not be reached, or failed for a transient reason.
    ///
    /// The attached string contains the store's response.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the operation, for example because of a malformed document.
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

/// Errors of the entity cache.
///
/// Only the load and create related variants are returned from the request path. Persisting
/// and deleting happen in the background and are only ever logged.
#[derive(Debug, Error)]
pub enum EntityCacheError {
    /// The entity does not exist.
    #[error("{entity}({id}) not found")]
    NotFound { entity: &'static str, id: String },
    /// A different instance was created concurrently for the same id.
    #[error("{entity}({id}) already exists")]
    AlreadyExists { entity: &'static str, id: String },
    /// Loading the entity did not finish within the configured load timeout.
    #[error("loading {entity}({id}) timed out after {timeout:?}")]
    LoadTimeout {
        entity: &'static str,
        id: String,
        timeout: Duration,
    },
    /// The loader reported an error.
    #[error("loading {entity}({id}) failed")]
    LoadFailure {
        entity: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },
    /// Loading a set of entities at once failed.
    #[error("bulk loading {entity} failed")]
    BulkLoadFailure {
        entity: &'static str,
        #[source]
        source: StoreError,
    },
    /// Upserting entities failed.
    #[error("persisting {count} {entity} entities failed")]
    PersistFailure {
        entity: &'static str,
        count: usize,
        #[source]
        source: StoreError,
    },
    /// Deleting the entity from the store failed.
    #[error("deleting {entity}({id}) failed")]
    DeleteFailure {
        entity: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },
    /// The cached entities could not be serialized.
    #[error("failed to dump cache")]
    Dump(#[from] serde_json::Error),
}

impl EntityCacheError {
    pub(crate) fn not_found(entity: &'static str, id: &impl std::fmt::Debug) -> Self {
        Self::NotFound {
            entity,
            id: format!("{id:?}"),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, id: &impl std::fmt::Debug) -> Self {
        Self::AlreadyExists {
            entity,
            id: format!("{id:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EntityCacheError::not_found("Player", &42);
        assert_eq!(err.to_string(), "Player(42) not found");

        let err = EntityCacheError::already_exists("Guild", &"red");
        assert_eq!(err.to_string(), "Guild(\"red\") already exists");

        let err = EntityCacheError::LoadTimeout {
            entity: "Player",
            id: "7".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "loading Player(7) timed out after 5s");
    }

    #[test]
    fn test_source_chain() {
        let err = EntityCacheError::DeleteFailure {
            entity: "Player",
            id: "7".into(),
            source: StoreError::Unavailable("connection reset".into()),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "store unavailable: connection reset");
    }
}
