use std::sync::Arc;
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, warn};

use crate::{
    CanonicalName, EntityResults, IndexError, IndexHit, MetadataFilter, RetrievalError,
    VectorIndex, run_with_deadline,
};

const MAX_FANOUT: usize = 8;

/// Per-member similarity search over the message index.
///
/// A retriever built without an index stays disabled for its whole lifetime:
/// every call returns [`RetrievalError::Uninitialized`]. With a timeout set,
/// an index call that outlives it returns [`RetrievalError::Timeout`].
#[derive(Clone)]
pub struct FilteredRetriever {
    index: Option<Arc<dyn VectorIndex>>,
    timeout: Option<Duration>,
}

impl FilteredRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            index: Some(index),
            timeout: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            index: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds from an index open attempt, logging and disabling on failure.
    pub fn from_open<I>(opened: Result<I, IndexError>) -> Self
    where
        I: VectorIndex + 'static,
    {
        match opened {
            Ok(index) => Self::new(Arc::new(index)),
            Err(err) => {
                warn!(error = %err, "message index unavailable; retriever disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.index.is_some()
    }

    fn index(&self) -> Result<&Arc<dyn VectorIndex>, RetrievalError> {
        self.index.as_ref().ok_or(RetrievalError::Uninitialized)
    }

    /// Runs one index call, abandoning it once the timeout elapses.
    fn call<T, F>(&self, work: F) -> Result<T, RetrievalError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VectorIndex) -> Result<T, IndexError> + Send + 'static,
    {
        let index = Arc::clone(self.index()?);
        match self.timeout {
            None => Ok(work(index.as_ref())?),
            Some(timeout) => run_with_deadline(timeout, move || work(index.as_ref()))
                .ok_or(RetrievalError::Timeout(timeout.as_millis() as u64))?
                .map_err(RetrievalError::from),
        }
    }

    /// Top-`k` documents for `query`, restricted to records of `name`.
    /// An unknown name yields an empty list.
    pub fn search(
        &self,
        name: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, RetrievalError> {
        let hits = self.search_hits(Some(name), query, k)?;
        Ok(hits.into_iter().map(|hit| hit.text).collect())
    }

    /// Like [`search`](Self::search) but returns full hits; `None` searches every member.
    pub fn search_hits(
        &self,
        name: Option<&str>,
        query: &str,
        k: usize,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let filter = name.map(MetadataFilter::user);
        let query = query.to_string();
        let hits = self.call(move |index| index.query(&query, k, filter.as_ref()))?;
        debug!(entity = name.unwrap_or("*"), hits = hits.len(), "retrieved");
        Ok(hits)
    }

    /// Searches every name in parallel and returns results in the order of `names`.
    pub fn search_all(
        &self,
        names: &[CanonicalName],
        query: &str,
        k: usize,
    ) -> Result<EntityResults, RetrievalError> {
        self.index()?;
        if names.is_empty() {
            return Ok(EntityResults::new());
        }

        let run = |name: &CanonicalName| (name.clone(), self.search(name, query, k));
        let outcomes: Vec<(CanonicalName, Result<Vec<String>, RetrievalError>)> =
            ThreadPoolBuilder::new()
                .num_threads(names.len().min(MAX_FANOUT))
                .build()
                .map(|pool| pool.install(|| names.par_iter().map(run).collect()))
                .unwrap_or_else(|_| names.iter().map(run).collect());

        let mut results = EntityResults::new();
        for (name, outcome) in outcomes {
            results.push(name, outcome?);
        }
        Ok(results)
    }

    pub fn count(&self) -> Result<usize, RetrievalError> {
        self.call(|index| index.count())
    }

    pub fn distinct_user_names(&self) -> Result<Vec<String>, RetrievalError> {
        self.call(|index| index.distinct_user_names())
    }
}
