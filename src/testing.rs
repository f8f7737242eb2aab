//! Test doubles shared by unit tests across modules.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::{
    Completion, CompletionRequest, CompletionService, IndexError, IndexHit, LlmError,
    MetadataFilter, VectorIndex,
};

/// Replays queued completions in order and records every request.
pub struct ScriptedCompletion {
    queue: Mutex<VecDeque<Completion>>,
    repeat: Option<Completion>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<Completion>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Returns `response` for every call.
    pub fn repeating(response: Completion) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            repeat: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl CompletionService for ScriptedCompletion {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return Ok(next);
        }
        self.repeat
            .clone()
            .ok_or_else(|| LlmError::Malformed("script exhausted".to_string()))
    }
}

pub struct FailingCompletion;

impl CompletionService for FailingCompletion {
    fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
        Err(LlmError::Status {
            status: 500,
            body: "upstream exploded".to_string(),
        })
    }
}

pub struct SlowCompletion {
    delay: Duration,
}

impl SlowCompletion {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl CompletionService for SlowCompletion {
    fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
        thread::sleep(self.delay);
        Ok(Completion::text("too late"))
    }
}

/// In-memory index: exact user filter, insertion order, capped at `k`.
pub struct StaticIndex {
    rows: Vec<IndexHit>,
    broken: bool,
}

impl StaticIndex {
    pub fn from_rows(rows: &[(&str, &str)]) -> Self {
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, (user, text))| IndexHit {
                id: i.to_string(),
                text: text.to_string(),
                user_name: user.to_string(),
                timestamp: format!("2024-01-{:02}T00:00:00", i + 1),
                score: 1.0,
            })
            .collect();
        Self {
            rows,
            broken: false,
        }
    }

    /// Every call fails with an index error.
    pub fn broken() -> Self {
        Self {
            rows: Vec::new(),
            broken: true,
        }
    }

    fn check(&self) -> Result<(), IndexError> {
        if self.broken {
            return Err(IndexError::NotFound("static index offline".to_string()));
        }
        Ok(())
    }
}

impl VectorIndex for StaticIndex {
    fn query(
        &self,
        _text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        self.check()?;
        Ok(self
            .rows
            .iter()
            .filter(|hit| filter.is_none_or(|f| f.user_name == hit.user_name))
            .take(k)
            .cloned()
            .collect())
    }

    fn count(&self) -> Result<usize, IndexError> {
        self.check()?;
        Ok(self.rows.len())
    }

    fn distinct_user_names(&self) -> Result<Vec<String>, IndexError> {
        self.check()?;
        Ok(crate::dedup_keep_order(
            self.rows.iter().map(|hit| hit.user_name.clone()).collect(),
        ))
    }
}

/// Index that sleeps before answering every call.
pub struct SlowIndex {
    delay: Duration,
    inner: StaticIndex,
}

impl SlowIndex {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: StaticIndex::from_rows(&[("Thiago Monteiro", "Thiago moved to Porto")]),
        }
    }
}

impl VectorIndex for SlowIndex {
    fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        thread::sleep(self.delay);
        self.inner.query(text, k, filter)
    }

    fn count(&self) -> Result<usize, IndexError> {
        thread::sleep(self.delay);
        self.inner.count()
    }

    fn distinct_user_names(&self) -> Result<Vec<String>, IndexError> {
        self.inner.distinct_user_names()
    }
}
