use std::collections::HashSet;
use std::env;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ConfigError;

pub fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env_optional(name) {
        Some(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
            key: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

pub fn env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env_optional(name) {
        Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::Invalid {
            key: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

pub fn env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match env_optional(name) {
        Some(value) => value.trim().parse::<f64>().map_err(|_| ConfigError::Invalid {
            key: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

pub(crate) fn parse_retry_after(resp: &ureq::Response) -> Option<f64> {
    resp.header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Exponential backoff for attempt `attempt`, capped at `max`, with up to 20% jitter.
pub(crate) fn backoff_delay(attempt: usize, base: f64, max: f64, retry_after: Option<f64>) -> Duration {
    let mut delay = (base * 2.0_f64.powi(attempt as i32)).min(max);
    if let Some(retry_after) = retry_after {
        delay = delay.max(retry_after);
    }
    delay *= 1.0 + jitter_ratio() * 0.2;
    Duration::from_secs_f64(delay.max(0.0))
}

/// Runs `work` on a worker thread and waits at most `timeout`.
///
/// Returns `None` when the deadline passes or the worker panics. A timed-out
/// worker is detached; its result is dropped when it eventually finishes.
pub fn run_with_deadline<T, F>(timeout: Duration, work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("aurora-deadline".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        });
    if spawned.is_err() {
        return None;
    }
    rx.recv_timeout(timeout).ok()
}

pub fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "a" | "about"
            | "an"
            | "and"
            | "any"
            | "are"
            | "as"
            | "at"
            | "be"
            | "but"
            | "by"
            | "can"
            | "did"
            | "do"
            | "does"
            | "for"
            | "from"
            | "get"
            | "give"
            | "has"
            | "have"
            | "how"
            | "i"
            | "if"
            | "in"
            | "into"
            | "is"
            | "it"
            | "its"
            | "me"
            | "my"
            | "of"
            | "on"
            | "or"
            | "tell"
            | "that"
            | "the"
            | "their"
            | "there"
            | "these"
            | "they"
            | "this"
            | "to"
            | "was"
            | "were"
            | "what"
            | "when"
            | "where"
            | "which"
            | "who"
            | "why"
            | "with"
            | "you"
            | "your"
    )
}

pub fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn dedup_keep_order(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for v in values {
        if seen.insert(v.clone()) {
            out.push(v);
        }
    }
    out
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_strips_punctuation_and_lowercases() {
        assert_eq!(
            tokenize("What's Vikram's seat-preference?"),
            vec!["what's", "vikram's", "seat", "preference"]
        );
    }

    #[test]
    fn dedup_preserves_first_occurrence() {
        let values = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedup_keep_order(values), vec!["b", "a"]);
    }

    #[test]
    fn deadline_returns_value_in_time() {
        let value = run_with_deadline(Duration::from_secs(2), || 7);
        assert_eq!(value, Some(7));
    }

    #[test]
    fn deadline_expires_for_slow_work() {
        let value = run_with_deadline(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(300));
            1
        });
        assert!(value.is_none());
    }

    #[test]
    fn backoff_is_capped() {
        let delay = backoff_delay(10, 0.5, 4.0, None);
        assert!(delay <= Duration::from_secs_f64(4.0 * 1.2));
        let honored = backoff_delay(0, 0.5, 4.0, Some(3.0));
        assert!(honored >= Duration::from_secs(3));
    }

    #[test]
    fn preview_marks_truncation() {
        assert_eq!(preview("abcdef", 3), "abc…");
        assert_eq!(preview("abc", 3), "abc");
    }
}
