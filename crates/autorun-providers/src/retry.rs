//! Finite retry policy shared by every LLM call site that re-prompts.

use serde::{Deserialize, Serialize};
use std::future::Future;

/// Parameters for one attempt. Later attempts lower the temperature and can
/// switch to a stricter instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    /// Zero-based attempt index.
    pub index: usize,
    pub temperature: Option<f32>,
    pub strict: bool,
}

impl Attempt {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Temperature per attempt; the last entry repeats.
    #[serde(default)]
    pub temperatures: Vec<f32>,
    /// Attempts at or after this index are strict.
    #[serde(default = "default_strict_from")]
    pub strict_from: usize,
}

fn default_strict_from() -> usize {
    1
}

#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryExhausted<E: std::fmt::Display + std::fmt::Debug> {
    pub attempts: usize,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            temperatures: Vec::new(),
            strict_from: default_strict_from(),
        }
    }

    /// One retry at temperature zero with a strict instruction.
    pub fn strict_once() -> Self {
        Self::new(2).with_temperatures(vec![0.2, 0.0])
    }

    pub fn with_temperatures(mut self, temperatures: Vec<f32>) -> Self {
        self.temperatures = temperatures;
        self
    }

    pub fn with_strict_from(mut self, index: usize) -> Self {
        self.strict_from = index;
        self
    }

    pub fn attempt(&self, index: usize) -> Attempt {
        let temperature = self
            .temperatures
            .get(index)
            .or_else(|| self.temperatures.last())
            .copied();
        Attempt {
            index,
            temperature,
            strict: index >= self.strict_from,
        }
    }

    /// Runs `op` until it succeeds or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_while(op, |_| true).await
    }

    /// Like [`run`](Self::run), but stops early on errors `retryable` rejects.
    pub async fn run_while<T, E, F, Fut, R>(
        &self,
        mut op: F,
        retryable: R,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut index = 0;
        loop {
            match op(self.attempt(index)).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let attempts = index + 1;
                    if attempts >= self.max_attempts || !retryable(&err) {
                        return Err(RetryExhausted { attempts, last: err });
                    }
                    tracing::debug!(attempt = attempts, error = %err, "retrying");
                }
            }
            index += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3).with_temperatures(vec![0.2, 0.1, 0.0])
    }
}
