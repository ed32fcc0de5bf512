//! Bounded retry with exponential backoff
//!
//! Each attempt reports `Done`, `Retryable(class, reason)` or `Fatal(reason)`.
//! Every retry class draws on its own budget, so one upstream-tool retry does
//! not consume the transport budget.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Why an attempt may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Timeout, connection reset, stream cut short
    Transport,
    /// Domain tool inside the agent failed
    UpstreamTool,
    /// Result judged incomplete
    Semantic,
}

impl fmt::Display for RetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transport => "transport",
            Self::UpstreamTool => "upstream_tool",
            Self::Semantic => "semantic",
        })
    }
}

/// Retries allowed per class (not counting the first attempt)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Transport retries
    #[serde(default = "default_one")]
    pub transport: u32,
    /// Upstream tool retries
    #[serde(default = "default_one")]
    pub upstream_tool: u32,
    /// Semantic retries
    #[serde(default = "default_one")]
    pub semantic: u32,
}

fn default_one() -> u32 {
    1
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            transport: 1,
            upstream_tool: 1,
            semantic: 1,
        }
    }
}

impl RetryBudget {
    /// No retries at all
    #[must_use]
    pub fn none() -> Self {
        Self {
            transport: 0,
            upstream_tool: 0,
            semantic: 0,
        }
    }

    /// Budget for `class`
    #[must_use]
    pub fn get(&self, class: RetryClass) -> u32 {
        match class {
            RetryClass::Transport => self.transport,
            RetryClass::UpstreamTool => self.upstream_tool,
            RetryClass::Semantic => self.semantic,
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed per class
    pub budget: RetryBudget,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget: RetryBudget::default(),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-class budget
    #[must_use]
    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the budget for one class
    #[must_use]
    pub fn with_retries(mut self, class: RetryClass, retries: u32) -> Self {
        match class {
            RetryClass::Transport => self.budget.transport = retries,
            RetryClass::UpstreamTool => self.budget.upstream_tool = retries,
            RetryClass::Semantic => self.budget.semantic = retries,
        }
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub(crate) fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(retry as i32 - 1);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64) as u64;

        let final_delay = if self.jitter {
            // up to 25%
            delay_ms + rand_jitter(delay_ms / 4)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }
}

fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max)
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Success
    Done(T),
    /// Failure that may go away on retry
    Retryable(RetryClass, E),
    /// Failure that will not
    Fatal(E),
}

/// What an attempt knows about the attempts before it
#[derive(Debug)]
pub struct AttemptInfo<E> {
    /// 1-based attempt number
    pub attempt: u32,
    /// Failure of the previous attempt, if this is a retry
    pub previous: Option<(RetryClass, E)>,
}

impl<E> AttemptInfo<E> {
    /// Whether this attempt is a retry
    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.previous.is_some()
    }
}

/// The combinator gave up
#[derive(Debug)]
pub struct Exhausted<E> {
    /// The last failure
    pub last_error: E,
    /// Total number of attempts made
    pub attempts: u32,
    /// Class whose budget ran out; `None` when the last failure was fatal
    pub class: Option<RetryClass>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Exhausted<E> {}

/// Run `operation` until it succeeds, fails fatally, or a retry class runs
/// out of budget.
///
/// # Example
/// ```ignore
/// let result = retry_bounded(&config, |info| async move {
///     match call(info.previous).await {
///         Ok(v) => Attempt::Done(v),
///         Err(e) if e.is_retryable() => Attempt::Retryable(RetryClass::Transport, e),
///         Err(e) => Attempt::Fatal(e),
///     }
/// })
/// .await;
/// ```
pub async fn retry_bounded<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(AttemptInfo<E>) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: fmt::Debug,
{
    let mut attempt = 1;
    let mut retries = 0;
    let mut used = RetryBudget::none();
    let mut previous = None;

    loop {
        let info = AttemptInfo {
            attempt,
            previous: previous.take(),
        };
        match operation(info).await {
            Attempt::Done(value) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Fatal(e) => {
                debug!(attempt = attempt, error = ?e, "Operation failed fatally");
                return Err(Exhausted {
                    last_error: e,
                    attempts: attempt,
                    class: None,
                });
            }
            Attempt::Retryable(class, e) => {
                let spent = match class {
                    RetryClass::Transport => &mut used.transport,
                    RetryClass::UpstreamTool => &mut used.upstream_tool,
                    RetryClass::Semantic => &mut used.semantic,
                };
                *spent += 1;
                if *spent > config.budget.get(class) {
                    debug!(
                        attempt = attempt,
                        class = %class,
                        error = ?e,
                        "Operation failed, retry budget exhausted"
                    );
                    return Err(Exhausted {
                        last_error: e,
                        attempts: attempt,
                        class: Some(class),
                    });
                }

                retries += 1;
                let delay = config.calculate_delay(retries);
                warn!(
                    attempt = attempt,
                    class = %class,
                    delay_ms = delay.as_millis() as u64,
                    error = ?e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                previous = Some((class, e));
                attempt += 1;
            }
        }
    }
}
