use std::fmt;
use std::time::Duration;

/// The operation failed on its last allowed attempt, or with an error that
/// is not worth retrying.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.error)
    }
}

/// Bounded retry with a fixed delay. The delay function is injected so tests
/// never wait on the wall clock.
pub struct Retry<S> {
    max_attempts: u32,
    delay: Duration,
    sleep: S,
}

impl Retry<fn(Duration)> {
    pub fn blocking(max_attempts: u32, delay: Duration) -> Self {
        Retry::new(max_attempts, delay, std::thread::sleep as fn(Duration))
    }
}

impl<S: FnMut(Duration)> Retry<S> {
    pub fn new(max_attempts: u32, delay: Duration, sleep: S) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            sleep,
        }
    }

    /// Run `op` with attempt numbers starting at 1. Stops at the first
    /// success, at a non-retryable error, or when attempts run out. Returns
    /// the value and the attempt that produced it.
    pub fn run<T, E, F, P>(&mut self, mut op: F, retryable: P) -> Result<(T, u32), RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok((value, attempt)),
                Err(error) => {
                    if !retryable(&error) {
                        log::warn!("Attempt {attempt} failed permanently: {error}");
                        return Err(RetryError {
                            attempts: attempt,
                            error,
                        });
                    }
                    if attempt >= self.max_attempts {
                        log::error!("Attempt {attempt}/{} failed, giving up: {error}", self.max_attempts);
                        return Err(RetryError {
                            attempts: attempt,
                            error,
                        });
                    }
                    log::warn!(
                        "Attempt {attempt}/{} failed, retrying in {:?}: {error}",
                        self.max_attempts,
                        self.delay
                    );
                    (self.sleep)(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}
