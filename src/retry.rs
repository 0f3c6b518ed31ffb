//! Bounded retry and polling.

use std::thread;
use std::time::Duration;

/// Result of one attempt inside a [`Budget`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    Ready(T),
    /// Not done yet. `E` becomes the error if the budget runs out here.
    Again(E),
}

/// A fixed number of attempts with a pause between consecutive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub attempts: u32,
    pub interval: Duration,
}

impl Budget {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Back-to-back attempts, no pause.
    pub const fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }

    /// Run `op` until it is ready, fails hard, or the budget is spent.
    ///
    /// `op` receives the zero-based attempt index. It always runs at least once.
    /// An `Err` from `op` aborts immediately without further attempts.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<Attempt<T, E>, E>,
    ) -> Result<T, E> {
        let mut n = 0;
        loop {
            match op(n)? {
                Attempt::Ready(v) => return Ok(v),
                Attempt::Again(e) => {
                    n += 1;
                    if n >= self.attempts {
                        return Err(e);
                    }
                    if !self.interval.is_zero() {
                        thread::sleep(self.interval);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_first_success() {
        let mut calls = 0;
        let got: Result<u32, &str> = Budget::immediate(5).run(|i| {
            calls += 1;
            Ok(if i == 2 { Attempt::Ready(i) } else { Attempt::Again("no") })
        });
        assert_eq!(got, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausts_exactly_the_budget() {
        let mut calls = 0;
        let got: Result<(), String> = Budget::immediate(4).run(|i| {
            calls += 1;
            Ok(Attempt::Again(format!("attempt {i}")))
        });
        assert_eq!(got, Err("attempt 3".to_string()));
        assert_eq!(calls, 4);
    }

    #[test]
    fn hard_error_aborts() {
        let mut calls = 0;
        let got: Result<(), &str> = Budget::immediate(10).run(|_| {
            calls += 1;
            Err("timeout")
        });
        assert_eq!(got, Err("timeout"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_budget_still_runs_once() {
        let got: Result<u8, &str> = Budget::immediate(0).run(|_| Ok(Attempt::Ready(7)));
        assert_eq!(got, Ok(7));
    }
}
