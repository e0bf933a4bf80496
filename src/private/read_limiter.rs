// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The arena-wide traversal budget.
//!
//! Every pointer dereference during a read charges the limiter with the number
//! of words it makes reachable, landing pads included. An attacker can make a
//! small message appear enormous by aiming many pointers at the same bytes;
//! the limiter bounds the total work regardless. Exhaustion is not an error:
//! accessors degrade to their default value.

#[cfg(feature = "sync_reader")]
pub use sync::ReadLimiter;

#[cfg(feature = "sync_reader")]
mod sync {
    use core::sync::atomic::{AtomicUsize, Ordering};

    pub struct ReadLimiter {
        limit: AtomicUsize,
    }

    impl ReadLimiter {
        pub fn new(limit: Option<usize>) -> Self {
            Self {
                limit: AtomicUsize::new(limit.unwrap_or(usize::MAX)),
            }
        }

        /// Consumes `amount` words of budget, reporting whether the budget
        /// covered the request. Saturates at zero.
        #[inline]
        pub fn can_read(&self, amount: usize) -> bool {
            let prev = self.limit.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(amount))
            });
            match prev {
                Ok(current) => current >= amount,
                Err(_) => false,
            }
        }
    }
}

#[cfg(not(feature = "sync_reader"))]
pub use unsync::ReadLimiter;

#[cfg(not(feature = "sync_reader"))]
mod unsync {
    use core::cell::Cell;

    pub struct ReadLimiter {
        limit: Cell<usize>,
    }

    impl ReadLimiter {
        pub fn new(limit: Option<usize>) -> Self {
            Self {
                limit: Cell::new(limit.unwrap_or(usize::MAX)),
            }
        }

        /// Consumes `amount` words of budget, reporting whether the budget
        /// covered the request. Saturates at zero.
        #[inline]
        pub fn can_read(&self, amount: usize) -> bool {
            let current = self.limit.get();
            self.limit.set(current.saturating_sub(amount));
            current >= amount
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReadLimiter;

    #[test]
    fn budget_is_consumed() {
        let limiter = ReadLimiter::new(Some(10));
        assert!(limiter.can_read(4));
        assert!(limiter.can_read(6));
        assert!(!limiter.can_read(1));
    }

    #[test]
    fn overshoot_saturates() {
        let limiter = ReadLimiter::new(Some(3));
        assert!(!limiter.can_read(4));
        assert!(!limiter.can_read(1));
    }

    #[test]
    fn unlimited() {
        let limiter = ReadLimiter::new(None);
        assert!(limiter.can_read(usize::MAX / 2));
        assert!(limiter.can_read(usize::MAX / 2));
    }
}
