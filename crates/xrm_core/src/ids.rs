/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Monotonic id minting shared by client ids, allocation service ids, and
//! reserve-pool ids: all three skip zero (which is reserved to mean "none")
//! and wrap at `u64::MAX` back to `1`.

use serde::{Deserialize, Serialize};

/// A counter that mints ids in `1..=u64::MAX`, wrapping past zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdMinter {
    last: u64,
}

impl IdMinter {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Resume minting after `last`, e.g. when restoring from a snapshot.
    pub fn resuming_from(last: u64) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> u64 {
        self.last = if self.last == u64::MAX { 1 } else { self.last + 1 };
        self.last
    }

    pub fn current(&self) -> u64 {
        self.last
    }
}

impl Default for IdMinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_one() {
        let mut m = IdMinter::new();
        assert_eq!(m.next(), 1);
        assert_eq!(m.next(), 2);
    }

    #[test]
    fn wraps_past_zero() {
        let mut m = IdMinter::resuming_from(u64::MAX);
        assert_eq!(m.next(), 1);
    }
}
