//! Bounded binary-search delta-debugging driver.
//!
//! Consumes a candidate list sorted by registration order (earlier points
//! tend to be prerequisites of later ones) and an oracle over closures of
//! kept indices. Each round binary-searches the minimal prefix of the
//! remaining space that, together with the confirmed progressions, still
//! satisfies the oracle; the boundary element is confirmed and everything
//! after it discarded.

use std::collections::BTreeSet;

use anyhow::Result;

/// External validity predicate over a candidate closure of kept indices.
pub(crate) trait Oracle {
    fn probe(&mut self, closure: &BTreeSet<usize>) -> Result<bool>;
}

impl<F> Oracle for F
where
    F: FnMut(&BTreeSet<usize>) -> Result<bool>,
{
    fn probe(&mut self, closure: &BTreeSet<usize>) -> Result<bool> {
        self(closure)
    }
}

/// One minimization run; owns its search state for the whole lifetime.
#[derive(Debug)]
pub(crate) struct DeltaDebugSearch {
    space: Vec<usize>,
    progressions: BTreeSet<usize>,
    last_valid: Option<BTreeSet<usize>>,
    retries: usize,
    probes: usize,
    /// Retry budget; exhaustion is reported, not fatal.
    pub(crate) retry_budget: usize,
    /// Rounds before the window-absorption escape hatch may fire.
    pub(crate) absorb_after: usize,
    /// Denominator of the window fraction that triggers absorption. The
    /// heuristic trades exactness for probe count and may keep a few
    /// unnecessary elements; that is documented, tunable behavior.
    pub(crate) absorb_fraction: usize,
}

impl DeltaDebugSearch {
    pub(crate) fn new(space: Vec<usize>) -> Self {
        Self {
            space,
            progressions: BTreeSet::new(),
            last_valid: None,
            retries: 0,
            probes: 0,
            retry_budget: 500,
            absorb_after: 25,
            absorb_fraction: 100,
        }
    }

    pub(crate) fn progressions(&self) -> &BTreeSet<usize> {
        &self.progressions
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes
    }

    pub(crate) fn retries(&self) -> usize {
        self.retries
    }

    pub(crate) fn budget_exhausted(&self) -> bool {
        !self.space.is_empty() && self.retries >= self.retry_budget
    }

    /// Runs rounds until the remaining space is empty or the budget is hit.
    pub(crate) fn run(&mut self, oracle: &mut dyn Oracle) -> Result<()> {
        while !self.space.is_empty() && self.retries < self.retry_budget {
            match self.run_round(oracle)? {
                Some(boundary) => {
                    self.progressions.insert(self.space[boundary]);
                    self.space.truncate(boundary);
                }
                None => self.space.clear(),
            }
            self.retries += 1;
        }
        Ok(())
    }

    /// One round: `None` when the progressions alone satisfy the oracle
    /// (every remaining candidate proven unnecessary), otherwise the index
    /// into the remaining space of the next necessary element.
    fn run_round(&mut self, oracle: &mut dyn Oracle) -> Result<Option<usize>> {
        let bare = self.progressions.clone();
        if self.run_probe(oracle, bare)? {
            return Ok(None);
        }

        let mut lo = 0usize;
        let mut hi = self.space.len();
        while hi > lo {
            let mid = lo + (hi - lo) / 2;
            let mut closure = self.progressions.clone();
            closure.extend(self.space[..=mid].iter().copied());
            if self.run_probe(oracle, closure)? {
                hi = mid;
            } else {
                lo = mid + 1;
            }

            // Escape hatch for pathologically large, mostly necessary tails:
            // once the window is anchored at the right edge and has shrunk
            // below the configured fraction, absorb it wholesale instead of
            // continuing to bisect.
            if self.retries >= self.absorb_after
                && hi == self.space.len()
                && hi - lo < self.space.len() / self.absorb_fraction
            {
                self.progressions.extend(self.space[lo..hi].iter().copied());
                break;
            }
        }

        Ok(Some(if hi == self.space.len() { hi - 1 } else { hi }))
    }

    fn run_probe(&mut self, oracle: &mut dyn Oracle, closure: BTreeSet<usize>) -> Result<bool> {
        self.probes += 1;
        if oracle.probe(&closure)? {
            self.last_valid = Some(closure);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-probes the final progressions. Materialization order can matter
    /// for some oracles; on failure fall back to the last closure that
    /// passed a probe.
    pub(crate) fn run_final(&mut self, oracle: &mut dyn Oracle) -> Result<bool> {
        self.probes += 1;
        if oracle.probe(&self.progressions.clone())? {
            return Ok(true);
        }
        match &self.last_valid {
            Some(closure) => {
                self.progressions = closure.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
