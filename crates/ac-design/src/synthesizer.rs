//! Counterbalanced trial sequence synthesis.
//!
//! The sequence is a concatenation of complete crossings, each in a searched
//! order: no cell repeats back-to-back and no factor level runs longer than
//! the configured limit. Every aligned window of `cells` trials is therefore
//! balanced, which keeps blocks balanced when the block size is a multiple of
//! the cell count. The finished order is re-verified before it is returned.

use ac_types::{Design, SynthesisError, Trial};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use tracing::debug;

use crate::crossing::{cross, realize, Cell};

/// Summary of one synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisReport {
    pub cells: usize,
    pub repetitions: usize,
    pub backtracks: usize,
}

/// Seeded constraint-satisfying trial sequence generator.
#[derive(Debug, Clone)]
pub struct SequenceSynthesizer {
    rng: ChaCha8Rng,
    max_level_run: Option<usize>,
    max_backtracks: usize,
}

impl SequenceSynthesizer {
    pub const DEFAULT_MAX_LEVEL_RUN: usize = 4;
    pub const DEFAULT_MAX_BACKTRACKS: usize = 100_000;

    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_level_run: Some(Self::DEFAULT_MAX_LEVEL_RUN),
            max_backtracks: Self::DEFAULT_MAX_BACKTRACKS,
        }
    }

    /// Longest allowed run of one factor level; `None` disables the check.
    pub fn with_max_level_run(mut self, limit: Option<usize>) -> Self {
        self.max_level_run = limit;
        self
    }

    pub fn with_max_backtracks(mut self, n: usize) -> Self {
        self.max_backtracks = n;
        self
    }

    pub fn synthesize(
        &mut self,
        design: &Design,
        total_trials: usize,
        min_trials_per_cell: usize,
    ) -> Result<Vec<Trial>, SynthesisError> {
        self.synthesize_with_report(design, total_trials, min_trials_per_cell)
            .map(|(trials, _)| trials)
    }

    pub fn synthesize_with_report(
        &mut self,
        design: &Design,
        total_trials: usize,
        min_trials_per_cell: usize,
    ) -> Result<(Vec<Trial>, SynthesisReport), SynthesisError> {
        design
            .validate()
            .map_err(|e| invalid(format!("bad design: {e}")))?;
        if let Some(0) = self.max_level_run {
            return Err(invalid("max level run must be positive".into()));
        }
        if total_trials == 0 {
            return Err(invalid("total trials must be positive".into()));
        }
        if min_trials_per_cell == 0 {
            return Err(invalid("minimum trials per cell must be positive".into()));
        }

        let cells = cross(design);
        let n = cells.len();
        let required = n.saturating_mul(min_trials_per_cell);
        if total_trials < required {
            return Err(unsatisfiable(format!(
                "{total_trials} trials cannot give {n} cells at least {min_trials_per_cell} each (need {required})"
            )));
        }
        if total_trials % n != 0 {
            return Err(invalid(format!(
                "total trials {total_trials} is not a multiple of the {n} design cells"
            )));
        }

        let repetitions = total_trials / n;
        let level_counts = design.level_counts();
        let (order, backtracks) = self.search_order(&cells, &level_counts, repetitions)?;
        verify(
            &cells,
            &level_counts,
            &order,
            min_trials_per_cell,
            self.max_level_run,
        )?;

        let report = SynthesisReport {
            cells: n,
            repetitions,
            backtracks,
        };
        debug!(?report, total_trials, "synthesized trial sequence");

        let trials = order.iter().map(|&c| realize(design, &cells[c])).collect();
        Ok((trials, report))
    }

    /// Depth-first search over orderings with a bounded backtrack budget.
    fn search_order(
        &mut self,
        cells: &[Cell],
        level_counts: &[usize],
        repetitions: usize,
    ) -> Result<(Vec<usize>, usize), SynthesisError> {
        let total = cells.len() * repetitions;
        let mut seq: Vec<usize> = Vec::with_capacity(total);
        let mut stack = vec![Frame::new(self.candidates(&seq, cells, level_counts))];
        let mut backtracks = 0usize;

        while seq.len() < total {
            let Some(frame) = stack.last_mut() else {
                return Err(unsatisfiable("no ordering satisfies the sequence constraints".into()));
            };
            match frame.next_candidate() {
                Some(cell) => {
                    seq.push(cell);
                    if seq.len() < total {
                        let candidates = self.candidates(&seq, cells, level_counts);
                        stack.push(Frame::new(candidates));
                    }
                }
                None => {
                    stack.pop();
                    if stack.is_empty() {
                        return Err(unsatisfiable(
                            "no ordering satisfies the sequence constraints".into(),
                        ));
                    }
                    seq.pop();
                    backtracks += 1;
                    if backtracks > self.max_backtracks {
                        return Err(unsatisfiable(format!(
                            "ordering search gave up after {backtracks} backtracks"
                        )));
                    }
                }
            }
        }

        Ok((seq, backtracks))
    }

    /// Cells that may legally follow `seq`, in random order.
    fn candidates(&mut self, seq: &[usize], cells: &[Cell], level_counts: &[usize]) -> Vec<usize> {
        let n = cells.len();
        let window_start = seq.len() - seq.len() % n;
        let mut used = vec![false; n];
        for &c in &seq[window_start..] {
            used[c] = true;
        }
        let prev = seq.last().copied();
        let limit = self.max_level_run;

        let mut out: Vec<usize> = (0..n)
            .filter(|&c| !used[c])
            .filter(|&c| n == 1 || prev != Some(c))
            .filter(|&c| run_allowed(seq, cells, level_counts, limit, c))
            .collect();
        out.shuffle(&mut self.rng);
        out
    }
}

struct Frame {
    candidates: Vec<usize>,
    next: usize,
}

impl Frame {
    fn new(candidates: Vec<usize>) -> Self {
        Self {
            candidates,
            next: 0,
        }
    }

    fn next_candidate(&mut self) -> Option<usize> {
        let c = self.candidates.get(self.next).copied();
        self.next += 1;
        c
    }
}

/// Whether appending `cell` keeps every multi-level factor within the run limit.
fn run_allowed(
    seq: &[usize],
    cells: &[Cell],
    level_counts: &[usize],
    limit: Option<usize>,
    cell: usize,
) -> bool {
    let Some(limit) = limit else {
        return true;
    };
    level_counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 1)
        .all(|(f, _)| {
            let level = cells[cell][f];
            let run = seq
                .iter()
                .rev()
                .take_while(|&&s| cells[s][f] == level)
                .count();
            run < limit
        })
}

/// Check the counterbalancing invariants on a finished order.
pub(crate) fn verify(
    cells: &[Cell],
    level_counts: &[usize],
    order: &[usize],
    min_trials_per_cell: usize,
    max_level_run: Option<usize>,
) -> Result<(), SynthesisError> {
    let n = cells.len();
    let total = order.len();
    if n == 0 || total % n != 0 {
        return Err(unsatisfiable(format!(
            "sequence of {total} trials does not tile {n} cells"
        )));
    }
    let expected = total / n;

    let mut per_cell = vec![0usize; n];
    for &c in order {
        per_cell[c] += 1;
    }
    if let Some((cell, &count)) = per_cell
        .iter()
        .enumerate()
        .find(|(_, &count)| count != expected || count < min_trials_per_cell)
    {
        return Err(unsatisfiable(format!(
            "cell {:?} appears {count} times, expected {expected} (minimum {min_trials_per_cell})",
            cells[cell]
        )));
    }

    for (f, &levels) in level_counts.iter().enumerate() {
        let mut counts = vec![0usize; levels];
        for &c in order {
            counts[cells[c][f]] += 1;
        }
        if counts.iter().any(|&k| k * levels != total) {
            return Err(unsatisfiable(format!(
                "factor {f} levels are unbalanced: {counts:?}"
            )));
        }
    }

    for f in 0..level_counts.len() {
        for g in (f + 1)..level_counts.len() {
            let mut joint: HashMap<(usize, usize), usize> = HashMap::new();
            for &c in order {
                *joint.entry((cells[c][f], cells[c][g])).or_default() += 1;
            }
            let pairs = level_counts[f] * level_counts[g];
            let uniform = joint.len() == pairs && joint.values().all(|&k| k * pairs == total);
            if !uniform {
                return Err(unsatisfiable(format!(
                    "joint distribution of factors {f} and {g} is not uniform"
                )));
            }
        }
    }

    for window in order.chunks(n) {
        let mut seen = vec![false; n];
        for &c in window {
            if std::mem::replace(&mut seen[c], true) {
                return Err(unsatisfiable(format!(
                    "cell {:?} repeats inside one crossing",
                    cells[c]
                )));
            }
        }
    }

    if n > 1 {
        if let Some(i) = order.windows(2).position(|w| w[0] == w[1]) {
            return Err(unsatisfiable(format!(
                "cell {:?} repeats back-to-back at position {i}",
                cells[order[i]]
            )));
        }
    }

    if let Some(limit) = max_level_run {
        for i in 0..order.len() {
            if !run_allowed(&order[..i], cells, level_counts, Some(limit), order[i]) {
                return Err(unsatisfiable(format!(
                    "a factor level runs longer than {limit} at position {i}"
                )));
            }
        }
    }

    Ok(())
}

fn invalid(message: String) -> SynthesisError {
    SynthesisError::InvalidConstraint { message }
}

fn unsatisfiable(message: String) -> SynthesisError {
    SynthesisError::ConstraintUnsatisfiable { message }
}
