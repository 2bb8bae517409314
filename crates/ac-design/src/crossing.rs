//! Full crossing of a design's factors.

use ac_types::{Design, Trial};
use std::collections::BTreeMap;

/// One combination of factor levels, as level indices in factor order.
pub type Cell = Vec<usize>;

/// Cartesian product of all factor levels. The last factor varies fastest.
pub fn cross(design: &Design) -> Vec<Cell> {
    let mut result: Vec<Cell> = vec![Vec::new()];
    for factor in &design.factors {
        let mut next = Vec::with_capacity(result.len() * factor.levels.len());
        for existing in &result {
            for level in 0..factor.levels.len() {
                let mut cell = existing.clone();
                cell.push(level);
                next.push(cell);
            }
        }
        result = next;
    }
    result
}

/// Materialize a cell as a trial carrying the concrete level values.
pub(crate) fn realize(design: &Design, cell: &[usize]) -> Trial {
    let levels: BTreeMap<String, serde_json::Value> = design
        .factors
        .iter()
        .zip(cell)
        .map(|(factor, &level)| (factor.name.clone(), factor.levels[level].clone()))
        .collect();
    Trial::new(levels)
}
