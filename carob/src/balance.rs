//! Class balancing by undersampling
//!
//! Every observed subtype class is downsampled without replacement to
//! the smallest class's size, so the supervised evaluation sees a
//! uniform label distribution.

use crate::clinical::CategoricalColumn;
use crate::pipeline_common::*;
use rand::rngs::StdRng;

/// Balanced sample subset over the working sample set
pub struct BalancedSet {
    /// selected sample indices, ascending
    pub indices: Vec<usize>,
    /// samples kept per class
    pub per_class: usize,
    /// class codes observed in the working set, ascending
    pub class_codes: Vec<u32>,
}

///
/// Downsample each observed subtype class to the minimum class size,
/// uniformly at random without replacement.
///
/// Classes from the label vocabulary with no member in the working set
/// are logged and excluded rather than silently renormalized away;
/// samples with a missing subtype label are excluded as well.
///
pub fn balance_classes(
    subtype: &CategoricalColumn,
    rng: &mut StdRng,
) -> anyhow::Result<BalancedSet> {
    let n_levels = subtype.levels.len();

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_levels];
    let mut n_missing = 0_usize;
    for (i, code) in subtype.codes.iter().enumerate() {
        match code {
            Some(c) => members[*c as usize].push(i),
            None => n_missing += 1,
        }
    }

    if n_missing > 0 {
        warn!(
            "{} sample(s) without a subtype label excluded from balancing",
            n_missing
        );
    }

    for (c, group) in members.iter().enumerate() {
        if group.is_empty() {
            warn!(
                "subtype class '{}' has no member in the working sample set",
                subtype.levels[c]
            );
        }
    }

    let observed: Vec<u32> = (0..n_levels as u32)
        .filter(|&c| !members[c as usize].is_empty())
        .collect();

    if observed.len() < 2 {
        anyhow::bail!(
            "class balancing: {} observed subtype class(es); need at least 2",
            observed.len()
        );
    }

    let min_count = observed
        .iter()
        .map(|&c| members[c as usize].len())
        .min()
        .unwrap_or(0);

    let mut indices = Vec::with_capacity(min_count * observed.len());
    for &c in &observed {
        let group = &members[c as usize];
        let picked = rand::seq::index::sample(rng, group.len(), min_count);
        indices.extend(picked.iter().map(|k| group[k]));
        info!(
            "class '{}': {} of {} sample(s) kept",
            subtype.levels[c as usize],
            min_count,
            group.len()
        );
    }
    indices.sort_unstable();

    Ok(BalancedSet {
        indices,
        per_class: min_count,
        class_codes: observed,
    })
}
