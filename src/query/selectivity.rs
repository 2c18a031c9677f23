//! Statistics-based selectivity of a table's predicates.
//!
//! Equality predicates are matched against the leading key columns of every
//! index with statistics. The index matching the longest contiguous prefix
//! is consumed first and its statistics applied; the remaining predicates
//! are matched again until no statistics apply, and whatever is left falls
//! back to per-predicate heuristics.

use tracing::trace;

use crate::query::metadata::{MetadataProvider, TableDescriptor};
use crate::query::predicate::Predicate;
use crate::query::predicate_list::PredicateList;
use crate::types::TableNumber;

#[derive(Clone, Copy, Debug)]
struct Wrapper {
    position: usize,
    id: usize,
}

/// Equality predicates matching one index, sorted by key position.
#[derive(Debug)]
struct WrapperList {
    conglomerate: usize,
    wrappers: Vec<Wrapper>,
    weight: usize,
}

impl WrapperList {
    fn new(conglomerate: usize) -> Self {
        Self {
            conglomerate,
            wrappers: Vec::new(),
            weight: 0,
        }
    }

    fn insert(&mut self, wrapper: Wrapper) {
        let at = self
            .wrappers
            .iter()
            .position(|w| wrapper.position < w.position)
            .unwrap_or(self.wrappers.len());
        self.wrappers.insert(at, wrapper);
    }

    /// Keeps the prefix starting at key position 0 without skipped positions.
    fn retain_leading_contiguous(&mut self) {
        match self.wrappers.first() {
            None => return,
            Some(first) if first.position != 0 => {
                self.wrappers.clear();
                return;
            }
            Some(_) => {}
        }
        let mut last = 0;
        let mut keep = self.wrappers.len();
        for (idx, wrapper) in self.wrappers.iter().enumerate() {
            if wrapper.position - last > 1 {
                keep = idx;
                break;
            }
            last = wrapper.position;
        }
        self.wrappers.truncate(keep);
    }

    fn unique_size(&self) -> usize {
        self.leading_unique().count()
    }

    /// First wrapper at each distinct key position.
    fn leading_unique(&self) -> impl Iterator<Item = Wrapper> + '_ {
        self.wrappers
            .iter()
            .enumerate()
            .filter(|(idx, w)| *idx == 0 || self.wrappers[idx - 1].position != w.position)
            .map(|(_, w)| *w)
    }

    fn remove_id(&mut self, id: usize) {
        self.wrappers.retain(|w| w.id != id);
    }
}

/// Weights each list by how often its predicates appear early in other
/// lists; a lighter list claims predicates the others need less.
fn calculate_weights(lists: &mut [WrapperList], num_predicates: usize) {
    let mut shared = vec![0usize; num_predicates];
    for list in lists.iter() {
        for (j, wrapper) in list.wrappers.iter().enumerate() {
            shared[wrapper.id] += num_predicates.saturating_sub(j);
        }
    }
    for list in lists.iter_mut() {
        list.weight = list.wrappers.iter().map(|w| shared[w.id]).sum();
    }
}

/// Picks the list with the most distinct matched positions, preferring the
/// lighter one (and the later one among equals), then claims its leading
/// predicates from every list.
fn choose_longest_match(lists: &mut [WrapperList], num_predicates: usize) -> Option<(usize, Vec<usize>)> {
    let mut chosen: Option<usize> = None;
    let mut max_size = 0;
    let mut max_weight = 0;
    for (idx, list) in lists.iter().enumerate() {
        let size = list.unique_size();
        if size == 0 {
            continue;
        }
        if size > max_size || (size == max_size && list.weight <= max_weight) {
            chosen = Some(idx);
            max_size = size;
            max_weight = list.weight;
        }
    }
    let chosen = chosen?;
    let claimed: Vec<usize> = lists[chosen].leading_unique().map(|w| w.id).collect();
    for list in lists.iter_mut() {
        for id in &claimed {
            list.remove_id(*id);
        }
        list.retain_leading_contiguous();
    }
    calculate_weights(lists, num_predicates);
    Some((lists[chosen].conglomerate, claimed))
}

impl PredicateList {
    /// Combined selectivity of the predicates on `table` using index
    /// statistics, or −1 when no statistics can be applied.
    pub fn selectivity(
        &self,
        table: TableNumber,
        descriptor: &TableDescriptor,
        metadata: &dyn MetadataProvider,
    ) -> f64 {
        let conglomerates = descriptor.conglomerates();
        if conglomerates.len() <= 1 || self.is_empty() {
            return -1.0;
        }
        let working: Vec<&Predicate> = (0..self.len())
            .filter(|idx| !self.is_redundant_predicate(*idx))
            .filter_map(|idx| self.get(idx))
            .collect();

        let mut lists: Vec<WrapperList> = Vec::new();
        for (cidx, cd) in conglomerates.iter().enumerate() {
            let Some(index) = cd.index_descriptor() else {
                continue;
            };
            if !metadata.statistics_exist(descriptor, Some(cd)) {
                continue;
            }
            let mut list = WrapperList::new(cidx);
            for (id, pred) in working.iter().enumerate() {
                if let Some(position) = pred
                    .condition()
                    .equality_position(index.base_column_positions(), table)
                {
                    list.insert(Wrapper { position, id });
                }
            }
            if !list.wrappers.is_empty() {
                lists.push(list);
            }
        }
        if lists.is_empty() {
            return -1.0;
        }

        for list in &mut lists {
            list.retain_leading_contiguous();
        }
        calculate_weights(&mut lists, working.len());

        let mut remaining = vec![true; working.len()];
        let mut selectivity = 1.0;
        while let Some((cidx, claimed)) = choose_longest_match(&mut lists, working.len()) {
            let cd = &conglomerates[cidx];
            let factor = metadata.selectivity_for_conglomerate(descriptor, cd, claimed.len());
            trace!(
                conglomerate = %cd.name(),
                matched = claimed.len(),
                factor,
                "optimizer.selectivity.statistics"
            );
            selectivity *= factor;
            for id in claimed {
                remaining[id] = false;
            }
            if !remaining.iter().any(|r| *r) {
                break;
            }
        }

        let leftover: f64 = working
            .iter()
            .zip(&remaining)
            .filter(|(_, keep)| **keep)
            .map(|(pred, _)| pred.condition().selectivity())
            .product();
        selectivity * leftover
    }
}
