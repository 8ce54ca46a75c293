//! Walker alias sampler
//!
//! Built once in O(n) over a static set of weighted items, then sampled in
//! O(1). Each table entry holds at most two items whose rates add up to the
//! mean rate.

use ecmc_core::{EcmcError, EcmcResult};

use crate::random::{choose_index, uniform, UniformDraw};

/// Item with a non-negative rate.
#[derive(Clone, Debug, PartialEq)]
pub struct WalkerItem<T> {
    pub item: T,
    pub rate: f64,
}

impl<T> WalkerItem<T> {
    pub fn new(item: T, rate: f64) -> Self {
        WalkerItem { item, rate }
    }
}

#[derive(Clone, Debug)]
struct TableEntry<T> {
    first: WalkerItem<T>,
    second: Option<T>,
}

/// Alias table over a fixed set of items.
#[derive(Clone, Debug)]
pub struct Walker<T> {
    table: Vec<TableEntry<T>>,
    total_rate: f64,
    mean_rate: f64,
}

impl<T: Clone> Walker<T> {
    pub fn new(items: Vec<WalkerItem<T>>) -> EcmcResult<Self> {
        if items.is_empty() {
            return Err(EcmcError::configuration("a walker needs at least one item"));
        }
        if let Some(bad) = items.iter().find(|i| !(i.rate >= 0.0) || !i.rate.is_finite()) {
            return Err(EcmcError::configuration(format!(
                "walker rates must be finite and >= 0.0, got {}",
                bad.rate
            )));
        }
        let total_rate: f64 = items.iter().map(|i| i.rate).sum();
        let mean_rate = total_rate / items.len() as f64;

        let mut small = Vec::new();
        let mut large = Vec::new();
        for item in items {
            if item.rate > mean_rate {
                large.push(item);
            } else {
                small.push(item);
            }
        }

        let mut table = Vec::with_capacity(small.len() + large.len());
        while !small.is_empty() && !large.is_empty() {
            let (Some(small_item), Some(mut large_item)) = (small.pop(), large.pop()) else {
                break;
            };
            let excess = mean_rate - small_item.rate;
            table.push(TableEntry {
                first: small_item,
                second: Some(large_item.item.clone()),
            });
            large_item.rate -= excess;
            if large_item.rate < mean_rate {
                small.push(large_item);
            } else {
                large.push(large_item);
            }
        }
        for leftover in small.into_iter().chain(large) {
            if mean_rate > 0.0 {
                let ratio = leftover.rate / mean_rate;
                debug_assert!((1.0 - 1e-6..1.0 + 1e-6).contains(&ratio));
            }
            table.push(TableEntry {
                first: WalkerItem::new(leftover.item, mean_rate),
                second: None,
            });
        }

        Ok(Walker {
            table,
            total_rate,
            mean_rate,
        })
    }

    /// Draw one item with probability proportional to its rate.
    pub fn sample<D: UniformDraw + ?Sized>(&self, draw: &mut D) -> T {
        let entry = &self.table[choose_index(draw, self.table.len())];
        let threshold = uniform(draw, 0.0, self.mean_rate);
        match &entry.second {
            Some(second) if threshold > entry.first.rate => second.clone(),
            _ => entry.first.item.clone(),
        }
    }

    #[inline]
    pub fn total_rate(&self) -> f64 {
        self.total_rate
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SequenceDraw;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_rejects_bad_items() {
        assert!(Walker::<usize>::new(vec![]).is_err());
        assert!(Walker::new(vec![WalkerItem::new(0, -1.0)]).is_err());
    }

    #[test]
    fn test_two_items_exact() {
        // mean 2.0: the table holds one entry (a: 1.0 | b) and one (b: 2.0)
        let walker = Walker::new(vec![WalkerItem::new('a', 1.0), WalkerItem::new('b', 3.0)]).unwrap();
        assert_eq!(walker.total_rate(), 4.0);
        assert_eq!(walker.len(), 2);
        assert_eq!(walker.sample(&mut SequenceDraw::new([0.0, 0.49])), 'a');
        assert_eq!(walker.sample(&mut SequenceDraw::new([0.0, 0.51])), 'b');
        assert_eq!(walker.sample(&mut SequenceDraw::new([0.75, 0.99])), 'b');
    }

    #[test]
    fn test_frequencies_converge() {
        let weights = [0.5, 2.0, 0.0, 1.5, 4.0];
        let walker = Walker::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, &w)| WalkerItem::new(i, w))
                .collect(),
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 200_000;
        let mut counts = [0usize; 5];
        for _ in 0..n {
            counts[walker.sample(&mut rng)] += 1;
        }
        let total: f64 = weights.iter().sum();
        for (count, weight) in counts.iter().zip(weights) {
            let expected = weight / total;
            assert!((*count as f64 / n as f64 - expected).abs() < 0.01);
        }
        assert_eq!(counts[2], 0);
    }

    #[test]
    fn test_all_zero_rates() {
        let walker = Walker::new(vec![WalkerItem::new(1, 0.0), WalkerItem::new(2, 0.0)]).unwrap();
        assert_eq!(walker.total_rate(), 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let item = walker.sample(&mut rng);
        assert!(item == 1 || item == 2);
    }

    proptest::proptest! {
        #[test]
        fn prop_table_reproduces_rates(rates in proptest::collection::vec(0.0f64..10.0, 1..24)) {
            let total: f64 = rates.iter().sum();
            proptest::prop_assume!(total > 1e-6);
            let walker = Walker::new(
                rates.iter().enumerate().map(|(i, &rate)| WalkerItem::new(i, rate)).collect(),
            )
            .unwrap();

            let n = walker.len() as f64;
            let mut probabilities = vec![0.0; rates.len()];
            for entry in &walker.table {
                let keep = (entry.first.rate / walker.mean_rate).min(1.0);
                probabilities[entry.first.item] += keep / n;
                if let Some(second) = entry.second {
                    probabilities[second] += (1.0 - keep) / n;
                }
            }
            for (probability, rate) in probabilities.iter().zip(&rates) {
                proptest::prop_assert!((probability - rate / total).abs() < 1e-9);
            }
        }
    }
}
