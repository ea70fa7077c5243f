//! Association rules over binned listings (Apriori)
//!
//! Price and mileage are cut into equal-frequency bands, year into fixed
//! bands, and every listing becomes a basket of `field_label` items. Rules
//! come from the frequent itemsets and are filtered by lift; only rules
//! predicting a price band are kept for the report.

use crate::config::PipelineConfig;
use crate::data::Listing;
use crate::error::{PipelineError, Stage};
use crate::stats::interpolate_sorted;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

const YEAR_LABELS: [&str; 3] = ["Old", "Modern", "New"];

/// Column a basket item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BasketField {
    PriceBand,
    MileageBand,
    YearBand,
    Fuel,
    Gearbox,
    CarType,
}

impl BasketField {
    pub fn prefix(&self) -> &'static str {
        match self {
            BasketField::PriceBand => "price_bin",
            BasketField::MileageBand => "mileage_bin",
            BasketField::YearBand => "year_bin",
            BasketField::Fuel => "fuel",
            BasketField::Gearbox => "gearbox",
            BasketField::CarType => "car_type",
        }
    }
}

/// One boolean basket column, e.g. `price_bin_Low Price`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Item {
    pub field: BasketField,
    pub label: String,
}

impl Item {
    fn new(field: BasketField, label: impl Into<String>) -> Self {
        Self {
            field,
            label: label.into(),
        }
    }

    pub fn is_price_band(&self) -> bool {
        self.field == BasketField::PriceBand
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.field.prefix(), self.label)
    }
}

/// Labels of `n` ordinal bands, e.g. `Low Price`, `Mid Price`, `High Price`
pub fn band_labels(n: usize, noun: &str) -> Vec<String> {
    if n == 3 {
        ["Low", "Mid", "High"]
            .iter()
            .map(|level| format!("{level} {noun}"))
            .collect()
    } else {
        (1..=n).map(|q| format!("Q{q} {noun}")).collect()
    }
}

/// Quantile edges of `n_bins` equal-frequency bins.
///
/// Fails when two edges coincide, which happens when one value dominates.
pub fn equal_frequency_edges(values: &[f64], n_bins: usize) -> crate::Result<Vec<f64>> {
    if values.is_empty() || n_bins == 0 {
        return Err(PipelineError::stage(
            Stage::Association,
            "cannot bin an empty column",
        ));
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    // Integer numerator keeps whole positions exact
    let last = sorted.len() - 1;
    let edges: Vec<f64> = (0..=n_bins)
        .map(|k| interpolate_sorted(&sorted, (k * last) as f64 / n_bins as f64))
        .collect();

    if edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(PipelineError::stage(
            Stage::Association,
            format!("bin edges {edges:?} are not unique"),
        ));
    }
    Ok(edges)
}

/// Index of the right-closed interval holding `value`; the first interval
/// also holds the lowest edge.
pub fn assign_bin(value: f64, edges: &[f64]) -> Option<usize> {
    let (first, last) = (*edges.first()?, *edges.last()?);
    if value < first || value > last {
        return None;
    }
    edges[1..].iter().position(|&upper| value <= upper)
}

/// Equal-frequency bin index of every value
pub fn equal_frequency_bins(values: &[f64], n_bins: usize) -> crate::Result<Vec<usize>> {
    let edges = equal_frequency_edges(values, n_bins)?;
    values
        .iter()
        .map(|&value| {
            assign_bin(value, &edges).ok_or_else(|| {
                PipelineError::stage(Stage::Association, format!("{value} fell outside {edges:?}"))
            })
        })
        .collect()
}

/// Fixed year band: `(edges[i], edges[i + 1]]`
pub fn year_band(year: i64, edges: &[i64]) -> Option<usize> {
    edges
        .windows(2)
        .position(|w| w[0] < year && year <= w[1])
}

/// One-hot transactional view of the listings
#[derive(Debug, Clone)]
pub struct Basket {
    items: Vec<Item>,
    /// Row membership per item, as a bitset over transactions
    columns: Vec<Vec<u64>>,
    n_transactions: usize,
}

impl Basket {
    /// Bin and encode listings.
    ///
    /// Items follow column order: price bands, mileage bands, year bands,
    /// then the sorted fuel, gearbox and car type values.
    pub fn from_listings(listings: &[Listing], config: &PipelineConfig) -> crate::Result<Self> {
        let prices: Vec<f64> = listings.iter().map(|l| l.price).collect();
        let mileages: Vec<f64> = listings.iter().map(|l| l.mileage).collect();
        let price_bins = equal_frequency_bins(&prices, config.n_bins)?;
        let mileage_bins = equal_frequency_bins(&mileages, config.n_bins)?;

        let mut items: Vec<Item> = Vec::new();
        items.extend(
            band_labels(config.n_bins, "Price")
                .into_iter()
                .map(|label| Item::new(BasketField::PriceBand, label)),
        );
        items.extend(
            band_labels(config.n_bins, "Mileage")
                .into_iter()
                .map(|label| Item::new(BasketField::MileageBand, label)),
        );
        items.extend(
            YEAR_LABELS
                .iter()
                .map(|label| Item::new(BasketField::YearBand, *label)),
        );

        let categorical: [(BasketField, fn(&Listing) -> &str); 3] = [
            (BasketField::Fuel, |l| l.fuel.as_str()),
            (BasketField::Gearbox, |l| l.gearbox.as_str()),
            (BasketField::CarType, |l| l.car_type.as_str()),
        ];
        for (field, value) in categorical {
            let distinct: BTreeSet<&str> = listings.iter().map(value).collect();
            items.extend(distinct.into_iter().map(|label| Item::new(field, label)));
        }

        let index: HashMap<&Item, usize> =
            items.iter().enumerate().map(|(i, item)| (item, i)).collect();
        let n_words = listings.len().div_ceil(64);
        let mut columns = vec![vec![0u64; n_words]; items.len()];

        let price_labels = band_labels(config.n_bins, "Price");
        let mileage_labels = band_labels(config.n_bins, "Mileage");

        for (row, listing) in listings.iter().enumerate() {
            let mut row_items = vec![
                Item::new(BasketField::PriceBand, price_labels[price_bins[row]].as_str()),
                Item::new(BasketField::MileageBand, mileage_labels[mileage_bins[row]].as_str()),
                Item::new(BasketField::Fuel, listing.fuel.as_str()),
                Item::new(BasketField::Gearbox, listing.gearbox.as_str()),
                Item::new(BasketField::CarType, listing.car_type.as_str()),
            ];
            if let Some(band) = year_band(listing.year, &config.year_edges) {
                row_items.push(Item::new(BasketField::YearBand, YEAR_LABELS[band]));
            }

            for item in &row_items {
                if let Some(&column) = index.get(item) {
                    columns[column][row / 64] |= 1 << (row % 64);
                }
            }
        }

        Ok(Self {
            items,
            columns,
            n_transactions: listings.len(),
        })
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn n_transactions(&self) -> usize {
        self.n_transactions
    }

    /// Fraction of transactions containing every item in `itemset`
    pub fn support(&self, itemset: &[usize]) -> f64 {
        if self.n_transactions == 0 {
            return 0.0;
        }
        let Some((&first, rest)) = itemset.split_first() else {
            return 1.0;
        };

        let count: u32 = self.columns[first]
            .iter()
            .enumerate()
            .map(|(word, &bits)| {
                rest.iter()
                    .fold(bits, |acc, &item| acc & self.columns[item][word])
                    .count_ones()
            })
            .sum();
        count as f64 / self.n_transactions as f64
    }
}

/// Itemset (ascending item indices into the basket) and its support
#[derive(Debug, Clone, PartialEq)]
pub struct FrequentItemset {
    pub items: Vec<usize>,
    pub support: f64,
}

/// Level-wise Apriori.
///
/// Output is ordered by itemset size, then lexicographically by item index.
pub fn apriori(basket: &Basket, min_support: f64) -> Vec<FrequentItemset> {
    let mut frequent: Vec<FrequentItemset> = (0..basket.items().len())
        .map(|item| FrequentItemset {
            items: vec![item],
            support: basket.support(&[item]),
        })
        .filter(|itemset| itemset.support >= min_support)
        .collect();

    let mut level: Vec<Vec<usize>> = frequent.iter().map(|f| f.items.clone()).collect();

    while level.len() > 1 {
        let known: BTreeSet<&Vec<usize>> = level.iter().collect();
        let mut next = Vec::new();

        for (i, left) in level.iter().enumerate() {
            for right in &level[i + 1..] {
                let k = left.len();
                if left[..k - 1] != right[..k - 1] {
                    // Level is sorted, so no later itemset shares this prefix
                    break;
                }
                let mut candidate = left.clone();
                candidate.push(right[k - 1]);

                let all_subsets_frequent = (0..candidate.len()).all(|skip| {
                    let subset: Vec<usize> = candidate
                        .iter()
                        .enumerate()
                        .filter_map(|(pos, &item)| (pos != skip).then_some(item))
                        .collect();
                    known.contains(&subset)
                });
                if !all_subsets_frequent {
                    continue;
                }

                let support = basket.support(&candidate);
                if support >= min_support {
                    frequent.push(FrequentItemset {
                        items: candidate.clone(),
                        support,
                    });
                    next.push(candidate);
                }
            }
        }

        level = next;
    }

    frequent
}

/// Rule `antecedent -> consequent` with the usual interest measures
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRule {
    pub antecedent: Vec<Item>,
    pub consequent: Vec<Item>,
    pub antecedent_support: f64,
    pub consequent_support: f64,
    pub support: f64,
    pub confidence: f64,
    pub lift: f64,
}

impl AssociationRule {
    pub fn predicts_price(&self) -> bool {
        self.consequent.iter().any(Item::is_price_band)
    }
}

impl fmt::Display for AssociationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |items: &[Item]| {
            items
                .iter()
                .map(Item::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{{{}}} -> {{{}}} (support {:.3}, confidence {:.3}, lift {:.3})",
            join(&self.antecedent),
            join(&self.consequent),
            self.support,
            self.confidence,
            self.lift
        )
    }
}

/// Every rule with `lift >= min_lift` from itemsets of two or more items.
///
/// For each itemset, antecedents are visited from largest to smallest, in
/// lexicographic order within a size.
pub fn association_rules(
    basket: &Basket,
    itemsets: &[FrequentItemset],
    min_lift: f64,
) -> Vec<AssociationRule> {
    let supports: HashMap<&[usize], f64> = itemsets
        .iter()
        .map(|itemset| (itemset.items.as_slice(), itemset.support))
        .collect();
    let lookup = |items: &[usize]| {
        supports
            .get(items)
            .copied()
            .unwrap_or_else(|| basket.support(items))
    };
    let to_items = |indices: &[usize]| -> Vec<Item> {
        indices.iter().map(|&i| basket.items()[i].clone()).collect()
    };

    let mut rules = Vec::new();
    for itemset in itemsets.iter().filter(|itemset| itemset.items.len() > 1) {
        let n = itemset.items.len();
        for size in (1..n).rev() {
            for antecedent in combinations(&itemset.items, size) {
                let consequent: Vec<usize> = itemset
                    .items
                    .iter()
                    .copied()
                    .filter(|item| !antecedent.contains(item))
                    .collect();

                let antecedent_support = lookup(&antecedent);
                let consequent_support = lookup(&consequent);
                if antecedent_support <= 0.0 || consequent_support <= 0.0 {
                    continue;
                }
                let confidence = itemset.support / antecedent_support;
                let lift = confidence / consequent_support;
                if lift < min_lift {
                    continue;
                }

                rules.push(AssociationRule {
                    antecedent: to_items(&antecedent),
                    consequent: to_items(&consequent),
                    antecedent_support,
                    consequent_support,
                    support: itemset.support,
                    confidence,
                    lift,
                });
            }
        }
    }
    rules
}

/// All `k`-subsets of `items`, lexicographic by position
fn combinations(items: &[usize], k: usize) -> Vec<Vec<usize>> {
    let n = items.len();
    if k == 0 || k > n {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut positions: Vec<usize> = (0..k).collect();
    loop {
        out.push(positions.iter().map(|&p| items[p]).collect());

        let Some(i) = (0..k).rev().find(|&i| positions[i] != i + n - k) else {
            return out;
        };
        positions[i] += 1;
        for j in i + 1..k {
            positions[j] = positions[j - 1] + 1;
        }
    }
}

/// Rules retained for the report
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Price-predicting rules, at most `max_rules`, in mining order
    pub rules: Vec<AssociationRule>,
    /// Frequent itemsets found
    pub n_itemsets: usize,
    /// Rules passing the lift filter, before the price filter
    pub n_candidate_rules: usize,
}

/// The rule-mining capability, resolved once per run
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationRuleMiner {
    Available,
    Unavailable { reason: String },
}

impl AssociationRuleMiner {
    /// Decide from the build features and the run configuration
    pub fn resolve(config: &PipelineConfig) -> Self {
        if !cfg!(feature = "association") {
            AssociationRuleMiner::Unavailable {
                reason: "built without the `association` feature".to_string(),
            }
        } else if !config.association_enabled {
            AssociationRuleMiner::Unavailable {
                reason: "disabled by configuration".to_string(),
            }
        } else {
            AssociationRuleMiner::Available
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, AssociationRuleMiner::Available)
    }

    /// Mine price rules from the normal listings
    pub fn mine(&self, listings: &[Listing], config: &PipelineConfig) -> crate::Result<RuleSet> {
        if let AssociationRuleMiner::Unavailable { reason } = self {
            warn!(%reason, "skipping association rules");
            return Err(PipelineError::CapabilityUnavailable {
                reason: reason.clone(),
            });
        }

        let basket = Basket::from_listings(listings, config)?;
        debug!(
            items = basket.items().len(),
            transactions = basket.n_transactions(),
            "basket encoded"
        );

        let itemsets = apriori(&basket, config.min_support);
        let candidates = association_rules(&basket, &itemsets, config.min_lift);
        let n_candidate_rules = candidates.len();

        let rules: Vec<AssociationRule> = candidates
            .into_iter()
            .filter(AssociationRule::predicts_price)
            .take(config.max_rules)
            .collect();

        info!(
            itemsets = itemsets.len(),
            candidate_rules = n_candidate_rules,
            price_rules = rules.len(),
            "association rules mined"
        );
        for rule in &rules {
            debug!(%rule, "price rule");
        }

        Ok(RuleSet {
            rules,
            n_itemsets: itemsets.len(),
            n_candidate_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn listing(price: f64, year: i64, mileage: f64, fuel: &str, gearbox: &str) -> Listing {
        Listing {
            price,
            year,
            mileage,
            fuel: fuel.to_string(),
            gearbox: gearbox.to_string(),
            car_type: "Sedan".to_string(),
            engine_hp: 100.0,
        }
    }

    /// Expensive cars are new, automatic and low-mileage; cheap ones the opposite
    fn market(n: usize) -> Vec<Listing> {
        (0..n)
            .map(|i| {
                let tier = i % 3;
                let jitter = (i / 3) as f64;
                match tier {
                    0 => listing(4000.0 + jitter, 2005, 180000.0 + jitter, "Petrol", "Manual"),
                    1 => listing(12000.0 + jitter, 2014, 90000.0 + jitter, "Diesel", "Manual"),
                    _ => listing(30000.0 + jitter, 2021, 15000.0 + jitter, "Electric", "Automatic"),
                }
            })
            .collect()
    }

    #[test]
    fn test_assign_bin_is_right_closed_and_includes_lowest() {
        let edges = [0.0, 10.0, 20.0, 30.0];
        assert_eq!(assign_bin(0.0, &edges), Some(0));
        assert_eq!(assign_bin(10.0, &edges), Some(0));
        assert_eq!(assign_bin(10.5, &edges), Some(1));
        assert_eq!(assign_bin(30.0, &edges), Some(2));
        assert_eq!(assign_bin(30.1, &edges), None);
    }

    #[test]
    fn test_year_bands() {
        let edges = [1990, 2010, 2018, 2025];
        assert_eq!(year_band(1990, &edges), None);
        assert_eq!(year_band(2010, &edges), Some(0));
        assert_eq!(year_band(2011, &edges), Some(1));
        assert_eq!(year_band(2018, &edges), Some(1));
        assert_eq!(year_band(2025, &edges), Some(2));
        assert_eq!(year_band(2026, &edges), None);
    }

    #[test]
    fn test_degenerate_binning_fails() {
        let values = vec![5.0; 10];
        assert!(equal_frequency_edges(&values, 3).is_err());
    }

    #[test]
    fn test_item_names_match_dummy_columns() {
        let item = Item::new(BasketField::PriceBand, "Low Price");
        assert_eq!(item.to_string(), "price_bin_Low Price");
        assert!(item.is_price_band());
        assert_eq!(Item::new(BasketField::Fuel, "Diesel").to_string(), "fuel_Diesel");
    }

    #[test]
    fn test_basket_support() {
        let listings = market(30);
        let basket = Basket::from_listings(&listings, &PipelineConfig::default()).unwrap();

        let position = |name: &str| {
            basket
                .items()
                .iter()
                .position(|item| item.to_string() == name)
                .unwrap()
        };
        let high = position("price_bin_High Price");
        let electric = position("fuel_Electric");
        let manual = position("gearbox_Manual");

        assert!((basket.support(&[high]) - 1.0 / 3.0).abs() < 1e-12);
        assert!((basket.support(&[high, electric]) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(basket.support(&[high, manual]), 0.0);
    }

    #[test]
    fn test_apriori_orders_by_size_then_items() {
        let listings = market(30);
        let basket = Basket::from_listings(&listings, &PipelineConfig::default()).unwrap();
        let itemsets = apriori(&basket, 0.05);

        assert!(itemsets.iter().all(|f| f.support >= 0.05));
        for pair in itemsets.windows(2) {
            let (a, b) = (&pair[0].items, &pair[1].items);
            assert!(a.len() < b.len() || (a.len() == b.len() && a < b));
        }

        // Each tier is a frequent 6-itemset: price, mileage, year, fuel, gearbox, type
        assert!(itemsets.iter().any(|f| f.items.len() == 6));
    }

    #[test]
    fn test_combinations() {
        assert_eq!(
            combinations(&[1, 4, 7], 2),
            vec![vec![1, 4], vec![1, 7], vec![4, 7]]
        );
        assert_eq!(combinations(&[1, 4, 7], 3), vec![vec![1, 4, 7]]);
        assert!(combinations(&[1], 2).is_empty());
    }

    #[test]
    fn test_rule_measures() {
        let listings = market(30);
        let basket = Basket::from_listings(&listings, &PipelineConfig::default()).unwrap();
        let itemsets = apriori(&basket, 0.05);
        let rules = association_rules(&basket, &itemsets, 1.2);

        let rule = rules
            .iter()
            .find(|r| {
                r.antecedent.len() == 1
                    && r.antecedent[0].to_string() == "fuel_Electric"
                    && r.consequent.len() == 1
                    && r.consequent[0].to_string() == "price_bin_High Price"
            })
            .expect("electric -> high price rule");

        assert!((rule.support - 1.0 / 3.0).abs() < 1e-12);
        assert!((rule.confidence - 1.0).abs() < 1e-12);
        assert!((rule.lift - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mined_rules_pass_filters() {
        let listings = market(60);
        let config = PipelineConfig::default();
        let miner = AssociationRuleMiner::Available;
        let set = miner.mine(&listings, &config).unwrap();

        assert!(!set.rules.is_empty());
        assert!(set.rules.len() <= 15);
        assert!(set.n_candidate_rules >= set.rules.len());
        for rule in &set.rules {
            assert!(rule.lift >= 1.2);
            assert!(rule
                .consequent
                .iter()
                .any(|item| item.to_string().ends_with("Price")));
            assert!((0.0..=1.0).contains(&rule.support));
            assert!((0.0..=1.0).contains(&rule.confidence));
        }
    }

    #[test]
    fn test_mined_rules_are_first_price_rules_in_mining_order() {
        let listings = market(60);
        let config = PipelineConfig::default();
        let set = AssociationRuleMiner::Available
            .mine(&listings, &config)
            .unwrap();

        let basket = Basket::from_listings(&listings, &config).unwrap();
        let itemsets = apriori(&basket, config.min_support);
        let price_rules: Vec<AssociationRule> =
            association_rules(&basket, &itemsets, config.min_lift)
                .into_iter()
                .filter(AssociationRule::predicts_price)
                .collect();
        assert!(price_rules.len() > config.max_rules);

        let expected: Vec<AssociationRule> =
            price_rules.into_iter().take(config.max_rules).collect();
        assert_eq!(set.rules, expected);

        // Itemsets are visited smallest first
        let sizes: Vec<usize> = set
            .rules
            .iter()
            .map(|r| r.antecedent.len() + r.consequent.len())
            .collect();
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_unavailable_miner_reports_capability() {
        let miner = AssociationRuleMiner::Unavailable {
            reason: "disabled by configuration".to_string(),
        };
        let err = miner
            .mine(&market(30), &PipelineConfig::default())
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_resolve_honours_config_switch() {
        let mut config = PipelineConfig::default();
        config.association_enabled = false;
        assert!(!AssociationRuleMiner::resolve(&config).is_available());

        config.association_enabled = true;
        assert_eq!(
            AssociationRuleMiner::resolve(&config).is_available(),
            cfg!(feature = "association")
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_equal_frequency_bins_are_balanced(
            raw in prop::collection::btree_set(1u32..10_000_000, 3..400usize),
        ) {
            let values: Vec<f64> = raw.into_iter().rev().map(|v| v as f64 * 1.5).collect();
            let bins = equal_frequency_bins(&values, 3).unwrap();

            let mut counts = [0usize; 3];
            for bin in bins {
                counts[bin] += 1;
            }
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            prop_assert!(max - min <= 1, "unbalanced bins {:?}", counts);
        }
    }
}
