//! Isolation forest outlier labelling over price, mileage and year

use crate::config::PipelineConfig;
use crate::data::{CleanedDataset, Listing};
use crate::error::{PipelineError, Stage};
use crate::stats::quantile;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Result of the anomaly stage for one listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutlierStatus {
    Normal,
    Outlier,
}

/// A listing with its anomaly label
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledListing {
    pub listing: Listing,
    pub status: OutlierStatus,
    /// Isolation score in (0, 1]; higher is more anomalous
    pub score: f64,
}

impl LabeledListing {
    pub fn is_outlier(&self) -> bool {
        self.status == OutlierStatus::Outlier
    }
}

/// Isolation tree node
#[derive(Debug, Clone)]
enum IsolationTree {
    Internal {
        feature: usize,
        threshold: f64,
        left: Box<IsolationTree>,
        right: Box<IsolationTree>,
    },
    External {
        size: usize,
    },
}

impl IsolationTree {
    fn build(
        x: &Array2<f64>,
        indices: &[usize],
        height: usize,
        max_height: usize,
        rng: &mut StdRng,
    ) -> Self {
        let n_samples = indices.len();
        if height >= max_height || n_samples <= 1 {
            return IsolationTree::External { size: n_samples };
        }

        let feature = rng.gen_range(0..x.ncols());
        let (min_val, max_val) = indices
            .iter()
            .map(|&i| x[[i, feature]])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        // Constant along this feature: nothing left to isolate on it
        if max_val - min_val <= f64::EPSILON * max_val.abs().max(1.0) {
            return IsolationTree::External { size: n_samples };
        }

        let threshold = rng.gen_range(min_val..max_val);
        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| x[[i, feature]] < threshold);

        if left.is_empty() || right.is_empty() {
            return IsolationTree::External { size: n_samples };
        }

        IsolationTree::Internal {
            feature,
            threshold,
            left: Box::new(Self::build(x, &left, height + 1, max_height, rng)),
            right: Box::new(Self::build(x, &right, height + 1, max_height, rng)),
        }
    }

    fn path_length(&self, sample: ArrayView1<f64>) -> f64 {
        let mut node = self;
        let mut depth = 0.0;
        loop {
            match node {
                IsolationTree::External { size } => return depth + average_path_length(*size),
                IsolationTree::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if sample[*feature] < *threshold { &**left } else { &**right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Isolation forest with a contamination-derived decision threshold
#[derive(Debug, Clone)]
pub struct IsolationForest {
    n_estimators: usize,
    max_samples: usize,
    contamination: f64,
    seed: u64,
    trees: Vec<IsolationTree>,
    /// Samples each tree was grown on
    subsample_size: usize,
    threshold: Option<f64>,
}

impl IsolationForest {
    pub fn new() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
            trees: Vec::new(),
            subsample_size: 0,
            threshold: None,
        }
    }

    pub fn with_n_estimators(mut self, n: usize) -> Self {
        self.n_estimators = n.max(1);
        self
    }

    pub fn with_max_samples(mut self, n: usize) -> Self {
        self.max_samples = n.max(1);
        self
    }

    /// Expected share of outliers, clamped to (0, 0.5]
    pub fn with_contamination(mut self, c: f64) -> Self {
        self.contamination = c.clamp(f64::MIN_POSITIVE, 0.5);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Grow the forest on `x` and fix the decision threshold
    pub fn fit(&mut self, x: &Array2<f64>) -> crate::Result<()> {
        let n_samples = x.nrows();
        if n_samples == 0 {
            return Err(PipelineError::stage(Stage::Anomaly, "cannot fit on zero rows"));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let subsample_size = self.max_samples.min(n_samples);
        let max_height = (subsample_size as f64).log2().ceil().max(1.0) as usize;

        self.trees = (0..self.n_estimators)
            .map(|_| {
                let indices =
                    rand::seq::index::sample(&mut rng, n_samples, subsample_size).into_vec();
                IsolationTree::build(x, &indices, 0, max_height, &mut rng)
            })
            .collect();
        self.subsample_size = subsample_size;

        let scores = self.score_samples(x)?;
        let threshold = quantile(&scores.to_vec(), 1.0 - self.contamination);
        debug!(threshold, trees = self.trees.len(), "isolation forest fitted");
        self.threshold = Some(threshold);

        Ok(())
    }

    /// Score in (0, 1]: `2^(-E[h(x)] / c(psi))`
    pub fn score_samples(&self, x: &Array2<f64>) -> crate::Result<Array1<f64>> {
        if self.trees.is_empty() {
            return Err(PipelineError::stage(Stage::Anomaly, "isolation forest is not fitted"));
        }

        let normaliser = average_path_length(self.subsample_size).max(f64::MIN_POSITIVE);
        let n_trees = self.trees.len() as f64;

        Ok(x.outer_iter()
            .map(|row| {
                let mean_path = self
                    .trees
                    .iter()
                    .map(|tree| tree.path_length(row))
                    .sum::<f64>()
                    / n_trees;
                2.0_f64.powf(-mean_path / normaliser)
            })
            .collect())
    }

    /// Label each row; scores strictly above the threshold are outliers
    pub fn predict(&self, x: &Array2<f64>) -> crate::Result<Vec<OutlierStatus>> {
        let threshold = self
            .threshold
            .ok_or_else(|| PipelineError::stage(Stage::Anomaly, "isolation forest is not fitted"))?;

        Ok(self
            .score_samples(x)?
            .iter()
            .map(|&score| {
                if score > threshold {
                    OutlierStatus::Outlier
                } else {
                    OutlierStatus::Normal
                }
            })
            .collect())
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new()
    }
}

/// Feature matrix `[price, mileage, year]`
fn anomaly_features(listings: &[Listing]) -> Array2<f64> {
    let mut x = Array2::zeros((listings.len(), 3));
    for (mut row, listing) in x.outer_iter_mut().zip(listings) {
        row[0] = listing.price;
        row[1] = listing.mileage;
        row[2] = listing.year as f64;
    }
    x
}

/// Fit an isolation forest on the dataset and label every listing
///
/// # Arguments
/// * `dataset` - Cleaned listings
/// * `config` - Forest size, subsample size, contamination and seed
///
/// # Returns
/// * One `LabeledListing` per input listing, in the same order
pub fn detect_outliers(
    dataset: &CleanedDataset,
    config: &PipelineConfig,
) -> crate::Result<Vec<LabeledListing>> {
    let x = anomaly_features(dataset.listings());

    let mut forest = IsolationForest::new()
        .with_n_estimators(config.n_estimators)
        .with_max_samples(config.max_samples)
        .with_contamination(config.contamination)
        .with_seed(config.seed);
    forest.fit(&x)?;

    let scores = forest.score_samples(&x)?;
    let statuses = forest.predict(&x)?;

    let labeled: Vec<LabeledListing> = dataset
        .listings()
        .iter()
        .zip(statuses)
        .zip(scores.iter())
        .map(|((listing, status), &score)| LabeledListing {
            listing: listing.clone(),
            status,
            score,
        })
        .collect();

    let outliers = labeled.iter().filter(|l| l.is_outlier()).count();
    info!(
        rows = labeled.len(),
        outliers,
        fraction = outliers as f64 / labeled.len() as f64,
        "outliers labelled"
    );

    Ok(labeled)
}

/// Listings labelled normal, in order
pub fn normal_listings(labeled: &[LabeledListing]) -> Vec<Listing> {
    labeled
        .iter()
        .filter(|l| !l.is_outlier())
        .map(|l| l.listing.clone())
        .collect()
}
