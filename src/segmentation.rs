//! Market segmentation: one-hot encoding, standard scaling and K-Means

use crate::config::PipelineConfig;
use crate::data::Listing;
use crate::error::{PipelineError, Stage};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A normal listing with its market segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedListing {
    pub listing: Listing,
    pub cluster_id: usize,
}

/// Output of the segmentation stage
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub listings: Vec<SegmentedListing>,
    pub n_clusters: usize,
    /// Cluster centroids in standardized feature space
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares
    pub inertia: f64,
    /// Names of the feature columns, in centroid column order
    pub feature_names: Vec<String>,
}

impl Segmentation {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for segmented in &self.listings {
            sizes[segmented.cluster_id] += 1;
        }
        sizes
    }

    pub fn labels(&self) -> Vec<usize> {
        self.listings.iter().map(|s| s.cluster_id).collect()
    }
}

/// Drop-first one-hot encoding of a categorical column
#[derive(Debug, Clone)]
struct OneHot {
    name: &'static str,
    /// Categories kept as columns; the lexicographically first is the reference
    categories: Vec<String>,
}

impl OneHot {
    fn fit<'a>(name: &'static str, values: impl Iterator<Item = &'a str>) -> Self {
        let distinct: BTreeSet<&str> = values.collect();
        let categories = distinct.into_iter().skip(1).map(str::to_string).collect();
        Self { name, categories }
    }

    fn column_names(&self) -> impl Iterator<Item = String> + '_ {
        self.categories
            .iter()
            .map(move |category| format!("{}_{}", self.name, category))
    }

    fn encode(&self, value: &str, out: &mut Vec<f64>) {
        out.extend(
            self.categories
                .iter()
                .map(|category| if category == value { 1.0 } else { 0.0 }),
        );
    }
}

/// Zero-mean, unit-variance scaling with statistics from the fitted rows
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    /// Population standard deviation; constant columns get scale 1
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let variance = x
            .axis_iter(Axis(0))
            .fold(Array1::<f64>::zeros(x.ncols()), |acc, row| {
                acc + (&row - &mean).mapv(|d| d * d)
            })
            / n;
        let scale = variance.mapv(|v| {
            let std = v.sqrt();
            if std > f64::EPSILON {
                std
            } else {
                1.0
            }
        });
        Self { mean, scale }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean) / &self.scale
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

/// Standardized, one-hot-expanded features of the given listings.
///
/// Columns are `price, year, mileage, engine_hp` followed by the dummy
/// columns of `fuel`, `gearbox` and `car_type`.
pub fn feature_matrix(listings: &[Listing]) -> crate::Result<(Array2<f64>, Vec<String>)> {
    let encoders = [
        OneHot::fit("fuel", listings.iter().map(|l| l.fuel.as_str())),
        OneHot::fit("gearbox", listings.iter().map(|l| l.gearbox.as_str())),
        OneHot::fit("car_type", listings.iter().map(|l| l.car_type.as_str())),
    ];

    let mut names: Vec<String> = ["price", "year", "mileage", "engine_hp"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for encoder in &encoders {
        names.extend(encoder.column_names());
    }

    let mut values = Vec::with_capacity(listings.len() * names.len());
    for listing in listings {
        values.extend_from_slice(&[
            listing.price,
            listing.year as f64,
            listing.mileage,
            listing.engine_hp,
        ]);
        encoders[0].encode(&listing.fuel, &mut values);
        encoders[1].encode(&listing.gearbox, &mut values);
        encoders[2].encode(&listing.car_type, &mut values);
    }

    let raw = Array2::from_shape_vec((listings.len(), names.len()), values)
        .map_err(|e| PipelineError::stage(Stage::Segmentation, e.to_string()))?;
    let scaled = StandardScaler::fit(&raw).transform(&raw);
    Ok((scaled, names))
}

/// Partition the normal listings into `config.n_clusters` segments
///
/// # Arguments
/// * `listings` - Listings labelled normal by the anomaly stage
/// * `config` - Cluster count, k-means limits and seed
///
/// # Returns
/// * `Segmentation` with a cluster id per listing, centroids and inertia
pub fn segment_listings(
    listings: &[Listing],
    config: &PipelineConfig,
) -> crate::Result<Segmentation> {
    let n_clusters = config.n_clusters;
    if listings.len() < n_clusters {
        return Err(PipelineError::stage(
            Stage::Segmentation,
            format!(
                "number of listings ({}) must be at least the number of clusters ({})",
                listings.len(),
                n_clusters
            ),
        ));
    }

    let (features, feature_names) = feature_matrix(listings)?;
    debug!(shape = ?features.shape(), "feature matrix built");

    let dataset = DatasetBase::from(features.clone());
    let rng = StdRng::seed_from_u64(config.seed);
    let model = KMeans::params_with(n_clusters, rng, L2Dist)
        .n_runs(config.n_runs)
        .max_n_iterations(config.max_iterations)
        .tolerance(config.tolerance)
        .fit(&dataset)
        .map_err(|e| PipelineError::stage(Stage::Segmentation, e.to_string()))?;

    let labels: Array1<usize> = model.predict(&features);
    let centroids = model.centroids().clone();
    let inertia = compute_inertia(&features, &labels, &centroids);

    let segmented = listings
        .iter()
        .zip(labels.iter())
        .map(|(listing, &cluster_id)| SegmentedListing {
            listing: listing.clone(),
            cluster_id,
        })
        .collect();

    let segmentation = Segmentation {
        listings: segmented,
        n_clusters,
        centroids,
        inertia,
        feature_names,
    };

    info!(
        rows = listings.len(),
        sizes = ?segmentation.cluster_sizes(),
        inertia,
        "listings segmented"
    );

    Ok(segmentation)
}

/// Within-cluster sum of squares
fn compute_inertia(
    features: &Array2<f64>,
    labels: &Array1<usize>,
    centroids: &Array2<f64>,
) -> f64 {
    features
        .outer_iter()
        .zip(labels.iter())
        .map(|(point, &cluster)| {
            point
                .iter()
                .zip(centroids.row(cluster).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
        })
        .sum()
}
