//! wardgate/src/backend/kmeans.rs
//! K-means with k-means++ seeding and silhouette-driven model selection.

use rand::Rng;
use tracing::debug;

const N_INIT: usize = 3;
const MAX_ITERATIONS: usize = 300;
const TOLERANCE: f64 = 1e-6;

/// Largest candidate cluster count plus one; candidate k stays below
/// min(MAX_CLUSTERS, observation count).
const MAX_CLUSTERS: usize = 10;

pub struct KMeansFit {
    pub centroids: Vec<Vec<f64>>,
    pub labels: Vec<usize>,
    pub inertia: f64,
}

fn euclid(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let dist = euclid(point, centroid);
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// k-means++ seeding: each further seed is drawn with probability
/// proportional to its squared distance from the nearest existing seed.
fn seed_centroids<R: Rng>(points: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut seeds = Vec::with_capacity(k);
    seeds.push(points[rng.random_range(0..points.len())].clone());
    while seeds.len() < k {
        let weights: Vec<f64> = points
            .iter()
            .map(|p| {
                seeds
                    .iter()
                    .map(|s| {
                        let d = euclid(p, s);
                        d * d
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            // Every point coincides with a seed already.
            seeds.push(points[rng.random_range(0..points.len())].clone());
            continue;
        }
        let mut target = rng.random::<f64>() * total;
        let mut chosen = points.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            target -= w;
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        seeds.push(points[chosen].clone());
    }
    seeds
}

fn lloyd(points: &[Vec<f64>], mut centroids: Vec<Vec<f64>>) -> KMeansFit {
    let dims = points[0].len();
    let k = centroids.len();
    let mut labels = vec![0usize; points.len()];
    for _ in 0..MAX_ITERATIONS {
        for (i, point) in points.iter().enumerate() {
            labels[i] = nearest(point, &centroids);
        }
        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (point, &label) in points.iter().zip(labels.iter()) {
            counts[label] += 1;
            for (sum, value) in sums[label].iter_mut().zip(point.iter()) {
                *sum += value;
            }
        }
        let mut shift = 0.0f64;
        for (label, sum) in sums.into_iter().enumerate() {
            if counts[label] == 0 {
                // Empty cluster keeps its previous centroid.
                continue;
            }
            let mean: Vec<f64> = sum
                .into_iter()
                .map(|value| value / counts[label] as f64)
                .collect();
            shift = shift.max(euclid(&mean, &centroids[label]));
            centroids[label] = mean;
        }
        if shift < TOLERANCE {
            break;
        }
        // Hitting the iteration cap without converging is fine; the fit
        // is used as-is.
    }
    for (i, point) in points.iter().enumerate() {
        labels[i] = nearest(point, &centroids);
    }
    let inertia = points
        .iter()
        .zip(labels.iter())
        .map(|(point, &label)| {
            let d = euclid(point, &centroids[label]);
            d * d
        })
        .sum();
    KMeansFit {
        centroids,
        labels,
        inertia,
    }
}

/// Fits `k` clusters, keeping the lowest-inertia run of `n_init` restarts.
pub fn fit(points: &[Vec<f64>], k: usize, n_init: usize) -> KMeansFit {
    let mut rng = rand::rng();
    let mut best = lloyd(points, seed_centroids(points, k, &mut rng));
    for _ in 1..n_init {
        let candidate = lloyd(points, seed_centroids(points, k, &mut rng));
        if candidate.inertia < best.inertia {
            best = candidate;
        }
    }
    best
}

/// Mean silhouette coefficient over all samples, Euclidean metric.
/// Samples in singleton clusters score 0.
pub fn silhouette(points: &[Vec<f64>], labels: &[usize], k: usize) -> f64 {
    let mut cluster_sizes = vec![0usize; k];
    for &label in labels {
        cluster_sizes[label] += 1;
    }

    let n = points.len();
    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if cluster_sizes[own] <= 1 {
            continue;
        }
        let mut sums = vec![0.0f64; k];
        for j in 0..n {
            if i == j {
                continue;
            }
            sums[labels[j]] += euclid(&points[i], &points[j]);
        }
        let a = sums[own] / (cluster_sizes[own] - 1) as f64;
        let mut b = f64::INFINITY;
        for (cluster, &size) in cluster_sizes.iter().enumerate() {
            if cluster != own && size > 0 {
                b = b.min(sums[cluster] / size as f64);
            }
        }
        if !b.is_finite() {
            continue;
        }
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    total / n as f64
}

/// Tries every candidate cluster count and keeps the best-scoring model:
/// highest silhouette first (forced to 0 for a single cluster), smaller k
/// on ties. `None` when there are too few observations for any candidate.
pub fn best_fit(points: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let max_k = points.len().min(MAX_CLUSTERS);
    let mut best: Option<(f64, Vec<Vec<f64>>)> = None;
    for k in 1..max_k {
        let fit = fit(points, k, N_INIT);
        let score = if k == 1 {
            0.0
        } else {
            silhouette(points, &fit.labels, k)
        };
        debug!(k, score, "scored candidate model");
        // Strictly-better only: on a silhouette tie the earlier (smaller)
        // k stays.
        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((score, fit.centroids));
        }
    }
    best.map(|(_, centroids)| centroids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut points = Vec::new();
        for i in 0..20 {
            let jitter = i as f64 * 0.001;
            points.push(vec![0.1 + jitter, 0.1]);
            points.push(vec![0.9 - jitter, 0.9]);
        }
        points
    }

    #[test]
    fn fit_recovers_two_separated_blobs() {
        let points = two_blobs();
        let fit = fit(&points, 2, 3);
        assert_eq!(fit.centroids.len(), 2);
        let mut xs: Vec<f64> = fit.centroids.iter().map(|c| c[0]).collect();
        xs.sort_by(f64::total_cmp);
        assert!((xs[0] - 0.11).abs() < 0.05);
        assert!((xs[1] - 0.89).abs() < 0.05);
    }

    #[test]
    fn single_cluster_centroid_is_the_mean() {
        let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0]];
        let fit = fit(&points, 1, 3);
        assert_eq!(fit.centroids, vec![vec![1.0, 0.0]]);
        assert_eq!(fit.labels, vec![0, 0, 0]);
    }

    #[test]
    fn inertia_never_grows_with_more_clusters() {
        let points = two_blobs();
        let one = fit(&points, 1, 3).inertia;
        let two = fit(&points, 2, 3).inertia;
        assert!(two <= one);
    }

    #[test]
    fn silhouette_rewards_the_true_split() {
        let points = two_blobs();
        let good = fit(&points, 2, 3);
        let score = silhouette(&points, &good.labels, 2);
        assert!(score > 0.8, "expected a strong split, got {score}");

        let worse = fit(&points, 5, 3);
        let worse_score = silhouette(&points, &worse.labels, 5);
        assert!(score > worse_score);
    }

    #[test]
    fn best_fit_picks_two_clusters_for_two_blobs() {
        let centroids = best_fit(&two_blobs()).unwrap();
        assert_eq!(centroids.len(), 2);
    }

    #[test]
    fn best_fit_needs_at_least_two_observations() {
        assert!(best_fit(&[vec![1.0, 2.0]]).is_none());
        // Two observations allow only the single-centroid candidate.
        let centroids = best_fit(&[vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap();
        assert_eq!(centroids, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn identical_points_stay_one_cluster() {
        let points = vec![vec![0.5, 0.5]; 12];
        let centroids = best_fit(&points).unwrap();
        assert_eq!(centroids.len(), 1);
        assert_eq!(centroids[0], vec![0.5, 0.5]);
    }
}
