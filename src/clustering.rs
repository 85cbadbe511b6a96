//! K-means clustering used to train the IVF index.
//!
//! Euclidean k-means with k-means++ seeding. The generator is seeded, so the
//! same training vectors always produce the same partition; that keeps IVF
//! search results reproducible across a save/load cycle and in tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

const MAX_ITERATIONS: usize = 50;

/// Stop once no centroid moves more than this (squared L2).
const CONVERGENCE_TOLERANCE: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    pub centroids: Vec<Vec<f32>>,
    /// Index into `centroids` for each input vector.
    pub assignments: Vec<usize>,
    pub iterations: usize,
}

#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error("empty vector set provided for clustering")]
    EmptyVectorSet,

    #[error("invalid cluster count {k} for {n} vectors")]
    InvalidClusterCount { k: usize, n: usize },

    #[error("training vectors have mixed dimensions")]
    DimensionMismatch,
}

/// Squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the centroid nearest to `vector`; ties go to the lowest index.
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_l2(vector, centroid);
        if d < best_distance {
            best_distance = d;
            best = i;
        }
    }
    best
}

pub fn kmeans(vectors: &[Vec<f32>], k: usize, seed: u64) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }
    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount { k, n: vectors.len() });
    }
    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus(vectors, k, &mut rng);
    let mut assignments: Vec<usize> = vectors
        .iter()
        .map(|v| nearest_centroid(v, &centroids))
        .collect();
    let mut iterations = 1;

    while iterations < MAX_ITERATIONS {
        let updated = update_centroids(vectors, &assignments, &centroids);
        let movement = centroids
            .iter()
            .zip(&updated)
            .map(|(old, new)| squared_l2(old, new))
            .fold(0.0f32, f32::max);
        centroids = updated;

        let reassigned: Vec<usize> = vectors
            .iter()
            .map(|v| nearest_centroid(v, &centroids))
            .collect();
        iterations += 1;

        let stable = reassigned == assignments;
        assignments = reassigned;
        if stable || movement < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// k-means++: each further centroid is drawn with probability proportional
/// to its squared distance from the nearest centroid chosen so far.
fn kmeans_plus_plus(vectors: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(vectors[rng.random_range(0..vectors.len())].clone());

    let mut distances: Vec<f32> = vectors
        .iter()
        .map(|v| squared_l2(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = distances.iter().sum();
        let next = if total <= f32::EPSILON {
            // every remaining point coincides with a centroid
            rng.random_range(0..vectors.len())
        } else {
            let mut target = rng.random::<f32>() * total;
            let mut chosen = vectors.len() - 1;
            for (i, d) in distances.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };

        let centroid = vectors[next].clone();
        for (d, v) in distances.iter_mut().zip(vectors) {
            *d = d.min(squared_l2(v, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Mean of each cluster's members; an empty cluster keeps its old centroid.
fn update_centroids(
    vectors: &[Vec<f32>],
    assignments: &[usize],
    previous: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let dimension = previous[0].len();
    let mut sums = vec![vec![0.0f32; dimension]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (vector, &cluster) in vectors.iter().zip(assignments) {
        for (s, x) in sums[cluster].iter_mut().zip(vector) {
            *s += x;
        }
        counts[cluster] += 1;
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((mut sum, count), old)| {
            if count == 0 {
                old.clone()
            } else {
                sum.iter_mut().for_each(|s| *s /= count as f32);
                sum
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
            vec![10.0, 10.1],
        ]
    }

    #[test]
    fn separates_well_spaced_blobs() {
        let result = kmeans(&two_blobs(), 2, 7).unwrap();
        let a = result.assignments[0];
        assert!(result.assignments[..3].iter().all(|&c| c == a));
        assert!(result.assignments[3..].iter().all(|&c| c != a));
        assert_eq!(result.centroids.len(), 2);
    }

    #[test]
    fn same_seed_same_partition() {
        let first = kmeans(&two_blobs(), 2, 42).unwrap();
        let second = kmeans(&two_blobs(), 2, 42).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn identical_points_do_not_break_seeding() {
        let vectors = vec![vec![1.0, 1.0]; 4];
        let result = kmeans(&vectors, 3, 1).unwrap();
        assert_eq!(result.centroids.len(), 3);
        assert_eq!(result.assignments.len(), 4);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(kmeans(&[], 1, 0), Err(ClusteringError::EmptyVectorSet)));
        assert!(matches!(
            kmeans(&two_blobs(), 7, 0),
            Err(ClusteringError::InvalidClusterCount { k: 7, n: 6 })
        ));
        assert!(matches!(
            kmeans(&[vec![1.0], vec![1.0, 2.0]], 1, 0),
            Err(ClusteringError::DimensionMismatch)
        ));
    }
}
