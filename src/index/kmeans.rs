//! Spherical k-means for training inverted-list centroids.
//!
//! Deterministic: seeds are picked at evenly spaced positions of the sample
//! and the same sample always yields the same centroids.

use crate::store::l2_normalize;

/// Lloyd iterations run after seeding
pub const KMEANS_ITERATIONS: usize = 10;

/// Dot product; equals cosine similarity for unit vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Index of the centroid with the highest dot product
pub fn nearest(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let score = dot(c, v);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

/// Train `k` unit-length centroids over `sample`.
///
/// Returns `min(k, sample.len())` centroids. Clusters that empty out keep
/// their previous centroid.
pub fn train(sample: &[Vec<f32>], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    let k = k.min(sample.len());
    if k == 0 {
        return Vec::new();
    }
    let dim = sample[0].len();

    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| l2_normalize(&sample[i * sample.len() / k]).0)
        .collect();
    let mut assignment = vec![usize::MAX; sample.len()];

    for iteration in 0..iterations {
        let mut changed = 0usize;
        for (slot, v) in assignment.iter_mut().zip(sample.iter()) {
            let c = nearest(&centroids, v);
            if *slot != c {
                *slot = c;
                changed += 1;
            }
        }

        if changed == 0 {
            log::debug!("k-means converged after {} iterations", iteration);
            break;
        }

        let mut sums = vec![vec![0.0f64; dim]; k];
        let mut sizes = vec![0usize; k];
        for (c, v) in assignment.iter().zip(sample.iter()) {
            sizes[*c] += 1;
            for (acc, x) in sums[*c].iter_mut().zip(v.iter()) {
                *acc += *x as f64;
            }
        }

        for ((centroid, sum), size) in centroids.iter_mut().zip(sums.iter()).zip(sizes.iter()) {
            if *size == 0 {
                continue;
            }
            let mean: Vec<f32> = sum.iter().map(|s| (*s / *size as f64) as f32).collect();
            let (unit, zero) = l2_normalize(&mean);
            if !zero {
                *centroid = unit;
            }
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: &[f32]) -> Vec<f32> {
        l2_normalize(v).0
    }

    #[test]
    fn test_train_fewer_rows_than_k() {
        let sample = vec![unit(&[1.0, 0.0]), unit(&[0.0, 1.0])];
        let centroids = train(&sample, 10, KMEANS_ITERATIONS);
        assert_eq!(centroids.len(), 2);
    }

    #[test]
    fn test_train_empty_sample() {
        assert!(train(&[], 10, KMEANS_ITERATIONS).is_empty());
    }

    #[test]
    fn test_train_separates_clusters() {
        let mut sample = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            sample.push(unit(&[1.0, jitter, 0.0]));
            sample.push(unit(&[0.0, jitter, 1.0]));
        }

        let centroids = train(&sample, 2, KMEANS_ITERATIONS);
        assert_eq!(centroids.len(), 2);

        let a = nearest(&centroids, &unit(&[1.0, 0.0, 0.0]));
        let b = nearest(&centroids, &unit(&[0.0, 0.0, 1.0]));
        assert_ne!(a, b);
        for c in &centroids {
            let norm: f32 = dot(c, c).sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_train_is_deterministic() {
        let sample: Vec<Vec<f32>> = (0..50)
            .map(|i| unit(&[(i % 7) as f32 + 0.5, (i % 3) as f32, 1.0]))
            .collect();
        assert_eq!(train(&sample, 5, KMEANS_ITERATIONS), train(&sample, 5, KMEANS_ITERATIONS));
    }
}
