//! Embedding encoding and vector math shared by both store tiers.

use crate::error::{Result, RagsyncError};

/// Norms below this are treated as zero vectors and never divided by.
pub const NORM_EPSILON: f64 = 1e-10;

/// Encode an embedding as a little-endian f32 BLOB
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 BLOB
///
/// Fails with a validation error when the byte length is not a multiple of 4.
pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(RagsyncError::Validation(format!(
            "Invalid embedding BLOB length: {} bytes",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}

/// Reject embeddings whose length differs from the store dimension
pub fn validate_dimension(embedding: &[f32], dim: usize) -> Result<()> {
    if embedding.len() != dim {
        return Err(RagsyncError::Validation(format!(
            "Embedding dimension mismatch: expected {}, got {}",
            dim,
            embedding.len()
        )));
    }
    Ok(())
}

/// Euclidean norm, accumulated in f64
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

/// Scale a vector to unit length.
///
/// Returns the vector and whether it was a (near-)zero vector. Zero vectors
/// come back unchanged; the caller decides how to report them.
pub fn l2_normalize(v: &[f32]) -> (Vec<f32>, bool) {
    let norm = l2_norm(v);
    if norm < NORM_EPSILON {
        return (v.to_vec(), true);
    }
    (v.iter().map(|x| (*x as f64 / norm) as f32).collect(), false)
}

/// Cosine similarity, 0.0 when either side has zero magnitude
///
/// Both slices must have the same length; callers validate dimensions first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    if mag_a < NORM_EPSILON * NORM_EPSILON || mag_b < NORM_EPSILON * NORM_EPSILON {
        return 0.0;
    }

    (dot / (mag_a.sqrt() * mag_b.sqrt())) as f32
}
