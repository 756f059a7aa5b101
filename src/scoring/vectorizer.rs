use sha2::{Digest, Sha256};

use super::{FeatureVector, FeatureVectorizer};

/// Signed feature hashing of tokens into a fixed number of buckets.
///
/// Each token lands in bucket `h mod dimension` with a sign taken from a
/// separate hash bit, then the vector is L2-normalised so record length does
/// not dominate the scores.
#[derive(Debug, Clone)]
pub struct HashingVectorizer {
    dimension: usize,
}

impl HashingVectorizer {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn vectorize(&self, tokens: &[String]) -> FeatureVector {
        let mut v = vec![0.0; self.dimension];
        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(head);
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl FeatureVectorizer for HashingVectorizer {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn transform(&self, token_sequences: &[Vec<String>]) -> Vec<FeatureVector> {
        token_sequences.iter().map(|t| self.vectorize(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_fixed_length_and_deterministic() {
        let v = HashingVectorizer::new(16);
        let a = v.vectorize(&toks("/login union select"));
        let b = v.vectorize(&toks("/login union select"));
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_norm() {
        let v = HashingVectorizer::new(32);
        let x = v.vectorize(&toks("get /index.html http 1.1"));
        let norm = x.iter().map(|c| c * c).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_tokens_give_zero_vector() {
        let v = HashingVectorizer::new(8);
        assert_eq!(v.vectorize(&[]), vec![0.0; 8]);
    }

    #[test]
    fn test_transform_batch() {
        let v = HashingVectorizer::new(8);
        let out = v.transform(&[toks("a"), toks("b c")]);
        assert_eq!(out.len(), 2);
        assert_eq!(v.dimension(), 8);
    }
}
