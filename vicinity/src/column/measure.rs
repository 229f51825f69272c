//! Distance measures over packed vector payloads.
//!
//! Vectors stay in their packed coding end to end; measures decode elements
//! on the fly. Inner product is served as a negated-dot distance internally
//! and normalized back to a similarity score on the result path.

use half::f16;

use crate::error::{Error, Result};
use crate::meta::{DataType, MetricType, QuantizeType};

/// Packed representation of an indexed or query vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorCoding {
    Fp32,
    Fp16,
    Int8,
    Int4,
    /// int8 with a leading per-vector f32 scale.
    ScaledInt8,
    /// packed int4 with a leading per-vector f32 scale.
    ScaledInt4,
}

impl VectorCoding {
    pub fn from_data_type(data_type: DataType) -> Result<VectorCoding> {
        match data_type {
            DataType::VectorFp32 => Ok(VectorCoding::Fp32),
            DataType::VectorFp16 => Ok(VectorCoding::Fp16),
            DataType::VectorInt8 => Ok(VectorCoding::Int8),
            DataType::VectorInt4 => Ok(VectorCoding::Int4),
            DataType::Undefined => Err(Error::Config("undefined vector data type".to_string())),
        }
    }

    pub fn from_quantize_type(quantize: QuantizeType) -> Option<VectorCoding> {
        match quantize {
            QuantizeType::Undefined => None,
            QuantizeType::VectorFp16 => Some(VectorCoding::Fp16),
            QuantizeType::VectorInt8 => Some(VectorCoding::ScaledInt8),
            QuantizeType::VectorInt4 => Some(VectorCoding::ScaledInt4),
        }
    }

    /// Byte length of a packed vector of `dimension` elements.
    pub fn vector_size(&self, dimension: u32) -> usize {
        match self {
            VectorCoding::Fp32 => dimension as usize * 4,
            VectorCoding::Fp16 => dimension as usize * 2,
            VectorCoding::Int8 => dimension as usize,
            VectorCoding::Int4 => (dimension as usize + 1) / 2,
            VectorCoding::ScaledInt8 => 4 + dimension as usize,
            VectorCoding::ScaledInt4 => 4 + (dimension as usize + 1) / 2,
        }
    }

    /// Unpacks a vector to f32 elements.
    pub fn decode(&self, dimension: u32, bytes: &[u8]) -> Vec<f32> {
        let dim = dimension as usize;
        let mut out = Vec::with_capacity(dim);
        match self {
            VectorCoding::Fp32 => {
                for chunk in bytes.chunks_exact(4).take(dim) {
                    out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
            VectorCoding::Fp16 => {
                for chunk in bytes.chunks_exact(2).take(dim) {
                    out.push(f16::from_le_bytes(chunk.try_into().unwrap()).to_f32());
                }
            }
            VectorCoding::Int8 => {
                for &b in bytes.iter().take(dim) {
                    out.push(b as i8 as f32);
                }
            }
            VectorCoding::Int4 => {
                decode_nibbles(&mut out, bytes, dim, 1.0);
            }
            VectorCoding::ScaledInt8 => {
                let scale = f32::from_le_bytes(bytes[..4].try_into().unwrap());
                for &b in bytes[4..].iter().take(dim) {
                    out.push(b as i8 as f32 * scale);
                }
            }
            VectorCoding::ScaledInt4 => {
                let scale = f32::from_le_bytes(bytes[..4].try_into().unwrap());
                decode_nibbles(&mut out, &bytes[4..], dim, scale);
            }
        }
        out
    }
}

fn decode_nibbles(out: &mut Vec<f32>, bytes: &[u8], dim: usize, scale: f32) {
    for i in 0..dim {
        let byte = bytes[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        out.push((nibble as i32 - 8) as f32 * scale);
    }
}

/// Scoring behavior of one column.
#[derive(Debug, Clone, Copy)]
pub struct Measure {
    metric: MetricType,
}

impl Measure {
    pub fn new(metric: MetricType) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Engine-internal distance; smaller is always closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            MetricType::SquaredEuclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum(),
            MetricType::InnerProduct => {
                -a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>()
            }
        }
    }

    /// Maps an internal distance to the user-visible score.
    pub fn normalize_score(&self, distance: f32) -> f32 {
        match self.metric {
            MetricType::SquaredEuclidean => distance,
            MetricType::InnerProduct => -distance,
        }
    }

    /// Larger scores rank first for similarity measures.
    pub fn reverse_sort(&self) -> bool {
        self.metric == MetricType::InnerProduct
    }

    /// Radius filter on a normalized score.
    pub fn within_radius(&self, score: f32, radius: f32) -> bool {
        match self.metric {
            MetricType::SquaredEuclidean => score < radius,
            MetricType::InnerProduct => score > radius,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_fp32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_fp32_decode() {
        let bytes = encode_fp32(&[1.0, -2.5, 3.25]);
        let decoded = VectorCoding::Fp32.decode(3, &bytes);
        assert_eq!(decoded, vec![1.0, -2.5, 3.25]);
    }

    #[test]
    fn test_squared_euclidean() {
        let measure = Measure::new(MetricType::SquaredEuclidean);
        let d = measure.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 25.0).abs() < 1e-6);
        assert_eq!(measure.normalize_score(d), d);
        assert!(!measure.reverse_sort());
        assert!(measure.within_radius(0.05, 0.1));
        assert!(!measure.within_radius(0.2, 0.1));
    }

    #[test]
    fn test_inner_product_negates() {
        let measure = Measure::new(MetricType::InnerProduct);
        let d = measure.distance(&[1.0, 2.0], &[3.0, 4.0]);
        assert!((d + 11.0).abs() < 1e-6);
        assert!((measure.normalize_score(d) - 11.0).abs() < 1e-6);
        assert!(measure.reverse_sort());
        assert!(measure.within_radius(11.0, 10.0));
    }

    #[test]
    fn test_vector_sizes() {
        assert_eq!(VectorCoding::Fp32.vector_size(16), 64);
        assert_eq!(VectorCoding::Fp16.vector_size(16), 32);
        assert_eq!(VectorCoding::ScaledInt8.vector_size(16), 20);
        assert_eq!(VectorCoding::ScaledInt4.vector_size(5), 7);
    }
}
