//! Quantization reformer: converts fp32 input vectors into a lower
//! precision coding for indexing and queries. Integer codings carry a
//! per-vector scale prefix so scores decode back into the input range.

use half::f16;

use crate::error::{Error, Result};
use crate::meta::QuantizeType;

use super::measure::VectorCoding;

pub struct Reformer {
    coding: VectorCoding,
}

impl Reformer {
    /// Returns a reformer when `quantize` asks for one.
    pub fn from_quantize_type(quantize: QuantizeType) -> Option<Reformer> {
        VectorCoding::from_quantize_type(quantize).map(|coding| Reformer { coding })
    }

    pub fn output_coding(&self) -> VectorCoding {
        self.coding
    }

    /// Encodes an fp32 payload into the reformer's coding.
    pub fn reform(&self, dimension: u32, input: &[u8]) -> Result<Vec<u8>> {
        let expected = dimension as usize * 4;
        if input.len() != expected {
            return Err(Error::InvalidRecord(format!(
                "reform input of {} bytes, expected {expected}",
                input.len()
            )));
        }
        let values = VectorCoding::Fp32.decode(dimension, input);

        let out = match self.coding {
            VectorCoding::Fp16 => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect(),
            VectorCoding::ScaledInt8 => {
                let scale = scale_for(&values, 127.0);
                let mut out = Vec::with_capacity(4 + values.len());
                out.extend_from_slice(&scale.to_le_bytes());
                for v in &values {
                    out.push((v / scale).round().clamp(-127.0, 127.0) as i8 as u8);
                }
                out
            }
            VectorCoding::ScaledInt4 => {
                let scale = scale_for(&values, 7.0);
                let mut out = Vec::with_capacity(4 + (values.len() + 1) / 2);
                out.extend_from_slice(&scale.to_le_bytes());
                let mut byte = 0u8;
                for (i, v) in values.iter().enumerate() {
                    let level = (v / scale).round().clamp(-7.0, 7.0) as i32 + 8;
                    if i % 2 == 0 {
                        byte = level as u8;
                    } else {
                        byte |= (level as u8) << 4;
                        out.push(byte);
                    }
                }
                if values.len() % 2 == 1 {
                    // Pad the trailing nibble with the zero level.
                    out.push(byte | (8 << 4));
                }
                out
            }
            _ => {
                return Err(Error::Config("unsupported reform target".to_string()));
            }
        };
        Ok(out)
    }
}

fn scale_for(values: &[f32], levels: f32) -> f32 {
    let max_abs = values.iter().fold(0f32, |acc, v| acc.max(v.abs()));
    if max_abs == 0.0 {
        1.0
    } else {
        max_abs / levels
    }
}
