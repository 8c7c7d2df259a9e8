//! Safetensors-backed pretrained weight loading.

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensorError};
use thiserror::Error;

#[cfg(feature = "memory-mapped")]
type Backing = memmap2::Mmap;
#[cfg(not(feature = "memory-mapped"))]
type Backing = Vec<u8>;

#[derive(Debug)]
pub struct WeightStore {
    bytes: Backing,
}

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("invalid tensor byte length for {name}: got {bytes}, expected multiple of {elem_size}")]
    InvalidByteLen {
        name: String,
        bytes: usize,
        elem_size: usize,
    },
    #[error("tensor {name}: {elements} elements do not fill header shape {shape:?}")]
    ElementCount {
        name: String,
        shape: Vec<usize>,
        elements: usize,
    },
    #[error("tensor {name} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

impl WeightStore {
    #[cfg(feature = "memory-mapped")]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: read-only file mapping for immutable tensor access.
        let bytes = unsafe { memmap2::MmapOptions::new().map(&file)? };
        Ok(Self { bytes })
    }

    #[cfg(not(feature = "memory-mapped"))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        Ok(Self {
            bytes: std::fs::read(path)?,
        })
    }

    pub fn contains(&self, name: &str) -> Result<bool, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.bytes[..])?;
        Ok(st.tensor(name).is_ok())
    }

    /// Reads a tensor as f32, widening BF16.
    pub fn tensor(&self, name: &str) -> Result<ArrayD<f32>, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.bytes[..])?;
        let tv = st.tensor(name)?;
        decode(name, tv.dtype(), tv.shape(), tv.data())
    }

    /// Reads a tensor and checks it has exactly `expected` shape.
    pub fn tensor_with_shape(
        &self,
        name: &str,
        expected: &[usize],
    ) -> Result<ArrayD<f32>, WeightError> {
        let t = self.tensor(name)?;
        if t.shape() != expected {
            return Err(WeightError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                got: t.shape().to_vec(),
            });
        }
        Ok(t)
    }
}

/// Converts a tensor's little-endian payload to f32, widening BF16.
fn decode(name: &str, dtype: Dtype, shape: &[usize], raw: &[u8]) -> Result<ArrayD<f32>, WeightError> {
    let data: Vec<f32> = match dtype {
        Dtype::F32 => {
            if raw.len() % 4 != 0 {
                return Err(WeightError::InvalidByteLen {
                    name: name.to_string(),
                    bytes: raw.len(),
                    elem_size: 4,
                });
            }
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        Dtype::BF16 => {
            if raw.len() % 2 != 0 {
                return Err(WeightError::InvalidByteLen {
                    name: name.to_string(),
                    bytes: raw.len(),
                    elem_size: 2,
                });
            }
            raw.chunks_exact(2)
                .map(|c| {
                    let bits = u16::from_le_bytes([c[0], c[1]]) as u32;
                    f32::from_bits(bits << 16)
                })
                .collect()
        }
        other => {
            return Err(WeightError::UnsupportedDtype {
                name: name.to_string(),
                dtype: other,
            });
        }
    };

    let elements = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| WeightError::ElementCount {
        name: name.to_string(),
        shape: shape.to_vec(),
        elements,
    })
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use safetensors::tensor::{serialize_to_file, Dtype, View};

    use super::{decode, WeightError, WeightStore};

    #[derive(Debug, Clone)]
    struct TestTensor {
        dtype: Dtype,
        shape: Vec<usize>,
        data: Vec<u8>,
    }

    impl View for TestTensor {
        fn dtype(&self) -> Dtype {
            self.dtype
        }

        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.data)
        }

        fn data_len(&self) -> usize {
            self.data.len()
        }
    }

    #[test]
    fn loads_f32_and_bf16_tensors() {
        let f32_data = vec![1.0f32, 2.5, -3.0, 4.25];
        let f32_bytes: Vec<u8> = f32_data.iter().flat_map(|v| v.to_le_bytes()).collect();

        // BF16 for [1.0, -2.0] -> [0x3f80, 0xc000]
        let bf16_bytes: Vec<u8> = [0x3f80u16, 0xc000u16]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();

        let tensors = vec![
            (
                "a".to_string(),
                TestTensor {
                    dtype: Dtype::F32,
                    shape: vec![2, 2],
                    data: f32_bytes,
                },
            ),
            (
                "b".to_string(),
                TestTensor {
                    dtype: Dtype::BF16,
                    shape: vec![2],
                    data: bf16_bytes,
                },
            ),
        ];

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("basic.safetensors");
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path).expect("open");
        assert!(ws.contains("a").unwrap());
        assert!(!ws.contains("missing").unwrap());

        let a = ws.tensor_with_shape("a", &[2, 2]).expect("tensor a");
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), f32_data);

        let b = ws.tensor("b").expect("tensor b");
        assert_eq!(b.shape(), &[2]);
        assert!((b[[0]] - 1.0).abs() < 1e-6);
        assert!((b[[1]] + 2.0).abs() < 1e-6);

        assert!(matches!(
            ws.tensor_with_shape("a", &[4]),
            Err(WeightError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn payload_shorter_than_header_shape_is_a_shape_error() {
        let raw: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let err = decode("w", Dtype::F32, &[3], &raw).unwrap_err();
        assert!(matches!(
            &err,
            WeightError::ElementCount { shape, elements: 2, .. } if shape == &[3]
        ));

        let err = decode("b", Dtype::BF16, &[2, 2], &[0x80, 0x3f, 0x00, 0xc0]).unwrap_err();
        assert!(matches!(err, WeightError::ElementCount { elements: 2, .. }));
        assert!(matches!(
            decode("b", Dtype::BF16, &[1], &[0x80]),
            Err(WeightError::InvalidByteLen { elem_size: 2, .. })
        ));
    }
}
