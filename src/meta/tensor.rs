//! Tensor descriptors and payloads attached to frames and detections.
//!
//! A [`TensorSet`] is the unit keyed by pipeline stage-id: the named raw
//! buffers one stage produced or consumes. Payloads either own their bytes
//! or reference a [`PoolBlock`], in which case dropping the tensor recycles
//! the block instead of freeing it.

use crate::pool::PoolBlock;

/// Element type of a tensor buffer.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    pub fn elem_size(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }
}

enum TensorData {
    Owned(Vec<u8>),
    Pooled(PoolBlock),
}

/// One named raw buffer with shape and element type.
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: DataType,
    data: TensorData,
}

impl Tensor {
    pub fn from_vec(name: impl Into<String>, shape: Vec<i64>, dtype: DataType, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            data: TensorData::Owned(data),
        }
    }

    /// Wrap a pool block as tensor storage. The block is recycled, not
    /// freed, when the tensor is dropped.
    pub fn from_block(
        name: impl Into<String>,
        shape: Vec<i64>,
        dtype: DataType,
        block: PoolBlock,
    ) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            data: TensorData::Pooled(block),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            TensorData::Owned(v) => v,
            TensorData::Pooled(b) => b.as_slice(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data().len()
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.data, TensorData::Pooled(_))
    }

    /// Duplicate descriptor and payload. Pooled payloads are copied into a
    /// fresh block from the same pool so source and copy never alias.
    pub fn deep_copy(&self) -> Tensor {
        let data = match &self.data {
            TensorData::Owned(v) => TensorData::Owned(v.clone()),
            TensorData::Pooled(b) => {
                let mut fresh = b.pool().allocate();
                let len = b.len().min(fresh.len());
                fresh.as_mut_slice()[..len].copy_from_slice(&b.as_slice()[..len]);
                TensorData::Pooled(fresh)
            }
        };
        Tensor {
            name: self.name.clone(),
            shape: self.shape.clone(),
            dtype: self.dtype,
            data,
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.byte_len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// The named buffers one pipeline stage reads or wrote.
#[derive(Debug, Default)]
pub struct TensorSet {
    tensors: Vec<Tensor>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tensor: Tensor) {
        self.tensors.push(tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn deep_copy(&self) -> TensorSet {
        TensorSet {
            tensors: self.tensors.iter().map(Tensor::deep_copy).collect(),
        }
    }
}

impl FromIterator<Tensor> for TensorSet {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use anyhow::Result;

    #[test]
    fn deep_copy_of_pooled_tensor_takes_a_fresh_block() -> Result<()> {
        let pool = MemoryPool::new(4, 2)?;
        let mut block = pool.allocate();
        block.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);

        let tensor = Tensor::from_block("probe", vec![4], DataType::U8, block);
        let copy = tensor.deep_copy();

        assert_eq!(copy.data(), tensor.data());
        assert!(copy.is_pooled());
        // Source block and copy block are both checked out.
        assert_eq!(pool.free_blocks(), 0);

        drop(tensor);
        drop(copy);
        assert_eq!(pool.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn tensor_set_lookup_by_name() {
        let mut set = TensorSet::new();
        set.push(Tensor::from_vec("boxes", vec![10, 4], DataType::F32, vec![0; 160]));
        set.push(Tensor::from_vec("scores", vec![10], DataType::F32, vec![0; 40]));

        assert_eq!(set.len(), 2);
        assert!(set.get("scores").is_some());
        assert!(set.get("labels").is_none());
    }
}
