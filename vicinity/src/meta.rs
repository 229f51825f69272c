//! Collection schema: column metas, data types and tuning parameters.
//!
//! Schema evolution is limited to adding or removing index columns; any
//! change to an existing column's identity fields is rejected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload type of a vector column or query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataType {
    #[default]
    Undefined,
    VectorFp32,
    VectorFp16,
    VectorInt8,
    VectorInt4,
}

impl DataType {
    /// Bytes one element occupies inside a packed vector, times 2 for the
    /// half-byte int4 case handled by [`DataType::vector_size`].
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Undefined => 0,
            DataType::VectorFp32 => 4,
            DataType::VectorFp16 => 2,
            DataType::VectorInt8 => 1,
            DataType::VectorInt4 => 1,
        }
    }

    /// Byte length of a packed vector of `dimension` elements.
    pub fn vector_size(&self, dimension: u32) -> usize {
        match self {
            DataType::VectorInt4 => (dimension as usize + 1) / 2,
            _ => self.element_size() * dimension as usize,
        }
    }
}

/// Quantization applied to fp32 input before indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuantizeType {
    #[default]
    Undefined,
    VectorFp16,
    VectorInt8,
    VectorInt4,
}

/// Graph engine backing a column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EngineType {
    Hnsw,
    #[default]
    Oswg,
}

/// Distance measure of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MetricType {
    #[default]
    SquaredEuclidean,
    InnerProduct,
}

/// Index structure of a column. Only graph indices exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexType {
    #[default]
    Graph,
}

/// Free-form string parameters with typed accessors for the recognized keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnParams(HashMap<String, String>);

impl ColumnParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn metric_type(&self) -> MetricType {
        match self.get("metric_type") {
            Some("InnerProduct") => MetricType::InnerProduct,
            _ => MetricType::SquaredEuclidean,
        }
    }

    pub fn engine(&self) -> EngineType {
        match self.get("engine") {
            Some("HNSW") => EngineType::Hnsw,
            _ => EngineType::Oswg,
        }
    }

    pub fn quantize_type(&self) -> QuantizeType {
        match self.get("quantize_type") {
            Some("DT_VECTOR_FP16") => QuantizeType::VectorFp16,
            Some("DT_VECTOR_INT8") => QuantizeType::VectorInt8,
            Some("DT_VECTOR_INT4") => QuantizeType::VectorInt4,
            _ => QuantizeType::Undefined,
        }
    }

    pub fn max_neighbor_count(&self) -> Option<u32> {
        self.get_parsed("max_neighbor_count")
    }

    pub fn ef_construction(&self) -> Option<u32> {
        self.get_parsed("ef_construction")
    }

    pub fn ef_search(&self) -> u32 {
        self.get_parsed("ef_search").unwrap_or(200)
    }

    pub fn chunk_size(&self) -> u64 {
        self.get_parsed("chunk_size").unwrap_or(64 * 1024 * 1024)
    }

    pub fn max_scan_ratio(&self) -> Option<f32> {
        self.get_parsed("max_scan_ratio")
    }

    pub fn visit_bloomfilter_enable(&self) -> bool {
        self.get_parsed("visit_bloomfilter_enable").unwrap_or(false)
    }
}

/// Meta of one index column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub index_type: IndexType,
    pub data_type: DataType,
    pub dimension: u32,
    pub parameters: ColumnParams,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: DataType, dimension: u32) -> Self {
        Self {
            name: name.into(),
            index_type: IndexType::Graph,
            data_type,
            dimension,
            parameters: ColumnParams::new(),
        }
    }

    /// Rejects any change to an existing column's identity fields.
    pub fn check_unchanged(&self, other: &ColumnMeta) -> Result<()> {
        if self.name != other.name {
            return Err(Error::UpdateColumnNameField);
        }
        if self.index_type != other.index_type {
            return Err(Error::UpdateIndexTypeField);
        }
        if self.data_type != other.data_type {
            return Err(Error::UpdateDataTypeField);
        }
        if self.dimension != other.dimension || self.parameters != other.parameters {
            return Err(Error::UpdateParametersField);
        }
        Ok(())
    }
}

/// Meta of one collection: identity, schema revision and columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub revision: u32,
    pub forward_columns: Vec<String>,
    pub index_columns: Vec<ColumnMeta>,
    /// Source repository this collection mirrors, if any.
    pub repository: Option<String>,
    /// Doc cap that triggers segment rotation; `0` means unlimited.
    pub max_docs_per_segment: u64,
}

impl CollectionMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.index_columns.iter().find(|c| c.name == name)
    }

    /// Effective rotation cap; `0` is mapped to unlimited.
    pub fn segment_doc_cap(&self) -> u64 {
        if self.max_docs_per_segment == 0 {
            u64::MAX
        } else {
            self.max_docs_per_segment
        }
    }

    /// Splits `new` against `self` into added and removed columns, rejecting
    /// in-place column mutations.
    pub fn diff_columns<'a>(
        &'a self,
        new: &'a CollectionMeta,
    ) -> Result<(Vec<&'a ColumnMeta>, Vec<&'a ColumnMeta>)> {
        if new.repository != self.repository {
            return Err(Error::UpdateRepositoryTypeField);
        }

        let mut added = Vec::new();
        for column in &new.index_columns {
            match self.column(&column.name) {
                Some(current) => current.check_unchanged(column)?,
                None => added.push(column),
            }
        }

        let removed = self
            .index_columns
            .iter()
            .filter(|c| new.column(&c.name).is_none())
            .collect();

        Ok((added, removed))
    }
}
