//! Graph engine over packed vectors.
//!
//! One core backs both engine flavors: points buffer into a flat store and
//! the HNSW map is rebuilt once enough inserts accumulate, with a linear
//! scan as the brute-force path. `Oswg` (the default) additionally supports
//! in-place removal and explicit optimization; `Hnsw` accepts search-time
//! filters instead and treats removal as a successful no-op.

use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta::EngineType;
use crate::types::DocId;

use super::measure::{Measure, VectorCoding};

/// Inserts buffered between graph rebuilds.
const REBUILD_THRESHOLD: usize = 32;

/// Candidate filter installed by the caller; `true` drops the doc.
pub type SearchFilter<'a> = &'a (dyn Fn(DocId) -> bool + Sync);

#[derive(Clone)]
struct EnginePoint {
    bytes: Vec<u8>,
    dimension: u32,
    coding: VectorCoding,
    measure: Measure,
}

impl Point for EnginePoint {
    fn distance(&self, other: &Self) -> f32 {
        let a = self.coding.decode(self.dimension, &self.bytes);
        let b = other.coding.decode(other.dimension, &other.bytes);
        self.measure.distance(&a, &b)
    }
}

/// Serialized engine state, written into column snapshots and dump blocks.
#[derive(Serialize, Deserialize)]
struct EngineImage {
    keys: Vec<DocId>,
    vectors: Vec<Vec<u8>>,
}

struct EngineCore {
    keys: Vec<DocId>,
    points: Vec<EnginePoint>,
    map: Option<HnswMap<EnginePoint, u64>>,
    built_size: usize,
}

/// One column's vector engine.
pub struct VectorEngine {
    engine_type: EngineType,
    coding: VectorCoding,
    dimension: u32,
    measure: Measure,
    ef_construction: usize,
    ef_search: usize,
    core: RwLock<EngineCore>,
}

impl VectorEngine {
    pub fn new(
        engine_type: EngineType,
        coding: VectorCoding,
        dimension: u32,
        measure: Measure,
        ef_construction: Option<u32>,
        ef_search: u32,
    ) -> Self {
        Self {
            engine_type,
            coding,
            dimension,
            measure,
            ef_construction: ef_construction.unwrap_or(100) as usize,
            ef_search: ef_search as usize,
            core: RwLock::new(EngineCore {
                keys: Vec::new(),
                points: Vec::new(),
                map: None,
                built_size: 0,
            }),
        }
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    pub fn measure(&self) -> &Measure {
        &self.measure
    }

    pub fn doc_count(&self) -> usize {
        self.core.read().keys.len()
    }

    fn make_point(&self, bytes: Vec<u8>) -> EnginePoint {
        EnginePoint {
            bytes,
            dimension: self.dimension,
            coding: self.coding,
            measure: self.measure,
        }
    }

    /// Adds a packed vector under `doc_id`.
    pub fn add(&self, doc_id: DocId, bytes: Vec<u8>) -> Result<()> {
        let expected = self.coding.vector_size(self.dimension);
        if bytes.len() != expected {
            return Err(Error::InvalidRecord(format!(
                "vector of {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let point = self.make_point(bytes);
        let mut core = self.core.write();
        core.keys.push(doc_id);
        core.points.push(point);

        let need_build = core.map.is_none()
            || core.keys.len() <= REBUILD_THRESHOLD
            || core.keys.len() - core.built_size >= REBUILD_THRESHOLD;
        if need_build {
            self.rebuild(&mut core);
        }
        Ok(())
    }

    /// Drops a doc from the flat store and rebuilds. Only the OSWG flavor
    /// supports this; HNSW reports success without acting.
    pub fn remove(&self, doc_id: DocId) -> Result<()> {
        if self.engine_type != EngineType::Oswg {
            return Ok(());
        }
        let mut core = self.core.write();
        if let Some(pos) = core.keys.iter().position(|&k| k == doc_id) {
            core.keys.swap_remove(pos);
            core.points.swap_remove(pos);
            self.rebuild(&mut core);
        }
        Ok(())
    }

    /// Forces a graph rebuild over the current flat store (OSWG only).
    pub fn optimize(&self) -> Result<()> {
        if self.engine_type != EngineType::Oswg {
            return Ok(());
        }
        let mut core = self.core.write();
        self.rebuild(&mut core);
        Ok(())
    }

    fn rebuild(&self, core: &mut EngineCore) {
        if core.points.is_empty() {
            core.map = None;
            core.built_size = 0;
            return;
        }
        let map = Builder::default()
            .ef_construction(self.ef_construction)
            .ef_search(self.ef_search.max(REBUILD_THRESHOLD))
            .build(core.points.clone(), core.keys.clone());
        core.built_size = core.keys.len();
        core.map = Some(map);
    }

    /// Graph search for the `topk` nearest docs; raw internal distances.
    pub fn search(
        &self,
        search: &mut Search,
        query: &[u8],
        topk: usize,
        filter: Option<SearchFilter<'_>>,
    ) -> Result<Vec<(DocId, f32)>> {
        let query = self.make_point(query.to_vec());
        let core = self.core.read();
        let map = match &core.map {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::with_capacity(topk);
        for item in map.search(&query, search) {
            let doc_id = *item.value;
            if let Some(filter) = filter {
                if filter(doc_id) {
                    continue;
                }
            }
            out.push((doc_id, item.distance));
            if out.len() >= topk {
                break;
            }
        }
        Ok(out)
    }

    /// Brute-force scan over the flat store.
    pub fn search_bf(
        &self,
        query: &[u8],
        topk: usize,
        filter: Option<SearchFilter<'_>>,
    ) -> Result<Vec<(DocId, f32)>> {
        let query = self.make_point(query.to_vec());
        let core = self.core.read();

        let mut hits: Vec<(DocId, f32)> = Vec::new();
        for (key, point) in core.keys.iter().zip(core.points.iter()) {
            if let Some(filter) = filter {
                if filter(*key) {
                    continue;
                }
            }
            hits.push((*key, query.distance(point)));
        }
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(topk);
        Ok(hits)
    }

    /// Serializes the flat store; the graph is rebuilt on load.
    pub fn image(&self) -> Result<Vec<u8>> {
        let core = self.core.read();
        let image = EngineImage {
            keys: core.keys.clone(),
            vectors: core.points.iter().map(|p| p.bytes.clone()).collect(),
        };
        bincode::serialize(&image).map_err(|e| Error::WriteData(format!("engine image: {e}")))
    }

    pub fn load_image(&self, bytes: &[u8]) -> Result<()> {
        let image: EngineImage = bincode::deserialize(bytes)
            .map_err(|e| Error::ReadData(format!("engine image: {e}")))?;
        if image.keys.len() != image.vectors.len() {
            return Err(Error::ReadData("inconsistent engine image".to_string()));
        }
        let mut core = self.core.write();
        core.keys = image.keys;
        core.points = image
            .vectors
            .into_iter()
            .map(|bytes| self.make_point(bytes))
            .collect();
        self.rebuild(&mut core);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetricType;

    fn encode_fp32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn make_engine(engine_type: EngineType) -> VectorEngine {
        VectorEngine::new(
            engine_type,
            VectorCoding::Fp32,
            4,
            Measure::new(MetricType::SquaredEuclidean),
            None,
            200,
        )
    }

    fn fill(engine: &VectorEngine, n: u64) {
        for i in 0..n {
            engine
                .add(i, encode_fp32(&[i as f32, 0.0, 0.0, 0.0]))
                .unwrap();
        }
    }

    #[test]
    fn test_add_and_search() {
        let engine = make_engine(EngineType::Oswg);
        fill(&engine, 100);
        assert_eq!(engine.doc_count(), 100);

        let mut search = Search::default();
        let hits = engine
            .search(&mut search, &encode_fp32(&[42.0, 0.0, 0.0, 0.0]), 3, None)
            .unwrap();
        assert_eq!(hits[0].0, 42);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_search_bf_matches_exact() {
        let engine = make_engine(EngineType::Oswg);
        fill(&engine, 100);
        let hits = engine
            .search_bf(&encode_fp32(&[7.2, 0.0, 0.0, 0.0]), 2, None)
            .unwrap();
        assert_eq!(hits[0].0, 7);
        assert_eq!(hits[1].0, 8);
    }

    #[test]
    fn test_filter_drops_candidates() {
        let engine = make_engine(EngineType::Hnsw);
        fill(&engine, 50);
        let filter = |doc_id: DocId| doc_id == 10;
        let mut search = Search::default();
        let hits = engine
            .search(
                &mut search,
                &encode_fp32(&[10.0, 0.0, 0.0, 0.0]),
                3,
                Some(&filter),
            )
            .unwrap();
        assert!(hits.iter().all(|(doc_id, _)| *doc_id != 10));
    }

    #[test]
    fn test_remove_policy() {
        let oswg = make_engine(EngineType::Oswg);
        fill(&oswg, 40);
        oswg.remove(5).unwrap();
        assert_eq!(oswg.doc_count(), 39);
        let hits = oswg
            .search_bf(&encode_fp32(&[5.0, 0.0, 0.0, 0.0]), 1, None)
            .unwrap();
        assert_ne!(hits[0].0, 5);

        let hnsw = make_engine(EngineType::Hnsw);
        fill(&hnsw, 40);
        hnsw.remove(5).unwrap();
        assert_eq!(hnsw.doc_count(), 40);
    }

    #[test]
    fn test_image_roundtrip() {
        let engine = make_engine(EngineType::Oswg);
        fill(&engine, 64);
        let image = engine.image().unwrap();

        let restored = make_engine(EngineType::Oswg);
        restored.load_image(&image).unwrap();
        assert_eq!(restored.doc_count(), 64);

        let mut search = Search::default();
        let hits = restored
            .search(&mut search, &encode_fp32(&[3.0, 0.0, 0.0, 0.0]), 1, None)
            .unwrap();
        assert_eq!(hits[0].0, 3);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let engine = make_engine(EngineType::Oswg);
        assert!(engine.add(0, encode_fp32(&[1.0, 2.0])).is_err());
    }
}
