//! Segment lifecycle, recovery and durability behavior.

use std::sync::Arc;

use tempfile::TempDir;
use vicinity::segment::SegmentState;
use vicinity::{
    Collection, CollectionMeta, ColumnMeta, DataType, OperationType, QueryParams, Record,
    ReadOptions, TaskScheduler, DOC_ID_INCREASE_COUNT,
};

fn encode_fp32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn uniform_vector(value: f32, dim: usize) -> Vec<u8> {
    encode_fp32(&vec![value; dim])
}

fn face_schema(max_docs_per_segment: u64) -> CollectionMeta {
    let mut schema = CollectionMeta::new("lifecycle");
    schema.revision = 1;
    schema.max_docs_per_segment = max_docs_per_segment;
    schema
        .index_columns
        .push(ColumnMeta::new("face", DataType::VectorFp32, 8));
    schema
}

fn make_record(pk: u64, lsn: u64) -> Record {
    Record {
        operation_type: OperationType::Insert,
        primary_key: pk,
        revision: 1,
        lsn,
        lsn_context: format!("ctx{lsn}").into_bytes(),
        timestamp: pk,
        forward_data: format!("fw{pk}").into_bytes(),
        column_datas: vec![vicinity::ColumnData {
            column_name: "face".to_string(),
            data_type: DataType::VectorFp32,
            dimension: 8,
            data: uniform_vector(pk as f32, 8),
        }],
        ..Default::default()
    }
}

fn open_collection(
    dir: &TempDir,
    schema: CollectionMeta,
    create_new: bool,
) -> Arc<Collection> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let scheduler = Arc::new(TaskScheduler::new(4));
    let name = schema.name.clone();
    Collection::open(
        &name,
        dir.path(),
        schema,
        2,
        scheduler,
        ReadOptions {
            use_mmap: true,
            create_new,
        },
    )
    .unwrap()
}

fn wait_for_dump(collection: &Collection) {
    while collection.is_dumping() {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

#[test]
fn test_rotation_leaves_doc_id_gaps() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(100), true);

    let mut pk = 0u64;
    let mut fill = |collection: &Arc<Collection>, count: u64| {
        for _ in 0..count {
            collection.insert_record(&make_record(pk, pk)).unwrap();
            pk += 1;
        }
    };

    fill(&collection, 100);
    wait_for_dump(&collection);
    fill(&collection, 100);
    wait_for_dump(&collection);
    fill(&collection, 50);

    let version = collection.current_version();
    assert_eq!(version.len(), 2);

    let stats = collection.get_stats();
    let mut metas = stats.segment_stats.clone();
    metas.sort_by_key(|m| m.min_doc_id);
    assert_eq!(metas.len(), 3);
    for pair in metas.windows(2) {
        assert!(
            pair[1].min_doc_id >= pair[0].max_doc_id + DOC_ID_INCREASE_COUNT,
            "gap violated: {} .. {}",
            pair[0].max_doc_id,
            pair[1].min_doc_id
        );
        assert!(pair[0].max_doc_id < pair[1].min_doc_id);
    }
    assert_eq!(stats.total_doc_count, 250);

    // Rows from every segment stay reachable.
    let params = QueryParams {
        topk: 5,
        data_type: DataType::VectorFp32,
        dimension: 8,
        ..Default::default()
    };
    for probe in [13u64, 113, 213] {
        let results = collection
            .knn_search("face", &uniform_vector(probe as f32, 8), &params)
            .unwrap();
        assert_eq!(results[0].primary_key, probe);
    }

    collection.close().unwrap();
}

#[test]
fn test_dumped_container_passes_validation() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);
    for pk in 0..120u64 {
        collection.insert_record(&make_record(pk, pk)).unwrap();
    }
    collection.dump().unwrap();
    wait_for_dump(&collection);

    let version = collection.current_version();
    assert_eq!(version.len(), 1);
    let segment_id = version[0].segment_id;

    // The packed container must pass all CRC checks.
    let path = dir
        .path()
        .join("lifecycle")
        .join(format!("data.seg.{segment_id}"));
    let image = std::fs::read(&path).unwrap();
    vicinity::format::Unpacker::unpack(&image, true).unwrap();

    collection.close().unwrap();
}

#[test]
fn test_max_docs_zero_never_dumps() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);
    for pk in 0..500u64 {
        collection.insert_record(&make_record(pk, pk)).unwrap();
    }
    assert!(!collection.is_dumping());
    assert!(collection.current_version().is_empty());
    collection.close().unwrap();
}

#[test]
fn test_latest_lsn_stops_at_gap() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);

    for i in 0..=99u64 {
        collection.insert_record(&make_record(i, i)).unwrap();
    }
    for i in 101..=200u64 {
        collection.insert_record(&make_record(i, i)).unwrap();
    }

    let (lsn, ctx) = collection.get_latest_lsn().unwrap();
    assert_eq!(lsn, 99);
    assert_eq!(ctx, b"ctx99");
    collection.close().unwrap();
}

#[test]
fn test_crash_recovery_after_flush() {
    let dir = TempDir::new().unwrap();
    {
        let collection = open_collection(&dir, face_schema(0), true);
        for pk in 0..1000u64 {
            collection.insert_record(&make_record(pk, pk)).unwrap();
        }
        collection.flush().unwrap();
        // Crash: no close, no drops.
        std::mem::forget(collection);
    }

    let collection = open_collection(&dir, face_schema(0), false);
    let stats = collection.get_stats();
    assert_eq!(stats.total_doc_count, 1000);

    let writing: Vec<_> = stats
        .segment_stats
        .iter()
        .filter(|m| m.segment_state() == SegmentState::Writing)
        .collect();
    assert_eq!(writing.len(), 1);
    assert_eq!(writing[0].doc_count, 1000);

    for pk in (0..1000u64).step_by(97) {
        assert!(collection.has_record(pk));
        let result = collection.kv_search(pk).unwrap();
        assert_eq!(result.primary_key, pk);
        assert_eq!(result.forward_data, format!("fw{pk}").into_bytes());
    }

    // Recovered state serves searches again.
    let params = QueryParams {
        topk: 3,
        data_type: DataType::VectorFp32,
        dimension: 8,
        ..Default::default()
    };
    let results = collection
        .knn_search("face", &uniform_vector(700.0, 8), &params)
        .unwrap();
    assert_eq!(results[0].primary_key, 700);

    collection.close().unwrap();
}

#[test]
fn test_reopen_after_dump_keeps_persist_segments() {
    let dir = TempDir::new().unwrap();
    {
        let collection = open_collection(&dir, face_schema(0), true);
        for pk in 0..150u64 {
            collection.insert_record(&make_record(pk, pk)).unwrap();
        }
        collection.dump().unwrap();
        wait_for_dump(&collection);
        collection.flush().unwrap();
        collection.close().unwrap();
    }

    let collection = open_collection(&dir, face_schema(0), false);
    assert_eq!(collection.current_version().len(), 1);

    let params = QueryParams {
        topk: 3,
        data_type: DataType::VectorFp32,
        dimension: 8,
        ..Default::default()
    };
    let results = collection
        .knn_search("face", &uniform_vector(42.0, 8), &params)
        .unwrap();
    assert_eq!(results[0].primary_key, 42);
    assert_eq!(collection.kv_search(42).unwrap().primary_key, 42);

    collection.close().unwrap();
}

#[test]
fn test_recovery_repairs_interrupted_rotation() {
    let dir = TempDir::new().unwrap();
    {
        let collection = open_collection(&dir, face_schema(0), true);
        for pk in 0..40u64 {
            collection.insert_record(&make_record(pk, pk)).unwrap();
        }
        collection.flush().unwrap();
        collection.close().unwrap();
    }

    // Recreate the on-disk shape of a rotation interrupted between its two
    // manifest writes: segment 0 already DUMPING, segment 1 allocated but
    // still CREATED, with its snapshot files flushed on disk.
    let collection_dir = dir.path().join("lifecycle");
    let reopen = ReadOptions {
        use_mmap: true,
        create_new: false,
    };
    let old_max_doc_id;
    {
        let manager =
            vicinity::version::VersionManager::open("lifecycle", &collection_dir, reopen).unwrap();
        let mut writing = manager.get_segment_metas(SegmentState::Writing).unwrap()[0];
        old_max_doc_id = writing.max_doc_id;
        manager.alloc_segment_meta().unwrap();
        writing.set_state(SegmentState::Dumping);
        manager.update_segment_meta(&writing).unwrap();
        manager.flush().unwrap();
        manager.close().unwrap();

        let create = ReadOptions {
            use_mmap: true,
            create_new: true,
        };
        let forward = vicinity::column::ForwardIndexer::open(
            &collection_dir,
            1,
            old_max_doc_id + DOC_ID_INCREASE_COUNT,
            create,
        )
        .unwrap();
        forward.flush().unwrap();
        forward.close().unwrap();
        let column = vicinity::column::ColumnIndexer::open(
            &collection_dir,
            1,
            &face_schema(0).index_columns[0],
            1,
            create,
        )
        .unwrap();
        column.flush().unwrap();
        column.close().unwrap();
    }

    let collection = open_collection(&dir, face_schema(0), false);
    wait_for_dump(&collection);

    // The manifest holds exactly one writing segment again, with the doc-id
    // gap intact, and the interrupted dump ran to completion.
    let stats = collection.get_stats();
    let writing: Vec<_> = stats
        .segment_stats
        .iter()
        .filter(|m| m.segment_state() == SegmentState::Writing)
        .collect();
    assert_eq!(writing.len(), 1);
    assert_eq!(writing[0].segment_id, 1);
    assert!(writing[0].min_doc_id >= old_max_doc_id + DOC_ID_INCREASE_COUNT);
    assert_eq!(collection.current_version().len(), 1);

    // Rows from before the rotation stay reachable, new writes land in the
    // repaired segment.
    assert_eq!(collection.kv_search(17).unwrap().primary_key, 17);
    collection.insert_record(&make_record(100, 100)).unwrap();
    assert!(collection.has_record(100));

    collection.close().unwrap();
}

#[test]
fn test_schema_update_during_dump_is_rejected() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);
    for pk in 0..200u64 {
        collection.insert_record(&make_record(pk, pk)).unwrap();
    }
    collection.dump().unwrap();

    let mut new_schema = face_schema(0);
    new_schema.revision = 2;
    new_schema
        .index_columns
        .push(ColumnMeta::new("scene", DataType::VectorFp32, 8));
    let outcome = collection.update_schema(new_schema.clone());
    if collection.is_dumping() {
        assert!(matches!(outcome, Err(vicinity::Error::Status(_))));
    }
    wait_for_dump(&collection);

    // Once the dump settles the update applies to every segment.
    if outcome.is_err() {
        collection.update_schema(new_schema).unwrap();
    }
    let mut record = make_record(500, 500);
    record.column_datas.push(vicinity::ColumnData {
        column_name: "scene".to_string(),
        data_type: DataType::VectorFp32,
        dimension: 8,
        data: uniform_vector(500.0, 8),
    });
    collection.insert_record(&record).unwrap();

    let params = QueryParams {
        topk: 3,
        data_type: DataType::VectorFp32,
        dimension: 8,
        ..Default::default()
    };
    let results = collection
        .knn_search("scene", &uniform_vector(500.0, 8), &params)
        .unwrap();
    assert_eq!(results[0].primary_key, 500);

    collection.close().unwrap();
}

#[test]
fn test_create_existing_collection_fails() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);
    collection.close().unwrap();

    let scheduler = Arc::new(TaskScheduler::new(2));
    let error = Collection::open(
        "lifecycle",
        dir.path(),
        face_schema(0),
        2,
        scheduler.clone(),
        ReadOptions {
            use_mmap: true,
            create_new: true,
        },
    )
    .unwrap_err();
    assert!(matches!(error, vicinity::Error::DuplicateCollection(_)));

    let error = Collection::open(
        "missing",
        dir.path(),
        face_schema(0),
        2,
        scheduler,
        ReadOptions {
            use_mmap: true,
            create_new: false,
        },
    )
    .unwrap_err();
    assert!(matches!(error, vicinity::Error::InvalidIndexDataFormat(_)));
}

#[test]
fn test_close_and_cleanup_removes_directory() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(0), true);
    collection.insert_record(&make_record(1, 1)).unwrap();
    collection.close_and_cleanup().unwrap();
    assert!(!dir.path().join("lifecycle").exists());
}
