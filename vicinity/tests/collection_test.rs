//! End-to-end write/query behavior of a collection.

use std::sync::Arc;

use tempfile::TempDir;
use vicinity::{
    Collection, CollectionMeta, ColumnMeta, DataType, OperationType, QueryParams, Record,
    ReadOptions, TaskScheduler, INVALID_KEY,
};

fn encode_fp32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn uniform_vector(value: f32, dim: usize) -> Vec<u8> {
    encode_fp32(&vec![value; dim])
}

fn face_schema() -> CollectionMeta {
    let mut schema = CollectionMeta::new("faces");
    schema.revision = 1;
    schema.forward_columns = vec!["payload".to_string()];
    schema
        .index_columns
        .push(ColumnMeta::new("face", DataType::VectorFp32, 16));
    schema
}

fn make_record(pk: u64, vector: Vec<u8>) -> Record {
    Record {
        operation_type: OperationType::Insert,
        primary_key: pk,
        revision: 1,
        lsn: pk,
        lsn_context: format!("ctx{pk}").into_bytes(),
        timestamp: pk,
        forward_data: format!("payload{pk}").into_bytes(),
        column_datas: vec![vicinity::ColumnData {
            column_name: "face".to_string(),
            data_type: DataType::VectorFp32,
            dimension: 16,
            data: vector,
        }],
        ..Default::default()
    }
}

fn face_params(topk: u32) -> QueryParams {
    QueryParams {
        topk,
        data_type: DataType::VectorFp32,
        dimension: 16,
        ..Default::default()
    }
}

fn open_collection(
    dir: &TempDir,
    schema: CollectionMeta,
    create_new: bool,
) -> Arc<Collection> {
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
fn test_insert_query_roundtrip() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    for i in 0..1000u64 {
        collection
            .insert_record(&make_record(i, uniform_vector(i as f32, 16)))
            .unwrap();
    }

    for j in (0..1000u64).step_by(83) {
        let results = collection
            .knn_search("face", &uniform_vector(j as f32, 16), &face_params(10))
            .unwrap();
        assert_eq!(results[0].primary_key, j, "query {j} missed");
        assert!(results[0].score.abs() < 1e-3);
        assert_eq!(results[0].forward_data, format!("payload{j}").into_bytes());
    }

    // A tight radius keeps only the exact hit.
    let mut params = face_params(10);
    params.radius = 0.1;
    let results = collection
        .knn_search("face", &uniform_vector(500.0, 16), &params)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].primary_key, 500);

    collection.close().unwrap();
}

#[test]
fn test_delete_after_dump_empties_results() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    for i in 0..300u64 {
        collection
            .insert_record(&make_record(i, uniform_vector(i as f32, 16)))
            .unwrap();
    }
    collection.dump().unwrap();
    wait_for_dump(&collection);
    assert_eq!(collection.current_version().len(), 1);

    for i in 0..300u64 {
        collection.delete_record(i).unwrap();
    }

    for i in (0..300u64).step_by(37) {
        let result = collection.kv_search(i).unwrap();
        assert_eq!(result.primary_key, INVALID_KEY);
        assert!(!collection.has_record(i));
    }
    let results = collection
        .knn_search("face", &uniform_vector(10.0, 16), &face_params(10))
        .unwrap();
    assert!(results.is_empty());

    collection.close().unwrap();
}

#[test]
fn test_duplicate_and_inexistent_keys() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    collection
        .insert_record(&make_record(1, uniform_vector(1.0, 16)))
        .unwrap();
    let error = collection
        .insert_record(&make_record(1, uniform_vector(2.0, 16)))
        .unwrap_err();
    assert!(matches!(error, vicinity::Error::DuplicateKey(1)));

    let error = collection.delete_record(99).unwrap_err();
    assert!(matches!(error, vicinity::Error::InexistentKey(99)));

    collection.close().unwrap();
}

#[test]
fn test_update_with_lsn_check() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    let mut record = make_record(5, uniform_vector(5.0, 16));
    record.lsn = 10;
    collection.insert_record(&record).unwrap();

    // A stale LSN is rejected when checking is on.
    let mut stale = make_record(5, uniform_vector(6.0, 16));
    stale.operation_type = OperationType::Update;
    stale.lsn = 10;
    stale.lsn_check = true;
    assert!(matches!(
        collection.update_record(&stale),
        Err(vicinity::Error::InvalidRecord(_))
    ));

    let mut fresh = make_record(5, uniform_vector(7.0, 16));
    fresh.operation_type = OperationType::Update;
    fresh.revision = 2;
    fresh.lsn = 11;
    fresh.lsn_check = true;
    collection.update_record(&fresh).unwrap();

    let result = collection.kv_search(5).unwrap();
    assert_eq!(result.revision, 2);
    assert_eq!(result.lsn, 11);

    let results = collection
        .knn_search("face", &uniform_vector(7.0, 16), &face_params(1))
        .unwrap();
    assert_eq!(results[0].primary_key, 5);

    collection.close().unwrap();
}

#[test]
fn test_write_records_routes_operations() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    let mut insert_a = make_record(1, uniform_vector(1.0, 16));
    insert_a.operation_type = OperationType::Insert;
    let mut insert_b = make_record(2, uniform_vector(2.0, 16));
    insert_b.operation_type = OperationType::Insert;
    let mut delete_a = make_record(1, Vec::new());
    delete_a.operation_type = OperationType::Delete;
    delete_a.column_datas.clear();

    collection
        .write_records(&[insert_a, insert_b, delete_a])
        .unwrap();
    assert!(!collection.has_record(1));
    assert!(collection.has_record(2));

    // A failing row surfaces after the batch still attempted every row.
    let mut dup = make_record(2, uniform_vector(2.0, 16));
    dup.operation_type = OperationType::Insert;
    let mut insert_c = make_record(3, uniform_vector(3.0, 16));
    insert_c.operation_type = OperationType::Insert;
    let error = collection.write_records(&[dup, insert_c]).unwrap_err();
    assert!(matches!(error, vicinity::Error::DuplicateKey(2)));
    assert!(collection.has_record(3));

    collection.close().unwrap();
}

#[test]
fn test_batch_knn_search() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    for i in 0..200u64 {
        collection
            .insert_record(&make_record(i, uniform_vector(i as f32, 16)))
            .unwrap();
    }

    let mut query = uniform_vector(13.0, 16);
    query.extend(uniform_vector(140.0, 16));
    let batches = collection
        .knn_search_batch("face", &query, &face_params(5), 2)
        .unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0][0].primary_key, 13);
    assert_eq!(batches[1][0].primary_key, 140);

    collection.close().unwrap();
}

#[test]
fn test_invalid_vector_and_query_rejected() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    // Byte length != dimension * element size.
    let mut bad = make_record(1, uniform_vector(1.0, 16));
    bad.column_datas[0].data.truncate(60);
    assert!(matches!(
        collection.insert_record(&bad),
        Err(vicinity::Error::InvalidRecord(_))
    ));

    collection
        .insert_record(&make_record(2, uniform_vector(2.0, 16)))
        .unwrap();
    assert!(matches!(
        collection.knn_search("face", &uniform_vector(0.0, 15), &face_params(5)),
        Err(vicinity::Error::InvalidQuery(_))
    ));
    assert!(matches!(
        collection.knn_search("ghost", &uniform_vector(0.0, 16), &face_params(5)),
        Err(vicinity::Error::InexistentColumn(_))
    ));

    collection.close().unwrap();
}

#[test]
fn test_quantized_inner_product_recall() {
    let dir = TempDir::new().unwrap();
    let mut schema = face_schema();
    schema.index_columns[0]
        .parameters
        .set("quantize_type", "DT_VECTOR_INT8")
        .set("metric_type", "InnerProduct");
    let collection = open_collection(&dir, schema, true);

    for i in 0..=1000u64 {
        collection
            .insert_record(&make_record(i, uniform_vector(0.001 * i as f32, 16)))
            .unwrap();
    }

    let mut params = face_params(10);
    params.is_linear = true;
    let results = collection
        .knn_search("face", &uniform_vector(1.0, 16), &params)
        .unwrap();
    assert_eq!(results[0].primary_key, 1000);
    assert!(
        (results[0].score - 16.0).abs() < 0.1,
        "score {} off",
        results[0].score
    );
    // Similarity order: scores descend.
    assert!(results[0].score >= results[9].score);

    collection.close().unwrap();
}

#[test]
fn test_schema_update_adds_and_removes_columns() {
    let dir = TempDir::new().unwrap();
    let collection = open_collection(&dir, face_schema(), true);

    collection
        .insert_record(&make_record(1, uniform_vector(1.0, 16)))
        .unwrap();

    // Stale revision is rejected.
    assert!(matches!(
        collection.update_schema(face_schema()),
        Err(vicinity::Error::MismatchedSchema(_))
    ));

    let mut new_schema = face_schema();
    new_schema.revision = 2;
    new_schema
        .index_columns
        .push(ColumnMeta::new("scene", DataType::VectorFp32, 16));
    collection.update_schema(new_schema).unwrap();

    let mut record = make_record(2, uniform_vector(2.0, 16));
    record.column_datas.push(vicinity::ColumnData {
        column_name: "scene".to_string(),
        data_type: DataType::VectorFp32,
        dimension: 16,
        data: uniform_vector(20.0, 16),
    });
    collection.insert_record(&record).unwrap();

    let results = collection
        .knn_search("scene", &uniform_vector(20.0, 16), &face_params(5))
        .unwrap();
    assert_eq!(results[0].primary_key, 2);

    // Dropping the column makes it unqueryable.
    let mut drop_schema = face_schema();
    drop_schema.revision = 3;
    collection.update_schema(drop_schema).unwrap();
    assert!(collection
        .knn_search("scene", &uniform_vector(20.0, 16), &face_params(5))
        .is_err());

    collection.close().unwrap();
}
