use db_batch_import::test_support::init_test_logger;
use db_batch_import::{
    BatchImport, ImportConfig, ImportError, Incoming, MemoryStore, Record, StatementKind,
    TableModel, TrackedRecord, Value, record,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const TABLE: &str = "items";

fn setup() -> Arc<MemoryStore> {
    init_test_logger();
    let store = Arc::new(MemoryStore::new());
    store.create_table(TABLE, "id");
    store
}

#[test]
fn records_are_pulled_lazily_and_processed_per_chunk() {
    let store = setup();
    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().buffer(2, None).unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let source = {
        let store = store.clone();
        let observed = observed.clone();
        (0..5).map(move |i| {
            observed.lock().push(store.rows(TABLE).unwrap().len());
            record! { "sku" => format!("s{i}") }
        })
    };

    let mut prepared = import.prepare();
    prepared.add_multiple(source).unwrap();

    assert_eq!(*observed.lock(), vec![0, 0, 2, 2, 4]);
    assert_eq!(prepared.pending(), 1);
    assert_eq!(prepared.stats().chunks, 2);

    prepared.flush().unwrap();
    assert_eq!(store.rows(TABLE).unwrap().len(), 5);
    assert_eq!(store.statements_of(StatementKind::BulkInsert).len(), 3);
}

#[test]
fn flush_is_idempotent() {
    let store = setup();
    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().with_batch_id(7, None).unwrap();

    let mut prepared = import.prepare();
    prepared.add(record! { "sku" => "a" }).unwrap();
    assert_eq!(prepared.flush().unwrap().as_deref(), Some("7"));
    let statements = store.statements().len();

    assert_eq!(prepared.flush().unwrap().as_deref(), Some("7"));
    assert_eq!(store.statements().len(), statements);
    assert_eq!(prepared.stats().chunks, 1);
}

#[test]
fn one_batch_id_per_prepared_import() {
    let store = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let model = TableModel::new(TABLE).batch_ids(move || {
        (counter.fetch_add(1, Ordering::SeqCst) + 100).to_string()
    });

    let mut import = BatchImport::new(model, store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().buffer(1, None).unwrap();

    let mut prepared = import.prepare();
    assert_eq!(prepared.batch_id(), Some("100"));
    prepared
        .add_multiple((0..3).map(|i| record! { "sku" => i }))
        .unwrap();
    prepared.flush().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for row in store.rows(TABLE).unwrap() {
        assert_eq!(row.get("last_batch_id"), &Value::from("100"));
    }

    let second = import.prepare();
    assert_eq!(second.batch_id(), Some("101"));
    assert_eq!(import.last_batch_id(), Some("101"));
}

#[test]
fn stats_accumulate_across_chunks() {
    let store = setup();
    store
        .seed(
            TABLE,
            [
                record! { "sku" => "a", "qty" => 1 },
                record! { "sku" => "b", "qty" => 1 },
            ],
        )
        .unwrap();

    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import
        .match_by(["sku"])
        .unwrap()
        .update_if_exists(["qty"])
        .unwrap()
        .with_batch_id(3, None)
        .unwrap()
        .configure(ImportConfig::new(2))
        .unwrap();

    let mut prepared = import.prepare();
    prepared
        .add_multiple([
            record! { "sku" => "a", "qty" => 2 },
            record! { "sku" => "b", "qty" => 1 },
            record! { "sku" => "c", "qty" => 1 },
        ])
        .unwrap();
    prepared.flush().unwrap();

    let stats = prepared.stats();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.batch_id_touched, 1);
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.unchanged, 0);
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.written(), 3);
}

#[test]
fn callbacks_are_delivered_in_batches() {
    let store = setup();
    let batches = Arc::new(Mutex::new(Vec::<Vec<Record>>::new()));
    let sink = batches.clone();

    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import
        .match_by(["sku"])
        .unwrap()
        .buffer(1, Some(2))
        .unwrap()
        .on_inserted(move |records| sink.lock().push(records.to_vec()));

    let mut prepared = import.prepare();
    prepared.add(record! { "sku" => "a" }).unwrap();
    assert_eq!(prepared.pending_callbacks(), 1);
    assert!(batches.lock().is_empty());

    prepared.add(record! { "sku" => "b" }).unwrap();
    prepared.add(record! { "sku" => "c" }).unwrap();
    assert_eq!(batches.lock().len(), 1);
    assert_eq!(batches.lock()[0].len(), 2);
    assert_eq!(prepared.pending_callbacks(), 1);

    prepared.flush().unwrap();
    let batches = batches.lock();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1][0].get("sku"), &Value::from("c"));
    assert_eq!(prepared.pending_callbacks(), 0);
}

#[test]
fn nothing_is_written_before_the_buffer_fills() {
    let store = setup();
    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().buffer(10, None).unwrap();

    let mut prepared = import.prepare();
    prepared.add(record! { "sku" => "a" }).unwrap();
    assert!(store.statements().is_empty());
    assert_eq!(prepared.pending(), 1);

    prepared.flush().unwrap();
    assert_eq!(store.rows(TABLE).unwrap().len(), 1);
}

#[test]
fn rejected_records_never_enter_the_buffer() {
    let store = setup();
    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().buffer(2, None).unwrap().bypass_model(true);

    let mut prepared = import.prepare();
    let err = prepared.add(TrackedRecord::new()).unwrap_err();
    assert!(matches!(err, ImportError::Precondition(_)));
    assert_eq!(prepared.pending(), 0);

    for i in 0..8 {
        prepared.add(record! { "sku" => i }).unwrap();
        assert!(prepared.pending() < 2);
    }
    prepared.flush().unwrap();
    assert_eq!(store.rows(TABLE).unwrap().len(), 8);
}

#[test]
fn failing_chunk_stays_bounded_until_discarded() {
    let store = setup();
    store.seed(TABLE, [record! { "sku" => "a" }]).unwrap();

    let mut import = BatchImport::new(TableModel::new(TABLE), store.clone()).unwrap();
    import.match_by(["sku"]).unwrap().buffer(2, None).unwrap();

    let mut prepared = import.prepare();
    // collides with the seeded row's primary key on every attempt
    prepared.add(record! { "sku" => "b", "id" => 1 }).unwrap();
    let err = prepared.add(record! { "sku" => "c" }).unwrap_err();
    assert!(matches!(err, ImportError::Store(_)));
    assert_eq!(prepared.pending(), 2);

    for i in 0..5 {
        assert!(prepared.add(record! { "sku" => format!("late{i}") }).is_err());
        assert_eq!(prepared.pending(), 2);
    }

    let discarded = prepared.discard_pending();
    assert_eq!(discarded.len(), 2);
    assert!(matches!(&discarded[1], Incoming::Plain(r) if r.get("sku") == &Value::from("c")));
    assert_eq!(prepared.pending(), 0);

    prepared.add(record! { "sku" => "d" }).unwrap();
    prepared.flush().unwrap();
    let skus: Vec<Value> = store
        .rows(TABLE)
        .unwrap()
        .iter()
        .map(|r| r.value("sku"))
        .collect();
    assert_eq!(skus, vec![Value::from("a"), Value::from("d")]);
    assert_eq!(prepared.stats().inserted, 1);
}
