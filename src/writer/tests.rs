use super::*;
use crate::ast::Column;
use crate::reader::MemoryReader;
use crate::testing::{CancelAfterReader, DelayedConnection};
use crate::engine::MemoryConnection;
use std::time::Duration;

fn people() -> Table {
    Table::with_columns(
        "people",
        vec![
            Column::new("id", TypeCode::Int64).delta(DeltaType::NaturalKey),
            Column::new("name", TypeCode::String),
        ],
    )
    .unwrap()
}

fn input() -> Table {
    Table::with_columns(
        "source",
        vec![
            Column::new("Operation", TypeCode::Char).delta(DeltaType::DatabaseOperation),
            Column::new("id", TypeCode::Int64),
            Column::new("name", TypeCode::String),
            Column::new("RejectReason", TypeCode::String).delta(DeltaType::RejectedReason),
        ],
    )
    .unwrap()
}

fn row(op: &str, id: i64, name: &str) -> Row {
    vec![op.into(), Value::Int(id), name.into(), Value::Null]
}

fn options(commit_size: usize) -> WriterOptions {
    WriterOptions {
        commit_size,
        ..Default::default()
    }
}

fn starts(events: &[String]) -> Vec<String> {
    events.iter().filter(|e| e.contains(":start:")).cloned().collect()
}

#[tokio::test]
async fn test_update_flush_waits_for_create_flush() {
    let memory = MemoryConnection::new("target");
    memory
        .load(&people(), vec![vec![Value::Int(1), "a".into()], vec![Value::Int(2), "b".into()]])
        .await;
    let conn = DelayedConnection::new(memory.clone(), Duration::from_millis(30));
    let mut reader = MemoryReader::new(
        input(),
        vec![row("C", 3, "c"), row("C", 4, "d"), row("U", 1, "A"), row("U", 2, "B")],
    );

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(conn.clone()),
        None,
        None,
        options(2),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!(result.rows_created, 2);
    assert_eq!(result.rows_updated, 2);
    assert_eq!(
        conn.events(),
        vec!["insert:start:2", "insert:end:2", "update:start:2", "update:end:2"]
    );
    let rows = memory.rows(&people()).await.unwrap();
    assert_eq!(rows[0], vec![Value::Int(1), "A".into()]);
    assert_eq!(rows.len(), 4);
}

#[tokio::test]
async fn test_batches_split_at_commit_size() {
    let memory = MemoryConnection::new("target");
    let conn = DelayedConnection::new(memory.clone(), Duration::from_millis(1));
    let rows = (1..=5).map(|i| row("C", i, "x")).collect();
    let mut reader = MemoryReader::new(input(), rows);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(conn.clone()),
        None,
        None,
        options(2),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!(result.rows_read, 5);
    assert_eq!(result.rows_created, 5);
    assert_eq!(
        starts(&conn.events()),
        vec!["insert:start:2", "insert:start:2", "insert:start:1"]
    );
    assert_eq!(memory.rows(&people()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_cancel_keeps_flushed_batch_and_discards_buffered_rows() {
    let memory = MemoryConnection::new("target");
    let cancel = CancellationToken::new();
    let rows = (1..=5).map(|i| row("C", i, "x")).collect();
    let mut reader = CancelAfterReader::new(MemoryReader::new(input(), rows), cancel.clone(), 3);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(memory.clone()),
        None,
        None,
        options(2),
        cancel,
    )
    .await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.rows_read, 2);
    assert_eq!(result.rows_created, 2);
    assert_eq!(
        memory.rows(&people()).await.unwrap(),
        vec![vec![Value::Int(1), "x".into()], vec![Value::Int(2), "x".into()]]
    );
}

#[tokio::test]
async fn test_delete_flush_waits_for_create_and_update() {
    let memory = MemoryConnection::new("target");
    memory
        .load(&people(), vec![vec![Value::Int(1), "a".into()], vec![Value::Int(2), "b".into()]])
        .await;
    let conn = DelayedConnection::new(memory.clone(), Duration::from_millis(20));
    let mut reader = MemoryReader::new(
        input(),
        vec![row("C", 3, "c"), row("U", 1, "A"), row("D", 2, "b")],
    );

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(conn.clone()),
        None,
        None,
        options(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!((result.rows_created, result.rows_updated, result.rows_deleted), (1, 1, 1));
    assert_eq!(
        conn.events(),
        vec![
            "insert:start:1",
            "insert:end:1",
            "update:start:1",
            "update:end:1",
            "delete:start:1",
            "delete:end:1",
        ]
    );
    assert_eq!(
        memory.rows(&people()).await.unwrap(),
        vec![vec![Value::Int(1), "A".into()], vec![Value::Int(3), "c".into()]]
    );
}

#[tokio::test]
async fn test_reject_flush_overlaps_create_flush() {
    let memory = MemoryConnection::new("target");
    let conn = DelayedConnection::new(memory.clone(), Duration::from_millis(30));
    let mut reader = MemoryReader::new(input(), vec![row("C", 1, "ok"), row("R", 2, "bad")]);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(conn.clone()),
        None,
        None,
        options(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!((result.rows_created, result.rows_rejected), (1, 1));
    assert_eq!(
        conn.events(),
        vec!["insert:start:1", "insert:start:1", "insert:end:1", "insert:end:1"]
    );
}

#[tokio::test]
async fn test_failed_flush_abends_and_counts_in_flight_flush() {
    let memory = MemoryConnection::new("target");
    let conn = DelayedConnection::new(memory.clone(), Duration::from_millis(20));
    let mut reader = MemoryReader::new(input(), vec![row("R", 9, "bad"), row("C", 1, "ok")]);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(conn.clone()),
        None,
        None,
        WriterOptions {
            commit_size: 1,
            target_action: TargetAction::None,
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Abended);
    assert!(result.message.unwrap().contains("people"));
    assert_eq!(result.rows_read, 2);
    assert_eq!(result.rows_created, 0);
    assert_eq!(result.rows_rejected, 1);
    assert_eq!(starts(&conn.events()).len(), 2);
    assert_eq!(
        memory
            .rows(&reject_table(&people(), "_reject").unwrap())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_rejects_go_to_reject_table() {
    let memory = MemoryConnection::new("target");
    let mut reject = row("R", 9, "bad");
    reject[3] = "Column:name: too long".into();
    let mut reader = MemoryReader::new(input(), vec![row("C", 1, "ok"), reject]);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(memory.clone()),
        None,
        None,
        options(10),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!(result.rows_created, 1);
    assert_eq!(result.rows_rejected, 1);
    let rejects = memory
        .rows(&reject_table(&people(), "_reject").unwrap())
        .await
        .unwrap();
    assert_eq!(
        rejects,
        vec![vec![Value::Int(9), "bad".into(), "Column:name: too long".into()]]
    );
}

#[tokio::test]
async fn test_update_without_keys_abends() {
    let memory = MemoryConnection::new("target");
    let table = Table::with_columns("notes", vec![Column::new("name", TypeCode::String)]).unwrap();
    let mut reader = MemoryReader::new(input(), vec![row("U", 1, "x")]);

    let result = write_all_records(
        &mut reader,
        table,
        Arc::new(memory),
        None,
        None,
        options(10),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Abended);
    assert!(result.message.unwrap().contains("no key columns"));
}

#[tokio::test]
async fn test_unknown_operation_abends() {
    let memory = MemoryConnection::new("target");
    let mut reader = MemoryReader::new(input(), vec![row("X", 1, "x")]);

    let result = write_all_records(
        &mut reader,
        people(),
        Arc::new(memory),
        None,
        None,
        options(10),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, RunStatus::Abended);
    assert_eq!(result.rows_created, 0);
}

#[tokio::test]
async fn test_open_twice_is_protocol_error() {
    let memory = MemoryConnection::new("target");
    let mut writer = TransformWriter::new(Arc::new(memory), people(), options(10));
    writer.open(&input(), CancellationToken::new()).await.unwrap();
    let err = writer.open(&input(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EtlError::Protocol(_)));
}

#[tokio::test]
async fn test_auto_increment_continues_from_max() {
    let memory = MemoryConnection::new("target");
    let table = Table::with_columns(
        "tickets",
        vec![
            Column::with_role("ticket_id", DeltaType::AutoIncrement),
            Column::new("name", TypeCode::String),
        ],
    )
    .unwrap();
    memory.load(&table, vec![vec![Value::Int(41), "old".into()]]).await;
    let mut writer = TransformWriter::new(Arc::new(memory.clone()), table.clone(), options(10));
    writer.open(&input(), CancellationToken::new()).await.unwrap();
    writer.write_row(&row("C", 0, "new")).await.unwrap();
    writer.close().await.unwrap();

    let rows = memory.rows(&table).await.unwrap();
    assert_eq!(rows[1], vec![Value::Int(42), "new".into()]);
}

#[tokio::test]
async fn test_child_rows_receive_database_keys() {
    let memory = MemoryConnection::new("target");
    let orders = Table::with_columns(
        "orders",
        vec![
            Column::with_role("order_id", DeltaType::DbAutoIncrement),
            Column::new("customer", TypeCode::String),
        ],
    )
    .unwrap();
    let items = Table::with_columns(
        "items",
        vec![
            Column::new("order_id", TypeCode::Int64),
            Column::new("sku", TypeCode::String),
        ],
    )
    .unwrap();
    memory.load(&orders, vec![vec![Value::Int(5), "old".into()]]).await;

    let source = Table::with_columns(
        "source",
        vec![
            Column::new("customer", TypeCode::String),
            Column::new("items", TypeCode::String).children(vec![Column::new("sku", TypeCode::String)]),
        ],
    )
    .unwrap();
    let mut reader = MemoryReader::new(
        source,
        vec![
            vec!["ann".into(), Value::Rows(vec![vec!["a".into()], vec!["b".into()]])],
            vec!["bob".into(), Value::Rows(vec![vec!["c".into()]])],
        ],
    );

    let conn: Arc<dyn Connection> = Arc::new(memory.clone());
    let mut target = WriterTarget::new(Arc::clone(&conn), orders.clone(), options(10));
    target
        .add(WriterTarget::new(conn, items.clone(), options(10)), "items")
        .unwrap();
    let result = target.write_records(&mut reader, CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Finished);
    assert_eq!(result.rows_created, 2);
    assert_eq!(result.children[0].rows_created, 3);
    assert_eq!(
        memory.rows(&items).await.unwrap(),
        vec![
            vec![Value::Int(6), "a".into()],
            vec![Value::Int(6), "b".into()],
            vec![Value::Int(7), "c".into()],
        ]
    );
}

#[tokio::test]
async fn test_add_under_unknown_path_fails() {
    let conn: Arc<dyn Connection> = Arc::new(MemoryConnection::new("target"));
    let mut target = WriterTarget::new(Arc::clone(&conn), people(), WriterOptions::default());
    let child = WriterTarget::new(conn, people(), WriterOptions::default());
    assert!(target.add(child, "orders.items").is_err());
}
