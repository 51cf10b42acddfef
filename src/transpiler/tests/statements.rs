use crate::ast::*;
use crate::error::EtlError;
use crate::transpiler::{Dialect, ParamContext, ddl, dml};
use crate::types::{TypeCode, Value};
use pretty_assertions::assert_eq;

fn people() -> Table {
    Table::with_columns(
        "people",
        vec![
            Column::with_role("id", DeltaType::DbAutoIncrement),
            Column::with_role("name", DeltaType::NaturalKey).max_length(20).not_null(),
            Column::new("age", TypeCode::Int32),
        ],
    )
    .unwrap()
}

#[test]
fn test_insert_skips_database_identity() {
    let table = people();
    let dialect = Dialect::postgres();
    let mut ctx = ParamContext::new(&dialect);
    let query = InsertQuery {
        columns: table
            .columns()
            .iter()
            .cloned()
            .zip([Value::Null, "ann".into(), Value::Int(30)])
            .map(|(c, v)| QueryColumn::new(c, v))
            .collect(),
    };
    let sql = dml::build_insert(&table, &query, &mut ctx).unwrap();
    assert_eq!(sql, "INSERT INTO \"people\" (\"name\", \"age\") VALUES ($1, $2)");
    let names: Vec<&str> = ctx.params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["col1", "col2"]);
}

#[test]
fn test_bulk_insert_rows() {
    let table = people();
    let dialect = Dialect::sqlite();
    let mut ctx = ParamContext::new(&dialect);
    let rows = vec![
        vec![Value::Null, "ann".into(), Value::Int(30)],
        vec![Value::Null, "bob".into(), Value::Null],
    ];
    let sql = dml::build_bulk_insert(&table, &rows, &mut ctx).unwrap();
    assert_eq!(
        sql,
        "INSERT INTO \"people\" (\"name\", \"age\") VALUES (?, ?), (?, ?)"
    );
    assert_eq!(ctx.params.len(), 4);
    assert_eq!(ctx.params[2].value, Value::from("bob"));
    assert_eq!(dml::bulk_chunk_size(&table, dialect.max_parameters), 499);
}

#[test]
fn test_update_and_delete() {
    let table = people();
    let dialect = Dialect::sqlserver();
    let id = table.column("id").unwrap().clone();

    let mut ctx = ParamContext::new(&dialect);
    let update = UpdateQuery {
        columns: vec![QueryColumn::new(table.column("age").unwrap().clone(), 31)],
        filters: vec![Filter::value(id.clone(), Compare::Equal, 7)],
    };
    assert_eq!(
        dml::build_update(&table, &update, &mut ctx).unwrap(),
        "UPDATE [people] SET [age] = @col0 WHERE ([id] = @where1Value2)"
    );

    let mut ctx = ParamContext::new(&dialect);
    let delete = DeleteQuery {
        filters: vec![Filter::value(id, Compare::Equal, 7)],
    };
    assert_eq!(
        dml::build_delete(&table, &delete, &mut ctx).unwrap(),
        "DELETE FROM [people] WHERE ([id] = @where1Value2)"
    );
    assert_eq!(ctx.params[0].value, Value::Int(7));
}

#[test]
fn test_delete_rejects_inexpressible_filter() {
    let table = people();
    let dialect = Dialect::postgres();
    let mut ctx = ParamContext::new(&dialect);
    let delete = DeleteQuery {
        filters: vec![Filter::value(
            Column::new("tags", TypeCode::String).array(1),
            Compare::Equal,
            "x",
        )],
    };
    let err = dml::build_delete(&table, &delete, &mut ctx).unwrap_err();
    assert!(matches!(err, EtlError::Compile(_)));
}

#[test]
fn test_ddl() {
    let table = people();
    assert_eq!(
        ddl::build_create_table(&table, &Dialect::postgres()),
        "CREATE TABLE \"people\" (\"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \"name\" VARCHAR(20) NOT NULL, \"age\" INTEGER)"
    );
    assert_eq!(
        ddl::build_truncate(&table, &Dialect::sqlite()),
        "DELETE FROM \"people\""
    );
    assert_eq!(
        ddl::build_truncate(&table, &Dialect::postgres()),
        "TRUNCATE TABLE \"people\""
    );
    assert_eq!(
        ddl::build_max(&table, table.column("id").unwrap(), &Dialect::mysql()),
        "SELECT MAX(`id`) FROM `people`"
    );

    let dialect = Dialect::sqlserver();
    let mut ctx = ParamContext::new(&dialect);
    let sql = ddl::build_table_exists(&table, &mut ctx);
    assert!(sql.ends_with("TABLE_NAME = @name"));
    assert_eq!(ctx.params[0].value, Value::from("people"));
}
