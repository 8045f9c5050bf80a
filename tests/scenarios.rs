//! end to end scenarios against the scripted wire handle.

use postgres_types::Type;
use quill_postgres::pq::mock::{MockColumn, MockPq, MockResult, Sent};
use quill_postgres::{Connection, Params, ScrollMode, Value};
use rust_decimal::Decimal;

fn connect() -> Connection<MockPq> {
    Connection::<MockPq>::connect("dbname=scenarios user=tester").unwrap()
}

fn connect_autocommit() -> Connection<MockPq> {
    let conn = connect();
    conn.set_autocommit(true).unwrap();
    conn
}

fn series(values: &[i64]) -> MockResult {
    MockResult::tuples(
        vec![MockColumn::new("n", &Type::INT8)],
        values
            .iter()
            .map(|n| vec![Some(n.to_string().into_bytes())])
            .collect(),
    )
}

/// S1: the automatic integer dumper announces the narrowest type able to
/// hold each value.
#[test]
fn int_size_promotion_on_the_wire() {
    let conn = connect_autocommit();
    conn.with_handle(|pq| pq.expect(vec![series(&[1])]));

    let mut cursor = conn.cursor();
    cursor
        .execute(
            "select %s, %s, %s, %s",
            Some(Params::positional(vec![
                Value::BigInt(1),
                Value::BigInt(40_000),
                Value::BigInt(3_000_000_000),
                Value::Numeric("10000000000000000000000000000".parse::<Decimal>().unwrap()),
            ])),
        )
        .unwrap();

    let sent = conn.with_handle(|pq| pq.take_sent());
    match &sent[..] {
        [Sent::QueryParams { types, params, .. }] => {
            assert_eq!(
                types,
                &vec![
                    Type::INT2.oid(),
                    Type::INT4.oid(),
                    Type::INT8.oid(),
                    Type::NUMERIC.oid()
                ]
            );
            assert_eq!(params[0], Some(b"1".to_vec()));
            assert_eq!(params[3], Some(b"10000000000000000000000000000".to_vec()));
        }
        other => panic!("unexpected traffic: {other:?}"),
    }
}

/// S2: with threshold 3, the fourth execution prepares and the fifth runs
/// the prepared statement directly.
#[test]
fn prepare_threshold_crossing() {
    let conn = connect_autocommit();
    conn.set_prepare_threshold(Some(3));

    for _ in 0..5 {
        conn.with_handle(|pq| pq.expect(vec![series(&[1])]));
        let mut cursor = conn.cursor();
        cursor
            .execute("select %s", Some(Params::positional([1i64])))
            .unwrap();
    }

    let sent = conn.with_handle(|pq| pq.take_sent());
    let kinds: Vec<&'static str> = sent
        .iter()
        .map(|s| match s {
            Sent::QueryParams { .. } => "params",
            Sent::Prepare { .. } => "prepare",
            Sent::QueryPrepared { .. } => "prepared",
            other => panic!("unexpected traffic: {other:?}"),
        })
        .collect();
    assert_eq!(
        kinds,
        ["params", "params", "params", "prepare", "prepared", "prepared"]
    );

    // all six messages name the same statement
    let name = sent
        .iter()
        .find_map(|s| match s {
            Sent::Prepare { name, .. } => Some(name.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(name, "_pg3_0");
}

/// S3: a rollback deallocates everything and the tally restarts.
#[test]
fn rollback_resets_prepared_statements() {
    let conn = connect();
    conn.set_prepare_threshold(Some(0));

    conn.with_handle(|pq| pq.expect(vec![series(&[1])]));
    let mut cursor = conn.cursor();
    cursor
        .execute("select %s", Some(Params::positional([1i64])))
        .unwrap();
    drop(cursor);

    conn.rollback().unwrap();
    let sent = conn.with_handle(|pq| pq.take_sent());
    let flat = format!("{sent:?}");
    assert!(flat.contains("DEALLOCATE ALL"), "{flat}");

    // counting restarted: the next prepared statement is _pg3_0 again
    conn.with_handle(|pq| pq.expect(vec![series(&[1])]));
    let mut cursor = conn.cursor();
    cursor
        .execute("select %s", Some(Params::positional([1i64])))
        .unwrap();
    let sent = conn.with_handle(|pq| pq.take_sent());
    assert!(
        sent.iter()
            .any(|s| matches!(s, Sent::Prepare { name, .. } if name == "_pg3_0")),
        "{sent:?}"
    );
}

/// S4: a rolled back inner savepoint leaves the outer transaction intact.
#[test]
fn savepoint_nesting_preserves_outer_transaction() {
    let conn = connect();

    let mut outer = conn.transaction().unwrap();
    conn.execute("insert into t values (1)", None).unwrap();
    {
        let nested = outer.transaction().unwrap();
        conn.execute("insert into t values (2)", None).unwrap();
        nested.rollback().unwrap();
    }
    outer.commit().unwrap();

    let sent = conn.with_handle(|pq| pq.take_sent());
    let statements: Vec<String> = sent
        .iter()
        .map(|s| match s {
            Sent::Query(q) => q.clone(),
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(
        statements,
        [
            "BEGIN",
            "insert into t values (1)",
            "SAVEPOINT \"_pg3_2\"",
            "insert into t values (2)",
            "ROLLBACK TO \"_pg3_2\"; RELEASE \"_pg3_2\"",
            "COMMIT",
        ]
    );
    assert_eq!(
        conn.info().transaction_status(),
        quill_postgres::pq::TransactionStatus::Idle
    );
}

/// S5: server cursor positioning with MOVE, fetching after each move.
#[test]
fn server_cursor_scroll_and_fetch() {
    let conn = connect();
    conn.with_handle(|pq| {
        pq.expect(vec![MockResult::tuples(
            vec![MockColumn::new("n", &Type::INT8)],
            Vec::new(),
        )])
    });

    let mut cursor = conn.server_cursor("ten");
    cursor
        .execute("select generate_series(0, 9)", None, Some(true), false)
        .unwrap();
    conn.with_handle(|pq| pq.take_sent());

    cursor.scroll(5, ScrollMode::Absolute).unwrap();
    conn.with_handle(|pq| pq.expect(vec![series(&[5]).tag("FETCH 1")]));
    let row = cursor.fetchone().unwrap().unwrap();
    assert_eq!(row.get(0).unwrap(), &Value::BigInt(5));

    cursor.scroll(-2, ScrollMode::Relative).unwrap();
    conn.with_handle(|pq| pq.expect(vec![series(&[4]).tag("FETCH 1")]));
    let row = cursor.fetchone().unwrap().unwrap();
    assert_eq!(row.get(0).unwrap(), &Value::BigInt(4));

    let sent = conn.with_handle(|pq| pq.take_sent());
    let moves: Vec<&Sent> = sent
        .iter()
        .filter(|s| matches!(s, Sent::Query(q) if q.starts_with("MOVE")))
        .collect();
    assert_eq!(moves.len(), 2, "{sent:?}");
    assert!(matches!(moves[0], Sent::Query(q) if q == "MOVE ABSOLUTE 5 FROM \"ten\""));
    assert!(matches!(moves[1], Sent::Query(q) if q == "MOVE  -2 FROM \"ten\""));
}

/// connect/close round trip: a fresh connection works after the previous
/// one was torn down, and the teardown invariants hold.
#[test]
fn close_and_reconnect() {
    let conn = connect();
    conn.execute("select 1", None).unwrap();
    conn.close();
    assert!(conn.closed());
    assert!(!conn.broken());
    assert!(conn.execute("select 1", None).is_err());
    drop(conn);

    let conn = connect();
    conn.with_handle(|pq| pq.expect(vec![series(&[1])]));
    let mut cursor = conn.cursor();
    cursor.execute("select 1", None).unwrap();
    assert_eq!(cursor.fetchall().unwrap().len(), 1);
}

#[test]
fn cancel_uses_the_out_of_band_token() {
    let conn = connect();
    conn.cancel().unwrap();
    assert!(conn.with_handle(|pq| pq.cancel_fired()));
}

#[test]
fn binary_results_round_trip() {
    let conn = connect_autocommit();
    conn.with_handle(|pq| {
        let col = MockColumn::new("id", &Type::UUID).binary();
        let uuid: uuid::Uuid = "6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse().unwrap();
        pq.expect(vec![MockResult::tuples(
            vec![col],
            vec![vec![Some(uuid.as_bytes().to_vec())]],
        )]);
    });

    let mut cursor = conn.cursor().binary();
    cursor.execute("select id from things", None).unwrap();
    let row = cursor.fetchone().unwrap().unwrap();
    assert_eq!(
        row.get(0).unwrap(),
        &Value::Uuid("6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse().unwrap())
    );
}

#[test]
fn notify_handlers_fire_on_traffic() {
    use std::sync::{Arc, Mutex};

    let conn = connect_autocommit();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    conn.add_notify_handler(Box::new(move |n| {
        seen2.lock().unwrap().push((n.channel.clone(), n.payload.clone()));
    }));

    conn.with_handle(|pq| {
        pq.queue_notify("events", "hello", 99);
        pq.expect(vec![series(&[1])]);
    });
    conn.execute("select 1", None).unwrap();

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [("events".to_string(), "hello".to_string())]
    );
}
