use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use futures::poll;

use rust_sqlite::sqlite::{
    Bindings, DatabaseHandle, InstanceRegistry, MigrationSet, Row, StoragePath, Value,
};

const CREATE_LOG: &str = "CREATE TABLE log (caller INTEGER NOT NULL, seq INTEGER NOT NULL)";
const INSERT_LOG: &str = "INSERT INTO log (caller, seq) VALUES (?, ?)";
const PER_CALLER: i32 = 200;

fn create_log_db() -> DatabaseHandle {
    let registry = Arc::new(InstanceRegistry::new());
    DatabaseHandle::open(&registry, StoragePath::Memory, CREATE_LOG, MigrationSet::new()).unwrap()
}

fn seqs_for(db: &DatabaseHandle, caller: i32) -> Vec<i32> {
    db.query(
        "SELECT seq FROM log WHERE caller = ? ORDER BY rowid",
        &Bindings::positional([caller]),
        true,
    )
    .unwrap()
    .map(|row| row["seq"].as_text().unwrap().parse().unwrap())
    .collect()
}

#[test]
fn test_concurrent_callers_keep_their_order() {
    let db = create_log_db();

    thread::scope(|s| {
        for caller in 0..2 {
            let db = &db;
            s.spawn(move || {
                for seq in 0..PER_CALLER {
                    let bindings = Bindings::positional([caller, seq]);
                    assert!(db.run_non_query(INSERT_LOG, &bindings, true));
                }
            });
        }
    });

    for caller in 0..2 {
        assert_eq!(seqs_for(&db, caller), (0..PER_CALLER).collect::<Vec<_>>());
    }
    assert!(db.close());
}

fn count_rows(db: &DatabaseHandle, table: &str) -> i64 {
    let rows: Vec<Row> = db
        .query(&format!("SELECT COUNT(*) AS n FROM {table}"), &Bindings::new(), false)
        .unwrap()
        .collect();
    rows[0]["n"].as_text().unwrap().parse().unwrap()
}

const CREATE_BIG: &str = "CREATE TABLE big (x INTEGER NOT NULL)";
const BIG_ROWS: usize = 300_000;

fn fill_big() -> String {
    format!(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {BIG_ROWS}) \
         INSERT INTO big SELECT x FROM c"
    )
}

#[test]
fn test_close_waits_for_in_flight_statement() {
    let registry = Arc::new(InstanceRegistry::new());
    let dir = tempfile::tempdir().unwrap();
    let path = StoragePath::file(dir.path().join("drain.db"));
    let db =
        DatabaseHandle::open(&registry, path.clone(), CREATE_BIG, MigrationSet::new()).unwrap();

    block_on(async {
        let (fill, bindings) = (fill_big(), Bindings::new());
        let mut insert = pin!(db.execute_async(&fill, &bindings, false));
        // The first poll queues the statement ahead of Close.
        assert!(poll!(insert.as_mut()).is_pending());

        assert!(db.close());
        // Close only returns after the worker has answered the insert.
        match poll!(insert.as_mut()) {
            Poll::Ready(Ok(changed)) => assert_eq!(changed, BIG_ROWS),
            other => panic!("insert not finished when close returned: {other:?}"),
        }
    });
    assert!(!registry.contains(&path));

    let db = DatabaseHandle::open(&registry, path, CREATE_BIG, MigrationSet::new()).unwrap();
    assert_eq!(count_rows(&db, "big"), BIG_ROWS as i64);
}

#[test]
fn test_drop_waits_for_queued_work() {
    let registry = Arc::new(InstanceRegistry::new());
    let dir = tempfile::tempdir().unwrap();
    let path = StoragePath::file(dir.path().join("drain.db"));
    let db =
        DatabaseHandle::open(&registry, path.clone(), CREATE_BIG, MigrationSet::new()).unwrap();

    block_on(async {
        let (fill, bindings) = (fill_big(), Bindings::new());
        let mut insert = pin!(db.execute_async(&fill, &bindings, false));
        assert!(poll!(insert.as_mut()).is_pending());
    });
    // Queued behind the insert; nobody waits for either.
    db.set_user_version(7).unwrap();
    drop(db);
    assert!(!registry.contains(&path));

    let db = DatabaseHandle::open(&registry, path, CREATE_BIG, MigrationSet::new()).unwrap();
    assert_eq!(count_rows(&db, "big"), BIG_ROWS as i64);
    assert_eq!(db.user_version().unwrap(), 7);
}

#[test]
fn test_close_from_another_thread_drains_callers() {
    let registry = Arc::new(InstanceRegistry::new());
    let dir = tempfile::tempdir().unwrap();
    let path = StoragePath::file(dir.path().join("race.db"));
    let db = Arc::new(
        DatabaseHandle::open(&registry, path.clone(), CREATE_LOG, MigrationSet::new()).unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|caller| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                (0..PER_CALLER)
                    .filter(|&seq| {
                        let bindings = Bindings::positional([caller, seq]);
                        db.run_non_query(INSERT_LOG, &bindings, true)
                    })
                    .count()
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(5));
    assert!(db.close());
    let acknowledged: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(!db.is_open());

    // Every acknowledged insert is on disk and nothing else is.
    let db = DatabaseHandle::open(&registry, path, CREATE_LOG, MigrationSet::new()).unwrap();
    assert_eq!(count_rows(&db, "log"), acknowledged as i64);
}

#[tokio::test]
async fn test_async_round_trip() {
    let db = create_log_db();
    let changed = db
        .execute_async(INSERT_LOG, &Bindings::positional([9, 1]), true)
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let rows: Vec<Row> = db
        .query_async("SELECT caller, seq FROM log", &Bindings::new(), true)
        .await
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["caller"], Value::Text("9".to_string()));
    assert_eq!(db.user_version_async().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_tasks_share_handle() {
    let db = Arc::new(create_log_db());

    let tasks: Vec<_> = (0..4)
        .map(|caller| {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                for seq in 0..50 {
                    db.execute_async(INSERT_LOG, &Bindings::positional([caller, seq]), true)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for caller in 0..4 {
        assert_eq!(seqs_for(&db, caller), (0..50).collect::<Vec<_>>());
    }
}
