mod common;

use std::thread;

use common::{names, store, team_rows, user_rows};
use objectstore::prelude::*;

#[test]
fn concurrent_fetches_share_one_round_trip() {
    let (store, db) = store();
    db.respond("FROM \"teams\" AS t0", team_rows(&[(1, "core")]));
    db.respond("t0.\"age\" >=", user_rows(&[(1, "ann", 30, None)]));
    db.respond("t0.\"name\" =", user_rows(&[(2, "bob", 17, None)]));

    let teams = store.query("teams").unwrap();
    let adults = store
        .query("users")
        .unwrap()
        .filter(Expr::field("age").ge(18))
        .unwrap();
    let bobs = store
        .query("users")
        .unwrap()
        .filter(Expr::field("name").eq("bob"))
        .unwrap();

    // The worker blocks opening its connection until every fetch is queued.
    db.close_gate();
    let first = teams.fetch_async().unwrap();
    let second = adults.fetch_async().unwrap();
    let third = bobs.fetch_async().unwrap();
    assert!(!first.is_ready());
    db.open_gate();

    assert_eq!(names(&first.wait().unwrap()), ["core"]);
    assert_eq!(names(&second.wait().unwrap()), ["ann"]);
    assert_eq!(names(&third.wait().unwrap()), ["bob"]);

    let executions = db.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].statements, 3);
    assert!(executions[0].text.contains("@b1_p0"));
    assert!(executions[0].text.contains("@b2_p0"));
    assert_eq!(db.opened(), 1);
}

#[test]
fn callers_on_many_threads_all_get_their_rows() {
    let (store, db) = store();
    db.respond("FROM \"users\"", user_rows(&[(1, "ann", 30, None), (2, "bob", 17, None)]));

    let handles: Vec<_> = (0..8_i32)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let query = store
                    .query("users")
                    .unwrap()
                    .filter(Expr::field("age").ge(i))
                    .unwrap()
                    .force_load()
                    .unwrap();
                query.items().unwrap().len()
            })
        })
        .collect();
    for handle in handles {
        let found = handle.join().unwrap();
        assert_eq!(found, 2, "answers are scripted, membership is evaluated locally");
    }
    assert!(db.execution_count() <= 8);
}

#[test]
fn a_failed_batch_reaches_every_caller() {
    let (store, db) = store();
    let teams = store.query("teams").unwrap();
    let users = store.query("users").unwrap();

    db.fail_on("FROM \"teams\"");
    db.close_gate();
    let first = teams.fetch_async().unwrap();
    let second = users.fetch_async().unwrap();
    db.open_gate();

    let a = first.wait().unwrap_err();
    let b = second.wait().unwrap_err();
    for err in [&a, &b] {
        assert!(matches!(err, Error::Shared(_)));
        assert!(matches!(err.root(), Error::Query(q) if q.kind == objectstore::QueryErrorKind::Constraint));
    }
    assert!(!teams.context().is_loaded());

    db.clear_failure();
    assert!(teams.items().unwrap().is_empty());
    assert!(teams.context().is_loaded());
}
