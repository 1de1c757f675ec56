mod common;

use std::sync::Arc;

use common::{keys, name, names, store, team_rows, user_rows};
use objectstore::prelude::*;
use objectstore::QueryErrorKind;

#[test]
fn insert_update_delete_round_trip() {
    let (store, db) = store();
    let all = store.query("users").unwrap();
    all.load().unwrap();
    let adults = all.filter(Expr::field("age").ge(1)).unwrap();

    let user = store.create("users").unwrap();
    user.set("age", Value::BigInt(1)).unwrap();
    user.set("name", Value::from("x")).unwrap();
    assert_eq!(user.state(), ObjectState::Created);
    assert!(user.keys().is_placeholder());

    db.respond_once("INSERT INTO \"users\"", user_rows(&[(7, "x", 1, None)]));
    all.save().unwrap();
    assert_eq!(user.state(), ObjectState::Original);
    assert_eq!(user.keys(), keys(7));
    let inserted = db.statements().pop().unwrap();
    assert!(inserted.starts_with("INSERT INTO \"users\" (\"name\", \"age\", \"team_id\")"));

    let executed = db.execution_count();
    let cached = store.get("users", &keys(7)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&cached, &user));
    assert_eq!(db.execution_count(), executed);

    user.set("name", Value::from("y")).unwrap();
    assert_eq!(user.state(), ObjectState::Changed);
    db.respond_once("UPDATE \"users\"", user_rows(&[(7, "y", 1, None)]));
    all.save().unwrap();
    assert_eq!(user.state(), ObjectState::Original);
    assert_eq!(name(&user), "y");
    let cached = store.get("users", &keys(7)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&cached, &user));
    assert!(
        db.statements()
            .last()
            .unwrap()
            .starts_with("UPDATE \"users\" SET \"name\" = @p0 WHERE \"id\" = @k0")
    );

    user.delete().unwrap();
    assert_eq!(user.state(), ObjectState::Deleted);
    assert!(all.items().unwrap().is_empty());
    assert_eq!(all.view().deleted().len(), 1);
    all.save().unwrap();

    assert_eq!(user.state(), ObjectState::NotAttached);
    assert!(all.items().unwrap().is_empty());
    assert!(all.view().deleted().is_empty());
    assert!(!adults.view().contains(&user));
    assert!(adults.view().deleted().is_empty());
    assert!(db.statements().last().unwrap().starts_with("DELETE FROM \"users\""));
    assert!(store.get("users", &keys(7)).unwrap().is_none());
}

#[test]
fn a_failing_object_rolls_back_the_batch() {
    let (store, db) = store();
    db.respond("FROM \"teams\"", team_rows(&[(1, "core")]));
    let team = store.query("teams").unwrap().items().unwrap().remove(0);

    let first = store.create("users").unwrap();
    first.set("name", Value::from("u1")).unwrap();
    team.set("name", Value::from("renamed")).unwrap();
    let third = store.create("users").unwrap();
    third.set("name", Value::from("u3")).unwrap();

    db.respond_once("INSERT INTO \"users\"", user_rows(&[(10, "u1", 0, None)]));
    db.fail_on("UPDATE \"teams\"");
    let before = db.execution_count();
    let err = store
        .save(&[Arc::clone(&first), Arc::clone(&team), Arc::clone(&third)])
        .unwrap_err();

    assert!(Arc::ptr_eq(err.failed_object().unwrap(), &team));
    let Error::Save(save) = &err else {
        panic!("expected a save error, got {err}");
    };
    assert!(matches!(save.source.root(), Error::Query(q) if q.kind == QueryErrorKind::Constraint));

    assert_eq!(first.state(), ObjectState::Created, "executed insert is rolled back");
    assert!(first.keys().is_placeholder());
    assert_eq!(team.state(), ObjectState::Changed);
    assert_eq!(name(&team), "renamed");
    assert_eq!(third.state(), ObjectState::Created);
    assert_eq!(db.execution_count() - before, 2, "the third object never ran");

    db.clear_failure();
    db.respond_once("INSERT INTO \"users\"", user_rows(&[(10, "u1", 0, None)]));
    db.respond_once("INSERT INTO \"users\"", user_rows(&[(11, "u3", 0, None)]));
    store.save(&[Arc::clone(&first), Arc::clone(&team), Arc::clone(&third)]).unwrap();
    assert_eq!(first.keys(), keys(10));
    assert_eq!(third.keys(), keys(11));
    assert_eq!(team.state(), ObjectState::Original);
}

#[test]
fn updates_of_vanished_rows_detach() {
    let (store, db) = store();
    db.respond("FROM \"users\"", user_rows(&[(1, "ann", 30, None)]));
    let all = store.query("users").unwrap();
    let ann = all.items().unwrap().remove(0);

    ann.set("age", Value::BigInt(31)).unwrap();
    db.respond_once("UPDATE \"users\"", objectstore::ResultSet::affected(0));
    all.save().unwrap();
    assert_eq!(ann.state(), ObjectState::NotAttached);
    assert!(all.items().unwrap().is_empty());
}

#[test]
fn deleting_a_parent_deletes_its_children() {
    let (store, db) = store();
    db.respond("FROM \"teams\"", team_rows(&[(1, "core")]));
    db.respond(
        "FROM \"users\"",
        user_rows(&[
            (1, "ann", 30, Some(1)),
            (2, "bob", 17, None),
            (3, "cy", 40, Some(1)),
        ]),
    );
    let users = store.query("users").unwrap();
    users.load().unwrap();
    let teams = store.query("teams").unwrap();
    let team = teams.items().unwrap().remove(0);

    team.delete().unwrap();
    teams.save().unwrap();

    assert_eq!(team.state(), ObjectState::NotAttached);
    assert_eq!(names(&users.items().unwrap()), ["bob"]);
    let deletes: Vec<String> = db
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("DELETE"))
        .collect();
    assert_eq!(deletes.len(), 3);
    assert!(deletes[0].starts_with("DELETE FROM \"teams\""));
    assert!(deletes[1..].iter().all(|s| s.starts_with("DELETE FROM \"users\"")));
}

#[test]
fn changed_children_are_saved_with_their_parent() {
    let (store, db) = store();
    db.respond("FROM \"teams\"", team_rows(&[(1, "core")]));
    db.respond("FROM \"users\"", user_rows(&[(1, "ann", 30, Some(1))]));
    let users = store.query("users").unwrap();
    users.load().unwrap();
    let teams = store.query("teams").unwrap();
    let team = teams.items().unwrap().remove(0);
    let ann = users.items().unwrap().remove(0);

    ann.set("age", Value::BigInt(31)).unwrap();
    assert_eq!(team.state(), ObjectState::Original);
    assert!(team.check_child_objects_changed().unwrap());

    teams.save().unwrap();
    assert_eq!(ann.state(), ObjectState::Original);
    assert!(
        db.statements()
            .iter()
            .any(|s| s.starts_with("UPDATE \"users\" SET \"age\""))
    );

    ann.set("age", Value::BigInt(50)).unwrap();
    teams.drop_changes().unwrap();
    assert_eq!(ann.get("age").unwrap(), Value::BigInt(31));
}

#[test]
fn units_of_work_decide_the_outcome() {
    let (store, db) = store();
    db.respond("FROM \"users\"", user_rows(&[(1, "ann", 30, None)]));
    let all = store.query("users").unwrap();
    let ann = all.items().unwrap().remove(0);

    ann.set("age", Value::BigInt(31)).unwrap();
    let mut unit = UnitOfWork::new();
    all.save_in(&mut unit).unwrap();
    assert_eq!(ann.state(), ObjectState::Changed, "nothing applies before the unit commits");
    unit.commit().unwrap();
    assert_eq!(ann.state(), ObjectState::Original);

    ann.set("age", Value::BigInt(32)).unwrap();
    db.respond_once("UPDATE \"users\"", user_rows(&[(1, "ann", 99, None)]));
    let mut unit = UnitOfWork::new();
    store.save_in(&[Arc::clone(&ann)], &mut unit).unwrap();
    unit.rollback().unwrap();
    assert_eq!(ann.state(), ObjectState::Changed);
    assert_eq!(ann.get("age").unwrap(), Value::BigInt(32));
}
