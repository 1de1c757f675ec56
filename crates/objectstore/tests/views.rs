mod common;

use std::sync::Arc;

use common::{names, store, team_rows, user_rows};
use objectstore::prelude::*;
use objectstore::{SqlFunction, TranslationErrorKind};
use parking_lot::Mutex;

fn loaded_store() -> (ObjectStore, Arc<common::FakeProvider>, Query) {
    let (store, db) = store();
    db.respond(
        "FROM \"users\"",
        user_rows(&[
            (1, "ann", 30, Some(1)),
            (2, "bob", 17, None),
            (3, "cy", 40, Some(1)),
        ]),
    );
    let all = store.query("users").unwrap();
    all.load().unwrap();
    (store, db, all)
}

fn named(query: &Query, wanted: &str) -> EntityRef {
    query
        .items()
        .unwrap()
        .into_iter()
        .find(|o| common::name(o) == wanted)
        .unwrap()
}

#[test]
fn membership_follows_edits() {
    let (_store, db, all) = loaded_store();
    let adults = all
        .filter(Expr::field("age").ge(18))
        .unwrap()
        .order_by(Expr::field("name"))
        .unwrap();
    assert_eq!(names(&adults.items().unwrap()), ["ann", "cy"]);
    assert_eq!(db.execution_count(), 1, "narrower queries are served from the loaded table");

    let bob = named(&all, "bob");
    bob.set("age", Value::BigInt(20)).unwrap();
    assert_eq!(names(&adults.items().unwrap()), ["ann", "bob", "cy"]);

    let cy = named(&all, "cy");
    cy.delete().unwrap();
    assert_eq!(names(&adults.items().unwrap()), ["ann", "bob"]);
    assert_eq!(names(&adults.view().deleted()), ["cy"]);

    adults.drop_changes().unwrap();
    assert_eq!(bob.get("age").unwrap(), Value::BigInt(17));
    assert_eq!(cy.state(), ObjectState::Original);
    assert_eq!(names(&adults.items().unwrap()), ["ann", "cy"]);
    assert!(adults.view().deleted().is_empty());
}

#[test]
fn sort_keys_reposition_members() {
    let (_store, _db, all) = loaded_store();
    let by_age = all.order_by_desc(Expr::field("age")).unwrap();
    assert_eq!(names(&by_age.items().unwrap()), ["cy", "ann", "bob"]);

    named(&all, "bob").set("age", Value::BigInt(99)).unwrap();
    assert_eq!(names(&by_age.items().unwrap()), ["bob", "cy", "ann"]);

    let by_name = all.order_by(Expr::field("name")).unwrap();
    named(&all, "cy").set("name", Value::from("al")).unwrap();
    assert_eq!(names(&by_name.items().unwrap()), ["al", "ann", "bob"]);
}

#[test]
fn take_limits_reads_not_membership() {
    let (_store, _db, all) = loaded_store();
    let oldest = all
        .order_by_desc(Expr::field("age"))
        .unwrap()
        .take(2)
        .unwrap();
    assert_eq!(names(&oldest.items().unwrap()), ["cy", "ann"]);
    assert_eq!(oldest.count().unwrap(), 2);
    assert_eq!(oldest.view().len(), 3);

    let bob = named(&all, "bob");
    assert!(!oldest.contains(&bob).unwrap());
    assert!(all.contains(&bob).unwrap());
    assert_eq!(common::name(&oldest.first_or_default().unwrap().unwrap()), "cy");

    let err = oldest.filter(Expr::field("age").gt(1)).unwrap_err();
    assert_eq!(
        err.translation_kind(),
        Some(TranslationErrorKind::NotSupportedQuery)
    );
}

#[test]
fn identical_chains_share_context_and_view() {
    let (store, _db, _all) = loaded_store();
    let build = || {
        store
            .query("users")
            .unwrap()
            .filter(Expr::field("age").ge(18))
            .unwrap()
            .order_by(Expr::field("name"))
            .unwrap()
    };
    let first = build();
    let second = build();
    assert!(Arc::ptr_eq(first.context(), second.context()));
    assert!(Arc::ptr_eq(first.view(), second.view()));

    let other = store
        .query("users")
        .unwrap()
        .filter(Expr::field("age").ge(19))
        .unwrap();
    assert!(!Arc::ptr_eq(first.context(), other.context()));
}

#[test]
fn observers_see_changes() {
    let (_store, _db, all) = loaded_store();
    let adults = all.filter(Expr::field("age").ge(18)).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let id = adults.subscribe(move |change| {
        let entry = match change {
            CollectionChange::Added { object, .. } => format!("+{}", common::name(object)),
            CollectionChange::Removed { object, .. } => format!("-{}", common::name(object)),
            CollectionChange::Reset => "reset".to_string(),
        };
        seen.lock().push(entry);
        Ok(())
    });

    let bob = named(&all, "bob");
    bob.set("age", Value::BigInt(18)).unwrap();
    bob.set("age", Value::BigInt(12)).unwrap();
    assert_eq!(*events.lock(), ["+bob", "-bob"]);

    assert!(adults.unsubscribe(id));
    bob.set("age", Value::BigInt(50)).unwrap();
    assert_eq!(events.lock().len(), 2);
}

#[test]
fn new_objects_join_matching_views() {
    let (store, _db, all) = loaded_store();
    let adults = all.filter(Expr::field("age").ge(18)).unwrap();
    let dan = store.create("users").unwrap();
    assert_eq!(dan.state(), ObjectState::Created);
    assert_eq!(all.count().unwrap(), 4);
    assert_eq!(adults.count().unwrap(), 2);

    dan.set("name", Value::from("dan")).unwrap();
    dan.set("age", Value::BigInt(33)).unwrap();
    assert!(adults.contains(&dan).unwrap());

    dan.delete().unwrap();
    assert_eq!(dan.state(), ObjectState::NotAttached);
    assert!(!adults.contains(&dan).unwrap());
    assert_eq!(all.count().unwrap(), 3);
}

#[test]
fn navigation_through_missing_objects_is_false() {
    let (_store, db, all) = loaded_store();
    db.respond("FROM \"teams\"", team_rows(&[(1, "core")]));
    let core = all
        .filter(Expr::field("team").member("name").eq("core"))
        .unwrap()
        .order_by(Expr::field("name"))
        .unwrap();
    assert_eq!(names(&core.items().unwrap()), ["ann", "cy"]);

    let bob = named(&all, "bob");
    assert!(bob.navigate("team").unwrap().is_none());
    assert!(!core.contains(&bob).unwrap());

    let team = named(&all, "ann").navigate("team").unwrap().unwrap();
    assert_eq!(common::name(&team), "core");
}

#[test]
fn projection_runs_in_memory() {
    let (_store, db, all) = loaded_store();
    let by_age = all.order_by(Expr::field("age")).unwrap();
    let ages = by_age.select_expr(&Expr::field("age")).unwrap();
    assert_eq!(ages, [Value::BigInt(17), Value::BigInt(30), Value::BigInt(40)]);

    let labels = by_age
        .select(|o| Ok(format!("{}:{}", common::name(o), o.get("age")?)))
        .unwrap();
    assert_eq!(labels[0], "bob:17");
    assert_eq!(db.execution_count(), 1);
}

#[test]
fn untranslatable_predicates_fail_before_reaching_the_database() {
    let (store, db) = store();
    let shout = SqlFunction::new("shout")
        .eval(|args| {
            Ok(Value::from(
                args[0].as_str().unwrap_or_default().to_uppercase(),
            ))
        })
        .build();
    let query = store
        .query("users")
        .unwrap()
        .filter(Expr::call(&shout, vec![Expr::field("name")]).eq("ANN"))
        .unwrap();

    let err = query.items().unwrap_err();
    assert!(err.is_translation());
    assert_eq!(db.execution_count(), 0);

    let cached = query.force_cache().unwrap();
    assert!(cached.items().unwrap().is_empty());
    assert_eq!(db.execution_count(), 0);
}

#[test]
fn async_fetch_warms_the_cache() {
    let (store, db) = store();
    db.respond("FROM \"teams\"", team_rows(&[(1, "core"), (2, "web")]));
    let teams = store.query("teams").unwrap();
    let handle = teams.fetch_async().unwrap();
    let fetched = handle.wait().unwrap();
    assert_eq!(names(&fetched), ["core", "web"]);

    assert!(teams.context().is_loaded());
    assert_eq!(teams.count().unwrap(), 2);
    assert!(teams.any().unwrap());
    assert_eq!(db.execution_count(), 1);
}

#[test]
fn forced_loads_skip_the_cache_shortcuts() {
    let (_store, db, all) = loaded_store();
    let ann = named(&all, "ann");
    let before = db.execution_count();
    assert!(all.any().unwrap());
    assert!(all.contains(&ann).unwrap());
    assert!(all.first_or_default().unwrap().is_some());
    assert_eq!(db.execution_count(), before);

    let forced = all.force_load().unwrap();
    assert!(forced.any().unwrap());
    assert_eq!(db.execution_count(), before + 1);
    assert!(forced.contains(&ann).unwrap());
    assert_eq!(db.execution_count(), before + 2);
    assert!(forced.first_or_default().unwrap().is_some());
    assert_eq!(db.execution_count(), before + 3);
}
