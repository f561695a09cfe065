mod common;

use common::FakeCluster;
use scylla_cql::frame::response::result::CqlValue;
use scylla_rust_models::cql::{self, Replication};
use scylla_rust_models::db::ClusterClient;
use scylla_rust_models::error::Error;
use serde_json::json;

const KS: &str = "pytest_cql_simple_keyspace";

fn plants() -> FakeCluster {
    let c = FakeCluster::new("pytest_tmp_cluster").with_table(
        KS,
        "plants",
        &["latin", "english", "german"],
        &["latin"],
        &[],
    );
    for (latin, english, german) in [
        ("lupulus", "wolve", "Wolf"),
        ("prunus", "plum", "Pflaume"),
        ("malus", "apple", "Apfel"),
    ] {
        c.insert_row(
            KS,
            "plants",
            &[
                ("latin", CqlValue::Text(latin.into())),
                ("english", CqlValue::Text(english.into())),
                ("german", CqlValue::Text(german.into())),
            ],
        );
    }
    c
}

#[tokio::test]
async fn simple_keyspace_creation() {
    let c = FakeCluster::new("pytest_tmp_cluster");
    cql::create_keyspace(&c, "pytest_simple", &Replication::simple(1))
        .await
        .unwrap();
    assert_eq!(
        c.statements(),
        vec![
            "CREATE KEYSPACE IF NOT EXISTS \"pytest_simple\" WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1} AND durable_writes = true;"
        ]
    );
    let no_commitlog = Replication::Simple {
        replication_factor: 3,
        durable_writes: false,
    };
    cql::create_keyspace(&c, "pytest_simple", &no_commitlog).await.unwrap();
    assert!(c.statements()[1].ends_with("'replication_factor': 3} AND durable_writes = false;"));
}

#[tokio::test]
async fn raw_replication_is_used_verbatim() {
    let c = FakeCluster::new("pytest_tmp_cluster");
    let expr = "{'class': 'NetworkTopologyStrategy', 'dc1': 3}";
    cql::create_keyspace(&c, "pytest_nts", &Replication::Raw(expr.into()))
        .await
        .unwrap();
    assert_eq!(
        c.statements()[0],
        format!("CREATE KEYSPACE IF NOT EXISTS \"pytest_nts\" WITH replication = {expr};")
    );
}

#[tokio::test]
async fn keyspace_names_must_be_identifiers() {
    let c = FakeCluster::new("pytest_tmp_cluster");
    let err = cql::create_keyspace(&c, "ks; DROP KEYSPACE system", &Replication::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIdentifier(_)));
    assert!(c.statements().is_empty());
}

#[tokio::test]
async fn select_column_keeps_store_order() {
    let c = plants();
    let values = cql::select_column(&c, KS, "plants", "german").await.unwrap();
    assert_eq!(values, vec![json!("Wolf"), json!("Pflaume"), json!("Apfel")]);
    assert_eq!(
        c.statements(),
        vec!["SELECT \"german\" FROM \"pytest_cql_simple_keyspace\".\"plants\""]
    );
}

#[tokio::test]
async fn select_all_returns_row_maps() {
    let c = plants();
    let rows = cql::select_all(&c, KS, "plants").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["latin"], json!("lupulus"));
    assert_eq!(rows[2]["english"], json!("apple"));
    assert!(rows.iter().all(|r| r.len() == 3));
}

#[tokio::test]
async fn delete_row_binds_the_stored_value() {
    let c = plants();
    cql::delete_row(&c, KS, "plants", "latin", &json!("prunus"))
        .await
        .unwrap();
    let last = c.last_statement().unwrap();
    assert_eq!(
        last.cql,
        "DELETE FROM \"pytest_cql_simple_keyspace\".\"plants\" WHERE \"latin\" = ?"
    );
    assert_eq!(last.values, vec![CqlValue::Text("prunus".into())]);

    let left = cql::select_column(&c, KS, "plants", "latin").await.unwrap();
    assert_eq!(left, vec![json!("lupulus"), json!("malus")]);

    // deleting it again fails the value check instead of silently passing
    let err = cql::delete_row(&c, KS, "plants", "latin", &json!("prunus"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownValue(ref v) if v == "prunus"));
}

#[tokio::test]
async fn delete_row_matches_float_keys_at_column_precision() {
    let c = FakeCluster::new("pytest_tmp_cluster").with_table(
        KS,
        "readings",
        &["ratio", "label"],
        &["ratio"],
        &[],
    );
    c.insert_row(
        KS,
        "readings",
        &[
            ("ratio", CqlValue::Float(0.1)),
            ("label", CqlValue::Text("tenth".into())),
        ],
    );
    cql::delete_row(&c, KS, "readings", "ratio", &json!(0.1))
        .await
        .unwrap();
    assert_eq!(c.last_statement().unwrap().values, vec![CqlValue::Float(0.1)]);
    assert!(c.table(KS, "readings").unwrap().rows.is_empty());

    let err = cql::delete_row(&c, KS, "readings", "ratio", &json!(0.1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownValue(ref v) if v == "0.1"));
}

#[tokio::test]
async fn truncate_removes_every_row() {
    let c = plants();
    cql::truncate_table(&c, KS, "plants").await.unwrap();
    assert_eq!(
        c.last_statement().unwrap().cql,
        "TRUNCATE \"pytest_cql_simple_keyspace\".\"plants\""
    );
    assert!(cql::select_all(&c, KS, "plants").await.unwrap().is_empty());
}

#[tokio::test]
async fn cluster_name_comes_from_system_local() {
    let c = FakeCluster::new("pytest_tmp_cluster");
    assert_eq!(c.cluster_name().await.unwrap(), "pytest_tmp_cluster");
}
