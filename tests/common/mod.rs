#![allow(dead_code)]
// In-memory stand-in for a cluster. It understands exactly the statement
// shapes this crate emits and records every statement it executes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use scylla_cql::frame::response::result::CqlValue;
use scylla_rust_models::db::{ClusterClient, MetadataCatalog, RowSet, Statement};
use scylla_rust_models::error::{Error, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<String>,
    pub partition_keys: Vec<String>,
    pub clustering_keys: Vec<String>,
    pub rows: Vec<BTreeMap<String, CqlValue>>,
}

impl FakeTable {
    fn key_columns(&self) -> Vec<String> {
        self.partition_keys
            .iter()
            .chain(self.clustering_keys.iter())
            .cloned()
            .collect()
    }

    fn key_of(&self, row: &BTreeMap<String, CqlValue>) -> Vec<Option<CqlValue>> {
        self.key_columns().iter().map(|k| row.get(k).cloned()).collect()
    }

    fn matches(row: &BTreeMap<String, CqlValue>, filter: &[(String, CqlValue)]) -> bool {
        filter.iter().all(|(col, v)| row.get(col) == Some(v))
    }

    fn to_rowset(&self, rows: impl Iterator<Item = BTreeMap<String, CqlValue>>) -> RowSet {
        RowSet {
            columns: self.columns.clone(),
            rows: rows
                .map(|row| self.columns.iter().map(|c| row.get(c).cloned()).collect())
                .collect(),
        }
    }
}

type Keyspaces = BTreeMap<String, BTreeMap<String, FakeTable>>;

pub struct FakeCluster {
    name: String,
    state: Mutex<Keyspaces>,
    log: Mutex<Vec<Statement>>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_keyspace(self, keyspace: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .entry(keyspace.to_string())
            .or_default();
        self
    }

    pub fn with_table(
        self,
        keyspace: &str,
        table: &str,
        columns: &[&str],
        partition_keys: &[&str],
        clustering_keys: &[&str],
    ) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        self.state
            .lock()
            .unwrap()
            .entry(keyspace.to_string())
            .or_default()
            .insert(
                table.to_string(),
                FakeTable {
                    columns: owned(columns),
                    partition_keys: owned(partition_keys),
                    clustering_keys: owned(clustering_keys),
                    rows: Vec::new(),
                },
            );
        self
    }

    pub fn insert_row(&self, keyspace: &str, table: &str, row: &[(&str, CqlValue)]) {
        let mut state = self.state.lock().unwrap();
        let t = state
            .get_mut(keyspace)
            .and_then(|ks| ks.get_mut(table))
            .expect("table configured");
        t.rows
            .push(row.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<FakeTable> {
        self.state
            .lock()
            .unwrap()
            .get(keyspace)
            .and_then(|ks| ks.get(table))
            .cloned()
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|s| s.cql.clone()).collect()
    }

    pub fn last_statement(&self) -> Option<Statement> {
        self.log.lock().unwrap().last().cloned()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn apply(&self, stmt: &Statement) -> Result<RowSet> {
        let cql = stmt.cql.as_str();
        let ids = idents(cql);
        let mut state = self.state.lock().unwrap();

        if cql.starts_with("SELECT cluster_name FROM system.local") {
            return Ok(RowSet {
                columns: vec!["cluster_name".into()],
                rows: vec![vec![Some(CqlValue::Text(self.name.clone()))]],
            });
        }
        if cql.starts_with("CREATE KEYSPACE IF NOT EXISTS") {
            state.entry(ids[0].clone()).or_default();
            return Ok(RowSet::default());
        }
        if cql.starts_with("CREATE TABLE IF NOT EXISTS") {
            let (keyspace, name, table) = parse_create_table(cql);
            let ks = state
                .get_mut(&keyspace)
                .ok_or_else(|| fail(&format!("keyspace {keyspace} does not exist")))?;
            ks.entry(name).or_insert(table);
            return Ok(RowSet::default());
        }

        if cql.starts_with("SELECT ") && !cql.starts_with("SELECT *") {
            // SELECT "col" FROM "ks"."table"
            let t = state
                .get(&ids[1])
                .and_then(|ks| ks.get(&ids[2]))
                .ok_or_else(|| fail("unconfigured table"))?;
            let column = ids[0].clone();
            return Ok(RowSet {
                columns: vec![column.clone()],
                rows: t.rows.iter().map(|r| vec![r.get(&column).cloned()]).collect(),
            });
        }

        let t = state
            .get_mut(ids.first().map(String::as_str).unwrap_or_default())
            .and_then(|ks| ks.get_mut(ids.get(1).map(String::as_str).unwrap_or_default()))
            .ok_or_else(|| fail("unconfigured table"))?;
        let filter: Vec<(String, CqlValue)> = ids
            .iter()
            .skip(2)
            .cloned()
            .zip(stmt.values.iter().cloned())
            .collect();

        if cql.starts_with("ALTER TABLE") {
            if !t.columns.contains(&ids[2]) {
                t.columns.push(ids[2].clone());
            }
            Ok(RowSet::default())
        } else if cql.starts_with("INSERT INTO") {
            let row: BTreeMap<String, CqlValue> = filter.into_iter().collect();
            let key = t.key_of(&row);
            match t.rows.iter().position(|r| t.key_of(r) == key) {
                Some(idx) => t.rows[idx].extend(row),
                None => t.rows.push(row),
            }
            Ok(RowSet::default())
        } else if cql.starts_with("SELECT *") {
            let rows: Vec<_> = t
                .rows
                .iter()
                .filter(|r| FakeTable::matches(r, &filter))
                .cloned()
                .collect();
            Ok(t.to_rowset(rows.into_iter()))
        } else if cql.starts_with("DELETE FROM") {
            t.rows.retain(|r| !FakeTable::matches(r, &filter));
            Ok(RowSet::default())
        } else if cql.starts_with("TRUNCATE") {
            t.rows.clear();
            Ok(RowSet::default())
        } else {
            Err(fail(&format!("unsupported statement: {cql}")))
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn execute(&self, statement: &Statement) -> Result<RowSet> {
        self.log.lock().unwrap().push(statement.clone());
        self.apply(statement)
    }
}

#[async_trait]
impl MetadataCatalog for FakeCluster {
    async fn keyspace_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().keys().cloned().collect())
    }

    async fn table_names(&self, keyspace: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(keyspace)
            .map(|ks| ks.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn column_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>> {
        Ok(self
            .table(keyspace, table)
            .map(|t| t.columns)
            .unwrap_or_default())
    }

    async fn primary_key_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>> {
        Ok(self
            .table(keyspace, table)
            .map(|t| t.key_columns())
            .unwrap_or_default())
    }
}

fn fail(msg: &str) -> Error {
    Error::transport(msg.to_string())
}

/// Double-quoted identifiers in order of appearance.
pub fn idents(cql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = cql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            continue;
        }
        let mut ident = String::new();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    ident.push('"');
                } else {
                    break;
                }
            } else {
                ident.push(c);
            }
        }
        out.push(ident);
    }
    out
}

// CREATE TABLE IF NOT EXISTS "ks"."t" ("a" text, "b" text, PRIMARY KEY (("a"), "b")) WITH ...
fn parse_create_table(cql: &str) -> (String, String, FakeTable) {
    let head = cql.split(" WITH CLUSTERING ORDER BY").next().unwrap();
    let (defs, primary) = head.split_once(", PRIMARY KEY ").unwrap();
    let ids = idents(defs);
    let (partition, clustering) = primary.split_once(')').unwrap();
    let table = FakeTable {
        columns: ids[2..].to_vec(),
        partition_keys: idents(partition),
        clustering_keys: idents(clustering),
        rows: Vec::new(),
    };
    (ids[0].clone(), ids[1].clone(), table)
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
