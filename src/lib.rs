pub mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    use crate::schema::DataType;

    pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Error)]
    pub enum Error {
        #[error("Unknown keyspace: '{0}'")]
        UnknownKeyspace(String),
        #[error("Unknown table: '{0}'")]
        UnknownTable(String),
        #[error("Unknown column: '{0}'")]
        UnknownColumn(String),
        #[error("Unknown primary key: '{0}'")]
        UnknownPrimaryKey(String),
        #[error("Unknown primary key value: '{0}'")]
        UnknownValue(String),
        #[error("invalid key shape: {0}")]
        InvalidKeyShape(String),
        #[error("invalid identifier: '{0}'")]
        InvalidIdentifier(String),
        #[error("invalid model '{model}': {reason}")]
        InvalidModel { model: String, reason: String },
        #[error("unknown data type: '{0}'")]
        UnknownDataType(String),
        #[error("invalid clustering order: '{0}'")]
        InvalidClusteringOrder(String),
        #[error("invalid value for column '{column}': expected {expected}")]
        InvalidValue { column: String, expected: DataType },
        #[error("missing key column: '{0}'")]
        MissingKey(String),
        #[error("no entry in '{table}' where {filter}")]
        NotFound { table: String, filter: String },
        #[error("{count} entries in '{table}' where {filter}, expected one")]
        MultipleMatches {
            table: String,
            filter: String,
            count: usize,
        },
        #[error("no artifact at {}", .0.display())]
        ArtifactNotFound(PathBuf),
        #[error("model '{symbol}' not found in {}", .path.display())]
        SymbolNotFound { symbol: String, path: PathBuf },
        #[error("existing artifact at {}\nSet overwrite or change the path", .0.display())]
        ArtifactExists(PathBuf),
        #[error("unknown connection: '{0}'")]
        UnknownConnection(String),
        #[error("invalid configuration: {0}")]
        Config(String),
        #[error("malformed artifact: {0}")]
        Artifact(#[from] serde_json::Error),
        #[error(transparent)]
        Io(#[from] std::io::Error),
        #[error("cluster error: {0}")]
        Transport(#[source] BoxError),
    }

    impl Error {
        /// Wrap a driver-side failure, keeping it as the error source.
        pub fn transport<E>(err: E) -> Self
        where
            E: Into<BoxError>,
        {
            Error::Transport(err.into())
        }

        /// Bad caller input, rejected before anything was sent or written.
        pub fn is_validation(&self) -> bool {
            matches!(
                self,
                Error::UnknownKeyspace(_)
                    | Error::UnknownTable(_)
                    | Error::UnknownColumn(_)
                    | Error::UnknownPrimaryKey(_)
                    | Error::UnknownValue(_)
                    | Error::InvalidKeyShape(_)
                    | Error::InvalidIdentifier(_)
                    | Error::InvalidModel { .. }
                    | Error::UnknownDataType(_)
                    | Error::InvalidClusteringOrder(_)
                    | Error::InvalidValue { .. }
                    | Error::MissingKey(_)
            )
        }

        pub fn is_not_found(&self) -> bool {
            matches!(
                self,
                Error::NotFound { .. } | Error::ArtifactNotFound(_) | Error::SymbolNotFound { .. }
            )
        }

        pub fn is_conflict(&self) -> bool {
            matches!(self, Error::ArtifactExists(_))
        }
    }
}

pub mod config {
    use std::env;
    use std::path::PathBuf;

    use crate::error::{Error, Result};

    pub const DEFAULT_URI: &str = "127.0.0.1:9042";
    pub const DEFAULT_PORT: u16 = 9042;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Credentials {
        pub user: String,
        pub password: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct SslConfig {
        pub ca_bundle: Option<PathBuf>,
        pub insecure: bool,
    }

    /// How to reach the cluster. Built by hand or from the `SCYLLA_*` environment.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClusterConfig {
        pub contact_points: Vec<String>,
        pub port: u16,
        pub credentials: Option<Credentials>,
        pub ssl: Option<SslConfig>,
    }

    impl Default for ClusterConfig {
        fn default() -> Self {
            Self::new(["127.0.0.1"], DEFAULT_PORT)
        }
    }

    impl ClusterConfig {
        pub fn new<I, S>(contact_points: I, port: u16) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                contact_points: contact_points.into_iter().map(Into::into).collect(),
                port,
                credentials: None,
                ssl: None,
            }
        }

        pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
            self.credentials = Some(Credentials {
                user: user.into(),
                password: password.into(),
            });
            self
        }

        pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
            self.ssl = Some(ssl);
            self
        }

        pub fn from_env() -> Result<Self> {
            Self::from_lookup(|key| env::var(key).ok())
        }

        /// Same as [`ClusterConfig::from_env`] but reading variables through `lookup`.
        pub fn from_lookup<F>(lookup: F) -> Result<Self>
        where
            F: Fn(&str) -> Option<String>,
        {
            let port = match lookup("SCYLLA_PORT") {
                Some(raw) => raw
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid SCYLLA_PORT '{raw}'")))?,
                None => DEFAULT_PORT,
            };
            let uri = lookup("SCYLLA_URI").unwrap_or_else(|| DEFAULT_URI.to_string());
            let contact_points: Vec<String> = uri
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if contact_points.is_empty() {
                return Err(Error::Config("SCYLLA_URI names no contact points".into()));
            }
            let mut config = Self::new(contact_points, port);
            if let (Some(user), Some(pass)) = (lookup("SCYLLA_USER"), lookup("SCYLLA_PASS")) {
                config = config.with_credentials(user, pass);
            }
            if lookup("SCYLLA_SSL").as_deref().is_some_and(is_truthy) {
                config = config.with_ssl(SslConfig {
                    ca_bundle: lookup("SCYLLA_CA_BUNDLE").map(PathBuf::from),
                    insecure: lookup("SCYLLA_SSL_INSECURE").as_deref().is_some_and(is_truthy),
                });
            }
            Ok(config)
        }

        /// Contact points as `host:port`; hosts that already carry a port keep it.
        pub fn known_nodes(&self) -> Vec<String> {
            self.contact_points
                .iter()
                .map(|host| {
                    if host.starts_with('[') {
                        if host.contains("]:") {
                            host.clone()
                        } else {
                            format!("{host}:{}", self.port)
                        }
                    } else if host.matches(':').count() == 1 {
                        host.clone()
                    } else if host.contains(':') {
                        format!("[{host}]:{}", self.port)
                    } else {
                        format!("{host}:{}", self.port)
                    }
                })
                .collect()
        }
    }

    fn is_truthy(v: &str) -> bool {
        v == "1" || v.eq_ignore_ascii_case("true")
    }
}

pub mod schema {
    use std::fmt;
    use std::net::IpAddr;
    use std::str::FromStr;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;
    use scylla_cql::frame::response::result::CqlValue;
    use scylla_cql::frame::value::{CqlTimestamp, CqlTimeuuid};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use uuid::Uuid;

    use crate::error::{Error, Result};

    /// Column types a table model can declare.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DataType {
        Ascii,
        Text,
        Boolean,
        TinyInt,
        SmallInt,
        Int,
        BigInt,
        Float,
        Double,
        Blob,
        Uuid,
        TimeUuid,
        Timestamp,
        Inet,
    }

    impl DataType {
        pub fn cql_name(self) -> &'static str {
            match self {
                DataType::Ascii => "ascii",
                DataType::Text => "text",
                DataType::Boolean => "boolean",
                DataType::TinyInt => "tinyint",
                DataType::SmallInt => "smallint",
                DataType::Int => "int",
                DataType::BigInt => "bigint",
                DataType::Float => "float",
                DataType::Double => "double",
                DataType::Blob => "blob",
                DataType::Uuid => "uuid",
                DataType::TimeUuid => "timeuuid",
                DataType::Timestamp => "timestamp",
                DataType::Inet => "inet",
            }
        }

        /// Convert a caller payload into a value of this type, ready to be bound.
        ///
        /// Blobs are base64 text, timestamps are milliseconds since the epoch,
        /// uuids and inet addresses are their usual string forms.
        pub fn bind(self, column: &str, value: &Value) -> Result<CqlValue> {
            let mismatch = || Error::InvalidValue {
                column: column.to_string(),
                expected: self,
            };
            let int = |n: &serde_json::Number| n.as_i64().ok_or_else(mismatch);
            let bound = match (self, value) {
                (DataType::Ascii, Value::String(s)) if s.is_ascii() => CqlValue::Ascii(s.clone()),
                (DataType::Text, Value::String(s)) => CqlValue::Text(s.clone()),
                (DataType::Boolean, Value::Bool(b)) => CqlValue::Boolean(*b),
                (DataType::TinyInt, Value::Number(n)) => {
                    CqlValue::TinyInt(i8::try_from(int(n)?).map_err(|_| mismatch())?)
                }
                (DataType::SmallInt, Value::Number(n)) => {
                    CqlValue::SmallInt(i16::try_from(int(n)?).map_err(|_| mismatch())?)
                }
                (DataType::Int, Value::Number(n)) => {
                    CqlValue::Int(i32::try_from(int(n)?).map_err(|_| mismatch())?)
                }
                (DataType::BigInt, Value::Number(n)) => CqlValue::BigInt(int(n)?),
                (DataType::Float, Value::Number(n)) => {
                    CqlValue::Float(n.as_f64().ok_or_else(mismatch)? as f32)
                }
                (DataType::Double, Value::Number(n)) => {
                    CqlValue::Double(n.as_f64().ok_or_else(mismatch)?)
                }
                (DataType::Blob, Value::String(s)) => {
                    CqlValue::Blob(B64.decode(s.as_bytes()).map_err(|_| mismatch())?)
                }
                (DataType::Uuid, Value::String(s)) => {
                    CqlValue::Uuid(Uuid::parse_str(s).map_err(|_| mismatch())?)
                }
                (DataType::TimeUuid, Value::String(s)) => CqlValue::Timeuuid(CqlTimeuuid::from(
                    Uuid::parse_str(s).map_err(|_| mismatch())?,
                )),
                (DataType::Timestamp, Value::Number(n)) => {
                    CqlValue::Timestamp(CqlTimestamp(int(n)?))
                }
                (DataType::Inet, Value::String(s)) => {
                    CqlValue::Inet(s.parse::<IpAddr>().map_err(|_| mismatch())?)
                }
                _ => return Err(mismatch()),
            };
            Ok(bound)
        }
    }

    impl fmt::Display for DataType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.cql_name())
        }
    }

    impl FromStr for DataType {
        type Err = Error;

        // Accepts CQL type names as well as the column class names model
        // definitions are usually written with ("Integer", "DateTime", ...).
        fn from_str(s: &str) -> Result<Self> {
            let ty = match s.trim().to_ascii_lowercase().as_str() {
                "ascii" => DataType::Ascii,
                "text" | "varchar" => DataType::Text,
                "boolean" | "bool" => DataType::Boolean,
                "tinyint" => DataType::TinyInt,
                "smallint" => DataType::SmallInt,
                "int" | "integer" => DataType::Int,
                "bigint" => DataType::BigInt,
                "float" => DataType::Float,
                "double" => DataType::Double,
                "blob" => DataType::Blob,
                "uuid" => DataType::Uuid,
                "timeuuid" => DataType::TimeUuid,
                "timestamp" | "datetime" => DataType::Timestamp,
                "inet" => DataType::Inet,
                _ => return Err(Error::UnknownDataType(s.to_string())),
            };
            Ok(ty)
        }
    }

    pub fn cql_value_to_json(v: &CqlValue) -> Value {
        match v {
            CqlValue::Boolean(b) => Value::Bool(*b),
            CqlValue::TinyInt(i) => Value::from(*i),
            CqlValue::SmallInt(i) => Value::from(*i),
            CqlValue::Int(i) => Value::from(*i),
            CqlValue::BigInt(i) => Value::from(*i),
            CqlValue::Counter(c) => Value::from(c.0),
            CqlValue::Float(f) => Value::from(*f),
            CqlValue::Double(f) => Value::from(*f),
            CqlValue::Ascii(s) | CqlValue::Text(s) => Value::from(s.clone()),
            CqlValue::Uuid(u) => Value::from(u.to_string()),
            CqlValue::Timeuuid(u) => Value::from(u.to_string()),
            CqlValue::Timestamp(ts) => Value::from(ts.0),
            CqlValue::Inet(addr) => Value::from(addr.to_string()),
            CqlValue::Blob(bytes) => Value::from(B64.encode(bytes)),
            CqlValue::Empty => Value::Null,
            CqlValue::List(items) => Value::Array(items.iter().map(cql_value_to_json).collect()),
            CqlValue::Set(items) => Value::Array(items.iter().map(cql_value_to_json).collect()),
            CqlValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (cql_map_key_to_string(k), cql_value_to_json(v)))
                    .collect(),
            ),
            CqlValue::Tuple(values) => Value::Array(
                values
                    .iter()
                    .map(|opt| opt.as_ref().map(cql_value_to_json).unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => Value::from(format!("{:?}", v)),
        }
    }

    fn cql_map_key_to_string(k: &CqlValue) -> String {
        match k {
            CqlValue::Ascii(s) | CqlValue::Text(s) => s.clone(),
            CqlValue::Uuid(u) => u.to_string(),
            CqlValue::Int(i) => i.to_string(),
            CqlValue::BigInt(i) => i.to_string(),
            _ => format!("{:?}", k),
        }
    }

    /// Plain identifier: ASCII letter or underscore, then letters, digits, underscores.
    pub fn is_identifier(ident: &str) -> bool {
        let bytes = ident.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let first = bytes[0];
        let is_letter = |c: u8| c.is_ascii_alphabetic() || c == b'_';
        let is_alnum = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
        if !is_letter(first) {
            return false;
        }
        bytes.iter().all(|&c| is_alnum(c))
    }

    /// Double-quote an identifier so CQL keeps its exact case.
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// `"keyspace"."table"`
    pub fn qualified(keyspace: &str, table: &str) -> String {
        format!("{}.{}", quote_ident(keyspace), quote_ident(table))
    }

    /// Render a payload value for messages: strings bare, everything else as JSON.
    pub fn display_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub mod model {
    use std::collections::HashSet;
    use std::fmt;
    use std::str::FromStr;
    use std::sync::Arc;

    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    use crate::db::Connection;
    use crate::error::{Error, Result};
    use crate::schema::{DataType, is_identifier};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum ClusteringOrder {
        #[default]
        Asc,
        Desc,
    }

    impl ClusteringOrder {
        pub fn as_str(self) -> &'static str {
            match self {
                ClusteringOrder::Asc => "ASC",
                ClusteringOrder::Desc => "DESC",
            }
        }
    }

    impl FromStr for ClusteringOrder {
        type Err = Error;

        fn from_str(s: &str) -> Result<Self> {
            match s.trim().to_ascii_lowercase().as_str() {
                "asc" => Ok(ClusteringOrder::Asc),
                "desc" => Ok(ClusteringOrder::Desc),
                _ => Err(Error::InvalidClusteringOrder(s.to_string())),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClusteringKey {
        #[serde(rename = "type")]
        pub data_type: DataType,
        #[serde(default)]
        pub order: ClusteringOrder,
    }

    /// Declarative description of one table: its name, key layout and columns.
    ///
    /// `primary_keys` and `clustering_keys` are ordered; their order is the CQL
    /// primary key order. Clustering keys are appended after the partition keys.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TableModel {
        pub name: String,
        /// Use `name` verbatim as the table identifier instead of its lower-cased form.
        #[serde(default)]
        pub case_sensitive: bool,
        pub primary_keys: IndexMap<String, DataType>,
        #[serde(default)]
        pub clustering_keys: IndexMap<String, ClusteringKey>,
        #[serde(default)]
        pub columns: IndexMap<String, DataType>,
    }

    impl TableModel {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                case_sensitive: false,
                primary_keys: IndexMap::new(),
                clustering_keys: IndexMap::new(),
                columns: IndexMap::new(),
            }
        }

        pub fn primary_key(mut self, name: impl Into<String>, data_type: DataType) -> Self {
            self.primary_keys.insert(name.into(), data_type);
            self
        }

        pub fn clustering_key(
            mut self,
            name: impl Into<String>,
            data_type: DataType,
            order: ClusteringOrder,
        ) -> Self {
            self.clustering_keys
                .insert(name.into(), ClusteringKey { data_type, order });
            self
        }

        pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
            self.columns.insert(name.into(), data_type);
            self
        }

        pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
            self.case_sensitive = case_sensitive;
            self
        }

        /// Identifier of the backing table.
        pub fn table_name(&self) -> String {
            if self.case_sensitive {
                self.name.clone()
            } else {
                self.name.to_lowercase()
            }
        }

        /// Partition keys followed by clustering keys.
        pub fn key_columns(&self) -> impl Iterator<Item = (&str, DataType)> + '_ {
            self.primary_keys
                .iter()
                .map(|(n, t)| (n.as_str(), *t))
                .chain(
                    self.clustering_keys
                        .iter()
                        .map(|(n, k)| (n.as_str(), k.data_type)),
                )
        }

        /// Every column in declaration order: keys first, then regular columns.
        pub fn all_columns(&self) -> impl Iterator<Item = (&str, DataType)> + '_ {
            self.key_columns()
                .chain(self.columns.iter().map(|(n, t)| (n.as_str(), *t)))
        }

        pub fn data_type(&self, column: &str) -> Option<DataType> {
            self.primary_keys
                .get(column)
                .copied()
                .or_else(|| self.clustering_keys.get(column).map(|k| k.data_type))
                .or_else(|| self.columns.get(column).copied())
        }

        pub fn is_key(&self, column: &str) -> bool {
            self.primary_keys.contains_key(column) || self.clustering_keys.contains_key(column)
        }

        pub fn validate(&self) -> Result<()> {
            if !is_identifier(&self.name) {
                return Err(Error::InvalidIdentifier(self.name.clone()));
            }
            if self.primary_keys.is_empty() {
                return Err(self.invalid("at least one primary key is required"));
            }
            let mut seen = HashSet::new();
            for (column, _) in self.all_columns() {
                if !is_identifier(column) {
                    return Err(Error::InvalidIdentifier(column.to_string()));
                }
                if !seen.insert(column) {
                    return Err(self.invalid(format!("column '{column}' is declared twice")));
                }
            }
            Ok(())
        }

        fn invalid(&self, reason: impl Into<String>) -> Error {
            Error::InvalidModel {
                model: self.name.clone(),
                reason: reason.into(),
            }
        }
    }

    /// One row of a model's table, tied to the keyspace it was read from or written to.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Entry {
        pub keyspace: String,
        pub table: String,
        pub values: Map<String, Value>,
    }

    impl Entry {
        pub fn get(&self, column: &str) -> Option<&Value> {
            self.values.get(column)
        }

        pub fn get_str(&self, column: &str) -> Option<&str> {
            self.values.get(column).and_then(Value::as_str)
        }
    }

    /// Keyspace and connection a model operation runs against.
    ///
    /// Passed explicitly to every call; models never carry a binding themselves.
    #[derive(Clone)]
    pub struct Binding {
        keyspace: String,
        connection: Arc<dyn Connection>,
    }

    impl Binding {
        pub fn new(keyspace: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
            Self {
                keyspace: keyspace.into(),
                connection,
            }
        }

        pub fn keyspace(&self) -> &str {
            &self.keyspace
        }

        pub fn connection(&self) -> &dyn Connection {
            self.connection.as_ref()
        }

        pub fn with_keyspace(&self, keyspace: impl Into<String>) -> Self {
            Self {
                keyspace: keyspace.into(),
                connection: Arc::clone(&self.connection),
            }
        }
    }

    impl fmt::Debug for Binding {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Binding")
                .field("keyspace", &self.keyspace)
                .finish_non_exhaustive()
        }
    }
}

pub mod db {
    use std::collections::HashMap;
    use std::sync::{Arc, PoisonError, RwLock};

    use async_trait::async_trait;
    use scylla::{Session, SessionBuilder};
    use scylla_cql::frame::response::result::{CqlValue, Row};
    use serde::Serialize;
    use serde_json::{Map, Value};
    use tracing::{debug, info};

    use crate::config::{ClusterConfig, SslConfig};
    use crate::error::{Error, Result};
    use crate::model::{Binding, TableModel};
    use crate::schema::cql_value_to_json;

    /// CQL text plus the values bound to its `?` markers.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Statement {
        pub cql: String,
        pub values: Vec<CqlValue>,
    }

    impl Statement {
        pub fn new(cql: impl Into<String>) -> Self {
            Self {
                cql: cql.into(),
                values: Vec::new(),
            }
        }

        pub fn with_values(cql: impl Into<String>, values: Vec<CqlValue>) -> Self {
            Self {
                cql: cql.into(),
                values,
            }
        }
    }

    /// Result rows in the order the cluster returned them.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct RowSet {
        pub columns: Vec<String>,
        pub rows: Vec<Vec<Option<CqlValue>>>,
    }

    impl RowSet {
        pub fn is_empty(&self) -> bool {
            self.rows.is_empty()
        }

        /// Values of one column, one per row.
        pub fn column_values(self, column: &str) -> Vec<Option<CqlValue>> {
            let Some(idx) = self.columns.iter().position(|c| c == column) else {
                return Vec::new();
            };
            self.rows
                .into_iter()
                .map(|mut row| if idx < row.len() { row.swap_remove(idx) } else { None })
                .collect()
        }

        pub fn into_json(self) -> Vec<Map<String, Value>> {
            let mut out: Vec<Map<String, Value>> = Vec::with_capacity(self.rows.len());
            for row in self.rows.iter() {
                let mut m = Map::new();
                for (i, name) in self.columns.iter().enumerate() {
                    let val = row.get(i).and_then(|o| o.as_ref());
                    let json = match val {
                        Some(c) => cql_value_to_json(c),
                        None => Value::Null,
                    };
                    m.insert(name.clone(), json);
                }
                out.push(m);
            }
            out
        }
    }

    #[async_trait]
    pub trait ClusterClient: Send + Sync {
        async fn execute(&self, statement: &Statement) -> Result<RowSet>;

        async fn cluster_name(&self) -> Result<String> {
            let rows = self
                .execute(&Statement::new("SELECT cluster_name FROM system.local"))
                .await?;
            rows.column_values("cluster_name")
                .into_iter()
                .flatten()
                .find_map(|v| match v {
                    CqlValue::Ascii(s) | CqlValue::Text(s) => Some(s),
                    _ => None,
                })
                .ok_or_else(|| Error::NotFound {
                    table: "system.local".into(),
                    filter: "cluster_name IS NOT NULL".into(),
                })
        }
    }

    /// Read-only view of live schema. Implementations must not cache between calls.
    #[async_trait]
    pub trait MetadataCatalog: Send + Sync {
        async fn keyspace_names(&self) -> Result<Vec<String>>;
        async fn table_names(&self, keyspace: &str) -> Result<Vec<String>>;
        async fn column_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>>;
        async fn primary_key_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>>;
    }

    pub trait Connection: ClusterClient + MetadataCatalog {}

    impl<T: ClusterClient + MetadataCatalog> Connection for T {}

    #[derive(Debug, Serialize, Clone)]
    pub struct ColumnMeta {
        pub column_name: String,
        pub kind: String,
        pub position: i32,
        pub r#type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub clustering_order: Option<String>,
    }

    #[derive(Debug, Serialize, Clone)]
    pub struct DescribeTable {
        pub keyspace: String,
        pub table: String,
        pub partition_keys: Vec<String>,
        pub clustering_keys: Vec<String>,
        pub columns: Vec<ColumnMeta>,
    }

    impl DescribeTable {
        /// Partition keys, clustering keys, then the remaining columns.
        pub fn column_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .partition_keys
                .iter()
                .chain(self.clustering_keys.iter())
                .cloned()
                .collect();
            for col in &self.columns {
                if !names.contains(&col.column_name) {
                    names.push(col.column_name.clone());
                }
            }
            names
        }

        fn column(&self, name: &str) -> Result<&ColumnMeta> {
            self.columns
                .iter()
                .find(|c| c.column_name == name)
                .ok_or_else(|| Error::UnknownColumn(name.to_string()))
        }
    }

    impl TryFrom<&DescribeTable> for TableModel {
        type Error = Error;

        fn try_from(desc: &DescribeTable) -> Result<Self> {
            let mut model = TableModel::new(desc.table.clone()).case_sensitive(true);
            for name in &desc.partition_keys {
                model = model.primary_key(name.clone(), desc.column(name)?.r#type.parse()?);
            }
            for name in &desc.clustering_keys {
                let col = desc.column(name)?;
                let order = col.clustering_order.as_deref().unwrap_or("asc").parse()?;
                model = model.clustering_key(name.clone(), col.r#type.parse()?, order);
            }
            for col in desc
                .columns
                .iter()
                .filter(|c| c.kind == "regular" || c.kind == "static")
            {
                model = model.column(col.column_name.clone(), col.r#type.parse()?);
            }
            Ok(model)
        }
    }

    pub struct ScyllaConnection {
        session: Session,
    }

    impl ScyllaConnection {
        pub fn new(session: Session) -> Self {
            Self { session }
        }

        pub fn session(&self) -> &Session {
            &self.session
        }

        pub async fn describe_table(&self, keyspace: &str, table: &str) -> Result<DescribeTable> {
            let result = self
                .session
                .query_unpaged(
                    "SELECT column_name, kind, position, type, clustering_order FROM system_schema.columns WHERE keyspace_name = ? AND table_name = ?",
                    (keyspace.to_string(), table.to_string()),
                )
                .await
                .map_err(Error::transport)?;
            let specs = result.col_specs().to_owned();
            let mut idx_name = None;
            let mut idx_kind = None;
            let mut idx_pos = None;
            let mut idx_type = None;
            let mut idx_order = None;
            for (i, spec) in specs.iter().enumerate() {
                match spec.name.as_str() {
                    "column_name" => idx_name = Some(i),
                    "kind" => idx_kind = Some(i),
                    "position" => idx_pos = Some(i),
                    "type" => idx_type = Some(i),
                    "clustering_order" => idx_order = Some(i),
                    _ => {}
                }
            }
            let rows = result.rows_or_empty();
            let mut cols = Vec::with_capacity(rows.len());
            for row in rows.iter() {
                let pos = idx_pos
                    .and_then(|i| row.columns.get(i))
                    .and_then(|o| o.as_ref())
                    .and_then(|v| match v {
                        CqlValue::Int(i) => Some(*i),
                        _ => None,
                    })
                    .unwrap_or(0);
                cols.push(ColumnMeta {
                    column_name: text_at(row, idx_name).unwrap_or_default(),
                    kind: text_at(row, idx_kind).unwrap_or_default(),
                    position: pos,
                    r#type: text_at(row, idx_type).unwrap_or_default(),
                    clustering_order: text_at(row, idx_order),
                });
            }
            let keys_of = |kind: &str| {
                let mut keys: Vec<(i32, String)> = cols
                    .iter()
                    .filter(|c| c.kind == kind)
                    .map(|c| (c.position, c.column_name.clone()))
                    .collect();
                keys.sort_by_key(|(pos, _)| *pos);
                keys.into_iter().map(|(_, n)| n).collect::<Vec<String>>()
            };
            let partition_keys = keys_of("partition_key");
            let clustering_keys = keys_of("clustering");
            Ok(DescribeTable {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                partition_keys,
                clustering_keys,
                columns: cols,
            })
        }

        async fn single_text_column(&self, cql: &str, values: Vec<String>) -> Result<Vec<String>> {
            let result = self
                .session
                .query_unpaged(cql, values)
                .await
                .map_err(Error::transport)?;
            let names = result
                .rows_or_empty()
                .iter()
                .filter_map(|row| text_at(row, Some(0)))
                .collect();
            Ok(names)
        }
    }

    fn text_at(row: &Row, idx: Option<usize>) -> Option<String> {
        idx.and_then(|i| row.columns.get(i))
            .and_then(|o| o.as_ref())
            .and_then(|v| match v {
                CqlValue::Ascii(s) | CqlValue::Text(s) => Some(s.clone()),
                _ => None,
            })
    }

    #[async_trait]
    impl ClusterClient for ScyllaConnection {
        async fn execute(&self, statement: &Statement) -> Result<RowSet> {
            debug!(cql = %statement.cql, bound = statement.values.len(), "execute");
            let result = if statement.values.is_empty() {
                self.session.query_unpaged(statement.cql.as_str(), &[]).await
            } else {
                let prepared = self
                    .session
                    .prepare(statement.cql.as_str())
                    .await
                    .map_err(Error::transport)?;
                self.session
                    .execute_unpaged(&prepared, &statement.values[..])
                    .await
            }
            .map_err(Error::transport)?;
            let columns = result.col_specs().iter().map(|s| s.name.clone()).collect();
            let rows = result
                .rows_or_empty()
                .into_iter()
                .map(|row| row.columns)
                .collect();
            Ok(RowSet { columns, rows })
        }
    }

    #[async_trait]
    impl MetadataCatalog for ScyllaConnection {
        async fn keyspace_names(&self) -> Result<Vec<String>> {
            self.single_text_column("SELECT keyspace_name FROM system_schema.keyspaces", Vec::new())
                .await
        }

        async fn table_names(&self, keyspace: &str) -> Result<Vec<String>> {
            self.single_text_column(
                "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?",
                vec![keyspace.to_string()],
            )
            .await
        }

        async fn column_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>> {
            Ok(self.describe_table(keyspace, table).await?.column_names())
        }

        async fn primary_key_names(&self, keyspace: &str, table: &str) -> Result<Vec<String>> {
            let desc = self.describe_table(keyspace, table).await?;
            Ok(desc
                .partition_keys
                .into_iter()
                .chain(desc.clustering_keys)
                .collect())
        }
    }

    pub async fn connect(config: &ClusterConfig) -> Result<ScyllaConnection> {
        let nodes = config.known_nodes();
        info!(?nodes, "connecting to scylla");
        let mut sb = SessionBuilder::new();
        for node in &nodes {
            sb = sb.known_node(node);
        }
        if let Some(creds) = &config.credentials {
            sb = sb.user(&creds.user, &creds.password);
        }
        if let Some(ssl) = &config.ssl {
            sb = with_ssl(sb, ssl)?;
        }
        let session = sb.build().await.map_err(Error::transport)?;
        Ok(ScyllaConnection::new(session))
    }

    #[cfg(feature = "ssl")]
    fn with_ssl(sb: SessionBuilder, ssl: &SslConfig) -> Result<SessionBuilder> {
        use openssl::ssl::{SslContext, SslMethod, SslVerifyMode};
        let mut ctx = SslContext::builder(SslMethod::tls()).map_err(Error::transport)?;
        if let Some(ca_file) = &ssl.ca_bundle {
            ctx.set_ca_file(ca_file).map_err(Error::transport)?;
        }
        ctx.set_verify(if ssl.insecure {
            SslVerifyMode::NONE
        } else {
            SslVerifyMode::PEER
        });
        Ok(sb.ssl_context(Some(ctx.build())))
    }

    #[cfg(not(feature = "ssl"))]
    fn with_ssl(_sb: SessionBuilder, _ssl: &SslConfig) -> Result<SessionBuilder> {
        Err(Error::Config(
            "TLS requested but this build lacks the `ssl` feature".into(),
        ))
    }

    /// Named connections. `connect_and_register` files a new connection under
    /// the name the cluster reports for itself.
    #[derive(Default)]
    pub struct Connections {
        inner: RwLock<HashMap<String, Arc<dyn Connection>>>,
    }

    impl Connections {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(
            &self,
            name: impl Into<String>,
            connection: Arc<dyn Connection>,
        ) -> Option<Arc<dyn Connection>> {
            self.inner
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.into(), connection)
        }

        pub fn get(&self, name: &str) -> Result<Arc<dyn Connection>> {
            self.inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownConnection(name.to_string()))
        }

        pub fn remove(&self, name: &str) -> Option<Arc<dyn Connection>> {
            self.inner
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name)
        }

        pub fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect();
            names.sort();
            names
        }

        pub fn bind(&self, keyspace: impl Into<String>, name: &str) -> Result<Binding> {
            Ok(Binding::new(keyspace, self.get(name)?))
        }

        pub async fn connect_and_register(
            &self,
            config: &ClusterConfig,
        ) -> Result<(String, Arc<dyn Connection>)> {
            let connection: Arc<dyn Connection> = Arc::new(connect(config).await?);
            let name = connection.cluster_name().await?;
            info!(cluster = %name, "registered connection");
            self.register(name.clone(), Arc::clone(&connection));
            Ok((name, connection))
        }
    }
}

pub mod whitelist {
    //! Membership checks against live metadata. Every identifier a caller
    //! hands us must pass here before it is interpolated into CQL text.

    use serde_json::Value;
    use tracing::debug;

    use crate::db::MetadataCatalog;
    use crate::error::{Error, Result};
    use crate::schema::display_value;

    pub async fn ensure_keyspace<C>(catalog: &C, keyspace: &str) -> Result<()>
    where
        C: MetadataCatalog + ?Sized,
    {
        if !catalog.keyspace_names().await?.iter().any(|k| k == keyspace) {
            return Err(Error::UnknownKeyspace(keyspace.to_string()));
        }
        debug!(%keyspace, "keyspace whitelisted");
        Ok(())
    }

    pub async fn ensure_table<C>(catalog: &C, keyspace: &str, table: &str) -> Result<()>
    where
        C: MetadataCatalog + ?Sized,
    {
        if !catalog.table_names(keyspace).await?.iter().any(|t| t == table) {
            return Err(Error::UnknownTable(table.to_string()));
        }
        debug!(%keyspace, %table, "table whitelisted");
        Ok(())
    }

    pub async fn ensure_column<C>(catalog: &C, keyspace: &str, table: &str, column: &str) -> Result<()>
    where
        C: MetadataCatalog + ?Sized,
    {
        if !catalog
            .column_names(keyspace, table)
            .await?
            .iter()
            .any(|c| c == column)
        {
            return Err(Error::UnknownColumn(column.to_string()));
        }
        debug!(%keyspace, %table, %column, "column whitelisted");
        Ok(())
    }

    pub async fn ensure_primary_key<C>(catalog: &C, keyspace: &str, table: &str, key: &str) -> Result<()>
    where
        C: MetadataCatalog + ?Sized,
    {
        if !catalog
            .primary_key_names(keyspace, table)
            .await?
            .iter()
            .any(|k| k == key)
        {
            return Err(Error::UnknownPrimaryKey(key.to_string()));
        }
        debug!(%keyspace, %table, %key, "primary key whitelisted");
        Ok(())
    }

    /// Position of `value` among the currently stored values.
    pub fn ensure_value(existing: &[Value], value: &Value) -> Result<usize> {
        existing
            .iter()
            .position(|v| v == value)
            .ok_or_else(|| Error::UnknownValue(display_value(value)))
    }
}

pub mod cql {
    use scylla_cql::frame::response::result::CqlValue;
    use serde_json::{Map, Value};
    use tracing::{Instrument, debug, info, info_span};

    use crate::db::{ClusterClient, Connection, Statement};
    use crate::error::{Error, Result};
    use crate::schema::{cql_value_to_json, display_value, is_identifier, qualified, quote_ident};
    use crate::whitelist::{
        ensure_column, ensure_keyspace, ensure_primary_key, ensure_table, ensure_value,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Replication {
        /// `SimpleStrategy` with a fixed replication factor.
        Simple {
            replication_factor: u32,
            durable_writes: bool,
        },
        /// A replication map used verbatim, e.g. `{'class': 'NetworkTopologyStrategy', 'dc1': 3}`.
        Raw(String),
    }

    impl Replication {
        pub fn simple(replication_factor: u32) -> Self {
            Replication::Simple {
                replication_factor,
                durable_writes: true,
            }
        }

        fn clause(&self) -> String {
            match self {
                Replication::Simple {
                    replication_factor,
                    durable_writes,
                } => format!(
                    "{{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}} AND durable_writes = {durable_writes}"
                ),
                Replication::Raw(expr) => expr.clone(),
            }
        }
    }

    impl Default for Replication {
        fn default() -> Self {
            Replication::simple(1)
        }
    }

    pub async fn create_keyspace<C>(client: &C, name: &str, replication: &Replication) -> Result<()>
    where
        C: ClusterClient + ?Sized,
    {
        if !is_identifier(name) {
            return Err(Error::InvalidIdentifier(name.to_string()));
        }
        let cql = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {};",
            quote_ident(name),
            replication.clause()
        );
        client.execute(&Statement::new(cql)).await?;
        info!(keyspace = %name, "keyspace ensured");
        Ok(())
    }

    /// Every value of one column, in the order the cluster returns rows.
    pub async fn select_column<C>(
        conn: &C,
        keyspace: &str,
        table: &str,
        column: &str,
    ) -> Result<Vec<Value>>
    where
        C: Connection + ?Sized,
    {
        ensure_keyspace(conn, keyspace).await?;
        ensure_table(conn, keyspace, table).await?;
        ensure_column(conn, keyspace, table, column).await?;
        let cql = format!("SELECT {} FROM {}", quote_ident(column), qualified(keyspace, table));
        let rows = conn.execute(&Statement::new(cql)).await?;
        Ok(rows
            .column_values(column)
            .iter()
            .map(|v| v.as_ref().map(cql_value_to_json).unwrap_or(Value::Null))
            .collect())
    }

    pub async fn select_all<C>(conn: &C, keyspace: &str, table: &str) -> Result<Vec<Map<String, Value>>>
    where
        C: Connection + ?Sized,
    {
        ensure_keyspace(conn, keyspace).await?;
        ensure_table(conn, keyspace, table).await?;
        let cql = format!("SELECT * FROM {}", qualified(keyspace, table));
        Ok(conn.execute(&Statement::new(cql)).await?.into_json())
    }

    /// Delete the rows whose `primary_key` equals `value`.
    ///
    /// `value` must currently be stored in that column; anything else fails with
    /// `UnknownValue` and no DELETE is sent. The stored value is what gets bound.
    pub async fn delete_row<C>(
        conn: &C,
        keyspace: &str,
        table: &str,
        primary_key: &str,
        value: &Value,
    ) -> Result<()>
    where
        C: Connection + ?Sized,
    {
        let span = info_span!("delete_row", %keyspace, %table, %primary_key);
        delete_checked(conn, keyspace, table, primary_key, value)
            .instrument(span)
            .await
    }

    async fn delete_checked<C>(
        conn: &C,
        keyspace: &str,
        table: &str,
        primary_key: &str,
        value: &Value,
    ) -> Result<()>
    where
        C: Connection + ?Sized,
    {
        ensure_keyspace(conn, keyspace).await?;
        ensure_table(conn, keyspace, table).await?;
        ensure_primary_key(conn, keyspace, table, primary_key).await?;

        let cql = format!("SELECT {} FROM {}", quote_ident(primary_key), qualified(keyspace, table));
        let stored = conn.execute(&Statement::new(cql)).await?.column_values(primary_key);
        let observed: Vec<Value> = stored
            .iter()
            .map(|v| v.as_ref().map(cql_value_to_json).unwrap_or(Value::Null))
            .collect();
        let wanted = stored
            .iter()
            .flatten()
            .next()
            .map_or_else(|| value.clone(), |sample| as_stored(sample, value));
        let idx = ensure_value(&observed, &wanted)
            .map_err(|_| Error::UnknownValue(display_value(value)))?;
        let bound = stored
            .into_iter()
            .nth(idx)
            .flatten()
            .ok_or_else(|| Error::UnknownValue(display_value(value)))?;

        let cql = format!(
            "DELETE FROM {} WHERE {} = ?",
            qualified(keyspace, table),
            quote_ident(primary_key)
        );
        conn.execute(&Statement::with_values(cql, vec![bound])).await?;
        debug!(value = %display_value(value), "row deleted");
        Ok(())
    }

    // Floats come back as f32; narrow the caller's number the same way so
    // `0.1` matches a stored `0.1f32`.
    fn as_stored(sample: &CqlValue, value: &Value) -> Value {
        match (sample, value.as_f64()) {
            (CqlValue::Float(_), Some(n)) => Value::from(n as f32),
            _ => value.clone(),
        }
    }

    pub async fn truncate_table<C>(conn: &C, keyspace: &str, table: &str) -> Result<()>
    where
        C: Connection + ?Sized,
    {
        ensure_keyspace(conn, keyspace).await?;
        ensure_table(conn, keyspace, table).await?;
        let cql = format!("TRUNCATE {}", qualified(keyspace, table));
        conn.execute(&Statement::new(cql)).await?;
        info!(%keyspace, %table, "table truncated");
        Ok(())
    }
}

pub mod registry {
    use std::fmt;

    use scylla_cql::frame::response::result::CqlValue;
    use serde_json::{Map, Value};
    use tracing::{Instrument, debug, info, info_span, warn};

    use crate::db::{ClusterClient, MetadataCatalog, Statement};
    use crate::error::{Error, Result};
    use crate::model::{Binding, Entry, TableModel};
    use crate::schema::{display_value, qualified, quote_ident};

    /// Key columns and the values they must equal.
    #[derive(Debug, Clone, PartialEq)]
    pub struct KeyFilter {
        pairs: Vec<(String, Value)>,
    }

    impl KeyFilter {
        pub fn single(key: impl Into<String>, value: impl Into<Value>) -> Self {
            Self {
                pairs: vec![(key.into(), value.into())],
            }
        }

        pub fn composite<I, K, V>(pairs: I) -> Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: Into<String>,
            V: Into<Value>,
        {
            Self {
                pairs: pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            }
        }

        /// Build a filter from loosely typed input: either one key name with one
        /// value, or equally long arrays of key names and values.
        pub fn from_json(keys: &Value, values: &Value) -> Result<Self> {
            match keys {
                Value::String(key) => Ok(Self::single(key.clone(), values.clone())),
                Value::Array(names) => {
                    let Value::Array(values) = values else {
                        return Err(Error::InvalidKeyShape(
                            "a list of keys needs a list of values".into(),
                        ));
                    };
                    if names.is_empty() || names.len() != values.len() {
                        return Err(Error::InvalidKeyShape(format!(
                            "{} keys for {} values",
                            names.len(),
                            values.len()
                        )));
                    }
                    let mut pairs = Vec::with_capacity(names.len());
                    for (name, value) in names.iter().zip(values) {
                        let Value::String(name) = name else {
                            return Err(Error::InvalidKeyShape(format!(
                                "key names must be strings, got {name}"
                            )));
                        };
                        pairs.push((name.clone(), value.clone()));
                    }
                    Ok(Self { pairs })
                }
                other => Err(Error::InvalidKeyShape(format!(
                    "expected a key name or a list of key names, got {other}"
                ))),
            }
        }

        pub fn pairs(&self) -> &[(String, Value)] {
            &self.pairs
        }
    }

    impl<K: Into<String>, V: Into<Value>> From<(K, V)> for KeyFilter {
        fn from((key, value): (K, V)) -> Self {
            Self::single(key, value)
        }
    }

    impl fmt::Display for KeyFilter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (i, (key, value)) in self.pairs.iter().enumerate() {
                if i > 0 {
                    f.write_str(" AND ")?;
                }
                write!(f, "{key} = '{}'", display_value(value))?;
            }
            Ok(())
        }
    }

    fn create_table_cql(model: &TableModel, keyspace: &str) -> String {
        let defs: Vec<String> = model
            .all_columns()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .collect();
        let partition: Vec<String> = model.primary_keys.keys().map(|k| quote_ident(k)).collect();
        let mut primary = format!("({})", partition.join(", "));
        for name in model.clustering_keys.keys() {
            primary.push_str(", ");
            primary.push_str(&quote_ident(name));
        }
        let mut cql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            qualified(keyspace, &model.table_name()),
            defs.join(", "),
            primary
        );
        if !model.clustering_keys.is_empty() {
            let order: Vec<String> = model
                .clustering_keys
                .iter()
                .map(|(name, key)| format!("{} {}", quote_ident(name), key.order.as_str()))
                .collect();
            cql.push_str(&format!(" WITH CLUSTERING ORDER BY ({})", order.join(", ")));
        }
        cql
    }

    fn bind_filter(model: &TableModel, filter: &KeyFilter) -> Result<(String, Vec<CqlValue>)> {
        if filter.pairs.is_empty() {
            return Err(Error::InvalidKeyShape("no key columns given".into()));
        }
        let mut clause = String::new();
        let mut values = Vec::with_capacity(filter.pairs.len());
        for (i, (key, value)) in filter.pairs.iter().enumerate() {
            if !model.is_key(key) {
                return Err(Error::UnknownPrimaryKey(key.clone()));
            }
            let Some(ty) = model.data_type(key) else {
                return Err(Error::UnknownPrimaryKey(key.clone()));
            };
            clause.push_str(if i == 0 { " WHERE " } else { " AND " });
            clause.push_str(&quote_ident(key));
            clause.push_str(" = ?");
            values.push(ty.bind(key, value)?);
        }
        Ok((clause, values))
    }

    fn entry(binding: &Binding, model: &TableModel, values: Map<String, Value>) -> Entry {
        Entry {
            keyspace: binding.keyspace().to_string(),
            table: model.table_name(),
            values,
        }
    }

    /// Make sure a table matching `model` exists: create it when absent and add
    /// any regular column the live table lacks. Repeated calls change nothing.
    pub async fn synchronize(model: &TableModel, binding: &Binding) -> Result<()> {
        model.validate()?;
        let span = info_span!(
            "synchronize",
            keyspace = %binding.keyspace(),
            table = %model.table_name()
        );
        sync_table(model, binding).instrument(span).await
    }

    async fn sync_table(model: &TableModel, binding: &Binding) -> Result<()> {
        let keyspace = binding.keyspace();
        let table = model.table_name();
        let conn = binding.connection();

        conn.execute(&Statement::new(create_table_cql(model, keyspace)))
            .await?;
        let live = conn.column_names(keyspace, &table).await?;
        for (name, ty) in model.columns.iter() {
            if live.iter().any(|c| c == name) {
                continue;
            }
            let cql = format!(
                "ALTER TABLE {} ADD {} {}",
                qualified(keyspace, &table),
                quote_ident(name),
                ty
            );
            conn.execute(&Statement::new(cql)).await?;
            info!(column = %name, "column added");
        }
        debug!("table synchronized");
        Ok(())
    }

    /// Write one row. `data` may only name columns of the model and must give
    /// every key column; `null` values are left out of the write. With
    /// `prior_sync` the table is synchronized after `data` has been checked.
    pub async fn create(
        model: &TableModel,
        data: &Map<String, Value>,
        binding: &Binding,
        prior_sync: bool,
    ) -> Result<Entry> {
        model.validate()?;
        if let Some(unknown) = data.keys().find(|k| model.data_type(k).is_none()) {
            return Err(Error::UnknownColumn(unknown.clone()));
        }
        for (key, _) in model.key_columns() {
            if data.get(key).map_or(true, Value::is_null) {
                return Err(Error::MissingKey(key.to_string()));
            }
        }

        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut written = Map::new();
        for (name, ty) in model.all_columns() {
            let Some(value) = data.get(name).filter(|v| !v.is_null()) else {
                continue;
            };
            values.push(ty.bind(name, value)?);
            names.push(quote_ident(name));
            written.insert(name.to_string(), value.clone());
        }

        // nothing reaches the cluster until the payload has fully bound
        if prior_sync {
            synchronize(model, binding).await?;
        }
        let markers = vec!["?"; names.len()].join(", ");
        let cql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(binding.keyspace(), &model.table_name()),
            names.join(", "),
            markers
        );
        binding
            .connection()
            .execute(&Statement::with_values(cql, values))
            .await?;
        debug!(table = %model.table_name(), "entry created");
        Ok(entry(binding, model, written))
    }

    /// Fetch the single row matching `filter`. No match is `NotFound`, more than
    /// one is `MultipleMatches`.
    pub async fn read(model: &TableModel, filter: &KeyFilter, binding: &Binding) -> Result<Entry> {
        model.validate()?;
        let (clause, values) = bind_filter(model, filter)?;
        let table = model.table_name();
        let cql = format!("SELECT * FROM {}{}", qualified(binding.keyspace(), &table), clause);
        let mut rows = binding
            .connection()
            .execute(&Statement::with_values(cql, values))
            .await?
            .into_json();
        match rows.len() {
            0 => Err(Error::NotFound {
                table,
                filter: filter.to_string(),
            }),
            1 => Ok(entry(binding, model, rows.swap_remove(0))),
            count => {
                warn!(%table, %filter, count, "read matched more than one row");
                Err(Error::MultipleMatches {
                    table,
                    filter: filter.to_string(),
                    count,
                })
            }
        }
    }

    /// Read the matching row, then delete it by its full key. Fails like `read`
    /// when there is not exactly one match. Returns the deleted entry.
    pub async fn delete(model: &TableModel, filter: &KeyFilter, binding: &Binding) -> Result<Entry> {
        let found = read(model, filter, binding).await?;
        let mut clause = String::new();
        let mut values = Vec::new();
        for (i, (key, ty)) in model.key_columns().enumerate() {
            let value = found
                .get(key)
                .ok_or_else(|| Error::MissingKey(key.to_string()))?;
            clause.push_str(if i == 0 { " WHERE " } else { " AND " });
            clause.push_str(&quote_ident(key));
            clause.push_str(" = ?");
            values.push(ty.bind(key, value)?);
        }
        let cql = format!(
            "DELETE FROM {}{}",
            qualified(binding.keyspace(), &model.table_name()),
            clause
        );
        binding
            .connection()
            .execute(&Statement::with_values(cql, values))
            .await?;
        debug!(table = %model.table_name(), %filter, "entry deleted");
        Ok(found)
    }

    pub async fn list_all(model: &TableModel, binding: &Binding) -> Result<Vec<Entry>> {
        model.validate()?;
        let cql = format!(
            "SELECT * FROM {}",
            qualified(binding.keyspace(), &model.table_name())
        );
        let rows = binding.connection().execute(&Statement::new(cql)).await?;
        Ok(rows
            .into_json()
            .into_iter()
            .map(|values| entry(binding, model, values))
            .collect())
    }
}

pub mod forge {
    use std::fs;
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Serialize};
    use tempfile::NamedTempFile;
    use tracing::{debug, info, info_span};
    use uuid::Uuid;

    use crate::error::{Error, Result};
    use crate::model::TableModel;

    pub const ARTIFACT_FORMAT: u32 = 1;

    /// On-disk form of one or more table models.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Artifact {
        pub generator: String,
        pub format: u32,
        pub models: Vec<TableModel>,
    }

    impl Artifact {
        pub fn new(models: Vec<TableModel>) -> Self {
            Self {
                generator: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string(),
                format: ARTIFACT_FORMAT,
                models,
            }
        }

        pub fn model(&self, name: &str) -> Option<&TableModel> {
            self.models.iter().find(|m| m.name == name)
        }

        pub fn render(&self) -> Result<String> {
            let mut out = serde_json::to_string_pretty(self)?;
            out.push('\n');
            Ok(out)
        }
    }

    pub trait ModelLoader {
        fn load_artifact(&self, location: &Path) -> Result<Artifact>;
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct JsonModelLoader;

    impl ModelLoader for JsonModelLoader {
        fn load_artifact(&self, location: &Path) -> Result<Artifact> {
            let raw = fs::read_to_string(location)?;
            Ok(serde_json::from_str(&raw)?)
        }
    }

    /// `~` expands to the home directory, other relative paths hang off the
    /// current working directory.
    pub fn resolve_location(location: impl AsRef<Path>) -> Result<PathBuf> {
        let path = location.as_ref();
        if let Ok(rest) = path.strip_prefix("~") {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot determine the home directory".into()))?;
            return Ok(home.join(rest));
        }
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }

    /// Write `model` as an artifact at `location` and return the resolved path.
    ///
    /// An existing file is only replaced when `overwrite` is set; with `backup`
    /// it is first copied next to itself as `<stem>_backup_<uuid><extensions>`.
    /// The new content lands through a temp file in the same directory, so a
    /// reader sees either the old artifact or the new one.
    pub fn create(
        model: &TableModel,
        location: impl AsRef<Path>,
        overwrite: bool,
        backup: bool,
    ) -> Result<PathBuf> {
        model.validate()?;
        let rendered = Artifact::new(vec![model.clone()]).render()?;
        let target = resolve_location(location)?;
        let span = info_span!("forge_create", model = %model.name, path = %target.display());
        let _g = span.enter();

        if target.is_file() {
            debug!("existing artifact detected");
            if !overwrite {
                return Err(Error::ArtifactExists(target));
            }
            if backup {
                let backup_path = backup_path(&target);
                fs::copy(&target, &backup_path)?;
                info!(backup = %backup_path.display(), "existing artifact backed up");
            }
        }

        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent directory")
        })?;
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        info!("artifact written");
        Ok(target)
    }

    pub fn retrieve(location: impl AsRef<Path>, model_name: &str) -> Result<TableModel> {
        retrieve_with(&JsonModelLoader, location, model_name)
    }

    /// Load the artifact at `location` and pull out the model called `model_name`.
    /// The returned model always uses its exact-case name as table identifier.
    pub fn retrieve_with<L>(loader: &L, location: impl AsRef<Path>, model_name: &str) -> Result<TableModel>
    where
        L: ModelLoader + ?Sized,
    {
        let path = resolve_location(location)?;
        if !path.exists() {
            return Err(Error::ArtifactNotFound(path));
        }
        let artifact = loader.load_artifact(&path)?;
        let mut model = artifact
            .models
            .into_iter()
            .find(|m| m.name == model_name)
            .ok_or_else(|| Error::SymbolNotFound {
                symbol: model_name.to_string(),
                path: path.clone(),
            })?;
        model.case_sensitive = true;
        model.validate()?;
        debug!(model = %model_name, path = %path.display(), "model retrieved");
        Ok(model)
    }

    fn backup_path(target: &Path) -> PathBuf {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, extensions) = split_extensions(&file_name);
        target.with_file_name(format!("{stem}_backup_{}{extensions}", Uuid::new_v4()))
    }

    // "model.tar.json" -> ("model", ".tar.json"); a leading dot stays in the stem.
    fn split_extensions(file_name: &str) -> (&str, &str) {
        match file_name.char_indices().skip(1).find(|(_, c)| *c == '.') {
            Some((i, _)) => file_name.split_at(i),
            None => (file_name, ""),
        }
    }
}
