//! Schema snapshots: every table in the `public` schema, its columns,
//! and the foreign keys connecting them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

use crate::graph::RelationshipGraph;

/// One row per column, with foreign key data attached when the column
/// participates in one. Multi-column constraints span several rows that
/// share a constraint name.
const SCHEMA_QUERY: &str = "
select col.table_name as table,
       col.column_name,
       COALESCE(rel.table_name, '') as primary_table,
       COALESCE(rel.column_name, '') as primary_column,
       COALESCE(kcu.constraint_name, '')
from information_schema.columns col
left join (select kcu.constraint_schema,
                  kcu.constraint_name,
                  kcu.table_schema,
                  kcu.table_name,
                  kcu.column_name,
                  kcu.ordinal_position,
                  kcu.position_in_unique_constraint
           from information_schema.key_column_usage kcu
           join information_schema.table_constraints tco
                on kcu.constraint_schema = tco.constraint_schema
                and kcu.constraint_name = tco.constraint_name
                and tco.constraint_type = 'FOREIGN KEY'
          ) as kcu
          on col.table_schema = kcu.table_schema
          and col.table_name = kcu.table_name
          and col.column_name = kcu.column_name
left join information_schema.referential_constraints rco
          on rco.constraint_name = kcu.constraint_name
          and rco.constraint_schema = kcu.table_schema
left join information_schema.key_column_usage rel
          on rco.unique_constraint_name = rel.constraint_name
          and rco.unique_constraint_schema = rel.constraint_schema
          and rel.ordinal_position = kcu.position_in_unique_constraint
where col.table_schema = 'public';
";

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    /// The schema query itself failed or the database was unreachable.
    #[error("schema fetch: {0}")]
    Fetch(#[from] tokio_postgres::Error),
}

/// One ingested row of the schema query. `constraint` is empty for
/// columns that are not part of a foreign key.
#[derive(Debug, Clone)]
pub struct SchemaRow {
    pub table: String,
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
    pub constraint: String,
}

/// A foreign key pointing at `to_table`, one `(from, to)` column pair
/// per constrained column, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub to_table: String,
    pub column_conditions: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    /// Keyed by constraint name; ordered so traversal is stable.
    pub foreign_keys: BTreeMap<String, ForeignKey>,
}

/// Immutable snapshot of one database's schema.
#[derive(Debug, Default)]
pub struct Catalog {
    pub tables: BTreeMap<String, Table>,
    pub column_to_tables: BTreeMap<String, BTreeSet<String>>,
    pub graph: RelationshipGraph,
}

impl Catalog {
    /// Fold schema rows into tables, the column index and the
    /// relationship graph.
    pub fn from_rows(rows: Vec<SchemaRow>) -> Self {
        let mut tables: BTreeMap<String, Table> = BTreeMap::new();
        for row in rows {
            let table = tables.entry(row.table.clone()).or_insert_with(|| Table {
                name: row.table.clone(),
                columns: Vec::new(),
                foreign_keys: BTreeMap::new(),
            });
            table.columns.push(row.column.clone());
            if !row.constraint.is_empty() {
                let fkey = table
                    .foreign_keys
                    .entry(row.constraint)
                    .or_insert_with(|| ForeignKey {
                        to_table: row.ref_table.clone(),
                        column_conditions: Vec::new(),
                    });
                if !row.column.is_empty() && !row.ref_column.is_empty() {
                    fkey.column_conditions.push((row.column, row.ref_column));
                }
            }
        }

        let mut graph = RelationshipGraph::new();
        for name in tables.keys() {
            graph.add_node(name.clone());
        }
        for (name, table) in &tables {
            for fkey in table.foreign_keys.values() {
                if !tables.contains_key(&fkey.to_table) {
                    debug!(
                        table = %name,
                        references = %fkey.to_table,
                        "foreign key references a table outside the public schema"
                    );
                    continue;
                }
                graph.add_edge(name.clone(), fkey.to_table.clone());
            }
        }

        let mut column_to_tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, table) in &tables {
            for column in &table.columns {
                column_to_tables
                    .entry(column.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }

        Catalog {
            tables,
            column_to_tables,
            graph,
        }
    }
}

/// Fetch the schema through an existing connection.
///
/// `simple_query` keeps every cell textual, which is all the catalog
/// needs.
pub async fn fetch_catalog(client: &tokio_postgres::Client) -> Result<Catalog, SchemaError> {
    let mut rows = Vec::new();
    for message in client.simple_query(SCHEMA_QUERY).await? {
        if let SimpleQueryMessage::Row(row) = message {
            rows.push(SchemaRow {
                table: row.get(0).unwrap_or_default().to_string(),
                column: row.get(1).unwrap_or_default().to_string(),
                ref_table: row.get(2).unwrap_or_default().to_string(),
                ref_column: row.get(3).unwrap_or_default().to_string(),
                constraint: row.get(4).unwrap_or_default().to_string(),
            });
        }
    }
    debug!(rows = rows.len(), "fetched schema rows");
    Ok(Catalog::from_rows(rows))
}

/// Open a short-lived connection to `url` and close it once the client
/// is dropped.
pub async fn connect(url: &str) -> Result<tokio_postgres::Client, SchemaError> {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "schema connection closed with error");
        }
    });
    Ok(client)
}

/// Source of catalog snapshots, keyed by database URL.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load_schema(&self, url: &str) -> Result<Catalog, SchemaError>;
}

/// Production loader: one outbound connection per load, closed as soon
/// as the rows are in.
pub struct PgSchemaLoader;

#[async_trait]
impl SchemaLoader for PgSchemaLoader {
    async fn load_schema(&self, url: &str) -> Result<Catalog, SchemaError> {
        let client = connect(url).await?;
        fetch_catalog(&client).await
    }
}
