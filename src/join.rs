//! Join planning: resolve column references that live outside a query's
//! FROM list, then splice in the foreign-key joins that satisfy them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sqlparser::ast::{Join, Select, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use tracing::debug;

use crate::catalog::{Catalog, ForeignKey};
use crate::introspect::{self, QueryColumn};

/// Join type used for every added join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinBehavior {
    #[default]
    Inner,
    Left,
}

impl JoinBehavior {
    fn keyword(self) -> &'static str {
        match self {
            JoinBehavior::Inner => "INNER",
            JoinBehavior::Left => "LEFT",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("parse: {0}")]
    Parse(#[from] ParserError),
    /// A bare column that no table in the catalog has.
    #[error("could not find table with column {0}, maybe the database schema changed?")]
    UnknownColumn(String),
    /// The relationship graph claims an edge but neither table carries
    /// the foreign key, so catalog and graph disagree.
    #[error("could not find matching foreign key for {0} <=> {1}")]
    FkeyNotFound(String, String),
}

/// What the planner decided: which table each missing column now comes
/// from, and every candidate table it considered.
#[derive(Debug, Clone, Default)]
pub struct JoinPlan {
    pub missing_columns_to_joined_tables: BTreeMap<String, String>,
    pub missing_columns_to_possible_tables: BTreeMap<String, BTreeSet<String>>,
}

/// Rewrite every SELECT statement in `stmts` in place.
///
/// Returns the first statement's plan; when a query text carries several
/// statements only that one feeds row-descriptor prefixing downstream.
pub fn add_missing_joins(
    stmts: &mut [Statement],
    catalog: &Catalog,
    behavior: JoinBehavior,
) -> Result<JoinPlan, JoinError> {
    let mut first: Option<JoinPlan> = None;
    for stmt in stmts.iter_mut() {
        let plan = add_missing_joins_to_statement(stmt, catalog, behavior)?;
        if first.is_none() {
            first = Some(plan);
        }
    }
    Ok(first.unwrap_or_default())
}

/// Rewrite a single statement. Non-SELECT statements and set operations
/// pass through untouched with an empty plan.
pub fn add_missing_joins_to_statement(
    stmt: &mut Statement,
    catalog: &Catalog,
    behavior: JoinBehavior,
) -> Result<JoinPlan, JoinError> {
    let query = introspect::introspect(stmt);

    let select = match stmt {
        Statement::Query(q) => match q.body.as_mut() {
            SetExpr::Select(select) => select.as_mut(),
            _ => return Ok(JoinPlan::default()),
        },
        _ => return Ok(JoinPlan::default()),
    };

    let original_tables: BTreeSet<String> =
        query.tables.iter().map(|t| t.name.clone()).collect();
    let mut present_tables = original_tables.clone();

    // Aliases are slightly tricky; easier to keep a lookup each way and
    // always emit the aliased name.
    let mut table_to_alias: HashMap<String, String> = HashMap::new();
    let mut alias_to_table: HashMap<String, String> = HashMap::new();
    for table in &query.tables {
        if let Some(alias) = &table.alias {
            table_to_alias.insert(table.name.clone(), alias.clone());
            alias_to_table.insert(alias.clone(), table.name.clone());
        }
    }

    let mut plan = JoinPlan::default();
    let mut paths: Vec<Vec<String>> = Vec::new();

    // Sorted key order matters: every chosen path marks its tables as
    // present, and later columns resolve against that grown set.
    for (key, column) in &query.columns {
        let candidates: Vec<String> = match column {
            QueryColumn::Bare(name) => match catalog.column_to_tables.get(name) {
                Some(tables) => tables.iter().cloned().collect(),
                None => return Err(JoinError::UnknownColumn(name.clone())),
            },
            QueryColumn::Aliased { table, .. } | QueryColumn::Wildcard(table) => {
                vec![resolve_alias(&alias_to_table, table)]
            }
        };

        if let Some(existing) = candidates.iter().find(|c| present_tables.contains(*c)) {
            // Resolvable without a new join; only tables added by an
            // earlier iteration are worth recording for prefixing.
            if !original_tables.contains(existing) {
                plan.missing_columns_to_joined_tables
                    .insert(column.name().to_string(), existing.clone());
            }
            continue;
        }

        plan.missing_columns_to_possible_tables
            .insert(column.name().to_string(), candidates.iter().cloned().collect());

        let mut shortest: Option<Vec<String>> = None;
        for candidate in &candidates {
            for present in &present_tables {
                // The graph is directed by foreign key direction, but a
                // join is valid either way, so try both.
                let path = catalog.graph.shortest_path(present, candidate).or_else(|| {
                    catalog.graph.shortest_path(candidate, present).map(|mut p| {
                        p.reverse();
                        p
                    })
                });
                let Some(path) = path else { continue };
                let better = match &shortest {
                    None => true,
                    Some(best) => {
                        path.len() < best.len()
                            || (path.len() == best.len()
                                && original_tables.contains(&path[0])
                                && !original_tables.contains(&best[0]))
                    }
                };
                if better {
                    shortest = Some(path);
                }
            }
        }

        match shortest {
            Some(path) => {
                debug!(column = %key, path = ?path, "found join path");
                for table in &path {
                    present_tables.insert(table.clone());
                }
                if let Some(last) = path.last() {
                    plan.missing_columns_to_joined_tables
                        .insert(column.name().to_string(), last.clone());
                }
                paths.push(path);
            }
            None => {
                debug!(column = %key, "no foreign key path reaches a candidate table");
            }
        }
    }

    for path in &paths {
        let mut last_table: Option<&String> = None;
        for table in path {
            let Some(prev) = last_table else {
                last_table = Some(table);
                continue;
            };
            let (from_table, fkey) = find_foreign_key(catalog, prev, table)
                .ok_or_else(|| JoinError::FkeyNotFound(prev.clone(), table.clone()))?;
            splice_join(select, behavior, &table_to_alias, &from_table, table, fkey)?;
            last_table = Some(table);
        }
    }

    Ok(plan)
}

fn resolve_alias(alias_to_table: &HashMap<String, String>, name: &str) -> String {
    alias_to_table
        .get(name)
        .cloned()
        .unwrap_or_else(|| name.to_string())
}

fn alias_of<'a>(table_to_alias: &'a HashMap<String, String>, table: &'a str) -> &'a str {
    table_to_alias.get(table).map(String::as_str).unwrap_or(table)
}

/// The foreign key connecting `a` and `b`, in either direction, together
/// with the table the key lives on.
fn find_foreign_key<'a>(
    catalog: &'a Catalog,
    a: &str,
    b: &str,
) -> Option<(String, &'a ForeignKey)> {
    if let Some(table) = catalog.tables.get(a) {
        if let Some(fkey) = table.foreign_keys.values().find(|f| f.to_table == b) {
            return Some((a.to_string(), fkey));
        }
    }
    if let Some(table) = catalog.tables.get(b) {
        if let Some(fkey) = table.foreign_keys.values().find(|f| f.to_table == a) {
            return Some((b.to_string(), fkey));
        }
    }
    None
}

/// Graft one join onto the select's FROM clause.
///
/// Building the fragment by parsing a synthetic statement is far less
/// fiddly than assembling join nodes by hand; the parsed join is
/// appended to `from[0]`, extending the left-deep chain.
fn splice_join(
    select: &mut Select,
    behavior: JoinBehavior,
    table_to_alias: &HashMap<String, String>,
    from_table: &str,
    to_table: &str,
    fkey: &ForeignKey,
) -> Result<(), JoinError> {
    if select.from.is_empty() {
        debug!(table = %to_table, "select has no FROM clause to extend");
        return Ok(());
    }

    let conditions: Vec<String> = fkey
        .column_conditions
        .iter()
        .map(|(from_col, to_col)| {
            format!(
                "{}.{} = {}.{}",
                alias_of(table_to_alias, from_table),
                from_col,
                alias_of(table_to_alias, &fkey.to_table),
                to_col
            )
        })
        .collect();
    let synthetic = format!(
        "SELECT placeholder FROM foo {} JOIN {} ON {}",
        behavior.keyword(),
        alias_of(table_to_alias, to_table),
        conditions.join(" AND ")
    );
    let parsed = Parser::parse_sql(&PostgreSqlDialect {}, &synthetic)?;
    let join = extract_join(parsed).ok_or_else(|| {
        JoinError::Parse(ParserError::ParserError(format!(
            "synthetic join statement had an unexpected shape: {synthetic}"
        )))
    })?;
    select.from[0].joins.push(join);
    Ok(())
}

fn extract_join(mut stmts: Vec<Statement>) -> Option<Join> {
    let stmt = stmts.pop()?;
    match stmt {
        Statement::Query(q) => match *q.body {
            SetExpr::Select(mut select) => {
                if select.from.is_empty() || select.from[0].joins.is_empty() {
                    None
                } else {
                    Some(select.from[0].joins.remove(0))
                }
            }
            _ => None,
        },
        _ => None,
    }
}
