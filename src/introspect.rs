//! Structural walk of parsed statements, collecting every table and
//! column reference.
//!
//! One match arm per node kind that can carry a reference, a silent
//! default for everything else. The walk has no side effects beyond the
//! accumulator, so identical statements always produce identical
//! [`Query`] values.

use std::collections::BTreeMap;

use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint,
    JoinOperator, ObjectName, OrderByKind, Query as AstQuery, Select, SelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement, TableFactor, TableWithJoins,
};

/// A single column reference as written in the query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryColumn {
    /// Unqualified `col`.
    Bare(String),
    /// Qualified `t.col`, where `t` may be a table name or an alias.
    Aliased { table: String, column: String },
    /// Qualified wildcard `t.*`.
    Wildcard(String),
}

impl QueryColumn {
    /// Textual form, used as the dedup key.
    pub fn key(&self) -> String {
        match self {
            QueryColumn::Bare(name) => name.clone(),
            QueryColumn::Aliased { table, column } => format!("{table}.{column}"),
            QueryColumn::Wildcard(table) => format!("{table}.*"),
        }
    }

    /// The column name alone, `*` for wildcards.
    pub fn name(&self) -> &str {
        match self {
            QueryColumn::Bare(name) => name,
            QueryColumn::Aliased { column, .. } => column,
            QueryColumn::Wildcard(_) => "*",
        }
    }

    /// The table (or alias) qualifier, if one was written.
    pub fn qualifier(&self) -> Option<&str> {
        match self {
            QueryColumn::Bare(_) => None,
            QueryColumn::Aliased { table, .. } => Some(table),
            QueryColumn::Wildcard(table) => Some(table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTable {
    pub name: String,
    pub alias: Option<String>,
}

/// Normalised view of one statement: the tables named in FROM/JOIN and
/// the columns referenced anywhere.
#[derive(Debug, Default)]
pub struct Query {
    /// First-seen order, deduplicated by table name.
    pub tables: Vec<QueryTable>,
    /// Keyed by the column's textual form; ordered so downstream
    /// iteration is deterministic.
    pub columns: BTreeMap<String, QueryColumn>,
}

impl Query {
    fn add_table(&mut self, name: String, alias: Option<String>) {
        if self.tables.iter().any(|t| t.name == name) {
            return;
        }
        self.tables.push(QueryTable { name, alias });
    }

    fn add_column(&mut self, column: QueryColumn) {
        self.columns.insert(column.key(), column);
    }
}

/// Collect every table and column reference in `stmt`.
pub fn introspect(stmt: &Statement) -> Query {
    let mut query = Query::default();
    if let Statement::Query(q) = stmt {
        walk_query(q, &mut query);
    }
    query
}

fn walk_query(q: &AstQuery, out: &mut Query) {
    if let Some(with) = &q.with {
        for cte in &with.cte_tables {
            walk_query(&cte.query, out);
        }
    }
    walk_set_expr(&q.body, out);
    if let Some(order_by) = &q.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            for item in exprs {
                walk_expr(&item.expr, out);
            }
        }
    }
}

fn walk_set_expr(body: &SetExpr, out: &mut Query) {
    match body {
        SetExpr::Select(select) => walk_select(select, out),
        SetExpr::Query(q) => walk_query(q, out),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, out);
            walk_set_expr(right, out);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, out: &mut Query) {
    for item in &select.projection {
        walk_select_item(item, out);
    }
    for table in &select.from {
        walk_table_with_joins(table, out);
    }
    if let Some(selection) = &select.selection {
        walk_expr(selection, out);
    }
    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        for expr in exprs {
            walk_expr(expr, out);
        }
    }
    if let Some(having) = &select.having {
        walk_expr(having, out);
    }
}

fn walk_select_item(item: &SelectItem, out: &mut Query) {
    match item {
        SelectItem::UnnamedExpr(expr) => walk_expr(expr, out),
        SelectItem::ExprWithAlias { expr, .. } => walk_expr(expr, out),
        SelectItem::QualifiedWildcard(kind, _) => {
            if let SelectItemQualifiedWildcardKind::ObjectName(name) = kind {
                if let Some(table) = object_name_tail(name) {
                    out.add_column(QueryColumn::Wildcard(table));
                }
            }
        }
        // A bare `*` names no table; there is nothing to resolve.
        SelectItem::Wildcard(_) => {}
    }
}

fn walk_table_with_joins(table: &TableWithJoins, out: &mut Query) {
    walk_table_factor(&table.relation, out);
    for join in &table.joins {
        walk_table_factor(&join.relation, out);
        if let Some(JoinConstraint::On(expr)) = join_constraint(&join.join_operator) {
            walk_expr(expr, out);
        }
    }
}

fn join_constraint(op: &JoinOperator) -> Option<&JoinConstraint> {
    match op {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => Some(c),
        _ => None,
    }
}

fn walk_table_factor(factor: &TableFactor, out: &mut Query) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            if let Some(table) = object_name_tail(name) {
                out.add_table(table, alias.as_ref().map(|a| a.name.value.clone()));
            }
        }
        TableFactor::Derived { subquery, .. } => walk_query(subquery, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, out),
        _ => {}
    }
}

fn walk_expr(expr: &Expr, out: &mut Query) {
    match expr {
        Expr::Identifier(id) => out.add_column(QueryColumn::Bare(id.value.clone())),
        Expr::CompoundIdentifier(parts) => {
            if parts.len() == 2 {
                out.add_column(QueryColumn::Aliased {
                    table: parts[0].value.clone(),
                    column: parts[1].value.clone(),
                });
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, out);
            walk_expr(right, out);
        }
        Expr::UnaryOp { expr, .. } => walk_expr(expr, out),
        Expr::Nested(inner) => walk_expr(inner, out),
        Expr::Cast { expr, .. } => walk_expr(expr, out),
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => walk_expr(inner, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, out);
            walk_expr(low, out);
            walk_expr(high, out);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, out);
            for item in list {
                walk_expr(item, out);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, out);
            walk_query(subquery, out);
        }
        Expr::Subquery(q) => walk_query(q, out),
        Expr::Exists { subquery, .. } => walk_query(subquery, out),
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            walk_expr(expr, out);
            walk_expr(pattern, out);
        }
        Expr::Tuple(items) => {
            for item in items {
                walk_expr(item, out);
            }
        }
        Expr::Function(func) => walk_function(func, out),
        _ => {}
    }
}

fn walk_function(func: &Function, out: &mut Query) {
    if let FunctionArguments::List(list) = &func.args {
        for arg in &list.args {
            let arg_expr = match arg {
                FunctionArg::Named { arg, .. } => arg,
                FunctionArg::Unnamed(arg) => arg,
                _ => continue,
            };
            match arg_expr {
                FunctionArgExpr::Expr(expr) => walk_expr(expr, out),
                FunctionArgExpr::QualifiedWildcard(name) => {
                    if let Some(table) = object_name_tail(name) {
                        out.add_column(QueryColumn::Wildcard(table));
                    }
                }
                FunctionArgExpr::Wildcard => {}
            }
        }
    }
}

fn object_name_tail(name: &ObjectName) -> Option<String> {
    name.0
        .last()
        .and_then(|part| part.as_ident())
        .map(|ident| ident.value.clone())
}
