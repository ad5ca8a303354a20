use pg_autojoin::catalog::{Catalog, SchemaRow};
use pg_autojoin::join::{add_missing_joins, JoinBehavior, JoinError, JoinPlan};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

fn row(table: &str, column: &str, ref_table: &str, ref_column: &str, constraint: &str) -> SchemaRow {
    SchemaRow {
        table: table.to_string(),
        column: column.to_string(),
        ref_table: ref_table.to_string(),
        ref_column: ref_column.to_string(),
        constraint: constraint.to_string(),
    }
}

/// users(id, email), avatars(id, user_id -> users.id, image_url),
/// posts(id, user_id -> users.id, body), lonely(code) with no keys.
fn fixture_catalog() -> Catalog {
    Catalog::from_rows(vec![
        row("users", "id", "", "", ""),
        row("users", "email", "", "", ""),
        row("avatars", "id", "", "", ""),
        row("avatars", "user_id", "users", "id", "avatars_user_id_fkey"),
        row("avatars", "image_url", "", "", ""),
        row("posts", "id", "", "", ""),
        row("posts", "user_id", "users", "id", "posts_user_id_fkey"),
        row("posts", "body", "", "", ""),
        row("lonely", "code", "", "", ""),
    ])
}

fn rewrite_with(
    sql: &str,
    catalog: &Catalog,
    behavior: JoinBehavior,
) -> Result<(String, JoinPlan), JoinError> {
    let mut stmts: Vec<Statement> = Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap();
    let plan = add_missing_joins(&mut stmts, catalog, behavior)?;
    let deparsed = stmts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Ok((deparsed, plan))
}

fn rewrite(sql: &str) -> (String, JoinPlan) {
    rewrite_with(sql, &fixture_catalog(), JoinBehavior::Inner).unwrap()
}

#[test]
fn adds_a_single_join() {
    let (sql, plan) = rewrite("SELECT email, image_url FROM users");
    assert_eq!(
        sql,
        "SELECT email, image_url FROM users INNER JOIN avatars ON avatars.user_id = users.id"
    );
    assert_eq!(
        plan.missing_columns_to_joined_tables.get("image_url"),
        Some(&"avatars".to_string())
    );
    assert!(!plan.missing_columns_to_joined_tables.contains_key("email"));
}

#[test]
fn traverses_reverse_edges() {
    let (sql, _) = rewrite("SELECT email FROM avatars");
    assert_eq!(
        sql,
        "SELECT email FROM avatars INNER JOIN users ON avatars.user_id = users.id"
    );
}

#[test]
fn join_conditions_use_the_query_alias() {
    let (sql, _) = rewrite("SELECT u.email, image_url FROM users AS u");
    assert_eq!(
        sql,
        "SELECT u.email, image_url FROM users AS u INNER JOIN avatars ON avatars.user_id = u.id"
    );
}

#[test]
fn reuses_tables_joined_for_earlier_columns() {
    let (sql, plan) = rewrite("SELECT body, image_url FROM users");
    assert_eq!(
        sql,
        "SELECT body, image_url FROM users \
         INNER JOIN posts ON posts.user_id = users.id \
         INNER JOIN avatars ON avatars.user_id = users.id"
    );
    assert_eq!(
        plan.missing_columns_to_joined_tables.get("body"),
        Some(&"posts".to_string())
    );
    assert_eq!(
        plan.missing_columns_to_joined_tables.get("image_url"),
        Some(&"avatars".to_string())
    );
}

#[test]
fn idempotent_on_already_joined_queries() {
    let input = "SELECT email, image_url FROM users JOIN avatars ON users.id = avatars.user_id";
    let (sql, plan) = rewrite(input);
    assert_eq!(sql, input);
    assert!(plan.missing_columns_to_joined_tables.is_empty());
}

#[test]
fn left_join_behavior() {
    let (sql, _) = rewrite_with(
        "SELECT email, image_url FROM users",
        &fixture_catalog(),
        JoinBehavior::Left,
    )
    .unwrap();
    assert_eq!(
        sql,
        "SELECT email, image_url FROM users LEFT JOIN avatars ON avatars.user_id = users.id"
    );
}

#[test]
fn qualified_column_names_a_table_to_join() {
    let (sql, _) = rewrite("SELECT posts.body FROM users");
    assert_eq!(
        sql,
        "SELECT posts.body FROM users INNER JOIN posts ON posts.user_id = users.id"
    );
}

#[test]
fn table_wildcard_joins_that_table() {
    let (sql, _) = rewrite("SELECT avatars.* FROM users");
    assert_eq!(
        sql,
        "SELECT avatars.* FROM users INNER JOIN avatars ON avatars.user_id = users.id"
    );
}

#[test]
fn bare_star_adds_nothing() {
    let (sql, plan) = rewrite("SELECT * FROM users");
    assert_eq!(sql, "SELECT * FROM users");
    assert!(plan.missing_columns_to_joined_tables.is_empty());
}

#[test]
fn unknown_column_is_an_error() {
    let err = rewrite_with(
        "SELECT mystery FROM users",
        &fixture_catalog(),
        JoinBehavior::Inner,
    )
    .unwrap_err();
    assert!(matches!(err, JoinError::UnknownColumn(name) if name == "mystery"));
}

#[test]
fn unreachable_table_is_skipped_not_an_error() {
    let (sql, plan) = rewrite("SELECT code FROM users");
    assert_eq!(sql, "SELECT code FROM users");
    assert!(plan.missing_columns_to_joined_tables.is_empty());
    let candidates = plan.missing_columns_to_possible_tables.get("code").unwrap();
    assert!(candidates.contains("lonely"));
}

#[test]
fn multi_column_foreign_keys_and_all_pairs() {
    let catalog = Catalog::from_rows(vec![
        row("orders", "region", "", "", ""),
        row("orders", "number", "", "", ""),
        row("orders", "total", "", "", ""),
        row("items", "region", "orders", "region", "items_order_fkey"),
        row("items", "number", "orders", "number", "items_order_fkey"),
        row("items", "sku", "", "", ""),
    ]);
    let (sql, _) =
        rewrite_with("SELECT sku FROM orders", &catalog, JoinBehavior::Inner).unwrap();
    assert_eq!(
        sql,
        "SELECT sku FROM orders INNER JOIN items \
         ON items.region = orders.region AND items.number = orders.number"
    );
}

#[test]
fn equal_length_paths_resolve_deterministically() {
    let catalog = Catalog::from_rows(vec![
        row("a", "id", "", "", ""),
        row("a", "x", "", "", ""),
        row("b", "id", "", "", ""),
        row("b", "x", "", "", ""),
        row("root", "a_id", "a", "id", "root_a_fkey"),
        row("root", "b_id", "b", "id", "root_b_fkey"),
    ]);
    for _ in 0..8 {
        let (sql, _) =
            rewrite_with("SELECT x FROM root", &catalog, JoinBehavior::Inner).unwrap();
        assert_eq!(sql, "SELECT x FROM root INNER JOIN a ON root.a_id = a.id");
    }
}

#[test]
fn ties_prefer_paths_from_original_tables() {
    // aaa sorts before the original table zz, so the path through aaa is
    // found first; the tie-break must still pick the one rooted at zz.
    let catalog = Catalog::from_rows(vec![
        row("zz", "id", "", "", ""),
        row("aaa", "id", "", "", ""),
        row("aaa", "zz_id", "zz", "id", "aaa_zz_fkey"),
        row("aaa", "a_extra", "", "", ""),
        row("mid", "id", "", "", ""),
        row("mid", "aaa_id", "aaa", "id", "mid_aaa_fkey"),
        row("mid", "zz_id", "zz", "id", "mid_zz_fkey"),
        row("mid", "b_extra", "", "", ""),
    ]);
    let (sql, _) = rewrite_with(
        "SELECT a_extra, b_extra FROM zz",
        &catalog,
        JoinBehavior::Inner,
    )
    .unwrap();
    assert_eq!(
        sql,
        "SELECT a_extra, b_extra FROM zz \
         INNER JOIN aaa ON aaa.zz_id = zz.id \
         INNER JOIN mid ON mid.zz_id = zz.id"
    );
}

#[test]
fn rewrites_every_statement_but_keeps_the_first_plan() {
    let (sql, plan) = rewrite("SELECT image_url FROM users; SELECT body FROM users");
    assert_eq!(
        sql,
        "SELECT image_url FROM users INNER JOIN avatars ON avatars.user_id = users.id; \
         SELECT body FROM users INNER JOIN posts ON posts.user_id = users.id"
    );
    assert_eq!(
        plan.missing_columns_to_joined_tables.get("image_url"),
        Some(&"avatars".to_string())
    );
    assert!(!plan.missing_columns_to_joined_tables.contains_key("body"));
}

#[test]
fn non_select_statements_pass_through() {
    let (sql, plan) = rewrite("INSERT INTO users (id) VALUES (1)");
    assert_eq!(sql, "INSERT INTO users (id) VALUES (1)");
    assert!(plan.missing_columns_to_joined_tables.is_empty());
}

#[test]
fn deterministic_output_across_runs() {
    let mut outputs = Vec::new();
    for _ in 0..8 {
        let (sql, _) = rewrite("SELECT body, image_url, email FROM users");
        outputs.push(sql);
    }
    outputs.dedup();
    assert_eq!(outputs.len(), 1);
}
