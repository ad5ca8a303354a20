use std::env;

use clap::{Parser as ClapParser, ValueEnum};
use pg_autojoin::{add_missing_joins, catalog, JoinBehavior};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tokio_postgres::SimpleQueryMessage;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
struct Args {
    /// Query to rewrite.
    query: String,
    /// Join type used for added joins.
    #[arg(long = "jointype", value_enum, default_value = "inner")]
    join_type: JoinType,
    /// Print the rewritten query without executing it.
    #[arg(long)]
    noexec: bool,
    /// Enable verbose output.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Copy, Clone, ValueEnum)]
enum JoinType {
    Inner,
    Left,
}

impl From<JoinType> for JoinBehavior {
    fn from(value: JoinType) -> Self {
        match value {
            JoinType::Inner => JoinBehavior::Inner,
            JoinType::Left => JoinBehavior::Left,
        }
    }
}

/// Rewrite one query against the schema of `DATABASE_URL`, print both
/// versions, and tabulate the rewritten query's results.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let dburl =
        env::var("DATABASE_URL").map_err(|_| "DATABASE_URL env variable is required")?;

    let client = catalog::connect(&dburl).await?;
    let catalog = catalog::fetch_catalog(&client).await?;

    let mut stmts = Parser::parse_sql(&PostgreSqlDialect {}, &args.query)?;
    add_missing_joins(&mut stmts, &catalog, args.join_type.into())?;
    let new_query = stmts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");

    println!("Old query:\n\t{}", args.query);
    println!("New query:\n\t{new_query}");

    if args.noexec {
        return Ok(());
    }

    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    for message in client.simple_query(&new_query).await? {
        if let SimpleQueryMessage::Row(row) = message {
            if headers.is_empty() {
                headers = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            rows.push(
                (0..row.len())
                    .map(|idx| row.get(idx).unwrap_or_default().to_string())
                    .collect(),
            );
        }
    }

    println!();
    if !headers.is_empty() {
        let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                if cell.len() > widths[idx] {
                    widths[idx] = cell.len();
                }
            }
        }
        let underline: Vec<String> = headers.iter().map(|h| "-".repeat(h.len())).collect();
        print_row(&headers, &widths);
        print_row(&underline, &widths);
        for row in &rows {
            print_row(row, &widths);
        }
        println!();
    }
    println!("Query returned {} rows", rows.len());
    Ok(())
}

fn print_row(cells: &[String], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", line.trim_end());
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
