use std::env;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use pg_autojoin::proxy::{CredentialDefaults, ProxyConfig, ProxyServer};
use pg_autojoin::tls::TlsTermination;
use pg_autojoin::{JoinBehavior, SchemaCache};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
struct Args {
    /// Local listen address.
    #[arg(long, default_value = "127.0.0.1:5337")]
    listen: String,
    /// Remote postgres server address.
    #[arg(long, default_value = "127.0.0.1:5432")]
    proxy: String,
    /// Prefix row descriptors with the newly joined table (ex: email => users_email).
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    prefix: bool,
    /// The maximum number of seconds database schema should be cached (0 = never expire).
    #[arg(long = "cachettl", default_value_t = 3600)]
    cache_ttl: u64,
    /// Join type used for added joins.
    #[arg(long = "jointype", value_enum, default_value = "inner")]
    join_type: JoinType,
    /// Only respond to AUTOJOIN queries, pass all other queries through untouched.
    #[arg(long = "onlyjoin")]
    only_join: bool,
    /// Enable verbose output.
    #[arg(long)]
    verbose: bool,
}

#[derive(Copy, Clone, ValueEnum)]
enum JoinType {
    Inner,
    Left,
}

/// Proxy a local port to a PostgreSQL server, adding missing JOINs to
/// queries on the way through.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let dburl =
        env::var("DATABASE_URL").map_err(|_| "DATABASE_URL env variable is required")?;
    let credential_defaults = credential_defaults(&dburl)?;

    let tls = match (
        env::var("PG_AUTOJOIN_CERTFILE"),
        env::var("PG_AUTOJOIN_KEYFILE"),
    ) {
        (Ok(cert), Ok(key)) if !cert.is_empty() && !key.is_empty() => {
            Some(TlsTermination::from_pem_files(&cert, &key).await?)
        }
        _ => None,
    };

    let join_behavior = match args.join_type {
        JoinType::Inner => JoinBehavior::Inner,
        JoinType::Left => JoinBehavior::Left,
    };

    let cache = Arc::new(SchemaCache::new(Duration::from_secs(args.cache_ttl)));
    let server = Arc::new(ProxyServer::new(
        ProxyConfig {
            upstream_addr: args.proxy.clone(),
            credential_defaults,
            only_respond_to_autojoins: args.only_join,
            prefix_field_descriptors: args.prefix,
            join_behavior,
            tls,
        },
        cache,
    ));

    let listener = TcpListener::bind(&args.listen).await?;
    info!("Proxying {} => {}", args.listen, args.proxy);
    server.serve(listener, shutdown_signal()).await?;
    Ok(())
}

fn credential_defaults(dburl: &str) -> Result<CredentialDefaults, url::ParseError> {
    let parsed = Url::parse(dburl)?;
    let user = (!parsed.username().is_empty()).then(|| parsed.username().to_string());
    let password = parsed.password().map(str::to_string);
    let database = parsed.path().trim_start_matches('/');
    let database = (!database.is_empty()).then(|| database.to_string());
    Ok(CredentialDefaults {
        user,
        password,
        database,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
