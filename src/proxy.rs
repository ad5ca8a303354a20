//! The wire-level interception proxy.
//!
//! Sits between a SQL client and a PostgreSQL server, relaying the
//! startup handshake and all traffic byte-for-byte except for the
//! handful of messages it rewrites: query texts on the way in, row
//! descriptors on the way out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::cache::SchemaCache;
use crate::catalog::{PgSchemaLoader, SchemaLoader};
use crate::join::{self, JoinBehavior, JoinPlan};
use crate::tls::{Connection, TlsError, TlsTermination};
use crate::wire::{self, Frame, StartupMessage, WireError};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Credentials taken from `DATABASE_URL`, used when a connection's own
/// startup parameters or password message do not provide them.
#[derive(Debug, Clone, Default)]
pub struct CredentialDefaults {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

/// Runtime options for the proxy, mirroring its command line.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address of the real PostgreSQL server.
    pub upstream_addr: String,
    pub credential_defaults: CredentialDefaults,
    /// Pass every query through untouched unless it starts with AUTOJOIN.
    pub only_respond_to_autojoins: bool,
    /// Rename row-descriptor fields to `<table>_<column>` for columns
    /// resolved by an added join.
    pub prefix_field_descriptors: bool,
    pub join_behavior: JoinBehavior,
    /// When set, answer client SSLRequests by terminating TLS.
    pub tls: Option<TlsTermination>,
}

/// Per-connection scratch state shared by the two pump directions.
#[derive(Default)]
struct ConnState {
    params: HashMap<String, String>,
    password: Option<String>,
    join_plan: Option<JoinPlan>,
}

pub struct ProxyServer {
    cfg: ProxyConfig,
    cache: Arc<SchemaCache>,
    loader: Arc<dyn SchemaLoader>,
}

impl ProxyServer {
    pub fn new(cfg: ProxyConfig, cache: Arc<SchemaCache>) -> Self {
        Self::with_loader(cfg, cache, Arc::new(PgSchemaLoader))
    }

    pub fn with_loader(
        cfg: ProxyConfig,
        cache: Arc<SchemaCache>,
        loader: Arc<dyn SchemaLoader>,
    ) -> Self {
        Self { cfg, cache, loader }
    }

    /// Accept connections until `shutdown` resolves, then stop listening
    /// and wait for in-flight handlers to finish.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ProxyError> {
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "client connected");
                    let server = self.clone();
                    handlers.spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            debug!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
            }
        }
        drop(listener);
        while handlers.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ProxyError> {
        let mut client = Connection::Plain(stream);
        let (params, raw) = loop {
            match wire::read_startup(&mut client).await? {
                StartupMessage::SslRequest => {
                    client = match (client, &self.cfg.tls) {
                        (Connection::Plain(mut plain), Some(tls)) => {
                            plain.write_all(b"S").await?;
                            Connection::Tls(Box::new(tls.accept(plain).await?))
                        }
                        (mut conn, _) => {
                            conn.write_all(b"N").await?;
                            conn
                        }
                    };
                }
                cancel @ StartupMessage::CancelRequest { .. } => {
                    let mut upstream = TcpStream::connect(&self.cfg.upstream_addr).await?;
                    upstream.write_all(&cancel.to_bytes()).await?;
                    return Ok(());
                }
                StartupMessage::Startup { params, raw } => break (params, raw),
            }
        };

        let upstream = TcpStream::connect(&self.cfg.upstream_addr).await?;
        let (mut upstream_read, mut upstream_write) = upstream.into_split();
        upstream_write
            .write_all(&wire::encode_startup(wire::VERSION_V3, &raw))
            .await?;

        let state = Mutex::new(ConnState {
            params,
            ..ConnState::default()
        });
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let client_to_server = async {
            while let Some(frame) = Frame::read(&mut client_read).await? {
                let frame = self.process_client_frame(&state, frame).await;
                frame.write(&mut upstream_write).await?;
            }
            upstream_write.shutdown().await?;
            Ok::<_, ProxyError>(())
        };
        let server_to_client = async {
            while let Some(frame) = Frame::read(&mut upstream_read).await? {
                let frame = self.process_server_frame(&state, frame).await;
                frame.write(&mut client_write).await?;
            }
            client_write.shutdown().await?;
            Ok::<_, ProxyError>(())
        };
        tokio::try_join!(client_to_server, server_to_client)?;
        Ok(())
    }

    async fn process_client_frame(&self, state: &Mutex<ConnState>, frame: Frame) -> Frame {
        match frame.msg_type {
            wire::MSG_PASSWORD => {
                if let Ok(password) = wire::password_text(&frame) {
                    state.lock().await.password = Some(password);
                }
                frame
            }
            wire::MSG_QUERY => match wire::query_text(&frame) {
                Ok(sql) => {
                    let rewritten = self.rewrite_query_text(state, &sql).await;
                    wire::query_frame(&rewritten)
                }
                Err(_) => frame,
            },
            wire::MSG_PARSE => match wire::decode_parse(&frame) {
                Ok(parse) => {
                    let rewritten = self.rewrite_query_text(state, &parse.sql).await;
                    parse.with_sql(&rewritten)
                }
                Err(_) => frame,
            },
            _ => frame,
        }
    }

    async fn process_server_frame(&self, state: &Mutex<ConnState>, frame: Frame) -> Frame {
        if frame.msg_type != wire::MSG_ROW_DESCRIPTION || !self.cfg.prefix_field_descriptors {
            return frame;
        }
        let Some(plan) = state.lock().await.join_plan.clone() else {
            return frame;
        };
        if plan.missing_columns_to_joined_tables.is_empty() {
            return frame;
        }
        match wire::decode_row_description(&frame) {
            Ok(mut desc) => {
                desc.rename_fields(|name| {
                    plan.missing_columns_to_joined_tables
                        .get(name)
                        .map(|table| format!("{table}_{name}"))
                });
                desc.into_frame()
            }
            Err(_) => frame,
        }
    }

    /// Rewrite one query text. Never fails: on error the original text
    /// goes through unchanged, or a diagnostic SELECT when the client
    /// opted in with AUTOJOIN.
    async fn rewrite_query_text(&self, state: &Mutex<ConnState>, sql: &str) -> String {
        let (autojoin, verbose, stripped) = strip_autojoin_keyword(sql);
        if !autojoin && self.cfg.only_respond_to_autojoins {
            return sql.to_string();
        }
        let sql = if autojoin { stripped } else { sql };

        let mut stmts = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(stmts) => stmts,
            Err(err) => {
                // The server's own syntax error will be better than ours.
                debug!(error = %err, "could not parse query");
                return sql.to_string();
            }
        };

        let dburl = self.build_db_url(state).await;
        let catalog = match self.cache.get_or_load(&dburl, self.loader.as_ref()).await {
            Ok(catalog) => catalog,
            Err(err) => {
                error!(error = %err, "could not get db info for query");
                if autojoin {
                    return error_message_as_select(
                        "could not get db info for query, unable to autojoin",
                    );
                }
                return sql.to_string();
            }
        };

        let plan = match join::add_missing_joins(&mut stmts, &catalog, self.cfg.join_behavior) {
            Ok(plan) => plan,
            Err(err) => {
                debug!(error = %err, "could not add missing joins to query");
                if autojoin {
                    return error_message_as_select(&format!(
                        "could not add missing joins to query: {err}, unable to autojoin"
                    ));
                }
                return sql.to_string();
            }
        };

        let deparsed = stmts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        debug!(old = %sql, new = %deparsed, "rewrote query");

        if autojoin {
            if verbose && !plan.missing_columns_to_possible_tables.is_empty() {
                let mut rows = vec![format!("({}, '', '')", quote_literal(&deparsed))];
                for (column, tables) in &plan.missing_columns_to_possible_tables {
                    let tables = tables.iter().cloned().collect::<Vec<_>>().join(",");
                    rows.push(format!(
                        "('', {}, {})",
                        quote_literal(column),
                        quote_literal(&tables)
                    ));
                }
                format!(
                    "SELECT * FROM (VALUES {}) AS t (new_query, missing_column, possible_tables)",
                    rows.join(",")
                )
            } else {
                format!("SELECT {} AS new_query", quote_literal(&deparsed))
            }
        } else {
            state.lock().await.join_plan = Some(plan);
            deparsed
        }
    }

    /// Canonical URL for the schema cache:
    /// `postgres://[user[:password]@]host:port[/database]`. The password
    /// comes from the captured PasswordMessage, not startup parameters.
    async fn build_db_url(&self, state: &Mutex<ConnState>) -> String {
        let state = state.lock().await;
        let defaults = &self.cfg.credential_defaults;
        let user = state
            .params
            .get("user")
            .cloned()
            .or_else(|| defaults.user.clone());
        let password = state.password.clone().or_else(|| defaults.password.clone());
        let database = state
            .params
            .get("database")
            .cloned()
            .or_else(|| defaults.database.clone());

        let mut url = String::from("postgres://");
        if let Some(user) = user {
            url.push_str(&user);
            if let Some(password) = password {
                url.push(':');
                url.push_str(&password);
            }
            url.push('@');
        }
        url.push_str(&self.cfg.upstream_addr);
        if let Some(database) = database {
            url.push('/');
            url.push_str(&database);
        }
        url
    }
}

/// Match the `AUTOJOIN[ VERBOSE] ` keyword prefix, case-insensitively,
/// returning (matched, verbose, remainder).
pub fn strip_autojoin_keyword(sql: &str) -> (bool, bool, &str) {
    let Some(rest) = strip_prefix_ignore_case(sql, "AUTOJOIN") else {
        return (false, false, sql);
    };
    if let Some(rest) = strip_prefix_ignore_case(rest, " VERBOSE ") {
        return (true, true, rest);
    }
    if let Some(rest) = rest.strip_prefix(' ') {
        return (true, false, rest);
    }
    (false, false, sql)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Quote a string as a SQL literal: quotes doubled, and the `E''` form
/// with doubled backslashes when the text contains one.
pub fn quote_literal(s: &str) -> String {
    let escaped = s.replace('\'', "''");
    if escaped.contains('\\') {
        format!(" E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

/// Errors surface to AUTOJOIN clients as a result set rather than a
/// server-side RAISE.
fn error_message_as_select(msg: &str) -> String {
    format!("SELECT {} AS error;", quote_literal(msg))
}
