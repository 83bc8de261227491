//! `DuckDB`-backed connector for a `MySQL` upstream.
//!
//! Opens an in-memory `DuckDB`, loads the `mysql` extension, and attaches
//! the upstream database read-only, reaching it through an [`SshTunnel`]
//! unless `use_localhost` is set. Every page is projected to text with
//! `COLUMNS(*)::VARCHAR` so rows map straight onto [`Table`] cells.

use async_trait::async_trait;
use duckdb::Connection;
use encounter_sync_source_models::{ConnectionConfig, Table};

use crate::tunnel::SshTunnel;
use crate::{PageQuery, SourceConnector, SourceError};

/// Alias the upstream database is attached under.
const ATTACH_ALIAS: &str = "upstream";

/// Connector executing page queries through `DuckDB`'s `mysql` scanner.
pub struct DuckDbConnector {
    config: ConnectionConfig,
    conn: Option<Connection>,
    tunnel: Option<SshTunnel>,
}

impl DuckDbConnector {
    /// Creates a closed connector.
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            conn: None,
            tunnel: None,
        }
    }

    fn attach_statement(&self, host: &str, port: u16) -> String {
        let db = &self.config.db_route;
        let dsn = format!(
            "host={host} port={port} user={} password={} database={}",
            db.user, db.password, db.database
        );
        format!(
            "ATTACH '{}' AS {ATTACH_ALIAS} (TYPE mysql, READ_ONLY); USE {ATTACH_ALIAS};",
            dsn.replace('\'', "''")
        )
    }
}

#[async_trait]
impl SourceConnector for DuckDbConnector {
    fn name(&self) -> &str {
        &self.config.db_route.database
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        let (host, port) = if self.config.use_localhost {
            (self.config.db_route.host.clone(), self.config.db_route.port)
        } else {
            let route = self
                .config
                .ssh_route
                .as_ref()
                .ok_or_else(|| SourceError::Connection {
                    message: "ssh_route is required unless use_localhost is set".to_string(),
                })?;
            let tunnel = SshTunnel::open(
                route,
                &self.config.db_route.host,
                self.config.db_route.port,
                self.config.local_port,
            )
            .await?;
            let port = tunnel.local_port();
            self.tunnel = Some(tunnel);
            ("127.0.0.1".to_string(), port)
        };

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("INSTALL mysql; LOAD mysql;")?;
        conn.execute_batch(&self.attach_statement(&host, port))?;

        log::info!(
            "Attached {}@{host}:{port}/{}",
            self.config.db_route.user,
            self.config.db_route.database
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn query(&mut self, page: &PageQuery) -> Result<Table, SourceError> {
        let conn = self.conn.as_ref().ok_or_else(|| SourceError::Connection {
            message: "query on a closed connection".to_string(),
        })?;

        let sql = format!("SELECT COLUMNS(*)::VARCHAR FROM ({}) AS page", page.sql);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let columns = rows
            .as_ref()
            .map(duckdb::Statement::column_names)
            .unwrap_or_default();
        let width = columns.len();
        let mut table = Table::new(columns);

        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                let value: Option<String> = row.get(idx)?;
                cells.push(value.unwrap_or_default());
            }
            table.push_row(cells);
        }

        Ok(table)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(conn) = self.conn.take()
            && let Err((_, e)) = conn.close()
        {
            log::warn!("Failed to close DuckDB connection cleanly: {e}");
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close()?;
        }
        Ok(())
    }
}
