//! Prometheus text exposition
//!
//! Metric names are prefixed with `rowcache_`; counters end in `_total` and
//! per-table series carry a `table` label.

use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::debug;

use crate::refresh::{RefreshCoordinator, RefreshSnapshot};
use crate::service::{LookupService, TableStats};
use crate::source::DataSource;
use crate::stats::ServiceSnapshot;

/// Everything exported about one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetrics {
    /// Table name
    pub name: String,
    /// Current generation, if one is published
    pub current: Option<TableStats>,
    /// Refresh counters
    pub refresh: RefreshSnapshot,
}

/// Gather [`TableMetrics`] for every table of `coordinator`.
pub fn table_metrics<S: DataSource>(
    service: &LookupService,
    coordinator: &RefreshCoordinator<S>,
) -> Vec<TableMetrics> {
    coordinator
        .registry()
        .iter()
        .map(|entry| {
            let id = entry.spec().id();
            TableMetrics {
                name: entry.spec().name().to_string(),
                current: service.stats(id),
                refresh: coordinator
                    .stats(id)
                    .map(|stats| stats.snapshot())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Renders snapshots in the Prometheus text format
#[derive(Debug, Clone)]
pub struct PrometheusRenderer {
    include_metadata: bool,
}

impl Default for PrometheusRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusRenderer {
    /// Renderer emitting `# HELP` and `# TYPE` lines
    pub fn new() -> Self {
        Self {
            include_metadata: true,
        }
    }

    /// Renderer emitting bare samples
    pub fn without_metadata() -> Self {
        Self {
            include_metadata: false,
        }
    }

    /// Render service counters and per-table series.
    pub fn render(&self, service: &ServiceSnapshot, tables: &[TableMetrics]) -> String {
        let mut out = String::with_capacity(1024 + tables.len() * 1024);

        self.gauge(&mut out, "rowcache_uptime_seconds", "Seconds since the service started.", service.uptime_secs as f64);
        self.counter(&mut out, "rowcache_fetches_total", "Fetch requests.", service.fetches);
        self.counter(&mut out, "rowcache_fetch_hits_total", "Fetches that found the key.", service.hits);
        self.counter(&mut out, "rowcache_fetch_misses_total", "Fetches that missed.", service.misses);
        self.counter(
            &mut out,
            "rowcache_fetch_unavailable_total",
            "Fetches against an index not built in the current generation.",
            service.unavailable,
        );
        self.counter(&mut out, "rowcache_unknown_table_total", "Requests naming an unknown or unloaded table.", service.unknown_table);
        self.counter(&mut out, "rowcache_bad_requests_total", "Malformed requests.", service.bad_requests);
        self.counter(&mut out, "rowcache_too_large_total", "Responses over the size limit.", service.too_large);
        self.counter(&mut out, "rowcache_admin_requests_total", "Stats and describe requests.", service.admin_requests);
        self.counter(&mut out, "rowcache_connections_total", "Connections accepted.", service.connections_opened);
        self.gauge(&mut out, "rowcache_connections_active", "Connections currently open.", service.active_connections() as f64);
        self.counter(&mut out, "rowcache_sent_bytes_total", "Response bytes written.", service.bytes_sent);

        if tables.is_empty() {
            return out;
        }

        self.table_series(&mut out, tables, "rowcache_table_rows", "Rows in the current generation.", "gauge", |t| {
            t.current.as_ref().map(|c| c.rows as f64)
        });
        self.table_series(&mut out, tables, "rowcache_table_generation", "Sequence of the current generation.", "gauge", |t| {
            t.current.as_ref().map(|c| c.generation as f64)
        });
        self.table_series(&mut out, tables, "rowcache_table_arena_bytes", "Arena bytes held by the current generation.", "gauge", |t| {
            t.current.as_ref().map(|c| c.arena_bytes as f64)
        });
        self.table_series(&mut out, tables, "rowcache_table_skipped_keys", "Index keys skipped by the last build.", "gauge", |t| {
            t.current.as_ref().map(|c| c.skipped_keys as f64)
        });
        self.table_series(&mut out, tables, "rowcache_refresh_attempts_total", "Refresh builds started.", "counter", |t| {
            Some(t.refresh.attempts as f64)
        });
        self.table_series(&mut out, tables, "rowcache_refresh_failures_total", "Refresh builds that did not publish.", "counter", |t| {
            Some(t.refresh.failures as f64)
        });
        self.table_series(
            &mut out,
            tables,
            "rowcache_refresh_overflow_failures_total",
            "Refresh builds aborted by an index probe limit.",
            "counter",
            |t| Some(t.refresh.overflow_failures as f64),
        );
        self.table_series(
            &mut out,
            tables,
            "rowcache_refresh_last_duration_seconds",
            "Duration of the last successful build.",
            "gauge",
            |t| Some(t.refresh.last_duration_ms as f64 / 1000.0),
        );
        self.table_series(
            &mut out,
            tables,
            "rowcache_refresh_last_success_timestamp_seconds",
            "Unix time of the last successful build.",
            "gauge",
            |t| Some(t.refresh.last_success_time as f64),
        );
        out
    }

    fn metadata(&self, out: &mut String, name: &str, help: &str, ty: &str) {
        if self.include_metadata {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {ty}");
        }
    }

    fn counter(&self, out: &mut String, name: &str, help: &str, value: u64) {
        self.metadata(out, name, help, "counter");
        let _ = writeln!(out, "{name} {value}");
    }

    fn gauge(&self, out: &mut String, name: &str, help: &str, value: f64) {
        self.metadata(out, name, help, "gauge");
        let _ = writeln!(out, "{name} {}", finite(value));
    }

    fn table_series(
        &self,
        out: &mut String,
        tables: &[TableMetrics],
        name: &str,
        help: &str,
        ty: &str,
        value: impl Fn(&TableMetrics) -> Option<f64>,
    ) {
        self.metadata(out, name, help, ty);
        for table in tables {
            if let Some(v) = value(table) {
                let _ = writeln!(out, "{name}{{table=\"{}\"}} {}", escape_label(&table.name), finite(v));
            }
        }
    }
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Body producer for [`MetricsHttpServer`]
pub type RenderFn = Arc<dyn Fn() -> String + Send + Sync>;

/// HTTP endpoint serving `GET /metrics` and `GET /healthz`
///
/// Requires a Tokio runtime.
#[derive(Debug)]
pub struct MetricsHttpServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl MetricsHttpServer {
    /// Listen on `addr`; port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, render: RenderFn) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => {
                            let render = Arc::clone(&render);
                            tokio::spawn(async move {
                                if let Err(err) = answer(socket, &render).await {
                                    debug!(error = %err, "metrics request failed");
                                }
                            });
                        }
                        Err(err) => debug!(error = %err, "metrics accept failed"),
                    },
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            join,
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        (&mut self.join)
            .await
            .map_err(|err| io::Error::other(format!("metrics server join failed: {err}")))
    }
}

async fn answer(socket: TcpStream, render: &RenderFn) -> io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let (status, content_type, body) = match (parts.next(), parts.next()) {
        (Some("GET"), Some("/metrics")) => (
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            render(),
        ),
        (Some("GET"), Some("/healthz")) => ("200 OK", "text/plain; charset=utf-8", "ok\n".to_string()),
        _ => ("404 Not Found", "text/plain; charset=utf-8", "not found\n".to_string()),
    };

    let mut socket = reader.into_inner();
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body.as_bytes()).await?;
    socket.shutdown().await
}
