use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::Instrument;

use joblist::async_io::{FdPool, Worker};
use joblist::negotiate::{probe, PhysicalPath};
use joblist::Config;


/// Extensions tried for requests naming a missing file.
const EXTS: [&str; 2] = [".html", ".txt"];

/// Serves a single HTTP/1.0 request from `doc_root`.
async fn handler(
    conn: &mut tokio::net::TcpStream, pool: &FdPool, doc_root: &Path,
) -> io::Result<()> {
    let (r, mut w) = conn.split();
    let mut line = String::new();
    BufReader::new(r).read_line(&mut line).await?;

    let Some(rel_path) = parse_request_line(&line) else {
        tracing::warn!(request = line.trim_end(), "malformed request");
        return w.write_all(b"HTTP/1.0 400 Bad Request\r\n\r\n").await;
    };

    let mut physical = PhysicalPath::new(doc_root, rel_path);
    if let Some(ext) = probe(&physical.full_path(), &EXTS) {
        physical.rel_path.push_str(ext);
    }

    // The permit stands for the file descriptor opened below. Waiting here
    // is how a connection parks until some other connection closes a file.
    let Ok(_permit) = pool.acquire().await else {
        return w.write_all(b"HTTP/1.0 503 Service Unavailable\r\n\r\n").await;
    };
    let body = match tokio::fs::read(physical.full_path()).await {
        Ok(b) => b,
        Err(e) => {
            {
                // dyn Error is not Sync, so the borrow must end before the await
                let error: &dyn std::error::Error = &e;
                tracing::info!(error, rel_path = %physical.rel_path, "cannot open file");
            }
            return w.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
        },
    };

    let head = format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    w.write_all(head.as_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await
}

/// Extracts the path of a `GET` request line, rejecting anything that could
/// escape the document root.
fn parse_request_line(line: &str) -> Option<&str> {
    let mut parts = line.split_ascii_whitespace();
    let (Some("GET"), Some(path)) = (parts.next(), parts.next()) else {
        return None;
    };
    let path = path.split('?').next().unwrap_or_default();
    if !path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(path)
}


// A single worker on the current-thread runtime. Run one worker per thread
// to scale out, since workers share nothing.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    // Keep at most 16 files open at once, so a burst of requests queues up
    let config = Config::with_fds(16.try_into().unwrap());
    let worker = Worker::new(&config);
    let doc_root: Arc<Path> = std::env::var_os("DOC_ROOT")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .into();

    let res = tokio::select! {
        biased;  // poll in order, so quit() future first
        r = quit() => r,
        r = server(&worker, &doc_root) => r,
    };
    if let Err(e) = res {
        let error: &dyn std::error::Error = &e;
        tracing::error!(error, "server loop failed");
    }

    tracing::info!(live = worker.live(), "shutting down");
    worker.shutdown().await;
}

/// Runs the HTTP server on localhost:8080.
async fn server(worker: &Worker, doc_root: &Arc<Path>) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 8080)).await?;
    let local = listener.local_addr()?;
    tracing::info!(%local, doc_root = ?doc_root, "server created");

    loop {
        let (mut conn, remote) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                let error: &dyn std::error::Error = &e;
                tracing::info!(%local, error, "accept failed");
                continue;
            },
        };

        let pool = worker.pool().clone();
        let doc_root = doc_root.clone();
        let span = tracing::error_span!("http_connection", %local, %remote);
        worker.spawn(async move {
            tracing::debug!(waiters = pool.waiters(), "new connection accepted");
            let res = handler(&mut conn, &pool, &doc_root).await;
            if let Err(e) = res {
                let error: &dyn std::error::Error = &e;
                tracing::info!(error, "connection failed");
            }
        }.instrument(span));
    }
}


/// Waits for a signal to shut the server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the server down.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


/// Sets up a `tracing` subscriber to stderr, honoring `RUST_LOG` as a level.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = std::env::var("RUST_LOG").ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| match v.parse::<LevelFilter>() {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("Ignoring `RUST_LOG={v}`: {e}");
                None
            },
        })
        .unwrap_or(LevelFilter::INFO);

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}
