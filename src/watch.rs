//! Watch mode, a three-part system:
//!
//! 1. **File watcher**: `notify` behind a debouncer, so a bulk operation
//!    touching many files triggers one rebuild, not one per file.
//! 2. **Reload channel**: a `tungstenite` websocket server on a dedicated
//!    thread holding persistent connections to open browser tabs.
//! 3. **Dev server**: axum serving the output directory as static files.
//!
//! When a change batch arrives, the paths are matched against every task's
//! watch subscriptions, the union of matched tasks is re-run together with
//! their dependencies, and connected clients are notified. A change set
//! consisting solely of stylesheet artifacts sends `"style"`, letting the
//! client swap styles in place; anything else sends `"reload"`. Changes
//! arriving while a rebuild is in flight pile up in the channel and are
//! drained into a single follow-up rebuild; an in-flight run is never
//! preempted.

use std::collections::HashSet;
use std::env;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;
use tungstenite::WebSocket;

use crate::Pipeline;
use crate::error::{PipelineError, WatchError};
use crate::graph::TaskGraph;
use crate::io::as_overhead;
use crate::scheduler::ReloadScope;
use crate::stage::static_prefix;

/// The JavaScript snippet a page needs for live reload. Deployments inject
/// it into their markup; `"style"` messages swap stylesheets in place, any
/// other message reloads the page.
pub fn live_reload_script(port: u16) -> String {
    format!(
        r#"
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", event => {{
    if (event.data === "style") {{
        for (const link of document.querySelectorAll("link[rel=stylesheet]")) {{
            const href = new URL(link.href);
            href.searchParams.set("v", Date.now().toString());
            link.href = href.toString();
        }}
    }} else {{
        window.location.reload();
    }}
}});
"#
    )
}

/// Compiled watch subscriptions: one globset per task, matched against
/// project-root-relative paths.
pub(crate) struct Subscriptions {
    entries: Vec<(String, GlobSet)>,
}

impl Subscriptions {
    pub(crate) fn build(graph: &TaskGraph) -> Result<Self, WatchError> {
        let mut entries = Vec::new();

        for task in graph.tasks() {
            if task.watch.is_empty() {
                continue;
            }

            let mut builder = GlobSetBuilder::new();
            for pattern in &task.watch {
                builder.add(Glob::new(pattern)?);
            }

            entries.push((task.name.clone(), builder.build()?));
        }

        Ok(Self { entries })
    }

    /// Union of tasks whose subscription matches any of the paths.
    pub(crate) fn affected(&self, paths: &HashSet<Utf8PathBuf>) -> HashSet<String> {
        let mut tasks = HashSet::new();

        for (name, set) in &self.entries {
            if paths.iter().any(|path| set.is_match(path)) {
                tasks.insert(name.clone());
            }
        }

        tasks
    }
}

pub(crate) fn watch(pipeline: &mut Pipeline) -> Result<(), PipelineError> {
    let root = env::current_dir().map_err(WatchError::Io)?;
    let (tcp, ws_port) = reserve_port()?;
    pipeline.ws_port = Some(ws_port);

    let clients = Arc::new(Mutex::new(vec![]));
    let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
    let (tx_reload, _thread_o) = new_thread_ws_reload(clients.clone());

    let subscriptions = Subscriptions::build(&pipeline.graph)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let debounce = Duration::from_millis(pipeline.debounce_ms);
    let mut debouncer = new_debouncer(debounce, None, tx).map_err(WatchError::Notify)?;

    let mut roots = HashSet::new();
    for task in pipeline.graph.tasks() {
        for pattern in &task.watch {
            match watch_root(pattern) {
                Some(root) => {
                    roots.insert(root);
                }
                // A subscription whose directory doesn't exist yet falls
                // back to the configured source root.
                None => match watch_root(pipeline.source_root.as_str()) {
                    Some(root) => {
                        roots.insert(root);
                    }
                    None => tracing::warn!("cannot resolve a watch root for '{pattern}'"),
                },
            }
        }
    }

    for path in collapse_watch_paths(roots) {
        tracing::debug!("watching {path}");
        debouncer
            .watch(path.as_std_path(), RecursiveMode::Recursive)
            .map_err(WatchError::Notify)?;
    }

    tracing::info!("running initial build...");
    let report = pipeline.build()?;
    report.print_summary();

    #[cfg(feature = "server")]
    let _thread_http = server::start(pipeline.port, pipeline.output_root.clone());

    eprintln!(
        "Watching for changes, reload socket on {}",
        style(format!("ws://localhost:{ws_port}")).yellow()
    );

    loop {
        let first = match rx.recv() {
            Ok(result) => result,
            // The debouncer is gone; nothing left to wait for.
            Err(_) => return Ok(()),
        };

        // Everything queued while the previous rebuild ran coalesces into
        // this batch.
        let mut results = vec![first];
        results.extend(rx.try_iter());

        let mut changed = HashSet::new();
        for result in results {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                    continue;
                }
            };

            for event in events.iter().filter(|de| {
                matches!(
                    de.event.kind,
                    EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                )
            }) {
                for path in &event.event.paths {
                    let Ok(rel) = path.strip_prefix(&root) else {
                        continue;
                    };
                    let Ok(rel) = Utf8PathBuf::try_from(rel.to_path_buf()) else {
                        continue;
                    };

                    if !path.exists() {
                        pipeline.tracker.lock().unwrap().forget(&rel);
                    }
                    changed.insert(rel);
                }
            }
        }

        if changed.is_empty() {
            continue;
        }

        let affected = subscriptions.affected(&changed);
        if affected.is_empty() {
            continue;
        }

        tracing::info!(
            "change detected, re-running {} task(s)...",
            affected.len()
        );
        let start = Instant::now();

        // A broken rebuild must not kill the dev server; report and keep
        // waiting for the next change.
        let report = pipeline.rebuild(&affected);
        report.print_summary();

        // Clients refresh even after partial failure, so unaffected
        // assets stay current.
        if tx_reload.send(report.reload_scope()).is_err() {
            tracing::error!("reload channel closed");
        }

        eprintln!("Refreshed {}", as_overhead(start));
    }
}

fn reserve_port() -> Result<(TcpListener, u16), WatchError> {
    let listener = match TcpListener::bind("127.0.0.1:1337") {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0").map_err(WatchError::Bind)?,
    };

    let addr = listener.local_addr().map_err(WatchError::Bind)?;
    let port = addr.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(
    server: TcpListener,
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };
            let Ok(socket) = tungstenite::accept(stream) else {
                continue;
            };
            client.lock().unwrap().push(socket);
        }
    })
}

fn new_thread_ws_reload(
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<ReloadScope>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while let Ok(scope) = rx.recv() {
            let message = match scope {
                ReloadScope::Style => "style",
                ReloadScope::Full => "reload",
            };

            let mut clients = client.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send(message.into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(e) => {
                        tracing::error!("reload send failed: {e:?}");
                    }
                }
            }

            // Disconnects are non-fatal; prune them on the way out.
            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Close all but the last 10 connections
            let len = clients.len();
            if len > 10 {
                for mut socket in clients.drain(0..len - 10) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}

/// The canonicalized directory to hand the watcher for a subscription
/// glob: its static prefix, or the parent when the prefix is a file.
fn watch_root(pattern: &str) -> Option<Utf8PathBuf> {
    let prefix = static_prefix(pattern);
    let prefix = if prefix.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        prefix
    };

    let absolute = prefix.canonicalize_utf8().ok()?;

    if absolute.is_file() {
        absolute.parent().map(Utf8Path::to_path_buf)
    } else {
        Some(absolute)
    }
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive. This function sorts the paths and filters
/// out any path that is a subdirectory of a previously accepted path.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(feature = "server")]
mod server {
    use std::{net::SocketAddr, thread};

    use axum::Router;
    use camino::Utf8PathBuf;
    use console::style;
    use tower_http::services::ServeDir;

    pub fn start(port: u16, dir: Utf8PathBuf) -> thread::JoinHandle<Result<(), anyhow::Error>> {
        let url = style(format!("http://localhost:{port}/")).yellow();
        eprintln!("Starting a HTTP server on {url}");

        thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(serve(port, dir))
        })
    }

    async fn serve(port: u16, dir: Utf8PathBuf) -> Result<(), anyhow::Error> {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let address = tokio::net::TcpListener::bind(address).await?;

        let router = Router::new()
            // the directory with built assets
            .fallback_service(ServeDir::new(dir.as_std_path()));

        axum::serve(address, router).await?;

        Ok(())
    }
}
