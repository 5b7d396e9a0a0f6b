//! Messaging surface of the engine.
//!
//! The engine hosts its own bus endpoint: an axum server with a `/health`
//! route and a Socket.IO layer that broadcasts `envelope`, `origin`,
//! `filterbank`, `taup` and `tauc` events and accepts `pick` events from
//! connected pickers. A dedicated writer task decouples the dispatcher from
//! socket I/O; every `sync_every` sent messages the dispatcher requests a
//! sync token and waits until the writer has drained, which throttles
//! acquisition against a slow bus.
//!
//! Test mode counts messages without sending; offline mode runs without any
//! server at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use serde_json::json;
use socketioxide::extract::{Data, SocketRef};
use socketioxide::SocketIo;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use seismic_types::Pick;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Health endpoint ─────────────────────────────────────────────────────────

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Writer task ─────────────────────────────────────────────────────────────

enum BusCommand {
    Emit {
        event: &'static str,
        payload: serde_json::Value,
    },
    Sync(oneshot::Sender<()>),
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<BusCommand>, io: SocketIo) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            BusCommand::Emit { event, payload } => {
                if let Err(e) = io.emit(event, &payload) {
                    debug!("bus emit failed: {e}");
                }
            }
            BusCommand::Sync(ack) => {
                // All previously queued emits are handed off; release the
                // dispatcher.
                let _ = ack.send(());
            }
        }
    }
}

// ─── Bus handle ──────────────────────────────────────────────────────────────

/// The dispatcher's side of the bus. Cheap to pass around; all sends are
/// non-blocking except the periodic sync token.
pub struct BusHandle {
    tx: Option<mpsc::UnboundedSender<BusCommand>>,
    sync_every: usize,
    sent_since_sync: usize,
    test_mode: bool,
    pub sent_total: u64,
    pub failed_total: u64,
}

impl BusHandle {
    /// A handle that counts messages but never sends (offline / test runs
    /// without a server).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            sync_every: usize::MAX,
            sent_since_sync: 0,
            test_mode: true,
            sent_total: 0,
            failed_total: 0,
        }
    }

    pub async fn emit<T: serde::Serialize>(&mut self, event: &'static str, message: &T) {
        self.sent_total += 1;

        if self.test_mode {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };

        let payload = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                warn!("cannot serialize {event} message: {e}");
                self.failed_total += 1;
                return;
            }
        };

        if tx.send(BusCommand::Emit { event, payload }).is_err() {
            // Writer gone; count, do not retry
            self.failed_total += 1;
            return;
        }

        self.sent_since_sync += 1;
        if self.sent_since_sync >= self.sync_every {
            self.sent_since_sync = 0;
            self.sync().await;
        }
    }

    /// Request a sync token and wait until the writer caught up.
    pub async fn sync(&mut self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(BusCommand::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Start the bus surface. Returns the dispatcher's handle and the channel on
/// which picks from connected clients arrive.
pub async fn start(
    listen: &str,
    sync_every: usize,
    test_mode: bool,
) -> anyhow::Result<(BusHandle, mpsc::Receiver<Pick>)> {
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    let (pick_tx, pick_rx) = mpsc::channel::<Pick>(64);
    let (socket_layer, io) = SocketIo::builder().build_layer();

    io.ns("/", move |socket: SocketRef| {
        let pick_tx = pick_tx.clone();
        info!("bus client connected: {}", socket.id);

        socket.on("pick", move |_s: SocketRef, Data::<Pick>(pick)| {
            let pick_tx = pick_tx.clone();
            async move {
                if pick_tx.try_send(pick).is_err() {
                    warn!("pick channel full: dropping pick");
                }
            }
        });

        socket.on_disconnect(|socket: SocketRef| async move {
            info!("bus client disconnected: {}", socket.id);
        });
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .layer(socket_layer)
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("bus listening on {listen}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("bus server terminated: {e}");
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(cmd_rx, io));

    // Give the socket layer a moment to settle before the first emit
    tokio::time::sleep(Duration::from_millis(10)).await;

    Ok((
        BusHandle {
            tx: Some(cmd_tx),
            sync_every,
            sent_since_sync: 0,
            test_mode,
            sent_total: 0,
            failed_total: 0,
        },
        pick_rx,
    ))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_handle_counts_without_sending() {
        let mut bus = BusHandle::disabled();
        bus.emit("envelope", &json!({"x": 1})).await;
        bus.emit("envelope", &json!({"x": 2})).await;
        assert_eq!(bus.sent_total, 2);
        assert_eq!(bus.failed_total, 0);
        // Sync on a disabled handle is a no-op
        bus.sync().await;
    }

    #[tokio::test]
    async fn sync_token_round_trips_through_the_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_layer, io) = SocketIo::builder().build_layer();
        tokio::spawn(run_writer(rx, io));

        let mut bus = BusHandle {
            tx: Some(tx),
            sync_every: 2,
            sent_since_sync: 0,
            test_mode: false,
            sent_total: 0,
            failed_total: 0,
        };

        // The second emit crosses the sync threshold and must come back
        bus.emit("envelope", &json!({"n": 1})).await;
        bus.emit("envelope", &json!({"n": 2})).await;
        assert_eq!(bus.sent_total, 2);
        assert_eq!(bus.sent_since_sync, 0);
    }
}
