#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch causes jemalloc to evaluate all decay windows
    // and release dirty pages back to the OS via its background purge logic.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced — dirty pages scheduled for release");
}

mod bybit_api;
mod config;
mod controller;
mod error;
mod indicators;
mod persistence;
mod strategy;
mod symbol_state;
mod types;
mod websocket_handler;

use bybit_api::BybitClient;
use config::Config;
use controller::{SystemClock, TradingController};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use websocket_handler::{reconnect_with_backoff, MarketDataStream};

const INTERVALS: &[&str] = &["60", "240"];
const STATUS_LOG_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cfg = Config::from_env()?;
    log::info!(
        "starting for {} symbols, position_size={} leverage={}x",
        cfg.symbols.len(),
        cfg.position_size_usdt,
        cfg.leverage
    );

    let exchange = Arc::new(BybitClient::new(&cfg));
    let (stream, mut events_rx) = MarketDataStream::new(cfg.ws_url(), &cfg.symbols, INTERVALS);
    let stream = Arc::new(stream);

    let data_dir = std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    std::fs::create_dir_all(&data_dir)?;

    let controller = Arc::new(TradingController::new(
        cfg.clone(),
        exchange,
        stream.clone(),
        &data_dir,
        Arc::new(SystemClock),
    ));

    controller.start().await?;

    let ws_stream = stream.clone();
    tokio::spawn(async move {
        if let Err(e) = reconnect_with_backoff(&ws_stream).await {
            log::error!("market data stream failed permanently: {e}");
        }
    });

    let periodic_controller = controller.clone();
    tokio::spawn(async move {
        periodic_controller.run_periodic_loop().await;
    });

    let status_controller = controller.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(STATUS_LOG_INTERVAL_SECS)).await;
            for s in status_controller.status_snapshot().await {
                if let Some(side) = s.side {
                    log::info!(
                        "[{}] {:?} size={:.4} entry={:?} upnl={:?} ({:?}%)",
                        s.symbol, side, s.size, s.entry_price, s.unrealized_pnl, s.unrealized_pnl_percent
                    );
                }
            }
            #[cfg(feature = "jemalloc")]
            jemalloc_purge();
        }
    });

    while let Some(event) = events_rx.recv().await {
        controller.handle_event(event).await;
    }

    Ok(())
}
