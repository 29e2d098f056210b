use opal_transport::{Connection, Endpoint};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, trace, warn};

pub mod config;

const STATS_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let start_time = Instant::now();
    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let bind_addr = config
        .network
        .address
        .parse()
        .expect("address already validated");
    let endpoint = match Endpoint::bind(bind_addr, config.flow_config()).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Failed to bind {}: {}", config.network.address, e);
            std::process::exit(1);
        }
    };
    endpoint.listen();
    info!(
        "opald listening on {} ({}), started in {:.2}s",
        config.network.address,
        if config.transport.media {
            "media"
        } else {
            "stream"
        },
        start_time.elapsed().as_secs_f64()
    );

    loop {
        match endpoint.accept().await {
            Ok(conn) => {
                info!("flow {} accepted from {}", conn.id(), conn.peer());
                let media = config.transport.media;
                tokio::spawn(async move {
                    drain_flow(conn, media).await;
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        }
    }
}

/// Consumes one inbound flow until end-of-stream, logging throughput and
/// reliability counters along the way.
async fn drain_flow(conn: Connection, media: bool) {
    let id = conn.id();
    let started = Instant::now();
    let mut total: u64 = 0;
    let mut last_report = Instant::now();
    let mut buf = vec![0u8; 256 * 1024];

    loop {
        let n = if media {
            match conn.recv_msg().await {
                Ok(Some(msg)) => {
                    if let Some(meta) = msg.frame {
                        trace!(
                            "flow {}: frame {} chunk {}/{}",
                            id, meta.frame_id, meta.chunk_id, meta.total_chunks
                        );
                    }
                    msg.data.len()
                }
                Ok(None) => 0,
                Err(e) => {
                    warn!("flow {} failed: {}", id, e);
                    return;
                }
            }
        } else {
            match conn.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("flow {} failed: {}", id, e);
                    return;
                }
            }
        };
        if n == 0 {
            break;
        }
        total += n as u64;

        if last_report.elapsed() >= STATS_PERIOD {
            last_report = Instant::now();
            let stats = conn.stats().await;
            info!(
                "flow {}: {} MB in, rtt {}us, {} retransmits, {} naks sent",
                id,
                total / (1024 * 1024),
                stats.rtt_us,
                stats.retransmits,
                stats.naks_sent
            );
        }
    }

    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    info!(
        "flow {} finished: {} bytes in {:.2}s ({:.2} MB/s)",
        id,
        total,
        elapsed,
        total as f64 / elapsed / (1024.0 * 1024.0)
    );
    let _ = conn.close().await;
}
