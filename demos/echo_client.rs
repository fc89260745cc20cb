use std::{net::SocketAddr, sync::Arc, time::Duration};

use backflow::{ConnectionBridge, FlowError, ReconnectEngine, ReconnectPolicy, StreamTransport, TcpConnector};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Args {
        addr,
        messages,
        rounds,
        interval_ms,
    } = Args::parse();

    // Every round ends with the server closing the connection, which counts as an attempt
    let policy = ReconnectPolicy::builder()
        .interval(Duration::from_millis(interval_ms))
        .multiplier(2.0)
        .max_interval(Duration::from_secs(30))
        .max_attempts(rounds)
        .build();

    let handler = move |connection: Arc<ConnectionBridge<StreamTransport>>| round(connection, messages);
    let handle = ReconnectEngine::new(addr, policy).start(TcpConnector::new(), handler);

    match handle.join().await {
        Ok(()) => tracing::info!("Done"),
        Err(e) => tracing::error!(error = %e, "Stopped"),
    }
}

/// Sends `messages` lines, then reads the echo until the server hangs up.
async fn round(connection: Arc<ConnectionBridge<StreamTransport>>, messages: usize) -> Result<(), FlowError> {
    let mut rx = backflow::inbound(connection.inbound(), 32)?;
    let (mut tx, outgoing) = backflow::outbound::<Vec<u8>>(32);
    let written = connection.send(&outgoing)?;

    let sending = async {
        for i in 0..messages {
            tx.send(format!("message {i}\n").into_bytes()).await?;
        }
        tx.close();
        written.await?;
        // Lets the server flush its last partial window
        connection.transport().shutdown_write();
        Ok::<_, FlowError>(())
    };

    let receiving = async {
        let mut bytes = 0;
        while let Some(chunk) = rx.recv().await? {
            bytes += chunk.len();
        }
        Ok::<_, FlowError>(bytes)
    };

    let (sent, received) = tokio::join!(sending, receiving);
    sent?;
    let bytes = received?;
    tracing::info!(messages, bytes, uptime = ?connection.uptime(), "Round finished");
    Ok(())
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: SocketAddr,
    /// Lines sent per connection.
    #[arg(short, long, default_value_t = 1_000)]
    messages: usize,
    /// Connections made before giving up.
    #[arg(short, long, default_value_t = 3)]
    rounds: u32,
    /// Base reconnect delay in milliseconds.
    #[arg(short, long, default_value_t = 500)]
    interval_ms: u64,
}
