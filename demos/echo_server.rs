use std::sync::Arc;

use backflow::{ConnectionBridge, FlowError, StreamTransport};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Args { addr, prefetch } = Args::parse();

    // Bind TCP listener
    let listener = TcpListener::bind(&addr).await.unwrap();
    tracing::info!(%addr, "Listening");

    let handler = Arc::new(echo);
    loop {
        let (stream, peer) = listener.accept().await.unwrap();
        let (stream_reader, stream_writer) = stream.into_split();
        tracing::info!(%peer, "Accepted connection");

        // The connection is closed once the echo sequence terminates
        let (connection, _task) = backflow::stream(stream_reader, stream_writer)
            .prefetch(prefetch)
            .half_close(true)
            .build();
        connection.serve(handler.clone());
    }
}

/// Writes back every chunk read, flushing once per window of `prefetch` chunks.
async fn echo(connection: Arc<ConnectionBridge<StreamTransport>>) -> Result<(), FlowError> {
    connection.send(connection.inbound())?.await?;
    tracing::info!(uptime = ?connection.uptime(), "Echo finished");
    Ok(())
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: String,
    /// Chunks buffered ahead of demand, clamped to [32, 128].
    #[arg(short, long, default_value_t = 64)]
    prefetch: usize,
}
