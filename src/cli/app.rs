use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use jsdbg_adapter::DebugSession;
use jsdbg_dap::DapConnection;

use super::env::CliArgs;
use super::runtime::init_logging;

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();
    init_logging(&cli.log_level)?;
    info!("starting jsdbg v{}", env!("CARGO_PKG_VERSION"));

    match cli.port {
        Some(port) => serve_tcp(&cli.host, port).await,
        None => serve_stdio().await,
    }
}

async fn serve_stdio() -> Result<()> {
    let dap = DapConnection::new(tokio::io::stdout());
    let session = DebugSession::new(Arc::clone(&dap));
    dap.serve(tokio::io::stdin()).await?;
    // The client hung up; take the debuggee down with us.
    session.finish(true).await;
    Ok(())
}

/// One client at a time; each connection gets a fresh session.
async fn serve_tcp(host: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "listening for DAP clients");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        let (read, write) = stream.into_split();
        let dap = DapConnection::new(write);
        let session = DebugSession::new(Arc::clone(&dap));
        if let Err(err) = dap.serve(read).await {
            info!(%err, "client connection ended");
        }
        session.finish(true).await;
        info!(%peer, "client disconnected");
    }
}
