use clap::Parser;

/// Command-line surface of the `jsdbg` binary.
///
/// With no arguments the adapter speaks DAP on stdio, which is how editors
/// usually spawn it. `--port` turns it into a TCP server instead.
#[derive(Debug, Parser)]
#[command(name = "jsdbg", version, about = "JavaScript debug adapter (DAP ↔ CDP)")]
pub struct CliArgs {
    /// Serve DAP over TCP on this port instead of stdio.
    #[arg(long)]
    pub port: Option<u16>,

    /// Interface to bind when serving over TCP.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
