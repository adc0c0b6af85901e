use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use lan_chat::{
    ChatServer, ServerConfig,
    cli::{Cli, Command},
    client,
    server::lan_addrs,
    sink::{EventSink, Fanout, FileSink, TracingSink},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args.into()).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    let file_sink = match &config.log_dir {
        Some(dir) => Some(Arc::new(FileSink::open(dir).await.with_context(|| {
            format!("failed to open log directory {}", dir.display())
        })?)),
        None => None,
    };

    let mut sink = Fanout::new().with(Arc::new(TracingSink));
    if let Some(file_sink) = &file_sink {
        sink = sink.with(Arc::clone(file_sink) as Arc<dyn EventSink>);
    }

    let server = ChatServer::bind(config, Arc::new(sink)).await?;
    info!("chat server listening on {}", server.local_addr());
    for addr in lan_addrs(server.local_addr()).await {
        info!("clients on the LAN can connect to {addr}");
    }
    server.run_until_ctrl_c().await;

    if let Some(file_sink) = file_sink {
        file_sink.flush().await;
    }
    Ok(())
}
