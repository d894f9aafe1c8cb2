use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use readiness_chat_relay::{
    cli::{Cli, Command},
    client,
    server::RelayServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = RelayServer::bind(args.listen, args.welcome, args.event_capacity)?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run() {
                error!("relay stopped: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args)?,
    }

    Ok(())
}
