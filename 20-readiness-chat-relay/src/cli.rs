use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{event_loop::DEFAULT_EVENT_CAPACITY, server::WELCOME_TEXT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, rebroadcasting each client's text to all other clients.
    Server(ServerArgs),
    /// Connect to a relay, print what it sends and forward stdin lines to it.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Text written to every client as soon as it is accepted.
    #[arg(long, default_value = WELCOME_TEXT)]
    pub welcome: String,

    /// Maximum number of readiness events fetched per wait.
    #[arg(long, default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,
}
