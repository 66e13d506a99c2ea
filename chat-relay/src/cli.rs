use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, relaying every line to all other participants.
    Server(ServerArgs),
    /// Connect to a chat server and join under a display name.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    pub port: u16,

    /// Interface address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the chat server.
    pub host: String,

    /// Port the chat server listens on.
    pub port: u16,

    /// Display name announced to the other participants.
    pub name: String,
}
