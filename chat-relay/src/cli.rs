use clap::{Args, Parser, Subcommand};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_NICKNAME: &str = "user";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

// Either no positional values or both of them.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host name or address to listen on.
    #[arg(default_value = DEFAULT_HOST, requires = "port")]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

// Either no positional values or all three of them.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the relay.
    #[arg(default_value = DEFAULT_HOST, requires = "port")]
    pub host: String,

    /// Port of the relay.
    #[arg(default_value_t = DEFAULT_PORT, requires = "nickname")]
    pub port: u16,

    /// Nickname sent as the first line after connecting.
    #[arg(default_value = DEFAULT_NICKNAME)]
    pub nickname: String,
}
