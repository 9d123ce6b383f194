use clap::Parser;
use resproxy::config::Config;
use resproxy::{server, Error};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();
    let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;

    server::run(listener, config, tokio::signal::ctrl_c()).await
}
