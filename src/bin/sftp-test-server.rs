#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Run an SFTP test server until Ctrl-C

use clap::{CommandFactory, Parser};
use ftp_test_fixtures::{Error, SftpConfig, SftpTestServer};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sftp-test-server")]
#[command(about = "Embedded SFTP/SCP server for manual testing")]
#[command(disable_help_flag = true)]
struct Args {
    /// Host or address to bind
    #[arg(short = 'h', long, default_value = SftpConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short = 'p', long, default_value_t = SftpConfig::DEFAULT_PORT)]
    port: u16,

    /// The only user allowed to log in
    #[arg(short = 'u', long, default_value = SftpConfig::DEFAULT_USER)]
    user: String,

    /// Print the server details as JSON once it is listening
    #[arg(long)]
    json: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp => e.exit(),
        Err(e) => {
            error!("Invalid arguments: {}", e);
            eprintln!("{e}");
            Args::command().print_help()?;
            return Err(Error::config_with("Invalid command line arguments", e).into());
        }
    };

    let mut server = SftpTestServer::new(args.host, args.port, args.user)?;
    server.start_server().await?;

    let info = server.info();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "{} listening on {}:{} for user {} serving {}",
            info.version,
            info.host,
            info.port,
            info.username,
            info.root_directory.display()
        );
    }

    tokio::signal::ctrl_c().await?;
    server.stop_server().await?;
    Ok(())
}
