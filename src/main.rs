use std::{error::Error, fs, path::PathBuf, process};

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn, Level};

use mudopts::{
    config::Config,
    protocols::telnet::{codes as tc, gmcp, mccp, mssp},
    TelOptError,
};

#[derive(Parser, Debug)]
#[clap(version, author = "Andrew Bastien <volundmush@gmail.com>", about = "Inspects MUD telnet option payloads.")]
pub struct Args {
    #[arg(short, long, help = "Logs at DEBUG instead of INFO")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encodes the configured MSSP record and shows what goes on the wire.
    Mssp {
        #[arg(short, long, value_name = "path", help = "Sets the file path to a .toml config")]
        config: PathBuf,
    },
    /// Renders a raw subnegotiation payload the way the option logs it.
    Render {
        #[arg(short, long, value_name = "gmcp|mssp|mccp2|mccp3")]
        option: String,

        #[arg(value_name = "path")]
        file: PathBuf,
    },
}

fn render(option: &str, payload: &[u8]) -> Result<String, TelOptError> {
    match tc::option_code(option) {
        Some(tc::GMCP) => gmcp::render_subnegotiation(payload),
        Some(tc::MSSP) => Ok(mssp::render_subnegotiation(payload)),
        Some(tc::MCCP2) | Some(tc::MCCP3) => Ok(mccp::render_subnegotiation().to_string()),
        _ => Err(TelOptError::UnknownOption(option.to_string())),
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command {
        Command::Mssp { config } => {
            info!("Loading {}...", config.display());
            let conf = Config::from_file(&config)?;
            if conf.usage(tc::MSSP).is_none() {
                warn!("MSSP is disabled in {}", config.display());
            }

            let encoded = conf.mssp.encode();
            println!("{}", mssp::render_subnegotiation(&encoded));
            println!("{} bytes", encoded.len());
        },
        Command::Render { option, file } => {
            let payload = fs::read(&file)?;
            debug!("Read {} bytes from {}", payload.len(), file.display());
            println!("{}", render(&option, &payload)?);
        },
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}
