use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zmqpull::{PullConfig, PullConsumer};

const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5555";

const HELP: &str = "\
Print the first frame of every message received on a ZeroMQ PULL socket

USAGE:
  zmqpull [OPTIONS] [ENDPOINT]

ARGS:
  ENDPOINT          Endpoint to connect to [default: tcp://127.0.0.1:5555]

OPTIONS:
  -c, --config FILE TOML file with settle_delay_ms, recv_delay_ms, recv_timeout_ms
  -h, --help        Print this help
";

struct Args {
    config: Option<PathBuf>,
    endpoint: String,
}

fn parse_args() -> Result<Option<Args>> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(None);
    }
    let config = pargs.opt_value_from_os_str(["-c", "--config"], |s| {
        Ok::<_, std::convert::Infallible>(PathBuf::from(s))
    })?;
    let endpoint = pargs
        .opt_free_from_str()?
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        return Err(anyhow!("Unexpected arguments: {remaining:?}"));
    }
    Ok(Some(Args { config, endpoint }))
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default()
            .add_directive("warn".parse().unwrap())
            .add_directive(
                format!("{}=debug", env!("CARGO_CRATE_NAME"))
                    .parse()
                    .unwrap(),
            )
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let config = match &args.config {
        Some(path) => PullConfig::from_file(path)?,
        None => PullConfig::default(),
    };
    debug!("Using {config:?}");

    let consumer = PullConsumer::connect(&args.endpoint, config)?;
    consumer.run(|message| {
        match message {
            Some(text) => println!("{text}"),
            None => debug!("No message received"),
        }
        true
    })
}
