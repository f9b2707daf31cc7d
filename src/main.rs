use std::{
    error::Error,
    fs::File,
    io::{self, Write},
    path::PathBuf,
    process,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use url::Url;

use rangeplay::{
    config::Config,
    events::{Event, EventKind},
    player::Player,
    signal,
};

#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// `-q` and `-v` cannot be combined.
const VERBOSITY: &str = "verbosity";

/// Plays audio URLs into a file or standard output, fetching them in
/// bounded range requests.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to play, in order
    #[arg(required = true, value_hint = ValueHint::Url)]
    urls: Vec<Url>,

    /// Configuration file
    ///
    /// TOML file with fetch settings. Settings that are not in the file
    /// keep their defaults.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output file
    ///
    /// [default: standard output]
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Start the first URL this many seconds in
    #[arg(short, long, value_name = "SECONDS", default_value_t = 0)]
    seek: u64,

    /// Bytes to fetch per range request
    #[arg(long, value_name = "BYTES")]
    request_limit: Option<u64>,

    /// Retries of failed range requests before giving up
    #[arg(long, value_name = "COUNT")]
    max_retries: Option<u32>,

    /// Only log warnings and errors
    #[arg(short, long, group = VERBOSITY)]
    quiet: bool,

    /// Log more details
    ///
    /// Twice to also log every request and chunk.
    #[arg(short, long, action = clap::ArgAction::Count, group = VERBOSITY)]
    verbose: u8,
}

/// Sets up `env_logger`.
///
/// `-q` and `-v` override `RUST_LOG` for this crate, which in turn
/// overrides the `info` default.
///
/// # Panics
///
/// Panics when called twice.
fn init_logger(args: &Args) {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    let mut logger = env_logger::Builder::from_env(env);

    let level = match (args.quiet, args.verbose) {
        (true, _) => Some(LevelFilter::Warn),
        (false, 0) => None,
        (false, 1) => Some(LevelFilter::Debug),
        (false, _) => Some(LevelFilter::Trace),
    };

    // Dependencies keep the level from the environment.
    if let Some(level) = level {
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the configuration file, if any, and applies command line overrides.
fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(request_limit) = args.request_limit {
        config.request_limit = request_limit;
    }

    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }

    config.validate()?;
    debug!("{config:#?}");

    Ok(config)
}

/// Enqueues all URLs and copies every session's stream to the output, until
/// the queue runs out or a shutdown signal arrives.
///
/// # Errors
///
/// Returns error when the configuration or output is invalid, when none of
/// the URLs could be enqueued, or when writing the output fails.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;

    let output: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let output = Arc::new(Mutex::new(output));

    let player = Player::with_config(&config)?;

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    for kind in [
        EventKind::Play,
        EventKind::Enqueue,
        EventKind::Error,
        EventKind::Idle,
    ] {
        let events_tx = events_tx.clone();
        player.on(kind, move |event| {
            // The receiver is gone only when shutting down.
            let _ = events_tx.send(event.clone());
        });
    }
    drop(events_tx);

    let mut enqueued = 0;
    for (i, url) in args.urls.iter().enumerate() {
        let position = if i == 0 {
            Duration::from_secs(args.seek)
        } else {
            Duration::ZERO
        };

        match player.enqueue(url, position).await {
            Ok(_) => enqueued += 1,
            Err(e) => warn!("skipping {url}: {e}"),
        }
    }

    if enqueued == 0 {
        return Err("nothing to play".into());
    }

    let mut signals = signal::Handler::new()?;
    let mut copies = Vec::new();

    loop {
        tokio::select! {
            biased;

            signal = signals.recv() => {
                info!("received {signal}, shutting down gracefully");
                player.clear_queue();
                player.stop();
                break;
            }

            Some(event) = events.recv() => match event {
                Event::Play(information) => {
                    info!("playing {information}");

                    // Sessions end before the next one starts, so copies
                    // take turns on the output.
                    if let Some(mut stream) = player.take_stream() {
                        let output = Arc::clone(&output);
                        copies.push(tokio::task::spawn_blocking(move || {
                            let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
                            let copied = io::copy(&mut stream, &mut *output)?;
                            output.flush()?;
                            Ok::<_, io::Error>(copied)
                        }));
                    }
                }
                Event::Enqueue(information) => info!("queued {information}"),
                Event::Error(e) => error!("{e}"),
                Event::Idle => {
                    info!("queue finished");
                    break;
                }
            },
        }
    }

    for copy in copies {
        let copied = copy.await??;
        debug!("copied {copied} bytes");
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);
    debug!("{args:#?}");

    let cmd = command!();
    info!(
        "starting {}/{}; {BUILD_PROFILE}",
        cmd.get_name(),
        cmd.get_version().unwrap_or("unknown")
    );

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
