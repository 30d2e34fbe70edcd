#[macro_use]
extern crate log;

use std::error::Error;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::{App, Arg, ArgMatches};
use log::{Level, LevelFilter, Metadata, Record};

use covstream_collector::{on_ctrlc, serve, CollectorConfig};

pub struct SimpleLogger;

impl log::Log for SimpleLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    #[inline]
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{}: {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            );
        }
    }

    #[inline]
    fn flush(&self) {}
}

fn seconds(matches: &ArgMatches, name: &str) -> Result<u64, Box<dyn Error>> {
    let value = matches.value_of(name).unwrap_or("0");
    value
        .parse()
        .map_err(|_| format!("'{}' is not a valid number of seconds for --{}", value, name).into())
}

fn run(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let dump_interval = seconds(matches, "dump-interval")?;
    let heartbeat_timeout = seconds(matches, "heartbeat-timeout")?;
    let config = CollectorConfig {
        output: PathBuf::from(matches.value_of("output").unwrap_or("covstream-data")),
        dump_interval: if dump_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(dump_interval))
        },
        reset: matches.is_present("reset"),
        pull: !matches.is_present("no-pull"),
        heartbeat_timeout: Duration::from_secs(heartbeat_timeout.max(1)),
    };

    let listen = matches.value_of("listen").unwrap_or("0.0.0.0:6300");
    let listener = TcpListener::bind(listen)?;
    let sigint = on_ctrlc()?;

    info!("Storing everything under {:?}", config.output);
    serve(listener, Arc::new(config), sigint)?;
    info!("Finished!");
    Ok(())
}

fn main() {
    log::set_logger(&SimpleLogger).unwrap();
    log::set_max_level(LevelFilter::Info);

    let app = App::new("covstream-collector")
        .about("Collects coverage data and classes from covstream agents")
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .default_value("0.0.0.0:6300")
                .help("The address to accept agents on"),
        )
        .arg(
            Arg::with_name("output")
                .long("output")
                .short("o")
                .takes_value(true)
                .default_value("covstream-data")
                .help("The directory to store classes and execution data in"),
        )
        .arg(
            Arg::with_name("dump-interval")
                .long("dump-interval")
                .takes_value(true)
                .default_value("60")
                .help("Seconds between dump requests; 0 disables them"),
        )
        .arg(
            Arg::with_name("heartbeat-timeout")
                .long("heartbeat-timeout")
                .takes_value(true)
                .default_value("180")
                .help("Seconds of silence after which an agent is dropped"),
        )
        .arg(
            Arg::with_name("reset")
                .long("reset")
                .help("Reset the execution data after every dump"),
        )
        .arg(
            Arg::with_name("no-pull")
                .long("no-pull")
                .help("Don't ask the agents for their classes"),
        );

    let matches = app.get_matches();
    if let Err(error) = run(&matches) {
        error!("{}", error);
        process::exit(1);
    }
}
