use crate::backend::Backends;
use crate::config::{AppConfig, app_name, app_version};
use crate::pipeline::bus::ControlEvent;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::{self, ExitCode};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::LevelFilter;

pub mod app;
pub mod backend;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod h264;
pub mod pipeline;
pub mod publish;
pub mod stages;
#[cfg(test)]
mod testing;

/// Exit status for failures before the pipeline is running
const STARTUP_FAILURE: u8 = 1;

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Address of the vehicle streaming H.264."),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port of the vehicle video stream.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("rtsp-port")
                .long("rtsp-port")
                .value_name("PORT")
                .help("Port the RTSP server listens on.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("mount")
                .long("mount")
                .value_name("PATH")
                .help("RTSP mount path of the annotated stream."),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("FRAMES")
                .help("Frames per inference batch.")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("batch-timeout")
                .long("batch-timeout")
                .value_name("MICROSECONDS")
                .help("Longest a partial batch may wait.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log at debug level.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dump-caps")
                .long("dump-caps")
                .help("Print every stage's caps and the negotiated link formats.")
                .action(ArgAction::SetTrue),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.source.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.source.port = *port;
    }
    if let Some(port) = matches.get_one::<u16>("rtsp-port") {
        config.publish.port = *port;
    }
    if let Some(mount) = matches.get_one::<String>("mount") {
        config.publish.mount = mount.clone();
    }
    if let Some(size) = matches.get_one::<u32>("batch-size") {
        config.muxer.batch_size = *size;
    }
    if let Some(timeout) = matches.get_one::<u64>("batch-timeout") {
        config.muxer.batch_timeout_us = *timeout;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();

    let level = if matches.get_flag("verbose") {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(STARTUP_FAILURE);
        }
    };

    let backends = Backends::builtin();

    if matches.get_flag("dump-caps") {
        match app::assemble(&config, &backends) {
            Ok(assembly) => print!("{}", assembly.graph.describe_caps()),
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(STARTUP_FAILURE);
            }
        }
    }

    let launch = match app::launch(&config, &backends).await {
        Ok(launch) => launch,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(STARTUP_FAILURE);
        }
    };

    // first SIGINT stops the pipeline, a second one kills the process
    let bus = launch.bus.clone();
    let interrupted = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        bus.post(ControlEvent::Interrupted);
    }) {
        warn!("Error setting Ctrl-C handler: {}", e);
    }

    let reason = launch.controller.run().await;
    info!(
        "Returned, stopping playback ({}, {} annotated frames)",
        reason,
        launch.counter.get()
    );
    ExitCode::from(reason.exit_code())
}
