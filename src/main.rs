use authmilter::handlers;
use authmilter::{control, Config};
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use std::process;

fn main() {
    let matches = Command::new("authmilter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email authentication gateway: milter/SMTP daemon running SPF, DKIM, DMARC and related checks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/authmilter.yaml"),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("Master pid file path")
                .default_value("/var/run/authmilter.pid"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("foreground")
                .long("foreground")
                .help("Stay in the foreground instead of daemonizing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration file and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file")
                .action(ArgAction::Set),
        )
        .subcommand(Command::new("start").about("Start the master daemon"))
        .subcommand(Command::new("stop").about("Stop a running master"))
        .subcommand(Command::new("restart").about("Restart the master daemon"))
        .subcommand(Command::new("status").about("Report whether a master is running"))
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap().clone();
    let pid_file = matches.get_one::<String>("pid-file").unwrap().clone();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        let config = Config::default();
        match config.to_file(path) {
            Ok(()) => {
                println!("Default configuration written to: {path}");
                return;
            }
            Err(err) => {
                eprintln!("Error writing configuration file: {err:#}");
                process::exit(1);
            }
        }
    }

    let load = || -> Config {
        match Config::from_file(&config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading configuration: {err:#}");
                process::exit(1);
            }
        }
    };

    if matches.get_flag("test-config") {
        let config = load();
        if let Err(err) = handlers::check_load_list(&config) {
            eprintln!("Configuration error: {err:#}");
            process::exit(1);
        }
        println!("Configuration file is valid!");
        println!("Listener: {}", config.connection);
        println!("Handlers: {}", config.load_handlers.join(", "));
        return;
    }

    let foreground = matches.get_flag("foreground");
    let code = match matches.subcommand_name() {
        Some("start") | None => control::start(&config_path, &pid_file, load(), foreground),
        Some("stop") => control::stop(&pid_file),
        Some("restart") => control::restart(&config_path, &pid_file, load(), foreground),
        Some("status") => control::status(&pid_file),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            2
        }
    };
    process::exit(code);
}
