use std::{path::PathBuf, process};

use account_replica::{
    common::{FailurePolicy, ReplicaConfig, Result},
    console,
    network::{serve, Daemon, Node, TcpConnection},
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rand::Rng;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

const USAGE: &str = "Usage:
\t<address>:<port>     : the name or IP + port for the daemon
\t<accountName>        : the account name, used as the group name
\t<numberReplicas>     : the number of account replicas before starting
\t<filepath> (optional): file with commands for batch input";

#[tokio::main]
async fn main() {
    // Parse arguments
    let matches = Command::new("account-replica")
        .about("replicate a bank account over ordered group multicast")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .value_parser(value_parser!(Level)),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("daemon")
                .about("run a group communication daemon")
                .arg(Arg::new("listen").long("listen").default_value("127.0.0.1:4803")),
        )
        .subcommand(
            Command::new("replica")
                .about("run an account replica")
                .arg(Arg::new("daemon").required(true))
                .arg(Arg::new("account").required(true))
                .arg(
                    Arg::new("replicas")
                        .required(true)
                        .value_parser(value_parser!(usize)),
                )
                .arg(Arg::new("file").value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("name").long("name"))
                .arg(
                    Arg::new("requeue")
                        .long("requeue")
                        .action(ArgAction::SetTrue)
                        .help("keep transactions whose multicast failed for the next flush"),
                ),
        )
        .get_matches();

    // Create logger
    let level = matches.get_one::<Level>("log-level").copied().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match matches.subcommand() {
        Some(("daemon", args)) => run_daemon(args).await,
        Some(("replica", args)) => run_replica(args).await,
        _ => unreachable!("subcommand is required"),
    };
    if let Err(e) = result {
        error!(error = %e, "fatal");
        process::exit(1);
    }
}

async fn run_daemon(args: &ArgMatches) -> Result<()> {
    let listen = args.get_one::<String>("listen").map(String::as_str).unwrap_or("127.0.0.1:4803");
    let listener = TcpListener::bind(listen).await?;
    serve(listener, Daemon::spawn()).await
}

async fn run_replica(args: &ArgMatches) -> Result<()> {
    let minimum = args.get_one::<usize>("replicas").copied().unwrap_or(0);
    if minimum < 1 {
        println!("{USAGE}");
        return Ok(());
    }
    let (Some(daemon), Some(account)) = (
        args.get_one::<String>("daemon"),
        args.get_one::<String>("account"),
    ) else {
        println!("{USAGE}");
        return Ok(());
    };
    let name = match args.get_one::<String>("name") {
        Some(name) => name.clone(),
        None => format!("User{}", rand::thread_rng().gen_range(0..100)),
    };
    let input = args.get_one::<PathBuf>("file");

    let mut config = ReplicaConfig::new(account.as_str(), minimum);
    if args.get_flag("requeue") {
        config.failure_policy = FailurePolicy::Requeue;
    }
    info!(%name, %daemon, %account, minimum, "starting replica");

    let (connection, events) = TcpConnection::connect(daemon.as_str(), name).await?;
    let node = Node::start(connection, events, config).await?;
    node.await_quorum().await?;
    console::run(node, input.map(PathBuf::as_path)).await
}
