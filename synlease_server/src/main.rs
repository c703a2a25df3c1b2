//! Synlease server node: a durable acceptor plus a lease service.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use synlease::{
    logger_init, me_init, pf_error, pf_info, AcceptorConfig, AcceptorEndpoint,
    AcceptorListener, AcceptorNode, ApiListener, LeaseService, LocalNode,
    ProviderConfig, RemoteAcceptor, SynleaseError, SynodConfiguration,
    SystemClock,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Acceptor port, reached by the lease providers of all synod nodes.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 53700)]
    acceptor_port: u16,

    /// Client-facing lease API port.
    /// This port must be available at process launch.
    #[arg(short = 'p', long, default_value_t = 53800)]
    api_port: u16,

    /// Acceptor addresses of all synod members, this node included.
    #[arg(short, long, value_delimiter = ',', required = true)]
    synod: Vec<SocketAddr>,

    /// Node identity used as proposer and lease owner; random if absent.
    #[arg(short, long)]
    identity: Option<String>,

    /// Lease provider configuration TOML string.
    #[arg(long)]
    provider_config: Option<String>,

    /// Acceptor configuration TOML string.
    #[arg(long)]
    acceptor_config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SynleaseError)` on any error.
    fn sanitize(&self) -> Result<(), SynleaseError> {
        if self.acceptor_port <= 1024 {
            Err(SynleaseError::msg(format!(
                "invalid acceptor_port {}",
                self.acceptor_port
            )))
        } else if self.api_port <= 1024 {
            Err(SynleaseError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.acceptor_port == self.api_port {
            Err(SynleaseError::msg(format!(
                "acceptor_port == api_port {}",
                self.api_port
            )))
        } else if self.synod.is_empty() {
            Err(SynleaseError::msg("synod membership is empty"))
        } else if matches!(&self.identity, Some(id) if id.is_empty()) {
            Err(SynleaseError::msg("identity is empty"))
        } else if self.threads < 2 {
            Err(SynleaseError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of Synlease server node.
fn server_main() -> Result<(), SynleaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let acceptor_addr: SocketAddr =
        SocketAddr::from((args.bind_ip, args.acceptor_port));
    let api_addr: SocketAddr = SocketAddr::from((args.bind_ip, args.api_port));

    let provider_config =
        ProviderConfig::from_toml(args.provider_config.as_deref())?;
    let acceptor_config =
        AcceptorConfig::from_toml(args.acceptor_config.as_deref())?;

    let uri = format!("tcp://{}", api_addr);
    let local_node = match &args.identity {
        Some(id) => LocalNode::new(id.clone(), uri),
        None => LocalNode::random(uri),
    };
    me_init(local_node.to_string());
    let synod_config = SynodConfiguration::new(
        local_node,
        args.synod.iter().map(|addr| addr.to_string()).collect(),
    )?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-synlease")
            .build()?;

        // enter tokio runtime, set up the acceptor and the lease service, and
        // serve until terminated
        runtime.block_on(async move {
            let acceptor = AcceptorNode::new_and_setup(
                format!("acceptor@{}", acceptor_addr),
                acceptor_config,
            )
            .await?;
            let _acceptor_listener =
                AcceptorListener::new_and_setup(acceptor_addr, acceptor.handle())
                    .await?;

            let round_timeout = provider_config.round_timeout();
            // endpoints in validated synod member order
            let acceptors = synod_config
                .synod
                .members()
                .iter()
                .map(|member| {
                    let addr: SocketAddr = member.parse()?;
                    let remote: Arc<dyn AcceptorEndpoint> =
                        Arc::new(RemoteAcceptor::new(addr, round_timeout));
                    Ok::<_, SynleaseError>(remote)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let service = Arc::new(LeaseService::new(
                synod_config.local_node.clone(),
                acceptors,
                provider_config,
                Arc::new(SystemClock),
            )?);
            let _api_listener =
                ApiListener::new_and_setup(api_addr, service).await?;
            pf_info!(
                "node up, synod of {} with quorum {}",
                synod_config.synod.population(),
                synod_config.synod.quorum()
            );

            while !*rx_term.borrow() {
                if rx_term.changed().await.is_err() {
                    break;
                }
            }
            pf_info!("terminating");

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), SynleaseError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Synlease server node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
