//! Synlease closed-loop client: bootstraps a range of instances, then keeps
//! asking for leases on random instances on behalf of random requestors.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::SystemTime;

use clap::Parser;
use rand::Rng;
use synlease::{
    logger_init, me_init, pf_error, pf_info, pf_warn, LeaseClient,
    LeaseRequestMessage, Node, SynleaseError,
};
use tokio::runtime::Builder;
use tokio::time::{self, Duration};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Lease service address.
    #[arg(short, long, default_value = "127.0.0.1:53800")]
    server: SocketAddr,

    /// Number of instances to create and request leases on.
    #[arg(short, long, default_value_t = 1000)]
    instances: usize,

    /// Requested lease time span in millisecs.
    #[arg(long, default_value_t = 5000)]
    span_ms: u64,

    /// Timeout of a single request in millisecs.
    #[arg(short, long, default_value_t = 500)]
    timeout_ms: u64,

    /// Number of lease requests to issue; 0 means unlimited.
    #[arg(short, long, default_value_t = 0)]
    requests: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SynleaseError)` on any error.
    fn sanitize(&self) -> Result<(), SynleaseError> {
        if self.instances == 0 {
            Err(SynleaseError::msg("number of instances is zero"))
        } else if self.span_ms == 0 {
            Err(SynleaseError::msg("lease span is zero"))
        } else if self.timeout_ms == 0 {
            Err(SynleaseError::msg("request timeout is zero"))
        } else if self.threads < 1 {
            Err(SynleaseError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Creates all instances and waits until the slowest one is active.
async fn create_instances(
    client: &mut LeaseClient,
    instances: &[String],
) -> Result<(), SynleaseError> {
    let mut activation_wait = Duration::ZERO;
    for instance in instances {
        let wait = client
            .create_instance(instance, Duration::from_secs(5))
            .await?;
        activation_wait = activation_wait.max(wait);
    }

    pf_info!(
        "waiting {:?} before lease provider instances are active...",
        activation_wait
    );
    if !activation_wait.is_zero() {
        time::sleep(activation_wait).await;
    }
    Ok(())
}

/// Closed loop of lease requests.
async fn request_loop(args: &CliArgs) -> Result<(), SynleaseError> {
    let mut client = LeaseClient::new_and_setup(args.server).await?;
    let instances: Vec<String> =
        (0..args.instances).map(|i| i.to_string()).collect();
    create_instances(&mut client, &instances).await?;

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut rng = rand::thread_rng();
    let mut issued = 0;

    while args.requests == 0 || issued < args.requests {
        issued += 1;
        let identity: [u8; 16] = rng.gen();
        let instance = instances[rng.gen_range(0..instances.len())].clone();
        let req = LeaseRequestMessage {
            instance,
            lease_time_span: Duration::from_millis(args.span_ms),
            requestor: Node {
                identity: identity.to_vec().into(),
                uri: "tcp://localhost".into(),
            },
        };

        match client.request_lease(req, timeout).await {
            Ok(resp) => {
                if let (true, Some(lease)) = (resp.lease_acquired, resp.lease)
                {
                    println!(
                        "{:?} Acquired: true Instance: {} Owner: {} \
                         OwnerIdentity: {} RequestorIdentity: {} \
                         ExpiresAt: {:?}",
                        SystemTime::now(),
                        lease.instance,
                        lease.owner.uri,
                        to_hex(&lease.owner.identity),
                        to_hex(&identity),
                        lease.expires_at
                    );
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
            Err(SynleaseError::Timeout(_)) => {
                println!("Call timed out after {:?}.", timeout);
            }
            Err(e) if e.is_retryable() => {
                // contention or a partitioned synod; back off a little
                pf_warn!("lease round aborted: {}", e);
                time::sleep(Duration::from_millis(rng.gen_range(10..50)))
                    .await;
            }
            Err(e @ SynleaseError::InvalidRequest(_)) => {
                // every later request would be refused the same way
                return Err(e);
            }
            Err(e) => {
                pf_warn!("lease request failed: {}", e);
            }
        }
    }

    Ok(())
}

/// Actual main function of Synlease client.
fn client_main() -> Result<(), SynleaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    me_init("client");

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(request_loop(&args))
}

/// Main function of Synlease client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
