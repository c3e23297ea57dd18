//! CLI entrypoint. Thin by design: argument parsing and exit-code mapping
//! live here, everything else is `freqrelay::daemon`/`freqrelay::rendezvous`.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use freqrelay::config::{Policy, RuntimeConfig};
use freqrelay::daemon::Daemon;
use freqrelay::identity::NodeIdentity;
use freqrelay::lock::{InstanceLock, LockError};
use freqrelay::rendezvous::file_backend::FileRendezvous;
use freqrelay::rendezvous::http_backend::HttpRendezvousClient;
use freqrelay::rendezvous::{self, Rendezvous, RendezvousError, WormholeCode};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(300);

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    exit(1);
}

fn usage() -> ! {
    eprintln!(
        "Usage: freqrelay [--share | --connect <code> | --rendezvous-server --port <N> | --list-peers | --version]"
    );
    exit(1);
}

fn main() {
    let mut args = env::args().skip(1).peekable();
    let Some(first) = args.peek().cloned() else {
        return run_blocking(cmd_watch());
    };

    match first.as_str() {
        "--version" => {
            println!("freqrelay {VERSION}");
        }
        "--share" => run_blocking(cmd_share()),
        "--connect" => {
            args.next();
            let code = args.next().unwrap_or_else(|| fatal("--connect requires a code argument"));
            run_blocking(cmd_connect(code));
        }
        "--rendezvous-server" => {
            args.next();
            let mut port: Option<u16> = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--port" => {
                        let value = args.next().unwrap_or_else(|| fatal("--port requires a value"));
                        port = Some(value.parse().unwrap_or_else(|_| fatal("--port must be a number")));
                    }
                    other => fatal(&format!("unknown argument: {other}")),
                }
            }
            let port = port.unwrap_or_else(|| fatal("--rendezvous-server requires --port <N>"));
            run_blocking(cmd_rendezvous_server(port));
        }
        "--list-peers" => run_blocking(cmd_list_peers()),
        _ => usage(),
    }
}

fn run_blocking(future: impl std::future::Future<Output = ()>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("could not start async runtime: {err}")));
    runtime.block_on(future);
}

async fn cmd_watch() {
    let mut config = RuntimeConfig::from_env();
    let policy = Policy::load_or_create(&config.policy_path)
        .unwrap_or_else(|err| fatal(&format!("could not load policy: {err}")));

    if policy.enable_aead && config.aead_pass.is_none() && config.aead_pass_file.is_none() {
        let passphrase = rpassword::prompt_password("AEAD passphrase: ")
            .unwrap_or_else(|err| fatal(&format!("could not read passphrase: {err}")));
        config.aead_pass = Some(passphrase);
    }

    let lock = match InstanceLock::acquire(&config.lock_path) {
        Ok(lock) => lock,
        Err(LockError::AlreadyHeld) => {
            println!("freqrelay is already running (lock held at {})", config.lock_path.display());
            exit(0);
        }
        Err(err) => fatal(&format!("could not acquire instance lock: {err}")),
    };

    let daemon = Daemon::bootstrap(config)
        .await
        .unwrap_or_else(|err| fatal(&format!("startup failed: {err}")));

    if let Err(err) = daemon.run().await {
        eprintln!("QSYS|mod=DAEMON|evt=RUN_ERROR|err={err}");
    }

    drop(lock);
}

async fn cmd_share() {
    let config = RuntimeConfig::from_env();
    let identity = NodeIdentity::load_or_create(&config.identity_file)
        .unwrap_or_else(|err| fatal(&format!("could not load identity: {err}")));
    let rendezvous = build_rendezvous(&config);

    let code = rendezvous::generate_code();
    let now = freqrelay::osutil::now_secs();
    let entry = WormholeCode {
        code: code.clone(),
        node_id: identity.node_id.clone(),
        hostname: identity.hostname.clone(),
        public_key: identity.public_key.clone(),
        socket_addr: local_socket_addr(&config),
        created_at: now,
        expires_at: now + config.code_expiry_sec,
    };
    if let Err(err) = rendezvous.publish(entry).await {
        fatal(&format!("could not publish wormhole code: {err}"));
    }

    println!("Share this code with the other device: {code}");
    println!("Waiting up to {}s for it to be accepted...", ACCEPT_TIMEOUT.as_secs());

    let accept_code = format!("{code}-accept");
    let deadline = tokio::time::Instant::now() + ACCEPT_TIMEOUT;
    loop {
        match rendezvous.lookup(&accept_code).await {
            Ok(acceptance) => {
                let mut policy = Policy::load_or_create(&config.policy_path)
                    .unwrap_or_else(|err| fatal(&format!("could not load policy: {err}")));
                policy.trust(&acceptance.node_id, &acceptance.hostname);
                if let Err(err) = policy.persist(&config.policy_path) {
                    fatal(&format!("could not persist policy: {err}"));
                }
                let _ = rendezvous.remove(&code).await;
                let _ = rendezvous.remove(&accept_code).await;
                println!("Paired with {} ({})", acceptance.node_id, acceptance.hostname);
                return;
            }
            Err(RendezvousError::NotFound) => {}
            Err(RendezvousError::Expired) => {
                eprintln!("pairing code expired before it was accepted");
                let _ = rendezvous.remove(&code).await;
                exit(1);
            }
            Err(err) => fatal(&format!("rendezvous lookup failed: {err}")),
        }

        if tokio::time::Instant::now() >= deadline {
            eprintln!("pairing code expired before it was accepted");
            let _ = rendezvous.remove(&code).await;
            exit(1);
        }
        tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
    }
}

async fn cmd_connect(code: String) {
    let config = RuntimeConfig::from_env();
    let identity = NodeIdentity::load_or_create(&config.identity_file)
        .unwrap_or_else(|err| fatal(&format!("could not load identity: {err}")));
    let rendezvous = build_rendezvous(&config);

    let published = match rendezvous.lookup(&code).await {
        Ok(entry) => entry,
        Err(RendezvousError::NotFound) => {
            eprintln!("pairing code not found: {code}");
            exit(1);
        }
        Err(RendezvousError::Expired) => {
            eprintln!("pairing code expired: {code}");
            let _ = rendezvous.remove(&code).await;
            exit(1);
        }
        Err(err) => fatal(&format!("rendezvous lookup failed: {err}")),
    };

    let mut policy = Policy::load_or_create(&config.policy_path)
        .unwrap_or_else(|err| fatal(&format!("could not load policy: {err}")));
    policy.trust(&published.node_id, &published.hostname);
    if let Err(err) = policy.persist(&config.policy_path) {
        fatal(&format!("could not persist policy: {err}"));
    }

    let now = freqrelay::osutil::now_secs();
    let acceptance = WormholeCode {
        code: format!("{code}-accept"),
        node_id: identity.node_id.clone(),
        hostname: identity.hostname.clone(),
        public_key: identity.public_key.clone(),
        socket_addr: local_socket_addr(&config),
        created_at: now,
        expires_at: now + config.code_expiry_sec,
    };
    if let Err(err) = rendezvous.publish(acceptance).await {
        fatal(&format!("could not publish acceptance: {err}"));
    }
    let _ = rendezvous.remove(&code).await;

    println!("Paired with {} ({})", published.node_id, published.hostname);
}

async fn cmd_rendezvous_server(port: u16) {
    let config = RuntimeConfig::from_env();
    let running = Arc::new(AtomicBool::new(true));
    if let Err(err) = rendezvous::http_backend::run_server(&config.socket_host, port, running).await {
        fatal(&format!("rendezvous server failed: {err}"));
    }
}

async fn cmd_list_peers() {
    let config = RuntimeConfig::from_env();
    let policy = Policy::load_or_create(&config.policy_path)
        .unwrap_or_else(|err| fatal(&format!("could not load policy: {err}")));

    if policy.trusted_nodes.is_empty() {
        println!("No trusted nodes in {}", config.policy_path.display());
        return;
    }
    let mut trusted: Vec<&String> = policy.trusted_nodes.iter().collect();
    trusted.sort();
    for node in trusted {
        println!("{node}");
    }
}

fn build_rendezvous(config: &RuntimeConfig) -> Arc<dyn Rendezvous> {
    if let Some(url) = &config.rendezvous_url {
        return Arc::new(HttpRendezvousClient::new(url.clone()));
    }
    let path = config
        .rendezvous_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("rendezvous.json"));
    Arc::new(FileRendezvous::new(path))
}

fn local_socket_addr(config: &RuntimeConfig) -> Option<std::net::SocketAddr> {
    if config.socket_port == 0 {
        return None;
    }
    let ip = freqrelay::osutil::local_ip()?;
    Some(std::net::SocketAddr::new(std::net::IpAddr::V4(ip), config.socket_port))
}
