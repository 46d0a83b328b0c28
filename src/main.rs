//! hiproxy command line tool
//!
//! One binary for all three roles: `agent`, `server` and `broker`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use hiproxy::common::{init_logger, parse_socket_addr, ProxyError, Result};
use hiproxy::config::{ConfigLoader, ConfigValidator, ProxyConfig, TransportKind};
use hiproxy::proxy::{
    AcceptorContext, AcceptorSettings, Agent, AgentSettings, BrokerSettings, QuicAcceptor, QuicBroker, Shutdown,
    UnitHandler, WsBridge, WsListener, WsListenerSettings,
};
use hiproxy::tls::{client_crypto, create_tls_acceptor, create_tls_connector, server_crypto};
use hiproxy::transport::quic::QuicDialer;
use hiproxy::transport::websocket::WsDialer;
use hiproxy::transport::Dialer;
use hiproxy::{APP_NAME, VERSION};

/// hiproxy: SOCKS5 tunneling over QUIC and WebSocket
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[clap(short, long, global = true, env = "HIPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[clap(long, global = true)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the local SOCKS5 agent
    Agent(AgentArgs),
    /// Run the server-side acceptor
    Server(ServerArgs),
    /// Run the broker between agents and a server
    Broker(BrokerArgs),
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// SOCKS5 listen address
    #[clap(short, long)]
    listen: Option<String>,

    /// Transport (quic, websocket)
    #[clap(short, long)]
    transport: Option<String>,

    /// QUIC upstream, host:port
    #[clap(short, long)]
    url: Option<String>,

    /// WebSocket upstream, wss://host/go/ws
    #[clap(long)]
    ws_url: Option<String>,

    /// Identity sent in the auth request
    #[clap(long)]
    user: Option<String>,

    /// Extra CA certificate trusted for the upstream
    #[clap(long)]
    ca_cert: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// QUIC listen address
    #[clap(long)]
    quic_listen: Option<String>,

    /// WebSocket listen address (empty disables it)
    #[clap(long)]
    ws_listen: Option<String>,

    /// Serve plain WebSocket, for use behind a TLS-terminating proxy
    #[clap(long)]
    no_ws_tls: bool,

    /// Server certificate path
    #[clap(long)]
    cert: Option<PathBuf>,

    /// Server private key path
    #[clap(long)]
    key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BrokerArgs {
    /// Client-facing QUIC listen address
    #[clap(short, long)]
    listen: Option<String>,

    /// Client-facing WebSocket listen address (empty disables it)
    #[clap(long)]
    ws_listen: Option<String>,

    /// Serve plain WebSocket, for use behind a TLS-terminating proxy
    #[clap(long)]
    no_ws_tls: bool,

    /// Upstream QUIC server, host:port
    #[clap(short, long)]
    upstream: Option<String>,

    /// Broker certificate path
    #[clap(long)]
    cert: Option<PathBuf>,

    /// Broker private key path
    #[clap(long)]
    key: Option<PathBuf>,

    /// Extra CA certificate trusted for the upstream
    #[clap(long)]
    ca_cert: Option<PathBuf>,
}

impl AgentArgs {
    fn apply(self, config: &mut ProxyConfig) -> Result<()> {
        if let Some(listen) = self.listen {
            config.agent.listen = listen;
        }
        if let Some(transport) = self.transport {
            config.agent.transport = transport.parse::<TransportKind>()?;
        }
        if let Some(url) = self.url {
            config.agent.url = url;
        }
        if let Some(ws_url) = self.ws_url {
            config.agent.ws_url = ws_url;
        }
        if let Some(user) = self.user {
            config.agent.user = user;
        }
        if let Some(ca_cert) = self.ca_cert {
            config.agent.ca_cert = Some(ca_cert);
        }
        Ok(())
    }
}

impl ServerArgs {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.quic_listen {
            config.server.quic_listen = listen;
        }
        if let Some(listen) = self.ws_listen {
            config.server.ws_listen = listen;
        }
        if self.no_ws_tls {
            config.server.ws_tls = false;
        }
        if let Some(cert) = self.cert {
            config.server.cert = cert;
        }
        if let Some(key) = self.key {
            config.server.key = key;
        }
    }
}

impl BrokerArgs {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.broker.listen = listen;
        }
        if let Some(listen) = self.ws_listen {
            config.broker.ws_listen = listen;
        }
        if self.no_ws_tls {
            config.broker.ws_tls = false;
        }
        if let Some(upstream) = self.upstream {
            config.broker.upstream = upstream;
        }
        if let Some(cert) = self.cert {
            config.broker.cert = cert;
        }
        if let Some(key) = self.key {
            config.broker.key = key;
        }
        if let Some(ca_cert) = self.ca_cert {
            config.broker.ca_cert = Some(ca_cert);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match ProxyConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logger(cli.log_level.as_deref().unwrap_or("info"));
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logger(&config.log_level);

    info!("Starting {} v{}", APP_NAME, VERSION);

    let result = match cli.command {
        Command::Agent(args) => match args.apply(&mut config) {
            Ok(()) => run_agent(config).await,
            Err(e) => Err(e),
        },
        Command::Server(args) => {
            args.apply(&mut config);
            run_server(config).await
        }
        Command::Broker(args) => {
            args.apply(&mut config);
            run_broker(config).await
        }
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

fn log_warnings(config: &ProxyConfig) {
    for warning in config.check_warnings() {
        warn!("{}", warning);
    }
}

fn ws_settings(config: &ProxyConfig) -> WsListenerSettings {
    WsListenerSettings {
        handshake_timeout: config.timeouts.handshake(),
        max_sessions: config.limits.max_sessions,
        shutdown_grace: config.timeouts.shutdown_grace(),
    }
}

async fn run_agent(config: ProxyConfig) -> Result<()> {
    config.validate_agent()?;
    log_warnings(&config);

    let timeouts = &config.timeouts;
    let dialer: Arc<dyn Dialer> = match config.agent.transport {
        TransportKind::Quic => {
            info!("Upstream: quic://{}", config.agent.url);
            let crypto = client_crypto(config.agent.ca_cert.as_deref())?;
            Arc::new(
                QuicDialer::new(
                    &config.agent.url,
                    crypto,
                    timeouts.idle(),
                    timeouts.keep_alive(),
                    timeouts.handshake(),
                )
                .await?,
            )
        }
        TransportKind::WebSocket => {
            info!("Upstream: {}", config.agent.ws_url);
            let connector = if config.agent.ws_url.starts_with("wss://") {
                Some(create_tls_connector(config.agent.ca_cert.as_deref())?)
            } else {
                None
            };
            Arc::new(WsDialer::new(
                &config.agent.ws_url,
                connector,
                timeouts.connect(),
                timeouts.handshake(),
            )?)
        }
    };

    let listen = parse_socket_addr(&config.agent.listen)?;
    let agent = Agent::bind(listen, dialer, AgentSettings::from_config(&config)).await?;

    let shutdown = Shutdown::new();
    let tasks = vec![tokio::spawn(agent.run(shutdown.subscribe()))];
    info!("Agent ready, press Ctrl+C to stop");

    wait_for_signal().await;
    shutdown.trigger();
    join_all(tasks).await
}

async fn run_server(config: ProxyConfig) -> Result<()> {
    config.validate_server()?;
    log_warnings(&config);

    let settings = AcceptorSettings::from_config(&config);
    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    let crypto = server_crypto(&config.server.cert, &config.server.key)?;
    let acceptor = QuicAcceptor::bind(parse_socket_addr(&config.server.quic_listen)?, crypto, settings.clone())?;
    tasks.push(tokio::spawn(acceptor.run(shutdown.subscribe())));

    if !config.server.ws_listen.is_empty() {
        let tls = if config.server.ws_tls {
            Some(create_tls_acceptor(&config.server.cert, &config.server.key)?)
        } else {
            None
        };
        let handler: Arc<dyn UnitHandler> = Arc::new(AcceptorContext::new(&settings));
        let listener = WsListener::bind(
            parse_socket_addr(&config.server.ws_listen)?,
            tls,
            handler,
            ws_settings(&config),
        )
        .await?;
        tasks.push(tokio::spawn(listener.run(shutdown.subscribe())));
    }

    info!("Server ready, press Ctrl+C to stop");
    wait_for_signal().await;
    shutdown.trigger();
    join_all(tasks).await
}

async fn run_broker(config: ProxyConfig) -> Result<()> {
    config.validate_broker()?;
    log_warnings(&config);

    let timeouts = &config.timeouts;
    let settings = BrokerSettings::from_config(&config);
    let upstream = Arc::new(
        QuicDialer::new(
            &config.broker.upstream,
            client_crypto(config.broker.ca_cert.as_deref())?,
            timeouts.idle(),
            timeouts.keep_alive(),
            timeouts.handshake(),
        )
        .await?,
    );
    info!("Upstream: quic://{}", config.broker.upstream);

    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    let crypto = server_crypto(&config.broker.cert, &config.broker.key)?;
    let broker = QuicBroker::bind(
        parse_socket_addr(&config.broker.listen)?,
        crypto,
        Arc::clone(&upstream),
        settings.clone(),
    )?;
    tasks.push(tokio::spawn(broker.run(shutdown.subscribe())));

    if !config.broker.ws_listen.is_empty() {
        let tls = if config.broker.ws_tls {
            Some(create_tls_acceptor(&config.broker.cert, &config.broker.key)?)
        } else {
            None
        };
        let handler: Arc<dyn UnitHandler> = Arc::new(WsBridge::new(Arc::clone(&upstream), settings.relay));
        let listener = WsListener::bind(
            parse_socket_addr(&config.broker.ws_listen)?,
            tls,
            handler,
            ws_settings(&config),
        )
        .await?;
        tasks.push(tokio::spawn(listener.run(shutdown.subscribe())));
    }

    info!("Broker ready, press Ctrl+C to stop");
    wait_for_signal().await;
    shutdown.trigger();
    let result = join_all(tasks).await;
    upstream.close().await;
    result
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}

/// Wait for every server task, returning the first failure
async fn join_all(tasks: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_error = None;
    for task in tasks {
        let outcome = match task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
        };
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}
