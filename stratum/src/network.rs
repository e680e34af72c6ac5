//! Listening sockets, ban table, client registry and job broadcast

use crate::{
    client::{ClientConfig, ClientEvent, Clock, PoolHandler, StratumClient, system_clock},
    config::{PortConfig, StratumConfig, TlsConfig},
    error::{Error, Result},
    template::Template,
    utils::{ExtraNonceCounter, SubscriptionCounter},
};
use parking_lot::Mutex;
use pool_core::triggers::SingleTrigger;
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_rustls::TlsAcceptor;

const READ_BUFFER_SIZE: usize = 4096;
/// Time a closing connection gets to flush queued replies before its writer is aborted.
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything observable about the network, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Started,
    Stopped,
    ClientConnected { subscription_id: String, remote: SocketAddr },
    Client { subscription_id: String, event: ClientEvent },
    ClientBanned { ip: IpAddr },
    /// A banned address reconnected; `remaining` seconds are left on its ban
    ClientKicked { ip: IpAddr, remaining: u64 },
    ClientForgiven { ip: IpAddr },
    ClientDisconnected { subscription_id: String },
    /// No new template arrived within the rebroadcast window
    BroadcastTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    Clear,
    Banned { remaining: u64 },
    Forgiven,
}

enum ClientCommand {
    Job(Arc<Template>, bool),
    Difficulty(f64),
}

struct ClientHandle {
    remote: SocketAddr,
    commands: UnboundedSender<ClientCommand>,
}

pub struct Network {
    config: Arc<StratumConfig>,
    handler: Arc<dyn PoolHandler>,
    subscriptions: SubscriptionCounter,
    extra_nonces: Arc<ExtraNonceCounter>,
    /// Address to ban time (ms)
    banned: Mutex<HashMap<IpAddr, u64>>,
    clients: Mutex<HashMap<String, ClientHandle>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    events: UnboundedSender<NetworkEvent>,
    clock: Clock,
    shutdown: SingleTrigger,
}

impl Network {
    pub fn new(config: Arc<StratumConfig>, handler: Arc<dyn PoolHandler>, events: UnboundedSender<NetworkEvent>) -> Arc<Self> {
        Self::with_clock(config, handler, events, system_clock())
    }

    pub fn with_clock(
        config: Arc<StratumConfig>,
        handler: Arc<dyn PoolHandler>,
        events: UnboundedSender<NetworkEvent>,
        clock: Clock,
    ) -> Arc<Self> {
        let extra_nonces = Arc::new(ExtraNonceCounter::new(config.coin.algorithms.mining.family().extranonce1_size()));
        Arc::new(Self {
            config,
            handler,
            subscriptions: SubscriptionCounter::new(),
            extra_nonces,
            banned: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
            events,
            clock,
            shutdown: SingleTrigger::new(),
        })
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn ban_count(&self) -> usize {
        self.banned.lock().len()
    }

    fn ban_duration_ms(&self) -> u64 {
        self.config.banning.time * 1000
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let now = (self.clock)();
        self.banned.lock().get(&ip).is_some_and(|&since| now.saturating_sub(since) < self.ban_duration_ms())
    }

    /// Looks up `ip`, clearing an expired ban on the way.
    pub fn check_ban(&self, ip: IpAddr) -> BanStatus {
        let now = (self.clock)();
        let mut banned = self.banned.lock();
        let Some(&since) = banned.get(&ip) else {
            return BanStatus::Clear;
        };

        let elapsed = now.saturating_sub(since);
        if elapsed < self.ban_duration_ms() {
            drop(banned);
            let remaining = (self.ban_duration_ms() - elapsed) / 1000;
            log::info!("Rejected connection from banned address {} ({}s remaining)", ip, remaining);
            self.emit(NetworkEvent::ClientKicked { ip, remaining });
            BanStatus::Banned { remaining }
        } else {
            banned.remove(&ip);
            drop(banned);
            log::info!("Forgave banned address {}", ip);
            self.emit(NetworkEvent::ClientForgiven { ip });
            BanStatus::Forgiven
        }
    }

    pub fn trigger_ban(&self, ip: IpAddr) {
        self.banned.lock().insert(ip, (self.clock)());
        log::warn!("Banned address {} for {}s", ip, self.config.banning.time);
        self.emit(NetworkEvent::ClientBanned { ip });
    }

    /// Drops expired bans, returning how many were removed.
    pub fn purge_bans(&self) -> usize {
        let now = (self.clock)();
        let duration = self.ban_duration_ms();
        let mut banned = self.banned.lock();
        let before = banned.len();
        banned.retain(|_, since| now.saturating_sub(*since) < duration);
        before - banned.len()
    }

    fn start_ban_sweep(self: &Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.banning.purge_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let network = self.clone();
        let shutdown = self.shutdown.listener.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = ticker.tick() => {
                        let purged = network.purge_bans();
                        if purged > 0 {
                            log::debug!("Purged {} expired bans", purged);
                        }
                    }
                    _ = shutdown.clone() => break,
                }
            }
        });
    }

    /// Binds every enabled port and starts accepting miners. Returns the bound addresses.
    pub async fn listen(self: &Arc<Self>) -> Result<Vec<SocketAddr>> {
        let needs_tls = self.config.ports.iter().any(|p| p.enabled && p.tls);
        let acceptor = match (&self.config.tls, needs_tls) {
            (Some(tls), true) => Some(tls_acceptor(tls)?),
            (None, true) => return Err(Error::Config("TLS ports require server key and certificate".into())),
            _ => None,
        };

        let mut addresses = vec![];
        for port in self.config.ports.iter().filter(|p| p.enabled) {
            let listener = TcpListener::bind(("0.0.0.0", port.port)).await?;
            let address = listener.local_addr()?;
            log::info!("Stratum server listening on {}{}", address, if port.tls { " (TLS)" } else { "" });
            let acceptor = if port.tls { acceptor.clone() } else { None };
            tokio::spawn(self.clone().accept_loop(listener, port.clone(), acceptor));
            addresses.push(address);
        }

        self.start_ban_sweep();
        self.emit(NetworkEvent::Started);
        Ok(addresses)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: PortConfig, acceptor: Option<TlsAcceptor>) {
        let shutdown = self.shutdown.listener.clone();
        loop {
            select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        let network = self.clone();
                        let port = port.clone();
                        match acceptor.clone() {
                            Some(acceptor) => {
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(stream) => network.handle_client(stream, remote, port).await,
                                        Err(e) => log::debug!("TLS handshake with {} failed: {}", remote, e),
                                    }
                                });
                            }
                            None => {
                                tokio::spawn(network.handle_client(stream, remote, port));
                            }
                        }
                    }
                    Err(e) => log::warn!("Failed to accept connection on port {}: {}", port.port, e),
                },
                _ = shutdown.clone() => break,
            }
        }
        log::debug!("Stratum listener on port {} closed", port.port);
    }

    /// Serves one miner connection until it closes.
    pub async fn handle_client<S>(self: Arc<Self>, stream: S, remote: SocketAddr, port: PortConfig)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ip = remote.ip();
        if let BanStatus::Banned { .. } = self.check_ban(ip) {
            return;
        }

        let subscription_id = self.subscriptions.next();
        let (outbound_tx, mut outbound_rx) = unbounded_channel::<String>();
        let (events_tx, mut events_rx) = unbounded_channel();
        let (commands_tx, mut commands_rx) = unbounded_channel();

        let config = ClientConfig {
            subscription_id: subscription_id.clone(),
            remote,
            port: port.port,
            algorithm: self.config.coin.algorithms.mining,
            asicboost: self.config.coin.asicboost,
            banning: self.config.banning.clone(),
            connection_timeout: self.config.settings.connection_timeout,
            difficulty: port.difficulty.clone(),
        };
        let mut client =
            StratumClient::new(config, self.handler.clone(), self.extra_nonces.clone(), outbound_tx, events_tx, self.clock.clone());
        self.clients.lock().insert(subscription_id.clone(), ClientHandle { remote, commands: commands_tx });
        log::info!("Miner connected from {} ({})", remote, subscription_id);
        self.emit(NetworkEvent::ClientConnected { subscription_id: subscription_id.clone(), remote });
        if port.difficulty.initial > 0.0 {
            client.enqueue_difficulty(port.difficulty.initial);
        }

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut writer_task = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    log::debug!("Failed to write to {}: {}", remote, e);
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            self.forward_client_events(&subscription_id, ip, &mut events_rx);
            if client.is_closed() {
                break;
            }
            select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => client.handle_data(&buf[..n]).await,
                    Err(e) => {
                        log::debug!("Socket error from {}: {}", client.label(), e);
                        self.emit(NetworkEvent::Client { subscription_id: subscription_id.clone(), event: ClientEvent::SocketError(e.to_string()) });
                        break;
                    }
                },
                command = commands_rx.recv() => match command {
                    Some(ClientCommand::Job(template, clean_jobs)) => {
                        if let Err(e) = client.send_job(&template, clean_jobs) {
                            log::warn!("Failed to build job {} for {}: {}", template.job_id(), client.label(), e);
                        }
                    }
                    Some(ClientCommand::Difficulty(difficulty)) => client.enqueue_difficulty(difficulty),
                    None => break,
                },
            }
        }
        self.forward_client_events(&subscription_id, ip, &mut events_rx);

        self.clients.lock().remove(&subscription_id);
        log::info!("Miner disconnected: {}", client.label());
        drop(client);
        drop(reader);
        if tokio::time::timeout(WRITE_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            log::debug!("Dropping unsent replies to {}", remote);
            writer_task.abort();
            let _ = writer_task.await;
        }
        self.emit(NetworkEvent::ClientDisconnected { subscription_id });
    }

    fn forward_client_events(&self, subscription_id: &str, ip: IpAddr, events: &mut UnboundedReceiver<ClientEvent>) {
        while let Ok(event) = events.try_recv() {
            let ban = event == ClientEvent::TriggerBan;
            self.emit(NetworkEvent::Client { subscription_id: subscription_id.to_string(), event });
            if ban {
                self.trigger_ban(ip);
            }
        }
    }

    /// Pushes a job built from `template` to every connected miner and rearms the rebroadcast watchdog.
    pub fn broadcast_mining_jobs(self: &Arc<Self>, template: Arc<Template>, clean_jobs: bool) {
        {
            let clients = self.clients.lock();
            log::debug!("Broadcasting job {} to {} miners", template.job_id(), clients.len());
            for (subscription_id, handle) in clients.iter() {
                if handle.commands.send(ClientCommand::Job(template.clone(), clean_jobs)).is_err() {
                    log::debug!("Miner {} at {} is already gone", subscription_id, handle.remote);
                }
            }
        }
        self.rearm_watchdog();
    }

    fn rearm_watchdog(self: &Arc<Self>) {
        let timeout = Duration::from_secs(self.config.settings.job_rebroadcast_timeout);
        let network = Arc::downgrade(self);
        let mut watchdog = self.watchdog.lock();
        if let Some(previous) = watchdog.take() {
            previous.abort();
        }
        *watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(network) = network.upgrade() {
                log::warn!("No new block template within {}s", timeout.as_secs());
                network.emit(NetworkEvent::BroadcastTimeout);
            }
        }));
    }

    /// Queues a difficulty for a connected miner. Returns false if it is unknown.
    pub fn enqueue_difficulty(&self, subscription_id: &str, difficulty: f64) -> bool {
        self.clients.lock().get(subscription_id).is_some_and(|handle| handle.commands.send(ClientCommand::Difficulty(difficulty)).is_ok())
    }

    /// Closes every listening socket. Established connections are left to finish.
    pub fn stop(&self) {
        self.shutdown.fire();
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        log::info!("Stratum network stopped");
        self.emit(NetworkEvent::Stopped);
    }
}

fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.server_cert)?)).collect::<std::result::Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.server_key)?))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", tls.server_key.display())))?;
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
