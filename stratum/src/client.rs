//! Stratum client connection state machine

use crate::{
    algorithms::{Algorithm, Family},
    config::{BanningConfig, DifficultyConfig},
    difficulty::Difficulty,
    error::Result,
    protocol::{
        StratumFault, StratumMethod, StratumRequest, create_error_response, create_notification, create_success_response,
        parse_message,
    },
    template::Template,
    utils::ExtraNonceCounter,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use pool_core::time::unix_now;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;

/// Largest amount of unframed input a connection may buffer.
pub const MAX_BUFFER_SIZE: usize = 10240;

const VERSION_MASK: &str = "1fffe000";
const NO_VERSION_MASK: &str = "00000000";

/// Millisecond wall clock, injectable for tests.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(unix_now)
}

/// Snapshot of a connection handed to the pool collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub subscription_id: String,
    pub remote: SocketAddr,
    pub port: u16,
    pub addr_primary: Option<String>,
    pub addr_auxiliary: Option<String>,
    pub password: Option<String>,
}

/// Outcome of the pool's authorization check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authorization {
    pub error: Option<StratumFault>,
    pub authorized: bool,
    pub disconnect: bool,
}

/// A share that passed the connection-level checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub client: ClientInfo,
    /// `mining.submit` params, the first one replaced by `[primary, auxiliary]`
    pub params: Vec<Value>,
    pub extra_nonce1: String,
    pub difficulty: f64,
    pub previous_difficulty: f64,
    pub asicboost: bool,
    pub version_mask: String,
}

/// Verdict of the share validator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShareOutcome {
    pub error: Option<StratumFault>,
    pub result: bool,
}

/// Pool-side collaborators consulted by every connection.
#[async_trait]
pub trait PoolHandler: Send + Sync {
    /// Refuses the subscription when a fault is returned.
    async fn subscribe(&self, _client: &ClientInfo) -> Option<StratumFault> {
        None
    }

    async fn authorize(&self, client: &ClientInfo) -> Authorization;

    async fn submit(&self, submission: Submission) -> ShareOutcome;
}

/// Notable connection events, forwarded by the network.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Flooded,
    MalformedMessage(String),
    UnknownMethod(StratumRequest),
    TriggerBan,
    SocketError(String),
    SocketTimeout(String),
    DifficultyQueued(f64),
    DifficultyChanged(f64),
}

/// Static per-connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub subscription_id: String,
    pub remote: SocketAddr,
    pub port: u16,
    pub algorithm: Algorithm,
    pub asicboost: bool,
    pub banning: BanningConfig,
    /// Seconds
    pub connection_timeout: u64,
    pub difficulty: DifficultyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareCounts {
    pub valid: u64,
    pub invalid: u64,
}

/// Password flags understood by the pool, e.g. `d=64` for a static difficulty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PasswordFlags {
    pub difficulty: Option<f64>,
}

static NAME_FILTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9.,]+").unwrap());
static PASSWORD_FILTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9.,=]+").unwrap());
static DIFFICULTY_FLAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^d=([+-]?(\d*\.)?\d+)$").unwrap());
static LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([+-]?\d+)").unwrap());

/// Keeps alphanumerics and separators, then splits `primary[,auxiliary]`.
pub fn validate_name(name: &str) -> (String, Option<String>) {
    let name = NAME_FILTER.replace_all(name, "");
    let mut addresses = name.split(',');
    let primary = addresses.next().unwrap_or_default().to_string();
    (primary, addresses.next().map(str::to_string))
}

pub fn validate_password(password: &str) -> PasswordFlags {
    let password = PASSWORD_FILTER.replace_all(password, "");
    let mut flags = PasswordFlags::default();
    for value in password.split(',') {
        if let Some(difficulty) = DIFFICULTY_FLAG.captures(value).and_then(|c| c[1].parse().ok()) {
            flags.difficulty = Some(difficulty);
        }
    }
    flags
}

/// Leading integer of a parameter, `None` when there is none.
fn leading_int(value: &str) -> Option<i64> {
    LEADING_INT.captures(value).and_then(|c| c[1].parse().ok())
}

/// One miner connection. Consumes raw socket bytes and produces outbound
/// lines and [`ClientEvent`]s; the owner tears the socket down once
/// [`StratumClient::is_closed`] reports true.
pub struct StratumClient {
    config: ClientConfig,
    family: Family,
    handler: Arc<dyn PoolHandler>,
    extra_nonces: Arc<ExtraNonceCounter>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
    clock: Clock,

    buffer: Vec<u8>,
    closed: bool,
    activity: u64,
    authorized: bool,
    addr_primary: Option<String>,
    addr_auxiliary: Option<String>,
    password: Option<String>,
    extra_nonce1: Option<String>,
    shares: ShareCounts,

    difficulty: f64,
    previous_difficulty: f64,
    pending_difficulty: Option<f64>,
    static_difficulty: bool,
    vardiff: Difficulty,

    asicboost: bool,
    version_mask: &'static str,
}

impl StratumClient {
    pub fn new(
        config: ClientConfig,
        handler: Arc<dyn PoolHandler>,
        extra_nonces: Arc<ExtraNonceCounter>,
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedSender<ClientEvent>,
        clock: Clock,
    ) -> Self {
        let activity = clock();
        let vardiff = Difficulty::new(config.difficulty.clone());
        Self {
            family: config.algorithm.family(),
            config,
            handler,
            extra_nonces,
            outbound,
            events,
            clock,
            buffer: Vec::new(),
            closed: false,
            activity,
            authorized: false,
            addr_primary: None,
            addr_auxiliary: None,
            password: None,
            extra_nonce1: None,
            shares: ShareCounts::default(),
            difficulty: 0.0,
            previous_difficulty: 0.0,
            pending_difficulty: None,
            static_difficulty: false,
            vardiff,
            asicboost: false,
            version_mask: NO_VERSION_MASK,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.config.subscription_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn pending_difficulty(&self) -> Option<f64> {
        self.pending_difficulty
    }

    pub fn extra_nonce1(&self) -> Option<&str> {
        self.extra_nonce1.as_deref()
    }

    pub fn shares(&self) -> ShareCounts {
        self.shares
    }

    pub fn version_mask(&self) -> &str {
        self.version_mask
    }

    pub fn label(&self) -> String {
        let worker = self.addr_primary.as_deref().filter(|w| !w.is_empty()).unwrap_or("(unauthorized)");
        format!("{} [{}]", worker, self.config.remote.ip())
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            subscription_id: self.config.subscription_id.clone(),
            remote: self.config.remote,
            port: self.config.port,
            addr_primary: self.addr_primary.clone(),
            addr_auxiliary: self.addr_auxiliary.clone(),
            password: self.password.clone(),
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.outbound.send(format!("{}\n", json));
            }
            Err(e) => log::error!("Failed to serialize message for {}: {}", self.label(), e),
        }
    }

    /// Appends socket bytes and dispatches every complete line in order.
    pub async fn handle_data(&mut self, data: &[u8]) {
        if self.closed {
            return;
        }
        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            log::warn!("Detected socket flooding from {}", self.label());
            self.emit(ClientEvent::Flooded);
            self.close();
            return;
        }
        self.buffer.extend_from_slice(data);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..pos];
            if line.is_empty() {
                continue;
            }
            match parse_message(line) {
                Ok(request) => self.handle_message(request).await,
                Err(e) => {
                    log::warn!("Malformed message from {}: {}", self.label(), e);
                    self.emit(ClientEvent::MalformedMessage(e.to_string()));
                    self.close();
                }
            }
            if self.closed {
                return;
            }
        }
    }

    pub async fn handle_message(&mut self, request: StratumRequest) {
        match request.method {
            StratumMethod::Subscribe => self.handle_subscribe(request).await,
            StratumMethod::Authorize => self.handle_authorize(request).await,
            StratumMethod::Configure => self.handle_configure(request),
            StratumMethod::MultiVersion => self.handle_multi_version(request),
            StratumMethod::Submit => {
                self.activity = (self.clock)();
                self.handle_submit(request).await
            }
            StratumMethod::GetTransactions => {
                self.send(&create_error_response(request.id, json!([]), StratumFault::not_supported()));
            }
            StratumMethod::ExtranonceSubscribe => {
                self.send(&create_error_response(request.id, json!(false), StratumFault::not_supported()));
            }
            _ => {
                log::debug!("Unknown stratum method from {}: {}", self.label(), request.method.as_str());
                self.emit(ClientEvent::UnknownMethod(request));
            }
        }
    }

    async fn handle_subscribe(&mut self, request: StratumRequest) {
        if let Some(fault) = self.handler.subscribe(&self.info()).await {
            self.send(&create_error_response(request.id, Value::Null, fault));
            return;
        }

        let extra_nonce1 = self.extra_nonces.next();
        let result = match self.family {
            Family::Default => {
                let id = &self.config.subscription_id;
                json!([[["mining.set_difficulty", id], ["mining.notify", id]], extra_nonce1, self.family.extranonce2_size()])
            }
            Family::ProgPow => json!([null, extra_nonce1]),
        };
        self.extra_nonce1 = Some(extra_nonce1);
        self.send(&create_success_response(request.id, result));
    }

    async fn handle_authorize(&mut self, request: StratumRequest) {
        let (primary, auxiliary) = validate_name(&request.param_str(0));
        let password = request.param_str(1);
        let flags = validate_password(&password);

        self.addr_primary = Some(primary);
        self.addr_auxiliary = auxiliary;
        self.password = Some(password);

        if let Some(difficulty) = flags.difficulty.filter(|d| *d != 0.0) {
            self.enqueue_difficulty(difficulty);
            self.static_difficulty = true;
        }

        let authorization = self.handler.authorize(&self.info()).await;
        self.authorized = authorization.error.is_none() && authorization.authorized;
        if authorization.disconnect {
            log::info!("Disconnecting {} on authorization", self.label());
            self.close();
            return;
        }
        let response = match authorization.error {
            Some(fault) => create_error_response(request.id, json!(self.authorized), fault),
            None => create_success_response(request.id, json!(self.authorized)),
        };
        self.send(&response);
    }

    fn handle_configure(&mut self, request: StratumRequest) {
        let result = if self.config.asicboost {
            json!({ "version-rolling": true, "version-rolling.mask": VERSION_MASK })
        } else {
            json!({ "version-rolling": false })
        };
        self.set_asicboost(self.config.asicboost);
        self.send(&create_success_response(request.id, result));
    }

    fn handle_multi_version(&mut self, request: StratumRequest) {
        let version = leading_int(&request.param_str(0)).unwrap_or_default();
        self.set_asicboost(self.config.asicboost && version > 1);
    }

    fn set_asicboost(&mut self, enabled: bool) {
        self.asicboost = enabled;
        self.version_mask = if enabled { VERSION_MASK } else { NO_VERSION_MASK };
    }

    async fn handle_submit(&mut self, request: StratumRequest) {
        if self.addr_primary.as_deref().is_none_or(str::is_empty) {
            let (primary, auxiliary) = validate_name(&request.param_str(0));
            self.addr_primary = Some(primary);
            self.addr_auxiliary = auxiliary;
        }

        if !self.authorized {
            self.send(&create_error_response(request.id, Value::Null, StratumFault::unauthorized_worker()));
            self.consider_ban(false);
            return;
        }
        let Some(extra_nonce1) = self.extra_nonce1.clone() else {
            self.send(&create_error_response(request.id, Value::Null, StratumFault::not_subscribed()));
            self.consider_ban(false);
            return;
        };

        let now = (self.clock)() / 1000;
        if let Some(difficulty) = self.vardiff.on_submit(now, self.difficulty) {
            log::debug!("Retargeting {} from {} to {}", self.label(), self.difficulty, difficulty);
            self.enqueue_difficulty(difficulty);
        }

        let (primary, auxiliary) = validate_name(&request.param_str(0));
        let mut params = request.params;
        match params.first_mut() {
            Some(worker) => *worker = json!([primary, auxiliary]),
            None => params.push(json!([primary, auxiliary])),
        }
        let submission = Submission {
            client: self.info(),
            params,
            extra_nonce1,
            difficulty: self.difficulty,
            previous_difficulty: self.previous_difficulty,
            asicboost: self.asicboost,
            version_mask: self.version_mask.to_string(),
        };

        let outcome = self.handler.submit(submission).await;
        if !self.consider_ban(outcome.result) {
            let response = match outcome.error {
                Some(fault) => create_error_response(request.id, json!(outcome.result), fault),
                None => create_success_response(request.id, json!(outcome.result)),
            };
            self.send(&response);
        }
    }

    /// Counts a share and closes the connection once the invalid ratio is too high.
    /// Returns true when the connection was banned.
    pub fn consider_ban(&mut self, valid: bool) -> bool {
        if valid {
            self.shares.valid += 1;
        } else {
            self.shares.invalid += 1;
        }

        let total = self.shares.valid + self.shares.invalid;
        if total >= self.config.banning.check_threshold {
            if (self.shares.invalid as f64 / total as f64) < self.config.banning.invalid_percent {
                self.shares = ShareCounts::default();
            } else {
                log::warn!("Banning {}: {} of {} shares were invalid", self.label(), self.shares.invalid, total);
                self.close();
                self.emit(ClientEvent::TriggerBan);
                return true;
            }
        }
        false
    }

    /// Queues a difficulty for the next job unless the miner requested a static one.
    pub fn enqueue_difficulty(&mut self, difficulty: f64) {
        if !self.static_difficulty {
            self.pending_difficulty = Some(difficulty);
            self.emit(ClientEvent::DifficultyQueued(difficulty));
        }
    }

    /// Sends a new difficulty (or ProgPow target). Returns false when unchanged.
    pub fn broadcast_difficulty(&mut self, difficulty: f64) -> bool {
        if difficulty == self.difficulty {
            return false;
        }
        self.previous_difficulty = self.difficulty;
        self.difficulty = difficulty;

        let notification = match self.family {
            Family::ProgPow => create_notification(StratumMethod::SetTarget, vec![json!(self.config.algorithm.target_hex(difficulty))]),
            Family::Default => create_notification(StratumMethod::SetDifficulty, vec![json!(difficulty)]),
        };
        self.send(&notification);
        true
    }

    /// Sends `mining.notify`, first dropping idle miners and applying any queued difficulty.
    pub fn broadcast_mining_job(&mut self, mut params: Vec<Value>) {
        if self.closed {
            return;
        }
        let idle = (self.clock)().saturating_sub(self.activity);
        if idle > self.config.connection_timeout * 1000 {
            let message = format!("The last submitted share was {} seconds ago", idle / 1000);
            log::info!("Dropping {}: {}", self.label(), message);
            self.emit(ClientEvent::SocketTimeout(message));
            self.close();
            return;
        }

        if let Some(pending) = self.pending_difficulty.take() {
            if self.broadcast_difficulty(pending) {
                self.emit(ClientEvent::DifficultyChanged(self.difficulty));
            }
        }

        if let (Family::ProgPow, Some(target)) = (self.family, params.get_mut(3)) {
            *target = json!(self.config.algorithm.target_hex(self.difficulty));
        }
        self.send(&create_notification(StratumMethod::Notify, params));
    }

    /// Builds this connection's job parameters from `template` and sends them.
    pub fn send_job(&mut self, template: &Template, clean_jobs: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let params = template.job_parameters(&mut self.extra_nonce1, &self.extra_nonces, clean_jobs)?;
        self.broadcast_mining_job(params);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::config;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(crate) const NOW: u64 = 1_634_742_080_841;

    /// Scripted pool collaborator recording what it was asked.
    #[derive(Default)]
    pub(crate) struct MockHandler {
        pub subscribe_fault: Option<StratumFault>,
        pub authorization: Authorization,
        pub outcome: ShareOutcome,
        pub authorized: Mutex<Vec<ClientInfo>>,
        pub submissions: Mutex<Vec<Submission>>,
    }

    impl MockHandler {
        pub(crate) fn accepting() -> Self {
            Self {
                authorization: Authorization { authorized: true, ..Default::default() },
                outcome: ShareOutcome { error: None, result: true },
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PoolHandler for MockHandler {
        async fn subscribe(&self, _client: &ClientInfo) -> Option<StratumFault> {
            self.subscribe_fault.clone()
        }

        async fn authorize(&self, client: &ClientInfo) -> Authorization {
            self.authorized.lock().push(client.clone());
            self.authorization.clone()
        }

        async fn submit(&self, submission: Submission) -> ShareOutcome {
            self.submissions.lock().push(submission);
            self.outcome.clone()
        }
    }

    struct Harness {
        client: StratumClient,
        handler: Arc<MockHandler>,
        outbound: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        now: Arc<AtomicU64>,
    }

    impl Harness {
        fn lines(&mut self) -> Vec<String> {
            let mut lines = vec![];
            while let Ok(line) = self.outbound.try_recv() {
                lines.push(line);
            }
            lines
        }

        fn events(&mut self) -> Vec<ClientEvent> {
            let mut events = vec![];
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn client_config(algorithm: Algorithm) -> ClientConfig {
        let config = config();
        ClientConfig {
            subscription_id: "deadbeefcafebabe0100000000000000".into(),
            remote: "127.0.0.1:52000".parse().unwrap(),
            port: 3001,
            algorithm,
            asicboost: false,
            banning: config.banning.clone(),
            connection_timeout: config.settings.connection_timeout,
            difficulty: config.ports[0].difficulty.clone(),
        }
    }

    fn harness_with(config: ClientConfig, handler: MockHandler) -> Harness {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let now = Arc::new(AtomicU64::new(NOW));
        let clock_now = now.clone();
        let clock: Clock = Arc::new(move || clock_now.load(Ordering::Relaxed));
        let handler = Arc::new(handler);
        let extra_nonces = Arc::new(ExtraNonceCounter::new(config.algorithm.family().extranonce1_size()));
        let client = StratumClient::new(config, handler.clone(), extra_nonces, outbound_tx, events_tx, clock);
        Harness { client, handler, outbound, events, now }
    }

    fn harness() -> Harness {
        harness_with(client_config(Algorithm::Sha256d), MockHandler::accepting())
    }

    fn request(line: &str) -> StratumRequest {
        parse_message(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_label() {
        let mut h = harness();
        assert_eq!(h.client.label(), "(unauthorized) [127.0.0.1]");
        h.client.addr_primary = Some("test".into());
        assert_eq!(h.client.label(), "test [127.0.0.1]");
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name("test"), ("test".into(), None));
        assert_eq!(validate_name(""), ("".into(), None));
        assert_eq!(validate_name("example!@#$%^&"), ("example".into(), None));
        assert_eq!(validate_name("test,test"), ("test".into(), Some("test".into())));
        assert_eq!(validate_name("wallet.rig-1,aux"), ("wallet.rig1".into(), Some("aux".into())));
    }

    #[test]
    fn test_password_flags() {
        assert_eq!(validate_password("d=100").difficulty, Some(100.0));
        assert_eq!(validate_password("x=1,d=.5").difficulty, Some(0.5));
        assert_eq!(validate_password("d=10.s0"), PasswordFlags::default());
        assert_eq!(validate_password("d=1e5"), PasswordFlags::default());
        assert_eq!(validate_password(""), PasswordFlags::default());
        assert_eq!(validate_password("d=5."), PasswordFlags::default());
        assert_eq!(validate_password("d=1.2.3"), PasswordFlags::default());
        assert_eq!(validate_password("d=7 5").difficulty, Some(75.0));
    }

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("4"), Some(4));
        assert_eq!(leading_int("  -12abc"), Some(-12));
        assert_eq!(leading_int("v2"), None);
        assert_eq!(leading_int(""), None);
    }

    #[test]
    fn test_difficulty_queueing() {
        let mut h = harness();
        h.client.enqueue_difficulty(8.0);
        assert_eq!(h.client.pending_difficulty(), Some(8.0));
        assert_eq!(h.events(), vec![ClientEvent::DifficultyQueued(8.0)]);

        let mut h = harness();
        h.client.static_difficulty = true;
        h.client.enqueue_difficulty(8.0);
        assert_eq!(h.client.pending_difficulty(), None);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_framing_is_chunk_invariant() {
        let mut whole = harness();
        whole.client.handle_data(b"{\"method\":\"mining.extranonce.subscribe\"}\n{\"id\":2,\"method\":\"mining.get_transactions\"}\n").await;

        let mut split = harness();
        split.client.handle_data(b"{\"method\":\"mining.extranonce.subscribe\"}\n{\"id\":2,\"method\":\"mining.get_").await;
        let mut split_lines = split.lines();
        assert_eq!(split_lines.len(), 1);
        split.client.handle_data(b"transactions\"}\n").await;
        split_lines.extend(split.lines());

        let expected = vec![
            "{\"id\":null,\"result\":false,\"error\":[20,\"Not supported.\",null]}\n".to_string(),
            "{\"id\":2,\"result\":[],\"error\":[20,\"Not supported.\",null]}\n".to_string(),
        ];
        assert_eq!(whole.lines(), expected);
        assert_eq!(split_lines, expected);
        assert_eq!(split.client.buffer.len(), 0);
        assert!(!split.client.is_closed());
    }

    #[tokio::test]
    async fn test_partial_line_is_retained() {
        let mut h = harness();
        h.client.handle_data(b"{\"method\":\"mining.extrano").await;
        assert!(h.lines().is_empty());
        assert_eq!(h.client.buffer.len(), 25);
        assert!(!h.client.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_line_closes() {
        let mut h = harness();
        h.client.handle_data(b"bad\n{\"method\":\"mining.extranonce.subscribe\"}\n").await;
        assert!(h.client.is_closed());
        assert!(h.lines().is_empty());
        assert!(matches!(h.events().as_slice(), [ClientEvent::MalformedMessage(_)]));

        h.client.handle_data(b"{\"method\":\"mining.extranonce.subscribe\"}\n").await;
        assert!(h.lines().is_empty());
    }

    #[tokio::test]
    async fn test_null_line_closes() {
        let mut h = harness();
        h.client.handle_data(b"null\n").await;
        assert!(h.client.is_closed());
        assert!(matches!(h.events().as_slice(), [ClientEvent::MalformedMessage(_)]));
    }

    #[tokio::test]
    async fn test_flooding_closes() {
        let mut h = harness();
        h.client.handle_data("test".repeat(10000).as_bytes()).await;
        assert!(h.client.is_closed());
        assert_eq!(h.events(), vec![ClientEvent::Flooded]);

        let mut h = harness();
        h.client.handle_data(&[b'a'; MAX_BUFFER_SIZE]).await;
        assert!(!h.client.is_closed());
        h.client.handle_data(b"a").await;
        assert!(h.client.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":1,"method":"mining.subscribe","params":[]}"#)).await;
        let extra_nonce1 = h.client.extra_nonce1().unwrap().to_string();
        assert_eq!(extra_nonce1.len(), 8);
        assert_eq!(
            h.lines(),
            vec![format!(
                "{{\"id\":1,\"result\":[[[\"mining.set_difficulty\",\"deadbeefcafebabe0100000000000000\"],[\"mining.notify\",\"deadbeefcafebabe0100000000000000\"]],\"{}\",4],\"error\":null}}\n",
                extra_nonce1
            )]
        );

        let mut h = harness_with(client_config(Algorithm::Kawpow), MockHandler::accepting());
        h.client.handle_message(request(r#"{"id":null,"method":"mining.subscribe"}"#)).await;
        let extra_nonce1 = h.client.extra_nonce1().unwrap().to_string();
        assert_eq!(extra_nonce1.len(), 4);
        assert_eq!(h.lines(), vec![format!("{{\"id\":null,\"result\":[null,\"{}\"],\"error\":null}}\n", extra_nonce1)]);
    }

    #[tokio::test]
    async fn test_subscribe_refused() {
        let handler = MockHandler { subscribe_fault: Some(StratumFault::new(20, "busy")), ..MockHandler::accepting() };
        let mut h = harness_with(client_config(Algorithm::Kawpow), handler);
        h.client.handle_message(request(r#"{"id":null,"method":"mining.subscribe"}"#)).await;
        assert_eq!(h.client.extra_nonce1(), None);
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":null,\"error\":[20,\"busy\",null]}\n".to_string()]);
    }

    #[tokio::test]
    async fn test_authorize() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":null,"method":"mining.authorize","params":["username,aux","password"]}"#)).await;
        assert!(h.client.is_authorized());
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":true,\"error\":null}\n".to_string()]);
        let info = h.handler.authorized.lock()[0].clone();
        assert_eq!(info.addr_primary.as_deref(), Some("username"));
        assert_eq!(info.addr_auxiliary.as_deref(), Some("aux"));
        assert_eq!(info.password.as_deref(), Some("password"));
        assert_eq!(info.port, 3001);
        assert_eq!(h.client.label(), "username [127.0.0.1]");
    }

    #[tokio::test]
    async fn test_authorize_static_difficulty() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":null,"method":"mining.authorize","params":["username","d=500"]}"#)).await;
        assert_eq!(h.client.pending_difficulty(), Some(500.0));
        assert!(h.client.static_difficulty);
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":true,\"error\":null}\n".to_string()]);

        h.client.enqueue_difficulty(8.0);
        assert_eq!(h.client.pending_difficulty(), Some(500.0));
    }

    #[tokio::test]
    async fn test_authorize_disconnect_and_error() {
        let handler = MockHandler { authorization: Authorization { disconnect: true, ..Default::default() }, ..Default::default() };
        let mut h = harness_with(client_config(Algorithm::Sha256d), handler);
        h.client.handle_message(request(r#"{"id":null,"method":"mining.authorize","params":["username","password"]}"#)).await;
        assert!(h.client.is_closed());
        assert!(h.lines().is_empty());

        let fault = StratumFault::new(24, "unknown address");
        let handler = MockHandler {
            authorization: Authorization { error: Some(fault), authorized: true, disconnect: false },
            ..Default::default()
        };
        let mut h = harness_with(client_config(Algorithm::Sha256d), handler);
        h.client.handle_message(request(r#"{"id":3,"method":"mining.authorize","params":["username"]}"#)).await;
        assert!(!h.client.is_authorized());
        assert_eq!(h.lines(), vec!["{\"id\":3,\"result\":false,\"error\":[24,\"unknown address\",null]}\n".to_string()]);
    }

    #[tokio::test]
    async fn test_configure() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":null,"method":"mining.configure"}"#)).await;
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":{\"version-rolling\":false},\"error\":null}\n".to_string()]);
        assert!(!h.client.asicboost);
        assert_eq!(h.client.version_mask(), "00000000");

        let mut config = client_config(Algorithm::Sha256d);
        config.asicboost = true;
        let mut h = harness_with(config, MockHandler::accepting());
        h.client.handle_message(request(r#"{"id":null,"method":"mining.configure"}"#)).await;
        assert_eq!(
            h.lines(),
            vec!["{\"id\":null,\"result\":{\"version-rolling\":true,\"version-rolling.mask\":\"1fffe000\"},\"error\":null}\n".to_string()]
        );
        assert!(h.client.asicboost);
        assert_eq!(h.client.version_mask(), "1fffe000");
    }

    #[tokio::test]
    async fn test_multi_version() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":null,"method":"mining.multi_version","params":[4]}"#)).await;
        assert_eq!(h.client.version_mask(), "00000000");

        let mut config = client_config(Algorithm::Sha256d);
        config.asicboost = true;
        let mut h = harness_with(config, MockHandler::accepting());
        h.client.handle_message(request(r#"{"id":null,"method":"mining.multi_version","params":[1]}"#)).await;
        assert!(!h.client.asicboost);
        h.client.handle_message(request(r#"{"id":null,"method":"mining.multi_version","params":["4"]}"#)).await;
        assert!(h.client.asicboost);
        assert_eq!(h.client.version_mask(), "1fffe000");
        assert!(h.lines().is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_authorization_and_subscription() {
        let mut h = harness();
        h.client.config.banning.check_threshold = 500;
        h.client.handle_message(request(r#"{"id":null,"method":"mining.submit","params":["worker","password"]}"#)).await;
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":null,\"error\":[24,\"unauthorized worker\",null]}\n".to_string()]);
        assert_eq!(h.client.shares().invalid, 1);
        assert_eq!(h.client.label(), "worker [127.0.0.1]");

        h.client.authorized = true;
        h.client.handle_message(request(r#"{"id":null,"method":"mining.submit","params":["worker","password"]}"#)).await;
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":null,\"error\":[25,\"not subscribed\",null]}\n".to_string()]);
        assert_eq!(h.client.shares().invalid, 2);
        assert!(h.handler.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_submit_forwards_share() {
        let mut h = harness();
        h.client.authorized = true;
        h.client.extra_nonce1 = Some("f000000f".into());
        h.client.handle_message(request(r#"{"id":7,"method":"mining.submit","params":["worker,aux","1","00000001","6036c425","deadbeef"]}"#)).await;

        assert_eq!(h.lines(), vec!["{\"id\":7,\"result\":true,\"error\":null}\n".to_string()]);
        assert_eq!(h.client.shares(), ShareCounts { valid: 1, invalid: 0 });
        let submission = h.handler.submissions.lock()[0].clone();
        assert_eq!(submission.params[0], json!(["worker", "aux"]));
        assert_eq!(submission.params[4], json!("deadbeef"));
        assert_eq!(submission.extra_nonce1, "f000000f");
        assert_eq!(submission.client.addr_primary.as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn test_invalid_shares_trigger_ban() {
        let handler = MockHandler { outcome: ShareOutcome { error: Some(StratumFault::new(23, "low difficulty share")), result: false }, ..Default::default() };
        let mut h = harness_with(client_config(Algorithm::Sha256d), handler);
        h.client.authorized = true;
        h.client.extra_nonce1 = Some("f000000f".into());
        h.client.shares = ShareCounts { valid: 0, invalid: 20 };
        h.client.handle_message(request(r#"{"id":null,"method":"mining.submit","params":["worker","password"]}"#)).await;

        assert!(h.client.is_closed());
        assert!(h.lines().is_empty());
        assert_eq!(h.events(), vec![ClientEvent::TriggerBan]);
    }

    #[tokio::test]
    async fn test_good_shares_reset_counters() {
        let mut h = harness();
        h.client.authorized = true;
        h.client.extra_nonce1 = Some("f000000f".into());
        h.client.shares = ShareCounts { valid: 20, invalid: 0 };
        h.client.handle_message(request(r#"{"id":null,"method":"mining.submit","params":["worker","password"]}"#)).await;
        assert_eq!(h.lines(), vec!["{\"id\":null,\"result\":true,\"error\":null}\n".to_string()]);
        assert_eq!(h.client.shares(), ShareCounts::default());
        assert!(!h.client.is_closed());
    }

    #[test]
    fn test_consider_ban_threshold() {
        let mut h = harness();
        for _ in 0..4 {
            assert!(!h.client.consider_ban(false));
        }
        assert!(h.client.consider_ban(true));
        assert!(h.client.is_closed());

        let mut h = harness();
        for _ in 0..3 {
            h.client.consider_ban(true);
        }
        h.client.consider_ban(false);
        assert!(!h.client.consider_ban(false));
        assert_eq!(h.client.shares(), ShareCounts::default());
    }

    #[tokio::test]
    async fn test_submissions_feed_vardiff() {
        let mut h = harness();
        h.client.authorized = true;
        h.client.extra_nonce1 = Some("f000000f".into());
        h.client.difficulty = 32.0;
        let submit = r#"{"id":null,"method":"mining.submit","params":["worker"]}"#;

        h.client.handle_message(request(submit)).await;
        h.now.fetch_add(575_000, Ordering::Relaxed);
        h.client.handle_message(request(submit)).await;

        assert_eq!(h.client.pending_difficulty(), Some(8.0));
        assert!(h.events().contains(&ClientEvent::DifficultyQueued(8.0)));
    }

    #[tokio::test]
    async fn test_not_supported_and_unknown() {
        let mut h = harness();
        h.client.handle_message(request(r#"{"id":null,"method":"mining.get_transactions"}"#)).await;
        h.client.handle_message(request(r#"{"id":null,"method":"mining.extranonce.subscribe"}"#)).await;
        assert_eq!(
            h.lines(),
            vec![
                "{\"id\":null,\"result\":[],\"error\":[20,\"Not supported.\",null]}\n".to_string(),
                "{\"id\":null,\"result\":false,\"error\":[20,\"Not supported.\",null]}\n".to_string(),
            ]
        );

        h.client.handle_message(request(r#"{"id":null,"method":"mining.unknown"}"#)).await;
        assert!(matches!(h.events().as_slice(), [ClientEvent::UnknownMethod(r)] if r.method == StratumMethod::Other("mining.unknown".into())));
        assert!(!h.client.is_closed());
    }

    #[test]
    fn test_broadcast_difficulty() {
        let mut h = harness();
        assert!(!h.client.broadcast_difficulty(0.0));
        assert!(h.client.broadcast_difficulty(8.0));
        assert_eq!(h.lines(), vec!["{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[8.0]}\n".to_string()]);

        let mut h = harness_with(client_config(Algorithm::Kawpow), MockHandler::accepting());
        assert!(!h.client.broadcast_difficulty(0.0));
        assert!(h.client.broadcast_difficulty(8.0));
        assert_eq!(
            h.lines(),
            vec!["{\"id\":null,\"method\":\"mining.set_target\",\"params\":[\"000000001fe00000000000000000000000000000000000000000000000000000\"]}\n".to_string()]
        );
    }

    #[test]
    fn test_broadcast_mining_job() {
        let mut h = harness();
        h.client.broadcast_mining_job(vec![json!(0), json!(0), json!(0), json!(0)]);
        assert_eq!(h.lines(), vec!["{\"id\":null,\"method\":\"mining.notify\",\"params\":[0,0,0,0]}\n".to_string()]);

        h.client.pending_difficulty = Some(8.0);
        h.client.broadcast_mining_job(vec![json!(0)]);
        assert_eq!(
            h.lines(),
            vec![
                "{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[8.0]}\n".to_string(),
                "{\"id\":null,\"method\":\"mining.notify\",\"params\":[0]}\n".to_string(),
            ]
        );
        assert_eq!(h.events(), vec![ClientEvent::DifficultyChanged(8.0)]);

        // unchanged difficulty is not re-sent
        h.client.pending_difficulty = Some(8.0);
        h.client.broadcast_mining_job(vec![json!(0)]);
        assert_eq!(h.lines().len(), 1);
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_broadcast_mining_job_progpow_target() {
        let mut h = harness_with(client_config(Algorithm::Kawpow), MockHandler::accepting());
        h.client.difficulty = 16.0;
        h.client.broadcast_mining_job(vec![json!(0), json!(0), json!(0), json!(0)]);
        assert_eq!(
            h.lines(),
            vec!["{\"id\":null,\"method\":\"mining.notify\",\"params\":[0,0,0,\"000000000ff00000000000000000000000000000000000000000000000000000\"]}\n".to_string()]
        );
    }

    #[test]
    fn test_idle_miner_times_out() {
        let mut h = harness();
        h.now.fetch_add(601_000, Ordering::Relaxed);
        h.client.broadcast_mining_job(vec![json!(0)]);
        assert!(h.client.is_closed());
        assert!(h.lines().is_empty());
        assert_eq!(h.events(), vec![ClientEvent::SocketTimeout("The last submitted share was 601 seconds ago".into())]);
    }

    #[test]
    fn test_send_job_from_template() {
        let mut h = harness();
        let template = crate::template::tests::template();
        h.client.send_job(&template, true).unwrap();
        let lines = h.lines();
        assert_eq!(lines.len(), 1);
        let notify: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"].as_array().map(Vec::len), Some(9));
        assert_eq!(notify["params"][8], json!(true));
    }
}
