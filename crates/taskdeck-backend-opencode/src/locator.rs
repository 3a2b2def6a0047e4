use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::Url;
use taskdeck_protocol::{SessionError, SessionResult};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
const DEFAULT_BINARY: &str = "opencode";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorConfig {
    /// The only address an embedded backend is ever launched for.
    pub default_base_url: String,
    pub binary: String,
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            default_base_url: DEFAULT_BASE_URL.to_owned(),
            binary: DEFAULT_BINARY.to_owned(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// A backend process started by this locator.
#[async_trait]
pub trait EmbeddedProcess: Send + Sync {
    async fn terminate(&mut self) -> SessionResult<()>;
}

#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, host: &str, port: u16) -> SessionResult<Box<dyn EmbeddedProcess>>;
}

/// Launches `<binary> serve --hostname <host> --port <port>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    binary: String,
}

impl CommandLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl EmbeddedProcess for ChildProcess {
    async fn terminate(&mut self) -> SessionResult<()> {
        self.child.kill().await.map_err(|error| {
            SessionError::Internal(format!("failed to stop embedded backend: {error}"))
        })?;
        let _ = self.child.wait().await;
        Ok(())
    }
}

#[async_trait]
impl ServerLauncher for CommandLauncher {
    async fn launch(&self, host: &str, port: u16) -> SessionResult<Box<dyn EmbeddedProcess>> {
        let child = Command::new(&self.binary)
            .arg("serve")
            .arg("--hostname")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                SessionError::BackendUnavailable(format!(
                    "failed to start embedded backend '{}': {error}",
                    self.binary
                ))
            })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

type EnsureFuture = Shared<BoxFuture<'static, SessionResult<String>>>;

#[derive(Default)]
struct LocatorState {
    requested: Option<String>,
    resolved: Option<String>,
    process: Option<Box<dyn EmbeddedProcess>>,
    in_flight: Option<(String, EnsureFuture)>,
}

/// Finds a reachable backend for a requested address, launching an embedded
/// one only for the well-known default address.
#[derive(Clone)]
pub struct ServerLocator {
    config: LocatorConfig,
    client: reqwest::Client,
    launcher: Arc<dyn ServerLauncher>,
    state: Arc<AsyncMutex<LocatorState>>,
}

impl ServerLocator {
    pub fn new(config: LocatorConfig) -> Self {
        let launcher = Arc::new(CommandLauncher::new(config.binary.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: LocatorConfig, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            launcher,
            state: Arc::new(AsyncMutex::new(LocatorState::default())),
        }
    }

    /// Health check bounded by the probe timeout. Never fails.
    pub async fn probe(&self, address: &str) -> bool {
        let url = format!("{}/health", trim_base_url(address));
        match self
            .client
            .get(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(address, error = %error, "backend probe failed");
                false
            }
        }
    }

    /// Returns the first reachable spelling of `address`: as given, then with
    /// the loopback host swapped between `localhost` and `127.0.0.1`.
    pub async fn resolve(&self, address: &str) -> Option<String> {
        for candidate in address_candidates(address) {
            if self.probe(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    /// Makes sure a backend answers for `address` and returns the address it
    /// answers at. Concurrent callers for the same address share one attempt.
    pub async fn ensure_running(&self, address: &str) -> SessionResult<String> {
        let target = trim_base_url(address).to_owned();
        let pending = {
            let mut state = self.state.lock().await;
            if state.requested.as_deref() == Some(target.as_str()) {
                if let Some(resolved) = state.resolved.as_ref() {
                    return Ok(resolved.clone());
                }
            }
            match state.in_flight.as_ref() {
                Some((in_flight_target, pending)) if *in_flight_target == target => {
                    pending.clone()
                }
                _ => {
                    let locator = self.clone();
                    let launch_target = target.clone();
                    let pending = async move { locator.locate_or_launch(launch_target).await }
                        .boxed()
                        .shared();
                    state.in_flight = Some((target.clone(), pending.clone()));
                    pending
                }
            }
        };

        let result = pending.await;

        let mut state = self.state.lock().await;
        if state
            .in_flight
            .as_ref()
            .is_some_and(|(in_flight_target, _)| *in_flight_target == target)
        {
            state.in_flight = None;
        }
        if let Ok(resolved) = result.as_ref() {
            state.requested = Some(target);
            state.resolved = Some(resolved.clone());
        }
        result
    }

    /// Whether a backend process launched by this locator is being tracked.
    pub async fn owns_process(&self) -> bool {
        self.state.lock().await.process.is_some()
    }

    /// Forgets the resolved address and terminates an owned embedded backend.
    /// Adopted backends are left running; termination failures are logged.
    pub async fn shutdown(&self) {
        let process = {
            let mut state = self.state.lock().await;
            state.requested = None;
            state.resolved = None;
            state.in_flight = None;
            state.process.take()
        };
        if let Some(mut process) = process {
            match process.terminate().await {
                Ok(()) => tracing::info!("stopped embedded backend"),
                Err(error) => {
                    tracing::warn!(error = %error, "failed to stop embedded backend")
                }
            }
        }
    }

    pub fn is_default_address(&self, address: &str) -> bool {
        let default = trim_base_url(&self.config.default_base_url);
        address_candidates(address)
            .iter()
            .any(|candidate| candidate == default)
    }

    async fn locate_or_launch(self, target: String) -> SessionResult<String> {
        if let Some(found) = self.resolve(&target).await {
            tracing::info!(requested = %target, resolved = %found, "adopted running backend");
            return Ok(found);
        }
        if !self.is_default_address(&target) {
            return Err(SessionError::BackendUnavailable(target));
        }

        let (host, port) = host_and_port(&target)?;
        let process = self.launcher.launch(&host, port).await?;
        let previous = self.state.lock().await.process.replace(process);
        if let Some(mut previous) = previous {
            if let Err(error) = previous.terminate().await {
                tracing::warn!(error = %error, "failed to stop replaced embedded backend");
            }
        }
        tracing::info!(host = %host, port, "launched embedded backend");
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(target)
    }
}

fn trim_base_url(address: &str) -> &str {
    address.trim().trim_end_matches('/')
}

fn address_candidates(address: &str) -> Vec<String> {
    let address = trim_base_url(address);
    let mut candidates = vec![address.to_owned()];
    if let Some(alternate) = alternate_loopback(address) {
        candidates.push(alternate);
    }
    candidates
}

fn alternate_loopback(address: &str) -> Option<String> {
    let mut url = Url::parse(address).ok()?;
    let alternate = match url.host_str()? {
        "localhost" => "127.0.0.1",
        "127.0.0.1" => "localhost",
        _ => return None,
    };
    url.set_host(Some(alternate)).ok()?;
    Some(trim_base_url(url.as_str()).to_owned())
}

fn host_and_port(address: &str) -> SessionResult<(String, u16)> {
    let url = Url::parse(address).map_err(|error| {
        SessionError::Configuration(format!("invalid backend address '{address}': {error}"))
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| {
            SessionError::Configuration(format!("backend address '{address}' has no host"))
        })?
        .to_owned();
    let port = url.port_or_known_default().ok_or_else(|| {
        SessionError::Configuration(format!("backend address '{address}' has no port"))
    })?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::{address_candidates, alternate_loopback, host_and_port, LocatorConfig, ServerLocator};

    #[test]
    fn alternate_loopback_swaps_hostname_and_numeric_forms() {
        assert_eq!(
            alternate_loopback("http://localhost:4096").as_deref(),
            Some("http://127.0.0.1:4096")
        );
        assert_eq!(
            alternate_loopback("http://127.0.0.1:4096/").as_deref(),
            Some("http://localhost:4096")
        );
        assert_eq!(alternate_loopback("http://10.0.0.2:4096"), None);
        assert_eq!(alternate_loopback("not a url"), None);
    }

    #[test]
    fn candidates_prefer_requested_spelling() {
        assert_eq!(
            address_candidates("http://localhost:4096/"),
            vec![
                "http://localhost:4096".to_owned(),
                "http://127.0.0.1:4096".to_owned()
            ]
        );
    }

    #[test]
    fn host_and_port_parse_backend_address() {
        assert_eq!(
            host_and_port("http://127.0.0.1:4096").expect("parse address"),
            ("127.0.0.1".to_owned(), 4096)
        );
        assert!(host_and_port("4096").is_err());
    }

    #[test]
    fn default_address_matches_either_loopback_spelling() {
        let locator = ServerLocator::new(LocatorConfig::default());
        assert!(locator.is_default_address("http://127.0.0.1:4096"));
        assert!(locator.is_default_address("http://localhost:4096/"));
        assert!(!locator.is_default_address("http://127.0.0.1:4097"));
    }
}
