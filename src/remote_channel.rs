use crate::Outcome;
use crate::host_backend::{
    Endpoint, HostBackend, HostBackendError, SSH_TRANSPORT_EXIT, SshHostBackend, is_connection_failure,
    mentions_transport_error,
};
use crate::remote_ops::RemoteRequest;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SEND_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(10);

/// Directory on the remote host that receives the executable.
pub const REMOTE_DIR: &str = ".";

pub trait RemoteChannel {
    fn endpoint(&self) -> &Endpoint;

    /// Copies the controller executable to the peer.
    fn bootstrap(&mut self) -> Outcome;

    /// Runs the request, retrying only when the connection could not be
    /// established.
    fn send(&mut self, request: &RemoteRequest) -> Outcome;

    /// Single attempt, for requests expected to sever the connection.
    fn send_once(&mut self, request: &RemoteRequest) -> Outcome;

    fn retarget(&mut self, host: &str) -> Result<(), HostBackendError>;
}

#[derive(Clone, Debug)]
pub struct SshSettings {
    pub extra_options: Vec<String>,
    pub tty: bool,
    pub retries: u32,
    pub retry_sleep: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            extra_options: Vec::new(),
            tty: false,
            retries: DEFAULT_SEND_RETRIES,
            retry_sleep: DEFAULT_RETRY_SLEEP,
        }
    }
}

/// Channel to a peer running the same executable in `remote` mode.
pub struct PeerChannel {
    backend: Box<dyn HostBackend>,
    endpoint: Endpoint,
    settings: SshSettings,
    local_exe: PathBuf,
    remote_exe: String,
}

impl PeerChannel {
    pub fn connect(endpoint: Endpoint, settings: SshSettings, local_exe: PathBuf) -> Result<Self, HostBackendError> {
        let backend = ssh_backend(&endpoint, &settings)?;
        Ok(Self::with_backend(backend, endpoint, settings, local_exe))
    }

    pub fn with_backend(
        backend: Box<dyn HostBackend>,
        endpoint: Endpoint,
        settings: SshSettings,
        local_exe: PathBuf,
    ) -> Self {
        let exe_name = local_exe
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "powercycle".to_string());
        Self {
            backend,
            endpoint,
            settings,
            local_exe,
            remote_exe: format!("{REMOTE_DIR}/{exe_name}"),
        }
    }

    fn argv(&self, request: &RemoteRequest) -> Vec<String> {
        let mut argv = vec![self.remote_exe.clone()];
        argv.extend(request.to_args());
        argv
    }

    fn attempt(&self, argv: &[String]) -> Outcome {
        match self.backend.exec(argv) {
            Ok(result) => Outcome::from_exec(&result),
            Err(err) => Outcome::fail(SSH_TRANSPORT_EXIT, format!("{err} ({})", err.kind())),
        }
    }
}

fn ssh_backend(endpoint: &Endpoint, settings: &SshSettings) -> Result<Box<dyn HostBackend>, HostBackendError> {
    let backend = SshHostBackend::new(endpoint.to_string(), &settings.extra_options, settings.tty)
        .map_err(HostBackendError::InvalidInput)?;
    Ok(Box::new(backend))
}

impl RemoteChannel for PeerChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn bootstrap(&mut self) -> Outcome {
        info!(
            "peer-bootstrap target={} exe={}",
            self.backend.target_hint().unwrap_or_default(),
            self.local_exe.display()
        );
        let mut attempt = 0;
        loop {
            match self.backend.copy_to(&self.local_exe, REMOTE_DIR) {
                Ok(path) => {
                    self.remote_exe = path;
                    return Outcome::ok(format!("copied to {}", self.remote_exe));
                }
                Err(HostBackendError::CopyFailed { ref stderr, .. })
                    if mentions_transport_error(stderr) && attempt < self.settings.retries =>
                {
                    attempt += 1;
                    warn!(
                        "peer-bootstrap-retry attempt={}/{} sleep_secs={} stderr={}",
                        attempt,
                        self.settings.retries,
                        self.settings.retry_sleep.as_secs(),
                        stderr.trim()
                    );
                    thread::sleep(self.settings.retry_sleep);
                }
                Err(err) => return Outcome::fail(1, format!("bootstrap failed ({}): {err}", err.kind())),
            }
        }
    }

    fn send(&mut self, request: &RemoteRequest) -> Outcome {
        let argv = self.argv(request);
        let mut attempt = 0;
        loop {
            let outcome = self.attempt(&argv);
            if !is_connection_failure(outcome.code, &outcome.output) || attempt >= self.settings.retries {
                info!(
                    "peer-send ops=\"{}\" port={} exit={} attempts={}",
                    request.describe(),
                    request.context.port,
                    outcome.code,
                    attempt + 1
                );
                return outcome;
            }
            attempt += 1;
            warn!(
                "peer-send-retry ops=\"{}\" attempt={}/{} sleep_secs={} output={}",
                request.describe(),
                attempt,
                self.settings.retries,
                self.settings.retry_sleep.as_secs(),
                outcome.output.trim()
            );
            thread::sleep(self.settings.retry_sleep);
        }
    }

    fn send_once(&mut self, request: &RemoteRequest) -> Outcome {
        let outcome = self.attempt(&self.argv(request));
        info!(
            "peer-send-once ops=\"{}\" port={} exit={}",
            request.describe(),
            request.context.port,
            outcome.code
        );
        outcome
    }

    fn retarget(&mut self, host: &str) -> Result<(), HostBackendError> {
        let endpoint = self.endpoint.with_host(host).map_err(HostBackendError::InvalidInput)?;
        self.backend = ssh_backend(&endpoint, &self.settings)?;
        info!(
            "peer-retarget target={}",
            self.backend.target_hint().unwrap_or_default()
        );
        self.endpoint = endpoint;
        Ok(())
    }
}
