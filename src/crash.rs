use crate::Outcome;
use crate::db_client::CanaryDocument;
use crate::host_backend::{HostBackend, HostBackendError};
use crate::remote_channel::RemoteChannel;
use crate::remote_ops::{Operation, RemoteContext, RemoteRequest};
use serde_json::Value;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

pub const CLOUD_STATE_WAIT: Duration = Duration::from_secs(240);
pub const POWER_DISSIPATION: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum CrashMethod {
    /// Forced reboot triggered by the peer itself.
    LocalReboot,
    /// Power line toggled through a separate control host.
    PowerToggle,
    /// Forced stop/start of a cloud instance.
    CloudInstance,
}

impl CrashMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalReboot => "local-reboot",
            Self::PowerToggle => "power-toggle",
            Self::CloudInstance => "cloud-instance",
        }
    }
}

/// Which instance attribute addresses the host after a restart.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressType {
    PrivateIpAddress,
    PublicIpAddress,
    PrivateDnsName,
    PublicDnsName,
}

impl AddressType {
    pub const ALL: [AddressType; 4] = [
        AddressType::PrivateIpAddress,
        AddressType::PublicIpAddress,
        AddressType::PrivateDnsName,
        AddressType::PublicDnsName,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrivateIpAddress => "private_ip_address",
            Self::PublicIpAddress => "public_ip_address",
            Self::PrivateDnsName => "private_dns_name",
            Self::PublicDnsName => "public_dns_name",
        }
    }

    /// Field name in `describe-instances` output.
    pub fn field(self) -> &'static str {
        match self {
            Self::PrivateIpAddress => "PrivateIpAddress",
            Self::PublicIpAddress => "PublicIpAddress",
            Self::PrivateDnsName => "PrivateDnsName",
            Self::PublicDnsName => "PublicDnsName",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|at| at.as_str() == raw)
    }
}

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("cloud command failed: {0}")]
    Command(String),
    #[error("instance {instance} did not reach '{state}' within {secs}s")]
    Timeout {
        instance: String,
        state: String,
        secs: u64,
    },
    #[error("instance {instance} reports no {address_type}")]
    AddressUnavailable {
        instance: String,
        address_type: &'static str,
    },
    #[error("malformed cloud response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] HostBackendError),
}

impl CrashError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "cloud-command-failed",
            Self::Timeout { .. } => "cloud-state-timeout",
            Self::AddressUnavailable { .. } => "address-unavailable",
            Self::Malformed(_) => "malformed-response",
            Self::Transport(err) => err.kind(),
        }
    }
}

/// What a crash needs to know about the current iteration.
#[derive(Clone, Debug)]
pub struct CrashContext {
    /// Context of the standard-port server that is about to be crashed.
    pub remote: RemoteContext,
    /// Written on the peer, in the same invocation as the crash.
    pub remote_canary: Option<CanaryDocument>,
}

pub trait CrashInjector {
    fn method(&self) -> CrashMethod;

    /// True when the crash kills the channel that requested it, so a failed
    /// exit is the expected result.
    fn expects_disconnect(&self) -> bool {
        false
    }

    fn crash(&mut self, channel: &mut dyn RemoteChannel, ctx: &CrashContext) -> Result<Outcome, CrashError>;

    /// Brings the host back when the crash left it down. Returns the host's
    /// new address when it changed.
    fn restore(&mut self) -> Result<Option<String>, CrashError> {
        Ok(None)
    }
}

pub struct LocalReboot;

impl CrashInjector for LocalReboot {
    fn method(&self) -> CrashMethod {
        CrashMethod::LocalReboot
    }

    fn expects_disconnect(&self) -> bool {
        true
    }

    fn crash(&mut self, channel: &mut dyn RemoteChannel, ctx: &CrashContext) -> Result<Outcome, CrashError> {
        let mut operations = Vec::with_capacity(2);
        if let Some(doc) = &ctx.remote_canary {
            operations.push(Operation::InsertCanary { doc: doc.clone() });
        }
        operations.push(Operation::Crash);
        Ok(channel.send_once(&RemoteRequest::new(ctx.remote.clone(), operations)))
    }
}

pub struct PowerToggle {
    control: Box<dyn HostBackend>,
    line: String,
    dissipation: Duration,
}

impl PowerToggle {
    pub fn new(control: Box<dyn HostBackend>, line: String) -> Self {
        Self {
            control,
            line,
            dissipation: POWER_DISSIPATION,
        }
    }

    pub fn command(&self) -> Vec<String> {
        let dev = format!("/dev/{}", self.line);
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "echo 0 > {dev}; sleep {}; echo 1 > {dev}",
                self.dissipation.as_secs()
            ),
        ]
    }
}

impl CrashInjector for PowerToggle {
    fn method(&self) -> CrashMethod {
        CrashMethod::PowerToggle
    }

    fn crash(&mut self, _channel: &mut dyn RemoteChannel, _ctx: &CrashContext) -> Result<Outcome, CrashError> {
        info!(
            "power-toggle backend={} target={} line={}",
            self.control.kind().as_str(),
            self.control.target_hint().unwrap_or_default(),
            self.line
        );
        let result = self.control.exec(&self.command())?;
        Ok(Outcome::from_exec(&result))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub state: String,
    pub details: Value,
}

impl InstanceStatus {
    pub fn address(&self, address_type: AddressType) -> Option<String> {
        self.details
            .get(address_type.field())
            .and_then(Value::as_str)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
    }
}

/// Cloud provider operations on a single instance.
pub trait CloudControl {
    fn stop(&mut self, instance_id: &str, force: bool, wait: Duration) -> Result<InstanceStatus, CrashError>;
    fn start(&mut self, instance_id: &str, wait: Duration) -> Result<InstanceStatus, CrashError>;
}

pub struct CloudInstance {
    control: Box<dyn CloudControl>,
    instance_id: String,
    address_type: AddressType,
    wait: Duration,
}

impl CloudInstance {
    pub fn new(control: Box<dyn CloudControl>, instance_id: String, address_type: AddressType) -> Self {
        Self {
            control,
            instance_id,
            address_type,
            wait: CLOUD_STATE_WAIT,
        }
    }
}

impl CrashInjector for CloudInstance {
    fn method(&self) -> CrashMethod {
        CrashMethod::CloudInstance
    }

    fn crash(&mut self, _channel: &mut dyn RemoteChannel, _ctx: &CrashContext) -> Result<Outcome, CrashError> {
        info!("cloud-stop instance={} force=true", self.instance_id);
        let status = self.control.stop(&self.instance_id, true, self.wait)?;
        Ok(Outcome::ok(format!("instance {} {}", status.instance_id, status.state)))
    }

    fn restore(&mut self) -> Result<Option<String>, CrashError> {
        info!("cloud-start instance={}", self.instance_id);
        let status = self.control.start(&self.instance_id, self.wait)?;
        let address = status
            .address(self.address_type)
            .ok_or_else(|| CrashError::AddressUnavailable {
                instance: self.instance_id.clone(),
                address_type: self.address_type.as_str(),
            })?;
        info!(
            "cloud-started instance={} {}={}",
            self.instance_id,
            self.address_type.as_str(),
            address
        );
        Ok(Some(address))
    }
}

/// `aws ec2` through the AWS command-line client.
pub struct AwsCli {
    program: String,
    poll: Duration,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new("aws".to_string(), Duration::from_secs(5))
    }
}

impl AwsCli {
    pub fn new(program: String, poll: Duration) -> Self {
        Self { program, poll }
    }

    fn ec2(&self, args: &[&str]) -> Result<Value, CrashError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("ec2").args(args).arg("--output").arg("json");
        let result = crate::run_command(cmd).map_err(CrashError::Command)?;
        if !result.success() {
            return Err(CrashError::Command(format!(
                "ec2 {} exit={} stderr={}",
                args.first().copied().unwrap_or_default(),
                result.code,
                result.stderr.trim()
            )));
        }
        if result.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&result.stdout).map_err(|err| CrashError::Malformed(err.to_string()))
    }

    pub fn describe(&self, instance_id: &str) -> Result<InstanceStatus, CrashError> {
        let details = self.ec2(&[
            "describe-instances",
            "--instance-ids",
            instance_id,
            "--query",
            "Reservations[0].Instances[0]",
        ])?;
        let state = details
            .pointer("/State/Name")
            .and_then(Value::as_str)
            .ok_or_else(|| CrashError::Malformed(format!("no State.Name for {instance_id}")))?
            .to_string();
        Ok(InstanceStatus {
            instance_id: instance_id.to_string(),
            state,
            details,
        })
    }

    fn wait_for(&self, instance_id: &str, target: &str, wait: Duration) -> Result<InstanceStatus, CrashError> {
        let deadline = Instant::now() + wait;
        loop {
            let status = self.describe(instance_id)?;
            if status.state == target {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                warn!(
                    "cloud-state-timeout instance={instance_id} state={} want={target}",
                    status.state
                );
                return Err(CrashError::Timeout {
                    instance: instance_id.to_string(),
                    state: target.to_string(),
                    secs: wait.as_secs(),
                });
            }
            thread::sleep(self.poll);
        }
    }
}

impl CloudControl for AwsCli {
    fn stop(&mut self, instance_id: &str, force: bool, wait: Duration) -> Result<InstanceStatus, CrashError> {
        let mut args = vec!["stop-instances", "--instance-ids", instance_id];
        if force {
            args.push("--force");
        }
        self.ec2(&args)?;
        self.wait_for(instance_id, "stopped", wait)
    }

    fn start(&mut self, instance_id: &str, wait: Duration) -> Result<InstanceStatus, CrashError> {
        self.ec2(&["start-instances", "--instance-ids", instance_id])?;
        self.wait_for(instance_id, "running", wait)
    }
}
