//! Main recording session controller

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};

use crate::errors::{RecordError, Result};
use crate::execution::{Supervisor, UserEnvironment};
use crate::isolation::{Credentials, NamespaceSandbox, PrivilegeBoundary, SandboxPlan};
use crate::network::netns::{add_default_route, in_network_namespace};
use crate::network::veth::{MAX_DEVICE_NAME, assign_address, validate_device_name};
use crate::network::{
    AddressAllocator, Allocation, CommandRunner, DnatRule, NatRule, SystemRunner,
    TrafficRedirector, VirtualLinkPair,
};
use crate::proxy::dns::DNS_PORT;
use crate::proxy::{DnsProxy, HttpProxy};
use crate::storage::StorageDirectory;
use crate::utils;

/// Widest pid the kernel hands out (`pid_max` tops out at 2^22)
const MAX_PID_DIGITS: usize = 7;

/// Recording session configuration
#[derive(Debug, Clone)]
pub struct RecordShellConfig {
    /// Directory recorded exchanges are written to
    pub storage_dir: String,
    /// Marker prepended to the shell prompt
    pub prompt_prefix: String,
    /// Octet the subnet search starts from
    pub first_hint: u16,
    /// Resolver configuration the upstream nameserver is read from
    pub resolv_conf: PathBuf,
    /// Upstream nameserver, bypassing `resolv_conf`
    pub nameserver: Option<Ipv4Addr>,
    /// Shell to run instead of the user's login shell
    pub shell: Option<String>,
    /// Prefix of the link pair's device names
    pub device_prefix: String,
}

impl Default for RecordShellConfig {
    fn default() -> Self {
        Self {
            storage_dir: String::new(),
            prompt_prefix: "[record] ".to_string(),
            first_hint: 1,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            nameserver: None,
            shell: None,
            device_prefix: "veth-".to_string(),
        }
    }
}

impl RecordShellConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.is_empty() {
            return Err(RecordError::InvalidConfig(
                "storage directory cannot be empty".to_string(),
            ));
        }

        if self.device_prefix.is_empty() {
            return Err(RecordError::InvalidConfig(
                "device prefix cannot be empty".to_string(),
            ));
        }

        // The ingress name adds an `i` and the pid to the prefix.
        if self.device_prefix.len() + 1 + MAX_PID_DIGITS > MAX_DEVICE_NAME {
            return Err(RecordError::InvalidConfig(format!(
                "device prefix {:?} leaves no room for a pid within {} bytes",
                self.device_prefix, MAX_DEVICE_NAME
            )));
        }
        validate_device_name(&self.device_prefix)?;

        if !(1..=255).contains(&self.first_hint) {
            return Err(RecordError::InvalidConfig(format!(
                "first allocation hint {} is outside 1..=255",
                self.first_hint
            )));
        }

        Ok(())
    }

    /// Host-side and sandbox-side device names for a session run by `pid`
    pub fn device_names(&self, pid: u32) -> (String, String) {
        (
            format!("{}{}", self.device_prefix, pid),
            format!("{}i{}", self.device_prefix, pid),
        )
    }
}

/// Builder pattern for session creation
pub struct RecordShellBuilder {
    config: RecordShellConfig,
}

impl RecordShellBuilder {
    /// Create new builder
    pub fn new(storage_dir: &str) -> Self {
        Self {
            config: RecordShellConfig {
                storage_dir: storage_dir.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn prompt_prefix(mut self, prefix: &str) -> Self {
        self.config.prompt_prefix = prefix.to_string();
        self
    }

    pub fn first_hint(mut self, hint: u16) -> Self {
        self.config.first_hint = hint;
        self
    }

    pub fn resolv_conf(mut self, path: impl AsRef<Path>) -> Self {
        self.config.resolv_conf = path.as_ref().to_path_buf();
        self
    }

    pub fn nameserver(mut self, address: Ipv4Addr) -> Self {
        self.config.nameserver = Some(address);
        self
    }

    pub fn shell(mut self, shell: &str) -> Self {
        self.config.shell = Some(shell.to_string());
        self
    }

    pub fn device_prefix(mut self, prefix: &str) -> Self {
        self.config.device_prefix = prefix.to_string();
        self
    }

    pub fn config(&self) -> &RecordShellConfig {
        &self.config
    }

    /// Build the session around the environment captured at startup
    pub fn build(self, environment: UserEnvironment) -> Result<RecordShell> {
        self.config.validate()?;
        Ok(RecordShell::new(self.config, environment))
    }
}

/// Milestones of host-side setup whose order matters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    NatInstalled,
    HttpListenerResolved,
    DnatInstalled,
    SubtreesSpawned,
}

impl SetupStep {
    fn prerequisites(self) -> &'static [SetupStep] {
        match self {
            SetupStep::NatInstalled | SetupStep::HttpListenerResolved => &[],
            SetupStep::DnatInstalled => &[SetupStep::HttpListenerResolved],
            SetupStep::SubtreesSpawned => &[SetupStep::NatInstalled, SetupStep::DnatInstalled],
        }
    }
}

/// Journal of completed setup milestones
///
/// Recording a step whose prerequisites are missing fails instead of letting
/// the session run with traffic that bypasses the recorder.
#[derive(Debug, Clone, Default)]
pub struct SetupSequence {
    journal: Vec<SetupStep>,
}

impl SetupSequence {
    pub fn record(&mut self, step: SetupStep) -> Result<()> {
        if self.contains(step) {
            return Err(RecordError::SetupOrder(format!(
                "{:?} recorded twice",
                step
            )));
        }
        if let Some(missing) = step
            .prerequisites()
            .iter()
            .find(|required| !self.contains(**required))
        {
            return Err(RecordError::SetupOrder(format!(
                "{:?} attempted before {:?}",
                step, missing
            )));
        }
        debug!("Setup step {:?}", step);
        self.journal.push(step);
        Ok(())
    }

    pub fn contains(&self, step: SetupStep) -> bool {
        self.journal.contains(&step)
    }

    pub fn position(&self, step: SetupStep) -> Option<usize> {
        self.journal.iter().position(|s| *s == step)
    }

    pub fn journal(&self) -> &[SetupStep] {
        &self.journal
    }
}

/// Host state that must outlive the session, released in reverse order
struct HostSetup {
    egress: Allocation,
    ingress: Allocation,
    ingress_name: String,
    link: VirtualLinkPair,
    nat: NatRule,
    dnat: DnatRule,
    dns: DnsProxy,
    http: HttpProxy,
}

/// A recording session
pub struct RecordShell {
    config: RecordShellConfig,
    environment: UserEnvironment,
    runner: Rc<dyn CommandRunner>,
    sequence: SetupSequence,
}

impl RecordShell {
    pub fn new(config: RecordShellConfig, environment: UserEnvironment) -> Self {
        Self::with_runner(config, environment, Rc::new(SystemRunner::new()))
    }

    pub fn with_runner(
        config: RecordShellConfig,
        environment: UserEnvironment,
        runner: Rc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            environment,
            runner,
            sequence: SetupSequence::default(),
        }
    }

    pub fn config(&self) -> &RecordShellConfig {
        &self.config
    }

    /// Milestones reached so far
    pub fn setup_sequence(&self) -> &SetupSequence {
        &self.sequence
    }

    /// Run the whole session and return the exit status of the process tree
    pub fn run(&mut self) -> Result<i32> {
        utils::check_requirements()?;

        let nameserver = match self.config.nameserver {
            Some(address) => address,
            None => utils::first_nameserver(&self.config.resolv_conf)?,
        };
        let storage = StorageDirectory::new(&self.config.storage_dir)?;
        let credentials = Credentials::for_invoker(&self.environment);
        let shell = self
            .config
            .shell
            .clone()
            .unwrap_or_else(|| utils::login_shell(credentials.uid));
        info!(
            "Recording into {} with nameserver {} for uid {}",
            storage.path(),
            nameserver,
            credentials.uid
        );

        let host = self.setup_host(nameserver, storage)?;
        let status = self.launch(host, nameserver, shell, credentials);
        info!("Session finished: {:?}", status);
        status
    }

    fn setup_host(&mut self, nameserver: Ipv4Addr, storage: StorageDirectory) -> Result<HostSetup> {
        let pid = std::process::id();
        let (egress, ingress) = AddressAllocator::from_host()?.allocate_pair(self.config.first_hint)?;
        info!("Egress {} ingress {}", egress.subnet, ingress.subnet);

        let (egress_name, ingress_name) = self.config.device_names(pid);
        let link = VirtualLinkPair::create(self.runner.clone(), &egress_name, &ingress_name)?;
        link.assign(&egress_name, egress.address, ingress.address)?;

        let upstream = SocketAddr::V4(SocketAddrV4::new(nameserver, DNS_PORT));
        let dns = DnsProxy::new(SocketAddrV4::new(egress.address, 0), upstream, upstream)?;

        let redirector = TrafficRedirector::new(self.runner.clone(), format!("recordshell-{}", pid));
        let nat = redirector.install_nat(ingress.subnet)?;
        self.sequence.record(SetupStep::NatInstalled)?;

        let http = HttpProxy::new(SocketAddrV4::new(egress.address, 0), storage)?;
        let http_target = http.local_addr()?;
        self.sequence.record(SetupStep::HttpListenerResolved)?;

        let dnat = redirector.install_dnat(http_target, &egress_name)?;
        self.sequence.record(SetupStep::DnatInstalled)?;

        Ok(HostSetup {
            egress,
            ingress,
            ingress_name,
            link,
            nat,
            dnat,
            dns,
            http,
        })
    }

    fn launch(
        &mut self,
        host: HostSetup,
        nameserver: Ipv4Addr,
        shell: String,
        credentials: Credentials,
    ) -> Result<i32> {
        let HostSetup {
            egress,
            ingress,
            ingress_name,
            mut link,
            nat,
            dnat,
            dns,
            http,
        } = host;

        self.sequence.record(SetupStep::SubtreesSpawned)?;
        let mut supervisor = Supervisor::new()?;

        let plan = SandboxPlan {
            nameserver,
            dns_udp: dns.udp_listener_addr()?,
            dns_tcp: dns.tcp_listener_addr()?,
            shell,
            prompt_prefix: self.config.prompt_prefix.clone(),
            environment: self.environment.clone(),
            credentials,
        };
        let sandbox = NamespaceSandbox::spawn(plan, true)?;

        link.move_to_namespace(&ingress_name, sandbox.pid())?;
        link.mark_externally_owned();

        let runner = self.runner.clone();
        in_network_namespace(sandbox.pid(), || {
            assign_address(runner.as_ref(), &ingress_name, ingress.address, egress.address)?;
            add_default_route(runner.as_ref(), egress.address)
        })?;

        supervisor.add_existing_child(sandbox.release()?);

        supervisor.add_child_process("recorder", move || {
            let mut recorder = Supervisor::new()?;
            PrivilegeBoundary::new(credentials).drop_privileges()?;
            http.storage().ensure_exists()?;

            dns.register_handlers(&mut recorder);
            http.register_handlers(&mut recorder)?;
            recorder.run()
        })?;

        let status = supervisor.run();

        drop(dnat);
        drop(nat);
        drop(link);
        status
    }
}
