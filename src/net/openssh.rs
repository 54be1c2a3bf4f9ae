//! A reference [Driver] based on the [openssh] crate.
//!
//! Suits devices that expose their CLI over SSH. Authentication is left entirely to OpenSSH:
//! keys, agents, and `~/.ssh/config` all apply as they would on the command line, and
//! [DeviceDescriptor::password] is ignored.
//!
//! # Methods
//!
//! * `cli`: runs each positional argument as a raw command and returns a mapping from command to
//!   captured stdout.
//! * `exec`: quotes the positional arguments into a single POSIX shell command, runs it, and
//!   returns its stdout. Only useful on devices with a POSIX shell.
//! * `ping`: checks that the connection is still alive and returns `true`.
//! * `get_facts`: returns a small mapping of facts (`hostname`, `os_version`, `vendor`).

use crate::core::{DeviceDescriptor, Mapping, Value};
use crate::net::{Connection, Driver};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use openssh::{KnownHosts, SessionBuilder};
use std::process::Output;

/// Production implementation of [Driver] over OpenSSH multiplexed sessions.
#[derive(Clone, Debug)]
pub struct SshDriver {
    known_hosts: KnownHostsPolicy,
}

/// A cloneable stand-in for [KnownHosts], which implements neither [Clone] nor [Debug].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KnownHostsPolicy {
    Strict,
    #[default]
    Add,
    Accept,
}

impl From<KnownHostsPolicy> for KnownHosts {
    fn from(value: KnownHostsPolicy) -> Self {
        match value {
            KnownHostsPolicy::Strict => KnownHosts::Strict,
            KnownHostsPolicy::Add => KnownHosts::Add,
            KnownHostsPolicy::Accept => KnownHosts::Accept,
        }
    }
}

impl SshDriver {
    pub fn new(known_hosts: KnownHostsPolicy) -> Self {
        SshDriver { known_hosts }
    }
}

impl Default for SshDriver {
    fn default() -> Self {
        Self::new(KnownHostsPolicy::default())
    }
}

#[async_trait]
impl Driver for SshDriver {
    async fn open(&self, device: &DeviceDescriptor) -> anyhow::Result<Box<dyn Connection>> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(self.known_hosts.into())
            .connect_timeout(device.timeout);
        if let Some(ref user) = device.username {
            builder.user(user.clone());
        }
        if let Some(port) = device.optional_args.get("port").and_then(Value::as_u64) {
            let port = u16::try_from(port).context("port out of range")?;
            builder.port(port);
        }

        let session = builder
            .connect_mux(&device.hostname)
            .await
            .with_context(|| format!("could not connect to {}", device.hostname))?;

        Ok(Box::new(SshConnection {
            remote: OpenSshRemote {
                session: Some(session),
            },
            vendor: device.driver.clone(),
        }))
    }
}

/// The remote operations [SshConnection] needs, split out so tests can fake them.
///
/// To enable better integration testing, this type is public but stripped from documentation.
#[doc(hidden)]
#[async_trait]
pub trait Remote: Send {
    /// Runs `command` verbatim on the remote end.
    async fn run(&mut self, command: &str) -> anyhow::Result<Output>;

    /// Checks that the connection is still alive.
    async fn check(&mut self) -> anyhow::Result<()>;

    /// Closes the connection.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// An open SSH connection to one device.
#[doc(hidden)]
pub struct SshConnection<R: Remote> {
    remote: R,
    vendor: Option<String>,
}

impl<R: Remote> SshConnection<R> {
    #[doc(hidden)]
    pub fn new(remote: R, vendor: Option<String>) -> Self {
        SshConnection { remote, vendor }
    }

    /// Runs `command` and returns its stdout, or an error carrying its stderr if it failed.
    async fn stdout_of(&mut self, command: &str) -> anyhow::Result<String> {
        let output = self.remote.run(command).await?;
        if !output.status.success() {
            let exit_code_message = match output.status.code() {
                Some(i) => format!("exit code {i}"),
                None => "error".to_string(),
            };
            bail!(
                "command exited with {exit_code_message}: {command}\n{}",
                String::from_utf8_lossy(&output.stderr).trim_end(),
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Renders a positional argument as a command string.
fn command_arg(arg: &Value) -> anyhow::Result<&str> {
    arg.as_str()
        .ok_or_else(|| anyhow!("expected a command string but received: {arg:?}"))
}

#[async_trait]
impl<R: Remote> Connection for SshConnection<R> {
    async fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        _kwargs: &Mapping,
    ) -> anyhow::Result<Value> {
        match method {
            "cli" => {
                let mut output = Mapping::new();
                for arg in args {
                    let command = command_arg(arg)?;
                    let stdout = self.stdout_of(command).await?;
                    output.insert(command.into(), stdout.into());
                }
                Ok(Value::Mapping(output))
            }
            "exec" => {
                let words = args.iter().map(command_arg).collect::<anyhow::Result<Vec<_>>>()?;
                if words.is_empty() {
                    bail!("exec requires at least one argument");
                }
                let command = shlex::try_join(words).context("could not quote command")?;
                Ok(self.stdout_of(&command).await?.into())
            }
            "ping" => {
                self.remote.check().await?;
                Ok(true.into())
            }
            "get_facts" => {
                let mut facts = Mapping::new();
                facts.insert("hostname".into(), self.stdout_of("hostname").await?.into());
                facts.insert("os_version".into(), self.stdout_of("uname -sr").await?.into());
                if let Some(ref vendor) = self.vendor {
                    facts.insert("vendor".into(), vendor.clone().into());
                }
                Ok(Value::Mapping(facts))
            }
            other => bail!("the SSH driver does not support method {other:?}"),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.remote.close().await
    }
}

/// An implementation of [Remote] using the [openssh] crate. For production use.
struct OpenSshRemote {
    /// Taken when the connection closes, since [openssh::Session::close] consumes the session.
    session: Option<openssh::Session>,
}

impl OpenSshRemote {
    fn session(&self) -> anyhow::Result<&openssh::Session> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("the connection is already closed"))
    }
}

#[async_trait]
impl Remote for OpenSshRemote {
    async fn run(&mut self, command: &str) -> anyhow::Result<Output> {
        Ok(self.session()?.raw_command(command).output().await?)
    }

    async fn check(&mut self) -> anyhow::Result<()> {
        Ok(self.session()?.check().await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self.session.take() {
            Some(session) => Ok(session.close().await?),
            None => bail!("the connection is already closed"),
        }
    }
}
