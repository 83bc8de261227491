//! SSH port-forward to reach a database behind a jump host.
//!
//! Spawns the system `ssh` client with `-N -L`, waits until the forwarded
//! local port accepts connections, and kills the child on [`SshTunnel::close`]
//! or drop, so the tunnel never outlives the run that opened it.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use encounter_sync_source_models::SshRoute;

use crate::SourceError;

/// How many times to probe the forwarded port before giving up.
const READY_ATTEMPTS: u32 = 50;

/// Delay between readiness probes (50 × 200ms = 10s).
const READY_POLL: Duration = Duration::from_millis(200);

/// How the jump host authenticates us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// No secret configured; rely on the SSH agent or default keys.
    Agent,
    /// Private key file.
    KeyFile(String),
    /// Password, passed to `sshpass` through the `SSHPASS` environment
    /// variable.
    Password(String),
}

impl SshAuth {
    /// Interprets a `key_or_password` value: an existing file is a key,
    /// anything else non-empty is a password.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        if secret.is_empty() {
            Self::Agent
        } else if Path::new(secret).is_file() {
            Self::KeyFile(secret.to_string())
        } else {
            Self::Password(secret.to_string())
        }
    }
}

/// A running `ssh -L` child process.
pub struct SshTunnel {
    child: Option<Child>,
    local_port: u16,
}

impl SshTunnel {
    /// Forwards `127.0.0.1:<local_port>` to `remote_host:remote_port` via
    /// the jump host in `route`. A `local_port` of `0` picks a free port.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Tunnel`] if `ssh` cannot be spawned, exits
    /// early, or the forwarded port never becomes reachable.
    pub async fn open(
        route: &SshRoute,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Self, SourceError> {
        let local_port = if local_port == 0 {
            free_local_port()?
        } else {
            local_port
        };

        let auth = SshAuth::from_secret(&route.key_or_password);
        let (program, args) = ssh_command(route, &auth, remote_host, remote_port, local_port);

        log::info!(
            "Opening SSH tunnel 127.0.0.1:{local_port} -> {remote_host}:{remote_port} via {}@{}:{}",
            route.user,
            route.host,
            route.port
        );

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if let SshAuth::Password(password) = &auth {
            cmd.env("SSHPASS", password);
        }

        let child = cmd.spawn().map_err(|e| SourceError::Tunnel {
            message: format!("failed to spawn {program} (is it installed?): {e}"),
        })?;

        let mut tunnel = Self {
            child: Some(child),
            local_port,
        };
        tunnel.wait_ready().await?;

        log::info!("SSH tunnel ready on 127.0.0.1:{local_port}");
        Ok(tunnel)
    }

    /// The forwarded local port.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stops the `ssh` child. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Io`] if the child cannot be killed or reaped.
    pub fn close(&mut self) -> Result<(), SourceError> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                child.kill()?;
            }
            child.wait()?;
            log::info!("SSH tunnel on 127.0.0.1:{} closed", self.local_port);
        }
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<(), SourceError> {
        for _ in 0..READY_ATTEMPTS {
            if let Some(child) = self.child.as_mut()
                && let Some(status) = child.try_wait()?
            {
                self.child = None;
                return Err(SourceError::Tunnel {
                    message: format!("ssh exited before the tunnel was ready ({status})"),
                });
            }

            if tokio::net::TcpStream::connect(("127.0.0.1", self.local_port))
                .await
                .is_ok()
            {
                return Ok(());
            }

            tokio::time::sleep(READY_POLL).await;
        }

        Err(SourceError::Tunnel {
            message: format!(
                "port {} not reachable after {:?}",
                self.local_port,
                READY_POLL * READY_ATTEMPTS
            ),
        })
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to stop SSH tunnel on port {}: {e}", self.local_port);
        }
    }
}

/// Builds the program and arguments for the tunnel process.
fn ssh_command(
    route: &SshRoute,
    auth: &SshAuth,
    remote_host: &str,
    remote_port: u16,
    local_port: u16,
) -> (&'static str, Vec<String>) {
    let mut args: Vec<String> = Vec::new();

    if matches!(auth, SshAuth::Password(_)) {
        args.extend(["-e".to_string(), "ssh".to_string()]);
    }

    args.extend(
        [
            "-N",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "StrictHostKeyChecking=accept-new",
        ]
        .map(String::from),
    );
    args.push("-L".to_string());
    args.push(format!("127.0.0.1:{local_port}:{remote_host}:{remote_port}"));
    args.push("-p".to_string());
    args.push(route.port.to_string());

    match auth {
        SshAuth::KeyFile(path) => {
            args.extend(["-i".to_string(), path.clone()]);
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        SshAuth::Agent => {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        SshAuth::Password(_) => {}
    }

    args.push(format!("{}@{}", route.user, route.host));

    let program = if matches!(auth, SshAuth::Password(_)) {
        "sshpass"
    } else {
        "ssh"
    };

    (program, args)
}

fn free_local_port() -> Result<u16, SourceError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
