use super::{Location, OutputSinks, RemoteProcess, Transport};
use crate::{errors::ChannelError, target::Target};
use async_trait::async_trait;
use std::{fs::File, path::PathBuf, process::Stdio, time::Duration};
use subprocess::{Exec, ExitStatus, NullFile, Popen, Redirection};
use tracing::{debug, trace, warn};

/// ssh reserves this exit code for its own failures (authentication, name resolution, refused
/// connections), which is how an unreachable target is told apart from a failing command.
const SSH_FAILURE_EXIT_CODE: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// [`Transport`] backed by the OpenSSH client binaries (`ssh` and `scp`).
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    identity: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=No".to_string(),
        ];
        if let Some(identity) = &self.identity {
            options.push("-i".to_string());
            options.push(identity.to_string_lossy().into_owned());
        }
        options
    }

    fn ssh_args(&self, target: &Target, command: &str, force_tty: bool) -> Vec<String> {
        let mut args = vec![];
        if force_tty {
            args.push("-tt".to_string());
        }
        args.extend(self.common_options());
        args.push(target.destination(&self.user));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, target: &Target, command: &str) -> Result<i32, ChannelError> {
        let output = tokio::process::Command::new("ssh")
            .args(self.ssh_args(target, command, false))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ChannelError::Spawn {
                target: target.clone(),
                reason: err.to_string(),
            })?;

        trace!(
            "[{target}] stdout: {}",
            String::from_utf8_lossy(&output.stdout).trim_end()
        );

        match output.status.code() {
            Some(SSH_FAILURE_EXIT_CODE) => Err(ChannelError::Unreachable {
                target: target.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Some(code) => {
                if code != 0 {
                    debug!(
                        "[{target}] `{command}` exited with {code}: {}",
                        String::from_utf8_lossy(&output.stderr).trim_end()
                    );
                }
                Ok(code)
            }
            None => Err(ChannelError::Interrupted {
                target: target.clone(),
            }),
        }
    }

    async fn spawn(
        &self,
        target: &Target,
        command: &str,
        sinks: &OutputSinks,
    ) -> Result<Box<dyn RemoteProcess>, ChannelError> {
        let spawn_err = |reason: String| ChannelError::Spawn {
            target: target.clone(),
            reason,
        };

        let out_file = File::create(&sinks.stdout)
            .map_err(|err| spawn_err(format!("{:?}: {err}", sinks.stdout)))?;
        let err_file = File::create(&sinks.stderr)
            .map_err(|err| spawn_err(format!("{:?}: {err}", sinks.stderr)))?;

        let popen = Exec::cmd("ssh")
            .args(&self.ssh_args(target, command, true)[..])
            .stdin(NullFile)
            .stdout(Redirection::File(out_file))
            .stderr(Redirection::File(err_file))
            .detached()
            .popen()
            .map_err(|err| spawn_err(err.to_string()))?;

        debug!("[{target}] spawned detached ssh (pid {:?})", popen.pid());
        Ok(Box::new(SshProcess {
            target: target.clone(),
            popen,
        }))
    }

    async fn copy(&self, source: &Location, destination: &Location) -> Result<i32, ChannelError> {
        // the remote end names the target in case the transport itself fails
        let target = destination
            .target()
            .or(source.target())
            .cloned()
            .unwrap_or_else(|| Target::new("localhost"));

        let status = tokio::process::Command::new("scp")
            .args(self.common_options())
            .arg("-q")
            .arg(source.render(&self.user))
            .arg(destination.render(&self.user))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|err| ChannelError::Spawn {
                target: target.clone(),
                reason: err.to_string(),
            })?;

        status
            .code()
            .ok_or(ChannelError::Interrupted { target })
    }
}

struct SshProcess {
    target: Target,
    popen: Popen,
}

impl SshProcess {
    fn map_status(&self, status: ExitStatus) -> Result<i32, ChannelError> {
        match status {
            ExitStatus::Exited(code) if code as i32 == SSH_FAILURE_EXIT_CODE => {
                Err(ChannelError::Unreachable {
                    target: self.target.clone(),
                    reason: "ssh exited with 255, see the stderr log".to_string(),
                })
            }
            ExitStatus::Exited(code) => Ok(code as i32),
            ExitStatus::Other(code) => Ok(code),
            ExitStatus::Signaled(_) => Err(ChannelError::Interrupted {
                target: self.target.clone(),
            }),
            ExitStatus::Undetermined => Err(ChannelError::Unreachable {
                target: self.target.clone(),
                reason: "exit status undetermined".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn wait(&mut self) -> Result<i32, ChannelError> {
        // poll rather than block so the wait can be raced against cancellation
        loop {
            if let Some(status) = self.popen.poll() {
                return self.map_status(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn has_exited(&mut self) -> bool {
        self.popen.poll().is_some()
    }

    fn terminate(&mut self) -> Result<(), ChannelError> {
        if self.has_exited() {
            return Ok(());
        }
        self.popen
            .terminate()
            .map_err(|err| ChannelError::Spawn {
                target: self.target.clone(),
                reason: format!("failed to terminate ssh: {err}"),
            })
    }
}

impl Drop for SshProcess {
    fn drop(&mut self) {
        if self.popen.poll().is_none() {
            warn!(
                "[{}] detached ssh session dropped while running, killing it",
                self.target
            );
            let _ = self.popen.kill();
        }
    }
}
