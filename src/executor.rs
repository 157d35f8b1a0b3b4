use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

/// The jobid variable form that tags every RPC with `<procname>.<uid>`,
/// required for per-user accounting in the metrics store.
pub const JOBID_VAR_PROCNAME_UID: &str = "procname_uid";

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to run remote command: {0}")]
    SpawnError(#[from] std::io::Error),
    #[error("Command [{command}] failed on host [{host}] with status [{status}]")]
    CommandError {
        host: String,
        command: String,
        status: i32,
    },
    #[error("Command output on host [{0}] was not valid UTF-8")]
    OutputEncodingError(String),
}

/// The two request classes a server schedules independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Data,
    Metadata,
}

impl Scope {
    /// The NRS parameter prefix of the service handling this scope.
    pub fn service_param(&self) -> &'static str {
        match self {
            Scope::Data => "ost.OSS.ost_io",
            Scope::Metadata => "mds.MDS.mdt",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Data => write!(f, "data"),
            Scope::Metadata => write!(f, "metadata"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// Token bucket scheduling, required for rate rules to take effect.
    Tbf,
    /// First-in-first-out, the idle state when QoS is disabled.
    Fifo,
}

impl SchedulerMode {
    fn policy_arg(&self) -> &'static str {
        match self {
            SchedulerMode::Tbf => "tbf",
            SchedulerMode::Fifo => "fifo",
        }
    }
}

/// The capability set the controller needs from every server host. All
/// operations are idempotent: stopping an absent rule succeeds, starting an
/// existing rule replaces it.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn list_rules(&self, host: &str, scope: Scope) -> Result<HashSet<String>, ExecError>;
    async fn start_rule(
        &self,
        host: &str,
        scope: Scope,
        name: &str,
        expression: &str,
        rate: u64,
    ) -> Result<(), ExecError>;
    async fn stop_rule(&self, host: &str, scope: Scope, name: &str) -> Result<(), ExecError>;
    async fn set_scheduler_mode(
        &self,
        host: &str,
        scope: Scope,
        mode: SchedulerMode,
    ) -> Result<(), ExecError>;
    async fn set_jobid_var(&self, host: &str, fsname: &str, value: &str)
        -> Result<(), ExecError>;
}

/// Drives `lctl` on the server hosts over ssh.
#[derive(Debug)]
pub struct SshExecutor {
    log: slog::Logger,
}

impl SshExecutor {
    pub fn new(log: slog::Logger) -> SshExecutor {
        SshExecutor { log }
    }

    async fn run(&self, host: &str, command: &str) -> Result<String, ExecError> {
        slog::debug!(self.log, "running remote command"; "host" => host, "command" => command);
        let output = tokio::process::Command::new("ssh")
            .arg(host)
            .arg(command)
            .output()
            .await?;

        let stdout = String::from_utf8(output.stdout)
            .or(Err(ExecError::OutputEncodingError(host.to_owned())))?;

        if !output.status.success() {
            slog::debug!(self.log, "remote command failed";
                "host" => host,
                "command" => command,
                "stderr" => String::from_utf8(output.stderr).unwrap_or("[Failed to parse output]".to_owned())
            );
            return Err(ExecError::CommandError {
                host: host.to_owned(),
                command: command.to_owned(),
                status: output.status.code().unwrap_or(-1),
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl HostExecutor for SshExecutor {
    async fn list_rules(&self, host: &str, scope: Scope) -> Result<HashSet<String>, ExecError> {
        let command = format!("lctl get_param -n {}.nrs_tbf_rule", scope.service_param());
        let output = self.run(host, &command).await?;
        Ok(parse_rule_list(&output))
    }

    async fn start_rule(
        &self,
        host: &str,
        scope: Scope,
        name: &str,
        expression: &str,
        rate: u64,
    ) -> Result<(), ExecError> {
        // Stop any existing instance of the rule first so a start with new
        // parameters replaces rather than fails. A stop of a rule that does
        // not exist is expected to fail and is ignored.
        if let Err(e) = self.stop_rule(host, scope, name).await {
            slog::debug!(self.log, "failed to stop rule before start";
                "host" => host, "rule" => name, "error" => e.to_string());
        }

        let command = format!(
            "lctl set_param {}.nrs_tbf_rule='start {} {} rate={}'",
            scope.service_param(),
            name,
            expression,
            rate
        );
        self.run(host, &command).await?;
        Ok(())
    }

    async fn stop_rule(&self, host: &str, scope: Scope, name: &str) -> Result<(), ExecError> {
        let command = format!(
            "lctl set_param {}.nrs_tbf_rule='stop {}'",
            scope.service_param(),
            name
        );
        match self.run(host, &command).await {
            Ok(_) => Ok(()),
            // The server reports ENOENT for a rule that is not installed,
            // which counts as a successful stop.
            Err(ExecError::CommandError { status, .. }) if status == 2 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_scheduler_mode(
        &self,
        host: &str,
        scope: Scope,
        mode: SchedulerMode,
    ) -> Result<(), ExecError> {
        let command = format!(
            "lctl set_param {}.nrs_policies='{}'",
            scope.service_param(),
            mode.policy_arg()
        );
        self.run(host, &command).await?;
        Ok(())
    }

    async fn set_jobid_var(
        &self,
        host: &str,
        fsname: &str,
        value: &str,
    ) -> Result<(), ExecError> {
        let command = format!("lctl conf_param {}.sys.jobid_var={}", fsname, value);
        self.run(host, &command).await?;
        Ok(())
    }
}

// Rule lines in the nrs_tbf_rule output look like
//   uid_1001 {uid={1001}} 100, ref 0
// between section headers ("regular_requests:", "CPT 0:"). The built-in
// default rule is not controller-owned and is never reported.
fn parse_rule_list(output: &str) -> HashSet<String> {
    let mut rules = HashSet::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.ends_with(':') {
            continue;
        }
        if let Some((name, rest)) = line.split_once(' ') {
            if rest.trim_start().starts_with('{') && name != "default" {
                rules.insert(name.to_owned());
            }
        }
    }
    rules
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_list_parse() {
        let output = concat!(
            "regular_requests:\n",
            "CPT 0:\n",
            "default {*} 10000, ref 0\n",
            "uid_1001 {uid={1001}} 100, ref 2\n",
            "ldlm_enqueue {opcode={ldlm_enqueue}} 10000, ref 0\n",
            "high_priority_requests:\n",
            "CPT 0:\n",
            "uid_1001 {uid={1001}} 100, ref 0\n",
        );
        let rules = parse_rule_list(output);
        assert_eq!(rules.len(), 2);
        assert!(rules.contains("uid_1001"));
        assert!(rules.contains("ldlm_enqueue"));
    }

    #[test]
    fn test_rule_list_parse_empty() {
        assert!(parse_rule_list("").is_empty());
        assert!(parse_rule_list("regular_requests:\nCPT 0:\n").is_empty());
    }

    #[test]
    fn test_scope_service_params_differ() {
        assert_ne!(
            Scope::Data.service_param(),
            Scope::Metadata.service_param()
        );
    }
}
