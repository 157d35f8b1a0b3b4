use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::{ExecError, HostExecutor, Scope, SchedulerMode};
use crate::fs::Filesystem;
use crate::usage::Uid;

/// A standing rule keeping lock enqueues serviceable while a user's metadata
/// rule is tight; installed alongside the first per-user metadata rule.
pub const LDLM_ENQUEUE_RULE: &str = "ldlm_enqueue";
pub const LDLM_ENQUEUE_EXPRESSION: &str = "opcode={ldlm_enqueue}";
pub const LDLM_ENQUEUE_RATE: u64 = 10000;

pub fn rule_name(uid: &str) -> String {
    format!("uid_{}", uid)
}

pub fn rule_expression(scope: Scope, uid: &str) -> String {
    match scope {
        Scope::Data => format!("uid={{{}}}", uid),
        // Metadata rules warn the client so interactive users can tell they
        // are being throttled.
        Scope::Metadata => format!("uid={{{}}} warning=1", uid),
    }
}

/// Switch every server of the scope to the given scheduling policy.
pub async fn enforce_scope_mode(
    executor: &dyn HostExecutor,
    fs: &Filesystem,
    scope: Scope,
    mode: SchedulerMode,
    log: &slog::Logger,
) -> Result<(), ExecError> {
    for host in fs.servers(scope) {
        slog::debug!(log, "switching scheduler mode";
            "host" => host.as_str(), "scope" => scope.to_string(), "mode" => format!("{:?}", mode));
        executor.set_scheduler_mode(host, scope, mode).await?;
    }
    Ok(())
}

/// The in-memory truth of which throttle rules this controller has installed
/// across the fleet, keyed by scope and UID.
pub struct RuleRegistry {
    executor: Arc<dyn HostExecutor>,
    fs: Arc<Filesystem>,
    installed: HashMap<Scope, HashMap<Uid, u64>>,
    standing_rule_installed: bool,
    log: slog::Logger,
}

impl RuleRegistry {
    pub fn new(executor: Arc<dyn HostExecutor>, fs: Arc<Filesystem>, log: slog::Logger) -> RuleRegistry {
        let mut installed = HashMap::new();
        installed.insert(Scope::Data, HashMap::new());
        installed.insert(Scope::Metadata, HashMap::new());
        RuleRegistry {
            executor,
            fs,
            installed,
            standing_rule_installed: false,
            log,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.installed.values().all(|entries| entries.is_empty())
    }

    pub fn throttled_uids(&self, scope: Scope) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.installed[&scope].keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Install the rule for `(scope, uid)` on every server of the scope and
    /// record it. A no-op when the identical rule is already recorded; a
    /// changed rate replaces the installed rule. The entry is only recorded
    /// once every server accepted it, so a partial failure is retried by the
    /// next cycle.
    pub async fn upsert(&mut self, scope: Scope, uid: &str, rate: u64) -> Result<(), ExecError> {
        if self.installed[&scope].get(uid) == Some(&rate) {
            return Ok(());
        }

        let name = rule_name(uid);
        let expression = rule_expression(scope, uid);
        for host in self.fs.servers(scope) {
            self.executor
                .start_rule(host, scope, &name, &expression, rate)
                .await?;
        }

        if scope == Scope::Metadata && !self.standing_rule_installed {
            for host in self.fs.servers(Scope::Metadata) {
                self.executor
                    .start_rule(
                        host,
                        Scope::Metadata,
                        LDLM_ENQUEUE_RULE,
                        LDLM_ENQUEUE_EXPRESSION,
                        LDLM_ENQUEUE_RATE,
                    )
                    .await?;
            }
            self.standing_rule_installed = true;
        }

        slog::info!(self.log, "installed throttle rule";
            "scope" => scope.to_string(), "uid" => uid, "rate" => rate);
        self.installed
            .get_mut(&scope)
            .expect("registry scopes are fixed at construction")
            .insert(uid.to_owned(), rate);
        Ok(())
    }

    /// Stop every controller-owned rule on every server and empty the
    /// registry. Bookkeeping is only dropped after the whole fleet has been
    /// cleared, so a failure part way leaves the registry primed to retry.
    pub async fn clear_all(&mut self) -> Result<(), ExecError> {
        slog::info!(self.log, "clearing all throttle rules");
        for scope in [Scope::Data, Scope::Metadata] {
            for host in self.fs.servers(scope) {
                let rules = self.executor.list_rules(host, scope).await?;
                let mut owned: Vec<String> = rules
                    .into_iter()
                    .filter(|name| name.starts_with("uid_") || name == LDLM_ENQUEUE_RULE)
                    .collect();
                owned.sort();
                for name in owned {
                    self.executor.stop_rule(host, scope, &name).await?;
                }
            }
        }

        for entries in self.installed.values_mut() {
            entries.clear();
        }
        self.standing_rule_installed = false;
        Ok(())
    }
}
