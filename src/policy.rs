use std::collections::HashMap;
use std::time::Duration;

use crate::executor::Scope;
use crate::usage::{ScopeUsage, Uid};

const MIB: u64 = 1_048_576;

/// The per-user budget and throttle configuration. Thresholds are rates; the
/// budget for one window is the threshold times the window length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosUser {
    pub uid: Uid,
    pub mbps_threshold: u64,
    pub throttled_oss_rpc_rate: u64,
    pub iops_threshold: u64,
    pub throttled_mds_rpc_rate: u64,
}

impl QosUser {
    pub fn throughput_budget_bytes(&self, window_length: Duration) -> u64 {
        self.mbps_threshold * MIB * window_length.as_secs()
    }

    pub fn metadata_budget_ops(&self, window_length: Duration) -> u64 {
        self.iops_threshold * window_length.as_secs()
    }

    /// The encoded form used by the admin protocol: the ordered option names
    /// when neither status nor structure is requested, the concrete values
    /// otherwise.
    pub fn encode(&self, need_status: bool, need_structure: bool) -> serde_json::Value {
        if !need_structure && !need_status {
            serde_json::json!([
                "uid",
                "mbps_threshold",
                "throttled_oss_rpc_rate",
                "iops_threshold",
                "throttled_mds_rpc_rate",
            ])
        } else {
            serde_json::json!({
                "uid": self.uid,
                "mbps_threshold": self.mbps_threshold,
                "throttled_oss_rpc_rate": self.throttled_oss_rpc_rate,
                "iops_threshold": self.iops_threshold,
                "throttled_mds_rpc_rate": self.throttled_mds_rpc_rate,
            })
        }
    }
}

/// The admission configuration of one filesystem: explicitly configured
/// users, the fallback for everyone else, and the window timing.
#[derive(Debug, Clone)]
pub struct QosPolicy {
    pub users: HashMap<Uid, QosUser>,
    pub default_user: QosUser,
    pub window_length: Duration,
    pub collect_interval: Duration,
}

impl QosPolicy {
    pub fn user_for(&self, uid: &str) -> &QosUser {
        self.users.get(uid).unwrap_or(&self.default_user)
    }
}

/// A single throttle to install: the UID's requests in the scope are limited
/// to the given RPC rate on every server of the scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub scope: Scope,
    pub uid: Uid,
    pub rate: u64,
    pub used: u64,
    pub budget: u64,
}

/// Map the accumulated usage of one scope onto throttle decisions. Pure and
/// deterministic; decisions come out in UID sort order. The budget is
/// inclusive: usage equal to the budget passes.
pub fn admit(scope: Scope, usage: &ScopeUsage, policy: &QosPolicy) -> Vec<ThrottleDecision> {
    let mut decisions = Vec::new();
    for (uid, accumulated) in &usage.totals {
        let user = policy.user_for(uid);
        let (budget, rate) = match scope {
            Scope::Data => (
                user.throughput_budget_bytes(policy.window_length),
                user.throttled_oss_rpc_rate,
            ),
            Scope::Metadata => (
                user.metadata_budget_ops(policy.window_length),
                user.throttled_mds_rpc_rate,
            ),
        };
        if *accumulated > budget {
            decisions.push(ThrottleDecision {
                scope,
                uid: uid.clone(),
                rate,
                used: *accumulated,
                budget,
            });
        }
    }
    decisions
}
