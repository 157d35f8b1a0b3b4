use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod controller;
mod executor;
mod fs;
mod metrics;
mod policy;
mod registry;
mod usage;
mod window;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "decayqos",
    about = "A decay QoS controller for parallel filesystems."
)]
struct Opt {
    /// The path of the configuration file.
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/decayqos/config.yml"
    )]
    config: std::path::PathBuf,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

mod config {
    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub fs_name: String,
        pub mgs_host: String,
        pub oss_hosts: Vec<String>,
        pub mds_hosts: Vec<String>,
        pub metrics_server: String,
        #[serde(with = "humantime_serde")]
        pub interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub metrics_collect_interval: std::time::Duration,
        #[serde(default, with = "humantime_serde")]
        pub query_timeout: Option<std::time::Duration>,
        pub mbps_threshold: u64,
        pub throttled_oss_rpc_rate: u64,
        pub iops_threshold: u64,
        pub throttled_mds_rpc_rate: u64,
        pub enabled: bool,
        #[serde(default)]
        pub users: Vec<V1User>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1User {
        pub uid: String,
        pub mbps_threshold: u64,
        pub throttled_oss_rpc_rate: u64,
        pub iops_threshold: u64,
        pub throttled_mds_rpc_rate: u64,
    }

    // An internal configuration structure used by the rest of the program that
    // can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub fs_name: String,
        pub mgs_host: String,
        pub oss_hosts: Vec<String>,
        pub mds_hosts: Vec<String>,
        pub metrics_server: String,
        pub interval: std::time::Duration,
        pub metrics_collect_interval: std::time::Duration,
        pub query_timeout: std::time::Duration,
        pub enabled: bool,
        pub policy: crate::policy::QosPolicy,
    }
}

fn internal_config(parsed: config::V1) -> config::Internal {
    let default_user = policy::QosUser {
        uid: "default".to_owned(),
        mbps_threshold: parsed.mbps_threshold,
        throttled_oss_rpc_rate: parsed.throttled_oss_rpc_rate,
        iops_threshold: parsed.iops_threshold,
        throttled_mds_rpc_rate: parsed.throttled_mds_rpc_rate,
    };
    let mut users = HashMap::new();
    for user in parsed.users {
        users.insert(
            user.uid.clone(),
            policy::QosUser {
                uid: user.uid,
                mbps_threshold: user.mbps_threshold,
                throttled_oss_rpc_rate: user.throttled_oss_rpc_rate,
                iops_threshold: user.iops_threshold,
                throttled_mds_rpc_rate: user.throttled_mds_rpc_rate,
            },
        );
    }

    // A hung query must never outlive the window it was issued for.
    let query_timeout = parsed.query_timeout.unwrap_or_else(|| {
        parsed
            .interval
            .checked_sub(std::time::Duration::from_secs(1))
            .unwrap_or(parsed.interval)
    });

    config::Internal {
        fs_name: parsed.fs_name,
        mgs_host: parsed.mgs_host,
        oss_hosts: parsed.oss_hosts,
        mds_hosts: parsed.mds_hosts,
        metrics_server: parsed.metrics_server,
        interval: parsed.interval,
        metrics_collect_interval: parsed.metrics_collect_interval,
        query_timeout,
        enabled: parsed.enabled,
        policy: policy::QosPolicy {
            users,
            default_user,
            window_length: parsed.interval,
            collect_interval: parsed.metrics_collect_interval,
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    // Parse input arguments
    let opt = Opt::from_args();

    // Setup slog terminal logging
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let mut log_level = Level::Info;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    );

    slog::info!(root_log, "Arguments {:?}", opt);

    // Read the configuration file
    let config_string =
        std::fs::read_to_string(opt.config).context("Failed to read config file")?;
    let parsed_config_version: config::Version = serde_yaml::from_str(&config_string)
        .context("Failed to extract version from config file")?;
    slog::debug!(
        root_log,
        "Parsed the config version {:?}",
        parsed_config_version
    );
    let config_version = parsed_config_version.version.unwrap_or(1);

    let config = match config_version {
        1 => {
            let parsed_config: config::V1 =
                serde_yaml::from_str(&config_string).context("Failed to parse config")?;
            slog::debug!(root_log, "Parsed config {:?}", parsed_config);
            internal_config(parsed_config)
        }
        _ => {
            slog::error!(
                root_log,
                "Unsupported configuration version '{}' specified",
                config_version
            );
            anyhow::bail!("Unsupported configuration version specified");
        }
    };

    slog::info!(root_log, "Managing file system";
        "fs" => config.fs_name.as_str(),
        "window_length_seconds" => config.interval.as_secs(),
        "metrics_collect_interval_seconds" => config.metrics_collect_interval.as_secs(),
        "oss_count" => config.oss_hosts.len(),
        "mds_count" => config.mds_hosts.len());

    // Create the filesystem handle, remote command, and metrics subsystems.
    let filesystem = Arc::new(fs::Filesystem::new(
        config.fs_name.clone(),
        config.mgs_host.clone(),
        config.oss_hosts.clone(),
        config.mds_hosts.clone(),
    ));

    let host_executor = Arc::new(executor::SshExecutor::new(
        root_log.new(o!("subsystem" => "host_executor")),
    ));

    let metrics_client = Arc::new(
        metrics::InfluxdbClient::new(
            &config.metrics_server,
            metrics::METRICS_DATABASE_NAME,
            config.query_timeout,
            root_log.new(o!("subsystem" => "metrics_client")),
        )
        .context("Failed to create the metrics client")?,
    );

    let qos = controller::DecayQos::new(
        filesystem,
        host_executor,
        metrics_client,
        config.policy.clone(),
        config.metrics_server.clone(),
        root_log.new(o!("subsystem" => "qos", "fs" => config.fs_name.clone())),
    )
    .context("Failed to attach the QoS controller")?;

    slog::debug!(root_log, "QoS configuration {}", qos.encode(true, false));

    if config.enabled {
        if let Err(e) = qos.enable().await {
            slog::error!(root_log, "Failed to enable QoS at boot, leaving it disabled";
                "error" => e.to_string());
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    let status = qos.status();
    slog::info!(root_log, "Interrupt received, disabling QoS";
        "lifecycle" => status.lifecycle.to_string(),
        "throttled_data_users" => status.throttled_data_uids.len(),
        "throttled_metadata_users" => status.throttled_metadata_uids.len());

    if let Err(e) = qos.disable().await {
        slog::error!(root_log, "Failed to cleanly disable QoS"; "error" => e.to_string());
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_FIXTURE: &str = r#"
version: 1
fsName: lfs0
mgsHost: mgs0.cluster
ossHosts:
  - oss0.cluster
  - oss1.cluster
mdsHosts:
  - mds0.cluster
metricsServer: esmon0.cluster
interval: 1m
metricsCollectInterval: 1s
mbpsThreshold: 100
throttledOssRpcRate: 10
iopsThreshold: 1000
throttledMdsRpcRate: 5
enabled: true
users:
  - uid: "1001"
    mbpsThreshold: 500
    throttledOssRpcRate: 50
    iopsThreshold: 10000
    throttledMdsRpcRate: 50
"#;

    #[test]
    fn test_config_parse() {
        let parsed: config::V1 = serde_yaml::from_str(CONFIG_FIXTURE).unwrap();
        let config = internal_config(parsed);

        assert_eq!(config.fs_name, "lfs0");
        assert_eq!(config.oss_hosts.len(), 2);
        assert_eq!(config.interval, std::time::Duration::from_secs(60));
        // The default query timeout leaves one second of margin before the
        // next roll-over.
        assert_eq!(config.query_timeout, std::time::Duration::from_secs(59));
        assert!(config.enabled);

        let user = config.policy.user_for("1001");
        assert_eq!(user.mbps_threshold, 500);
        let fallback = config.policy.user_for("9999");
        assert_eq!(fallback.mbps_threshold, 100);
        assert_eq!(fallback.throttled_mds_rpc_rate, 5);
    }

    #[test]
    fn test_config_version_detection() {
        let version: config::Version = serde_yaml::from_str(CONFIG_FIXTURE).unwrap();
        assert_eq!(version.version, Some(1));
        let version: config::Version = serde_yaml::from_str("fsName: lfs0").unwrap();
        assert_eq!(version.version, None);
    }

    #[test]
    fn test_explicit_query_timeout_wins() {
        let fixture = CONFIG_FIXTURE.replace("enabled: true", "enabled: true\nqueryTimeout: 10s");
        let parsed: config::V1 = serde_yaml::from_str(&fixture).unwrap();
        let config = internal_config(parsed);
        assert_eq!(config.query_timeout, std::time::Duration::from_secs(10));
    }
}
