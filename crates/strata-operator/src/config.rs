//! Command-line and environment configuration

use std::time::Duration;

use clap::Args;

use strata_cluster::ReconcilerConfig;

/// Operator settings; every flag can also come from the environment
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch; empty or unset watches all namespaces
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Requeue delay while a HelmRepository or HelmRelease is not ready
    #[arg(
        long,
        env = "REQUEUE_DEPENDENCIES",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub requeue_dependencies: Duration,

    /// Deadline for a single reconcile pass
    #[arg(
        long,
        env = "RECONCILE_TIMEOUT",
        default_value = "2m",
        value_parser = humantime::parse_duration
    )]
    pub reconcile_timeout: Duration,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Do not apply the DataCluster CRD on startup
    #[arg(long, env = "SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,
}

impl OperatorConfig {
    /// Namespace to scope the watch to, `None` for cluster-wide
    pub fn watch_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            requeue_dependencies: self.requeue_dependencies,
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let argv = std::iter::once("strata-operator").chain(args.iter().copied());
        TestCli::try_parse_from(argv).expect("valid arguments").config
    }

    #[test]
    fn defaults_match_reconciler_defaults() {
        let config = parse(&[]);
        assert_eq!(config.to_reconciler_config(), ReconcilerConfig::default());
        assert!(!config.log_json);
        assert!(!config.skip_crd_install);
    }

    #[rstest]
    #[case(&["--requeue-dependencies", "30s"], Duration::from_secs(30))]
    #[case(&["--requeue-dependencies", "1m 30s"], Duration::from_secs(90))]
    #[case(&["--requeue-dependencies=500ms"], Duration::from_millis(500))]
    fn requeue_accepts_humantime(#[case] args: &[&str], #[case] expected: Duration) {
        assert_eq!(parse(args).to_reconciler_config().requeue_dependencies, expected);
    }

    #[test]
    fn timeout_flag_overrides_default() {
        let config = parse(&["--reconcile-timeout", "5m"]);
        assert_eq!(config.reconcile_timeout, Duration::from_secs(300));
    }

    #[test]
    fn malformed_duration_is_rejected() {
        let result = TestCli::try_parse_from(["strata-operator", "--reconcile-timeout", "soon"]);
        assert!(result.is_err());
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&["--namespace", ""], None)]
    #[case(&["--namespace", "data"], Some("data"))]
    fn empty_namespace_means_cluster_wide(#[case] args: &[&str], #[case] expected: Option<&str>) {
        assert_eq!(parse(args).watch_namespace(), expected);
    }
}
