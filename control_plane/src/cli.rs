use crate::options::Options;
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::time::Duration;

#[derive(Parser, Getters, CopyGetters)]
#[command(
    about = "Keeps dogu ingresses and the CES load balancer in sync with the cluster",
    long_about = None
)]
pub struct Cli {
    #[getset(get = "pub")]
    #[arg(env = "NAMESPACE", long = "namespace")]
    namespace: String,

    #[getset(get = "pub")]
    #[arg(env = "POD_NAME", long = "pod-name")]
    pod_name: Option<String>,

    #[getset(get_copy = "pub")]
    #[arg(
        default_value = "600",
        env = "READINESS_TIMEOUT_SECS",
        long = "readiness-timeout-secs"
    )]
    readiness_timeout_secs: u64,

    #[getset(get_copy = "pub")]
    #[arg(
        default_value = "5",
        env = "READINESS_POLL_INTERVAL_SECS",
        long = "readiness-poll-interval-secs",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    readiness_poll_interval_secs: u64,
}

impl Cli {
    pub fn options(&self) -> Options {
        Options::builder()
            .readiness_timeout(Duration::from_secs(self.readiness_timeout_secs))
            .readiness_poll_interval(Duration::from_secs(self.readiness_poll_interval_secs))
            .build()
    }
}
