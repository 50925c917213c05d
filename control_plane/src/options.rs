use getset::CopyGetters;
use std::time::Duration;
use typed_builder::TypedBuilder;

#[derive(Debug, TypedBuilder, CopyGetters, PartialEq, Eq)]
pub struct Options {
    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_secs(5 * 60))]
    controller_requeue_duration: Duration,

    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_secs(10 * 60))]
    readiness_timeout: Duration,

    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_secs(5))]
    readiness_poll_interval: Duration,

    #[getset(get_copy = "pub")]
    #[builder(default = 5)]
    conflict_retries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self::builder().build()
    }
}
