use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, de};

use resource_cache::{Resource, ResourceCache, ResourceFetch};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct inputs the workload picks from.
    pub keys: u64,
    /// How long every fetch takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of fetches that fail, between `0` and `1`.
    #[serde(default, deserialize_with = "deserialize_failure_rate")]
    pub failure_rate: f64,
}

fn deserialize_failure_rate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let rate = f64::deserialize(deserializer)?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(de::Error::custom(format_args!(
            "failure_rate must be between 0 and 1, got {rate}"
        )));
    }
    Ok(rate)
}

/// A fetch that sleeps for a fixed latency and fails at random.
pub struct SyntheticFetch {
    latency: Duration,
    failure_rate: f64,
    fetches: Arc<AtomicUsize>,
}

impl ResourceFetch for SyntheticFetch {
    type Input = u64;
    type Output = Arc<str>;
    type Error = Arc<str>;

    fn fetch(&self, input: u64) -> BoxFuture<'static, Result<Arc<str>, Arc<str>>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency;
        let fail = rand::rng().random_bool(self.failure_rate);

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                Err(format!("synthetic failure for {input}").into())
            } else {
                Ok(format!("value {input}").into())
            }
        }
        .boxed()
    }
}

/// A workload ready to run against a cache.
pub struct ParsedWorkload {
    pub concurrency: usize,
    keys: u64,
    resource: Resource<SyntheticFetch>,
    fetches: Arc<AtomicUsize>,
}

impl ParsedWorkload {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

pub fn prepare_workload(index: usize, workload: Workload) -> ParsedWorkload {
    let fetches = Arc::new(AtomicUsize::new(0));
    let fetch = SyntheticFetch {
        latency: workload.latency,
        failure_rate: workload.failure_rate,
        fetches: Arc::clone(&fetches),
    };

    ParsedWorkload {
        concurrency: workload.concurrency,
        keys: workload.keys.max(1),
        resource: Resource::new(format!("workload-{index}"), fetch),
        fetches,
    }
}

/// Reads one random input, holding a lease on its entry while waiting.
///
/// Returns whether the read produced a value.
pub async fn process_workload(cache: &ResourceCache, workload: &ParsedWorkload) -> bool {
    let input = rand::rng().random_range(0..workload.keys);

    let lease = match cache.lease(&workload.resource, input) {
        Ok(lease) => lease,
        Err(err) => {
            tracing::error!(error = %err, "failed to lease entry");
            return false;
        }
    };
    let result = cache.get(&workload.resource, input).await;
    drop(lease);

    result.is_ok()
}
