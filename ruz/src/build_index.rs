use clap::Args;
use groups::{BuildError, BuildReport, IndexBuilder, Resolution, ScheduleWindow, SnapshotStore};
use http::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use shared::upstream::{RetryPolicy, UpstreamClient};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const USER_AGENT_VALUE: &str = "ruz-indexer/1.0";

#[derive(Args, Debug, Clone, PartialEq)]
pub struct BuildIndexArgs {
    /// RUZ base URL
    #[arg(long, default_value = "https://ruz.fa.ru")]
    pub ruz_base: Url,
    /// Output JSON file
    #[arg(long, default_value = "groups_index.json")]
    pub out: PathBuf,
    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 20)]
    pub timeout: u64,
    /// Attempts per request
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// Resolve duplicate labels by checking which id has a schedule
    #[arg(long)]
    pub validate: bool,
    /// Validation window length in weeks
    #[arg(long, default_value_t = 2)]
    pub weeks: u32,
    /// Seconds to sleep between validation requests
    #[arg(long, default_value_t = 0.1)]
    pub throttle: f64,
}

impl BuildIndexArgs {
    fn resolution(&self) -> Resolution {
        if !self.validate {
            return Resolution::Fast;
        }
        Resolution::Validated {
            window: ScheduleWindow::current(self.weeks),
            throttle: Duration::try_from_secs_f64(self.throttle).unwrap_or_default(),
        }
    }
}

/// Headers the dictionary endpoint expects from a browser-like client.
fn indexer_headers(ruz_base: &Url) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let referer = format!("{}/ruz/", ruz_base.as_str().trim_end_matches('/'));
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(REFERER, value);
    }
    let origin = ruz_base.origin().ascii_serialization();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(ORIGIN, value);
    }
    headers
}

pub async fn build_index(args: &BuildIndexArgs) -> Result<BuildReport, BuildError> {
    let client = UpstreamClient::new(
        Duration::from_secs(args.timeout),
        RetryPolicy::batch(args.retries),
        indexer_headers(&args.ruz_base),
    )?;

    let builder = IndexBuilder::new(client, args.ruz_base.clone(), args.resolution());
    builder.build_and_store(&SnapshotStore::new(&args.out)).await
}

/// Process exit code for a failed build: 2 when the dictionary could not be
/// fetched, 1 for anything else.
pub fn exit_code(err: &BuildError) -> i32 {
    match err {
        BuildError::Fetch(_) => 2,
        BuildError::Snapshot(_) => 1,
    }
}
