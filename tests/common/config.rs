//! Test configuration helpers for pointing a harvester at a mock tenant or a live one

use qualer_dl::config::OutputTarget;
use qualer_dl::{Config, Credential, Harvester};
use std::path::Path;
use std::time::Duration;

use super::tenant::{PASSWORD, USERNAME};

/// Configuration for a tenant at `base_url` writing CSV files under `out`
pub fn tenant_config(base_url: &str, out: &Path) -> Config {
    let mut config = Config {
        base_url: base_url.to_string(),
        ..Default::default()
    };
    config.retry.initial_delay = Duration::from_millis(10);
    config.http.navigation_timeout = Duration::from_secs(5);
    config.fanout.workers = 4;
    config.output.csv_dir = out.join("csv");
    config.output.database_path = out.join("qualer.db");
    config
}

/// Same as [`tenant_config`], writing to the SQLite database instead
pub fn tenant_db_config(base_url: &str, out: &Path) -> Config {
    let mut config = tenant_config(base_url, out);
    config.output.target = OutputTarget::Database;
    config
}

/// Credential the mock tenant accepts
pub fn good_credential() -> Credential {
    Credential::new(USERNAME, PASSWORD)
}

/// Harvester over HTTP
pub fn harvester(config: Config, credential: Credential) -> Harvester {
    Harvester::connect(config, credential).unwrap()
}

/// Whether a real tenant's credentials are available (`QUALER_USERNAME`/`QUALER_PASSWORD`)
pub fn has_live_credentials() -> bool {
    dotenvy::dotenv().ok();
    std::env::var("QUALER_USERNAME").is_ok() && std::env::var("QUALER_PASSWORD").is_ok()
}
