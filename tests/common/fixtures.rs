//! Shared fixtures for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared helpers under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/fixtures.rs"]
//! mod fixtures;
//! ```

use std::time::Duration;

use camino::Utf8PathBuf;
use stratus::test_support::sample_cluster;
use stratus::{ClusterConfig, Timings, Topology};
use tempfile::TempDir;

/// Sample cluster with millisecond timings so scenarios finish quickly.
pub fn fast_cluster(topology: Topology, containers: u32) -> ClusterConfig {
    let mut config = sample_cluster(topology, containers);
    config.timings = Timings {
        poll_interval: Duration::from_millis(1),
        infra_timeout: Duration::from_millis(200),
        service_timeout: Duration::from_millis(30),
        dependent_timeout: Duration::from_millis(30),
        seconds_per_attempt: 300,
    };
    config
}

/// UTF-8 path of a temporary directory.
pub fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()))
}
