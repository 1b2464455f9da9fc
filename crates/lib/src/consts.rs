/// Application name, used for directory and file naming.
pub const APP_NAME: &str = "chartpatch";

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "chartpatch.yaml";

/// Default inventory file name, relative to the config directory.
pub const INVENTORY_FILENAME: &str = "images.yaml";

/// Reserved top-level inventory key holding tag overrides.
pub const OVERRIDES_KEY: &str = "overrides";

/// Suffix appended to a source tag to form the patched tag.
pub const PATCHED_TAG_SUFFIX: &str = "patched";

/// Extension used for post-patch vulnerability reports.
pub const PATCHED_REPORT_SUFFIX: &str = ".patched.json";

/// Default timeout for registry probes, in seconds.
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 10;

/// Default OCI repository (below the target registry) for wrapper charts.
pub const DEFAULT_CHART_REPOSITORY: &str = "charts";
