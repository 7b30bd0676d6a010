//! Crawler tuning knobs.

use serde::Deserialize;

/// Pacing configuration for the sweep loop.
///
/// The worker processes `crawls_per_sleep` items, then releases the
/// crawler mutex and naps `sleep_us` microseconds so request handlers
/// and control callers are never starved. A zero `sleep_us` swaps the
/// nap for a bare mutex cycle, yielding to waiters without delay.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlerSettings {
    /// Microseconds to sleep between item batches; 0 = yield only.
    #[serde(default = "default_sleep_us")]
    pub sleep_us: u32,

    /// Items to process per sleep.
    #[serde(default = "default_crawls_per_sleep")]
    pub crawls_per_sleep: u32,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            sleep_us: default_sleep_us(),
            crawls_per_sleep: default_crawls_per_sleep(),
        }
    }
}

fn default_sleep_us() -> u32 {
    100
}

fn default_crawls_per_sleep() -> u32 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CrawlerSettings::default();
        assert_eq!(settings.sleep_us, 100);
        assert_eq!(settings.crawls_per_sleep, 1000);
    }

    #[test]
    fn test_toml_partial() {
        let settings: CrawlerSettings = toml::from_str("sleep_us = 500").unwrap();
        assert_eq!(settings.sleep_us, 500);
        assert_eq!(settings.crawls_per_sleep, 1000);
    }

    #[test]
    fn test_toml_rejects_unknown_fields() {
        assert!(toml::from_str::<CrawlerSettings>("napping = 3").is_err());
    }
}
