// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dynamic memory client configuration.

use hyperv_dm_protocol as protocol;
use std::time::Duration;
use thiserror::Error;

/// Disables or enables the client: `HV_DM=off` or `HV_DM=on`.
const ENABLE: &str = "HV_DM=";

/// Status report interval in milliseconds. Zero is ignored.
const STATUS_INTERVAL_MS: &str = "HV_DM_STATUS_INTERVAL_MS=";

/// Reserved floor in megabytes.
const FLOOR_MB: &str = "HV_DM_FLOOR_MB=";

/// Inflation batch ceiling in pages. Zero is ignored.
const BATCH_PAGES: &str = "HV_DM_BATCH_PAGES=";

/// Attempts per inflation batch send, or `unlimited`.
const SEND_RETRIES: &str = "HV_DM_SEND_RETRIES=";

/// How a failed inflation batch send is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRetryPolicy {
    /// Total attempts before giving up, or `None` to retry forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl SendRetryPolicy {
    /// Returns the delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }

    /// Returns whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicMemoryConfig {
    pub enabled: bool,
    pub status_interval: Duration,
    /// Pages never surrendered to the host.
    pub reserved_floor_pages: u64,
    /// Most pages reported in a single inflation response.
    pub inflation_batch_pages: u32,
    /// How long a setup request waits for its response.
    pub transaction_timeout: Duration,
    pub send_retry: SendRetryPolicy,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    /// Largest packet sent or received.
    pub max_packet_size: usize,
}

impl Default for DynamicMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            status_interval: Duration::from_millis(protocol::STATUS_REPORT_INTERVAL_MS),
            reserved_floor_pages: protocol::RESERVED_FLOOR_PAGES,
            inflation_batch_pages: protocol::INFLATION_BATCH_PAGES,
            transaction_timeout: Duration::from_secs(5),
            send_retry: SendRetryPolicy::default(),
            send_buffer_size: protocol::CHANNEL_BUFFER_SIZE,
            recv_buffer_size: protocol::CHANNEL_BUFFER_SIZE,
            max_packet_size: protocol::MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("status interval must be non-zero")]
    ZeroStatusInterval,
    #[error("inflation batch must be at least one page")]
    EmptyBatch,
    #[error("inflation batch of {batch} pages does not fit in {max_ranges} ranges")]
    BatchTooLarge { batch: u32, max_ranges: usize },
}

impl DynamicMemoryConfig {
    /// Applies overrides from a kernel-style command line.
    ///
    /// Unknown arguments and malformed values are ignored.
    pub fn parse(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            let Some((name, value)) = arg.split_once('=') else {
                continue;
            };
            // Names are matched with their trailing `=`.
            let name = &arg[..name.len() + 1];
            match name {
                ENABLE => match value {
                    "off" | "0" => self.enabled = false,
                    "on" | "1" => self.enabled = true,
                    _ => {}
                },
                STATUS_INTERVAL_MS => {
                    if let Some(ms) = value.parse::<u64>().ok().filter(|&ms| ms != 0) {
                        self.status_interval = Duration::from_millis(ms);
                    }
                }
                FLOOR_MB => {
                    if let Ok(mb) = value.parse::<u64>() {
                        self.reserved_floor_pages =
                            mb.saturating_mul(1024 * 1024) / protocol::PAGE_SIZE as u64;
                    }
                }
                BATCH_PAGES => {
                    if let Some(pages) = value.parse::<u32>().ok().filter(|&p| p != 0) {
                        self.inflation_batch_pages = pages;
                    }
                }
                SEND_RETRIES => {
                    if value == "unlimited" {
                        self.send_retry.max_attempts = None;
                    } else if let Some(n) = value.parse::<u32>().ok().filter(|&n| n != 0) {
                        self.send_retry.max_attempts = Some(n);
                    }
                }
                _ => {}
            }
        }
    }

    /// Checks that the configuration can be used to drive the protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_interval.is_zero() {
            return Err(ConfigError::ZeroStatusInterval);
        }
        if self.inflation_batch_pages == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        let max_ranges = protocol::max_ranges_per_message(self.max_packet_size)
            .min(protocol::MAX_RANGE_COUNT as usize);
        if self.inflation_batch_pages as usize > max_ranges {
            return Err(ConfigError::BatchTooLarge {
                batch: self.inflation_batch_pages,
                max_ranges,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(cmdline: &str) -> DynamicMemoryConfig {
        let mut config = DynamicMemoryConfig::default();
        config.parse(cmdline);
        config
    }

    #[test]
    fn defaults_match_protocol() {
        let config = DynamicMemoryConfig::default();
        assert_eq!(config.status_interval, Duration::from_secs(1));
        assert_eq!(config.reserved_floor_pages, 131072);
        assert_eq!(config.inflation_batch_pages, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_enable_parsing() {
        assert!(!parse("quiet HV_DM=off").enabled);
        assert!(parse("HV_DM=off HV_DM=on").enabled);
        assert!(parse("HV_DM=maybe").enabled);
    }

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(
            parse("HV_DM_STATUS_INTERVAL_MS=250").status_interval,
            Duration::from_millis(250)
        );
        assert_eq!(
            parse("HV_DM_STATUS_INTERVAL_MS=0").status_interval,
            Duration::from_secs(1)
        );
        assert_eq!(parse("HV_DM_FLOOR_MB=4").reserved_floor_pages, 1024);
        assert_eq!(parse("HV_DM_FLOOR_MB=x").reserved_floor_pages, 131072);
        assert_eq!(parse("HV_DM_BATCH_PAGES=16").inflation_batch_pages, 16);
        assert_eq!(parse("HV_DM_BATCH_PAGES=0").inflation_batch_pages, 256);
    }

    #[test]
    fn test_retry_parsing() {
        assert_eq!(
            parse("HV_DM_SEND_RETRIES=unlimited").send_retry.max_attempts,
            None
        );
        assert_eq!(
            parse("HV_DM_SEND_RETRIES=3").send_retry.max_attempts,
            Some(3)
        );
        assert_eq!(
            parse("HV_DM_SEND_RETRIES=0").send_retry.max_attempts,
            Some(10)
        );
    }

    #[test]
    fn validation() {
        let mut config = DynamicMemoryConfig {
            inflation_batch_pages: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyBatch));

        config.inflation_batch_pages = 2000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BatchTooLarge { batch: 2000, .. })
        ));

        config.max_packet_size = 64 * 1024;
        config.validate().unwrap();

        config.status_interval = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroStatusInterval));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let policy = SendRetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(8), Duration::from_secs(1));
        assert_eq!(policy.backoff(100), Duration::from_secs(1));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
        let unlimited = SendRetryPolicy {
            max_attempts: None,
            ..policy
        };
        assert!(unlimited.should_retry(u32::MAX));
    }
}
