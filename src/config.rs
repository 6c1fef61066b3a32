use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleTier {
    pub min_students: u64,
    pub interval_secs: i64,
}

/// Size-tiered recalculation policy. Larger courses tolerate recomputation less often.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    /// Courses with fewer students than this are never throttled.
    pub floor: u64,
    /// Throttled dispatches are rescheduled to `last_run + 4 * base_interval_secs`.
    pub base_interval_secs: i64,
    pub tiers: Vec<ThrottleTier>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            floor: 500,
            base_interval_secs: 3600,
            tiers: vec![
                ThrottleTier {
                    min_students: 500,
                    interval_secs: 3600,
                },
                ThrottleTier {
                    min_students: 2500,
                    interval_secs: 7200,
                },
            ],
        }
    }
}

impl ThrottlePolicy {
    /// Minimum seconds between runs for a course of this size, if any applies.
    pub fn interval_for(&self, students: u64) -> Option<i64> {
        if students < self.floor {
            return None;
        }

        self.tiers
            .iter()
            .rev()
            .find(|tier| students >= tier.min_students)
            .map(|tier| tier.interval_secs)
            .or(Some(self.base_interval_secs))
    }

    pub fn reschedule_delay_secs(&self) -> i64 {
        self.base_interval_secs * 4
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_interval_secs <= 0 {
            return Err(ProcessorError::Config(
                "throttle.base_interval_secs must be positive".to_string(),
            ));
        }

        // A throttled dispatch retries at `last_run + 4 * base`; a longer window
        // would still be open at that point.
        let retry_delay = self.reschedule_delay_secs();
        if let Some(tier) = self
            .tiers
            .iter()
            .find(|tier| tier.interval_secs >= retry_delay)
        {
            return Err(ProcessorError::Config(format!(
                "throttle tier for {} students must be shorter than {retry_delay}s",
                tier.min_students
            )));
        }

        for pair in self.tiers.windows(2) {
            if pair[0].min_students >= pair[1].min_students {
                return Err(ProcessorError::Config(
                    "throttle tiers must be sorted by ascending min_students".to_string(),
                ));
            }
            if pair[0].interval_secs > pair[1].interval_secs {
                return Err(ProcessorError::Config(
                    "throttle tier intervals must not shrink as courses grow".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub per_page: u32,
    /// Record processor messages in the in-process log sink.
    pub processors_debug: bool,
    pub worker_poll_secs: u64,
    pub throttle: ThrottlePolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            per_page: 50,
            processors_debug: false,
            worker_poll_secs: 5,
            throttle: ThrottlePolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str::<ProcessorConfig>(&raw)?
            }
            None => ProcessorConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_page == 0 {
            return Err(ProcessorError::Config(
                "per_page must be at least 1".to_string(),
            ));
        }
        self.throttle.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_follow_expected_tiers() {
        let policy = ThrottlePolicy::default();
        assert_eq!(policy.interval_for(25), None);
        assert_eq!(policy.interval_for(499), None);
        assert_eq!(policy.interval_for(500), Some(3600));
        assert_eq!(policy.interval_for(2499), Some(3600));
        assert_eq!(policy.interval_for(2500), Some(7200));
    }

    #[test]
    fn floor_below_first_tier_uses_base_interval() {
        let policy = ThrottlePolicy {
            floor: 1,
            ..ThrottlePolicy::default()
        };
        assert_eq!(policy.interval_for(2), Some(3600));
        assert_eq!(policy.reschedule_delay_secs(), 4 * 3600);
    }

    #[test]
    fn rejects_unsorted_tiers() {
        let policy = ThrottlePolicy {
            tiers: vec![
                ThrottleTier {
                    min_students: 2500,
                    interval_secs: 7200,
                },
                ThrottleTier {
                    min_students: 500,
                    interval_secs: 3600,
                },
            ],
            ..ThrottlePolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn rejects_tier_outlasting_retry_delay() {
        let policy = ThrottlePolicy {
            floor: 1,
            base_interval_secs: 3600,
            tiers: vec![ThrottleTier {
                min_students: 1,
                interval_secs: 4 * 3600,
            }],
        };
        assert!(policy.validate().is_err());

        let policy = ThrottlePolicy {
            tiers: vec![ThrottleTier {
                min_students: 1,
                interval_secs: 4 * 3600 - 1,
            }],
            ..policy
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: ProcessorConfig = serde_json::from_str(r#"{"per_page": 2}"#).unwrap();
        assert_eq!(config.per_page, 2);
        assert_eq!(config.throttle, ThrottlePolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_per_page_is_invalid() {
        let config = ProcessorConfig {
            per_page: 0,
            ..ProcessorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
