// Retry policy for integration dispatch
//
// `retry_count` on an integration record counts failed attempts. A dispatch
// is exhausted once `retry_count` reaches `max_retries`, so a provider is
// called at most `max_retries` times per dispatch.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::IntegrationType;
use crate::utils::duration_ms_serde;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// Delay grows by `base_delay` per failure
    Linear,
    /// Delay doubles per failure
    #[default]
    Exponential,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Retry settings for one integration type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the dispatch is exhausted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay growth
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Delay after the first failure
    #[serde(rename = "base_delay_ms", default = "default_base_delay", with = "duration_ms_serde")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde(rename = "max_delay_ms", default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,
    /// Wall-clock limit for one provider call
    #[serde(rename = "attempt_timeout_ms", default = "default_attempt_timeout", with = "duration_ms_serde")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given number of failed attempts
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(failures),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Retry settings per integration type, falling back to a shared default
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryPolicies {
    /// Policy for types without an override
    #[serde(default)]
    pub default: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docusign: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_check: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_search: Option<RetryPolicy>,
}

impl RetryPolicies {
    /// Use one policy for every integration type
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            default: policy,
            ..Self::default()
        }
    }

    /// Effective policy for an integration type
    pub fn for_type(&self, integration_type: IntegrationType) -> &RetryPolicy {
        let specific = match integration_type {
            IntegrationType::Docusign => self.docusign.as_ref(),
            IntegrationType::BackgroundCheck => self.background_check.as_ref(),
            IntegrationType::DocSearch => self.doc_search.as_ref(),
        };
        specific.unwrap_or(&self.default)
    }

    /// Override the policy for one integration type
    pub fn set(&mut self, integration_type: IntegrationType, policy: RetryPolicy) {
        let slot = match integration_type {
            IntegrationType::Docusign => &mut self.docusign,
            IntegrationType::BackgroundCheck => &mut self.background_check,
            IntegrationType::DocSearch => &mut self.doc_search,
        };
        *slot = Some(policy);
    }

    /// Every effective policy, paired with its type
    pub fn iter(&self) -> impl Iterator<Item = (IntegrationType, &RetryPolicy)> + '_ {
        IntegrationType::ALL
            .into_iter()
            .map(move |integration_type| (integration_type, self.for_type(integration_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let mut policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));

        policy.backoff = BackoffStrategy::Fixed;
        assert_eq!(policy.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_per_type_override() {
        let mut policies = RetryPolicies::default();
        policies.set(
            IntegrationType::BackgroundCheck,
            RetryPolicy {
                max_retries: 5,
                ..RetryPolicy::default()
            },
        );
        assert_eq!(policies.for_type(IntegrationType::BackgroundCheck).max_retries, 5);
        assert_eq!(policies.for_type(IntegrationType::Docusign).max_retries, 3);
        assert_eq!(policies.iter().count(), 3);
    }

    #[test]
    fn test_policy_from_toml() {
        let policies: RetryPolicies = toml::from_str(
            r#"
[default]
max_retries = 4
base_delay_ms = 200

[doc_search]
backoff = "fixed"
attempt_timeout_ms = 1000
"#,
        )
        .unwrap();
        assert_eq!(policies.default.max_retries, 4);
        assert_eq!(policies.default.base_delay, Duration::from_millis(200));
        let doc_search = policies.for_type(IntegrationType::DocSearch);
        assert_eq!(doc_search.backoff, BackoffStrategy::Fixed);
        assert_eq!(doc_search.attempt_timeout, Duration::from_secs(1));
        assert_eq!(doc_search.max_retries, 3);
    }
}
