//! Queue-manager option set: parsing, per-queue overrides, composition,
//! and canonicalization.
//!
//! Recognized keys: `queues` (space-separated names), `queue-policy`,
//! `queue-params`, `policy-params`, and their `-per-queue` variants in
//! the form `q1:val q2:val`. An option source of higher precedence is
//! composed over a lower one key by key. After `canonicalize`, every
//! queue has a complete property set (inheriting unset properties from
//! the top level), and an empty configuration yields one `default` queue.

use std::collections::BTreeMap;

use errors::ErrorMetadata;
use qpolicy::PolicyKind;
use serde_json::json;

pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Properties of one queue; `None` means "not explicitly set".
#[derive(Clone, Debug, Default)]
pub struct QueueProp {
    queue_policy: Option<PolicyKind>,
    queue_params: Option<String>,
    policy_params: Option<String>,
}

impl QueueProp {
    pub fn policy(&self) -> PolicyKind {
        self.queue_policy.unwrap_or(PolicyKind::Fcfs)
    }

    pub fn queue_params(&self) -> Option<&str> {
        self.queue_params.as_deref()
    }

    pub fn policy_params(&self) -> Option<&str> {
        self.policy_params.as_deref()
    }

    /// Records the policy if known; unknown names warn and keep the
    /// previous setting.
    fn set_queue_policy(&mut self, name: &str) {
        match PolicyKind::parse(name) {
            Some(kind) => self.queue_policy = Some(kind),
            None => tracing::warn!("unknown queue policy \"{name}\", keeping default"),
        }
    }

    fn jsonify(&self) -> serde_json::Value {
        json!({
            "queue-policy": self.queue_policy.map(|p| p.name()),
            "queue-params": self.queue_params,
            "policy-params": self.policy_params,
        })
    }
}

#[derive(Clone, Debug)]
pub struct QmanagerOpts {
    default_queue_name: String,
    queue_prop: QueueProp,
    per_queue: BTreeMap<String, QueueProp>,
}

impl Default for QmanagerOpts {
    fn default() -> Self {
        Self {
            default_queue_name: DEFAULT_QUEUE_NAME.to_owned(),
            queue_prop: QueueProp::default(),
            per_queue: BTreeMap::new(),
        }
    }
}

impl QmanagerOpts {
    pub fn default_queue_name(&self) -> &str {
        &self.default_queue_name
    }

    pub fn per_queue(&self) -> &BTreeMap<String, QueueProp> {
        &self.per_queue
    }

    /// Parses one `key = value` configuration entry.
    pub fn parse(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "queues" => self.parse_queues(value)?,
            "queue-policy" => self.queue_prop.set_queue_policy(value),
            "queue-params" => self.queue_prop.queue_params = Some(value.to_owned()),
            "policy-params" => self.queue_prop.policy_params = Some(value.to_owned()),
            "queue-policy-per-queue" => {
                self.parse_per_queue(value, |prop, v| prop.set_queue_policy(v))?
            },
            "queue-params-per-queue" => self.parse_per_queue(value, |prop, v| {
                prop.queue_params = Some(v.to_owned())
            })?,
            "policy-params-per-queue" => self.parse_per_queue(value, |prop, v| {
                prop.policy_params = Some(v.to_owned())
            })?,
            _ => anyhow::bail!(ErrorMetadata::invalid_argument(
                "UnknownOption",
                format!("unknown configuration key \"{key}\""),
            )),
        }
        Ok(())
    }

    fn parse_queues(&mut self, queues: &str) -> anyhow::Result<()> {
        // replaces any existing queue set, including the default entry
        self.per_queue.clear();
        for name in queues.split_whitespace() {
            if self
                .per_queue
                .insert(name.to_owned(), QueueProp::default())
                .is_some()
            {
                anyhow::bail!(ErrorMetadata::already_exists(
                    "DuplicateQueue",
                    format!("queue \"{name}\" listed twice"),
                ));
            }
        }
        Ok(())
    }

    fn parse_per_queue(
        &mut self,
        value: &str,
        mut apply: impl FnMut(&mut QueueProp, &str),
    ) -> anyhow::Result<()> {
        for entry in value.split_whitespace() {
            let Some((name, v)) = entry.split_once(':') else {
                anyhow::bail!(ErrorMetadata::invalid_argument(
                    "BadPerQueueOption",
                    format!("expected queue:value, got \"{entry}\""),
                ));
            };
            let Some(prop) = self.per_queue.get_mut(name) else {
                anyhow::bail!(ErrorMetadata::not_found(
                    "UnknownQueue",
                    format!("per-queue option names unknown queue \"{name}\""),
                ));
            };
            apply(prop, v);
        }
        Ok(())
    }

    /// Composes `other` (higher precedence) over this option set: every
    /// explicitly set key in `other` overrides the same key here.
    pub fn compose(&mut self, other: QmanagerOpts) {
        if other.queue_prop.queue_policy.is_some() {
            self.queue_prop.queue_policy = other.queue_prop.queue_policy;
        }
        if other.queue_prop.queue_params.is_some() {
            self.queue_prop.queue_params = other.queue_prop.queue_params;
        }
        if other.queue_prop.policy_params.is_some() {
            self.queue_prop.policy_params = other.queue_prop.policy_params;
        }
        for (name, prop) in other.per_queue {
            let merged = self.per_queue.entry(name).or_default();
            if prop.queue_policy.is_some() {
                merged.queue_policy = prop.queue_policy;
            }
            if prop.queue_params.is_some() {
                merged.queue_params = prop.queue_params;
            }
            if prop.policy_params.is_some() {
                merged.policy_params = prop.policy_params;
            }
        }
    }

    /// Applies the top-level properties to every queue that has not set
    /// its own, creating the single `default` queue if none were named.
    pub fn canonicalize(&mut self) -> &mut Self {
        if self.per_queue.is_empty() {
            self.per_queue
                .insert(self.default_queue_name.clone(), QueueProp::default());
        }
        for prop in self.per_queue.values_mut() {
            if prop.queue_policy.is_none() {
                prop.queue_policy = self.queue_prop.queue_policy;
            }
            if prop.queue_params.is_none() {
                prop.queue_params = self.queue_prop.queue_params.clone();
            }
            if prop.policy_params.is_none() {
                prop.policy_params = self.queue_prop.policy_params.clone();
            }
        }
        self
    }

    /// The canonicalized option set, for the params RPC.
    pub fn jsonify(&self) -> serde_json::Value {
        let per_queue: BTreeMap<&str, serde_json::Value> = self
            .per_queue
            .iter()
            .map(|(name, prop)| (name.as_str(), prop.jsonify()))
            .collect();
        json!({
            "default-queue": self.default_queue_name,
            "queue-policy": self.queue_prop.queue_policy.map(|p| p.name()),
            "queue-params": self.queue_prop.queue_params,
            "policy-params": self.queue_prop.policy_params,
            "per-queue": per_queue,
        })
    }
}
