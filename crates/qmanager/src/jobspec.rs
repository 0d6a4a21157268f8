//! Minimal jobspec handling.
//!
//! The queue layer treats jobspecs as opaque text; only two things are
//! read here: the resource counts and duration (consumed by the matcher)
//! and `attributes.system.queue` (used to route the job to its queue).

use std::collections::BTreeMap;

use anyhow::Context;
use errors::ErrorMetadata;
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobSpec {
    /// Requested units per resource type name.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
    /// Requested walltime in scheduler ticks.
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub system: System,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct System {
    #[serde(default)]
    pub queue: Option<String>,
}

fn default_duration() -> u64 {
    3600
}

impl JobSpec {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::invalid_argument(
                    "BadJobspec",
                    format!("jobspec parse error: {e}"),
                ))
            })
            .context("parsing jobspec")
    }

    /// The queue this job was submitted to, when one was named.
    pub fn queue_name(&self) -> Option<&str> {
        self.attributes.system.queue.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    #[test]
    fn test_parse_full() -> anyhow::Result<()> {
        let spec = JobSpec::parse(
            r#"{"resources": {"core": 2, "memory": 8}, "duration": 50,
                "attributes": {"system": {"queue": "batch"}}}"#,
        )?;
        assert_eq!(
            spec.resources,
            btreemap! {"core".to_owned() => 2, "memory".to_owned() => 8},
        );
        assert_eq!(spec.duration, 50);
        assert_eq!(spec.queue_name(), Some("batch"));
        Ok(())
    }

    #[test]
    fn test_parse_defaults() -> anyhow::Result<()> {
        let spec = JobSpec::parse(r#"{"resources": {"core": 1}}"#)?;
        assert_eq!(spec.duration, 3600);
        assert_eq!(spec.queue_name(), None);
        Ok(())
    }

    #[test]
    fn test_parse_error_is_classified() {
        use errors::ErrorMetadataAnyhowExt;
        let err = JobSpec::parse("{not json").unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
