//! config.toml parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default compute API root.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub project: String,
    pub cluster_name: String,
    /// Directory holding `scontrol`. Resolved through `PATH` when unset.
    pub slurm_cmd_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub compute_endpoint: Option<String>,
    /// Service-account key file. The metadata server is used when unset.
    pub google_app_cred_path: Option<PathBuf>,
    #[serde(default)]
    pub suspend: SuspendConfig,
    /// Partition id → instance definition.
    #[serde(default)]
    pub instance_defs: HashMap<String, InstanceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendConfig {
    /// Provider cap on requests carried by one batch.
    pub max_batch_requests: usize,
    /// Pause between consecutive batches and before each retry round.
    pub batch_pause: String,
    /// Maximum members of a single placement group.
    pub placement_max_members: usize,
    /// Machine families whose nodes get placement groups.
    pub placement_families: Vec<String>,
    /// Sleep between operation polls that come back unfinished.
    pub operation_poll_interval: String,
    /// Binary used for accelerator deletion.
    pub tpu_delete_command: String,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            max_batch_requests: 1000,
            batch_pause: "30s".to_string(),
            placement_max_members: 22,
            placement_families: vec!["c2".to_string()],
            operation_poll_interval: "1s".to_string(),
            tpu_delete_command: "gcloud".to_string(),
        }
    }
}

/// Per-partition instance definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceDef {
    pub zone: Option<String>,
    pub region: Option<String>,
    /// Zone is picked by the provider at creation time and must be looked up.
    pub regional_capacity: bool,
    pub tpu_type: Option<String>,
    pub exclusive: bool,
    pub enable_placement: bool,
    pub machine_type: Option<String>,
}

impl InstanceDef {
    /// Whether nodes of this partition are accelerator (TPU) VMs.
    pub fn is_accelerator(&self) -> bool {
        self.tpu_type.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Machine family, e.g. `c2` for `c2-standard-60`.
    pub fn machine_family(&self) -> Option<&str> {
        self.machine_type
            .as_deref()
            .and_then(|mt| mt.split('-').next())
            .filter(|f| !f.is_empty())
    }

    /// Configured region, falling back to the one implied by the zone.
    pub fn region(&self) -> Option<String> {
        self.region
            .clone()
            .or_else(|| self.zone.as_deref().map(region_of_zone))
    }
}

/// `us-central1-a` → `us-central1`.
pub fn region_of_zone(zone: &str) -> String {
    match zone.rsplit_once('-') {
        Some((region, _)) => region.to_string(),
        None => zone.to_string(),
    }
}

impl ReaperConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ReaperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project must not be empty".into()));
        }
        if self.suspend.max_batch_requests == 0 {
            return Err(ConfigError::Invalid(
                "suspend.max_batch_requests must be at least 1".into(),
            ));
        }
        if self.suspend.placement_max_members == 0 {
            return Err(ConfigError::Invalid(
                "suspend.placement_max_members must be at least 1".into(),
            ));
        }
        self.batch_pause()?;
        self.operation_poll_interval()?;

        for (pid, def) in &self.instance_defs {
            if def.regional_capacity && def.region().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "instance_defs.{pid}: regional capacity requires a region"
                )));
            }
            if !def.regional_capacity && def.zone.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "instance_defs.{pid}: zone is required"
                )));
            }
        }
        Ok(())
    }

    /// Look up the instance definition for a partition id.
    pub fn instance_def(&self, pid: &str) -> ConfigResult<&InstanceDef> {
        self.instance_defs
            .get(pid)
            .ok_or_else(|| ConfigError::UnknownPartition(pid.to_string()))
    }

    pub fn batch_pause(&self) -> ConfigResult<Duration> {
        parse_duration(&self.suspend.batch_pause).ok_or_else(|| ConfigError::Duration {
            field: "suspend.batch_pause",
            value: self.suspend.batch_pause.clone(),
        })
    }

    pub fn operation_poll_interval(&self) -> ConfigResult<Duration> {
        parse_duration(&self.suspend.operation_poll_interval).ok_or_else(|| {
            ConfigError::Duration {
                field: "suspend.operation_poll_interval",
                value: self.suspend.operation_poll_interval.clone(),
            }
        })
    }

    pub fn compute_endpoint(&self) -> &str {
        self.compute_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_COMPUTE_ENDPOINT)
    }

    /// Path to `scontrol`.
    pub fn scontrol_path(&self) -> PathBuf {
        match &self.slurm_cmd_path {
            Some(dir) => dir.join("scontrol"),
            None => PathBuf::from("scontrol"),
        }
    }

    /// Whether jobs on this partition get placement groups to clean up.
    pub fn placement_enabled(&self, def: &InstanceDef) -> bool {
        def.enable_placement
            && def.machine_family().is_some_and(|family| {
                self.suspend
                    .placement_families
                    .iter()
                    .any(|f| f == family)
            })
    }
}

/// Parse a duration string like "30s", "500ms", "5m" or a bare seconds count.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
