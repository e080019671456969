use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use runbay_reconcile::{
    ReconcileError, RecoveryWindow, DEFAULT_NOT_FOUND_GRACE_BUFFER, DEFAULT_TICK_INTERVAL,
};

use crate::agent_context::{AgentDefaults, SUPPORTED_REASONING_EFFORTS};
use crate::db::DbConfig;
use crate::namespace_policy::{parse_ttl_by_role, NamespaceLeasePolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    /// Run a single tick and exit.
    pub tick_once: bool,
    pub database: DbConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("RUNBAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let dev_mode = env_bool("RUNBAY_DEV", false)?;
        let tick_once = env_bool("RUNBAY_TICK_ONCE", false)?;
        let database = database_from_env()?;
        let orchestrator = OrchestratorConfig::from_env()?;

        Ok(Self {
            log_level,
            dev_mode,
            tick_once,
            database,
            orchestrator,
        })
    }
}

fn database_from_env() -> Result<DbConfig> {
    let defaults = DbConfig::default();
    Ok(DbConfig {
        database_url: env_string("DATABASE_URL", defaults.database_url),
        max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.max_connections)?,
        acquire_timeout: env_secs("DB_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout)?,
        migrations_dir: std::env::var("RUNBAY_MIGRATIONS_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or(defaults.migrations_dir),
    })
}

/// Orchestrator settings. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub worker_id: String,
    pub tick_interval: Duration,

    pub max_claims_per_tick: u32,
    pub reconcile_limit: u32,
    pub claim_scan_limit: u32,

    pub slots_per_project: u32,
    pub slot_lease_ttl: Duration,
    pub run_lease_ttl: Duration,
    pub learning_mode_default: bool,

    pub namespace_prefix: String,
    pub default_namespace: String,
    pub namespace_policy: NamespaceLeasePolicy,
    pub namespace_sweep_limit: u32,

    pub prepare_retry_interval: Duration,
    pub prepare_retry_timeout: Duration,
    pub not_found_grace_buffer: Duration,
    pub cluster_call_timeout: Duration,

    pub agent_defaults: AgentDefaults,
    pub job_image: String,
    pub job_image_fallback: Option<String>,
    pub mcp_token_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_claims_per_tick: 4,
            reconcile_limit: 50,
            claim_scan_limit: 16,
            slots_per_project: 2,
            slot_lease_ttl: Duration::from_secs(300),
            run_lease_ttl: Duration::from_secs(900),
            learning_mode_default: false,
            namespace_prefix: "runbay".to_string(),
            default_namespace: "runbay-jobs".to_string(),
            namespace_policy: NamespaceLeasePolicy {
                default_ttl: Duration::from_secs(86_400),
                ttl_by_role: HashMap::new(),
                cleanup_disabled: false,
                debug_label: Some("runbay:debug".to_string()),
            },
            namespace_sweep_limit: 20,
            prepare_retry_interval: Duration::from_secs(2),
            prepare_retry_timeout: Duration::from_secs(300),
            not_found_grace_buffer: DEFAULT_NOT_FOUND_GRACE_BUFFER,
            cluster_call_timeout: Duration::from_secs(15),
            agent_defaults: AgentDefaults {
                model: "gpt-5.2-codex".to_string(),
                reasoning_effort: "medium".to_string(),
                branch_prefix: "runbay".to_string(),
            },
            job_image: "ghcr.io/runbay/agent:latest".to_string(),
            job_image_fallback: None,
            mcp_token_ttl: Duration::from_secs(3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ttl_by_role = match std::env::var("RUNBAY_NAMESPACE_TTL_BY_ROLE") {
            Ok(raw) => parse_ttl_by_role(&raw)
                .map_err(anyhow::Error::msg)
                .context("invalid RUNBAY_NAMESPACE_TTL_BY_ROLE")?,
            Err(_) => HashMap::new(),
        };

        let config = Self {
            worker_id: std::env::var("RUNBAY_WORKER_ID")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.worker_id),
            tick_interval: env_millis("RUNBAY_TICK_INTERVAL_MS", defaults.tick_interval)?,
            max_claims_per_tick: env_parse("RUNBAY_MAX_CLAIMS_PER_TICK", defaults.max_claims_per_tick)?,
            reconcile_limit: env_parse("RUNBAY_RECONCILE_LIMIT", defaults.reconcile_limit)?,
            claim_scan_limit: env_parse("RUNBAY_CLAIM_SCAN_LIMIT", defaults.claim_scan_limit)?,
            slots_per_project: env_parse("RUNBAY_SLOTS_PER_PROJECT", defaults.slots_per_project)?,
            slot_lease_ttl: env_secs("RUNBAY_SLOT_LEASE_TTL_SECS", defaults.slot_lease_ttl)?,
            run_lease_ttl: env_secs("RUNBAY_RUN_LEASE_TTL_SECS", defaults.run_lease_ttl)?,
            learning_mode_default: env_bool(
                "RUNBAY_LEARNING_MODE_DEFAULT",
                defaults.learning_mode_default,
            )?,
            namespace_prefix: env_string("RUNBAY_NAMESPACE_PREFIX", defaults.namespace_prefix),
            default_namespace: env_string("RUNBAY_DEFAULT_NAMESPACE", defaults.default_namespace),
            namespace_policy: NamespaceLeasePolicy {
                default_ttl: env_secs(
                    "RUNBAY_NAMESPACE_TTL_SECS",
                    defaults.namespace_policy.default_ttl,
                )?,
                ttl_by_role,
                cleanup_disabled: env_bool(
                    "RUNBAY_CLEANUP_DISABLED",
                    defaults.namespace_policy.cleanup_disabled,
                )?,
                debug_label: match std::env::var("RUNBAY_DEBUG_LABEL") {
                    Ok(label) if label.trim().is_empty() => None,
                    Ok(label) => Some(label.trim().to_string()),
                    Err(_) => defaults.namespace_policy.debug_label,
                },
            },
            namespace_sweep_limit: env_parse(
                "RUNBAY_NAMESPACE_SWEEP_LIMIT",
                defaults.namespace_sweep_limit,
            )?,
            prepare_retry_interval: env_millis(
                "RUNBAY_PREPARE_RETRY_INTERVAL_MS",
                defaults.prepare_retry_interval,
            )?,
            prepare_retry_timeout: env_secs(
                "RUNBAY_PREPARE_RETRY_TIMEOUT_SECS",
                defaults.prepare_retry_timeout,
            )?,
            not_found_grace_buffer: env_secs(
                "RUNBAY_NOT_FOUND_GRACE_BUFFER_SECS",
                defaults.not_found_grace_buffer,
            )?,
            cluster_call_timeout: env_secs(
                "RUNBAY_CLUSTER_CALL_TIMEOUT_SECS",
                defaults.cluster_call_timeout,
            )?,
            agent_defaults: AgentDefaults {
                model: env_string("RUNBAY_DEFAULT_MODEL", defaults.agent_defaults.model),
                reasoning_effort: env_string(
                    "RUNBAY_DEFAULT_REASONING",
                    defaults.agent_defaults.reasoning_effort,
                )
                .to_ascii_lowercase(),
                branch_prefix: env_string(
                    "RUNBAY_BRANCH_PREFIX",
                    defaults.agent_defaults.branch_prefix,
                ),
            },
            job_image: env_string("RUNBAY_JOB_IMAGE", defaults.job_image),
            job_image_fallback: std::env::var("RUNBAY_JOB_IMAGE_FALLBACK")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            mcp_token_ttl: env_secs("RUNBAY_MCP_TOKEN_TTL_SECS", defaults.mcp_token_ttl)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.slots_per_project == 0 {
            bail!("RUNBAY_SLOTS_PER_PROJECT must be at least 1");
        }
        if self.tick_interval.is_zero() {
            bail!("RUNBAY_TICK_INTERVAL_MS must be positive");
        }
        if !SUPPORTED_REASONING_EFFORTS.contains(&self.agent_defaults.reasoning_effort.as_str()) {
            bail!(
                "RUNBAY_DEFAULT_REASONING must be one of {:?}, got '{}'",
                SUPPORTED_REASONING_EFFORTS,
                self.agent_defaults.reasoning_effort
            );
        }
        if self.job_image.trim().is_empty() {
            bail!("RUNBAY_JOB_IMAGE must not be empty");
        }
        self.recovery_window()
            .context("RUNBAY_RUN_LEASE_TTL_SECS must cover the job-not-found grace window")?;
        Ok(())
    }

    /// Grace and budget for runs whose job cannot be found.
    pub fn recovery_window(&self) -> Result<RecoveryWindow, ReconcileError> {
        RecoveryWindow::new(
            self.prepare_retry_timeout,
            self.not_found_grace_buffer,
            self.run_lease_ttl,
        )
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "runbay".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default.as_secs())?))
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Ok(Duration::from_millis(env_parse(name, millis)?))
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("invalid {name}: '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        let window = config.recovery_window().unwrap();
        assert_eq!(window.grace, Duration::from_secs(315));
        assert_eq!(window.budget, Duration::from_secs(900));
    }

    #[test]
    fn test_default_worker_id_shape() {
        let id = default_worker_id();
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let bad_reasoning = OrchestratorConfig {
            agent_defaults: AgentDefaults {
                reasoning_effort: "turbo".to_string(),
                ..OrchestratorConfig::default().agent_defaults
            },
            ..OrchestratorConfig::default()
        };
        assert!(bad_reasoning.validate().is_err());

        let short_budget = OrchestratorConfig {
            run_lease_ttl: Duration::from_secs(30),
            ..OrchestratorConfig::default()
        };
        assert!(short_budget.validate().is_err());

        let no_slots = OrchestratorConfig {
            slots_per_project: 0,
            ..OrchestratorConfig::default()
        };
        assert!(no_slots.validate().is_err());
    }
}
