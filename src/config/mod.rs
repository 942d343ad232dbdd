mod file_config;

pub use file_config::{FileConfig, TriggerConfig};

use crate::jobs::{CommandUnit, WorkUnit, WorkerMode};
use crate::triggers::{SchedulerSettings, TriggerDefinition, TriggerSchedule};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::collections::HashSet;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub worker_mode: WorkerMode,
    pub shutdown_grace_secs: u64,
    pub max_tick_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            worker_mode: WorkerMode::Pooled,
            shutdown_grace_secs: 30,
            max_tick_secs: 60,
            reap_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub worker_mode: WorkerMode,
    pub shutdown_grace: Duration,
    pub scheduler: SchedulerSettings,
    pub reap_interval: Duration,
    pub triggers: Vec<TriggerSettings>,
}

/// A validated trigger that runs a command.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub schedule: TriggerSchedule,
    pub enabled: bool,
}

impl TriggerSettings {
    /// Build a trigger definition whose every fire runs the command in a
    /// child process.
    pub fn definition(&self) -> TriggerDefinition {
        let command = self.command.clone();
        let args = self.args.clone();
        let name = self.id.clone();
        let definition = TriggerDefinition::new(self.id.clone(), self.schedule.clone(), move || {
            Box::new(CommandUnit::new(command.clone(), args.clone()).with_name(name.clone()))
                as Box<dyn WorkUnit>
        });
        if self.enabled {
            definition
        } else {
            definition.disabled()
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        Self::resolve_at(cli, file_config, Utc::now())
    }

    /// Like [`AppConfig::resolve`], with `now` as the default recurrence
    /// anchor.
    pub fn resolve_at(
        cli: &CliConfig,
        file_config: Option<FileConfig>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let worker_mode = match file.worker_mode {
            Some(ref s) => parse_worker_mode(s)
                .ok_or_else(|| anyhow::anyhow!("Invalid worker_mode in config file: {}", s))?,
            None => cli.worker_mode,
        };

        let shutdown_grace_secs = file
            .shutdown_grace_secs
            .unwrap_or(cli.shutdown_grace_secs);
        let max_tick_secs = file.max_tick_secs.unwrap_or(cli.max_tick_secs);
        if max_tick_secs == 0 {
            bail!("max_tick_secs must be greater than zero");
        }
        let reap_interval_secs = file.reap_interval_secs.unwrap_or(cli.reap_interval_secs);
        if reap_interval_secs == 0 {
            bail!("reap_interval_secs must be greater than zero");
        }

        let mut seen = HashSet::new();
        let mut triggers = Vec::with_capacity(file.triggers.len());
        for trigger in file.triggers {
            if !seen.insert(trigger.id.clone()) {
                bail!("Duplicate trigger id in config file: {}", trigger.id);
            }
            triggers.push(resolve_trigger(trigger, now)?);
        }

        Ok(Self {
            worker_mode,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            scheduler: SchedulerSettings {
                max_tick: Duration::from_secs(max_tick_secs),
            },
            reap_interval: Duration::from_secs(reap_interval_secs),
            triggers,
        })
    }
}

fn resolve_trigger(trigger: TriggerConfig, now: DateTime<Utc>) -> Result<TriggerSettings> {
    if trigger.id.is_empty() {
        bail!("Every trigger needs a non-empty id");
    }
    if trigger.command.is_empty() {
        bail!("Trigger {} has no command", trigger.id);
    }

    let schedule = match (&trigger.at, trigger.interval_secs) {
        (Some(at), None) => {
            if trigger.anchor.is_some() {
                bail!("Trigger {}: anchor is only valid with interval_secs", trigger.id);
            }
            TriggerSchedule::at(parse_time(&trigger.id, "at", at)?)
        }
        (None, Some(interval_secs)) => {
            let anchor = match trigger.anchor {
                Some(ref anchor) => parse_time(&trigger.id, "anchor", anchor)?,
                None => now,
            };
            TriggerSchedule::every(Duration::from_secs(interval_secs), anchor)
                .with_context(|| format!("Trigger {} has an invalid interval", trigger.id))?
        }
        (Some(_), Some(_)) => {
            bail!("Trigger {}: set either at or interval_secs, not both", trigger.id)
        }
        (None, None) => bail!("Trigger {}: one of at or interval_secs is required", trigger.id),
    };

    Ok(TriggerSettings {
        id: trigger.id,
        command: trigger.command,
        args: trigger.args,
        schedule,
        enabled: trigger.enabled.unwrap_or(true),
    })
}

fn parse_time(trigger_id: &str, field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| {
            format!(
                "Trigger {}: {} is not an RFC 3339 timestamp: {}",
                trigger_id, field, value
            )
        })
}

/// Parses a worker mode string.
/// Uses clap's ValueEnum trait for parsing.
fn parse_worker_mode(s: &str) -> Option<WorkerMode> {
    WorkerMode::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobError;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()
    }

    fn trigger(id: &str) -> TriggerConfig {
        TriggerConfig {
            id: id.to_string(),
            command: "echo".to_string(),
            args: vec!["hi".to_string()],
            interval_secs: Some(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_worker_mode() {
        assert_eq!(parse_worker_mode("pooled"), Some(WorkerMode::Pooled));
        assert_eq!(parse_worker_mode("Dedicated"), Some(WorkerMode::Dedicated));
        assert!(parse_worker_mode("invalid").is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let cli = CliConfig {
            worker_mode: WorkerMode::Dedicated,
            shutdown_grace_secs: 10,
            max_tick_secs: 30,
            reap_interval_secs: 2,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.worker_mode, WorkerMode::Dedicated);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.scheduler.max_tick, Duration::from_secs(30));
        assert_eq!(config.reap_interval, Duration::from_secs(2));
        assert!(config.triggers.is_empty());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let cli = CliConfig::default();
        let file_config = FileConfig {
            worker_mode: Some("dedicated".to_string()),
            max_tick_secs: Some(5),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.worker_mode, WorkerMode::Dedicated);
        assert_eq!(config.scheduler.max_tick, Duration::from_secs(5));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_invalid_worker_mode() {
        let file_config = FileConfig {
            worker_mode: Some("process".to_string()),
            ..Default::default()
        };
        let err = AppConfig::resolve(&CliConfig::default(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("Invalid worker_mode"));
    }

    #[test]
    fn test_resolve_zero_tick_error() {
        let cli = CliConfig {
            max_tick_secs: 0,
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_resolve_recurring_trigger_defaults_anchor_to_now() {
        let file_config = FileConfig {
            triggers: vec![trigger("heartbeat")],
            ..Default::default()
        };
        let config = AppConfig::resolve_at(&CliConfig::default(), Some(file_config), now()).unwrap();

        let trigger = &config.triggers[0];
        assert!(trigger.enabled);
        assert_eq!(
            trigger.schedule,
            TriggerSchedule::Every {
                interval: Duration::from_secs(10),
                anchor: now(),
            }
        );
    }

    #[test]
    fn test_resolve_one_shot_trigger() {
        let file_config = FileConfig {
            triggers: vec![TriggerConfig {
                interval_secs: None,
                at: Some("2030-06-01T14:00:00+02:00".to_string()),
                enabled: Some(false),
                ..trigger("once")
            }],
            ..Default::default()
        };
        let config = AppConfig::resolve_at(&CliConfig::default(), Some(file_config), now()).unwrap();

        assert_eq!(config.triggers[0].schedule, TriggerSchedule::at(now()));
        assert!(!config.triggers[0].enabled);
        assert!(!config.triggers[0].definition().enabled);
    }

    #[test]
    fn test_resolve_zero_interval_is_misconfiguration() {
        let file_config = FileConfig {
            triggers: vec![TriggerConfig {
                interval_secs: Some(0),
                ..trigger("broken")
            }],
            ..Default::default()
        };
        let err = AppConfig::resolve_at(&CliConfig::default(), Some(file_config), now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::SchedulerMisconfiguration(_))
        ));
    }

    #[test]
    fn test_resolve_trigger_schedule_errors() {
        let cases = vec![
            (
                TriggerConfig {
                    at: Some("2030-01-01T00:00:00Z".to_string()),
                    ..trigger("both")
                },
                "not both",
            ),
            (
                TriggerConfig {
                    interval_secs: None,
                    ..trigger("neither")
                },
                "is required",
            ),
            (
                TriggerConfig {
                    anchor: Some("yesterday".to_string()),
                    ..trigger("bad-anchor")
                },
                "RFC 3339",
            ),
            (
                TriggerConfig {
                    command: String::new(),
                    ..trigger("no-command")
                },
                "has no command",
            ),
        ];

        for (config, expected) in cases {
            let file_config = FileConfig {
                triggers: vec![config],
                ..Default::default()
            };
            let err = AppConfig::resolve_at(&CliConfig::default(), Some(file_config), now())
                .unwrap_err();
            assert!(
                format!("{:#}", err).contains(expected),
                "expected '{}' in '{:#}'",
                expected,
                err
            );
        }
    }

    #[test]
    fn test_resolve_duplicate_trigger_ids() {
        let file_config = FileConfig {
            triggers: vec![trigger("same"), trigger("same")],
            ..Default::default()
        };
        let err = AppConfig::resolve_at(&CliConfig::default(), Some(file_config), now()).unwrap_err();
        assert!(err.to_string().contains("Duplicate trigger id"));
    }
}
