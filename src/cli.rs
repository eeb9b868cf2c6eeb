use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "selfpatch")]
#[command(version = "0.3.1")]
#[command(about = "Transactional self-modification pipeline with snapshot-backed rollback")]
pub struct Args {
    /// Project root the pipeline operates on
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// TOML config file; built-in defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Requester name recorded in the audit log
    #[arg(long, global = true, default_value = "cli")]
    pub requested_by: String,

    /// Operator id recorded alongside privileged operations
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Admin token for write operations (falls back to SELFPATCH_ADMIN_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Print machine-readable JSON instead of formatted output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Submit a modification batch and wait for its terminal outcome
    Propose {
        /// JSON file holding an array of modification requests
        batch: PathBuf,

        /// One-line intent recorded with each audit row for this run
        #[arg(long, default_value = "cli batch")]
        description: String,
    },

    /// Run the health verifier without modifying anything
    Health {
        /// Skip the type-check step
        #[arg(long)]
        skip_type_check: bool,

        /// Skip the test-suite step
        #[arg(long)]
        skip_tests: bool,
    },

    /// Restore a snapshot byte for byte (latest known-good when omitted)
    Rollback {
        /// Snapshot id to restore
        #[arg(long)]
        snapshot: Option<i64>,
    },

    /// Show recent audit-log rows, newest first
    History {
        /// Maximum rows to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print protected paths and allowed directories
    Policy,

    /// Show a background job's phase and outcome
    Status {
        /// Job id returned by propose
        job_id: Uuid,
    },

    /// Request cooperative cancellation of a running job
    Cancel {
        /// Job id returned by propose
        job_id: Uuid,
    },

    /// Ask the supervisor for a restart by writing the sentinel file
    Restart {
        /// Reason recorded in the sentinel
        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Prefer an explicit --token flag over the environment fallback.
pub fn resolve_token(flag: Option<String>, env: Option<String>) -> Option<String> {
    flag.or(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_token_flag_wins() {
        assert_eq!(
            resolve_token(Some("flag".into()), Some("env".into())),
            Some("flag".to_string())
        );
    }

    #[test]
    fn test_resolve_token_env_fallback() {
        assert_eq!(resolve_token(None, Some("env".into())), Some("env".to_string()));
    }

    #[test]
    fn test_resolve_token_neither() {
        assert_eq!(resolve_token(None, None), None);
    }

    #[test]
    fn test_args_parse_propose_minimal() {
        let args = Args::parse_from(["selfpatch", "propose", "batch.json"]);
        assert_eq!(args.root, PathBuf::from("."));
        assert_eq!(args.requested_by, "cli");
        assert!(args.token.is_none());
        assert!(!args.json);
        match args.command {
            Command::Propose { batch, description } => {
                assert_eq!(batch, PathBuf::from("batch.json"));
                assert_eq!(description, "cli batch");
            }
            _ => panic!("expected propose"),
        }
    }

    #[test]
    fn test_args_parse_propose_with_description() {
        let args = Args::parse_from([
            "selfpatch",
            "propose",
            "batch.json",
            "--description",
            "tighten retry loop",
        ]);
        match args.command {
            Command::Propose { description, .. } => {
                assert_eq!(description, "tighten retry loop");
            }
            _ => panic!("expected propose"),
        }
    }

    #[test]
    fn test_args_parse_health_defaults() {
        let args = Args::parse_from(["selfpatch", "health"]);
        match args.command {
            Command::Health { skip_type_check, skip_tests } => {
                assert!(!skip_type_check);
                assert!(!skip_tests);
            }
            _ => panic!("expected health"),
        }
    }

    #[test]
    fn test_args_parse_health_skip_flags() {
        let args = Args::parse_from(["selfpatch", "health", "--skip-type-check", "--skip-tests"]);
        match args.command {
            Command::Health { skip_type_check, skip_tests } => {
                assert!(skip_type_check);
                assert!(skip_tests);
            }
            _ => panic!("expected health"),
        }
    }

    #[test]
    fn test_args_parse_rollback_latest_known_good() {
        let args = Args::parse_from(["selfpatch", "rollback"]);
        match args.command {
            Command::Rollback { snapshot } => assert!(snapshot.is_none()),
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_args_parse_rollback_targeted() {
        let args = Args::parse_from(["selfpatch", "rollback", "--snapshot", "42"]);
        match args.command {
            Command::Rollback { snapshot } => assert_eq!(snapshot, Some(42)),
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_args_parse_history_default_limit() {
        let args = Args::parse_from(["selfpatch", "history"]);
        match args.command {
            Command::History { limit } => assert_eq!(limit, 20),
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_args_parse_history_custom_limit() {
        let args = Args::parse_from(["selfpatch", "history", "--limit", "5"]);
        match args.command {
            Command::History { limit } => assert_eq!(limit, 5),
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_args_parse_policy() {
        let args = Args::parse_from(["selfpatch", "policy"]);
        assert!(matches!(args.command, Command::Policy));
    }

    #[test]
    fn test_args_parse_status_job_id() {
        let args = Args::parse_from([
            "selfpatch",
            "status",
            "7f9c3f0a-2f4e-4b3a-9d6e-1c2b3a4d5e6f",
        ]);
        match args.command {
            Command::Status { job_id } => {
                assert_eq!(job_id.to_string(), "7f9c3f0a-2f4e-4b3a-9d6e-1c2b3a4d5e6f");
            }
            _ => panic!("expected status"),
        }
    }

    #[test]
    fn test_args_parse_cancel_job_id() {
        let args = Args::parse_from([
            "selfpatch",
            "cancel",
            "7f9c3f0a-2f4e-4b3a-9d6e-1c2b3a4d5e6f",
        ]);
        assert!(matches!(args.command, Command::Cancel { .. }));
    }

    #[test]
    fn test_args_parse_restart_default_reason() {
        let args = Args::parse_from(["selfpatch", "restart"]);
        match args.command {
            Command::Restart { reason } => assert_eq!(reason, "operator request"),
            _ => panic!("expected restart"),
        }
    }

    #[test]
    fn test_args_parse_restart_custom_reason() {
        let args = Args::parse_from(["selfpatch", "restart", "--reason", "pick up new safety module"]);
        match args.command {
            Command::Restart { reason } => assert_eq!(reason, "pick up new safety module"),
            _ => panic!("expected restart"),
        }
    }

    #[test]
    fn test_args_parse_completions_bash() {
        let args = Args::parse_from(["selfpatch", "completions", "bash"]);
        match args.command {
            Command::Completions { shell } => assert_eq!(shell, Shell::Bash),
            _ => panic!("expected completions"),
        }
    }

    #[test]
    fn test_args_parse_root_custom() {
        let args = Args::parse_from(["selfpatch", "--root", "/srv/agent", "policy"]);
        assert_eq!(args.root, PathBuf::from("/srv/agent"));
    }

    #[test]
    fn test_args_parse_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "selfpatch",
            "rollback",
            "--token",
            "s3cret",
            "--user",
            "maya",
            "--requested-by",
            "ops-shell",
        ]);
        assert_eq!(args.token.as_deref(), Some("s3cret"));
        assert_eq!(args.user.as_deref(), Some("maya"));
        assert_eq!(args.requested_by, "ops-shell");
    }

    #[test]
    fn test_args_parse_json_flag() {
        let args = Args::parse_from(["selfpatch", "--json", "history"]);
        assert!(args.json);
    }

    #[test]
    fn test_args_parse_config_path() {
        let args = Args::parse_from(["selfpatch", "--config", "selfpatch.toml", "health"]);
        assert_eq!(args.config, Some(PathBuf::from("selfpatch.toml")));
    }
}
