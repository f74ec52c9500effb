//! # rtcore_run
//!
//! Runs any command with a requested scheduling policy, priority and CPU affinity.
//!
//! The schedule is applied to this process, privileges are dropped back to the real user id,
//! and the command is executed through `/bin/sh -c`, inheriting the schedule. Settings come
//! from `--config` (a `RunnerConfig` TOML file) with command-line flags taking precedence.
//!
//! ```text
//! sudo rtcore_run --priority 70 --cpus 2,3 -- ./control_loop --rate 1000
//! ```

use clap::{Parser, ValueEnum};
use nix::unistd::{execvp, getuid, setuid};
use rtcore::config::{ConfigLoader, LogLevel, RunnerConfig};
use rtcore::error::RtError;
use rtcore::schedule::{SchedPolicy, ScheduleConfig};
use rtcore_realtime::sched::{ThreadHandle, apply};
use std::ffi::CString;
use std::path::PathBuf;
use std::process;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

const DEFAULT_RT_PRIORITY: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Policy {
    Normal,
    Fifo,
    RoundRobin,
}

impl From<Policy> for SchedPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Normal => SchedPolicy::Normal,
            Policy::Fifo => SchedPolicy::Fifo,
            Policy::RoundRobin => SchedPolicy::RoundRobin,
        }
    }
}

/// Run a command under a real-time schedule
#[derive(Parser, Debug)]
#[command(name = "rtcore_run")]
#[command(version)]
#[command(about = "Run a command with a real-time priority and CPU affinity")]
struct Args {
    /// Runner configuration TOML ([shared] and [schedule] tables).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scheduling policy (default: fifo).
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Static priority, 1..=99 for fifo/round-robin (default: 20).
    #[arg(long)]
    priority: Option<i32>,

    /// Comma-separated CPUs to run on (default: unchanged).
    #[arg(long, value_delimiter = ',')]
    cpus: Option<Vec<usize>>,

    /// Lock all current and future memory pages.
    #[arg(long)]
    lock_memory: bool,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,

    /// Command to run, passed to `/bin/sh -c`.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    let config = args.config.as_deref().map(RunnerConfig::load).transpose();
    let log_level = config
        .as_ref()
        .ok()
        .and_then(|c| c.as_ref())
        .map(|c| c.shared.log_level);
    setup_tracing(&args, log_level);

    let result = config
        .map_err(Into::into)
        .and_then(|config| run(&args, config));
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args, config: Option<RunnerConfig>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(config) = &config {
        config.validate()?;
    }
    let schedule = resolve_schedule(args, config.map(|c| c.schedule))?;

    apply(ThreadHandle::current(), &schedule)?;
    info!(
        policy = %schedule.policy,
        priority = schedule.priority,
        cpus = ?schedule.cpus.as_slice(),
        lock_memory = schedule.lock_memory,
        "schedule applied"
    );

    setuid(getuid()).map_err(|e| RtError::from_errno("setuid", e))?;

    let command = args.command.join(" ");
    info!(command = %command, "executing");
    let argv = [
        CString::new("/bin/sh")?,
        CString::new("-c")?,
        CString::new(command)?,
    ];
    let err = match execvp(&argv[0], &argv) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    Err(RtError::from_errno("execvp", err).into())
}

/// Merge the flags over the configured (or default) schedule.
fn resolve_schedule(args: &Args, base: Option<ScheduleConfig>) -> Result<ScheduleConfig, RtError> {
    let mut schedule = base.unwrap_or_else(|| ScheduleConfig::fifo(DEFAULT_RT_PRIORITY));

    if let Some(policy) = args.policy {
        schedule.policy = policy.into();
        if args.priority.is_none() {
            schedule.priority = match schedule.policy {
                SchedPolicy::Normal => 0,
                _ => DEFAULT_RT_PRIORITY,
            };
        }
    }
    if let Some(priority) = args.priority {
        schedule.priority = priority;
    }
    if let Some(cpus) = &args.cpus {
        schedule = schedule.with_cpus(cpus)?;
    }
    if args.lock_memory {
        schedule.lock_memory = true;
    }

    schedule.validate()?;
    Ok(schedule)
}

fn setup_tracing(args: &Args, configured: Option<LogLevel>) {
    let level: Directive = if args.verbose {
        Level::DEBUG.into()
    } else {
        configured
            .unwrap_or_default()
            .as_filter()
            .parse()
            .unwrap_or_else(|_| Level::INFO.into())
    };

    let filter = EnvFilter::from_default_env().add_directive(level);

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(flags: &[&str]) -> Args {
        let mut argv = vec!["rtcore_run"];
        argv.extend_from_slice(flags);
        argv.extend_from_slice(&["--", "true"]);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_to_fifo_20_without_affinity() {
        let schedule = resolve_schedule(&args(&[]), None).unwrap();
        assert_eq!(schedule.policy, SchedPolicy::Fifo);
        assert_eq!(schedule.priority, DEFAULT_RT_PRIORITY);
        assert!(schedule.cpus.is_empty());
        assert!(!schedule.lock_memory);
    }

    #[test]
    fn flags_override_config() {
        let base = ScheduleConfig::round_robin(50).with_cpus(&[3]).unwrap();
        let schedule = resolve_schedule(
            &args(&["--priority", "70", "--cpus", "1,2", "--lock-memory"]),
            Some(base),
        )
        .unwrap();
        assert_eq!(schedule.policy, SchedPolicy::RoundRobin);
        assert_eq!(schedule.priority, 70);
        assert_eq!(schedule.cpus.as_slice(), &[1, 2]);
        assert!(schedule.lock_memory);
    }

    #[test]
    fn normal_policy_resets_priority() {
        let schedule = resolve_schedule(&args(&["--policy", "normal"]), None).unwrap();
        assert_eq!(schedule.policy, SchedPolicy::Normal);
        assert_eq!(schedule.priority, 0);
    }

    #[test]
    fn rejects_out_of_range_priority_and_duplicate_cpus() {
        assert!(resolve_schedule(&args(&["--priority", "0"]), None).is_err());
        assert!(resolve_schedule(&args(&["--cpus", "1,1"]), None).is_err());
    }

    #[test]
    fn command_keeps_its_own_flags() {
        let parsed = Args::try_parse_from([
            "rtcore_run",
            "--priority",
            "30",
            "--",
            "./app",
            "--rate",
            "1000",
        ])
        .unwrap();
        assert_eq!(parsed.command, ["./app", "--rate", "1000"]);
        assert_eq!(parsed.priority, Some(30));
    }
}
