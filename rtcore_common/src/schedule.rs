//! Scheduling request types.
//!
//! A [`ScheduleConfig`] describes what a thread should run under: a scheduling policy, a
//! priority, an optional CPU affinity list and whether memory should be locked. It is plain
//! data, validated here against static limits; applying it to a thread lives in
//! `rtcore_realtime::sched`.
//!
//! # TOML Example
//!
//! ```toml
//! [schedule]
//! policy = "fifo"
//! priority = 80
//! cpus = [2, 3]
//! lock_memory = true
//! ```

use crate::consts::{MAX_CPU_INDEX, MAX_CPUS, RT_PRIORITY_MAX, RT_PRIORITY_MIN};
use crate::error::RtError;
use core::fmt;
use core::ops::RangeInclusive;
use serde::{Deserialize, Serialize};

/// Fixed-capacity CPU index list.
pub type CpuList = heapless::Vec<usize, MAX_CPUS>;

/// Scheduling class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    /// Default time-sharing scheduler (`SCHED_OTHER`).
    #[default]
    Normal,
    /// Real-time first-in first-out (`SCHED_FIFO`).
    Fifo,
    /// Real-time round robin (`SCHED_RR`).
    RoundRobin,
}

impl SchedPolicy {
    /// True for the real-time classes.
    pub const fn is_realtime(self) -> bool {
        matches!(self, Self::Fifo | Self::RoundRobin)
    }

    /// Static priority range accepted by this policy.
    pub const fn priority_range(self) -> RangeInclusive<i32> {
        match self {
            Self::Normal => 0..=0,
            Self::Fifo | Self::RoundRobin => RT_PRIORITY_MIN..=RT_PRIORITY_MAX,
        }
    }

    /// Short lowercase name, matching the serde form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fifo => "fifo",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested scheduling parameters for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Scheduling class.
    pub policy: SchedPolicy,

    /// Static priority. Must be 0 for `Normal`, 1..=99 for the real-time classes.
    pub priority: i32,

    /// CPUs the thread may run on. Empty leaves the affinity unchanged.
    pub cpus: CpuList,

    /// Lock all current and future pages of the process into RAM.
    pub lock_memory: bool,
}

impl ScheduleConfig {
    /// Default time-sharing schedule.
    pub fn normal() -> Self {
        Self::default()
    }

    /// `SCHED_FIFO` at `priority`.
    pub fn fifo(priority: i32) -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority,
            ..Self::default()
        }
    }

    /// `SCHED_RR` at `priority`.
    pub fn round_robin(priority: i32) -> Self {
        Self {
            policy: SchedPolicy::RoundRobin,
            priority,
            ..Self::default()
        }
    }

    /// Pin to the given CPUs.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if more than [`MAX_CPUS`] indices are given.
    pub fn with_cpus(mut self, cpus: &[usize]) -> Result<Self, RtError> {
        self.cpus.clear();
        for &cpu in cpus {
            self.cpus
                .push(cpu)
                .map_err(|_| RtError::invalid("too many CPUs in affinity list"))?;
        }
        Ok(self)
    }

    /// Request memory locking.
    pub fn with_memory_lock(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    /// Check the request against static limits.
    ///
    /// Host-dependent limits (online CPU count, kernel priority range) are checked when the
    /// schedule is applied.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the priority is outside the policy's range, a CPU index is
    /// repeated, or a CPU index exceeds [`MAX_CPU_INDEX`].
    pub fn validate(&self) -> Result<(), RtError> {
        if !self.policy.priority_range().contains(&self.priority) {
            return Err(if self.policy.is_realtime() {
                RtError::invalid("real-time priority must be within 1..=99")
            } else {
                RtError::invalid("normal policy requires priority 0")
            });
        }

        for (i, cpu) in self.cpus.iter().enumerate() {
            if *cpu > MAX_CPU_INDEX {
                return Err(RtError::invalid("CPU index out of range"));
            }
            if self.cpus[..i].contains(cpu) {
                return Err(RtError::invalid("duplicate CPU index in affinity list"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_is_normal_unpinned() {
        let cfg = ScheduleConfig::default();
        assert_eq!(cfg.policy, SchedPolicy::Normal);
        assert_eq!(cfg.priority, 0);
        assert!(cfg.cpus.is_empty());
        assert!(!cfg.lock_memory);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn priority_bounds() {
        assert!(ScheduleConfig::fifo(1).validate().is_ok());
        assert!(ScheduleConfig::fifo(99).validate().is_ok());
        assert!(ScheduleConfig::round_robin(50).validate().is_ok());

        for bad in [0, 100, -1] {
            let err = ScheduleConfig::fifo(bad).validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        let normal_with_prio = ScheduleConfig {
            priority: 10,
            ..ScheduleConfig::normal()
        };
        assert_eq!(
            normal_with_prio.validate().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn cpu_list_checks() {
        let ok = ScheduleConfig::fifo(10).with_cpus(&[0, 2, 3]).unwrap();
        assert_eq!(ok.cpus.as_slice(), &[0, 2, 3]);
        assert!(ok.validate().is_ok());

        let dup = ScheduleConfig::fifo(10).with_cpus(&[1, 1]).unwrap();
        assert_eq!(dup.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);

        let far = ScheduleConfig::normal()
            .with_cpus(&[MAX_CPU_INDEX + 1])
            .unwrap();
        assert_eq!(far.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);

        let too_many: Vec<usize> = (0..=MAX_CPUS).collect();
        assert!(ScheduleConfig::normal().with_cpus(&too_many).is_err());
    }

    #[test]
    fn policy_serde_names() {
        #[derive(Debug, Deserialize, Serialize, PartialEq)]
        struct Wrapper {
            policy: SchedPolicy,
        }

        let w: Wrapper = toml::from_str("policy = \"round_robin\"").unwrap();
        assert_eq!(w.policy, SchedPolicy::RoundRobin);
        assert!(toml::to_string(&Wrapper { policy: SchedPolicy::Fifo })
            .unwrap()
            .contains("fifo"));
        assert_eq!(SchedPolicy::RoundRobin.to_string(), "round_robin");
    }

    #[test]
    fn schedule_from_toml() {
        let cfg: ScheduleConfig = toml::from_str(
            r#"
policy = "fifo"
priority = 80
cpus = [2, 3]
lock_memory = true
"#,
        )
        .unwrap();
        assert_eq!(cfg, ScheduleConfig::fifo(80).with_cpus(&[2, 3]).unwrap().with_memory_lock(true));

        assert!(toml::from_str::<ScheduleConfig>("prio = 3").is_err());
    }
}
