//! Native scheduler dialects.
//!
//! The three batch back-ends (PBS/Torque, SGE/OGS, LSF) share the same
//! submit/poll/cancel/account driver and differ only in command syntax and
//! output parsing. [`Dialect`] factors that difference out into a small
//! object the generic [`crate::batch::BatchBackend`] is parametrized by.

use regex::Regex;
use std::collections::HashMap;

use crate::state::TaskState;

/// Parsed result of a dialect's accounting command (`tracejob`, `qacct -j`,
/// the LSF absence-of-job-plus-stdout-file check).
#[derive(Debug, Clone, Default)]
pub struct AccountingRecord {
    pub exit_status: Option<i32>,
    pub wall_time_minutes: Option<f64>,
    pub cpu_time_minutes: Option<f64>,
    pub memory_used_mib: Option<u64>,
    /// UTC epoch seconds, or `None` if the native timestamp lacked
    /// sufficient timezone information to normalize (per the accounting
    /// open question — marked unknown rather than guessed).
    pub completed_at_epoch_secs: Option<i64>,
}

/// Parsed result of a dialect's "listing" command, used by
/// `get_resource_status`.
#[derive(Debug, Clone, Default)]
pub struct ListingRecord {
    pub total_queued: u32,
    pub own_queued: u32,
    pub own_running: u32,
    pub total_running: u32,
    /// Free slot count per hostname.
    pub free_slots_per_host: HashMap<String, i64>,
}

/// The scheduler-specific half of the generic batch back-end: command
/// strings, output parsers, and the native-status-to-canonical-state map.
pub trait Dialect: Send + Sync {
    /// Human-readable name, used in logs and error messages.
    fn name(&self) -> &str;

    /// Build the submit command line for a job in `work_dir` whose wrapper
    /// script (if any) was staged as `script_name`.
    fn submit_command(
        &self,
        work_dir: &str,
        script_name: &str,
        queue: Option<&str>,
        cores: u32,
        wall_time_minutes: u32,
        memory_per_core_mib: u64,
    ) -> String;

    /// Extract the native job ID from the submit command's stdout.
    /// Failure to parse is always an internal error (the submit command
    /// succeeded but we can't make sense of its output).
    fn parse_submit(&self, stdout: &str) -> Option<String>;

    /// Build the command that lists the status of one native job ID.
    fn stat_command(&self, native_job_id: &str) -> String;

    /// Parse the stat command's stdout into a canonical state. Returns
    /// `None` if the job is not listed at all (the caller then falls back
    /// to the accounting command).
    fn parse_stat(&self, stdout: &str, native_job_id: &str) -> Option<TaskState>;

    /// Build the command that queries the accounting system for a
    /// finished job.
    fn accounting_command(&self, native_job_id: &str, work_dir: &str) -> String;

    /// Parse the accounting command's output. Returns `None` if the
    /// accounting system has no record either (the job may still be
    /// propagating into it).
    fn parse_accounting(&self, stdout: &str, stderr: &str) -> Option<AccountingRecord>;

    /// Build the cancel command for a native job ID.
    fn cancel_command(&self, native_job_id: &str) -> String;

    /// Whether a cancel command's failure output means "already finished",
    /// which must be treated as success.
    fn is_already_finished(&self, stderr: &str) -> bool;

    /// Build the resource-listing command(s), run as a single shell
    /// pipeline over the Transport.
    fn listing_command(&self, queue: Option<&str>) -> String;

    /// Parse the listing command's output.
    fn parse_listing(&self, stdout: &str) -> ListingRecord;
}

// ---------------------------------------------------------------------------
// PBS / Torque
// ---------------------------------------------------------------------------

pub struct PbsDialect {
    submit_regex: Regex,
}

impl Default for PbsDialect {
    fn default() -> Self {
        Self {
            // "a numeric prefix" per spec: jobid is the leading digits of a
            // dotted qsub-style id, e.g. "123.server".
            submit_regex: Regex::new(r"^(?P<jobid>\d+)(\.\S+)?\s*$").unwrap(),
        }
    }
}

impl Dialect for PbsDialect {
    fn name(&self) -> &str {
        "pbs"
    }

    fn submit_command(
        &self,
        work_dir: &str,
        script_name: &str,
        queue: Option<&str>,
        cores: u32,
        wall_time_minutes: u32,
        memory_per_core_mib: u64,
    ) -> String {
        let mut cmd = format!("cd {work_dir} && qsub -l nodes=1:ppn={cores}");
        cmd.push_str(&format!(
            ",walltime={:02}:{:02}:00",
            wall_time_minutes / 60,
            wall_time_minutes % 60
        ));
        cmd.push_str(&format!(",mem={}mb", memory_per_core_mib * cores as u64));
        if let Some(q) = queue {
            cmd.push_str(&format!(" -q {q}"));
        }
        cmd.push(' ');
        cmd.push_str(script_name);
        cmd
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        stdout
            .lines()
            .find_map(|line| self.submit_regex.captures(line))
            .map(|c| c["jobid"].to_string())
    }

    fn stat_command(&self, native_job_id: &str) -> String {
        format!("qstat {native_job_id} | grep {native_job_id}")
    }

    fn parse_stat(&self, stdout: &str, native_job_id: &str) -> Option<TaskState> {
        let line = stdout.lines().find(|l| l.contains(native_job_id))?;
        let status = line.split_whitespace().nth(4)?;
        Some(match status {
            "Q" | "H" | "W" | "T" => TaskState::Submitted,
            "R" | "E" => TaskState::Running,
            "S" => TaskState::Stopped,
            "C" => TaskState::Terminating,
            _ => TaskState::Unknown,
        })
    }

    fn accounting_command(&self, native_job_id: &str, _work_dir: &str) -> String {
        format!("tracejob -n 1 {native_job_id}")
    }

    fn parse_accounting(&self, stdout: &str, _stderr: &str) -> Option<AccountingRecord> {
        if stdout.trim().is_empty() {
            return None;
        }
        let exit_status = find_captured(stdout, r"Exit_status=(\d+)").and_then(|s| s.parse().ok());
        let resources_used_walltime = find_captured(stdout, r"resources_used\.walltime=(\d+):(\d+):(\d+)");
        let wall_time_minutes = find_hms_minutes(stdout, r"resources_used\.walltime=(\d+):(\d+):(\d+)");
        let cpu_time_minutes = find_hms_minutes(stdout, r"resources_used\.cput=(\d+):(\d+):(\d+)");
        let memory_used_mib = find_captured(stdout, r"resources_used\.mem=(\d+)kb")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|kb| kb / 1024);
        let _ = resources_used_walltime;
        Some(AccountingRecord {
            exit_status,
            wall_time_minutes,
            cpu_time_minutes,
            memory_used_mib,
            completed_at_epoch_secs: None,
        })
    }

    fn cancel_command(&self, native_job_id: &str) -> String {
        format!("qdel {native_job_id}")
    }

    fn is_already_finished(&self, stderr: &str) -> bool {
        let lower = stderr.to_ascii_lowercase();
        lower.contains("unknown job id") || lower.contains("completed")
    }

    fn listing_command(&self, queue: Option<&str>) -> String {
        match queue {
            Some(q) => format!("qstat -Q {q} && qstat"),
            None => "qstat -Q && qstat".to_string(),
        }
    }

    fn parse_listing(&self, stdout: &str) -> ListingRecord {
        let mut rec = ListingRecord::default();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 6 && fields[4].len() == 1 {
                match fields[4] {
                    "Q" | "H" | "W" | "T" => rec.total_queued += 1,
                    "R" | "E" => rec.total_running += 1,
                    _ => {}
                }
            }
        }
        rec
    }
}

// ---------------------------------------------------------------------------
// SGE / OGS
// ---------------------------------------------------------------------------

pub struct SgeDialect {
    submit_regex: Regex,
}

impl Default for SgeDialect {
    fn default() -> Self {
        Self {
            submit_regex: Regex::new(r#"Your job (?P<jobid>\d+) \(.*\) has been submitted"#)
                .unwrap(),
        }
    }
}

impl Dialect for SgeDialect {
    fn name(&self) -> &str {
        "sge"
    }

    fn submit_command(
        &self,
        work_dir: &str,
        script_name: &str,
        queue: Option<&str>,
        cores: u32,
        wall_time_minutes: u32,
        memory_per_core_mib: u64,
    ) -> String {
        let mut cmd = format!("cd {work_dir} && qsub -cwd -pe smp {cores}");
        cmd.push_str(&format!(
            " -l h_rt={:02}:{:02}:00",
            wall_time_minutes / 60,
            wall_time_minutes % 60
        ));
        cmd.push_str(&format!(" -l mem_free={}M", memory_per_core_mib));
        if let Some(q) = queue {
            cmd.push_str(&format!(" -q {q}"));
        }
        cmd.push(' ');
        cmd.push_str(script_name);
        cmd
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        self.submit_regex
            .captures(stdout)
            .map(|c| c["jobid"].to_string())
    }

    fn stat_command(&self, native_job_id: &str) -> String {
        format!("qstat -j {native_job_id}")
    }

    fn parse_stat(&self, stdout: &str, native_job_id: &str) -> Option<TaskState> {
        if !stdout.contains(native_job_id) {
            return None;
        }
        let lower = stdout.to_ascii_lowercase();
        Some(if lower.contains("error") {
            TaskState::Unknown
        } else if lower.contains("running") || lower.contains(" r ") {
            TaskState::Running
        } else if lower.contains("suspended") {
            TaskState::Stopped
        } else {
            TaskState::Submitted
        })
    }

    fn accounting_command(&self, native_job_id: &str, _work_dir: &str) -> String {
        format!("qacct -j {native_job_id}")
    }

    fn parse_accounting(&self, stdout: &str, _stderr: &str) -> Option<AccountingRecord> {
        if stdout.trim().is_empty() {
            return None;
        }
        let exit_status = find_captured(stdout, r"(?m)^exit_status\s+(\d+)").and_then(|s| s.parse().ok());
        let wall_time_minutes = find_captured(stdout, r"(?m)^ru_wallclock\s+(\d+)")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| secs / 60.0);
        let cpu_time_minutes = find_captured(stdout, r"(?m)^cpu\s+(\d+(?:\.\d+)?)")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| secs / 60.0);
        let memory_used_mib = find_captured(stdout, r"(?m)^maxvmem\s+(\d+)")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|bytes| bytes / (1024 * 1024));
        // SGE accounting timestamps are locale-ambiguous in the source
        // this is derived from; we do not attempt to parse them without an
        // explicit timezone, per the accounting open question.
        Some(AccountingRecord {
            exit_status,
            wall_time_minutes,
            cpu_time_minutes,
            memory_used_mib,
            completed_at_epoch_secs: None,
        })
    }

    fn cancel_command(&self, native_job_id: &str) -> String {
        format!("qdel {native_job_id}")
    }

    fn is_already_finished(&self, stderr: &str) -> bool {
        stderr.to_ascii_lowercase().contains("does not exist")
    }

    fn listing_command(&self, _queue: Option<&str>) -> String {
        "qstat -g c && qstat".to_string()
    }

    fn parse_listing(&self, stdout: &str) -> ListingRecord {
        let mut rec = ListingRecord::default();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 5 && fields[4] == "r" {
                rec.total_running += 1;
            } else if fields.len() >= 5 && fields[4] == "qw" {
                rec.total_queued += 1;
            }
        }
        rec
    }
}

// ---------------------------------------------------------------------------
// LSF
// ---------------------------------------------------------------------------

pub struct LsfDialect {
    submit_regex: Regex,
}

impl Default for LsfDialect {
    fn default() -> Self {
        Self {
            submit_regex: Regex::new(r"Job <(?P<jobid>\d+)> is submitted").unwrap(),
        }
    }
}

impl Dialect for LsfDialect {
    fn name(&self) -> &str {
        "lsf"
    }

    fn submit_command(
        &self,
        work_dir: &str,
        script_name: &str,
        queue: Option<&str>,
        cores: u32,
        wall_time_minutes: u32,
        memory_per_core_mib: u64,
    ) -> String {
        let mut cmd = format!("cd {work_dir} && bsub -n {cores}");
        cmd.push_str(&format!(" -W {wall_time_minutes}"));
        cmd.push_str(&format!(" -R \"rusage[mem={memory_per_core_mib}]\""));
        if let Some(q) = queue {
            cmd.push_str(&format!(" -q {q}"));
        }
        cmd.push(' ');
        cmd.push_str(script_name);
        cmd
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        self.submit_regex
            .captures(stdout)
            .map(|c| c["jobid"].to_string())
    }

    fn stat_command(&self, native_job_id: &str) -> String {
        format!("bjobs -w -W {native_job_id}")
    }

    fn parse_stat(&self, stdout: &str, native_job_id: &str) -> Option<TaskState> {
        let line = stdout.lines().find(|l| l.contains(native_job_id))?;
        let status = line.split_whitespace().nth(2)?;
        Some(match status {
            "PEND" | "PSUSP" | "WAIT" => TaskState::Submitted,
            "RUN" => TaskState::Running,
            "USUSP" | "SSUSP" => TaskState::Stopped,
            "DONE" | "EXIT" => TaskState::Terminating,
            _ => TaskState::Unknown,
        })
    }

    fn accounting_command(&self, native_job_id: &str, work_dir: &str) -> String {
        // LSF has no dedicated accounting command in the source this was
        // distilled from: accounting is absence-of-job plus stdout-file
        // existence.
        format!("bjobs -a -w {native_job_id} || true; ls -la {work_dir}")
    }

    fn parse_accounting(&self, stdout: &str, _stderr: &str) -> Option<AccountingRecord> {
        if stdout.contains("total size") || stdout.lines().count() > 1 {
            Some(AccountingRecord {
                exit_status: None,
                wall_time_minutes: None,
                cpu_time_minutes: None,
                memory_used_mib: None,
                completed_at_epoch_secs: None,
            })
        } else {
            None
        }
    }

    fn cancel_command(&self, native_job_id: &str) -> String {
        format!("bkill {native_job_id}")
    }

    fn is_already_finished(&self, stderr: &str) -> bool {
        stderr.to_ascii_lowercase().contains("is not found")
    }

    fn listing_command(&self, _queue: Option<&str>) -> String {
        "lshosts -w && bqueues && bjobs -a".to_string()
    }

    fn parse_listing(&self, stdout: &str) -> ListingRecord {
        let mut rec = ListingRecord::default();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 3 && fields[2] == "RUN" {
                rec.total_running += 1;
            } else if fields.len() >= 3 && fields[2] == "PEND" {
                rec.total_queued += 1;
            }
        }
        rec
    }
}

fn find_captured(haystack: &str, pattern: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn find_hms_minutes(haystack: &str, pattern: &str) -> Option<f64> {
    let re = Regex::new(pattern).ok()?;
    let c = re.captures(haystack)?;
    let h: f64 = c.get(1)?.as_str().parse().ok()?;
    let m: f64 = c.get(2)?.as_str().parse().ok()?;
    let s: f64 = c.get(3)?.as_str().parse().ok()?;
    Some(h * 60.0 + m + s / 60.0)
}
