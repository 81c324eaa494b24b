// Rendering scan results as text or NDJSON

use std::io::{self, Write};

use colored::*;
use serde_json::{json, Value};

use crate::collect::HostInventory;
use crate::engine::aggregate::recap;
use crate::engine::{HostResult, ResultStatus, ScanRecap};

/// JSON line for one host result
pub fn result_to_json(result: &HostResult<HostInventory>) -> Value {
    let status = match result.status() {
        ResultStatus::Ok => "ok",
        ResultStatus::Failed => "failed",
        ResultStatus::TimedOut => "timed_out",
    };

    json!({
        "job_id": result.job_id.0,
        "target": result.target,
        "mode": result.mode,
        "timestamp": result.timestamp.to_rfc3339(),
        "duration_ms": result.duration.as_millis() as u64,
        "status": status,
        "error": result.error().map(|e| e.to_string()),
        "result": result.value(),
    })
}

/// Write one JSON object per line
pub fn write_json<W: Write>(out: &mut W, results: &[HostResult<HostInventory>]) -> io::Result<()> {
    for result in results {
        let line = serde_json::to_string(&result_to_json(result))?;
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

/// Human-readable report with a recap line
pub fn write_text<W: Write>(
    out: &mut W,
    results: &[HostResult<HostInventory>],
    verbose: bool,
) -> io::Result<()> {
    for result in results {
        let status = match result.status() {
            ResultStatus::Ok => "OK".green(),
            ResultStatus::Failed => "FAILED".red().bold(),
            ResultStatus::TimedOut => "TIMEOUT".yellow().bold(),
        };

        writeln!(
            out,
            "{} {} {} {}",
            status,
            "=>".dimmed(),
            result.target.white().bold(),
            format!("({}, {}ms)", result.mode, result.duration.as_millis()).dimmed()
        )?;

        match &result.outcome {
            Ok(inventory) => {
                if inventory.hostname != result.target {
                    writeln!(out, "    {} {}", "hostname:".dimmed(), inventory.hostname)?;
                }
                if inventory.tasks.is_empty() {
                    writeln!(out, "    {}", "no scheduled tasks".dimmed())?;
                }
                for task in &inventory.tasks {
                    let user = task.user.as_deref().unwrap_or("-");
                    writeln!(
                        out,
                        "    {:<24} {:<16} {:<10} {}",
                        task.name.cyan(),
                        task.schedule,
                        user,
                        task.command
                    )?;
                    if verbose {
                        if let Some(ref next) = task.next_run {
                            writeln!(out, "      {} {}", "next:".dimmed(), next)?;
                        }
                    }
                }
            }
            Err(e) => writeln!(out, "    {}", e.to_string().red())?,
        }
    }

    write_recap(out, &recap(results))
}

fn write_recap<W: Write>(out: &mut W, recap: &ScanRecap) -> io::Result<()> {
    let ok = format!("ok={}", recap.ok).green();
    let failed = if recap.failed > 0 {
        format!("failed={}", recap.failed).red().bold()
    } else {
        format!("failed={}", recap.failed).normal()
    };
    let timed_out = if recap.timed_out > 0 {
        format!("timed_out={}", recap.timed_out).yellow().bold()
    } else {
        format!("timed_out={}", recap.timed_out).normal()
    };

    writeln!(out)?;
    writeln!(out, "{}", "SCAN RECAP".green().bold())?;
    writeln!(out, "{}", "─".repeat(60).dimmed())?;
    writeln!(out, "{} hosts : {}    {}    {}", recap.total(), ok, failed, timed_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{ScheduledTask, TaskSource};
    use crate::engine::{ConnectionMode, JobError, JobId};
    use chrono::Utc;
    use std::time::Duration;

    fn inventory() -> HostInventory {
        HostInventory {
            target: "web01".to_string(),
            hostname: "web01.prod".to_string(),
            tasks: vec![ScheduledTask {
                name: "backup.sh".to_string(),
                schedule: "0 2 * * *".to_string(),
                command: "/opt/backup.sh".to_string(),
                user: Some("root".to_string()),
                source: TaskSource::CronFile("/etc/cron.d/backup".to_string()),
                next_run: None,
            }],
        }
    }

    fn results() -> Vec<HostResult<HostInventory>> {
        vec![
            HostResult {
                job_id: JobId(1),
                target: "web01".to_string(),
                mode: ConnectionMode::Remote,
                timestamp: Utc::now(),
                duration: Duration::from_millis(42),
                outcome: Ok(inventory()),
            },
            HostResult {
                job_id: JobId(2),
                target: "db01".to_string(),
                mode: ConnectionMode::Remote,
                timestamp: Utc::now(),
                duration: Duration::from_millis(200),
                outcome: Err(JobError::Timeout {
                    elapsed: Duration::from_millis(200),
                    limit: Duration::from_millis(200),
                }),
            },
        ]
    }

    #[test]
    fn test_json_lines() {
        let mut buf = Vec::new();
        write_json(&mut buf, &results()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "ok");
        assert_eq!(lines[0]["mode"], "remote");
        assert_eq!(lines[0]["result"]["tasks"][0]["user"], "root");
        assert!(lines[0]["error"].is_null());
        assert_eq!(lines[1]["status"], "timed_out");
        assert_eq!(lines[1]["duration_ms"], 200);
        assert!(lines[1]["result"].is_null());
    }

    #[test]
    fn test_text_report() {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        write_text(&mut buf, &results(), false).unwrap();
        let text = console::strip_ansi_codes(&String::from_utf8(buf).unwrap()).to_string();

        assert!(text.contains("OK => web01"));
        assert!(text.contains("hostname: web01.prod"));
        assert!(text.contains("backup.sh"));
        assert!(text.contains("TIMEOUT => db01"));
        assert!(text.contains("timed out after 200ms"));
        assert!(text.contains("2 hosts"));
        assert!(text.contains("timed_out=1"));
    }
}
