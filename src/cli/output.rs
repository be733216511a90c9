//! CLI output formatting

use crate::{
    core::{Run, RunStatus, StageResult, StageStatus},
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "x ");

/// Format a stage status for display
pub fn format_stage_status(status: StageStatus) -> String {
    match status {
        StageStatus::Skipped => style("SKIPPED").dim().to_string(),
        StageStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StageStatus::Failed => style("FAILED").red().to_string(),
        StageStatus::Unstable => style("UNSTABLE").yellow().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Succeeded => style("SUCCEEDED").green().bold().to_string(),
        RunStatus::Unstable => style("UNSTABLE").yellow().bold().to_string(),
        RunStatus::Failed => style("FAILED").red().bold().to_string(),
        RunStatus::Aborted => style("ABORTED").magenta().bold().to_string(),
    }
}

fn status_icon(status: RunStatus) -> Emoji<'static, 'static> {
    match status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Unstable => WARN,
        RunStatus::Failed => CROSS,
        RunStatus::Aborted => STOP,
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Format run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let build = summary
        .build_number
        .map(|n| format!("#{}", n))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} - {} {} - {} - {}",
        status_icon(summary.status),
        style(short_id(&summary.run_id)).dim(),
        style(&summary.pipeline).bold(),
        style(build).cyan(),
        format_status(summary.status),
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline,
            build_number,
            stages,
        } => format!(
            "{} Starting pipeline {}{} ({}, {} stages)",
            ROCKET,
            style(pipeline).bold(),
            build_number.map(|n| format!(" #{}", n)).unwrap_or_default(),
            style(short_id(run_id)).dim(),
            stages
        ),
        ExecutionEvent::StageStarted { stage, index } => {
            format!(
                "{} {} {}",
                SPINNER,
                style(format!("[{}]", index + 1)).dim(),
                style(stage).cyan()
            )
        }
        ExecutionEvent::StageSkipped { stage, reason } => {
            format!("{} {} {}", SKIP, style(stage).dim(), style(format!("({})", reason)).dim())
        }
        ExecutionEvent::ActionStarted { command, .. } => {
            format!("    {} {}", style("$").dim(), style(command).dim())
        }
        ExecutionEvent::ActionFinished {
            success: false,
            exit_code,
            ..
        } => format!(
            "    {}",
            style(match exit_code {
                Some(code) => format!("exit code {}", code),
                None => "no exit code".to_string(),
            })
            .red()
        ),
        ExecutionEvent::ActionFinished { .. } => return None,
        ExecutionEvent::StageFinished {
            stage,
            status,
            duration_ms,
        } => {
            let icon = match status {
                StageStatus::Succeeded => CHECK,
                StageStatus::Unstable => WARN,
                StageStatus::Skipped => SKIP,
                StageStatus::Failed => CROSS,
            };
            format!(
                "{} {} {} {}",
                icon,
                style(stage).bold(),
                format_stage_status(*status),
                style(format_duration(std::time::Duration::from_millis(*duration_ms))).dim()
            )
        }
        ExecutionEvent::PipelineFinished { run_id, status } => format!(
            "{} Pipeline ({}) finished: {}",
            status_icon(*status),
            style(short_id(run_id)).dim(),
            format_status(*status)
        ),
    };
    Some(line)
}

/// Stage-by-stage breakdown printed after a run
pub fn format_run_report(run: &Run, show_output: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {} {}",
        status_icon(run.status()),
        style(&run.pipeline).bold(),
        format_status(run.status())
    ));
    if let Some(error) = &run.fatal_error {
        lines.push(format!("  {} {}", style("error:").red(), error));
    }
    for result in &run.results {
        lines.push(format_stage_line(result));
        let failed = matches!(result.status, StageStatus::Failed | StageStatus::Unstable);
        if show_output || failed {
            let output = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            if !output.trim().is_empty() {
                for line in format_output(output.trim_end(), 10).lines() {
                    lines.push(format!("      {}", line));
                }
            }
        }
    }
    lines.join("\n")
}

fn format_stage_line(result: &StageResult) -> String {
    let mut line = format!("  {:<20} {}", result.stage, format_stage_status(result.status));
    if let Some(detail) = result.error.as_ref().or(result.reason.as_ref()) {
        line.push_str(&format!(" {}", style(format!("- {}", detail)).dim()));
    }
    if let Some(log) = &result.log_file {
        line.push_str(&format!(" {}", style(format!("[{}]", log.display())).dim()));
    }
    line
}

/// Format step output with truncation, keeping the last lines
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let tail = lines[lines.len() - max_lines..].join("\n");
        format!(
            "{} ({} earlier lines)\n{}",
            style("[truncated]").dim(),
            lines.len() - max_lines,
            tail
        )
    }
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
