//! Operator summary printed at the end of every run.

use std::fmt::{self, Write};
use std::path::PathBuf;

use console::style;

use crate::step::{RunResult, StepStatus};
use crate::verify::{Presence, Verified};

const RULE: &str = "────────────────────────────────────────────────────────────";

/// Everything besides outcomes that ends up in the summary.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub color: bool,
    pub log_path: Option<PathBuf>,
    /// Preflight warnings.
    pub warnings: Vec<String>,
    /// Manual follow-up instructions from the plan.
    pub follow_up: Vec<String>,
    /// Verification only; the step runner did not run.
    pub verify_only: bool,
}

/// Render the summary. Never fails.
pub fn render(run: &RunResult, verified: &[Verified], ctx: &ReportContext) -> String {
    let mut out = String::new();
    match write_report(&mut out, run, verified, ctx) {
        Ok(()) => out,
        Err(_) => "summary unavailable\n".to_string(),
    }
}

fn write_report(
    out: &mut String,
    run: &RunResult,
    verified: &[Verified],
    ctx: &ReportContext,
) -> fmt::Result {
    let paint = Painter(ctx.color);

    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    if run.cancelled {
        writeln!(out, "{}", paint.banner("RUN INTERRUPTED"))?;
        writeln!(
            out,
            "Stopped by operator. Re-run to continue; completed steps will be skipped."
        )?;
    } else if run.aborted {
        writeln!(out, "{}", paint.banner("PROVISIONING ABORTED"))?;
    } else {
        writeln!(out, "PROVISIONING SUMMARY")?;
    }
    writeln!(out, "{RULE}")?;

    if !ctx.verify_only {
        writeln!(out, "Steps:")?;
        if run.outcomes.is_empty() {
            writeln!(out, "  (none executed)")?;
        }
        for outcome in &run.outcomes {
            let attempts = if outcome.attempts > 1 {
                format!(" after {} attempts", outcome.attempts)
            } else {
                String::new()
            };
            writeln!(
                out,
                "  {} {}{}",
                paint.status(outcome.status),
                outcome.step_name,
                attempts
            )?;
            if let Some(detail) = &outcome.detail {
                if outcome.status != StepStatus::Succeeded {
                    writeln!(out, "        {detail}")?;
                }
            }
        }
        writeln!(out)?;
        write!(
            out,
            "  {} succeeded, {} already satisfied, {} failed (tolerated), {} fatal",
            run.count(StepStatus::Succeeded),
            run.count(StepStatus::SkippedAlreadySatisfied),
            run.count(StepStatus::FailedTolerated),
            run.count(StepStatus::FailedFatal),
        )?;
        if run.cancelled {
            write!(out, ", {} interrupted", run.count(StepStatus::Cancelled))?;
        }
        writeln!(out)?;
        writeln!(out)?;
    }

    writeln!(out, "Verification:")?;
    if verified.is_empty() {
        writeln!(out, "  (nothing to verify)")?;
    }
    for item in verified {
        write!(out, "  {} {}", paint.presence(item.status), item.capability_name)?;
        if let Some(detail) = &item.detail {
            write!(out, " ({detail})")?;
        }
        writeln!(out)?;
    }
    let present = verified.iter().filter(|item| item.is_present()).count();
    writeln!(out)?;
    writeln!(out, "  {present}/{} capabilities present", verified.len())?;

    if !ctx.warnings.is_empty() {
        writeln!(out)?;
        writeln!(out, "Warnings:")?;
        for warning in &ctx.warnings {
            writeln!(out, "  - {warning}")?;
        }
    }

    if !ctx.follow_up.is_empty() {
        writeln!(out)?;
        writeln!(out, "Next steps:")?;
        for item in &ctx.follow_up {
            writeln!(out, "  - {item}")?;
        }
    }

    if let Some(path) = &ctx.log_path {
        writeln!(out)?;
        writeln!(out, "Full log: {}", path.display())?;
    }
    writeln!(out, "{RULE}")?;
    Ok(())
}

struct Painter(bool);

impl Painter {
    fn banner(&self, text: &str) -> String {
        if self.0 {
            style(text).red().bold().force_styling(true).to_string()
        } else {
            text.to_string()
        }
    }

    fn status(&self, status: StepStatus) -> String {
        let tag = match status {
            StepStatus::Succeeded => "[ OK ]",
            StepStatus::SkippedAlreadySatisfied => "[SKIP]",
            StepStatus::FailedTolerated => "[FAIL]",
            StepStatus::FailedFatal => "[FATL]",
            StepStatus::Cancelled => "[INTR]",
        };
        if !self.0 {
            return tag.to_string();
        }
        let styled = style(tag);
        match status {
            StepStatus::Succeeded => styled.green(),
            StepStatus::SkippedAlreadySatisfied => styled.dim(),
            StepStatus::FailedTolerated => styled.yellow(),
            StepStatus::FailedFatal => styled.red().bold(),
            StepStatus::Cancelled => styled.magenta().bold(),
        }
        .force_styling(true)
        .to_string()
    }

    fn presence(&self, presence: Presence) -> String {
        let tag = match presence {
            Presence::Present => "[PRESENT]",
            Presence::Missing => "[MISSING]",
        };
        if !self.0 {
            return tag.to_string();
        }
        match presence {
            Presence::Present => style(tag).green(),
            Presence::Missing => style(tag).red(),
        }
        .force_styling(true)
        .to_string()
    }
}
