//! Markdown 镜像渲染：task_plan.md / findings.md / progress.md
//!
//! 镜像是有损的派生表示，只写不读；每次保存后由存储层重新生成。

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::task::types::{Task, TaskFindings, TaskProgress};

/// 渲染 task_plan.md：阶段清单（步骤勾选框）、关键问题、决策表、错误表、元数据块
pub fn task_plan(task: &Task) -> String {
    let mut md = format!(
        "# Task Plan: {}\n\n## Goal\n{}\n\n## Current Phase\n{}\n\n## Phases\n",
        task.id, task.goal, task.current_phase
    );

    for phase in &task.phases {
        let _ = write!(md, "\n### {}: {}\n", phase.id, phase.name);
        for step in &phase.steps {
            let checkbox = if step.completed { "[x]" } else { "[ ]" };
            let _ = writeln!(md, "- {} {}", checkbox, step.description);
        }
        let _ = writeln!(md, "- **Status:** {}", phase.status);
    }

    if !task.key_questions.is_empty() {
        md.push_str("\n## Key Questions\n");
        for (i, q) in task.key_questions.iter().enumerate() {
            let _ = writeln!(md, "{}. {}", i + 1, q);
        }
    }

    if !task.decisions.is_empty() {
        md.push_str("\n## Decisions Made\n| Decision | Rationale |\n|----------|----------|\n");
        for d in &task.decisions {
            let _ = writeln!(md, "| {} | {} |", d.decision, d.rationale);
        }
    }

    if !task.errors.is_empty() {
        md.push_str(
            "\n## Errors Encountered\n| Error | Attempt | Resolution |\n|-------|---------|------------|\n",
        );
        for e in &task.errors {
            let _ = writeln!(md, "| {} | {} | {} |", e.error, e.attempt, e.resolution);
        }
    }

    let _ = write!(
        md,
        "\n## Notes\n\
         - Update phase status as you progress: pending → in_progress → complete\n\
         - Re-read this plan before major decisions (attention manipulation)\n\
         - Log ALL errors - they help avoid repetition\n\
         - Task Status: {}\n\
         - Created: {}\n\
         - Updated: {}\n",
        task.status,
        task.created_at.to_rfc3339(),
        task.updated_at.to_rfc3339()
    );

    md
}

/// 渲染 findings.md：需求、按类别分组的发现、资源列表
pub fn findings(findings: &TaskFindings) -> String {
    let mut md = format!(
        "# Findings & Decisions\n\n## Task ID\n{}\n\n## Requirements\n",
        findings.task_id
    );

    for req in &findings.requirements {
        let _ = writeln!(md, "- {}", req);
    }

    let research: Vec<_> = findings
        .findings
        .iter()
        .filter(|f| f.category == "research")
        .collect();
    let technical: Vec<_> = findings
        .findings
        .iter()
        .filter(|f| f.category == "technical")
        .collect();
    let visual: Vec<_> = findings
        .findings
        .iter()
        .filter(|f| f.category == "visual")
        .collect();

    if !research.is_empty() {
        md.push_str("\n## Research Findings\n");
        for f in research {
            md.push_str(&format!("- {}", f.content));
            if !f.source.is_empty() {
                md.push_str(&format!(" (Source: {})", f.source));
            }
            md.push('\n');
        }
    }

    if !technical.is_empty() {
        md.push_str("\n## Technical Decisions\n");
        for f in technical {
            let _ = writeln!(md, "- {}", f.content);
        }
    }

    if !visual.is_empty() {
        md.push_str("\n## Visual/Browser Findings\n");
        for f in visual {
            let _ = writeln!(md, "- {}", f.content);
        }
    }

    if !findings.resources.is_empty() {
        md.push_str("\n## Resources\n");
        for r in &findings.resources {
            let _ = writeln!(md, "- {}", r);
        }
    }

    let _ = write!(
        md,
        "\n---\n*Updated: {}*\n*Update this file after every 2 view/browser/search operations*\n",
        findings.updated_at.to_rfc3339()
    );

    md
}

/// 渲染 progress.md：按阶段分组的操作、测试结果表、错误日志表
pub fn progress(progress: &TaskProgress) -> String {
    let mut md = format!(
        "# Progress Log\n\n## Task ID\n{}\n\n## Session: {}\n\n",
        progress.task_id, progress.session_date
    );

    // BTreeMap 保证阶段分组的输出顺序稳定
    let mut by_phase: BTreeMap<&str, Vec<&crate::task::types::ProgressEntry>> = BTreeMap::new();
    for entry in &progress.entries {
        by_phase.entry(entry.phase_id.as_str()).or_default().push(entry);
    }

    for (phase_id, entries) in by_phase {
        let _ = writeln!(md, "### {}", phase_id);
        md.push_str("- Actions taken:\n");
        for entry in entries {
            let _ = writeln!(
                md,
                "  - {} ({})",
                entry.action,
                entry.timestamp.format("%H:%M:%S")
            );
            if !entry.files.is_empty() {
                let _ = writeln!(md, "    Files: {}", entry.files.join(", "));
            }
        }
    }

    if !progress.test_results.is_empty() {
        md.push_str(
            "\n## Test Results\n| Test | Input | Expected | Actual | Status |\n|------|-------|----------|--------|--------|\n",
        );
        for t in &progress.test_results {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} |",
                t.test, t.input, t.expected, t.actual, t.status
            );
        }
    }

    if !progress.error_log.is_empty() {
        md.push_str(
            "\n## Error Log\n| Timestamp | Error | Attempt | Resolution |\n|-----------|-------|---------|------------|\n",
        );
        for e in &progress.error_log {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.error,
                e.attempt,
                e.resolution
            );
        }
    }

    let _ = write!(md, "\n---\n*Updated: {}*\n", progress.updated_at.to_rfc3339());

    md
}
