//! Command execution.

use crate::Commands;
use chrono::{TimeZone, Utc};
use colored::Colorize;
use mmjournal_storage::replay_journal;
use mmjournal_wal::{
    journal_file::journal_filename, read_sections, remove_journal_files, verify_journal,
    DurableOp, JournalFileScanner, JournalSection, ScanReport, ScanStop,
};
use serde::Serialize;
use serde_json::json;
use std::path::Path;

/// Exit code when the journal ends in a corrupt section after valid ones.
pub const EXIT_CORRUPT: i32 = 1;

/// Exit code when the journal holds nothing recovery could start from.
pub const EXIT_UNRECOVERABLE: i32 = 2;

/// Text to print and the status to exit with.
pub struct Outcome {
    pub output: String,
    pub exit_code: i32,
}

impl Outcome {
    fn ok(output: String) -> Self {
        Self {
            output,
            exit_code: 0,
        }
    }
}

/// Executes a command and returns the formatted output.
pub fn execute(cmd: Commands, json: bool) -> Result<Outcome, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Inspect {
            journal_dir,
            sections,
        } => inspect(&journal_dir, sections, json).map(Outcome::ok),

        Commands::Verify { journal_dir } => {
            let report = verify_journal(&journal_dir)?;
            let output = if json {
                serde_json::to_string_pretty(&report)?
            } else {
                format_report(&report)
            };
            Ok(Outcome {
                output,
                exit_code: exit_code(&report),
            })
        }

        Commands::Recover {
            data_dir,
            journal_dir,
            keep_journal,
            dry_run,
        } => {
            let journal_dir = journal_dir.unwrap_or_else(|| data_dir.join("journal"));
            recover(&data_dir, &journal_dir, keep_journal, dry_run, json)
        }
    }
}

#[derive(Serialize)]
struct FileSummary {
    file: String,
    len: u64,
    sections: usize,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    range_bytes: u64,
    clean_tail: bool,
    torn_tail: bool,
    error: Option<String>,
}

fn inspect(dir: &Path, show_sections: bool, json: bool) -> Result<String, Box<dyn std::error::Error>> {
    let ids = JournalFileScanner::list_files(dir)?;
    if ids.is_empty() {
        return Ok(if json {
            "[]".to_string()
        } else {
            "No journal files".yellow().to_string()
        });
    }

    let mut summaries = Vec::new();
    let mut output = String::new();

    for id in ids {
        let path = JournalFileScanner::path_of(dir, id);
        let contents = read_sections(&path)?;
        let summary = FileSummary {
            file: journal_filename(id),
            len: contents.len,
            sections: contents.sections.len(),
            first_sequence: contents.sections.first().map(|(_, s)| s.header.sequence),
            last_sequence: contents.sections.last().map(|(_, s)| s.header.sequence),
            range_bytes: contents
                .sections
                .iter()
                .map(|(_, s)| s.body.range_bytes())
                .sum(),
            clean_tail: contents.clean_tail,
            torn_tail: contents.torn_tail,
            error: contents.error.as_ref().map(|e| e.to_string()),
        };

        if !json {
            output.push_str(&format_file(&summary));
            if show_sections {
                for (offset, section) in &contents.sections {
                    output.push_str(&format_section(*offset, section));
                }
            }
        }
        summaries.push(summary);
    }

    if json {
        return Ok(serde_json::to_string_pretty(&summaries)?);
    }
    Ok(output.trim_end().to_string())
}

fn recover(
    data_dir: &Path,
    journal_dir: &Path,
    keep_journal: bool,
    dry_run: bool,
    json: bool,
) -> Result<Outcome, Box<dyn std::error::Error>> {
    let report = verify_journal(journal_dir)?;
    if report.is_unrecoverable() || dry_run {
        let mut output = if json {
            serde_json::to_string_pretty(&report)?
        } else {
            format_report(&report)
        };
        if report.is_unrecoverable() && !json {
            output.push_str(&format!(
                "\n{}: refusing to replay; move the journal aside after checking the data files",
                "Unrecoverable".red().bold()
            ));
        }
        return Ok(Outcome {
            output,
            exit_code: exit_code(&report),
        });
    }

    std::fs::create_dir_all(data_dir)?;
    let outcome = replay_journal(journal_dir, data_dir)?;
    let removed = if keep_journal {
        0
    } else {
        remove_journal_files(journal_dir)?
    };

    let output = if json {
        serde_json::to_string_pretty(&json!({
            "report": outcome.report,
            "ops": outcome.applied.ops,
            "ranges": outcome.applied.ranges,
            "bytes": outcome.applied.bytes,
            "files_touched": outcome.files.files_touched,
            "files_created": outcome.files.files_created,
            "files_extended": outcome.files.files_extended,
            "journal_files_removed": removed,
        }))?
    } else {
        format!(
            "{} {} sections ({} ranges, {} bytes) into {} files ({} created, {} extended)\n{}: {}",
            "Replayed".green(),
            outcome.report.valid_sections,
            outcome.applied.ranges,
            outcome.applied.bytes,
            outcome.files.files_touched,
            outcome.files.files_created,
            outcome.files.files_extended,
            "Journal files removed".dimmed(),
            removed
        )
    };

    Ok(Outcome {
        output,
        exit_code: 0,
    })
}

fn exit_code(report: &ScanReport) -> i32 {
    if report.is_unrecoverable() {
        EXIT_UNRECOVERABLE
    } else if matches!(report.stop, ScanStop::Corrupt { .. }) {
        EXIT_CORRUPT
    } else {
        0
    }
}

fn format_file(summary: &FileSummary) -> String {
    let range = match (summary.first_sequence, summary.last_sequence) {
        (Some(first), Some(last)) => format!("seq {}..={}", first, last),
        _ => "empty".to_string(),
    };
    let tail = match (&summary.error, summary.clean_tail) {
        (Some(e), _) if summary.torn_tail => format!("{}: {}", "torn section".yellow(), e),
        (Some(e), _) => format!("{}: {}", "damaged".red(), e),
        (None, true) => "clean".green().to_string(),
        (None, false) => "trailing bytes".yellow().to_string(),
    };
    format!(
        "{}  {} bytes, {} sections, {}, {} range bytes, {}\n",
        summary.file.cyan(),
        summary.len,
        summary.sections,
        range,
        summary.range_bytes,
        tail
    )
}

fn format_section(offset: u64, section: &JournalSection) -> String {
    let header = &section.header;
    let when = Utc
        .timestamp_millis_opt(header.timestamp_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| header.timestamp_ms.to_string());

    let mut line = format!(
        "  @{:<10} seq {:<8} {}  {} ranges, {} bytes, {} on disk{}\n",
        offset,
        header.sequence.to_string().cyan(),
        when.dimmed(),
        section.body.ranges.len(),
        section.body.range_bytes(),
        section.disk_size(),
        if header.compressed { " (zstd)" } else { "" }
    );
    for op in &section.body.ops {
        match op {
            DurableOp::FileCreated { name, len } => {
                line.push_str(&format!(
                    "    {} {} ({} bytes)\n",
                    "created".yellow(),
                    name,
                    len
                ));
            }
        }
    }
    line
}

fn format_report(report: &ScanReport) -> String {
    let stop = match &report.stop {
        ScanStop::End => "clean end".green().to_string(),
        ScanStop::Truncated { file_id, offset } => format!(
            "{} in {} at {}",
            "torn tail".yellow(),
            journal_filename(*file_id),
            offset
        ),
        ScanStop::Corrupt {
            file_id,
            offset,
            reason,
        } => format!(
            "{} in {} at {}: {}",
            "corrupt section".red(),
            journal_filename(*file_id),
            offset,
            reason
        ),
    };

    format!(
        "{}\n  {}: {}\n  {}: {}\n  {}: {}\n  {}: {}\n  {}: {}\n  {}: {}",
        "Journal scan".bold(),
        "Files scanned".dimmed(),
        report.files_scanned,
        "Valid sections".dimmed(),
        report.valid_sections,
        "Range bytes".dimmed(),
        report.range_bytes,
        "Last sequence".dimmed(),
        report.max_sequence,
        "Discarded bytes".dimmed(),
        report.bytes_discarded,
        "Stopped at".dimmed(),
        stop
    )
}
