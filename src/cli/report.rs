use std::{fmt::Display, path::PathBuf};

use ansi_term::{Colour, Style};
use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, Utc};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};

use crate::{
    reporting::{
        entities::ActivitySummary,
        storage::{ReportStorage, ReportStorageImpl},
    },
    utils::time::format_hms,
};

use super::Args;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Parser)]
pub struct ReportCommand {
    #[arg(
        long,
        short,
        help = "Day to summarize. Examples are \"today\", \"yesterday\", \"15/03/2025\". Days are UTC days"
    )]
    date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

/// Prints totals of every report stored for one day.
pub async fn process_report_command(
    ReportCommand { date, date_style }: ReportCommand,
    dir: PathBuf,
) -> Result<()> {
    let day = parse_day(date, date_style, Utc::now())?;
    let storage = ReportStorageImpl::new(dir.join("reports"))?;
    let reports = storage.reports_for(day).await?;
    let summary = reports.iter().collect::<ActivitySummary>();

    print!("{}", render_summary(day, &summary));
    Ok(())
}

fn parse_day(date: Option<String>, date_style: DateStyle, now: DateTime<Utc>) -> Result<NaiveDate> {
    match date.map(|s| parse_date_string(&s, now, date_style.into())) {
        Some(Ok(v)) => Ok(v.date_naive()),
        Some(Err(e)) => Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Failed to validate date {e}"),
            )
            .into()),
        None => Ok(now.date_naive()),
    }
}

fn render_summary(day: NaiveDate, summary: &ActivitySummary) -> String {
    let heading = Style::new().bold();
    let mut out = format!("{}\n", heading.paint(format!("Activity for {day}")));
    if summary.reports == 0 {
        out.push_str(&format!("{}\n", Colour::Yellow.paint("Nothing was reported")));
        return out;
    }

    let span = match (summary.first, summary.last) {
        (Some(first), Some(last)) => format!(
            "{} - {}",
            first.with_timezone(&Local).format("%H:%M:%S"),
            last.with_timezone(&Local).format("%H:%M:%S")
        ),
        _ => String::new(),
    };
    let rows = [
        ("Tracked", Colour::Green.paint(format_hms(summary.tracked_seconds)).to_string()),
        ("Reports", format!("{} ({span})", summary.reports)),
        ("Keys", summary.key_events.to_string()),
        ("Mouse clicks", summary.mouse_events.to_string()),
        ("Mouse motion", summary.mouse_motion.to_string()),
        ("Screenshots", summary.screenshots.to_string()),
    ];
    for (name, value) in rows {
        out.push_str(&format!("{name:<14}{value}\n"));
    }
    out
}
