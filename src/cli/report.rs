use std::{fmt::Display, path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::{Duration, Local, NaiveDate, Utc};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};
use now::DateTimeNow;

use crate::{
    engine::{
        identity::IdentityResolver, rules::ResolverRules, AggregationEngine, EngineConfig,
        FilterOutcome,
    },
    store::day_file::DayFileStore,
    utils::clock::SystemClock,
};

use super::{create_application_default_path, Args};

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
pub struct DayCommand {
    #[arg(
        long,
        short,
        help = "Day to report. Examples are \"today\", \"yesterday\", \"15/03/2025\""
    )]
    date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
    #[arg(
        long,
        help = "Path to a json file overriding the built-in alias and noise tables"
    )]
    rules: Option<PathBuf>,
}

/// Command to process the `day` command: how long each application held focus on
/// one day, with the interval-merged active total underneath.
pub async fn process_day_command(
    DayCommand {
        date,
        date_style,
        rules,
    }: DayCommand,
) -> Result<()> {
    let date = match date {
        Some(raw) => parse_cli_date(&raw, date_style)?,
        None => Local::now().date_naive(),
    };

    let engine = open_engine(rules)?;
    let records = engine.detail_view_for_date(date).await?;
    let total = engine.total_active_time(&records);

    let now = Utc::now();
    for record in &records {
        println!(
            "{}\t{}\t{}",
            format_duration(record.duration_at(now)),
            record.process_identity,
            record.display_title
        );
    }
    if !records.is_empty() {
        println!();
    }
    println!("active\t{}", format_duration(total));
    Ok(())
}

#[derive(Debug, Parser)]
pub struct RangeCommand {
    #[arg(
        long = "start",
        short,
        help = "Start of the range. Examples are \"yesterday\", \"last monday\", \"15/03/2025\". Defaults to the beginning of the current week"
    )]
    start_date: Option<String>,
    #[arg(long = "end", short, help = "End of the range. Defaults to today")]
    end_date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
    #[arg(
        long = "per-day",
        help = "List each day separately instead of one roll-up per application"
    )]
    per_day: bool,
    #[arg(long, help = "Keep only the first N applications")]
    limit: Option<usize>,
    #[arg(
        long,
        help = "Path to a json file overriding the built-in alias and noise tables"
    )]
    rules: Option<PathBuf>,
}

/// Command to process the `range` command: aggregated focus time between two
/// dates, or a per-day listing with --per-day.
pub async fn process_range_command(
    RangeCommand {
        start_date,
        end_date,
        date_style,
        per_day,
        limit,
        rules,
    }: RangeCommand,
) -> Result<()> {
    let start = match start_date {
        Some(raw) => parse_cli_date(&raw, date_style)?,
        None => Local::now().beginning_of_week().date_naive(),
    };
    let end = match end_date {
        Some(raw) => parse_cli_date(&raw, date_style)?,
        None => Local::now().date_naive(),
    };

    let engine = open_engine(rules)?;

    if per_day {
        let records = engine.detail_records_for_range(start, end).await?;
        let now = Utc::now();
        for record in &records {
            println!(
                "{}\t{}\t{}\t{}",
                record.date.format("%x"),
                format_duration(record.duration_at(now)),
                record.process_identity,
                record.display_title
            );
        }
        return Ok(());
    }

    let summary = engine.aggregated_view_for_range(start, end, false).await?;
    let shown = match limit {
        Some(limit) => limit.min(summary.entries.len()),
        None => summary.entries.len(),
    };
    for usage in &summary.entries[..shown] {
        println!(
            "{}\t{}",
            format_duration(usage.duration),
            usage.process_identity
        );
    }
    if summary.filter == FilterOutcome::Lenient {
        println!();
        println!("Only background activity was recorded in this range.");
    }
    Ok(())
}

fn parse_cli_date(raw: &str, date_style: DateStyle) -> Result<NaiveDate> {
    match parse_date_string(raw, Local::now(), date_style.into()) {
        Ok(parsed) => Ok(parsed.date_naive()),
        Err(e) => Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Failed to validate date {raw}: {e}"),
            )
            .into()),
    }
}

fn open_engine(rules: Option<PathBuf>) -> Result<AggregationEngine<DayFileStore>> {
    let rules = match rules {
        Some(path) => ResolverRules::load(&path)?,
        None => ResolverRules::default(),
    };
    let store = DayFileStore::new(
        create_application_default_path()?.join("records"),
        Box::new(SystemClock),
    )?;
    Ok(AggregationEngine::new(
        store,
        Arc::new(IdentityResolver::new(rules)),
        Box::new(SystemClock),
        None,
        EngineConfig::default(),
    ))
}

fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}
