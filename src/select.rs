//! `loom select`: query stored messages and print them as JSON.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::Args;
use serde::Serialize;

use threadloom_core::fetch::parse_date_spec;
use threadloom_core::models::{CanonicalMessage, Classification, Enrichment, SourceType};
use threadloom_core::store::{MessageQuery, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Args)]
pub struct SelectArgs {
    /// `slack` or `github`.
    #[arg(long)]
    pub source: Option<SourceType>,

    #[arg(long)]
    pub channel: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    /// Thread id (the root message id).
    #[arg(long)]
    pub thread: Option<String>,

    /// On or after this day: `7d`, `2w` or `YYYY-MM-DD`.
    #[arg(long)]
    pub since: Option<String>,

    /// On or before this day: `7d`, `2w` or `YYYY-MM-DD`.
    #[arg(long)]
    pub until: Option<String>,

    /// Case-insensitive substring match on content.
    #[arg(long)]
    pub search: Option<String>,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub offset: Option<usize>,

    /// Only messages enriched as questions (or, with `=false`, not).
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub is_question: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub has_code: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub has_links: Option<bool>,

    /// Messages with a `>` quoted line.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub has_quotes: Option<bool>,

    /// One JSON object per line instead of a JSON array.
    #[arg(long)]
    pub jsonl: bool,

    /// Attach stored classifications and enrichment to each message.
    #[arg(long)]
    pub with_classifications: bool,
}

#[derive(Serialize)]
struct SelectedMessage {
    #[serde(flatten)]
    message: CanonicalMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    classifications: Option<Vec<Classification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrichment: Option<Enrichment>,
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::default()).and_utc()
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    let last = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or_default();
    day.and_time(last).and_utc()
}

impl SelectArgs {
    pub fn to_query(&self, today: NaiveDate) -> Result<MessageQuery> {
        let since = self
            .since
            .as_deref()
            .map(|s| parse_date_spec(s, today))
            .transpose()?;
        let until = self
            .until
            .as_deref()
            .map(|s| parse_date_spec(s, today))
            .transpose()?;
        Ok(MessageQuery {
            source_type: self.source,
            channel_id: self.channel.clone(),
            author_id: self.author.clone(),
            thread_id: self.thread.clone(),
            since: since.map(start_of_day),
            until: until.map(end_of_day),
            search: self.search.clone(),
            limit: self.limit,
            offset: self.offset,
            is_question: self.is_question,
            has_code: self.has_code,
            has_links: self.has_links,
            has_quotes: self.has_quotes,
        })
    }
}

pub async fn run_select(config: &Config, args: &SelectArgs) -> Result<()> {
    let query = args.to_query(Utc::now().date_naive())?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let messages = store.select_messages(&query).await?;
    let mut selected = Vec::with_capacity(messages.len());
    for message in messages {
        let (classifications, enrichment) = if args.with_classifications {
            (
                Some(store.classifications_for(&message.id).await?),
                store.enrichment_for(&message.id).await?,
            )
        } else {
            (None, None)
        };
        selected.push(SelectedMessage {
            message,
            classifications,
            enrichment,
        });
    }
    pool.close().await;

    if args.jsonl {
        for item in &selected {
            println!("{}", serde_json::to_string(item)?);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&selected)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_bounds_cover_whole_days() {
        let args = SelectArgs {
            source: Some(SourceType::GitHub),
            channel: None,
            author: None,
            thread: None,
            since: Some("2024-03-01".into()),
            until: Some("0d".into()),
            search: Some("deploy".into()),
            limit: Some(10),
            offset: Some(20),
            is_question: Some(true),
            has_code: None,
            has_links: Some(false),
            has_quotes: None,
            jsonl: false,
            with_classifications: false,
        };
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let query = args.to_query(today).unwrap();
        assert_eq!(query.since.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(
            query.until.unwrap().to_rfc3339(),
            "2024-03-15T23:59:59.999999+00:00"
        );
        assert_eq!(query.offset, Some(20));
        assert_eq!(query.is_question, Some(true));
        assert_eq!(query.has_links, Some(false));
        assert!(query.filters_enrichment());
    }
}
