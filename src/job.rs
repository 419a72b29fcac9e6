//! Turns a submitted form or JSON body into a validated upload job.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::DEFAULT_CATEGORY_ID;
use crate::error::{Error, Result};
use crate::normalize::normalize_video_url;
use crate::security::random_token;
use crate::upload::{Privacy, VideoMetadata};

const SCHEDULE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];
const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_BYTES: usize = 5000;
const MAX_TAGS_CHARS: usize = 500;
const FALLBACK_TITLE: &str = "Untitled";

/// Raw submission as posted by a browser form or a JSON client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub privacy_status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub for_kids: bool,
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagsField {
    List(Vec<String>),
    Text(String),
}

fn deserialize_tags<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<TagsField>::deserialize(deserializer)? {
        Some(TagsField::List(tags)) => tags,
        Some(TagsField::Text(text)) => text.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagField {
    Bool(bool),
    Text(String),
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<FlagField>::deserialize(deserializer)? {
        Some(FlagField::Bool(flag)) => flag,
        Some(FlagField::Text(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        None => false,
    })
}

/// A validated, normalized job. Lives for one request, or until the
/// authorization round-trip that interrupted it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub id: String,
    pub source_url: String,
    pub title: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
    pub made_for_kids: bool,
    pub publish_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    pub fn from_submission(submission: Submission, offset: FixedOffset) -> Result<Self> {
        let url = submission.url.trim();
        if url.is_empty() {
            return Err(Error::invalid("url is required"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::invalid("url must start with http:// or https://"));
        }

        let publish_at = match non_blank(submission.schedule_time.as_deref()) {
            Some(text) => Some(parse_schedule(text, offset)?),
            None => None,
        };

        let privacy = match non_blank(submission.privacy_status.as_deref()) {
            Some(text) => text.parse::<Privacy>()?,
            None => Privacy::Private,
        };
        if publish_at.is_some() && privacy != Privacy::Private {
            return Err(Error::invalid(format!(
                "a scheduled upload must be private until it publishes, got {privacy}"
            )));
        }

        let category_id = match non_blank(submission.category_id.as_deref()) {
            Some(text) if text.chars().all(|c| c.is_ascii_digit()) => text.to_string(),
            Some(text) => {
                return Err(Error::invalid(format!(
                    "category_id must be numeric, got {text:?}"
                )));
            }
            None => DEFAULT_CATEGORY_ID.to_string(),
        };

        Ok(Self {
            id: random_token(9),
            source_url: normalize_video_url(url),
            title: non_blank(submission.title.as_deref()).map(str::to_string),
            description: clean_description(submission.description.as_deref().unwrap_or_default()),
            tags: clean_tags(submission.tags),
            category_id,
            privacy,
            made_for_kids: submission.for_kids,
            publish_at,
        })
    }

    /// Metadata for the uploader; the title falls back to what the download
    /// reported.
    pub fn metadata(&self, downloaded_title: &str) -> VideoMetadata {
        let title = self.title.as_deref().unwrap_or(downloaded_title);
        VideoMetadata {
            title: clean_title(title),
            description: self.description.clone(),
            tags: self.tags.clone(),
            category_id: self.category_id.clone(),
            privacy: self.privacy,
            made_for_kids: self.made_for_kids,
            publish_at: self.publish_at,
        }
    }
}

/// Interprets `YYYY-MM-DD HH:MM` as wall-clock time at `offset` and returns
/// the UTC instant.
pub fn parse_schedule(text: &str, offset: FixedOffset) -> Result<DateTime<Utc>> {
    let text = text.trim();
    let naive = SCHEDULE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .ok_or_else(|| {
            Error::invalid(format!(
                "schedule_time {text:?} must look like YYYY-MM-DD HH:MM"
            ))
        })?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| Error::invalid(format!("schedule_time {text:?} is not representable")))?;
    Ok(local.with_timezone(&Utc))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// YouTube rejects angle brackets and titles over 100 characters.
fn clean_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    if cleaned.trim().is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned.trim_end().to_string()
    }
}

fn clean_description(description: &str) -> String {
    let mut cleaned: String = description
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect();
    if cleaned.len() > MAX_DESCRIPTION_BYTES {
        let mut cut = MAX_DESCRIPTION_BYTES;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    cleaned.trim().to_string()
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    let mut budget = MAX_TAGS_CHARS;
    for tag in tags {
        let tag = tag.trim().replace(['<', '>'], "");
        if tag.is_empty() || kept.iter().any(|existing| existing.eq_ignore_ascii_case(&tag)) {
            continue;
        }
        let cost = tag.chars().count() + 1;
        if cost > budget {
            break;
        }
        budget -= cost;
        kept.push(tag);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_utc_offset;
    use chrono::TimeZone;

    fn ist() -> FixedOffset {
        parse_utc_offset("+05:30").unwrap()
    }

    fn submission(url: &str) -> Submission {
        Submission {
            url: url.into(),
            ..Submission::default()
        }
    }

    #[test]
    fn schedule_converts_local_time_to_utc() {
        let utc = parse_schedule("2024-01-01 10:00", ist()).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 1, 1, 4, 30, 0).unwrap());
        let utc = parse_schedule("2024-01-01T02:00", ist()).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2023, 12, 31, 20, 30, 0).unwrap());
        assert!(parse_schedule("01/01/2024 10:00", ist()).is_err());
    }

    #[test]
    fn defaults_apply_to_minimal_submission() {
        let job =
            UploadJob::from_submission(submission("https://youtube.com/shorts/abc"), ist()).unwrap();
        assert_eq!(job.source_url, "https://youtube.com/watch?v=abc");
        assert_eq!(job.privacy, Privacy::Private);
        assert_eq!(job.category_id, "22");
        assert!(job.description.is_empty());
        assert!(job.tags.is_empty());
        assert!(job.publish_at.is_none());
        assert_eq!(job.id.len(), 12);
    }

    #[test]
    fn json_body_with_tag_list_and_bool_flag() {
        let body = serde_json::json!({
            "url": "https://www.youtube.com/watch?v=x",
            "tags": ["a", " b ", "A", ""],
            "privacy_status": "private",
            "for_kids": true,
            "schedule_time": "2024-01-01 10:00"
        });
        let submission: Submission = serde_json::from_value(body).unwrap();
        let job = UploadJob::from_submission(submission, ist()).unwrap();
        assert_eq!(job.tags, vec!["a".to_string(), "b".to_string()]);
        assert!(job.made_for_kids);
        assert_eq!(
            job.publish_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 4, 30, 0).unwrap())
        );
    }

    #[test]
    fn text_tags_and_flag_from_form_values() {
        let body = serde_json::json!({
            "url": "https://www.youtube.com/watch?v=x",
            "tags": "music, live ,",
            "for_kids": "on",
            "schedule_time": ""
        });
        let submission: Submission = serde_json::from_value(body).unwrap();
        let job = UploadJob::from_submission(submission, ist()).unwrap();
        assert_eq!(job.tags, vec!["music".to_string(), "live".to_string()]);
        assert!(job.made_for_kids);
        assert!(job.publish_at.is_none());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(UploadJob::from_submission(submission("  "), ist()).is_err());
        assert!(UploadJob::from_submission(submission("ftp://x"), ist()).is_err());

        let mut sub = submission("https://youtu.be/x");
        sub.privacy_status = Some("friends-only".into());
        assert!(matches!(
            UploadJob::from_submission(sub, ist()),
            Err(Error::InvalidInput(_))
        ));

        let mut sub = submission("https://youtu.be/x");
        sub.category_id = Some("music".into());
        assert!(UploadJob::from_submission(sub, ist()).is_err());
    }

    #[test]
    fn schedule_with_public_privacy_is_rejected() {
        let mut sub = submission("https://youtu.be/x");
        sub.privacy_status = Some("public".into());
        sub.schedule_time = Some("2030-06-01 09:15".into());
        let err = UploadJob::from_submission(sub, ist()).unwrap_err();
        assert!(err.to_string().contains("private"));
    }

    #[test]
    fn metadata_prefers_override_and_cleans_title() {
        let mut sub = submission("https://youtu.be/x");
        let job = UploadJob::from_submission(sub.clone(), ist()).unwrap();
        let long = format!("<b>{}</b>", "x".repeat(150));
        let meta = job.metadata(&long);
        assert_eq!(meta.title.chars().count(), 100);
        assert!(!meta.title.contains('<'));
        assert_eq!(job.metadata("   ").title, "Untitled");

        sub.title = Some("My Title".into());
        let job = UploadJob::from_submission(sub, ist()).unwrap();
        assert_eq!(job.metadata("Downloaded").title, "My Title");
    }

    #[test]
    fn tags_respect_total_length_budget() {
        let tags: Vec<String> = (0..100).map(|i| format!("tag-number-{i:03}")).collect();
        let kept = clean_tags(tags);
        let total: usize = kept.iter().map(|t| t.chars().count() + 1).sum();
        assert!(total <= MAX_TAGS_CHARS);
        assert!(!kept.is_empty());
    }
}
