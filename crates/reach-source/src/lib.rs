//! Reach source contracts and the American Whitewater document adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reach_core::{Point, ReachRecord};
use reach_gis::{parse_esri_paths, RestClient, TransportError};
use scraper::Html;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "reach-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable for reach_id {reach_id}: {detail}")]
    Unavailable { reach_id: String, detail: String },
    #[error("reach_id {reach_id} no longer exists upstream")]
    NotFound { reach_id: String },
    #[error("malformed source document for reach_id {reach_id}: {detail}")]
    Parse { reach_id: String, detail: String },
}

/// Fetch-one-reach contract. Implementations resolve a business key to a
/// loosely-typed record; all coercion into the typed entity happens on the
/// caller's side of the boundary.
#[async_trait]
pub trait ReachSource: Send + Sync {
    async fn fetch(&self, reach_id: &str) -> Result<ReachRecord, SourceError>;
}

/// American Whitewater reach-detail adapter.
///
/// One reach is one JSON document at
/// `<base>/content/River/detail/id/<reach_id>/.json`. The upstream serves
/// an empty body (or a 500) for reaches that have been deleted, so both
/// map to [`SourceError::NotFound`].
pub struct AwSource {
    client: Arc<RestClient>,
    base_url: String,
}

impl AwSource {
    pub fn new(client: Arc<RestClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn detail_url(&self, reach_id: &str) -> String {
        format!("{}/content/River/detail/id/{}/.json", self.base_url, reach_id)
    }
}

#[async_trait]
impl ReachSource for AwSource {
    async fn fetch(&self, reach_id: &str) -> Result<ReachRecord, SourceError> {
        let url = self.detail_url(reach_id);
        let document = self
            .client
            .get_json(&url, &[])
            .await
            .map_err(|err| classify_transport_error(reach_id, err))?;

        if document.is_null() {
            return Err(SourceError::NotFound {
                reach_id: reach_id.to_string(),
            });
        }

        parse_reach_document(reach_id, &document, Utc::now())
    }
}

/// Transport failures where the upstream is known to answer with garbage
/// for dead reaches are folded into `NotFound`; everything else is the
/// source being unavailable.
pub fn classify_transport_error(reach_id: &str, err: TransportError) -> SourceError {
    match &err {
        TransportError::HttpStatus { status, .. } if *status == 404 || *status == 500 => {
            SourceError::NotFound {
                reach_id: reach_id.to_string(),
            }
        }
        _ => SourceError::Unavailable {
            reach_id: reach_id.to_string(),
            detail: err.to_string(),
        },
    }
}

/// Coerce one reach-detail document into a [`ReachRecord`].
///
/// Absent keys become `None`, prose fields are stripped of markup and
/// whitespace noise, and coordinates arrive as either numbers or numeric
/// strings depending on the upstream's mood.
pub fn parse_reach_document(
    reach_id: &str,
    document: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<ReachRecord, SourceError> {
    let main = document
        .get("CContainerViewJSON_view")
        .and_then(|v| v.get("CRiverMainGadgetJSON_main"))
        .ok_or_else(|| SourceError::Parse {
            reach_id: reach_id.to_string(),
            detail: "missing river detail container".to_string(),
        })?;

    let info = main.get("info").ok_or_else(|| SourceError::Parse {
        reach_id: reach_id.to_string(),
        detail: "missing info block".to_string(),
    })?;

    let mut record = ReachRecord {
        reach_id: reach_id.to_string(),
        fetched_at: Some(fetched_at),
        ..ReachRecord::default()
    };

    record.river_name = clean_text(json_str(info, &["river"]));
    record.name = clean_text(json_str(info, &["section"])).map(remove_backslashes);
    record.river_name_alternate =
        clean_text(json_str(info, &["altname"])).map(remove_backslashes);
    record.notes = clean_text(json_str(info, &["abstract"]));

    record.difficulty = clean_text(json_str(info, &["class"]))
        .filter(|class| !class.eq_ignore_ascii_case("none"));

    record.putin = coordinate_pair(info, "plon", "plat");
    record.takeout = coordinate_pair(info, "tlon", "tlat");

    if let Some(geometry) = document.get("geometry") {
        let parsed = parse_esri_paths(geometry);
        if !parsed.is_empty() {
            record.geometry = Some(parsed);
        }
    }

    if let Some(gauge) = select_gauge(main) {
        record.gauge_id = gauge
            .get("gauge_id")
            .and_then(stringify_scalar);
        record.gauge_units = json_str(gauge, &["metric_unit"]).map(ToString::to_string);
        record.gauge_observation = json_f64(gauge, &["gauge_reading"]);
        record.gauge_stage = clean_text(
            json_str(gauge, &["condition"]).or_else(|| json_str(main, &["condition"])),
        );
        record.gauge_update_datetime = gauge
            .get("updated")
            .and_then(parse_source_datetime);
    }

    Ok(record)
}

/// First gauge wins unless a later one reports in cfs; flow readings beat
/// stage-height readings when a reach carries both.
fn select_gauge(main: &JsonValue) -> Option<&JsonValue> {
    let gauges = main.get("gauges").and_then(JsonValue::as_array)?;
    if gauges.is_empty() {
        return None;
    }
    gauges
        .iter()
        .find(|gauge| json_str(gauge, &["metric_unit"]) == Some("cfs"))
        .or_else(|| gauges.first())
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stringify_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coordinate_pair(info: &JsonValue, lon_key: &str, lat_key: &str) -> Option<Point> {
    let x = json_f64(info, &[lon_key])?;
    let y = json_f64(info, &[lat_key])?;
    Some(Point::new(x, y))
}

fn remove_backslashes(input: String) -> String {
    input.replace('\\', "")
}

/// Strip markup from a prose field and collapse the whitespace people mash
/// into these entries. Empty and `N/A` values become `None`.
pub fn clean_text(input: Option<&str>) -> Option<String> {
    let input = input?;
    if input.trim().is_empty() {
        return None;
    }

    let fragment = Html::parse_fragment(input);
    let text = fragment.root_element().text().collect::<String>();

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(collapsed)
    }
}

/// Source timestamps show up either as epoch seconds or as
/// `YYYY-MM-DD HH:MM:SS` strings.
fn parse_source_datetime(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::from_timestamp(secs, 0)
        }
        JsonValue::String(s) => NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail_document() -> JsonValue {
        json!({
            "CContainerViewJSON_view": {
                "CRiverMainGadgetJSON_main": {
                    "info": {
                        "river": "Little White Salmon",
                        "section": "Lower (Gorge\\)",
                        "altname": "  ",
                        "class": "IV-V(V+)",
                        "abstract": "<p>Classic  basalt   gorge</p>",
                        "plon": "-121.629656",
                        "plat": "45.764117",
                        "tlon": -121.646106,
                        "tlat": 45.718817,
                    },
                    "gauges": [
                        {
                            "gauge_id": 4469,
                            "metric_unit": "ft",
                            "gauge_reading": "2.4",
                            "condition": "too low",
                            "updated": 1722470400,
                        },
                        {
                            "gauge_id": "4470",
                            "metric_unit": "cfs",
                            "gauge_reading": 850.0,
                            "condition": "runnable",
                            "updated": 1722474000,
                        }
                    ],
                }
            }
        })
    }

    #[test]
    fn parses_the_little_white_salmon_document() {
        let record =
            parse_reach_document("2156", &detail_document(), Utc::now()).unwrap();

        assert_eq!(record.reach_id, "2156");
        assert_eq!(record.river_name.as_deref(), Some("Little White Salmon"));
        assert_eq!(record.name.as_deref(), Some("Lower (Gorge)"));
        assert_eq!(record.river_name_alternate, None);
        assert_eq!(record.difficulty.as_deref(), Some("IV-V(V+)"));
        assert_eq!(record.notes.as_deref(), Some("Classic basalt gorge"));

        let putin = record.putin.unwrap();
        assert!((putin.x - -121.629656).abs() < 1e-9);
        assert!((putin.y - 45.764117).abs() < 1e-9);
        assert!(record.takeout.is_some());
    }

    #[test]
    fn prefers_the_cfs_gauge_when_several_report() {
        let record =
            parse_reach_document("2156", &detail_document(), Utc::now()).unwrap();

        assert_eq!(record.gauge_id.as_deref(), Some("4470"));
        assert_eq!(record.gauge_units.as_deref(), Some("cfs"));
        assert_eq!(record.gauge_observation, Some(850.0));
        assert_eq!(record.gauge_stage.as_deref(), Some("runnable"));
        assert_eq!(
            record.gauge_update_datetime,
            DateTime::from_timestamp(1722474000, 0)
        );
    }

    #[test]
    fn absent_keys_become_none_rather_than_errors() {
        let bare = json!({
            "CContainerViewJSON_view": {
                "CRiverMainGadgetJSON_main": {
                    "info": {"river": "Unnamed Creek", "class": "none"},
                    "gauges": [],
                }
            }
        });
        let record = parse_reach_document("900", &bare, Utc::now()).unwrap();

        assert_eq!(record.river_name.as_deref(), Some("Unnamed Creek"));
        assert_eq!(record.difficulty, None, "a literal 'none' class is no class");
        assert_eq!(record.putin, None);
        assert_eq!(record.gauge_id, None);
        assert_eq!(record.gauge_stage, None);
    }

    #[test]
    fn missing_container_is_a_parse_error() {
        let err = parse_reach_document("900", &json!({"whatever": 1}), Utc::now()).unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
    }

    #[test]
    fn cleanup_drops_markup_and_placeholder_values() {
        assert_eq!(
            clean_text(Some("<b>Scenic</b>\n\n\n  gorge   run")),
            Some("Scenic gorge run".to_string())
        );
        assert_eq!(clean_text(Some("  \r\n\t ")), None);
        assert_eq!(clean_text(Some("N/A")), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn dead_reach_statuses_fold_into_not_found() {
        let gone = TransportError::HttpStatus {
            status: 500,
            url: "https://example.test/content/River/detail/id/1/.json".to_string(),
        };
        assert!(matches!(
            classify_transport_error("1", gone),
            SourceError::NotFound { .. }
        ));

        let throttled = TransportError::HttpStatus {
            status: 429,
            url: "https://example.test".to_string(),
        };
        assert!(matches!(
            classify_transport_error("1", throttled),
            SourceError::Unavailable { .. }
        ));
    }

    #[test]
    fn detail_urls_are_keyed_by_reach_id() {
        let client = Arc::new(
            RestClient::new(reach_gis::RestClientConfig::default()).unwrap(),
        );
        let source = AwSource::new(client, "https://www.americanwhitewater.org/");
        assert_eq!(
            source.detail_url("2156"),
            "https://www.americanwhitewater.org/content/River/detail/id/2156/.json"
        );
    }

    #[test]
    fn string_timestamps_parse_too() {
        let parsed = parse_source_datetime(&json!("2024-08-01 12:30:00")).unwrap();
        assert_eq!(parsed.timestamp(), 1722515400);
    }
}
