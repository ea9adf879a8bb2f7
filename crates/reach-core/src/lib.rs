//! Core domain model for whitewater reach synchronization.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "reach-core";

/// Mean earth radius in kilometers for the spherical distance model used by
/// WGS84 (wkid 4326) hosted layers.
const EARTH_RADIUS_KM: f64 = 6371.0088;

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// A longitude/latitude vertex in WGS84 decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Reach course geometry: an ordered sequence of paths, each an ordered
/// sequence of vertices. Multi-part reaches (a portage splits the line)
/// carry more than one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachGeometry {
    pub paths: Vec<Vec<Point>>,
}

impl ReachGeometry {
    pub fn new(paths: Vec<Vec<Point>>) -> Self {
        Self { paths }
    }

    /// True when there are no paths at all. A geometry with only degenerate
    /// paths is not empty; it has length zero.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.paths.iter().map(Vec::len).sum()
    }
}

/// Length is undefined for a reach with no line geometry. Callers omit the
/// length attribute in that case instead of writing zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reach has no line geometry; length is undefined")]
pub struct NoGeometry;

/// Great-circle distance between two vertices in kilometers, using the
/// haversine formula.
pub fn haversine_km(from: Point, to: Point) -> f64 {
    let lat1 = from.y * DEG_TO_RAD;
    let lat2 = to.y * DEG_TO_RAD;
    let delta_lat = (to.y - from.y) * DEG_TO_RAD;
    let delta_lon = (to.x - from.x) * DEG_TO_RAD;

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Total geodesic length of a reach geometry in kilometers.
///
/// Per-path lengths are the sum over consecutive vertex pairs; the total is
/// the sum over paths. Paths with fewer than two vertices contribute zero.
/// Summation is sequential left to right, so the result is reproducible
/// bit for bit for a given vertex sequence.
pub fn length_km(geometry: &ReachGeometry) -> Result<f64, NoGeometry> {
    if geometry.is_empty() {
        return Err(NoGeometry);
    }

    let mut total = 0.0;
    for path in &geometry.paths {
        for pair in path.windows(2) {
            total += haversine_km(pair[0], pair[1]);
        }
    }
    Ok(total)
}

/// Difficulty grades parsed out of a combined rating such as `IV-V(V+)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultySpan {
    pub minimum: Option<String>,
    pub maximum: Option<String>,
    pub outlier: Option<String>,
}

fn grade_or_none(grade: &str) -> Option<String> {
    let trimmed = grade.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_grade_start(c: char) -> bool {
    matches!(c, 'I' | 'V' | '5')
}

/// Split a combined difficulty rating into minimum, maximum and outlier
/// grades.
///
/// The combined form is `min-max(outlier)` where every part except the
/// maximum is optional: `III`, `II-IV`, `IV-V(V+)`, `V+`, `5.2`. A trailing
/// `-` or `+` is a grade modifier, not a separator, so `V-` parses as a
/// lone maximum.
pub fn parse_difficulty_span(combined: &str) -> DifficultySpan {
    let combined = combined.trim();

    let (main, outlier) = match combined.find('(') {
        Some(open) => {
            let rest = &combined[open + 1..];
            let outlier = rest.strip_suffix(')').unwrap_or(rest);
            (&combined[..open], grade_or_none(outlier))
        }
        None => (combined, None),
    };

    let mut separator = None;
    for (idx, c) in main.char_indices() {
        if c != '-' {
            continue;
        }
        if main[idx + 1..].starts_with(is_grade_start) {
            separator = Some(idx);
            break;
        }
    }

    let (minimum, maximum) = match separator {
        Some(idx) => (grade_or_none(&main[..idx]), grade_or_none(&main[idx + 1..])),
        None => (None, grade_or_none(main)),
    };

    DifficultySpan {
        minimum,
        maximum,
        outlier,
    }
}

/// Numeric projection of a whitewater class grade used for range queries
/// and sorting against the hosted layers. Unknown grades project to `None`.
pub fn difficulty_filter(grade: &str) -> Option<f64> {
    let value = match grade.trim() {
        "I" => 1.1,
        "I+" => 1.2,
        "II-" => 2.0,
        "II" => 2.1,
        "II+" => 2.2,
        "III-" => 3.0,
        "III" => 3.1,
        "III+" => 3.2,
        "IV-" => 4.0,
        "IV" => 4.1,
        "IV+" => 4.2,
        "V-" => 5.0,
        "V" => 5.1,
        "V+" => 5.3,
        _ => return None,
    };
    Some(value)
}

/// Loosely-typed handoff from a reach source into the pipeline.
///
/// Absent keys in the source document land here as `None`; coercion into
/// the typed [`Reach`] happens in one place, [`Reach::from_record`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachRecord {
    pub reach_id: String,
    pub name: Option<String>,
    pub river_name: Option<String>,
    pub river_name_alternate: Option<String>,
    pub difficulty: Option<String>,
    pub putin: Option<Point>,
    pub takeout: Option<Point>,
    pub geometry: Option<ReachGeometry>,
    pub gauge_id: Option<String>,
    pub gauge_stage: Option<String>,
    pub gauge_units: Option<String>,
    pub gauge_observation: Option<f64>,
    pub gauge_update_datetime: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub notes: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A source record that cannot enter the pipeline at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("source record has an empty reach_id")]
    EmptyReachId,
}

/// Which target layer a payload is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Line,
    Centroid,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Line => "line",
            LayerKind::Centroid => "centroid",
        }
    }
}

/// Column scope for an attribute update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadScope {
    /// Every synchronized attribute column.
    Full,
    /// Only the gauge reading columns; the low-cost variant used for
    /// frequent stage refreshes.
    StageOnly,
}

pub type AttributeMap = BTreeMap<String, JsonValue>;

/// Attribute-only update for one stored feature. `geometry` is populated
/// only for centroid targets; line geometry is owned by the stored feature
/// and never written by this pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePayload {
    pub attributes: AttributeMap,
    pub geometry: Option<Point>,
}

/// The in-memory reach aggregate for one sync cycle.
///
/// Built once per cycle from a fresh [`ReachRecord`]; derived fields
/// (`difficulty_*`, `length_km`) are computed at construction and kept in
/// step with the geometry, never copied from the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reach {
    pub reach_id: String,
    pub name: String,
    pub river_name: String,
    pub river_name_alternate: String,
    pub difficulty: String,
    pub difficulty_minimum: Option<String>,
    pub difficulty_maximum: Option<String>,
    pub difficulty_outlier: Option<String>,
    pub difficulty_filter: Option<f64>,
    pub putin: Option<Point>,
    pub takeout: Option<Point>,
    pub geometry: ReachGeometry,
    pub length_km: Option<f64>,
    pub gauge_id: Option<String>,
    pub gauge_stage: Option<String>,
    pub gauge_units: Option<String>,
    pub gauge_observation: Option<f64>,
    pub gauge_update_datetime: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub notes: Option<String>,
}

impl Reach {
    /// Coerce a loosely-typed source record into the typed entity.
    ///
    /// `length_km` is recomputed from the record's geometry here; a source
    /// claiming a length has no way to smuggle it through.
    pub fn from_record(record: ReachRecord) -> Result<Self, InvalidRecord> {
        if record.reach_id.trim().is_empty() {
            return Err(InvalidRecord::EmptyReachId);
        }

        let difficulty = record.difficulty.unwrap_or_default();
        let span = parse_difficulty_span(&difficulty);
        let filter = span.maximum.as_deref().and_then(difficulty_filter);

        let geometry = record.geometry.unwrap_or_default();
        let length = length_km(&geometry).ok();

        Ok(Self {
            reach_id: record.reach_id.trim().to_string(),
            name: record.name.unwrap_or_default(),
            river_name: record.river_name.unwrap_or_default(),
            river_name_alternate: record.river_name_alternate.unwrap_or_default(),
            difficulty,
            difficulty_minimum: span.minimum,
            difficulty_maximum: span.maximum,
            difficulty_outlier: span.outlier,
            difficulty_filter: filter,
            putin: record.putin,
            takeout: record.takeout,
            geometry,
            length_km: length,
            gauge_id: record.gauge_id,
            gauge_stage: record.gauge_stage,
            gauge_units: record.gauge_units,
            gauge_observation: record.gauge_observation,
            gauge_update_datetime: record.gauge_update_datetime,
            error: record.error,
            notes: record.notes,
        })
    }

    /// Replace the geometry and recompute the derived length, keeping the
    /// two in step. Used when the course is adopted from the stored line
    /// feature rather than the source record.
    pub fn set_geometry(&mut self, geometry: ReachGeometry) {
        self.geometry = geometry;
        self.length_km = length_km(&self.geometry).ok();
    }

    /// Representative point for centroid targets.
    ///
    /// Fixed convention: midpoint of put-in and take-out when both exist,
    /// otherwise whichever access is defined.
    pub fn centroid(&self) -> Option<Point> {
        match (self.putin, self.takeout) {
            (Some(p), Some(t)) => Some(Point::new((p.x + t.x) / 2.0, (p.y + t.y) / 2.0)),
            (Some(p), None) => Some(p),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }

    fn full_attribute_map(&self) -> AttributeMap {
        let mut map = AttributeMap::new();
        map.insert("reach_id".into(), json!(self.reach_id));
        map.insert("name".into(), json!(self.name));
        map.insert("river_name".into(), json!(self.river_name));
        map.insert(
            "river_name_alternate".into(),
            json!(self.river_name_alternate),
        );
        map.insert("difficulty".into(), json!(self.difficulty));
        insert_opt(&mut map, "difficulty_minimum", &self.difficulty_minimum);
        insert_opt(&mut map, "difficulty_maximum", &self.difficulty_maximum);
        insert_opt(&mut map, "difficulty_outlier", &self.difficulty_outlier);
        map.insert("difficulty_filter".into(), json_opt_f64(self.difficulty_filter));
        if let Some(p) = self.putin {
            map.insert("putin_x".into(), json!(p.x));
            map.insert("putin_y".into(), json!(p.y));
        }
        if let Some(t) = self.takeout {
            map.insert("takeout_x".into(), json!(t.x));
            map.insert("takeout_y".into(), json!(t.y));
        }
        // Length is omitted, not nulled, when the geometry is missing; a
        // reach without a traced line is not a zero-length reach.
        if let Some(length) = self.length_km {
            map.insert("length_km".into(), json!(length));
        }
        insert_opt(&mut map, "gauge_id", &self.gauge_id);
        insert_opt(&mut map, "error", &self.error);
        insert_opt(&mut map, "notes", &self.notes);
        map.extend(self.stage_attribute_map());
        map
    }

    fn stage_attribute_map(&self) -> AttributeMap {
        let mut map = AttributeMap::new();
        insert_opt(&mut map, "gauge_stage", &self.gauge_stage);
        insert_opt(&mut map, "gauge_units", &self.gauge_units);
        map.insert(
            "gauge_observation".into(),
            json_opt_f64(self.gauge_observation),
        );
        map.insert(
            "gauge_update_datetime".into(),
            match self.gauge_update_datetime {
                // Hosted layers take date columns as epoch milliseconds.
                Some(dt) => json!(dt.timestamp_millis()),
                None => JsonValue::Null,
            },
        );
        map
    }

    /// Build the attribute-only update payload for one target layer,
    /// restricted to the columns the target declares writable.
    pub fn attribute_payload(
        &self,
        scope: PayloadScope,
        kind: LayerKind,
        writable: &BTreeSet<String>,
    ) -> UpdatePayload {
        let mut attributes = match scope {
            PayloadScope::Full => self.full_attribute_map(),
            PayloadScope::StageOnly => self.stage_attribute_map(),
        };
        attributes.retain(|column, _| writable.contains(column));

        UpdatePayload {
            attributes,
            geometry: match kind {
                LayerKind::Line => None,
                LayerKind::Centroid => self.centroid(),
            },
        }
    }
}

fn insert_opt(map: &mut AttributeMap, column: &str, value: &Option<String>) {
    map.insert(
        column.to_string(),
        match value {
            Some(v) => json!(v),
            None => JsonValue::Null,
        },
    );
}

fn json_opt_f64(value: Option<f64>) -> JsonValue {
    match value {
        Some(v) => json!(v),
        None => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reach_id: &str) -> ReachRecord {
        ReachRecord {
            reach_id: reach_id.to_string(),
            ..ReachRecord::default()
        }
    }

    #[test]
    fn difficulty_span_with_outlier() {
        let span = parse_difficulty_span("IV-V(V+)");
        assert_eq!(span.minimum.as_deref(), Some("IV"));
        assert_eq!(span.maximum.as_deref(), Some("V"));
        assert_eq!(span.outlier.as_deref(), Some("V+"));
    }

    #[test]
    fn difficulty_span_single_grade() {
        let span = parse_difficulty_span("III");
        assert_eq!(span.minimum, None);
        assert_eq!(span.maximum.as_deref(), Some("III"));
        assert_eq!(span.outlier, None);
    }

    #[test]
    fn difficulty_span_range_without_outlier() {
        let span = parse_difficulty_span("II-IV");
        assert_eq!(span.minimum.as_deref(), Some("II"));
        assert_eq!(span.maximum.as_deref(), Some("IV"));
        assert_eq!(span.outlier, None);
    }

    #[test]
    fn trailing_minus_is_a_modifier_not_a_separator() {
        let span = parse_difficulty_span("V-");
        assert_eq!(span.minimum, None);
        assert_eq!(span.maximum.as_deref(), Some("V-"));
    }

    #[test]
    fn decimal_class_parses_as_maximum() {
        let span = parse_difficulty_span("IV-5.2");
        assert_eq!(span.minimum.as_deref(), Some("IV"));
        assert_eq!(span.maximum.as_deref(), Some("5.2"));
    }

    #[test]
    fn filter_projects_known_grades_and_rejects_unknown() {
        assert_eq!(difficulty_filter("IV+"), Some(4.2));
        assert_eq!(difficulty_filter("V+"), Some(5.3));
        assert_eq!(difficulty_filter("5.2"), None);
        assert_eq!(difficulty_filter(""), None);
    }

    #[test]
    fn length_of_two_paths_sums_both() {
        // One degree of latitude is roughly 111.2 km on the sphere.
        let geometry = ReachGeometry::new(vec![
            vec![Point::new(0.0, 0.0), Point::new(0.0, 1.0)],
            vec![Point::new(1.0, 1.0), Point::new(1.0, 2.0)],
        ]);
        let total = length_km(&geometry).unwrap();
        assert!((total - 222.4).abs() / 222.4 < 0.005, "got {total}");
    }

    #[test]
    fn length_is_invariant_under_path_reversal() {
        let geometry = ReachGeometry::new(vec![vec![
            Point::new(-121.6297, 45.7641),
            Point::new(-121.6380, 45.7402),
            Point::new(-121.6461, 45.7188),
        ]]);
        let mut reversed = geometry.clone();
        for path in &mut reversed.paths {
            path.reverse();
        }
        let forward = length_km(&geometry).unwrap();
        let backward = length_km(&reversed).unwrap();
        assert!((forward - backward).abs() < 1e-9, "{forward} vs {backward}");
    }

    #[test]
    fn no_paths_is_distinct_from_degenerate_paths() {
        assert_eq!(length_km(&ReachGeometry::default()), Err(NoGeometry));

        let degenerate = ReachGeometry::new(vec![vec![], vec![Point::new(1.0, 1.0)]]);
        assert_eq!(length_km(&degenerate), Ok(0.0));
    }

    #[test]
    fn from_record_requires_a_reach_id() {
        assert_eq!(
            Reach::from_record(record("  ")),
            Err(InvalidRecord::EmptyReachId)
        );
    }

    #[test]
    fn from_record_computes_derived_fields() {
        let mut rec = record("2156");
        rec.difficulty = Some("IV-V(V+)".to_string());
        rec.geometry = Some(ReachGeometry::new(vec![vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 1.0),
        ]]));

        let reach = Reach::from_record(rec).unwrap();
        assert_eq!(reach.difficulty_maximum.as_deref(), Some("V"));
        assert_eq!(reach.difficulty_filter, Some(5.1));
        let length = reach.length_km.unwrap();
        assert!((length - 111.2).abs() / 111.2 < 0.005, "got {length}");
    }

    #[test]
    fn length_stays_undefined_without_geometry() {
        let reach = Reach::from_record(record("1074")).unwrap();
        assert_eq!(reach.length_km, None);

        let writable: BTreeSet<String> =
            ["reach_id", "length_km", "difficulty"].iter().map(|s| s.to_string()).collect();
        let payload = reach.attribute_payload(PayloadScope::Full, LayerKind::Line, &writable);
        assert!(!payload.attributes.contains_key("length_km"));
        assert!(payload.attributes.contains_key("difficulty"));
    }

    #[test]
    fn set_geometry_recomputes_length() {
        let mut reach = Reach::from_record(record("1074")).unwrap();
        reach.set_geometry(ReachGeometry::new(vec![vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
        ]]));
        assert!(reach.length_km.is_some());
    }

    #[test]
    fn centroid_prefers_the_access_midpoint() {
        let mut rec = record("2156");
        rec.putin = Some(Point::new(-121.6297, 45.7641));
        rec.takeout = Some(Point::new(-121.6461, 45.7188));
        let reach = Reach::from_record(rec).unwrap();

        let centroid = reach.centroid().unwrap();
        assert!((centroid.x - -121.6379).abs() < 1e-4);
        assert!((centroid.y - 45.74145).abs() < 1e-4);
    }

    #[test]
    fn centroid_falls_back_to_a_single_access() {
        let mut rec = record("2156");
        rec.takeout = Some(Point::new(-121.6461, 45.7188));
        let reach = Reach::from_record(rec).unwrap();
        assert_eq!(reach.centroid(), Some(Point::new(-121.6461, 45.7188)));

        assert_eq!(Reach::from_record(record("2156")).unwrap().centroid(), None);
    }

    #[test]
    fn payload_is_restricted_to_writable_columns() {
        let mut rec = record("2156");
        rec.river_name = Some("Little White Salmon".to_string());
        rec.gauge_stage = Some("runnable".to_string());
        let reach = Reach::from_record(rec).unwrap();

        let writable: BTreeSet<String> =
            ["river_name", "gauge_stage"].iter().map(|s| s.to_string()).collect();
        let payload = reach.attribute_payload(PayloadScope::Full, LayerKind::Line, &writable);

        assert_eq!(payload.attributes.len(), 2);
        assert_eq!(payload.attributes["river_name"], json!("Little White Salmon"));
        assert_eq!(payload.geometry, None);
    }

    #[test]
    fn stage_scope_carries_only_gauge_columns() {
        let mut rec = record("2156");
        rec.river_name = Some("Little White Salmon".to_string());
        rec.gauge_stage = Some("too low".to_string());
        rec.gauge_observation = Some(2.4);
        let reach = Reach::from_record(rec).unwrap();

        let writable: BTreeSet<String> = [
            "river_name",
            "gauge_stage",
            "gauge_observation",
            "gauge_update_datetime",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let payload = reach.attribute_payload(PayloadScope::StageOnly, LayerKind::Line, &writable);

        assert!(!payload.attributes.contains_key("river_name"));
        assert_eq!(payload.attributes["gauge_stage"], json!("too low"));
        assert_eq!(payload.attributes["gauge_observation"], json!(2.4));
    }

    #[test]
    fn centroid_payload_carries_the_representative_point() {
        let mut rec = record("2156");
        rec.putin = Some(Point::new(-121.0, 45.0));
        rec.takeout = Some(Point::new(-122.0, 46.0));
        let reach = Reach::from_record(rec).unwrap();

        let writable: BTreeSet<String> = ["reach_id"].iter().map(|s| s.to_string()).collect();
        let payload = reach.attribute_payload(PayloadScope::Full, LayerKind::Centroid, &writable);
        assert_eq!(payload.geometry, Some(Point::new(-121.5, 45.5)));
    }
}
