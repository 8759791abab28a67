//! Response envelopes for the activity endpoints
//!
//! These functions give the `geojson`, `stats` and `trackpoints` activity
//! resources their wire semantics independent of any HTTP framework: query
//! parameters come in as optional strings, and every answer is an
//! [`ApiResponse`] carrying either data or a structured error.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::geojson::EnhancedGeoJson;
use crate::parse::parse_time;
use crate::simplify::{SimplificationLevel, simplify};
use crate::stats::{StatsOptions, TrackStatistics, aggregate};
use crate::types::{Track, Trackpoint};
use crate::{ErrorKind, TrackPipeError};

/// Page size used when the caller gives none.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Largest page size a caller may request.
pub const MAX_PAGE_LIMIT: usize = 10_000;

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TrackPipeError> for ApiError {
    fn from(err: &TrackPipeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// `{success, data}` on success, `{success: false, error}` otherwise.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &TrackPipeError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl<T> From<Result<T, TrackPipeError>> for ApiResponse<T> {
    fn from(result: Result<T, TrackPipeError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::err(&err),
        }
    }
}

fn invalid_query(message: impl Into<String>) -> TrackPipeError {
    TrackPipeError::InvalidQuery(message.into())
}

/// Reads a `simplificationLevel` query parameter, defaulting to medium.
pub fn parse_level(param: Option<&str>) -> Result<SimplificationLevel, TrackPipeError> {
    match param.map(str::trim) {
        None | Some("") => Ok(SimplificationLevel::default()),
        Some(s) => SimplificationLevel::from_str(s)
            .map_err(|_| invalid_query(format!("unknown simplification level: {s:?}"))),
    }
}

/// `GET .../geojson?simplificationLevel=...`
pub fn geojson_response(track: &Track, level: Option<&str>) -> ApiResponse<EnhancedGeoJson> {
    parse_level(level)
        .map(|level| simplify(track, level))
        .into()
}

/// `GET .../stats`
pub fn stats_response(track: &Track, options: &StatsOptions) -> ApiResponse<TrackStatistics> {
    aggregate(track, options)
        .map_err(TrackPipeError::from)
        .into()
}

/// Pagination and filtering of a trackpoint listing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TrackpointQuery {
    limit: usize,
    page: usize,
    time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Default for TrackpointQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            page: 1,
            time_range: None,
        }
    }
}

impl TrackpointQuery {
    /// Reads the `limit`, `page` and `timeRange=start,end` query parameters.
    /// Pages are numbered from 1.
    pub fn from_params(
        limit: Option<&str>,
        page: Option<&str>,
        time_range: Option<&str>,
    ) -> Result<Self, TrackPipeError> {
        let mut query = Self::default();

        if let Some(limit) = limit {
            let limit = limit
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid_query(format!("limit is not a number: {limit:?}")))?;
            if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
                return Err(invalid_query(format!(
                    "limit must be between 1 and {MAX_PAGE_LIMIT}"
                )));
            }
            query.limit = limit;
        }

        if let Some(page) = page {
            let page = page
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid_query(format!("page is not a number: {page:?}")))?;
            if page == 0 {
                return Err(invalid_query("pages are numbered from 1"));
            }
            query.page = page;
        }

        if let Some(range) = time_range {
            let Some((start, end)) = range.split_once(',') else {
                return Err(invalid_query("timeRange must be start,end"));
            };
            let bound = |s: &str| {
                parse_time(s.trim()).ok_or_else(|| invalid_query(format!("invalid time: {s:?}")))
            };
            let (start, end) = (bound(start)?, bound(end)?);
            if start > end {
                return Err(invalid_query("timeRange starts after it ends"));
            }
            query.time_range = Some((start, end));
        }

        Ok(query)
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            ..self
        }
    }

    pub fn with_page(self, page: usize) -> Self {
        Self {
            page: page.max(1),
            ..self
        }
    }

    pub fn with_time_range(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            time_range: Some((start, end)),
            ..self
        }
    }

    fn includes(&self, point: &Trackpoint) -> bool {
        match (self.time_range, point.time) {
            (None, _) => true,
            (Some((start, end)), Some(t)) => start <= t && t <= end,
            // Untimed points cannot fall within a time range.
            (Some(_), None) => false,
        }
    }
}

/// One page of raw trackpoints.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct TrackpointPage {
    pub points: Vec<Trackpoint>,
    /// Number of points matching the query, across all pages.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub pages: usize,
}

/// Selects one page of the trackpoints matching `query`.  A page past the
/// end is empty rather than an error.
pub fn trackpoints_page(track: &Track, query: &TrackpointQuery) -> TrackpointPage {
    let matching = track.points().iter().filter(|p| query.includes(p));
    let total = matching.clone().count();
    let points = matching
        .skip((query.page - 1).saturating_mul(query.limit))
        .take(query.limit)
        .copied()
        .collect();

    TrackpointPage {
        points,
        total,
        page: query.page,
        limit: query.limit,
        pages: total.div_ceil(query.limit),
    }
}

/// `GET .../trackpoints?limit=...&page=...&timeRange=start,end`
pub fn trackpoints_response(
    track: &Track,
    limit: Option<&str>,
    page: Option<&str>,
    time_range: Option<&str>,
) -> ApiResponse<TrackpointPage> {
    TrackpointQuery::from_params(limit, page, time_range)
        .map(|query| trackpoints_page(track, &query))
        .into()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::json;

    use super::{
        ApiResponse, TrackpointQuery, geojson_response, stats_response, trackpoints_page,
        trackpoints_response,
    };
    use crate::stats::StatsOptions;
    use crate::track;
    use crate::types::Track;
    use crate::{ErrorKind, TrackPipeError};

    fn t(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap() + TimeDelta::seconds(secs))
    }

    fn sample_track() -> Result<Track> {
        Ok(track![
            (46.0, 7.0, Some(500.0), t(0)),
            (46.001, 7.0, Some(505.0), t(10)),
            (46.002, 7.0, Some(510.0), None),
            (46.003, 7.0, Some(512.0), t(30)),
            (46.004, 7.0, Some(511.0), t(40)),
        ])
    }

    #[test]
    fn test_error_envelope() -> Result<()> {
        let response: ApiResponse<()> = Err(TrackPipeError::InvalidQuery("bad".into())).into();
        assert_eq!(
            serde_json::to_value(&response)?,
            json!({
                "success": false,
                "error": {"kind": "invalid_query", "message": "invalid query: bad"},
            })
        );
        Ok(())
    }

    #[test]
    fn test_geojson_levels() -> Result<()> {
        let track = sample_track()?;
        let response = geojson_response(&track, Some("none"));
        assert!(response.success);
        let data = response.data.as_ref().map(|g| g.features[0].geometry.len());
        assert_eq!(data, Some(5));

        let response = geojson_response(&track, None);
        assert!(response.success);

        let response = geojson_response(&track, Some("ultra"));
        assert!(!response.success);
        assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::InvalidQuery));
        Ok(())
    }

    #[test]
    fn test_stats_envelope() -> Result<()> {
        let track = sample_track()?;
        let json = serde_json::to_value(stats_response(&track, &StatsOptions::default()))?;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["pointCount"], 5);
        assert_eq!(json["data"]["hasCompleteTimestamps"], false);

        let strict = StatsOptions::default().with_require_timestamps(true);
        let response = stats_response(&track, &strict);
        assert_eq!(
            response.error.map(|e| e.kind),
            Some(ErrorKind::MissingTimestamps)
        );
        Ok(())
    }

    #[test]
    fn test_pagination() -> Result<()> {
        let track = sample_track()?;
        let query = TrackpointQuery::default().with_limit(2).with_page(3);
        let page = trackpoints_page(&track, &query);
        assert_eq!((page.total, page.pages, page.page, page.limit), (5, 3, 3, 2));
        assert_eq!(page.points.len(), 1);
        assert_eq!(page.points[0].index, 4);

        let past_end = trackpoints_page(&track, &query.with_page(4));
        assert!(past_end.points.is_empty());
        assert_eq!(past_end.total, 5);
        Ok(())
    }

    #[test]
    fn test_time_range() -> Result<()> {
        let track = sample_track()?;
        let response = trackpoints_response(
            &track,
            Some("10"),
            Some("1"),
            Some("2024-03-09T12:00:05Z,2024-03-09T12:00:30Z"),
        );
        let page = response.data.unwrap();
        assert_eq!(
            page.points.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!((page.total, page.pages), (2, 1));
        Ok(())
    }

    #[test]
    fn test_invalid_params() {
        for (limit, page, range) in [
            (Some("0"), None, None),
            (Some("ten"), None, None),
            (None, Some("0"), None),
            (None, None, Some("2024-03-09T12:00:00Z")),
            (None, None, Some("2024-03-09T13:00:00Z,2024-03-09T12:00:00Z")),
            (None, None, Some("yesterday,today")),
        ] {
            let err = TrackpointQuery::from_params(limit, page, range).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidQuery, "{err}");
        }
    }

    #[test]
    fn test_page_json() -> Result<()> {
        let track = sample_track()?;
        let page = trackpoints_page(&track, &TrackpointQuery::default().with_limit(1));
        assert_eq!(
            serde_json::to_value(&page)?,
            json!({
                "points": [{
                    "index": 0,
                    "longitude": 7.0,
                    "latitude": 46.0,
                    "elevation": 500.0,
                    "time": "2024-03-09T12:00:00Z",
                }],
                "total": 5,
                "page": 1,
                "limit": 1,
                "pages": 5,
            })
        );
        Ok(())
    }
}
