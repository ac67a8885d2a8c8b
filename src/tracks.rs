use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::fields::canonical;

/// One normalized position sample. Whatever container it came from, every
/// point ends up in this shape before the identifier is bound.
#[derive(Debug, Clone, Serialize)]
pub struct TrackPoint {
    pub date: String,
    pub time: String,
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ParsedTrack {
    pub points: Vec<TrackPoint>,
    pub headers: Vec<String>,
}

/// Dispatches on the file extension. Zero parsed points is a terminal
/// error; nothing is offered for mapping.
pub fn parse_track(file_name: &str, bytes: &[u8]) -> AppResult<ParsedTrack> {
    let lowered = file_name.to_lowercase();
    let points = if lowered.ends_with(".gpx") {
        parse_gpx(bytes)?
    } else if lowered.ends_with(".kml") {
        parse_kml(bytes)?
    } else {
        return Err(AppError::Parse(format!(
            "'{file_name}' is not a GPX or KML track file"
        )));
    };

    if points.is_empty() {
        return Err(AppError::Parse("no track points found in the file".into()));
    }

    let headers = track_headers(&points);
    Ok(ParsedTrack { points, headers })
}

/// GPX track points: `trkpt` elements with `lat`/`lon` attributes and
/// optional `time`, `ele` and `speed` children. Points with a missing or
/// unparsable timestamp are skipped rather than aborting the file.
pub fn parse_gpx(bytes: &[u8]) -> AppResult<Vec<TrackPoint>> {
    let document = parse_document(bytes, "GPX")?;

    let mut points = Vec::new();
    for node in document
        .descendants()
        .filter(|node| node.tag_name().name() == "trkpt")
    {
        let (Some(latitude), Some(longitude)) = (
            node.attribute("lat").and_then(|v| v.trim().parse().ok()),
            node.attribute("lon").and_then(|v| v.trim().parse().ok()),
        ) else {
            debug!("skipping trkpt without numeric lat/lon");
            continue;
        };

        let Some((date, time)) = child_text(node, "time")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|stamp| split_timestamp(stamp.with_timezone(&Utc)))
        else {
            debug!("skipping trkpt without a parsable timestamp");
            continue;
        };

        points.push(TrackPoint {
            date,
            time,
            longitude,
            latitude,
            elevation: child_text(node, "ele").and_then(|v| v.trim().parse().ok()),
            speed: child_text(node, "speed").and_then(|v| v.trim().parse().ok()),
        });
    }

    Ok(points)
}

/// KML coordinate strings: whitespace-separated `lon,lat[,alt]` entries.
/// The container carries no per-point time, so every point receives the
/// ingestion moment captured once per parse. Known accuracy gap inherited
/// from the source data format; consumers see it as a shared timestamp
/// rather than a silent per-point guess.
pub fn parse_kml(bytes: &[u8]) -> AppResult<Vec<TrackPoint>> {
    let document = parse_document(bytes, "KML")?;
    let (date, time) = split_timestamp(Utc::now());

    let mut points = Vec::new();
    for node in document
        .descendants()
        .filter(|node| node.tag_name().name() == "coordinates")
    {
        let Some(text) = node.text() else { continue };
        for entry in text.split_whitespace() {
            let Some((longitude, latitude, elevation)) = parse_coordinates(entry) else {
                debug!(entry, "skipping malformed coordinate entry");
                continue;
            };
            points.push(TrackPoint {
                date: date.clone(),
                time: time.clone(),
                longitude,
                latitude,
                elevation,
                speed: None,
            });
        }
    }

    Ok(points)
}

/// Binds one vehicle identifier to every point and serializes the set as a
/// row-oriented tabular payload ready for the positional submission channel.
pub fn to_tabular(track: &ParsedTrack, matricula: &str) -> AppResult<Vec<u8>> {
    let matricula = matricula.trim();
    if matricula.is_empty() {
        return Err(AppError::Validation(
            "a vehicle identifier is required before submitting a track".into(),
        ));
    }

    let has_elevation = track.headers.iter().any(|h| h == canonical::ALTITUD);
    let has_speed = track.headers.iter().any(|h| h == canonical::VELOCIDAD);

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header_row = track.headers.clone();
    header_row.push(canonical::MATRICULA.to_string());
    writer.write_record(&header_row)?;

    for point in &track.points {
        let mut row = vec![
            point.date.clone(),
            point.time.clone(),
            point.longitude.to_string(),
            point.latitude.to_string(),
        ];
        if has_elevation {
            row.push(point.elevation.map(|v| v.to_string()).unwrap_or_default());
        }
        if has_speed {
            row.push(point.speed.map(|v| v.to_string()).unwrap_or_default());
        }
        row.push(matricula.to_string());
        writer.write_record(&row)?;
    }

    writer.flush()?;
    writer
        .into_inner()
        .map_err(|err| AppError::Parse(format!("failed to finalize track payload: {err}")))
}

/// Output columns are derived from the whole point set, not just the first
/// point, so a track whose opening samples lack elevation or speed still
/// exposes those columns when later samples carry them.
fn track_headers(points: &[TrackPoint]) -> Vec<String> {
    let mut headers = vec![
        canonical::FECHA.to_string(),
        canonical::HORA.to_string(),
        canonical::COORDENADA_X.to_string(),
        canonical::COORDENADA_Y.to_string(),
    ];
    if points.iter().any(|point| point.elevation.is_some()) {
        headers.push(canonical::ALTITUD.to_string());
    }
    if points.iter().any(|point| point.speed.is_some()) {
        headers.push(canonical::VELOCIDAD.to_string());
    }
    headers
}

fn parse_document<'a>(bytes: &'a [u8], label: &str) -> AppResult<Document<'a>> {
    let xml = std::str::from_utf8(bytes)
        .map_err(|err| AppError::Parse(format!("invalid UTF-8 in {label}: {err}")))?;
    Document::parse(xml).map_err(|err| AppError::Parse(format!("invalid {label}: {err}")))
}

fn child_text<'a>(node: Node<'a, 'a>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|child| child.tag_name().name() == name)
        .and_then(|child| child.text())
}

fn parse_coordinates(entry: &str) -> Option<(f64, f64, Option<f64>)> {
    let mut parts = entry.split(',');
    let longitude = parts.next()?.trim().parse().ok()?;
    let latitude = parts.next()?.trim().parse().ok()?;
    let elevation = parts.next().and_then(|v| v.trim().parse().ok());
    Some((longitude, latitude, elevation))
}

fn split_timestamp(stamp: DateTime<Utc>) -> (String, String) {
    (
        stamp.format("%Y-%m-%d").to_string(),
        stamp.format("%H:%M:%S").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1">
      <trk>
        <trkseg>
          <trkpt lat="41.380000" lon="2.170000">
            <time>2024-03-05T08:15:30Z</time>
          </trkpt>
          <trkpt lat="41.380500" lon="2.171000">
            <ele>12.5</ele>
            <speed>13.9</speed>
            <time>2024-03-05T08:15:40Z</time>
          </trkpt>
          <trkpt lat="bogus" lon="2.172000">
            <time>2024-03-05T08:15:50Z</time>
          </trkpt>
        </trkseg>
      </trk>
    </gpx>
    "#;

    const SAMPLE_KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <kml xmlns="http://www.opengis.net/kml/2.2">
      <Document>
        <Placemark>
          <LineString>
            <coordinates>
              2.170000,41.380000,5.0
              2.171000,41.380500
              not-a-coordinate
              2.172000,41.381000,6.5
            </coordinates>
          </LineString>
        </Placemark>
      </Document>
    </kml>
    "#;

    #[test]
    fn parses_gpx_points_and_skips_malformed_ones() {
        let track = parse_track("route.gpx", SAMPLE_GPX.as_bytes()).unwrap();
        assert_eq!(track.points.len(), 2);

        let first = &track.points[0];
        assert_eq!(first.date, "2024-03-05");
        assert_eq!(first.time, "08:15:30");
        assert_eq!(first.longitude, 2.17);
        assert!(first.elevation.is_none());

        let second = &track.points[1];
        assert_eq!(second.elevation, Some(12.5));
        assert_eq!(second.speed, Some(13.9));
    }

    #[test]
    fn elevation_column_survives_a_bare_first_point() {
        let track = parse_track("route.gpx", SAMPLE_GPX.as_bytes()).unwrap();
        assert!(track.headers.iter().any(|h| h == canonical::ALTITUD));
        assert!(track.headers.iter().any(|h| h == canonical::VELOCIDAD));
    }

    #[test]
    fn kml_points_share_one_ingestion_timestamp() {
        let track = parse_track("route.kml", SAMPLE_KML.as_bytes()).unwrap();
        assert_eq!(track.points.len(), 3);

        let first = &track.points[0];
        assert!(track
            .points
            .iter()
            .all(|point| point.date == first.date && point.time == first.time));
        assert_eq!(track.points[1].elevation, None);
        assert_eq!(track.points[2].elevation, Some(6.5));
        assert!(!track.headers.iter().any(|h| h == canonical::VELOCIDAD));
    }

    #[test]
    fn empty_track_is_a_terminal_error() {
        let empty = r#"<kml xmlns="http://www.opengis.net/kml/2.2"><Document/></kml>"#;
        assert!(matches!(
            parse_track("empty.kml", empty.as_bytes()),
            Err(AppError::Parse(_))
        ));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(parse_track("points.csv", b"Fecha,Hora\n").is_err());
    }

    #[test]
    fn binding_stamps_the_identifier_on_every_row() {
        let track = parse_track("route.kml", SAMPLE_KML.as_bytes()).unwrap();
        let payload = to_tabular(&track, " 1234ABC ").unwrap();
        let text = String::from_utf8(payload).unwrap();

        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Fecha,Hora,Coordenada_X,Coordenada_Y,Altitud"));
        assert!(header.ends_with("Matricula"));

        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.ends_with("1234ABC")));
    }

    #[test]
    fn binding_requires_an_identifier() {
        let track = parse_track("route.kml", SAMPLE_KML.as_bytes()).unwrap();
        assert!(matches!(
            to_tabular(&track, "  "),
            Err(AppError::Validation(_))
        ));
    }
}
