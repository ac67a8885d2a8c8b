use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Canonical column names the backend expects, independent of whatever the
/// source file calls them.
pub mod canonical {
    pub const MATRICULA: &str = "Matricula";
    pub const FECHA: &str = "Fecha";
    pub const HORA: &str = "Hora";
    pub const ID_LECTOR: &str = "ID_Lector";
    pub const COORDENADA_X: &str = "Coordenada_X";
    pub const COORDENADA_Y: &str = "Coordenada_Y";
    pub const VELOCIDAD: &str = "Velocidad";
    pub const CARRIL: &str = "Carril";
    pub const SENTIDO: &str = "Sentido";
    pub const ALTITUD: &str = "Altitud";
    pub const PRECISION: &str = "Precision";
}

use canonical::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportKind {
    Lpr,
    Gps,
    Track,
    External,
}

impl ImportKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ImportKind::Lpr => "LPR",
            ImportKind::Gps => "GPS",
            ImportKind::Track => "GPX_KML",
            ImportKind::External => "EXTERNO",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ImportKind::Lpr => "LPR readings",
            ImportKind::Gps => "GPS readings",
            ImportKind::Track => "GPX/KML track",
            ImportKind::External => "External source",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LPR" => Ok(ImportKind::Lpr),
            "GPS" => Ok(ImportKind::Gps),
            "GPX_KML" => Ok(ImportKind::Track),
            "EXTERNO" => Ok(ImportKind::External),
            _ => Err(AppError::Config(format!("invalid import kind: {value}"))),
        }
    }

    /// The kind tag the backend receives. Track files are synthesized into a
    /// tabular payload and travel through the positional (GPS) channel.
    pub fn submission_kind(&self) -> ImportKind {
        match self {
            ImportKind::Track => ImportKind::Gps,
            other => *other,
        }
    }
}

/// Required fields per kind, in priority order for the auto-mapper.
pub fn required_fields(kind: ImportKind) -> &'static [&'static str] {
    match kind {
        ImportKind::Lpr => &[MATRICULA, FECHA, HORA, ID_LECTOR],
        ImportKind::Gps => &[MATRICULA, FECHA, HORA],
        ImportKind::Track => &[FECHA, HORA, COORDENADA_X, COORDENADA_Y],
        ImportKind::External => &[MATRICULA],
    }
}

pub fn optional_fields(kind: ImportKind) -> &'static [&'static str] {
    match kind {
        ImportKind::Lpr => &[CARRIL, SENTIDO, VELOCIDAD, COORDENADA_X, COORDENADA_Y],
        ImportKind::Gps => &[ID_LECTOR, SENTIDO, VELOCIDAD, COORDENADA_X, COORDENADA_Y],
        ImportKind::Track => &[VELOCIDAD, ALTITUD, PRECISION],
        ImportKind::External => &[],
    }
}

/// Required-then-optional, preserving declaration order.
pub fn all_fields(kind: ImportKind) -> Vec<&'static str> {
    let mut fields = required_fields(kind).to_vec();
    fields.extend_from_slice(optional_fields(kind));
    fields
}

/// Lowercase alias sets used for case-insensitive exact matching against
/// source headers. Fields without an entry are never auto-matched.
pub fn aliases(field: &str) -> Option<&'static [&'static str]> {
    match field {
        MATRICULA => Some(&[
            "matricula",
            "matrícula",
            "plate",
            "license",
            "licensenumber",
            "numplaca",
            "patente",
            "licenseplate",
        ]),
        FECHA => Some(&["fecha", "date", "fec"]),
        // A "timestamp" header usually carries the date too; the combined
        // date+time mode exists for exactly that case.
        HORA => Some(&["hora", "time", "timestamp"]),
        ID_LECTOR => Some(&[
            "id_lector",
            "idlector",
            "lector",
            "camara",
            "cámara",
            "device",
            "reader",
            "dispositivo",
            "camera",
            "cam",
            "cam_id",
            "device_id",
            "deviceid",
            "reader_id",
            "readerid",
            "sensor",
            "detector",
            "scanner",
            "scanner_id",
            "scannerid",
            "equipo",
            "equipment",
            "equipment_id",
            "equipmentid",
            "unidad",
            "unit",
            "unit_id",
            "unitid",
            "terminal",
            "terminal_id",
            "terminalid",
            "estacion",
            "station",
            "station_id",
            "stationid",
            "punto",
            "point",
            "point_id",
            "pointid",
            "nodo",
            "node",
            "node_id",
            "nodeid",
            "devicename",
            "device_name",
            "device-name",
            "devicename_id",
            "device_name_id",
            "nombre_dispositivo",
            "nombre_equipo",
            "nombre_lector",
            "nombre_camara",
        ]),
        COORDENADA_X => Some(&[
            "coordenada_x",
            "coord_x",
            "coordx",
            "longitud",
            "longitude",
            "lon",
            "x",
            "este",
            "easting",
        ]),
        COORDENADA_Y => Some(&[
            "coordenada_y",
            "coord_y",
            "coordy",
            "latitud",
            "latitude",
            "lat",
            "y",
            "norte",
            "northing",
        ]),
        VELOCIDAD => Some(&["velocidad", "speed", "vel", "v", "kmh"]),
        CARRIL => Some(&["carril", "lane", "via"]),
        _ => None,
    }
}
