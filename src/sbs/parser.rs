use chrono::{DateTime, NaiveDateTime, Utc};

use crate::decode::{SkipReason, optional_field};

/// Fields in a BaseStation `MSG` record
pub const SBS_FIELD_COUNT: usize = 22;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

/// SBS message types (MSG,1 through MSG,8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbsMessageType {
    /// MSG,1: ES Identification and Category (callsign)
    EsIdentification = 1,
    /// MSG,2: ES Surface Position Message
    EsSurfacePosition = 2,
    /// MSG,3: ES Airborne Position Message
    EsAirbornePosition = 3,
    /// MSG,4: ES Airborne Velocity Message
    EsAirborneVelocity = 4,
    /// MSG,5: Surveillance Alt Message
    SurveillanceAlt = 5,
    /// MSG,6: Surveillance ID Message (squawk)
    SurveillanceId = 6,
    /// MSG,7: Air To Air Message
    AirToAir = 7,
    /// MSG,8: All Call Reply
    AllCallReply = 8,
}

impl SbsMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EsIdentification),
            2 => Some(Self::EsSurfacePosition),
            3 => Some(Self::EsAirbornePosition),
            4 => Some(Self::EsAirborneVelocity),
            5 => Some(Self::SurveillanceAlt),
            6 => Some(Self::SurveillanceId),
            7 => Some(Self::AirToAir),
            8 => Some(Self::AllCallReply),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn carries_callsign(self) -> bool {
        matches!(self, Self::EsIdentification)
    }

    pub fn carries_altitude(self) -> bool {
        matches!(
            self,
            Self::EsSurfacePosition
                | Self::EsAirbornePosition
                | Self::SurveillanceAlt
                | Self::SurveillanceId
                | Self::AirToAir
        )
    }

    pub fn carries_velocity(self) -> bool {
        matches!(self, Self::EsSurfacePosition | Self::EsAirborneVelocity)
    }

    pub fn carries_position(self) -> bool {
        matches!(self, Self::EsSurfacePosition | Self::EsAirbornePosition)
    }

    pub fn carries_squawk(self) -> bool {
        matches!(self, Self::SurveillanceId)
    }

    pub fn carries_ground_flag(self) -> bool {
        !matches!(self, Self::EsIdentification | Self::EsAirborneVelocity)
    }
}

/// A line that passed the shape check and names a valid aircraft
///
/// Field decoding happens separately in [`RoutedLine::decode`] so the caller
/// can tell "not for us" apart from "for this aircraft, but malformed".
#[derive(Debug)]
pub struct RoutedLine<'a> {
    pub icao24: u32,
    fields: Vec<&'a str>,
}

/// Everything one message reports, decoded up front
///
/// `None` means the message type does not carry the field or the feed left
/// it empty; either way the stored value is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct SbsUpdate {
    pub icao24: u32,
    pub message_type: SbsMessageType,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<i32>,
    pub track_deg: Option<f32>,
    /// Latitude and longitude, only when both are present
    pub position: Option<(f32, f32)>,
    pub squawk: Option<i32>,
    pub on_ground: Option<bool>,
    /// Logged date/time from the feed; `None` when the feed left it blank
    pub timestamp: Option<DateTime<Utc>>,
}

/// Shape check: `MSG` record with at least 22 fields and a hex ICAO address
///
/// SBS format: MSG,<type>,<transmission_type>,<session_id>,<aircraft_id>,<flight_id>,
///             <date_gen>,<time_gen>,<date_log>,<time_log>,<callsign>,<altitude>,
///             <ground_speed>,<track>,<latitude>,<longitude>,<vertical_rate>,<squawk>,
///             <alert>,<emergency>,<spi>,<on_ground>
///
/// SEL/ID/AIR/STA records are rejected here, which is the normal case.
pub fn route_line(line: &str) -> Result<RoutedLine<'_>, SkipReason> {
    let fields: Vec<&str> = line.trim().split(',').collect();

    if fields[0] != "MSG" {
        return Err(SkipReason::Shape("not a MSG record"));
    }
    if fields.len() < SBS_FIELD_COUNT {
        return Err(SkipReason::Shape("too few fields for a MSG record"));
    }

    let icao24 = u32::from_str_radix(fields[4].trim(), 16)
        .map_err(|_| SkipReason::Shape("aircraft id is not hex"))?;

    Ok(RoutedLine { icao24, fields })
}

impl RoutedLine<'_> {
    /// Decode every field the message type carries
    ///
    /// Any malformed non-empty field fails the whole message.
    pub fn decode(&self) -> Result<SbsUpdate, SkipReason> {
        let f = &self.fields;

        let type_raw = f[1].trim();
        let message_type = type_raw
            .parse::<u8>()
            .ok()
            .and_then(SbsMessageType::from_u8)
            .ok_or_else(|| SkipReason::field("message type", type_raw))?;

        let mut update = SbsUpdate {
            icao24: self.icao24,
            message_type,
            callsign: None,
            altitude: None,
            ground_speed: None,
            track_deg: None,
            position: None,
            squawk: None,
            on_ground: None,
            timestamp: parse_timestamp(f[8], f[9])?,
        };

        if message_type.carries_callsign() {
            update.callsign = Some(f[10].trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
        if message_type.carries_altitude() {
            update.altitude = optional_field(f[11], "altitude")?;
        }
        if message_type.carries_velocity() {
            update.ground_speed = optional_field(f[12], "ground speed")?;
            update.track_deg = optional_field(f[13], "track")?;
        }
        if message_type.carries_position() {
            let latitude: Option<f32> = optional_field(f[14], "latitude")?;
            let longitude: Option<f32> = optional_field(f[15], "longitude")?;
            update.position = match (latitude, longitude) {
                (Some(lat), Some(lon)) => Some((lat, lon)),
                (None, None) => None,
                (Some(_), None) => return Err(SkipReason::field("longitude", f[15])),
                (None, Some(_)) => return Err(SkipReason::field("latitude", f[14])),
            };
        }
        if message_type.carries_squawk() {
            update.squawk = optional_field(f[17], "squawk")?;
        }
        if message_type.carries_ground_flag() {
            update.on_ground = match f[21].trim() {
                "1" => Some(true),
                "0" => Some(false),
                _ => None,
            };
        }

        Ok(update)
    }
}

/// Logged date + time, e.g. `2008/11/28` + `23:53:19.161`
fn parse_timestamp(date: &str, time: &str) -> Result<Option<DateTime<Utc>>, SkipReason> {
    let date = date.trim();
    if date.is_empty() {
        return Ok(None);
    }
    let joined = format!("{} {}", date, time.trim());
    NaiveDateTime::parse_from_str(&joined, TIMESTAMP_FORMAT)
        .map(|naive| Some(naive.and_utc()))
        .map_err(|_| SkipReason::field("timestamp", &joined))
}
