//! NMEA-0183 sentence framing and typed decode.
//!
//! Handles the four sentence kinds the fix store cares about:
//!
//! ```text
//! $GPRMC,hhmmss.ss,A,llll.ll,a,yyyyy.yy,a,x.x,x.x,ddmmyy,x.x,a*hh
//! $GPGGA,hhmmss.ss,llll.ll,a,yyyyy.yy,a,q,nn,h.h,a.a,M,g.g,M,,*hh
//! $GPGSA,m,f,sv,sv,sv,sv,sv,sv,sv,sv,sv,sv,sv,sv,p.p,h.h,v.v*hh
//! $GPGSV,t,n,vv,sv,el,az,cn,sv,el,az,cn,...,s*hh
//! ```
//!
//! Field indices below count the sentence id as field 0.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::decode::{SkipReason, optional_field, required_field};

/// Minimum field count of an RMC sentence (NMEA 2.0 layout)
pub const RMC_MIN_FIELDS: usize = 12;
const GGA_MIN_FIELDS: usize = 10;
const GSA_MIN_FIELDS: usize = 18;
const GSV_HEADER_FIELDS: usize = 4;
const GSV_GROUP_FIELDS: usize = 4;

/// Satellite id offset for the secondary constellation
pub const SECONDARY_SVID_OFFSET: u32 = 100;

/// Two-letter talker prefix of a sentence id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Talker {
    /// GP
    Gps,
    /// GB or BD
    BeiDou,
    /// GL
    Glonass,
    /// GA
    Galileo,
    /// GN, a combined multi-constellation solution
    Combined,
    Other,
}

impl Talker {
    pub fn from_code(code: &str) -> Self {
        match code {
            "GP" => Talker::Gps,
            "GB" | "BD" => Talker::BeiDou,
            "GL" => Talker::Glonass,
            "GA" => Talker::Galileo,
            "GN" => Talker::Combined,
            _ => Talker::Other,
        }
    }

    /// Key offset for satellites reported by this talker, if the ephemeris tracks it
    pub fn svid_offset(self) -> Option<u32> {
        match self {
            Talker::Gps => Some(0),
            Talker::BeiDou => Some(SECONDARY_SVID_OFFSET),
            _ => None,
        }
    }

    /// `$G_xxx` sentences: any GNSS talker
    fn is_gnss(self) -> bool {
        !matches!(self, Talker::Other)
    }
}

/// Solution mode reported by GSA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum PosStatus {
    #[default]
    Unknown,
    Invalid,
    Fix2D,
    Fix3D,
}

impl PosStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => PosStatus::Invalid,
            2 => PosStatus::Fix2D,
            3 => PosStatus::Fix3D,
            _ => PosStatus::Unknown,
        }
    }
}

/// Position part of an RMC sentence with status `A`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmcFix {
    pub latitude: f32,
    pub longitude: f32,
    pub speed_knots: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub timestamp: Option<DateTime<Utc>>,
    /// `None` when the receiver reports no lock
    pub fix: Option<RmcFix>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub sats_tracked: Option<i32>,
    pub msl_altitude_m: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gsa {
    pub pos_status: Option<PosStatus>,
    pub pdop: Option<f32>,
    pub hdop: Option<f32>,
    pub vdop: Option<f32>,
}

/// One satellite group from a GSV sentence, key already offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsvSatellite {
    pub svid: u32,
    pub elevation_deg: i32,
    pub azimuth_deg: i32,
    /// 0 when the satellite is visible but not tracked
    pub cno: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gsv {
    pub talker: Talker,
    pub satellites: Vec<GsvSatellite>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NmeaSentence {
    Rmc(Rmc),
    Gga(Gga),
    Gsa(Gsa),
    Gsv(Gsv),
}

/// Frame, checksum and decode one line
///
/// Everything is decoded before anything is returned, so a caller applying
/// the result never sees half a sentence.
pub fn parse_sentence(line: &str) -> Result<NmeaSentence, SkipReason> {
    let payload = verify_checksum(line.trim())?;
    let fields: Vec<&str> = payload.split(',').collect();

    let id = fields[0];
    if id.len() != 5 || !id.is_ascii() {
        return Err(SkipReason::Shape("malformed sentence id"));
    }
    let (talker_code, kind) = id.split_at(2);
    let talker = Talker::from_code(talker_code);

    match kind {
        "RMC" if talker.is_gnss() => decode_rmc(&fields).map(NmeaSentence::Rmc),
        "GGA" if talker.is_gnss() => decode_gga(&fields).map(NmeaSentence::Gga),
        "GSA" if talker.is_gnss() => decode_gsa(&fields).map(NmeaSentence::Gsa),
        "GSV" => decode_gsv(talker, &fields).map(NmeaSentence::Gsv),
        _ => Err(SkipReason::Shape("unhandled sentence type")),
    }
}

/// Strip `$` and an optional `*hh` suffix, checking the XOR checksum when present
fn verify_checksum(line: &str) -> Result<&str, SkipReason> {
    let body = line
        .strip_prefix('$')
        .ok_or(SkipReason::Shape("not an NMEA sentence"))?;

    let Some((payload, checksum)) = body.rsplit_once('*') else {
        return Ok(body);
    };
    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| SkipReason::Shape("unreadable checksum"))?;
    let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(SkipReason::Shape("checksum mismatch"));
    }
    Ok(payload)
}

fn decode_rmc(f: &[&str]) -> Result<Rmc, SkipReason> {
    if f.len() < RMC_MIN_FIELDS {
        return Err(SkipReason::Shape("too few fields for RMC"));
    }

    // Without a lock the position fields are meaningless, only the clock may be
    if f[2].trim() != "A" {
        return Ok(Rmc {
            timestamp: decode_date_time(f[9], f[1]).ok(),
            fix: None,
        });
    }

    let timestamp = decode_date_time(f[9], f[1])?;
    let latitude = decode_coordinate(f[3], f[4], 2, 'N', 'S', "latitude")?;
    let longitude = decode_coordinate(f[5], f[6], 3, 'E', 'W', "longitude")?;
    let speed_knots: f32 = required_field(f[7], "speed")?;

    Ok(Rmc {
        timestamp: Some(timestamp),
        fix: Some(RmcFix {
            latitude,
            longitude,
            speed_knots,
        }),
    })
}

/// `ddmmyy` + `hhmmss[.sss]` as UTC
fn decode_date_time(date: &str, time: &str) -> Result<DateTime<Utc>, SkipReason> {
    let date = date.trim();
    let time = time.trim();

    let digits = |raw: &str, range: std::ops::Range<usize>, name: &'static str| {
        raw.get(range)
            .ok_or_else(|| SkipReason::field(name, raw))
            .and_then(|part| required_field::<u32>(part, name))
    };

    let day = digits(date, 0..2, "date")?;
    let month = digits(date, 2..4, "date")?;
    let year = digits(date, 4..6, "date")? as i32 + 2000;
    let hour = digits(time, 0..2, "time")?;
    let minute = digits(time, 2..4, "time")?;
    let second = digits(time, 4..6, "time")?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| SkipReason::field("date", date))?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| SkipReason::field("time", time))?;
    Ok(date.and_time(time).and_utc())
}

/// `DDMM.MMMM` (or `DDDMM.MMMM`) plus hemisphere into signed decimal degrees
fn decode_coordinate(
    raw: &str,
    hemisphere: &str,
    degree_digits: usize,
    positive: char,
    negative: char,
    name: &'static str,
) -> Result<f32, SkipReason> {
    let raw = raw.trim();
    let (degrees, minutes) = match (raw.get(..degree_digits), raw.get(degree_digits..)) {
        (Some(d), Some(m)) if !m.is_empty() => (d, m),
        _ => return Err(SkipReason::field(name, raw)),
    };
    let degrees: u32 = required_field(degrees, name)?;
    let minutes: f32 = required_field(minutes, name)?;

    let sign = match hemisphere.trim().chars().next() {
        Some(c) if c == positive => 1.0,
        Some(c) if c == negative => -1.0,
        _ => return Err(SkipReason::field(name, hemisphere)),
    };
    Ok(sign * (degrees as f32 + minutes / 60.0))
}

fn decode_gga(f: &[&str]) -> Result<Gga, SkipReason> {
    if f.len() < GGA_MIN_FIELDS {
        return Err(SkipReason::Shape("too few fields for GGA"));
    }
    Ok(Gga {
        sats_tracked: optional_field(f[7], "satellites tracked")?,
        msl_altitude_m: optional_field(f[9], "altitude")?,
    })
}

fn decode_gsa(f: &[&str]) -> Result<Gsa, SkipReason> {
    if f.len() < GSA_MIN_FIELDS {
        return Err(SkipReason::Shape("too few fields for GSA"));
    }
    let mode: Option<i32> = optional_field(f[2], "fix mode")?;
    Ok(Gsa {
        pos_status: mode.map(PosStatus::from_code),
        pdop: optional_field(f[15], "pdop")?,
        hdop: optional_field(f[16], "hdop")?,
        vdop: optional_field(f[17], "vdop")?,
    })
}

/// Satellite groups follow a 4-field header; NMEA 4.1 adds one trailing
/// signal id field, which the integer division drops.
fn decode_gsv(talker: Talker, f: &[&str]) -> Result<Gsv, SkipReason> {
    let Some(offset) = talker.svid_offset() else {
        return Err(SkipReason::Shape("GSV from an untracked constellation"));
    };
    if f.len() < GSV_HEADER_FIELDS {
        return Err(SkipReason::Shape("too few fields for GSV"));
    }

    let group_count = (f.len() - GSV_HEADER_FIELDS) / GSV_GROUP_FIELDS;
    let mut satellites = Vec::with_capacity(group_count);

    for group in f[GSV_HEADER_FIELDS..]
        .chunks_exact(GSV_GROUP_FIELDS)
        .take(group_count)
    {
        // Padding groups on the last sentence of a cycle are empty
        let Some(svid) = optional_field::<u32>(group[0], "svid")? else {
            continue;
        };
        satellites.push(GsvSatellite {
            svid: svid + offset,
            elevation_deg: optional_field(group[1], "elevation")?.unwrap_or(0),
            azimuth_deg: optional_field(group[2], "azimuth")?.unwrap_or(0),
            cno: optional_field(group[3], "cno")?.unwrap_or(0),
        });
    }

    Ok(Gsv { talker, satellites })
}

/// Append a correct `*hh` checksum to a `$...` sentence body
#[cfg(test)]
pub(crate) fn with_checksum(body: &str) -> String {
    let sum = body[1..].bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{}*{:02X}", body, sum)
}
