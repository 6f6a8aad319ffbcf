//! Decoding of Oracle on-disk column values.
//!
//! Redo change vectors carry column images in Oracle's internal formats.
//! The engine converts them to lossless string/number forms:
//!
//! - `NUMBER` — sign/exponent byte plus base-100 mantissa digits, decoded
//!   to an exact decimal string;
//! - `DATE` — 7 bytes (century, year, month, day, hour+1, minute+1,
//!   second+1, the first two excess-100);
//! - `TIMESTAMP` — the 7 date bytes plus an optional big-endian
//!   nanosecond word;
//! - `TIMESTAMP WITH TIME ZONE` — 11 bytes plus a 2-byte zone: offset
//!   form `(hours+20, minutes+60)`; region-id form is not resolvable
//!   offline and is a data error;
//! - character data — charset-validated text.
//!
//! How a malformed value is handled is decided by [`DataPolicy`]: strict
//! mode surfaces the error, degrade mode substitutes a printable fallback.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};

/// Longest valid `NUMBER` image: sign/exponent byte + 20 mantissa bytes.
const NUMBER_MAX_LEN: usize = 21;
/// Terminator byte on short negative `NUMBER` images.
const NUMBER_NEG_TERMINATOR: u8 = 0x66;

/// Error decoding a single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Malformed `NUMBER` image.
    BadNumber { detail: String },
    /// A date or timestamp field is out of range.
    BadDate { detail: String },
    /// Character data failed charset validation.
    BadCharset { detail: String },
    /// The image length does not match the column type.
    BadLength { expected: usize, actual: usize },
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadNumber { detail } => write!(f, "malformed NUMBER: {detail}"),
            Self::BadDate { detail } => write!(f, "invalid date/timestamp: {detail}"),
            Self::BadCharset { detail } => write!(f, "invalid character data: {detail}"),
            Self::BadLength { expected, actual } => {
                write!(f, "bad value length: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for ValueError {}

/// Handling of corrupt user data (spec-level *Data* errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPolicy {
    /// Surface the error; the run stops.
    #[default]
    Strict,
    /// Degrade the value to a printable fallback and continue.
    Degrade,
}

/// Column types the engine materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    Number,
    Varchar2,
    Char,
    Raw,
    Date,
    Timestamp,
    TimestampTz,
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    /// Exact decimal string from a `NUMBER` image.
    Number(String),
    Text(String),
    /// Raw bytes, rendered as hex by the builder.
    Raw(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

impl FieldValue {
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A database timezone as a fixed offset, e.g. `+02:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbTimezone {
    offset_seconds: i32,
}

impl DbTimezone {
    pub const UTC: Self = Self { offset_seconds: 0 };

    #[must_use]
    pub fn fixed_offset(self) -> FixedOffset {
        FixedOffset::east_opt(self.offset_seconds).unwrap_or_else(|| {
            // offset_seconds is validated at construction
            FixedOffset::east_opt(0).expect("zero offset is valid")
        })
    }

    /// Attach this zone to a naive database-local timestamp.
    #[must_use]
    pub fn localize(self, ts: NaiveDateTime) -> DateTime<FixedOffset> {
        match self.fixed_offset().from_local_datetime(&ts) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
            chrono::LocalResult::None => self
                .fixed_offset()
                .from_utc_datetime(&ts),
        }
    }
}

impl FromStr for DbTimezone {
    type Err = ValueError;

    /// Parse `[+|-]HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ValueError::BadDate {
            detail: format!("bad timezone: {s:?}"),
        };
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1i32, &s[1..]),
            Some(b'-') => (-1i32, &s[1..]),
            _ => (1i32, s),
        };
        let (hh, mm) = rest.split_once(':').ok_or_else(bad)?;
        let hours: i32 = hh.parse().map_err(|_| bad())?;
        let minutes: i32 = mm.parse().map_err(|_| bad())?;
        if hours > 14 || minutes > 59 {
            return Err(bad());
        }
        Ok(Self {
            offset_seconds: sign * (hours * 3600 + minutes * 60),
        })
    }
}

/// Decode an Oracle `NUMBER` image to an exact decimal string.
pub fn decode_number(bytes: &[u8]) -> Result<String, ValueError> {
    let malformed = |detail: &str| ValueError::BadNumber {
        detail: detail.to_owned(),
    };

    match bytes {
        [] => return Err(malformed("empty image")),
        [0x80] => return Ok("0".to_owned()),
        _ => {}
    }
    if bytes.len() > NUMBER_MAX_LEN {
        return Err(malformed("image too long"));
    }

    let head = bytes[0];
    let positive = head & 0x80 != 0;

    let (exponent, pairs): (i32, Vec<u8>) = if positive {
        let exponent = i32::from(head & 0x7f) - 65;
        let mut pairs = Vec::with_capacity(bytes.len() - 1);
        for &b in &bytes[1..] {
            if !(1..=100).contains(&b) {
                return Err(malformed("mantissa byte out of range"));
            }
            pairs.push(b - 1);
        }
        (exponent, pairs)
    } else {
        let exponent = 62 - i32::from(head);
        let mantissa = match bytes.last() {
            Some(&NUMBER_NEG_TERMINATOR) => &bytes[1..bytes.len() - 1],
            _ => &bytes[1..],
        };
        let mut pairs = Vec::with_capacity(mantissa.len());
        for &b in mantissa {
            if !(2..=101).contains(&b) {
                return Err(malformed("mantissa byte out of range"));
            }
            pairs.push(101 - b);
        }
        (exponent, pairs)
    };

    if pairs.is_empty() {
        return Err(malformed("empty mantissa"));
    }

    let mut out = String::new();
    if !positive {
        out.push('-');
    }

    let n = pairs.len() as i32;
    if exponent >= 0 {
        if exponent >= n - 1 {
            // Pure integer, possibly with trailing zero pairs.
            push_pairs(&mut out, &pairs, true);
            for _ in 0..(exponent - (n - 1)) {
                out.push_str("00");
            }
        } else {
            let split = (exponent + 1) as usize;
            push_pairs(&mut out, &pairs[..split], true);
            let mut frac = String::new();
            push_pairs(&mut frac, &pairs[split..], false);
            push_fraction(&mut out, &frac);
        }
    } else {
        out.push('0');
        let mut frac = String::new();
        for _ in 0..(-exponent - 1) {
            frac.push_str("00");
        }
        push_pairs(&mut frac, &pairs, false);
        push_fraction(&mut out, &frac);
    }

    Ok(out)
}

fn push_pairs(out: &mut String, pairs: &[u8], trim_leading: bool) {
    for (i, &p) in pairs.iter().enumerate() {
        if i == 0 && trim_leading {
            out.push_str(&p.to_string());
        } else {
            out.push_str(&format!("{p:02}"));
        }
    }
}

fn push_fraction(out: &mut String, frac: &str) {
    let trimmed = frac.trim_end_matches('0');
    if !trimmed.is_empty() {
        out.push('.');
        out.push_str(trimmed);
    }
}

/// Decode a 7-byte Oracle `DATE` image.
pub fn decode_date(bytes: &[u8]) -> Result<NaiveDateTime, ValueError> {
    if bytes.len() != 7 {
        return Err(ValueError::BadLength {
            expected: 7,
            actual: bytes.len(),
        });
    }
    decode_datetime7(bytes)
}

fn decode_datetime7(b: &[u8]) -> Result<NaiveDateTime, ValueError> {
    let bad = |detail: String| ValueError::BadDate { detail };
    let year = (i32::from(b[0]) - 100) * 100 + (i32::from(b[1]) - 100);
    let month = u32::from(b[2]);
    let day = u32::from(b[3]);
    let (hour, minute, second) = (
        u32::from(b[4]).wrapping_sub(1),
        u32::from(b[5]).wrapping_sub(1),
        u32::from(b[6]).wrapping_sub(1),
    );
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| bad(format!("y={year} m={month} d={day}")))?;
    date.and_hms_opt(hour, minute, second)
        .ok_or_else(|| bad(format!("h={hour} m={minute} s={second}")))
}

/// Decode a 7- or 11-byte `TIMESTAMP` image (optional nanosecond word).
pub fn decode_timestamp(bytes: &[u8]) -> Result<NaiveDateTime, ValueError> {
    match bytes.len() {
        7 => decode_datetime7(bytes),
        11 => {
            let base = decode_datetime7(&bytes[..7])?;
            let nanos = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
            if nanos >= 1_000_000_000 {
                return Err(ValueError::BadDate {
                    detail: format!("nanoseconds out of range: {nanos}"),
                });
            }
            base.with_nanosecond(nanos).ok_or(ValueError::BadDate {
                detail: "nanosecond adjustment failed".to_owned(),
            })
        }
        other => Err(ValueError::BadLength {
            expected: 11,
            actual: other,
        }),
    }
}

/// Decode a 13-byte `TIMESTAMP WITH TIME ZONE` image.
///
/// Only the fixed-offset zone form is decodable offline; region-id images
/// (high bit of the hour byte set) are a data error.
pub fn decode_timestamp_tz(bytes: &[u8]) -> Result<DateTime<FixedOffset>, ValueError> {
    if bytes.len() != 13 {
        return Err(ValueError::BadLength {
            expected: 13,
            actual: bytes.len(),
        });
    }
    if bytes[11] & 0x80 != 0 {
        return Err(ValueError::BadDate {
            detail: "region-id timezone not resolvable offline".to_owned(),
        });
    }
    let base = decode_timestamp(&bytes[..11])?;
    let hours = i32::from(bytes[11]) - 20;
    let minutes = i32::from(bytes[12]) - 60;
    let offset = FixedOffset::east_opt(hours * 3600 + minutes * 60).ok_or(ValueError::BadDate {
        detail: format!("timezone offset out of range: {hours}:{minutes}"),
    })?;
    // The stored datetime is UTC; the zone is presentation only.
    Ok(offset.from_utc_datetime(&base))
}

/// Charsets the engine can validate without a live database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    /// Single-byte charsets map bytes to the first 256 code points.
    SingleByte,
}

/// Decode character data under the given charset and policy.
pub fn decode_text(bytes: &[u8], charset: Charset, policy: DataPolicy) -> Result<String, ValueError> {
    match charset {
        Charset::Utf8 => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(e) => match policy {
                DataPolicy::Strict => Err(ValueError::BadCharset {
                    detail: format!("invalid UTF-8 at byte {}", e.valid_up_to()),
                }),
                DataPolicy::Degrade => Ok(String::from_utf8_lossy(bytes).into_owned()),
            },
        },
        Charset::SingleByte => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Decode one column image according to its declared type.
pub fn decode_column(
    bytes: &[u8],
    ty: ColumnType,
    charset: Charset,
    policy: DataPolicy,
) -> Result<FieldValue, ValueError> {
    let degrade = |e: ValueError| match policy {
        DataPolicy::Strict => Err(e),
        DataPolicy::Degrade => Ok(FieldValue::Raw(bytes.to_vec())),
    };
    match ty {
        ColumnType::Number => match decode_number(bytes) {
            Ok(s) => Ok(FieldValue::Number(s)),
            Err(e) => degrade(e),
        },
        ColumnType::Varchar2 | ColumnType::Char => {
            decode_text(bytes, charset, policy).map(FieldValue::Text)
        }
        ColumnType::Raw => Ok(FieldValue::Raw(bytes.to_vec())),
        ColumnType::Date => match decode_date(bytes) {
            Ok(ts) => Ok(FieldValue::Timestamp(ts)),
            Err(e) => degrade(e),
        },
        ColumnType::Timestamp => match decode_timestamp(bytes) {
            Ok(ts) => Ok(FieldValue::Timestamp(ts)),
            Err(e) => degrade(e),
        },
        ColumnType::TimestampTz => match decode_timestamp_tz(bytes) {
            Ok(ts) => Ok(FieldValue::TimestampTz(ts)),
            Err(e) => degrade(e),
        },
    }
}

/// Encode a decimal string into an Oracle `NUMBER` image.
///
/// Inverse of [`decode_number`]; used by the fixture writer and the codec
/// round-trip tests.
pub fn encode_number(text: &str) -> Result<Vec<u8>, ValueError> {
    let malformed = |detail: &str| ValueError::BadNumber {
        detail: detail.to_owned(),
    };

    let (negative, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(malformed("empty literal"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed("non-digit in literal"));
    }

    // Normalize into a digit string and a decimal exponent, aligned to
    // base-100 pairs.
    let mut digits: Vec<u8> = Vec::new();
    digits.extend(int_part.bytes().map(|b| b - b'0'));
    let int_len = digits.len() as i32;
    digits.extend(frac_part.bytes().map(|b| b - b'0'));

    // Strip leading zeros.
    let lead = digits.iter().take_while(|&&d| d == 0).count();
    digits.drain(..lead);
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        return Ok(vec![0x80]);
    }

    // Position of the first significant digit relative to the decimal point.
    let first_pos = int_len - lead as i32; // >0: integer digits, <=0: fraction
    // Align to pairs: base-100 exponent of the leading pair.
    let (exp, pad_front) = if first_pos > 0 {
        ((first_pos + 1) / 2 - 1, first_pos % 2 != 0)
    } else {
        // 0.0d... — leading zeros inside the fraction.
        let zeros = -first_pos;
        ((-(zeros / 2)) - 1, zeros % 2 != 0)
    };

    let mut aligned: Vec<u8> = Vec::new();
    if pad_front {
        aligned.push(0);
    }
    aligned.extend(&digits);
    if aligned.len() % 2 != 0 {
        aligned.push(0);
    }
    let mut pairs: Vec<u8> = aligned.chunks(2).map(|c| c[0] * 10 + c[1]).collect();
    while pairs.last() == Some(&0) {
        pairs.pop();
    }
    if pairs.len() > 20 {
        return Err(malformed("too many significant digits"));
    }

    let mut out = Vec::with_capacity(pairs.len() + 2);
    if negative {
        let head = 62 - exp;
        if !(0..=127).contains(&head) {
            return Err(malformed("exponent out of range"));
        }
        out.push(head as u8);
        out.extend(pairs.iter().map(|&p| 101 - p));
        if out.len() < NUMBER_MAX_LEN {
            out.push(NUMBER_NEG_TERMINATOR);
        }
    } else {
        let head = exp + 65;
        if !(0..=127).contains(&head) {
            return Err(malformed("exponent out of range"));
        }
        out.push(0x80 | head as u8);
        out.extend(pairs.iter().map(|&p| p + 1));
    }
    Ok(out)
}

/// Encode a naive timestamp into the 7-byte `DATE` image.
#[must_use]
pub fn encode_date(ts: NaiveDateTime) -> [u8; 7] {
    use chrono::Datelike;
    let year = ts.year();
    [
        (year / 100 + 100) as u8,
        (year % 100 + 100) as u8,
        ts.month() as u8,
        ts.day() as u8,
        (ts.hour() + 1) as u8,
        (ts.minute() + 1) as u8,
        (ts.second() + 1) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_zero() {
        assert_eq!(decode_number(&[0x80]).unwrap(), "0");
    }

    #[test]
    fn number_small_integers() {
        assert_eq!(decode_number(&[0xc1, 0x02]).unwrap(), "1");
        assert_eq!(decode_number(&[0xc1, 0x64]).unwrap(), "99");
        assert_eq!(decode_number(&[0xc2, 0x02]).unwrap(), "100");
        assert_eq!(decode_number(&[0xc2, 0x02, 0x17]).unwrap(), "122");
    }

    #[test]
    fn number_fractions() {
        // 1.5 = pairs [1, 50], exp 0
        assert_eq!(decode_number(&[0xc1, 0x02, 0x33]).unwrap(), "1.5");
        // 0.05 = pair [5], exp -1
        assert_eq!(decode_number(&[0xc0, 0x06]).unwrap(), "0.05");
        // 0.0005 = pair [5], exp -2
        assert_eq!(decode_number(&[0xbf, 0x06]).unwrap(), "0.0005");
    }

    #[test]
    fn number_negative() {
        // -1 = head 62, digit 101-1=100, terminator
        assert_eq!(decode_number(&[0x3e, 0x64, 0x66]).unwrap(), "-1");
        // -100
        assert_eq!(decode_number(&[0x3d, 0x64, 0x66]).unwrap(), "-100");
    }

    #[test]
    fn number_malformed() {
        assert!(decode_number(&[]).is_err());
        assert!(decode_number(&[0xc1]).is_err());
        assert!(decode_number(&[0xc1, 0x00]).is_err());
    }

    #[test]
    fn number_round_trip() {
        for lit in [
            "0", "1", "99", "100", "122", "1.5", "0.05", "0.0005", "-1", "-100", "-3.25",
            "12345.6789", "150", "200", "42",
        ] {
            let encoded = encode_number(lit).unwrap();
            assert_eq!(decode_number(&encoded).unwrap(), lit, "literal {lit}");
        }
    }

    #[test]
    fn date_round_trip() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(13, 45, 9)
            .unwrap();
        assert_eq!(decode_date(&encode_date(ts)).unwrap(), ts);
    }

    #[test]
    fn date_rejects_bad_month() {
        let mut img = encode_date(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        img[2] = 13;
        assert!(matches!(decode_date(&img), Err(ValueError::BadDate { .. })));
    }

    #[test]
    fn timestamp_with_nanos() {
        let ts = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(5, 0, 0)
            .unwrap();
        let mut img = encode_date(ts).to_vec();
        img.extend_from_slice(&24_589_000u32.to_be_bytes());
        let decoded = decode_timestamp(&img).unwrap();
        assert_eq!(decoded.and_utc().timestamp_subsec_nanos(), 24_589_000);
    }

    #[test]
    fn timestamp_tz_offset_form() {
        let ts = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut img = encode_date(ts).to_vec();
        img.extend_from_slice(&0u32.to_be_bytes());
        img.push(20 + 2); // +02 hours
        img.push(60); // +00 minutes
        let decoded = decode_timestamp_tz(&img).unwrap();
        assert_eq!(decoded.offset().local_minus_utc(), 2 * 3600);
        assert_eq!(decoded.naive_utc(), ts);
    }

    #[test]
    fn timestamp_tz_region_is_error() {
        let mut img = [0u8; 13];
        img[..7].copy_from_slice(&encode_date(
            NaiveDate::from_ymd_opt(2021, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        ));
        img[11] = 0x80 | 1;
        assert!(decode_timestamp_tz(&img).is_err());
    }

    #[test]
    fn text_policies() {
        assert_eq!(
            decode_text(b"hello", Charset::Utf8, DataPolicy::Strict).unwrap(),
            "hello"
        );
        let bad = [0x66, 0xff, 0x67];
        assert!(decode_text(&bad, Charset::Utf8, DataPolicy::Strict).is_err());
        let degraded = decode_text(&bad, Charset::Utf8, DataPolicy::Degrade).unwrap();
        assert!(degraded.contains('\u{fffd}'));
        assert_eq!(
            decode_text(&[0x41, 0xe9], Charset::SingleByte, DataPolicy::Strict).unwrap(),
            "Aé"
        );
    }

    proptest::proptest! {
        // Canonical decimal literals survive the NUMBER image round trip.
        #[test]
        fn number_codec_round_trips(
            int in 0u64..1_000_000_000,
            frac in 0u32..1_000_000,
            negative in proptest::bool::ANY,
        ) {
            let mut literal = int.to_string();
            let frac_digits = frac.to_string();
            let frac_trimmed = frac_digits.trim_end_matches('0');
            if !frac_trimmed.is_empty() {
                literal.push('.');
                literal.push_str(frac_trimmed);
            }
            if negative && literal != "0" {
                literal.insert(0, '-');
            }
            let encoded = encode_number(&literal).unwrap();
            proptest::prop_assert_eq!(decode_number(&encoded).unwrap(), literal);
        }
    }

    #[test]
    fn db_timezone_parse() {
        let tz: DbTimezone = "+02:00".parse().unwrap();
        assert_eq!(tz.fixed_offset().local_minus_utc(), 7200);
        let tz: DbTimezone = "-05:30".parse().unwrap();
        assert_eq!(tz.fixed_offset().local_minus_utc(), -(5 * 3600 + 1800));
        assert!("nope".parse::<DbTimezone>().is_err());
        assert!("+15:00".parse::<DbTimezone>().is_err());
    }
}
