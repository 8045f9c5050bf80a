//! adapters for the date and time types.
//!
//! text parsing assumes the ISO `DateStyle`, which is what the driver's
//! sessions run with; other styles produce a clear data error instead of
//! silently wrong values.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{Oid, Type};

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    pq::Format,
    types::{Interval, Value, ValueKind},
};

/// the binary wire epoch, 2000-01-01.
fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).unwrap()
}

struct DateDumper;

impl Dumper for DateDumper {
    fn oid(&self) -> Oid {
        Type::DATE.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Date(d) => Ok(Some(d.format("%Y-%m-%d").to_string().into_bytes())),
            other => Err(mismatch("date", other)),
        }
    }
}

struct TimeDumper;

impl Dumper for TimeDumper {
    fn oid(&self) -> Oid {
        Type::TIME.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Time(t) => Ok(Some(t.format("%H:%M:%S%.6f").to_string().into_bytes())),
            other => Err(mismatch("time", other)),
        }
    }
}

struct TimeTzDumper;

impl Dumper for TimeTzDumper {
    fn oid(&self) -> Oid {
        Type::TIMETZ.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::TimeTz(t, off) => Ok(Some(
                format!("{}{}", t.format("%H:%M:%S%.6f"), off).into_bytes(),
            )),
            other => Err(mismatch("timetz", other)),
        }
    }
}

struct TimestampDumper;

impl Dumper for TimestampDumper {
    fn oid(&self) -> Oid {
        Type::TIMESTAMP.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Timestamp(ts) => Ok(Some(
                ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string().into_bytes(),
            )),
            other => Err(mismatch("timestamp", other)),
        }
    }
}

struct TimestampTzDumper;

impl Dumper for TimestampTzDumper {
    fn oid(&self) -> Oid {
        Type::TIMESTAMPTZ.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::TimestampTz(ts) => Ok(Some(
                ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string().into_bytes(),
            )),
            other => Err(mismatch("timestamptz", other)),
        }
    }
}

struct IntervalDumper;

impl Dumper for IntervalDumper {
    fn oid(&self) -> Oid {
        Type::INTERVAL.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let iv = match value {
            Value::Null => return Ok(None),
            Value::Interval(iv) => iv,
            other => return Err(mismatch("interval", other)),
        };

        let mut parts = Vec::new();
        if iv.months != 0 {
            parts.push(format!("{} mons", iv.months));
        }
        if iv.days != 0 {
            parts.push(format!("{} days", iv.days));
        }
        let (sign, micros) = if iv.micros < 0 {
            ("-", -iv.micros)
        } else {
            ("", iv.micros)
        };
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        parts.push(format!(
            "{sign}{:02}:{:02}:{:02}.{frac:06}",
            secs / 3600,
            secs % 3600 / 60,
            secs % 60,
        ));
        Ok(Some(parts.join(" ").into_bytes()))
    }
}

struct DateLoader;

impl Loader for DateLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        check_finite(text)?;
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| Error::data(format!("bad date representation {text:?}: {e}")))
    }
}

struct TimeLoader;

impl Loader for TimeLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        parse_time(text).map(Value::Time)
    }
}

struct TimeTzLoader;

impl Loader for TimeTzLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        let split = offset_start(text)
            .ok_or_else(|| Error::data(format!("no offset in timetz value {text:?}")))?;
        let time = parse_time(&text[..split])?;
        let offset = parse_offset(&text[split..])?;
        Ok(Value::TimeTz(time, offset))
    }
}

struct TimestampLoader;

impl Loader for TimestampLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        check_finite(text)?;
        parse_timestamp(text).map(Value::Timestamp)
    }
}

struct TimestampTzLoader;

impl Loader for TimestampTzLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        check_finite(text)?;
        let split = offset_start(text)
            .ok_or_else(|| Error::data(format!("no offset in timestamptz value {text:?}")))?;
        let naive = parse_timestamp(&text[..split])?;
        let offset = parse_offset(&text[split..])?;
        let dt: DateTime<Utc> = DateTime::<FixedOffset>::from_naive_utc_and_offset(
            naive - Duration::seconds(offset.local_minus_utc() as i64),
            offset,
        )
        .with_timezone(&Utc);
        Ok(Value::TimestampTz(dt))
    }
}

struct IntervalLoader;

impl Loader for IntervalLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = text_of(data)?;
        let mut iv = Interval::default();
        let mut words = text.split_ascii_whitespace().peekable();
        while let Some(word) = words.next() {
            if word.contains(':') {
                iv.micros = parse_clock(word)?;
                continue;
            }
            let n: i64 = word
                .parse()
                .map_err(|_| Error::data(format!("bad interval representation: {text:?}")))?;
            let unit = words
                .next()
                .ok_or_else(|| Error::data(format!("bad interval representation: {text:?}")))?;
            match unit.trim_end_matches('s') {
                "year" => iv.months += n as i32 * 12,
                "mon" => iv.months += n as i32,
                "day" => iv.days += n as i32,
                _ => {
                    return Err(Error::data(format!(
                        "unknown interval unit {unit:?} in {text:?}"
                    )))
                }
            }
        }
        Ok(Value::Interval(iv))
    }
}

struct DateBinaryLoader;

impl Loader for DateBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        if data.len() != 4 {
            return Err(Error::data("binary date must be 4 bytes"));
        }
        let days = BigEndian::read_i32(data);
        if days == i32::MAX || days == i32::MIN {
            return Err(Error::data("date too large to handle"));
        }
        pg_epoch_date()
            .checked_add_signed(Duration::days(days as i64))
            .map(Value::Date)
            .ok_or_else(|| Error::data("date too large to handle"))
    }
}

struct TimeBinaryLoader;

impl Loader for TimeBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        if data.len() != 8 {
            return Err(Error::data("binary time must be 8 bytes"));
        }
        let micros = BigEndian::read_i64(data);
        NaiveTime::from_num_seconds_from_midnight_opt(
            (micros / 1_000_000) as u32,
            (micros % 1_000_000 * 1000) as u32,
        )
        .map(Value::Time)
        .ok_or_else(|| Error::data("time out of range"))
    }
}

struct TimestampBinaryLoader {
    with_tz: bool,
}

impl Loader for TimestampBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        if data.len() != 8 {
            return Err(Error::data("binary timestamp must be 8 bytes"));
        }
        let micros = BigEndian::read_i64(data);
        if micros == i64::MAX || micros == i64::MIN {
            return Err(Error::data("timestamp too large to handle"));
        }
        let ts = pg_epoch()
            .checked_add_signed(Duration::microseconds(micros))
            .ok_or_else(|| Error::data("timestamp too large to handle"))?;
        Ok(if self.with_tz {
            Value::TimestampTz(DateTime::from_naive_utc_and_offset(ts, Utc))
        } else {
            Value::Timestamp(ts)
        })
    }
}

struct IntervalBinaryLoader;

impl Loader for IntervalBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        if data.len() != 16 {
            return Err(Error::data("binary interval must be 16 bytes"));
        }
        Ok(Value::Interval(Interval {
            micros: BigEndian::read_i64(&data[0..8]),
            days: BigEndian::read_i32(&data[8..12]),
            months: BigEndian::read_i32(&data[12..16]),
        }))
    }
}

fn mismatch(what: &str, value: &Value) -> Error {
    Error::programming(format!("{what} dumper got a {:?} value", value.kind()))
}

fn text_of(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|_| Error::data("datetime value is not valid text"))
}

fn check_finite(text: &str) -> Result<(), Error> {
    if text == "infinity" || text == "-infinity" {
        return Err(Error::data(format!("{text} dates cannot be handled")));
    }
    Ok(())
}

fn parse_time(text: &str) -> Result<NaiveTime, Error> {
    let fmt = if text.contains('.') { "%H:%M:%S%.f" } else { "%H:%M:%S" };
    NaiveTime::parse_from_str(text, fmt)
        .map_err(|e| Error::data(format!("bad time representation {text:?}: {e}")))
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, Error> {
    let fmt = if text.contains('.') {
        "%Y-%m-%d %H:%M:%S%.f"
    } else {
        "%Y-%m-%d %H:%M:%S"
    };
    NaiveDateTime::parse_from_str(text, fmt)
        .map_err(|e| Error::data(format!("bad timestamp representation {text:?}: {e}")))
}

/// index of the `+hh` / `-hh` offset suffix, skipping the date separators.
fn offset_start(text: &str) -> Option<usize> {
    text.rfind(['+', '-']).filter(|&i| i >= 8)
}

fn parse_offset(text: &str) -> Result<FixedOffset, Error> {
    let bad = || Error::data(format!("bad utc offset {text:?}"));
    let (sign, rest) = match text.split_at(1) {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return Err(bad()),
    };
    let mut seconds = 0;
    for (i, part) in rest.split(':').enumerate() {
        if i > 2 {
            return Err(bad());
        }
        let v: i32 = part.parse().map_err(|_| bad())?;
        seconds += v * 60i32.pow(2 - i as u32);
    }
    FixedOffset::east_opt(sign * seconds).ok_or_else(bad)
}

fn parse_clock(text: &str) -> Result<i64, Error> {
    let bad = || Error::data(format!("bad interval clock part: {text:?}"));
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text),
    };
    let mut parts = rest.split(':');
    let hours: i64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minutes: i64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let sec_text = parts.next().unwrap_or("0");
    let (secs, frac) = match sec_text.split_once('.') {
        Some((s, f)) => {
            let mut frac = f.to_string();
            while frac.len() < 6 {
                frac.push('0');
            }
            frac.truncate(6);
            (
                s.parse::<i64>().map_err(|_| bad())?,
                frac.parse::<i64>().map_err(|_| bad())?,
            )
        }
        None => (sec_text.parse().map_err(|_| bad())?, 0),
    };
    Ok(sign * (((hours * 60 + minutes) * 60 + secs) * 1_000_000 + frac))
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Date, Arc::new(DateDumper), true);
    map.register_dumper(ValueKind::Time, Arc::new(TimeDumper), true);
    map.register_dumper(ValueKind::TimeTz, Arc::new(TimeTzDumper), true);
    map.register_dumper(ValueKind::Timestamp, Arc::new(TimestampDumper), true);
    map.register_dumper(ValueKind::TimestampTz, Arc::new(TimestampTzDumper), true);
    map.register_dumper(ValueKind::Interval, Arc::new(IntervalDumper), true);

    map.register_loader(Type::DATE.oid(), Arc::new(DateLoader));
    map.register_loader(Type::TIME.oid(), Arc::new(TimeLoader));
    map.register_loader(Type::TIMETZ.oid(), Arc::new(TimeTzLoader));
    map.register_loader(Type::TIMESTAMP.oid(), Arc::new(TimestampLoader));
    map.register_loader(Type::TIMESTAMPTZ.oid(), Arc::new(TimestampTzLoader));
    map.register_loader(Type::INTERVAL.oid(), Arc::new(IntervalLoader));

    map.register_loader(Type::DATE.oid(), Arc::new(DateBinaryLoader));
    map.register_loader(Type::TIME.oid(), Arc::new(TimeBinaryLoader));
    map.register_loader(
        Type::TIMESTAMP.oid(),
        Arc::new(TimestampBinaryLoader { with_tz: false }),
    );
    map.register_loader(
        Type::TIMESTAMPTZ.oid(),
        Arc::new(TimestampBinaryLoader { with_tz: true }),
    );
    map.register_loader(Type::INTERVAL.oid(), Arc::new(IntervalBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;
    use chrono::{Datelike, Timelike};

    fn contexts() -> (AdaptersMap, SessionInfo) {
        (default_adapters(), SessionInfo::default())
    }

    #[test]
    fn date_round_trip() {
        let (map, session) = contexts();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let dumped = DateDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(dumped, b"2024-02-29".to_vec());
        assert_eq!(DateLoader.load(&dumped, &lx).unwrap(), value);
    }

    #[test]
    fn infinity_dates_raise_data_error() {
        let (map, session) = contexts();
        let lx = LoadContext { session: &session, adapters: &map };
        let err = DateLoader.load(b"infinity", &lx).unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Data);
    }

    #[test]
    fn timestamptz_normalizes_to_utc() {
        let (map, session) = contexts();
        let lx = LoadContext { session: &session, adapters: &map };
        let loaded = TimestampTzLoader
            .load(b"2024-06-01 12:30:00+02", &lx)
            .unwrap();
        let Value::TimestampTz(ts) = loaded else { panic!("wrong variant") };
        assert_eq!(ts.hour(), 10);
        assert_eq!(ts.day(), 1);
    }

    #[test]
    fn negative_interval_round_trip() {
        let (map, session) = contexts();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Interval(Interval {
            months: -2,
            days: 3,
            micros: -3_723_456_789,
        });
        let dumped = IntervalDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(dumped.clone()).unwrap(),
            "-2 mons 3 days -01:02:03.456789"
        );
        assert_eq!(IntervalLoader.load(&dumped, &lx).unwrap(), value);
    }

    #[test]
    fn interval_with_years_loads() {
        let (map, session) = contexts();
        let lx = LoadContext { session: &session, adapters: &map };
        let loaded = IntervalLoader.load(b"1 year 2 mons 3 days 04:05:06", &lx).unwrap();
        assert_eq!(
            loaded,
            Value::Interval(Interval { months: 14, days: 3, micros: 14_706_000_000 })
        );
    }
}
