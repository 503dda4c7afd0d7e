//! nom parser for the wire format produced by the encoder.

use std::collections::BTreeMap;

use data_types::{FieldValue, Point};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, recognize},
    error::ErrorKind,
    multi::{many0, separated_list1},
    sequence::pair,
    IResult,
};

use crate::{Error, Result, NANOS_PER_SECOND};

/// Parses a single line into a [`Point`].
///
/// The wire timestamp is nanoseconds; the returned point carries seconds.
pub fn parse(line: &str) -> Result<Point> {
    match parse_line(line) {
        Ok(("", point)) => Ok(point),
        Ok((rest, _)) => Err(Error::Malformed {
            offset: line.len() - rest.len(),
            reason: "unexpected trailing input".into(),
        }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::Malformed {
            offset: line.len() - e.input.len(),
            reason: e.code.description().into(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(Error::Malformed {
            offset: line.len(),
            reason: "incomplete line".into(),
        }),
    }
}

/// Parses a `\n`-joined batch of lines, skipping blank lines.
pub fn parse_batch(data: &str) -> Result<Vec<Point>> {
    data.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(parse)
        .collect()
}

fn parse_line(input: &str) -> IResult<&str, Point> {
    let (input, measurement) = measurement(input)?;
    if measurement.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Verify,
        )));
    }
    let (input, tag_pairs) = many0(tag_pair)(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, field_pairs) = separated_list1(char(','), field_pair)(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, timestamp_ns) = map_res(
        recognize(pair(opt(char('-')), digit1)),
        str::parse::<i64>,
    )(input)?;

    Ok((
        input,
        Point {
            measurement,
            timestamp: timestamp_ns / NANOS_PER_SECOND,
            tags: tag_pairs.into_iter().collect::<BTreeMap<_, _>>(),
            fields: field_pairs.into_iter().collect::<BTreeMap<_, _>>(),
        },
    ))
}

fn measurement(input: &str) -> IResult<&str, String> {
    escaped_until(input, &[',', ' '])
}

fn tag_pair(input: &str) -> IResult<&str, (String, String)> {
    let (input, _) = char(',')(input)?;
    let (input, key) = escaped_until(input, &['=', ',', ' '])?;
    let (input, _) = char('=')(input)?;
    let (input, value) = escaped_until(input, &[',', ' '])?;
    Ok((input, (key, value)))
}

fn field_pair(input: &str) -> IResult<&str, (String, FieldValue)> {
    let (input, key) = escaped_until(input, &['=', ',', ' '])?;
    let (input, _) = char('=')(input)?;
    let (input, value) = field_value(input)?;
    Ok((input, (key, value)))
}

fn field_value(input: &str) -> IResult<&str, FieldValue> {
    alt((string_value, boolean_value, integer_value, float_value))(input)
}

fn string_value(input: &str) -> IResult<&str, FieldValue> {
    let (input, _) = char('"')(input)?;
    let mut out = String::new();
    let mut iter = input.char_indices();
    while let Some((i, c)) = iter.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = iter.next() {
                    out.push(escaped);
                }
            }
            '"' => return Ok((&input[i + 1..], FieldValue::String(out))),
            _ => out.push(c),
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        ErrorKind::Char,
    )))
}

fn boolean_value(input: &str) -> IResult<&str, FieldValue> {
    alt((
        map(tag("true"), |_| FieldValue::Boolean(true)),
        map(tag("TRUE"), |_| FieldValue::Boolean(true)),
        map(tag("false"), |_| FieldValue::Boolean(false)),
        map(tag("FALSE"), |_| FieldValue::Boolean(false)),
        map(tag("t"), |_| FieldValue::Boolean(true)),
        map(tag("T"), |_| FieldValue::Boolean(true)),
        map(tag("f"), |_| FieldValue::Boolean(false)),
        map(tag("F"), |_| FieldValue::Boolean(false)),
    ))(input)
}

fn integer_value(input: &str) -> IResult<&str, FieldValue> {
    let (input, digits) = recognize(pair(opt(char('-')), digit1))(input)?;
    let (input, _) = char('i')(input)?;
    match digits.parse::<i64>() {
        Ok(v) => Ok((input, FieldValue::Integer(v))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        ))),
    }
}

fn float_value(input: &str) -> IResult<&str, FieldValue> {
    map(nom::number::complete::double, FieldValue::Float)(input)
}

/// Consumes characters up to the first unescaped terminator, resolving `\x`
/// escapes along the way. Never fails; the caller decides whether an empty
/// result is acceptable.
fn escaped_until<'a>(input: &'a str, terminators: &[char]) -> IResult<&'a str, String> {
    let mut out = String::new();
    let mut iter = input.char_indices().peekable();
    while let Some(&(i, c)) = iter.peek() {
        if c == '\\' {
            iter.next();
            match iter.peek() {
                Some(&(_, escaped)) => {
                    out.push(escaped);
                    iter.next();
                }
                None => {
                    // lone trailing backslash, keep it verbatim
                    out.push('\\');
                    iter.next();
                }
            }
            continue;
        }
        if terminators.contains(&c) {
            return Ok((&input[i..], out));
        }
        out.push(c);
        iter.next();
    }
    Ok(("", out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn roundtrip(point: &Point) {
        let line = encode(point).unwrap();
        let decoded = parse(&line).unwrap();
        assert_eq!(&decoded, point, "line was: {line}");
    }

    #[test]
    fn parses_simple_line() {
        let point = parse("cpu.idle,host=h1 value=0.87 1700000000000000000").unwrap();
        assert_eq!(point.measurement, "cpu.idle");
        assert_eq!(point.timestamp, 1_700_000_000);
        assert_eq!(point.tags.get("host").map(String::as_str), Some("h1"));
        assert_eq!(point.fields.get("value"), Some(&FieldValue::Float(0.87)));
    }

    #[test]
    fn roundtrips_all_field_types() {
        let point = Point {
            measurement: "m".into(),
            timestamp: 1_700_000_000,
            tags: [("host".to_string(), "h1".to_string())].into_iter().collect(),
            fields: [
                ("b".to_string(), FieldValue::Boolean(false)),
                ("f".to_string(), FieldValue::Float(0.25)),
                ("i".to_string(), FieldValue::Integer(-42)),
                ("s".to_string(), FieldValue::String("up and running".into())),
            ]
            .into_iter()
            .collect(),
        };
        roundtrip(&point);
    }

    #[test]
    fn roundtrips_escaped_content() {
        let point = Point {
            measurement: "disk usage,total".into(),
            timestamp: 3,
            tags: [("mount point".to_string(), "/var=data,old".to_string())]
                .into_iter()
                .collect(),
            fields: [(
                "path".to_string(),
                FieldValue::String(r#"a "quoted" \thing"#.into()),
            )]
            .into_iter()
            .collect(),
        };
        roundtrip(&point);
    }

    #[test]
    fn roundtrips_multiple_tags_regardless_of_order() {
        let point = Point {
            measurement: "net.in".into(),
            timestamp: 1_700_000_000,
            tags: [
                ("host".to_string(), "h1".to_string()),
                ("iface".to_string(), "eth0".to_string()),
                ("region".to_string(), "cn-north".to_string()),
            ]
            .into_iter()
            .collect(),
            fields: [
                ("value".to_string(), FieldValue::Float(1024.0)),
                ("dropped".to_string(), FieldValue::Integer(0)),
            ]
            .into_iter()
            .collect(),
        };
        // maps compare order-insensitively, which is exactly the guarantee
        // the wire format gives us
        roundtrip(&point);
    }

    #[test]
    fn parses_batch() {
        let points =
            parse_batch("a value=1i 1000000000\n\nb value=2i 2000000000\n").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].measurement, "a");
        assert_eq!(points[1].measurement, "b");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse("").is_err());
        assert!(parse("no_fields_or_timestamp").is_err());
        assert!(parse("m value=1i").is_err());
        assert!(parse("m,host= value=1i 1000000000 trailing").is_err());
        assert!(parse(r#"m value="unterminated 1000000000"#).is_err());
    }

    #[test]
    fn integer_requires_suffix() {
        let point = parse("m value=1 1000000000").unwrap();
        assert_eq!(point.fields.get("value"), Some(&FieldValue::Float(1.0)));

        let point = parse("m value=1i 1000000000").unwrap();
        assert_eq!(point.fields.get("value"), Some(&FieldValue::Integer(1)));
    }
}
