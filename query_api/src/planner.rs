//! Translating high-level range and usage requests into backend queries.

/// Milliseconds in a day.
pub const DAY_MS: i64 = 86_400_000;

/// The bucket count the interval ladder aims for over a query range.
const TARGET_BUCKETS: i64 = 1500;

/// Snap values for group-by intervals, in milliseconds.
const INTERVALS: &[(i64, &str)] = &[
    (10_000, "10s"),
    (30_000, "30s"),
    (60_000, "1m"),
    (300_000, "5m"),
    (600_000, "10m"),
    (1_800_000, "30m"),
    (3_600_000, "1h"),
    (10_800_000, "3h"),
    (21_600_000, "6h"),
    (43_200_000, "12h"),
    (86_400_000, "1d"),
    (604_800_000, "7d"),
    (2_592_000_000, "30d"),
];

/// Picks the group-by interval for a range of `range_ms` milliseconds:
/// the smallest ladder value yielding at most roughly [`TARGET_BUCKETS`]
/// buckets.
pub fn interval_for(range_ms: i64) -> &'static str {
    let target = (range_ms / TARGET_BUCKETS).max(1);
    for (ms, name) in INTERVALS {
        if *ms >= target {
            return name;
        }
    }
    INTERVALS[INTERVALS.len() - 1].1
}

/// Builds the aggregate range query backing `/query2`.
///
/// `func` defaults to `mean` and `fill` to `null`. For `max`, `min` and
/// `medium` (spelling as the backend accepts it) the hostname column rides
/// along in the projection. With a `where` clause, the group-by gains every
/// tag key of `tag_keys` that appears in the clause.
pub fn range_query(
    measurement: &str,
    start_ms: i64,
    end_ms: i64,
    tag_keys: &[String],
    where_clause: &str,
    func: &str,
    fill: &str,
) -> String {
    let func = if func.is_empty() { "mean" } else { func };
    let fill = if fill.is_empty() { "null" } else { fill };
    let interval = interval_for(end_ms - start_ms);

    let projection = match func {
        "max" | "min" | "medium" => format!("{func}(\"value\"),\"host\""),
        _ => format!("{func}(\"value\")"),
    };

    if where_clause.is_empty() {
        return format!(
            "SELECT {projection} FROM \"{measurement}\" WHERE time > {start_ms}ms and time < {end_ms}ms GROUP BY time({interval}) fill({fill})"
        );
    }

    let group_tags = tag_keys
        .iter()
        .filter(|key| where_clause.contains(key.as_str()))
        .map(|key| format!("\"{key}\""))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "SELECT {projection} FROM \"{measurement}\" WHERE {where_clause} AND time > {start_ms}ms and time < {end_ms}ms GROUP BY time({interval}), {group_tags} fill({fill})"
    )
}

/// Builds the per-host usage query backing `/usage`.
///
/// The group-by is always `"host"`, plus any extra tags, plus the caller's
/// bucket duration (e.g. `1h`). `_period` is accepted for API compatibility
/// but does not influence the query.
pub fn usage_query(
    measurement: &str,
    func: &str,
    _period: &str,
    duration: &str,
    start_ms: i64,
    end_ms: i64,
    group_by: &[String],
) -> String {
    let mut groups = vec!["\"host\"".to_string()];
    groups.extend(group_by.iter().map(|tag| format!("\"{tag}\"")));

    format!(
        "SELECT {func}(\"value\") FROM \"{measurement}\" WHERE time > {start_ms}ms and time < {end_ms}ms GROUP BY {},time({duration})",
        groups.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_snaps_logarithmically() {
        // one hour → 10s buckets
        assert_eq!(interval_for(3_600_000), "10s");
        // one day → 1m
        assert_eq!(interval_for(DAY_MS), "1m");
        // one week → 10m
        assert_eq!(interval_for(7 * DAY_MS), "10m");
        // thirty days → 30m
        assert_eq!(interval_for(30 * DAY_MS), "30m");
        // a year → 6h
        assert_eq!(interval_for(365 * DAY_MS), "6h");
        // absurd ranges stay on the top rung
        assert_eq!(interval_for(300_000 * DAY_MS), "30d");
    }

    #[test]
    fn range_query_defaults() {
        let q = range_query("cpu.idle", 1000, 3_601_000, &[], "", "", "");
        assert_eq!(
            q,
            "SELECT mean(\"value\") FROM \"cpu.idle\" WHERE time > 1000ms and time < 3601000ms GROUP BY time(10s) fill(null)"
        );
    }

    #[test]
    fn range_query_selected_functions_carry_host() {
        for func in ["max", "min", "medium"] {
            let q = range_query("cpu.idle", 0, 3_600_000, &[], "", func, "0");
            assert!(
                q.starts_with(&format!("SELECT {func}(\"value\"),\"host\" FROM")),
                "got {q}"
            );
            assert!(q.ends_with("fill(0)"));
        }

        let q = range_query("cpu.idle", 0, 3_600_000, &[], "", "sum", "");
        assert!(q.starts_with("SELECT sum(\"value\") FROM"));
    }

    #[test]
    fn range_query_groups_by_tags_present_in_where() {
        let tags = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let q = range_query(
            "m",
            1000,
            2000,
            &tags,
            "foo=1 AND b=2",
            "max",
            "",
        );
        assert!(q.contains("SELECT max(\"value\"),\"host\""), "got {q}");
        assert!(
            q.contains("WHERE foo=1 AND b=2 AND time > 1000ms and time < 2000ms"),
            "got {q}"
        );
        assert!(q.contains("GROUP BY time(10s), \"b\" fill(null)"), "got {q}");
        // tags absent from the where clause stay out of the group-by
        assert!(!q.contains("\"a\""));
        assert!(!q.contains("\"c\""));
    }

    #[test]
    fn usage_query_shape() {
        let q = usage_query("cpu.idle", "max", "", "1h", 1000, 2000, &[]);
        assert_eq!(
            q,
            "SELECT max(\"value\") FROM \"cpu.idle\" WHERE time > 1000ms and time < 2000ms GROUP BY \"host\",time(1h)"
        );

        let q = usage_query(
            "cpu.idle",
            "max",
            "",
            "1h",
            1000,
            2000,
            &["region".to_string()],
        );
        assert!(q.contains("GROUP BY \"host\",\"region\",time(1h)"));
    }
}
