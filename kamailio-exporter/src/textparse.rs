//! Parser for the Prometheus text exposition format.
//!
//! Decodes a scraped payload into the same [`proto::MetricFamily`] values the
//! local registry gathers, so parsed families merge into a scrape without a
//! conversion layer. The grammar is the plain text format: `# HELP` and
//! `# TYPE` comment lines, other `#` lines ignored, and sample lines of the
//! form `name{label="value",...} value [timestamp]`.
//!
//! Histogram and summary families are reassembled from their
//! `_bucket`/`_sum`/`_count` and quantile sample lines, grouped by label set,
//! so re-encoding the result produces structurally valid output. Families
//! that declare a type or help text but carry no samples are dropped.
//!
//! Parsing is a pure function: a malformed payload yields a [`ParseError`]
//! carrying the offending line number and nothing else is affected.

use std::collections::HashMap;

use prometheus::proto::{self, MetricType};
use thiserror::Error;

/// Errors raised when exposition text cannot be decoded.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("response body is not valid utf-8")]
    Encoding,
}

fn syntax(line: usize, message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        line,
        message: message.into(),
    }
}

/// How a sample line contributes to its metric family.
enum SampleKind {
    /// Plain counter, gauge or untyped value.
    Scalar,
    /// Quantile line of a summary family; requires a `quantile` label.
    Quantile,
    /// Bucket line of a histogram family; requires a `le` label.
    Bucket,
    /// `_sum` line of a histogram or summary family.
    Sum,
    /// `_count` line of a histogram or summary family.
    Count,
}

struct FamilyBuilder {
    family: proto::MetricFamily,
    typed: bool,
    has_help: bool,
    /// Metric index by identity label set, used to fold histogram and
    /// summary sample lines into one metric per series.
    by_labels: HashMap<Vec<(String, String)>, usize>,
}

impl FamilyBuilder {
    fn new(name: &str) -> Self {
        let mut family = proto::MetricFamily::default();
        family.set_name(name.to_string());
        family.set_field_type(MetricType::UNTYPED);
        Self {
            family,
            typed: false,
            has_help: false,
            by_labels: HashMap::new(),
        }
    }
}

/// Decode a text exposition payload into metric families.
///
/// Families keep their first-seen order; metrics keep line order within a
/// family.
pub fn parse_text(input: &[u8]) -> Result<Vec<proto::MetricFamily>, ParseError> {
    let text = std::str::from_utf8(input).map_err(|_| ParseError::Encoding)?;

    let mut families: Vec<FamilyBuilder> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            parse_comment(rest.trim_start(), lineno, &mut families, &mut index)?;
        } else {
            parse_sample(line, lineno, &mut families, &mut index)?;
        }
    }

    // Bucket lines may arrive in any order; the exposition contract is
    // ascending upper bounds.
    for builder in &mut families {
        if builder.family.get_field_type() == MetricType::HISTOGRAM {
            for metric in builder.family.mut_metric().iter_mut() {
                metric.mut_histogram().mut_bucket().sort_by(|a, b| {
                    a.get_upper_bound()
                        .partial_cmp(&b.get_upper_bound())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }
    }

    Ok(families
        .into_iter()
        .map(|builder| builder.family)
        .filter(|family| !family.get_metric().is_empty())
        .collect())
}

fn family_index(
    name: &str,
    families: &mut Vec<FamilyBuilder>,
    index: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&i) = index.get(name) {
        return i;
    }
    families.push(FamilyBuilder::new(name));
    index.insert(name.to_string(), families.len() - 1);
    families.len() - 1
}

fn parse_comment(
    rest: &str,
    lineno: usize,
    families: &mut Vec<FamilyBuilder>,
    index: &mut HashMap<String, usize>,
) -> Result<(), ParseError> {
    let mut tokens = rest.splitn(2, char::is_whitespace);
    match tokens.next().unwrap_or("") {
        "HELP" => {
            let rest = tokens
                .next()
                .ok_or_else(|| syntax(lineno, "missing metric name in HELP line"))?
                .trim_start();
            let mut tokens = rest.splitn(2, char::is_whitespace);
            let name = tokens.next().unwrap_or("");
            if !is_valid_metric_name(name) {
                return Err(syntax(lineno, format!("invalid metric name {name:?}")));
            }
            let help = tokens.next().map(str::trim_start).unwrap_or("");

            let i = family_index(name, families, index);
            let builder = &mut families[i];
            if builder.has_help {
                return Err(syntax(
                    lineno,
                    format!("second HELP line for metric family {name:?}"),
                ));
            }
            builder.family.set_help(unescape_help(help));
            builder.has_help = true;
        }
        "TYPE" => {
            let rest = tokens
                .next()
                .ok_or_else(|| syntax(lineno, "missing metric name in TYPE line"))?
                .trim_start();
            let mut tokens = rest.split_whitespace();
            let name = tokens.next().unwrap_or("");
            if !is_valid_metric_name(name) {
                return Err(syntax(lineno, format!("invalid metric name {name:?}")));
            }
            let kind = match tokens.next() {
                Some("counter") => MetricType::COUNTER,
                Some("gauge") => MetricType::GAUGE,
                Some("histogram") => MetricType::HISTOGRAM,
                Some("summary") => MetricType::SUMMARY,
                Some("untyped") => MetricType::UNTYPED,
                Some(other) => {
                    return Err(syntax(lineno, format!("unknown metric type {other:?}")));
                }
                None => return Err(syntax(lineno, "missing metric type in TYPE line")),
            };
            if tokens.next().is_some() {
                return Err(syntax(lineno, "unexpected trailing tokens in TYPE line"));
            }

            let i = family_index(name, families, index);
            let builder = &mut families[i];
            if builder.typed {
                return Err(syntax(
                    lineno,
                    format!("second TYPE line for metric family {name:?}"),
                ));
            }
            if !builder.family.get_metric().is_empty() {
                return Err(syntax(
                    lineno,
                    format!("TYPE line for {name:?} must appear before its samples"),
                ));
            }
            builder.family.set_field_type(kind);
            builder.typed = true;
        }
        // Any other comment is ignored.
        _ => {}
    }
    Ok(())
}

fn parse_sample(
    line: &str,
    lineno: usize,
    families: &mut Vec<FamilyBuilder>,
    index: &mut HashMap<String, usize>,
) -> Result<(), ParseError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_valid_metric_name(name) {
        return Err(syntax(lineno, format!("invalid metric name {name:?}")));
    }
    let mut rest = &line[name_end..];

    let mut labels: Vec<(String, String)> = Vec::new();
    if let Some(body) = rest.strip_prefix('{') {
        let consumed = parse_labels(body, lineno, &mut labels)?;
        rest = &body[consumed..];
    }

    let mut tokens = rest.split_whitespace();
    let value_token = tokens
        .next()
        .ok_or_else(|| syntax(lineno, "missing sample value"))?;
    let value: f64 = value_token
        .parse()
        .map_err(|_| syntax(lineno, format!("invalid sample value {value_token:?}")))?;
    let timestamp = match tokens.next() {
        Some(token) => Some(
            token
                .parse::<i64>()
                .map_err(|_| syntax(lineno, format!("invalid timestamp {token:?}")))?,
        ),
        None => None,
    };
    if tokens.next().is_some() {
        return Err(syntax(lineno, "unexpected trailing tokens after sample"));
    }

    let (fi, kind) = resolve_family(name, lineno, families, index)?;
    apply_sample(&mut families[fi], kind, labels, value, timestamp, lineno)
}

/// Find the family a sample belongs to.
///
/// An exact family name wins. Otherwise `_bucket`/`_sum`/`_count` suffixes
/// fold into a previously declared histogram or summary family of the base
/// name; anything else starts a new untyped family.
fn resolve_family(
    name: &str,
    lineno: usize,
    families: &mut Vec<FamilyBuilder>,
    index: &mut HashMap<String, usize>,
) -> Result<(usize, SampleKind), ParseError> {
    if let Some(&i) = index.get(name) {
        return match families[i].family.get_field_type() {
            MetricType::SUMMARY => Ok((i, SampleKind::Quantile)),
            MetricType::HISTOGRAM => Err(syntax(
                lineno,
                format!("histogram family {name:?} requires _bucket, _sum or _count samples"),
            )),
            _ => Ok((i, SampleKind::Scalar)),
        };
    }

    if let Some(base) = name.strip_suffix("_bucket")
        && let Some(&i) = index.get(base)
        && families[i].family.get_field_type() == MetricType::HISTOGRAM
    {
        return Ok((i, SampleKind::Bucket));
    }
    if let Some(base) = name.strip_suffix("_sum")
        && let Some(&i) = index.get(base)
        && matches!(
            families[i].family.get_field_type(),
            MetricType::HISTOGRAM | MetricType::SUMMARY
        )
    {
        return Ok((i, SampleKind::Sum));
    }
    if let Some(base) = name.strip_suffix("_count")
        && let Some(&i) = index.get(base)
        && matches!(
            families[i].family.get_field_type(),
            MetricType::HISTOGRAM | MetricType::SUMMARY
        )
    {
        return Ok((i, SampleKind::Count));
    }

    Ok((family_index(name, families, index), SampleKind::Scalar))
}

fn apply_sample(
    builder: &mut FamilyBuilder,
    kind: SampleKind,
    mut labels: Vec<(String, String)>,
    value: f64,
    timestamp: Option<i64>,
    lineno: usize,
) -> Result<(), ParseError> {
    match kind {
        SampleKind::Scalar => {
            let mut metric = proto::Metric::default();
            set_labels(&mut metric, &labels);
            match builder.family.get_field_type() {
                MetricType::COUNTER => {
                    let mut counter = proto::Counter::default();
                    counter.set_value(value);
                    metric.set_counter(counter);
                }
                MetricType::GAUGE => {
                    let mut gauge = proto::Gauge::default();
                    gauge.set_value(value);
                    metric.set_gauge(gauge);
                }
                _ => {
                    let mut untyped = proto::Untyped::default();
                    untyped.set_value(value);
                    metric.set_untyped(untyped);
                }
            }
            if let Some(ts) = timestamp {
                metric.set_timestamp_ms(ts);
            }
            builder.family.mut_metric().push(metric);
        }
        SampleKind::Quantile => {
            let quantile_label = take_label(&mut labels, "quantile").ok_or_else(|| {
                syntax(lineno, "summary sample is missing the quantile label")
            })?;
            let quantile: f64 = quantile_label
                .parse()
                .map_err(|_| syntax(lineno, format!("invalid quantile {quantile_label:?}")))?;

            let mi = metric_for_labels(builder, labels);
            let metric = &mut builder.family.mut_metric()[mi];
            let mut entry = proto::Quantile::default();
            entry.set_quantile(quantile);
            entry.set_value(value);
            metric.mut_summary().mut_quantile().push(entry);
            if let Some(ts) = timestamp {
                metric.set_timestamp_ms(ts);
            }
        }
        SampleKind::Bucket => {
            let le_label = take_label(&mut labels, "le")
                .ok_or_else(|| syntax(lineno, "histogram bucket is missing the le label"))?;
            let upper_bound: f64 = le_label
                .parse()
                .map_err(|_| syntax(lineno, format!("invalid bucket bound {le_label:?}")))?;

            let mi = metric_for_labels(builder, labels);
            let metric = &mut builder.family.mut_metric()[mi];
            let mut bucket = proto::Bucket::default();
            bucket.set_upper_bound(upper_bound);
            bucket.set_cumulative_count(value as u64);
            metric.mut_histogram().mut_bucket().push(bucket);
            if let Some(ts) = timestamp {
                metric.set_timestamp_ms(ts);
            }
        }
        SampleKind::Sum => {
            let kind = builder.family.get_field_type();
            let mi = metric_for_labels(builder, labels);
            let metric = &mut builder.family.mut_metric()[mi];
            match kind {
                MetricType::SUMMARY => metric.mut_summary().set_sample_sum(value),
                _ => metric.mut_histogram().set_sample_sum(value),
            }
            if let Some(ts) = timestamp {
                metric.set_timestamp_ms(ts);
            }
        }
        SampleKind::Count => {
            let kind = builder.family.get_field_type();
            let mi = metric_for_labels(builder, labels);
            let metric = &mut builder.family.mut_metric()[mi];
            match kind {
                MetricType::SUMMARY => metric.mut_summary().set_sample_count(value as u64),
                _ => metric.mut_histogram().set_sample_count(value as u64),
            }
            if let Some(ts) = timestamp {
                metric.set_timestamp_ms(ts);
            }
        }
    }
    Ok(())
}

/// Get or create the metric holding the series identified by `labels`
/// (already stripped of `le`/`quantile`). Returns its index.
fn metric_for_labels(builder: &mut FamilyBuilder, labels: Vec<(String, String)>) -> usize {
    let mut key = labels.clone();
    key.sort();
    if let Some(&mi) = builder.by_labels.get(&key) {
        return mi;
    }
    let mut metric = proto::Metric::default();
    set_labels(&mut metric, &labels);
    builder.family.mut_metric().push(metric);
    let mi = builder.family.get_metric().len() - 1;
    builder.by_labels.insert(key, mi);
    mi
}

fn set_labels(metric: &mut proto::Metric, labels: &[(String, String)]) {
    for (name, value) in labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
}

/// Take the value of `name` out of `labels`, if present.
fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let pos = labels.iter().position(|(n, _)| n == name)?;
    Some(labels.remove(pos).1)
}

/// Parse the label pairs following an opening `{`. Pushes the pairs in
/// appearance order and returns the number of bytes consumed, including the
/// closing `}`. A trailing comma before `}` is accepted.
fn parse_labels(
    s: &str,
    lineno: usize,
    labels: &mut Vec<(String, String)>,
) -> Result<usize, ParseError> {
    let mut chars = s.char_indices().peekable();
    loop {
        match chars.peek() {
            Some(&(i, '}')) => return Ok(i + 1),
            None => return Err(syntax(lineno, "unterminated label set")),
            _ => {}
        }

        let start = chars.peek().map(|&(i, _)| i).unwrap_or(0);
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        let name = &s[start..end];
        if !is_valid_label_name(name) {
            return Err(syntax(lineno, format!("invalid label name {name:?}")));
        }

        match chars.next() {
            Some((_, '=')) => {}
            _ => return Err(syntax(lineno, "expected '=' after label name")),
        }
        match chars.next() {
            Some((_, '"')) => {}
            _ => return Err(syntax(lineno, "expected '\"' to open label value")),
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some((_, '\\')) => match chars.next() {
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, other)) => {
                        return Err(syntax(lineno, format!("invalid escape sequence \\{other}")));
                    }
                    None => return Err(syntax(lineno, "unterminated label value")),
                },
                Some((_, '"')) => break,
                Some((_, c)) => value.push(c),
                None => return Err(syntax(lineno, "unterminated label value")),
            }
        }
        labels.push((name.to_string(), value));

        match chars.next() {
            Some((i, '}')) => return Ok(i + 1),
            Some((_, ',')) => {}
            _ => return Err(syntax(lineno, "expected ',' or '}' after label value")),
        }
    }
}

/// Metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Help text escapes `\` and newline; unknown escapes pass through.
fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
