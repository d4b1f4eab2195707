//! Opening-hours normalization.
//!
//! Free text in whatever shape the source or the places provider produced is
//! folded into one grammar:
//!
//! ```text
//! Sun-Thu 11:00 AM – 10:00 PM, Fri 11:00 AM – 3:00 PM, Sat Closed
//! ```
//!
//! or the single literal `24/7`. Parsing is a chain of small recognizers
//! (decoration stripping, whole-text literals, then per-segment day and body
//! parsing). If any segment is left unexplained the whole input is rejected,
//! so callers only ever see a fully valid string or `None`.

use std::sync::LazyLock;

use chrono::Weekday;
use regex::Regex;

pub const ALWAYS_OPEN: &str = "24/7";
pub const CLOSED: &str = "Closed";
const RANGE_DASH: &str = "\u{2013}";

static LABELS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:hours of operation|opening hours|business hours|store hours|hours)\s*:")
        .expect("valid label regex")
});

static ALWAYS_OPEN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:open\s*)?(?:24\s*/\s*7|24\s*-\s*7|24\s*hours?(?:\s*a\s*day)?(?:\s*,?\s*7\s*days(?:\s*a\s*week)?)?|always\s*open)$",
    )
    .expect("valid always-open regex")
});

static ALL_DAY_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:open\s*)?(?:24\s*hours?|24\s*hrs|24\s*/\s*7)$").expect("valid all-day regex")
});

static TIME_WORD_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+to\s+").expect("valid separator regex"));

static TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<noon>(?:12\s*)?noon)|(?P<midnight>(?:12\s*)?midnight)|(?P<h>\d{1,2})(?::(?P<m>\d{2}))?(?:\s*(?P<mer>[ap])\.?\s*(?:m\.?)?)?)$",
    )
    .expect("valid time regex")
});

/// Normalizes free-text hours. Never panics; `None` means "could not be parsed in full".
pub fn normalize_hours(text: &str) -> Option<String> {
    let cleaned = strip_decoration(text);
    let trimmed = cleaned.trim_matches(|c: char| c == ',' || c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return None;
    }
    if ALWAYS_OPEN_TEXT.is_match(trimmed) {
        return Some(ALWAYS_OPEN.to_string());
    }
    let segments = parse_segments(trimmed)?;
    render(segments)
}

/// True when `value` is already in canonical form.
pub fn is_canonical_hours(value: &str) -> bool {
    normalize_hours(value).as_deref() == Some(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DaySpan {
    start: Weekday,
    end: Weekday,
}

impl DaySpan {
    const WEEK: Self = Self {
        start: Weekday::Sun,
        end: Weekday::Sat,
    };

    fn single(day: Weekday) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    fn days(self) -> impl Iterator<Item = Weekday> {
        let len = self.len();
        std::iter::successors(Some(self.start), |d| Some(d.succ())).take(len)
    }

    fn len(self) -> usize {
        let start = self.start.num_days_from_sunday();
        let end = self.end.num_days_from_sunday();
        ((end + 7 - start) % 7 + 1) as usize
    }

    fn render(self) -> String {
        if self.start == self.end {
            day_abbrev(self.start).to_string()
        } else {
            format!("{}-{}", day_abbrev(self.start), day_abbrev(self.end))
        }
    }
}

/// Minutes after midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Clock(u16);

impl Clock {
    fn render(self) -> String {
        let hour = self.0 / 60;
        let minute = self.0 % 60;
        let (hour12, meridiem) = match hour {
            0 => (12, "AM"),
            1..=11 => (hour, "AM"),
            12 => (12, "PM"),
            _ => (hour - 12, "PM"),
        };
        format!("{hour12}:{minute:02} {meridiem}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Closed,
    Open { start: Clock, end: Clock },
    AllDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    span: DaySpan,
    body: Body,
}

fn day_abbrev(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "Sun",
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
    }
}

fn day_from_word(word: &str) -> Option<Weekday> {
    match word.trim_end_matches('.') {
        "sun" | "sunday" | "sundays" => Some(Weekday::Sun),
        "mon" | "monday" | "mondays" => Some(Weekday::Mon),
        "tue" | "tues" | "tuesday" | "tuesdays" => Some(Weekday::Tue),
        "wed" | "weds" | "wednesday" | "wednesdays" => Some(Weekday::Wed),
        "thu" | "thur" | "thurs" | "thursday" | "thursdays" => Some(Weekday::Thu),
        "fri" | "friday" | "fridays" => Some(Weekday::Fri),
        "sat" | "saturday" | "saturdays" | "shabbos" | "shabbat" => Some(Weekday::Sat),
        _ => None,
    }
}

/// Lowercases, folds dash and space variants, turns bullets and line breaks into
/// segment separators, and drops everything else outside the ASCII vocabulary.
fn strip_decoration(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{00a0}' | '\u{2007}' | '\u{2009}' | '\u{202f}' | '\t' => ' ',
            '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
            '\u{2022}' | '\u{00b7}' | '\u{25aa}' | '\u{25cf}' | '\u{25e6}' | '|' | ';' | '\n'
            | '\r' => ',',
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            ' ' | ':' | '.' | '-' | ',' | '/' | '&' => c,
            _ => ' ',
        })
        .collect();
    LABELS.replace_all(&folded, ",").into_owned()
}

struct Piece<'a> {
    days: Vec<DaySpan>,
    body: &'a str,
}

fn parse_segments(text: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut pending: Vec<DaySpan> = Vec::new();
    let mut last_days: Option<Vec<DaySpan>> = None;

    for raw in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let piece = split_days(raw);
        if piece.body.is_empty() {
            // "Mon, Wed, Fri 9am-5pm": the days wait for the next body.
            if piece.days.is_empty() {
                return None;
            }
            pending.extend(piece.days);
            continue;
        }

        let body = parse_body(piece.body)?;
        let mut days = std::mem::take(&mut pending);
        days.extend(piece.days);
        if days.is_empty() {
            days = last_days.clone()?;
        }
        segments.extend(days.iter().map(|&span| Segment { span, body }));
        last_days = Some(days);
    }

    if !pending.is_empty() || segments.is_empty() {
        return None;
    }
    Some(segments)
}

fn skip_ws(s: &str, mut at: usize) -> usize {
    let bytes = s.as_bytes();
    while at < bytes.len() && bytes[at] == b' ' {
        at += 1;
    }
    at
}

fn read_word(s: &str, at: usize) -> (&str, usize) {
    let bytes = s.as_bytes();
    let mut end = at;
    while end < bytes.len() && (bytes[end].is_ascii_lowercase() || bytes[end] == b'.') {
        end += 1;
    }
    (&s[at..end], end)
}

fn peek_day(s: &str, at: usize) -> Option<(Weekday, usize)> {
    let at = skip_ws(s, at);
    let (word, end) = read_word(s, at);
    day_from_word(word).map(|day| (day, end))
}

/// `-Thu`, ` to Thu`, ` through Thu`; only consumed when a day follows.
fn read_range_tail(s: &str, at: usize) -> Option<(Weekday, usize)> {
    let at = skip_ws(s, at);
    let after_separator = if s[at..].starts_with('-') {
        at + 1
    } else {
        let (word, end) = read_word(s, at);
        match word {
            "to" | "through" | "thru" => end,
            _ => return None,
        }
    };
    peek_day(s, after_separator)
}

/// `& Sun`, `/ Sun`, `and Sun`; only consumed when a day follows.
fn read_list_separator(s: &str, at: usize) -> Option<usize> {
    let at = skip_ws(s, at);
    let after_separator = if s[at..].starts_with('&') || s[at..].starts_with('/') {
        at + 1
    } else {
        let (word, end) = read_word(s, at);
        if word != "and" {
            return None;
        }
        end
    };
    peek_day(s, after_separator).map(|_| after_separator)
}

fn split_days(piece: &str) -> Piece<'_> {
    let mut days = Vec::new();
    let mut at = skip_ws(piece, 0);

    let (first, first_end) = read_word(piece, at);
    if matches!(first.trim_end_matches('.'), "daily" | "everyday") {
        days.push(DaySpan::WEEK);
        at = first_end;
    } else {
        while let Some((start, end)) = peek_day(piece, at) {
            let mut span = DaySpan::single(start);
            at = end;
            if let Some((last, range_end)) = read_range_tail(piece, at) {
                span.end = last;
                at = range_end;
            }
            days.push(span);
            match read_list_separator(piece, at) {
                Some(next) => at = next,
                None => break,
            }
        }
    }

    let mut rest = skip_ws(piece, at);
    if !days.is_empty() && piece[rest..].starts_with(':') {
        rest += 1;
    }
    Piece {
        days,
        body: piece[rest..].trim(),
    }
}

fn parse_body(text: &str) -> Option<Body> {
    let text = text.trim_end_matches('.').trim();
    if text == "closed" {
        return Some(Body::Closed);
    }
    if ALL_DAY_BODY.is_match(text) {
        return Some(Body::AllDay);
    }
    let text = text.strip_prefix("open ").unwrap_or(text).trim();
    let (start, end) = split_time_range(text)?;
    let (start, end) = resolve_range(parse_time(start)?, parse_time(end)?)?;
    Some(Body::Open { start, end })
}

fn split_time_range(text: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = if text.contains('-') {
        text.split('-').collect()
    } else {
        TIME_WORD_SEPARATOR.split(text).collect()
    };
    match parts.as_slice() {
        [start, end] => Some((start.trim(), end.trim())),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    fn flip(self) -> Self {
        match self {
            Self::Am => Self::Pm,
            Self::Pm => Self::Am,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartialTime {
    hour: u16,
    minute: u16,
    meridiem: Option<Meridiem>,
    // Leading zero, hour 0 or hour >= 13: clearly a 24-hour clock.
    twenty_four_hour: bool,
}

impl PartialTime {
    fn with(self, meridiem: Meridiem) -> Option<Clock> {
        if !(1..=12).contains(&self.hour) || self.minute >= 60 {
            return None;
        }
        let base = self.hour % 12 + if meridiem == Meridiem::Pm { 12 } else { 0 };
        Some(Clock(base * 60 + self.minute))
    }

    fn as_24_hour(self) -> Option<Clock> {
        match (self.hour, self.minute) {
            (24, 0) => Some(Clock(0)),
            (h, m) if h < 24 && m < 60 => Some(Clock(h * 60 + m)),
            _ => None,
        }
    }

    /// Resolves a time lacking AM/PM against its partner in the range.
    fn borrowing(self, meridiem: Meridiem, accept: impl Fn(Clock) -> bool) -> Option<Clock> {
        if self.twenty_four_hour {
            return self.as_24_hour();
        }
        let same = self.with(meridiem)?;
        if accept(same) {
            Some(same)
        } else {
            self.with(meridiem.flip())
        }
    }
}

fn parse_time(token: &str) -> Option<PartialTime> {
    let caps = TIME.captures(token.trim())?;
    if caps.name("noon").is_some() {
        return Some(PartialTime {
            hour: 12,
            minute: 0,
            meridiem: Some(Meridiem::Pm),
            twenty_four_hour: false,
        });
    }
    if caps.name("midnight").is_some() {
        return Some(PartialTime {
            hour: 12,
            minute: 0,
            meridiem: Some(Meridiem::Am),
            twenty_four_hour: false,
        });
    }
    let hour_text = caps.name("h")?.as_str();
    let hour: u16 = hour_text.parse().ok()?;
    let minute: u16 = match caps.name("m") {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let meridiem = caps.name("mer").map(|m| match m.as_str() {
        "a" => Meridiem::Am,
        _ => Meridiem::Pm,
    });
    Some(PartialTime {
        hour,
        minute,
        meridiem,
        twenty_four_hour: hour == 0 || hour >= 13 || (hour_text.len() == 2 && hour_text.starts_with('0')),
    })
}

fn resolve_range(start: PartialTime, end: PartialTime) -> Option<(Clock, Clock)> {
    match (start.meridiem, end.meridiem) {
        (Some(s), Some(e)) => Some((start.with(s)?, end.with(e)?)),
        (None, Some(e)) => {
            let end_clock = end.with(e)?;
            let start_clock = start.borrowing(e, |c| c <= end_clock)?;
            Some((start_clock, end_clock))
        }
        (Some(s), None) => {
            let start_clock = start.with(s)?;
            let end_clock = end.borrowing(s, |c| c >= start_clock)?;
            Some((start_clock, end_clock))
        }
        // "9-5" is ambiguous; only unmistakable 24-hour pairs get through.
        (None, None) if start.twenty_four_hour || end.twenty_four_hour => {
            Some((start.as_24_hour()?, end.as_24_hour()?))
        }
        (None, None) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coverage {
    Closed,
    Open,
    AllDay,
}

fn render(segments: Vec<Segment>) -> Option<String> {
    let mut coverage: [Option<Coverage>; 7] = [None; 7];
    for segment in &segments {
        let kind = match segment.body {
            Body::Closed => Coverage::Closed,
            Body::Open { .. } => Coverage::Open,
            Body::AllDay => Coverage::AllDay,
        };
        for day in segment.span.days() {
            let slot = &mut coverage[day.num_days_from_sunday() as usize];
            match (*slot, kind) {
                (None, _) => *slot = Some(kind),
                // Split shifts: two open ranges on one day.
                (Some(Coverage::Open), Coverage::Open) => {}
                _ => return None,
            }
        }
    }

    if coverage.contains(&Some(Coverage::AllDay)) {
        let all_day_everywhere = coverage.iter().all(|c| *c == Some(Coverage::AllDay));
        return all_day_everywhere.then(|| ALWAYS_OPEN.to_string());
    }

    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Some(last) = merged.last_mut() {
            if last.body == segment.body
                && last.span.end.succ() == segment.span.start
                && last.span.len() + segment.span.len() <= 7
            {
                last.span.end = segment.span.end;
                continue;
            }
        }
        merged.push(segment);
    }

    let rendered = merged
        .into_iter()
        .map(|segment| match segment.body {
            Body::Closed => Some(format!("{} {CLOSED}", segment.span.render())),
            Body::Open { start, end } => Some(format!(
                "{} {} {RANGE_DASH} {}",
                segment.span.render(),
                start.render(),
                end.render()
            )),
            Body::AllDay => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(rendered.join(", "))
}
