//! Line protocol codec: outbound checksum framing for SD uploads, and inbound
//! parsing of the handful of Marlin/Prusa status lines the fleet manager cares about.

use winnow::{
    ascii::{dec_int, dec_uint, float, space0, space1},
    combinator::{opt, preceded, terminated},
    prelude::*,
    token::take_until,
};

/// Strip a G-code line down to its command body, or `None` if the line carries
/// nothing worth sending (blank, or entirely a comment).
///
/// A leading `;` makes the whole line a comment; otherwise everything from the
/// first `;` onward is discarded.
fn strip_comment(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return None;
    }
    let code = trimmed.split(';').next().unwrap_or("").trim();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

/// Build a checksummed SD-upload line: `N<line> <gcode>*<xor>`.
///
/// Returns `None` for blank/comment-only input; the caller must not advance its
/// line-number counter in that case.
pub fn frame_checksummed(line_number: u32, gcode: &str) -> Option<String> {
    let code = strip_comment(gcode)?;
    let body = format!("N{line_number} {code}");
    let checksum = body.bytes().fold(0u8, |acc, byte| acc ^ byte);
    Some(format!("{body}*{checksum}"))
}

/// Everything a single inbound line might tell us. Every field is independent:
/// a line can set temperatures and nothing else, or set progress and nothing else.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParsedLine {
    pub hotend_temp: Option<f64>,
    pub bed_temp: Option<f64>,
    pub print_time_seconds: Option<u64>,
    pub percent_done_prusa: Option<u8>,
    pub minutes_remaining_prusa: Option<i64>,
    pub current_byte: Option<u64>,
    pub total_byte: Option<u64>,
    pub idle: bool,
}

impl ParsedLine {
    pub fn is_empty(&self) -> bool {
        *self == ParsedLine::default()
    }
}

fn parse_temp_marlin(input: &str) -> Option<(f64, f64)> {
    let mut s = input;
    let parser = (
        opt((space0, "ok", opt(':'), space0)),
        "T:",
        float::<_, f64, _>,
        opt(('/', float::<_, f64, _>)),
        space1,
        "B:",
        float::<_, f64, _>,
    );
    let mut parser = parser;
    parser
        .parse_next(&mut s)
        .ok()
        .map(|(_, _, hotend, _, _, _, bed)| (hotend, bed))
}

/// Looser Prusa-style report: `T:<f> ... B:<f>` with arbitrary text between.
fn parse_temp_prusa(input: &str) -> Option<(f64, f64)> {
    let mut s = input;
    let parser = (
        "T:",
        float::<_, f64, _>,
        take_until(0.., "B:"),
        "B:",
        float::<_, f64, _>,
    );
    let mut parser = parser;
    parser
        .parse_next(&mut s)
        .ok()
        .map(|(_, hotend, _, _, bed)| (hotend, bed))
}

fn parse_opt_unit<'a>(unit: &'static str) -> impl FnMut(&mut &'a str) -> PResult<Option<u64>> {
    move |input: &mut &'a str| {
        opt(terminated(
            preceded(space0, dec_uint::<_, u64, _>),
            (space0, unit),
        ))
        .parse_next(input)
    }
}

/// `echo:Print time: [<h>h] [<m>m] [<s>s]`
fn parse_print_time(input: &str) -> Option<u64> {
    let mut s = input;
    let parser = (
        "echo:Print time:",
        parse_opt_unit("h"),
        parse_opt_unit("m"),
        parse_opt_unit("s"),
    );
    let mut parser = parser;
    let (_, h, m, sec) = parser.parse_next(&mut s).ok()?;
    if h.is_none() && m.is_none() && sec.is_none() {
        return None;
    }
    Some(h.unwrap_or(0) * 3600 + m.unwrap_or(0) * 60 + sec.unwrap_or(0))
}

fn parse_opt_word<'a>(word: &'static str) -> impl FnMut(&mut &'a str) -> PResult<Option<u64>> {
    move |input: &mut &'a str| {
        opt(terminated(
            preceded(space0, dec_uint::<_, u64, _>),
            (space0, word, opt(','), opt("s")),
        ))
        .parse_next(input)
    }
}

/// `echo: <h> hour(s), <m> min(s), <s> sec(s)`
fn parse_print_time_alt(input: &str) -> Option<u64> {
    let mut s = input;
    let parser = (
        "echo:",
        parse_opt_word("hour"),
        parse_opt_word("min"),
        parse_opt_word("sec"),
    );
    let mut parser = parser;
    let (_, h, m, sec) = parser.parse_next(&mut s).ok()?;
    if h.is_none() && m.is_none() && sec.is_none() {
        return None;
    }
    Some(h.unwrap_or(0) * 3600 + m.unwrap_or(0) * 60 + sec.unwrap_or(0))
}

/// `NORMAL MODE: Percent done: <p>; print time remaining in mins: <r>`
fn parse_percent_remaining(input: &str) -> Option<(u8, i64)> {
    let mut s = input;
    let parser = (
        "NORMAL MODE: Percent done: ",
        dec_uint::<_, u32, _>,
        "; print time remaining in mins: ",
        dec_int::<_, i64, _>,
    );
    let mut parser = parser;
    parser
        .parse_next(&mut s)
        .ok()
        .map(|(_, percent, _, mins)| (percent.min(100) as u8, mins))
}

/// `SD printing byte <cur>/<tot>`
fn parse_sd_progress(input: &str) -> Option<(u64, u64)> {
    let mut s = input;
    let parser = (
        "SD printing byte ",
        dec_uint::<_, u64, _>,
        '/',
        dec_uint::<_, u64, _>,
    );
    let mut parser = parser;
    parser
        .parse_next(&mut s)
        .ok()
        .map(|(_, cur, _, tot)| (cur, tot))
}

fn parse_idle(input: &str) -> bool {
    let mut s = input;
    let parser: PResult<&str> = "Not SD printing".parse_next(&mut s);
    parser.is_ok()
}

/// Parse a single trimmed inbound line, extracting whatever telemetry it carries.
/// A line matching nothing returns a default (empty) `ParsedLine`.
pub fn parse_line(line: &str) -> ParsedLine {
    let mut parsed = ParsedLine::default();

    if let Some((hotend, bed)) = parse_temp_marlin(line).or_else(|| parse_temp_prusa(line)) {
        parsed.hotend_temp = Some(hotend);
        parsed.bed_temp = Some(bed);
    }

    if let Some(seconds) = parse_print_time(line).or_else(|| parse_print_time_alt(line)) {
        parsed.print_time_seconds = Some(seconds);
    }

    if let Some((percent, mins)) = parse_percent_remaining(line) {
        parsed.percent_done_prusa = Some(percent);
        if mins > 0 {
            parsed.minutes_remaining_prusa = Some(mins);
        }
    }

    if let Some((cur, tot)) = parse_sd_progress(line) {
        parsed.current_byte = Some(cur);
        parsed.total_byte = Some(tot);
    }

    if parse_idle(line) {
        parsed.idle = true;
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_comment() {
        assert_eq!(strip_comment("G1 X10 Y20 ; move"), Some("G1 X10 Y20"));
    }

    #[test]
    fn whole_line_comment_is_skipped() {
        assert_eq!(strip_comment("; just a comment"), None);
        assert_eq!(strip_comment("   "), None);
        assert_eq!(strip_comment(""), None);
    }

    #[test]
    fn checksum_matches_xor_of_body() {
        let framed = frame_checksummed(7, "G1 X10 Y20 ; move").unwrap();
        let body = "N7 G1 X10 Y20";
        let expected_checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(framed, format!("{body}*{expected_checksum}"));
    }

    #[test]
    fn blank_and_comment_lines_produce_no_frame() {
        assert_eq!(frame_checksummed(1, ""), None);
        assert_eq!(frame_checksummed(1, "   "), None);
        assert_eq!(frame_checksummed(1, "; nothing here"), None);
    }

    #[test]
    fn parses_marlin_temperature_report() {
        let parsed = parse_line("ok T:200.1 /200.0 B:60.0 /60.0");
        assert_eq!(parsed.hotend_temp, Some(200.1));
        assert_eq!(parsed.bed_temp, Some(60.0));
    }

    #[test]
    fn parses_prusa_temperature_report() {
        let parsed = parse_line("T:210.5 E:0 W:? B:61.2");
        assert_eq!(parsed.hotend_temp, Some(210.5));
        assert_eq!(parsed.bed_temp, Some(61.2));
    }

    #[test]
    fn parses_sd_progress_and_sets_only_those_fields() {
        let parsed = parse_line("SD printing byte 1024/4096");
        assert_eq!(parsed.current_byte, Some(1024));
        assert_eq!(parsed.total_byte, Some(4096));
        assert_eq!(parsed.hotend_temp, None);
    }

    #[test]
    fn parses_print_time() {
        let parsed = parse_line("echo:Print time: 1h 2m 3s");
        assert_eq!(parsed.print_time_seconds, Some(3723));
    }

    #[test]
    fn parses_percent_remaining() {
        let parsed = parse_line("NORMAL MODE: Percent done: 42; print time remaining in mins: 17");
        assert_eq!(parsed.percent_done_prusa, Some(42));
        assert_eq!(parsed.minutes_remaining_prusa, Some(17));
    }

    #[test]
    fn negative_remaining_minutes_is_dropped() {
        let parsed = parse_line("NORMAL MODE: Percent done: 99; print time remaining in mins: -1");
        assert_eq!(parsed.percent_done_prusa, Some(99));
        assert_eq!(parsed.minutes_remaining_prusa, None);
    }

    #[test]
    fn unmatched_line_is_empty() {
        let parsed = parse_line("echo:busy: processing");
        assert!(parsed.is_empty());
    }

    #[test]
    fn idle_line_sets_idle_flag() {
        let parsed = parse_line("Not SD printing");
        assert!(parsed.idle);
    }
}
