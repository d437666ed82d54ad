//! Token grammar for ABC music lines
//!
//! Production rules are tried in order of decreasing specificity at the
//! current offset: inline fields, broken rhythm, decorations, grace
//! delimiters, chords, tuplet starts, slurs/ties, notes/rests, chord
//! symbols, barlines. The regex set is compiled once and shared read-only
//! across calls; all mutable state lives in the per-call [`LexContext`].
//!
//! An unmatched single character is skipped with a lexical warning; an
//! unterminated construct (chord, decoration, annotation) is a fatal
//! syntax error for the tune.

use crate::diagnostics::Diagnostics;
use crate::models::{
    Barline, BarKind, Broken, Chord, Dur, Measure, MeasureItem, Note, Pitch, Span, Step,
};
use crate::parse::SyntaxError;
use once_cell::sync::Lazy;
use regex::Regex;

static NOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([_^=]*)([A-Ga-g])([,']*)").unwrap());
static REST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[xzXZ]").unwrap());
static LENGTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d*)(/*)(\d*)").unwrap());
static INLINE_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[([A-Za-z]):([^\]]*)\]").unwrap());
static TUPLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\((\d)(?::(\d*))?(?::(\d*))?").unwrap());
static ANNOTATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^"([^"]*)""#).unwrap());
static DECORATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^!([^!\s]+)!").unwrap());
static BAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(::|:\|\]|:\||\|\]|\[\||\|\||\|:|\|)").unwrap());
static VOLTA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[?(\d+(?:[,\-]\d+)*)").unwrap());

/// Decoration shorthand characters and the `!name!` they stand for
fn shorthand_decoration(c: char) -> Option<&'static str> {
    match c {
        '.' => Some("staccato"),
        '~' => Some("roll"),
        'H' => Some("fermata"),
        'L' => Some("accent"),
        'M' => Some("lowermordent"),
        'O' => Some("coda"),
        'P' => Some("uppermordent"),
        'S' => Some("segno"),
        'T' => Some("trill"),
        'u' => Some("upbow"),
        'v' => Some("downbow"),
        _ => None,
    }
}

/// Mutable lexer state for one voice body
pub struct LexContext {
    /// Current unit note length in quarter notes (tracks inline `L:`)
    pub unit: Dur,
    /// Nominal measure duration in quarter notes (for `Z` rests)
    pub meter_dur: Dur,
    /// Items of the measure under construction
    items: Vec<MeasureItem>,
    /// Completed measures
    pub measures: Vec<Measure>,
    /// Volta label waiting to open on the next measure
    pending_volta: Option<String>,
    /// Decorations waiting for the next note/chord
    pending_decorations: Vec<String>,
    /// Slur openings waiting for the next note/chord
    pending_slur_starts: u8,
    /// End offset of the previous note/rest token on the current line
    prev_note_end: Option<usize>,
    /// True once any bar or note was seen (left-edge `|:` special case)
    started: bool,
}

impl LexContext {
    pub fn new(unit: Dur) -> Self {
        LexContext {
            unit,
            meter_dur: Dur::from_int(4),
            items: Vec::new(),
            measures: Vec::new(),
            pending_volta: None,
            pending_decorations: Vec::new(),
            pending_slur_starts: 0,
            prev_note_end: None,
            started: false,
        }
    }

    /// Close out any trailing unbarred items as a final measure
    pub fn finish(mut self) -> Vec<Measure> {
        if !self.items.is_empty() {
            self.close_measure(Barline::default());
        }
        self.measures
    }

    fn close_measure(&mut self, right: Barline) {
        let measure = Measure {
            items: std::mem::take(&mut self.items),
            right,
            volta: self.pending_volta.take(),
            line_break_after: false,
        };
        self.measures.push(measure);
    }

    fn last_note_or_chord(&mut self) -> Option<&mut MeasureItem> {
        self.items
            .iter_mut()
            .rev()
            .find(|item| matches!(item, MeasureItem::Note(_) | MeasureItem::Chord(_)))
    }

    fn attach_pending(&mut self, note: &mut Note) {
        note.decorations.append(&mut self.pending_decorations);
        note.slur_starts += self.pending_slur_starts;
        self.pending_slur_starts = 0;
    }

    fn mark_line_break(&mut self) {
        if let Some(last) = self.measures.last_mut() {
            if self.items.is_empty() {
                last.line_break_after = true;
            }
        }
        self.prev_note_end = None;
    }
}

/// Lex one music line into the context's measure stream
pub fn lex_line(
    line: &str,
    line_no: usize,
    ctx: &mut LexContext,
    diags: &mut Diagnostics,
) -> Result<(), SyntaxError> {
    let bytes = line.as_bytes();
    let mut pos = 0usize;
    let continued = line.trim_end().ends_with('\\');
    let content_end = if continued {
        line.rfind('\\').unwrap_or(line.len())
    } else {
        line.len()
    };

    while pos < content_end {
        let rest = &line[pos..content_end];
        let c = rest.chars().next().unwrap_or(' ');

        // Whitespace separates beam groups
        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }

        // Backquote continues a beam across whitespace; it has no meaning
        // of its own
        if c == '`' {
            pos += 1;
            continue;
        }

        // Inline field [K:...], [L:...], [M:...], [V:...]
        if let Some(caps) = INLINE_FIELD_RE.captures(rest) {
            let code = caps.get(1).unwrap().as_str().chars().next().unwrap();
            let value = caps.get(2).unwrap().as_str().trim().to_string();
            if code == 'L' {
                if let Some(u) = parse_unit_field(&value) {
                    ctx.unit = u;
                }
            }
            ctx.items.push(MeasureItem::InlineField { code, value });
            pos += caps.get(0).unwrap().len();
            continue;
        }

        // Broken rhythm
        if rest.starts_with(">>") {
            ctx.items.push(MeasureItem::Broken(Broken::RightDouble));
            pos += 2;
            continue;
        }
        if rest.starts_with("<<") {
            ctx.items.push(MeasureItem::Broken(Broken::LeftDouble));
            pos += 2;
            continue;
        }
        if c == '>' {
            ctx.items.push(MeasureItem::Broken(Broken::RightSingle));
            pos += 1;
            continue;
        }
        if c == '<' {
            ctx.items.push(MeasureItem::Broken(Broken::LeftSingle));
            pos += 1;
            continue;
        }

        // !decoration!
        if c == '!' {
            if let Some(caps) = DECORATION_RE.captures(rest) {
                ctx.pending_decorations
                    .push(caps.get(1).unwrap().as_str().to_string());
                pos += caps.get(0).unwrap().len();
                continue;
            }
            return Err(SyntaxError::new(line_no, pos + 1, "unterminated '!' decoration", line));
        }

        // Decoration shorthand (only where a note could follow)
        if let Some(name) = shorthand_decoration(c) {
            ctx.pending_decorations.push(name.to_string());
            pos += 1;
            continue;
        }

        // Grace group delimiters
        if c == '{' {
            ctx.items.push(MeasureItem::GraceOpen);
            pos += 1;
            continue;
        }
        if c == '}' {
            ctx.items.push(MeasureItem::GraceClose);
            pos += 1;
            continue;
        }

        // Barlines (and :| variants) check before chord/volta brackets
        if let Some(caps) = BAR_RE.captures(rest) {
            let bar_text = caps.get(1).unwrap().as_str();
            let mut advance = bar_text.len();
            let kind = match bar_text {
                "|" => BarKind::Single,
                "||" => BarKind::Double,
                "|]" => BarKind::Final,
                "[|" => BarKind::HeavyThin,
                "|:" => BarKind::RepeatStart,
                ":|" | ":|]" => BarKind::RepeatEnd,
                "::" => BarKind::RepeatBoth,
                _ => BarKind::Single,
            };
            // `|:` at the very start of the voice opens a repeat without
            // closing an (empty) measure first
            if kind == BarKind::RepeatStart && !ctx.started && ctx.items.is_empty() {
                ctx.pending_volta = None;
                ctx.started = true;
                ctx.measures.push(Measure {
                    items: Vec::new(),
                    right: Barline { kind: BarKind::RepeatStart, volta: None },
                    volta: None,
                    line_break_after: false,
                });
                pos += advance;
                continue;
            }
            // Volta digits directly after the bar: `|1`, `:|2`, `|[2`
            let after = &rest[bar_text.len()..];
            let mut volta = None;
            if let Some(vc) = VOLTA_RE.captures(after) {
                volta = Some(vc.get(1).unwrap().as_str().to_string());
                advance += vc.get(0).unwrap().len();
            }
            ctx.close_measure(Barline { kind, volta: None });
            ctx.pending_volta = volta;
            ctx.started = true;
            pos += advance;
            continue;
        }

        // `[1`-style volta at a measure start (after a plain bar on the
        // previous line, say)
        if c == '[' {
            if let Some(vc) = VOLTA_RE.captures(rest) {
                if rest.starts_with('[') && vc.get(0).unwrap().as_str().starts_with('[') {
                    ctx.pending_volta = Some(vc.get(1).unwrap().as_str().to_string());
                    pos += vc.get(0).unwrap().len();
                    continue;
                }
            }
        }

        // Chord [CEG]
        if c == '[' {
            let (chord, len) = lex_chord(rest, line, line_no, pos, ctx)?;
            let beam_break = beam_break_before(ctx.prev_note_end, pos);
            ctx.prev_note_end = Some(pos + len);
            let mut chord = chord;
            chord.beam_break = beam_break;
            chord.decorations.append(&mut ctx.pending_decorations);
            chord.slur_starts += ctx.pending_slur_starts;
            ctx.pending_slur_starts = 0;
            ctx.items.push(MeasureItem::Chord(chord));
            ctx.started = true;
            pos += len;
            continue;
        }

        // Tuplet start `(3`, `(3:2`, `(3:2:3`
        if let Some(caps) = TUPLET_RE.captures(rest) {
            let p: u8 = caps.get(1).unwrap().as_str().parse().unwrap_or(3);
            let q: u8 = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_else(|| default_tuplet_q(p));
            let r: u8 = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(p);
            ctx.items.push(MeasureItem::TupletStart { p, q, r });
            pos += caps.get(0).unwrap().len();
            continue;
        }

        // Slur open/close
        if c == '(' {
            ctx.pending_slur_starts += 1;
            pos += 1;
            continue;
        }
        if c == ')' {
            match ctx.last_note_or_chord() {
                Some(MeasureItem::Note(n)) => n.slur_ends += 1,
                Some(MeasureItem::Chord(ch)) => ch.slur_ends += 1,
                _ => diags.warn_at("orphan_slur_end", "')' with no note to close", line_no, pos + 1),
            }
            // A slur close attached to the previous note keeps the beam
            // intact; only real whitespace separates beams
            if ctx.prev_note_end == Some(pos) {
                ctx.prev_note_end = Some(pos + 1);
            }
            pos += 1;
            continue;
        }

        // Tie
        if c == '-' {
            match ctx.last_note_or_chord() {
                Some(MeasureItem::Note(n)) => n.tie = true,
                Some(MeasureItem::Chord(ch)) => ch.tie = true,
                _ => diags.warn_at("orphan_tie", "'-' with no note to tie", line_no, pos + 1),
            }
            if ctx.prev_note_end == Some(pos) {
                ctx.prev_note_end = Some(pos + 1);
            }
            pos += 1;
            continue;
        }

        // Note
        if let Some(caps) = NOTE_RE.captures(rest) {
            let token_len = caps.get(0).unwrap().len();
            let (ratio, len_len) = lex_length(&rest[token_len..]);
            let (pitch, written) = pitch_from_captures(&caps);
            let (dur, rounded) = ctx.unit.checked_mul(ratio);
            if rounded {
                diags.warn_at("duration_rounded", "note length rounded to nearest representable value", line_no, pos + 1);
            }
            let mut note = Note::new(dur, Some(pitch));
            note.accidental = written;
            note.beam_break = beam_break_before(ctx.prev_note_end, pos);
            note.span = span(line_no, pos, pos + token_len + len_len, bytes);
            ctx.attach_pending(&mut note);
            ctx.prev_note_end = Some(pos + token_len + len_len);
            ctx.items.push(MeasureItem::Note(note));
            ctx.started = true;
            pos += token_len + len_len;
            continue;
        }

        // Rest (z/x, Z = multi-measure)
        if REST_RE.is_match(rest) {
            let visible = c == 'z' || c == 'Z';
            let whole_measure = c == 'Z' || c == 'X';
            let (ratio, len_len) = lex_length(&rest[1..]);
            let dur = if whole_measure {
                ctx.meter_dur * ratio
            } else {
                ctx.unit * ratio
            };
            let mut note = Note::new(dur, None);
            note.visible = visible;
            note.beam_break = beam_break_before(ctx.prev_note_end, pos);
            note.span = span(line_no, pos, pos + 1 + len_len, bytes);
            ctx.attach_pending(&mut note);
            ctx.prev_note_end = Some(pos + 1 + len_len);
            ctx.items.push(MeasureItem::Note(note));
            ctx.started = true;
            pos += 1 + len_len;
            continue;
        }

        // "annotation" or chord symbol
        if c == '"' {
            if let Some(caps) = ANNOTATION_RE.captures(rest) {
                let text = caps.get(1).unwrap().as_str();
                let item = match text.chars().next() {
                    Some('^') | Some('_') | Some('<') | Some('>') | Some('@') => {
                        MeasureItem::Annotation(text[1..].to_string())
                    }
                    _ => MeasureItem::ChordSymbol(text.to_string()),
                };
                ctx.items.push(item);
                pos += caps.get(0).unwrap().len();
                continue;
            }
            return Err(SyntaxError::new(line_no, pos + 1, "unterminated '\"' annotation", line));
        }

        // Redundant repeat colon (e.g. `:: :` leftovers) or other single
        // stray character: recoverable, skip with a warning
        diags.warn_at(
            "lexical_skip",
            format!("skipped unexpected character '{}'", c),
            line_no,
            pos + 1,
        );
        pos += c.len_utf8();
    }

    if !continued {
        ctx.mark_line_break();
    }
    Ok(())
}

/// A gap between the previous note's end and this token's start means a
/// beam break. Pure function of the two spans (no hidden cursor).
fn beam_break_before(prev_end: Option<usize>, start: usize) -> bool {
    match prev_end {
        Some(end) => start > end,
        None => true,
    }
}

fn span(line: usize, start: usize, end: usize, _line_bytes: &[u8]) -> Span {
    Span { line, col: start + 1, offset: start, end }
}

/// Returns the pitch plus the written accidental, `None` when the note
/// carried no accidental marks (it then inherits from key and measure)
fn pitch_from_captures(caps: &regex::Captures<'_>) -> (Pitch, Option<i8>) {
    let accidentals = caps.get(1).map_or("", |m| m.as_str());
    let letter = caps.get(2).unwrap().as_str().chars().next().unwrap();
    let octave_marks = caps.get(3).map_or("", |m| m.as_str());

    let alter: i8 = accidentals
        .chars()
        .map(|a| match a {
            '^' => 1i8,
            '_' => -1i8,
            _ => 0,
        })
        .sum();
    let written = if accidentals.is_empty() { None } else { Some(alter) };
    // Lowercase letters start an octave higher; `,` drops, `'` raises
    let mut octave: i8 = if letter.is_ascii_lowercase() { 5 } else { 4 };
    for m in octave_marks.chars() {
        match m {
            ',' => octave -= 1,
            '\'' => octave += 1,
            _ => {}
        }
    }
    (Pitch::new(Step::from_char(letter).unwrap_or(Step::C), alter, octave), written)
}

/// Parse a length suffix (`2`, `3/2`, `/`, `//`, `/4`) into a unit ratio.
/// Returns the ratio and the number of bytes consumed.
fn lex_length(rest: &str) -> (Dur, usize) {
    let caps = LENGTH_RE.captures(rest).unwrap();
    let num_text = caps.get(1).unwrap().as_str();
    let slashes = caps.get(2).unwrap().as_str();
    let den_text = caps.get(3).unwrap().as_str();
    let consumed = caps.get(0).unwrap().len();

    let numer: i32 = if num_text.is_empty() { 1 } else { num_text.parse().unwrap_or(1) };
    let denom: i32 = if !den_text.is_empty() {
        den_text.parse().unwrap_or(1)
    } else if !slashes.is_empty() {
        1 << slashes.len().min(8)
    } else {
        1
    };
    (Dur::new(numer, denom.max(1)), consumed)
}

/// Parse a bare note name like `^g'` outside a music line (used by
/// `%%percmap` and drum mappings)
pub fn parse_note_name(text: &str) -> Option<Pitch> {
    let caps = NOTE_RE.captures(text.trim())?;
    Some(pitch_from_captures(&caps).0)
}

/// Parse an `L:` value like `1/8` into quarter notes
pub fn parse_unit_field(value: &str) -> Option<Dur> {
    let (n, d) = value.trim().split_once('/')?;
    let n: i32 = n.trim().parse().ok()?;
    let d: i32 = d.trim().parse().ok()?;
    if n <= 0 || d <= 0 {
        return None;
    }
    // n/d of a whole note = n*4/d quarters
    Some(Dur::new(n * 4, d))
}

/// ABC default q for `(p` with no explicit q: 3,6,9 → 2; 2,4,8 → 3; 5,7 →
/// 2 in simple meters (n in the time of 2)
pub(crate) fn default_tuplet_q(p: u8) -> u8 {
    match p {
        2 | 4 | 8 => 3,
        3 | 6 => 2,
        _ => 2,
    }
}

/// Lex a chord group starting at `[`. Returns the chord and bytes consumed.
fn lex_chord(
    rest: &str,
    line: &str,
    line_no: usize,
    base: usize,
    ctx: &LexContext,
) -> Result<(Chord, usize), SyntaxError> {
    debug_assert!(rest.starts_with('['));
    let mut pos = 1usize;
    let mut notes = Vec::new();

    loop {
        let inner = &rest[pos..];
        if inner.is_empty() {
            return Err(SyntaxError::new(line_no, base + pos + 1, "unterminated '[' chord", line));
        }
        if inner.starts_with(']') {
            pos += 1;
            break;
        }
        if inner.starts_with(char::is_whitespace) {
            pos += 1;
            continue;
        }
        if let Some(caps) = NOTE_RE.captures(inner) {
            let token_len = caps.get(0).unwrap().len();
            let (ratio, len_len) = lex_length(&inner[token_len..]);
            let (pitch, written) = pitch_from_captures(&caps);
            // Member duration stays a ratio here; the chord multiplier is
            // applied during flattening
            let mut note = Note::new(ctx.unit * ratio, Some(pitch));
            note.accidental = written;
            note.span = span(line_no, base + pos, base + pos + token_len + len_len, line.as_bytes());
            // Per-member tie inside the bracket
            if inner[token_len + len_len..].starts_with('-') {
                note.tie = true;
                pos += 1;
            }
            notes.push(note);
            pos += token_len + len_len;
            continue;
        }
        return Err(SyntaxError::new(
            line_no,
            base + pos + 1,
            "unexpected character inside chord",
            line,
        ));
    }

    if notes.is_empty() {
        return Err(SyntaxError::new(line_no, base + 1, "empty chord", line));
    }

    // Multiplier and tie after the closing bracket
    let (mult, len_len) = lex_length(&rest[pos..]);
    pos += len_len;
    let mut tie = false;
    if rest[pos..].starts_with('-') {
        tie = true;
        pos += 1;
    }

    Ok((
        Chord {
            notes,
            dur_mult: mult,
            tie,
            slur_starts: 0,
            slur_ends: 0,
            decorations: Vec::new(),
            beam_break: false,
            span: span(line_no, base, base + pos, line.as_bytes()),
        },
        pos,
    ))
}
