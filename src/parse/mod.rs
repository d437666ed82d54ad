//! ABC source parsing: tune structure, header fields, voice bodies
//!
//! `parse_tune` splits one tune into header and per-voice bodies, drives
//! the token grammar over music lines, collects `w:` lyric lines and
//! `%%` directives, and runs post-processing so the result is the
//! canonical AST the MusicXML builder consumes.

pub mod grammar;
pub mod layout;
pub mod postprocess;

pub use postprocess::PostprocessOptions;

use crate::diagnostics::Diagnostics;
use crate::models::{Clef, Dur, Key, PercussionMapping, Tempo, TimeSig, Tune, Voice};
use crate::models::elements::LyricToken;
use crate::models::pitch::percussion_sound_midi;
use grammar::{lex_line, parse_note_name, parse_unit_field, LexContext};
use postprocess::{check_measure_durations, postprocess_measures};
use thiserror::Error;

/// Fatal grammar failure: the tune could not be tokenized
#[derive(Debug, Clone, Error)]
#[error("syntax error at line {line}, column {col}: {message}\n  {context}")]
pub struct SyntaxError {
    pub line: usize,
    pub col: usize,
    pub message: String,
    /// The offending source line
    pub context: String,
}

impl SyntaxError {
    pub fn new(line: usize, col: usize, message: impl Into<String>, context: &str) -> Self {
        SyntaxError {
            line,
            col,
            message: message.into(),
            context: context.trim_end().to_string(),
        }
    }
}

/// Split a file into tunes: each `X:` field starts a new one. Returns
/// (starting line number, tune text) pairs. A file without any `X:` is a
/// single tune.
pub fn split_tunes(src: &str) -> Vec<(usize, String)> {
    let mut tunes: Vec<(usize, String)> = Vec::new();
    let mut current: Option<(usize, String)> = None;
    for (i, line) in src.lines().enumerate() {
        if line.trim_start().starts_with("X:") {
            if let Some(t) = current.take() {
                tunes.push(t);
            }
            current = Some((i + 1, String::new()));
        }
        if let Some((_, buf)) = current.as_mut() {
            buf.push_str(line);
            buf.push('\n');
        }
    }
    if let Some(t) = current.take() {
        tunes.push(t);
    }
    if tunes.is_empty() && !src.trim().is_empty() {
        tunes.push((1, src.to_string()));
    }
    tunes
}

/// Header fields whose values we keep verbatim in `Tune::other_fields`
const PASSTHROUGH_FIELDS: &[char] = &[
    'A', 'B', 'D', 'E', 'F', 'G', 'H', 'I', 'N', 'R', 'S', 'U', 'Y', 'Z',
];

struct VoiceState {
    voice: Voice,
    ctx: LexContext,
    /// Verse index for the next `w:` line after the current music line
    next_verse: u8,
}

/// Parse one tune (header + body) into the canonical AST
pub fn parse_tune(
    src: &str,
    first_line: usize,
    opts: PostprocessOptions,
    diags: &mut Diagnostics,
) -> Result<Tune, SyntaxError> {
    let mut tune = Tune {
        unit: Dur::new(1, 2), // provisional L:1/8 until header says otherwise
        ..Default::default()
    };
    let mut explicit_unit = false;
    let mut in_header = true;

    let mut voices: Vec<VoiceState> = Vec::new();
    let mut voice_order: Vec<String> = Vec::new();
    let mut current: usize = 0;

    let ensure_voice = |voices: &mut Vec<VoiceState>,
                        order: &mut Vec<String>,
                        tune: &Tune,
                        id: &str|
     -> usize {
        if let Some(i) = order.iter().position(|v| v == id) {
            return i;
        }
        let mut ctx = LexContext::new(tune.unit);
        if let Some(m) = &tune.meter {
            ctx.meter_dur = m.measure_dur();
        }
        voices.push(VoiceState { voice: Voice::new(id), ctx, next_verse: 1 });
        order.push(id.to_string());
        order.len() - 1
    };

    for (offset, raw_line) in src.lines().enumerate() {
        let line_no = first_line + offset;
        let line = strip_comment(raw_line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // %% pseudo-field directives appear anywhere
        if let Some(directive) = trimmed.strip_prefix("%%") {
            // Voice-scoped MIDI settings need the live voice list
            let mut midi = directive.split_whitespace();
            if midi.next() == Some("MIDI") {
                match (midi.next(), midi.next().and_then(|n| n.parse::<u8>().ok())) {
                    (Some("program"), n @ Some(_)) if !voices.is_empty() => {
                        voices[current].voice.midi_program = n;
                        continue;
                    }
                    (Some("channel"), n @ Some(_)) if !voices.is_empty() => {
                        voices[current].voice.midi_channel = n;
                        continue;
                    }
                    _ => {}
                }
            }
            apply_directive(&mut tune, directive, diags);
            continue;
        }

        // Field line?
        let field = field_of(trimmed);
        if in_header {
            match field {
                Some(('K', value)) => {
                    apply_key_field(&mut tune, None, value);
                    if !explicit_unit {
                        tune.unit = tune
                            .meter
                            .map(|m| m.default_unit())
                            .unwrap_or(Dur::new(1, 2));
                    }
                    in_header = false;
                    // Header `K:` carries the default clef for voice "1"
                    continue;
                }
                Some((code, value)) => {
                    apply_header_field(&mut tune, code, value, &mut explicit_unit);
                    if code == 'V' {
                        let id = voice_id_of(value);
                        let idx = ensure_voice(&mut voices, &mut voice_order, &tune, &id);
                        apply_voice_modifiers(&mut voices[idx].voice, value);
                        current = idx;
                    }
                    continue;
                }
                None => {
                    // Tune body started without K:, unusual but accepted
                    in_header = false;
                }
            }
        }

        // Body
        match field {
            Some(('V', value)) => {
                let id = voice_id_of(value);
                let idx = ensure_voice(&mut voices, &mut voice_order, &tune, &id);
                apply_voice_modifiers(&mut voices[idx].voice, value);
                current = idx;
                continue;
            }
            Some(('w', value)) => {
                if voices.is_empty() {
                    diags.warn_at("orphan_lyrics", "w: line before any music", line_no, 1);
                    continue;
                }
                let vs = &mut voices[current];
                let verse = vs.next_verse;
                vs.next_verse += 1;
                let tokens = tokenize_lyrics(value);
                vs.voice.lyrics.entry(verse).or_default().extend(tokens);
                continue;
            }
            Some(('K', value)) => {
                // Mid-tune key change: forward to the current voice as an
                // inline field by lexing it
                if voices.is_empty() {
                    apply_key_field(&mut tune, None, value);
                    continue;
                }
                let vs = &mut voices[current];
                lex_line(&format!("[K:{}]", value), line_no, &mut vs.ctx, diags)?;
                continue;
            }
            Some(('L', value)) | Some(('M', value)) | Some(('Q', value)) => {
                let code = field.unwrap().0;
                if voices.is_empty() {
                    apply_header_field(&mut tune, code, value, &mut explicit_unit);
                } else {
                    let vs = &mut voices[current];
                    lex_line(&format!("[{}:{}]", code, value), line_no, &mut vs.ctx, diags)?;
                }
                continue;
            }
            Some((code, _)) if code.is_ascii_uppercase() => {
                // Other information fields inside the body are recorded but
                // do not affect the music
                tune.other_fields.push((code, field.unwrap().1.to_string()));
                continue;
            }
            _ => {}
        }

        // Music line for the current voice
        if voices.is_empty() {
            current = ensure_voice(&mut voices, &mut voice_order, &tune, "1");
        }
        let vs = &mut voices[current];
        vs.next_verse = 1;
        lex_line(&line, line_no, &mut vs.ctx, diags)?;
    }

    // Finish all voices: close trailing measures, post-process, check
    let nominal = tune.meter.map(|m| m.measure_dur());
    for vs in voices {
        let VoiceState { mut voice, ctx, .. } = vs;
        let measures = ctx.finish();
        let measures = postprocess_measures(measures, opts, diags);
        if let Some(n) = nominal {
            check_measure_durations(&measures, n, &voice.id, diags);
        }
        voice.measures = measures;
        tune.voices.push(voice);
    }

    // Header K: clef applies to single-voice tunes that never declared V:
    if tune.voices.len() == 1 && tune.voices[0].clef == Clef::default() {
        if let Some((_, k_value)) = tune.other_fields.iter().find(|(c, _)| *c == 'K') {
            if let Some(clef) = Clef::parse(k_value) {
                tune.voices[0].clef = clef;
            }
        }
    }

    // Layout references must resolve to real voices
    validate_layout(&mut tune, diags);

    Ok(tune)
}

/// Strip a `%` comment (but not `%%` directives) from a line
fn strip_comment(line: &str) -> String {
    if line.trim_start().starts_with("%%") {
        return line.to_string();
    }
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '%' if !in_quotes => return line[..i].to_string(),
            _ => {}
        }
    }
    line.to_string()
}

/// `code:value` at the start of a line
fn field_of(line: &str) -> Option<(char, &str)> {
    let mut chars = line.chars();
    let code = chars.next()?;
    if !code.is_ascii_alphabetic() {
        return None;
    }
    if chars.next()? != ':' {
        return None;
    }
    Some((code, line[2..].trim()))
}

fn apply_header_field(tune: &mut Tune, code: char, value: &str, explicit_unit: &mut bool) {
    match code {
        'X' => tune.number = value.parse().ok(),
        'T' => {
            if tune.title.is_none() {
                tune.title = Some(value.to_string());
            } else {
                tune.other_fields.push(('T', value.to_string()));
            }
        }
        'C' => tune.composer = Some(value.to_string()),
        'O' => tune.origin = Some(value.to_string()),
        'M' => tune.meter = TimeSig::parse(value),
        'L' => {
            if let Some(u) = parse_unit_field(value) {
                tune.unit = u;
                *explicit_unit = true;
            }
        }
        'Q' => tune.tempo = Tempo::parse(value),
        'V' => {} // handled by the caller (declares a voice)
        c if PASSTHROUGH_FIELDS.contains(&c) => {
            tune.other_fields.push((c, value.to_string()));
        }
        _ => tune.other_fields.push((code, value.to_string())),
    }
}

fn apply_key_field(tune: &mut Tune, _voice: Option<&mut Voice>, value: &str) {
    if let Some(k) = Key::parse(value) {
        tune.key = k;
    }
    // Keep the raw value so the single-voice clef lookup can see it
    tune.other_fields.push(('K', value.to_string()));
}

/// First token of a `V:` value is the voice id
fn voice_id_of(value: &str) -> String {
    value
        .split_whitespace()
        .next()
        .unwrap_or("1")
        .to_string()
}

/// Apply `name=`, `sname=`, `clef=`, `octave=` modifiers from a `V:` value
fn apply_voice_modifiers(voice: &mut Voice, value: &str) {
    for (key, val) in key_value_pairs(value) {
        match key.as_str() {
            "name" | "nm" => voice.name = Some(val),
            "sname" | "snm" | "subname" => voice.subname = Some(val),
            "clef" => {
                if let Some(c) = Clef::parse(&format!("clef={}", val)) {
                    voice.clef = c;
                }
            }
            "octave" => voice.octave_shift = val.parse().unwrap_or(0),
            _ => {}
        }
    }
    // Bare clef words without clef= also count
    if let Some(c) = Clef::parse(value) {
        voice.clef = c;
    }
}

/// `key=value` and `key="quoted value"` pairs from a field tail
fn key_value_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = text;
    while let Some(eq) = rest.find('=') {
        let key: String = rest[..eq]
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_string();
        let after = &rest[eq + 1..];
        let (value, consumed) = if let Some(stripped) = after.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (stripped[..end].to_string(), end + 2),
                None => (stripped.to_string(), after.len()),
            }
        } else {
            let end = after
                .find(|c: char| c.is_whitespace())
                .unwrap_or(after.len());
            (after[..end].to_string(), end)
        };
        if !key.is_empty() {
            pairs.push((key, value));
        }
        rest = &after[consumed.min(after.len())..];
    }
    pairs
}

/// Handle a `%%` directive line
fn apply_directive(tune: &mut Tune, directive: &str, diags: &mut Diagnostics) {
    let mut parts = directive.split_whitespace();
    let Some(word) = parts.next() else { return };
    let rest = directive[word.len()..].trim();
    match word {
        "score" | "staves" => {
            tune.layout = layout::parse_score_directive(rest, diags);
        }
        "percmap" => {
            if let Some((written, mapping)) = parse_percmap(rest, diags) {
                tune.percmap.insert(written, mapping);
            }
        }
        "MIDI" => {
            let mut midi = rest.split_whitespace();
            match midi.next() {
                Some("drummap") => {
                    // %%MIDI drummap <note> <midi-number>
                    let note_text = midi.next().unwrap_or("");
                    if let (Some(pitch), Some(num)) =
                        (parse_note_name(note_text), midi.next().and_then(|n| n.parse::<i32>().ok()))
                    {
                        tune.percmap.insert(
                            note_text.to_string(),
                            PercussionMapping {
                                display_step: pitch.step,
                                display_octave: pitch.octave,
                                midi: num - 1,
                                notehead: None,
                            },
                        );
                    }
                }
                _ => diags.info("directive_skip", format!("ignored directive %%MIDI {}", rest)),
            }
        }
        _ => diags.info("directive_skip", format!("ignored directive %%{}", directive)),
    }
}

/// `%%percmap <note> [<staff-step>] [<midi-note-or-sound-name>] [<notehead>]`
fn parse_percmap(rest: &str, diags: &mut Diagnostics) -> Option<(String, PercussionMapping)> {
    let mut parts = rest.split_whitespace().peekable();
    let written = parts.next()?.to_string();
    let written_pitch = parse_note_name(&written)?;

    let mut display_step = written_pitch.step;
    let mut display_octave = written_pitch.octave;
    let mut midi = written_pitch.midi() - 1;
    let mut notehead = None;

    // The staff-step slot is optional: only a token that reads as a note
    // name fills it, everything else falls through to the MIDI slot
    if let Some(p) = parts.peek().copied().and_then(parse_note_name) {
        display_step = p.step;
        display_octave = p.octave;
        parts.next();
    }
    if let Some(tok) = parts.next() {
        if let Ok(n) = tok.parse::<i32>() {
            midi = n - 1;
        } else if let Some(n) = percussion_sound_midi(tok) {
            midi = n - 1;
        } else {
            diags.warn(
                "percmap_sound",
                format!("unknown percussion sound '{}'; keeping written pitch", tok),
            );
        }
        notehead = parts.next().map(|s| s.to_string());
    }

    Some((
        written,
        PercussionMapping {
            display_step,
            display_octave,
            midi,
            notehead,
        },
    ))
}

/// Tokenize a `w:` lyric line
fn tokenize_lyrics(value: &str) -> Vec<LyricToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();

    let flush = |tokens: &mut Vec<LyricToken>, current: &mut String, hyphen: bool| {
        if !current.is_empty() {
            // `~` joins words under one note
            let text = current.replace('~', " ");
            tokens.push(LyricToken::Syllable { text, hyphen });
            current.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '-' => flush(&mut tokens, &mut current, true),
            '_' => {
                flush(&mut tokens, &mut current, false);
                tokens.push(LyricToken::Extend);
            }
            '*' => {
                flush(&mut tokens, &mut current, false);
                tokens.push(LyricToken::Skip);
            }
            '|' => {
                flush(&mut tokens, &mut current, false);
                tokens.push(LyricToken::BarSync);
            }
            '\\' => {
                // Escaped character keeps its literal value
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut current, false),
            _ => current.push(c),
        }
    }
    flush(&mut tokens, &mut current, false);
    tokens
}

/// Drop layout references to undeclared voices; append unmentioned voices
fn validate_layout(tune: &mut Tune, diags: &mut Diagnostics) {
    use crate::models::ScoreNode;
    if tune.layout.is_empty() {
        return;
    }
    let known: Vec<&str> = tune.voices.iter().map(|v| v.id.as_str()).collect();

    fn prune(node: ScoreNode, known: &[&str], diags: &mut Diagnostics) -> Option<ScoreNode> {
        match node {
            ScoreNode::Voice(id) => {
                if known.contains(&id.as_str()) {
                    Some(ScoreNode::Voice(id))
                } else {
                    diags.warn("layout_unknown_voice", format!("layout names unknown voice '{}'", id));
                    None
                }
            }
            ScoreNode::Overlay(ids) => {
                let kept: Vec<String> = ids
                    .into_iter()
                    .filter(|id| {
                        let ok = known.contains(&id.as_str());
                        if !ok {
                            diags.warn(
                                "layout_unknown_voice",
                                format!("layout names unknown voice '{}'", id),
                            );
                        }
                        ok
                    })
                    .collect();
                match kept.len() {
                    0 => None,
                    1 => Some(ScoreNode::Voice(kept.into_iter().next().unwrap())),
                    _ => Some(ScoreNode::Overlay(kept)),
                }
            }
            ScoreNode::Brace(children) => {
                let kept: Vec<ScoreNode> = children
                    .into_iter()
                    .filter_map(|c| prune(c, known, diags))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(ScoreNode::Brace(kept))
                }
            }
            ScoreNode::Bracket(children) => {
                let kept: Vec<ScoreNode> = children
                    .into_iter()
                    .filter_map(|c| prune(c, known, diags))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(ScoreNode::Bracket(kept))
                }
            }
        }
    }

    let layout = std::mem::take(&mut tune.layout);
    let mut pruned: Vec<ScoreNode> = layout
        .into_iter()
        .filter_map(|n| prune(n, &known, diags))
        .collect();

    // Voices the directive never mentioned get their own staves at the end
    let mentioned: Vec<String> = pruned
        .iter()
        .flat_map(|n| n.voice_ids())
        .map(|s| s.to_string())
        .collect();
    for v in &tune.voices {
        if !mentioned.contains(&v.id) {
            pruned.push(ScoreNode::Voice(v.id.clone()));
        }
    }
    tune.layout = pruned;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MeasureItem, Mode, Step};

    fn parse(src: &str) -> (Tune, Diagnostics) {
        let mut diags = Diagnostics::new();
        let tune = parse_tune(src, 1, PostprocessOptions::default(), &mut diags)
            .expect("parse failed");
        (tune, diags)
    }

    #[test]
    fn test_header_fields() {
        let (tune, _) = parse("X:1\nT:Test Tune\nC:Trad.\nM:6/8\nL:1/8\nQ:3/8=120\nK:D\nABC|\n");
        assert_eq!(tune.number, Some(1));
        assert_eq!(tune.title.as_deref(), Some("Test Tune"));
        assert_eq!(tune.composer.as_deref(), Some("Trad."));
        assert_eq!(tune.key.fifths, 2);
        assert_eq!(tune.key.mode, Mode::Major);
        assert_eq!(tune.unit, Dur::new(1, 2));
        assert_eq!(tune.voices.len(), 1);
        assert_eq!(tune.voices[0].measures.len(), 1);
    }

    #[test]
    fn test_default_unit_from_meter() {
        let (tune, _) = parse("X:1\nM:2/4\nK:C\nABC|\n");
        // 2/4 < 3/4 so the default unit is a sixteenth
        assert_eq!(tune.unit, Dur::new(1, 4));
    }

    #[test]
    fn test_multiple_voices() {
        let src = "X:1\nM:4/4\nK:C\nV:1 name=\"Melody\"\nCDEF|\nV:2 clef=bass\nC,,4|\n";
        let (tune, _) = parse(src);
        assert_eq!(tune.voices.len(), 2);
        assert_eq!(tune.voices[0].name.as_deref(), Some("Melody"));
        assert_eq!(tune.voices[1].clef, Clef::Bass);
    }

    #[test]
    fn test_lyrics_align_to_voice() {
        let src = "X:1\nK:C\nCDEF|\nw: one two three four\nw: uno dos tres cua-tro\n";
        let (tune, _) = parse(src);
        let lyrics = &tune.voices[0].lyrics;
        assert_eq!(lyrics.len(), 2);
        assert_eq!(lyrics[&1].len(), 4);
        // "cua-tro" splits into a hyphenated pair
        assert_eq!(lyrics[&2].len(), 5);
        assert!(matches!(
            &lyrics[&2][3],
            LyricToken::Syllable { text, hyphen: true } if text == "cua"
        ));
    }

    #[test]
    fn test_score_directive_prunes_unknown() {
        let src = "X:1\n%%score (1 9) 2\nK:C\nV:1\nC|\nV:2\nE|\n";
        let (tune, diags) = parse(src);
        assert!(diags.entries.iter().any(|d| d.kind == "layout_unknown_voice"));
        // Overlay (1 9) collapses to voice 1
        assert_eq!(tune.layout.len(), 2);
    }

    #[test]
    fn test_percmap_parsing() {
        let src = "X:1\n%%percmap ^g d' 42 x\nK:C perc\nV:1 clef=perc\n^g|\n";
        let (tune, _) = parse(src);
        let map = tune.percmap.get("^g").expect("percmap entry");
        assert_eq!(map.display_step, Step::D);
        assert_eq!(map.midi, 41); // MusicXML is zero-based
        assert_eq!(map.notehead.as_deref(), Some("x"));
    }

    #[test]
    fn test_percmap_without_staff_step() {
        // The staff-step slot is optional; the MIDI number comes right
        // after the written note
        let src = "X:1\n%%percmap ^g 42 x\nK:C perc\nV:1 clef=perc\n^g|\n";
        let (tune, _) = parse(src);
        let map = tune.percmap.get("^g").expect("percmap entry");
        assert_eq!(map.display_step, Step::G);
        assert_eq!(map.midi, 41);
        assert_eq!(map.notehead.as_deref(), Some("x"));
    }

    #[test]
    fn test_percmap_sound_name() {
        let src = "X:1\n%%percmap ^c snare-drum\nK:C perc\nV:1 clef=perc\n^c|\n";
        let (tune, _) = parse(src);
        let map = tune.percmap.get("^c").expect("percmap entry");
        assert_eq!(map.midi, 38 - 1);
    }

    #[test]
    fn test_comment_stripping() {
        let (tune, _) = parse("X:1\nK:C % a comment\nAB|%trailing\n");
        assert_eq!(tune.voices[0].measures.len(), 1);
        match &tune.voices[0].measures[0].items[0] {
            MeasureItem::Note(n) => assert!(n.pitch.is_some()),
            other => panic!("expected note, got {:?}", other),
        }
    }

    #[test]
    fn test_split_tunes() {
        let src = "X:1\nK:C\nAB|\n\nX:2\nK:G\nCD|\n";
        let tunes = split_tunes(src);
        assert_eq!(tunes.len(), 2);
        assert_eq!(tunes[0].0, 1);
        assert_eq!(tunes[1].0, 5);
        assert!(tunes[1].1.starts_with("X:2"));
    }
}
