//! ABC rendering
//!
//! Turns the canonical AST back into ABC source. The renderer expects the
//! post-processed form both pipelines produce: chords flattened behind a
//! carrier note, broken-rhythm markers resolved into plain durations,
//! tuplet durations already scaled to sounding time.
//!
//! Durations are re-encoded against a freshly chosen unit note length:
//! the renderer picks the `L:` (globally, with per-voice overrides) that
//! minimizes the total length of duration suffixes, and reintroduces
//! `>`/`<` broken-rhythm markers where a 3:1 or 7:1 pair writes shorter
//! than two explicit fractions.

use crate::diagnostics::Diagnostics;
use crate::models::{
    BarKind, Clef, Dur, LyricToken, Measure, MeasureItem, Note, Pitch, ScoreNode, Tune, Voice,
};
use crate::parse::grammar::{default_tuplet_q, parse_unit_field};
use std::collections::BTreeMap;

/// Line-wrapping budgets for the tune body. When both are set the
/// character budget wins; when neither is set the source line breaks
/// (or four bars per line) decide.
#[derive(Clone, Copy, Debug, Default)]
pub struct WrapOptions {
    pub max_chars: Option<usize>,
    pub max_bars: Option<usize>,
}

/// Render one tune as ABC text, ending with a newline
pub fn render_tune(tune: &Tune, wrap: WrapOptions, diags: &mut Diagnostics) -> String {
    let mut tune = tune.clone();
    resolve_cross_pitch_ties(&mut tune, diags);
    let tune = &tune;
    let (global_unit, overrides) = choose_units(tune);
    let mut out = String::new();

    // Header, K: last so everything after it is tune body
    out.push_str(&format!("X:{}\n", tune.number.unwrap_or(1)));
    if let Some(t) = &tune.title {
        out.push_str(&format!("T:{}\n", t));
    }
    if let Some(c) = &tune.composer {
        out.push_str(&format!("C:{}\n", c));
    }
    if let Some(o) = &tune.origin {
        out.push_str(&format!("O:{}\n", o));
    }
    for (code, value) in &tune.other_fields {
        // Raw K: values were only kept for the clef lookup
        if *code == 'K' {
            continue;
        }
        out.push_str(&format!("{}:{}\n", code, value));
    }
    if let Some(q) = &tune.tempo {
        let text = q.abc_text();
        if !text.is_empty() {
            out.push_str(&format!("Q:{}\n", text));
        }
    }
    if let Some(m) = &tune.meter {
        out.push_str(&format!("M:{}\n", m.abc_text()));
    }
    out.push_str(&format!("L:{}\n", unit_text(global_unit)));
    if !tune.layout.is_empty() {
        let parts: Vec<String> = tune.layout.iter().map(layout_text).collect();
        out.push_str(&format!("%%score {}\n", parts.join(" ")));
    }
    for (written, m) in &tune.percmap {
        let display = Pitch::new(m.display_step, 0, m.display_octave).abc_note(None);
        out.push_str(&format!("%%percmap {} {} {}", written, display, m.midi + 1));
        if let Some(head) = &m.notehead {
            out.push(' ');
            out.push_str(head);
        }
        out.push('\n');
    }

    // V: declarations carry clef and naming; %%MIDI settings need the
    // declared voice to be current, so they follow each declaration
    let need_decls = tune.voices.len() > 1
        || tune.voices.iter().any(|v| {
            v.name.is_some()
                || v.subname.is_some()
                || v.octave_shift != 0
                || v.midi_program.is_some()
                || v.midi_channel.is_some()
        });
    if need_decls {
        for v in &tune.voices {
            out.push_str(&format!("V:{} clef={}", v.id, v.clef.abc_name()));
            if let Some(name) = &v.name {
                out.push_str(&format!(" name=\"{}\"", name));
            }
            if let Some(sub) = &v.subname {
                out.push_str(&format!(" sname=\"{}\"", sub));
            }
            if v.octave_shift != 0 {
                out.push_str(&format!(" octave={}", v.octave_shift));
            }
            out.push('\n');
            if let Some(p) = v.midi_program {
                out.push_str(&format!("%%MIDI program {}\n", p));
            }
            if let Some(c) = v.midi_channel {
                out.push_str(&format!("%%MIDI channel {}\n", c));
            }
        }
    }
    out.push_str(&format!("K:{}", tune.key.abc_text()));
    if !need_decls {
        // A lone voice keeps its clef on the key line
        if let Some(v) = tune.voices.first() {
            if v.clef != Clef::default() {
                out.push_str(&format!(" clef={}", v.clef.abc_name()));
            }
        }
    }
    out.push('\n');

    // Body: voice by voice
    let multi = tune.voices.len() > 1;
    for voice in &tune.voices {
        if multi {
            out.push_str(&format!("V:{}\n", voice.id));
        }
        let voice_unit = overrides.get(&voice.id).copied().unwrap_or(global_unit);
        if voice_unit != global_unit {
            out.push_str(&format!("L:{}\n", unit_text(voice_unit)));
        }
        render_voice_body(voice, voice_unit, wrap, &mut out, diags);
    }

    out
}

/// A tie whose next sounding group holds no note of the same pitch cannot
/// be written as `-`. Degrade it to a slur across the two groups; a tie
/// with no following group at all is dropped.
fn resolve_cross_pitch_ties(tune: &mut Tune, diags: &mut Diagnostics) {
    for voice in &mut tune.voices {
        // Sounding groups: carrier position plus the (step, octave) set of
        // the carrier and its chord members
        let mut groups: Vec<((usize, usize), Vec<(crate::models::Step, i8)>)> = Vec::new();
        for (mi, m) in voice.measures.iter().enumerate() {
            for (ii, item) in m.items.iter().enumerate() {
                let MeasureItem::Note(n) = item else { continue };
                if n.grace {
                    continue;
                }
                if n.chord_member {
                    if let (Some(last), Some(p)) = (groups.last_mut(), n.pitch) {
                        last.1.push((p.step, p.octave));
                    }
                } else {
                    let pitches = n.pitch.map(|p| vec![(p.step, p.octave)]).unwrap_or_default();
                    groups.push(((mi, ii), pitches));
                }
            }
        }

        // (position of the tied note, carrier of its group, next carrier)
        let mut to_slur: Vec<((usize, usize), (usize, usize), (usize, usize))> = Vec::new();
        let mut to_drop: Vec<(usize, usize)> = Vec::new();
        let mut gi = 0usize;
        for (mi, m) in voice.measures.iter().enumerate() {
            for (ii, item) in m.items.iter().enumerate() {
                let MeasureItem::Note(n) = item else { continue };
                if n.grace {
                    continue;
                }
                if !n.chord_member {
                    gi += 1;
                }
                if !n.tie || gi == 0 {
                    continue;
                }
                let Some(p) = n.pitch else { continue };
                let carrier = groups[gi - 1].0;
                match groups.get(gi) {
                    Some((next_pos, pitches)) if !pitches.contains(&(p.step, p.octave)) => {
                        diags.warn(
                            "tie_changed_pitch",
                            format!(
                                "voice {}: tie from {} continues on a different pitch; written as a slur",
                                voice.id, p
                            ),
                        );
                        to_slur.push(((mi, ii), carrier, *next_pos));
                    }
                    Some(_) => {}
                    None => {
                        diags.warn(
                            "tie_unresolved",
                            format!("voice {}: tie from {} has no following note; dropped", voice.id, p),
                        );
                        to_drop.push((mi, ii));
                    }
                }
            }
        }

        for (mi, ii) in to_drop {
            if let MeasureItem::Note(n) = &mut voice.measures[mi].items[ii] {
                n.tie = false;
            }
        }
        for (note_pos, carrier, next) in to_slur {
            if let MeasureItem::Note(n) = &mut voice.measures[note_pos.0].items[note_pos.1] {
                n.tie = false;
            }
            if let MeasureItem::Note(n) = &mut voice.measures[carrier.0].items[carrier.1] {
                n.slur_starts += 1;
            }
            if let MeasureItem::Note(n) = &mut voice.measures[next.0].items[next.1] {
                n.slur_ends += 1;
            }
        }
    }
}

fn render_voice_body(
    voice: &Voice,
    unit: Dur,
    wrap: WrapOptions,
    out: &mut String,
    diags: &mut Diagnostics,
) {
    let ms = &voice.measures;
    // `|:` at the very start of a voice is stored as an empty measure
    // closed by a repeat-start bar; write it back as a bare `|:` prefix
    let lead_repeat = ms.len() > 1
        && ms[0].items.is_empty()
        && ms[0].right.kind == BarKind::RepeatStart
        && ms[0].volta.is_none();
    let start = if lead_repeat { 1 } else { 0 };

    let mut cur_unit = unit;
    let mut chunks: Vec<MeasureChunk> = Vec::new();
    for i in start..ms.len() {
        let next_volta = ms.get(i + 1).and_then(|m| m.volta.as_deref());
        let (mut text, sung) = measure_chunk(&ms[i], i == start, next_volta, &mut cur_unit);
        if i == start && lead_repeat {
            text.insert_str(0, "|:");
        }
        chunks.push(MeasureChunk {
            text,
            break_after: ms[i].line_break_after,
            sung,
        });
    }

    let mut cursors: BTreeMap<u8, usize> = voice.lyrics.keys().map(|k| (*k, 0)).collect();
    for (lo, hi) in line_ranges(&chunks, wrap) {
        let line: String = chunks[lo..hi].iter().map(|c| c.text.as_str()).collect();
        out.push_str(line.trim_start());
        out.push('\n');
        let counts: Vec<usize> = chunks[lo..hi].iter().map(|c| c.sung).collect();
        for (verse, tokens) in &voice.lyrics {
            if let Some(cursor) = cursors.get_mut(verse) {
                if let Some(text) = render_lyric_line(tokens, cursor, &counts) {
                    out.push_str(&format!("w: {}\n", text));
                }
            }
        }
    }

    for (verse, tokens) in &voice.lyrics {
        let used = cursors.get(verse).copied().unwrap_or(0);
        if used < tokens.len() {
            diags.warn(
                "lyrics_leftover",
                format!(
                    "voice {}: verse {} has {} syllables with no note to sing them",
                    voice.id,
                    verse,
                    tokens.len() - used
                ),
            );
        }
    }
}

struct MeasureChunk {
    text: String,
    break_after: bool,
    /// Notes in this measure that lyric tokens align against
    sung: usize,
}

/// Render one measure including its closing barline. `next_volta` is the
/// volta label opening the following measure; its digits attach directly
/// to this measure's bar token.
fn measure_chunk(
    m: &Measure,
    first: bool,
    next_volta: Option<&str>,
    unit: &mut Dur,
) -> (String, usize) {
    let mut s = String::new();
    if first {
        if let Some(v) = &m.volta {
            s.push('[');
            s.push_str(v);
        }
    }
    let items = &m.items;
    let mut sung = 0usize;
    let mut in_grace = false;
    let mut i = 0;
    while i < items.len() {
        let grace_note = matches!(&items[i], MeasureItem::Note(n) if n.grace && !n.chord_member);
        if in_grace && !grace_note {
            s.push('}');
            in_grace = false;
        } else if grace_note && !in_grace {
            s.push('{');
            in_grace = true;
        }
        match &items[i] {
            MeasureItem::Note(n) if !n.chord_member => {
                if n.beam_break && needs_space(&s) {
                    s.push(' ');
                }
                if let Some(t) = n.tuplet {
                    if t.start {
                        s.push_str(&tuplet_token(t.p, t.q, tuplet_run_len(items, i)));
                    }
                }
                if !n.grace && !n.is_rest() {
                    sung += 1;
                }
                if !n.grace && n.tuplet.is_none() {
                    if let Some(bp) = broken_pair(items, i) {
                        if let MeasureItem::Note(partner) = &items[bp.partner] {
                            let plain = dur_suffix(unit_ratio(written_dur(n), *unit)).len()
                                + dur_suffix(unit_ratio(written_dur(partner), *unit)).len();
                            let nominal = dur_suffix(unit_ratio(bp.nominal, *unit)).len();
                            if bp.marker.len() + 2 * nominal < plain {
                                let after = emit_sounding(items, i, bp.nominal, *unit, &mut s);
                                debug_assert_eq!(after, bp.partner);
                                s.push_str(bp.marker);
                                if !partner.is_rest() {
                                    sung += 1;
                                }
                                i = emit_sounding(items, bp.partner, bp.nominal, *unit, &mut s);
                                continue;
                            }
                        }
                    }
                }
                i = emit_sounding(items, i, written_dur(n), *unit, &mut s);
            }
            // Chord members were consumed along with their carrier
            MeasureItem::Note(_) => i += 1,
            MeasureItem::InlineField { code, value } => {
                if *code == 'L' {
                    if let Some(u) = parse_unit_field(value) {
                        *unit = u;
                    }
                }
                s.push_str(&format!("[{}:{}]", code, value));
                i += 1;
            }
            MeasureItem::ChordSymbol(text) => {
                s.push_str(&format!("\"{}\"", text));
                i += 1;
            }
            MeasureItem::Annotation(text) => {
                // Placement was stripped at parse time; `^` keeps the text
                // an annotation rather than a chord symbol
                s.push_str(&format!("\"^{}\"", text));
                i += 1;
            }
            // Pre-normalization items never survive post-processing; the
            // raw forms are written back unchanged just in case
            MeasureItem::Broken(b) => {
                s.push_str(b.abc_text());
                i += 1;
            }
            MeasureItem::TupletStart { p, q, r } => {
                s.push_str(&format!("({}:{}:{}", p, q, r));
                i += 1;
            }
            MeasureItem::GraceOpen => {
                s.push('{');
                i += 1;
            }
            MeasureItem::GraceClose => {
                s.push('}');
                i += 1;
            }
            MeasureItem::Chord(_) => i += 1,
        }
    }
    if in_grace {
        s.push('}');
    }
    // A space keeps an empty measure's bar from fusing with the previous
    // one into a double bar
    if s.is_empty() {
        s.push(' ');
    }
    s.push_str(bar_text(m.right.kind));
    if let Some(v) = next_volta {
        s.push_str(v);
    }
    (s, sung)
}

/// Render the carrier note at `idx` (and any chord members behind it)
/// with the given written duration. Returns the index past the group.
fn emit_sounding(items: &[MeasureItem], idx: usize, written: Dur, unit: Dur, s: &mut String) -> usize {
    let end = members_end(items, idx);
    let Some(MeasureItem::Note(n)) = items.get(idx) else {
        return idx + 1;
    };
    if end == idx + 1 {
        s.push_str(&note_text(n, written, unit));
    } else {
        let members: Vec<&Note> = items[idx + 1..end]
            .iter()
            .filter_map(|it| match it {
                MeasureItem::Note(m) => Some(m),
                _ => None,
            })
            .collect();
        s.push_str(&chord_text(n, &members, written, unit));
    }
    end
}

fn note_text(n: &Note, written: Dur, unit: Dur) -> String {
    let mut s = String::new();
    for _ in 0..n.slur_starts {
        s.push('(');
    }
    for d in &n.decorations {
        s.push_str(&decoration_text(d));
    }
    match &n.pitch {
        Some(p) => s.push_str(&p.abc_note(n.accidental)),
        None => s.push(if n.visible { 'z' } else { 'x' }),
    }
    s.push_str(&dur_suffix(unit_ratio(written, unit)));
    if n.tie {
        s.push('-');
    }
    for _ in 0..n.slur_ends {
        s.push(')');
    }
    s
}

fn chord_text(carrier: &Note, members: &[&Note], written: Dur, unit: Dur) -> String {
    let mut s = String::new();
    for _ in 0..carrier.slur_starts {
        s.push('(');
    }
    for d in &carrier.decorations {
        s.push_str(&decoration_text(d));
    }
    // Equal member durations share one suffix after the bracket;
    // otherwise each member writes its own
    let uniform = members.iter().all(|m| m.dur == carrier.dur);
    s.push('[');
    for note in std::iter::once(carrier).chain(members.iter().copied()) {
        let Some(p) = note.pitch else { continue };
        s.push_str(&p.abc_note(note.accidental));
        if !uniform {
            s.push_str(&dur_suffix(unit_ratio(written_dur(note), unit)));
        }
        if note.tie {
            s.push('-');
        }
    }
    s.push(']');
    if uniform {
        s.push_str(&dur_suffix(unit_ratio(written, unit)));
    }
    for _ in 0..carrier.slur_ends {
        s.push(')');
    }
    s
}

/// Written duration: tuplet notes write their pre-scaling value
fn written_dur(n: &Note) -> Dur {
    match n.tuplet {
        Some(t) => n.dur * Dur::new(t.p as i32, t.q as i32),
        None => n.dur,
    }
}

fn unit_ratio(dur: Dur, unit: Dur) -> Dur {
    dur * Dur::new(unit.denom(), unit.numer())
}

/// Length suffix for a unit ratio: ``, `2`, `3/2`, `/`, `/4`
fn dur_suffix(r: Dur) -> String {
    if r == Dur::from_int(1) {
        String::new()
    } else if r.denom() == 1 {
        format!("{}", r.numer())
    } else if r.numer() == 1 {
        if r.denom() == 2 {
            "/".to_string()
        } else {
            format!("/{}", r.denom())
        }
    } else {
        format!("{}/{}", r.numer(), r.denom())
    }
}

/// `L:` field text: the unit converts from quarter multiples back to a
/// fraction of a whole note
fn unit_text(unit: Dur) -> String {
    let whole = unit * Dur::new(1, 4);
    format!("{}/{}", whole.numer(), whole.denom())
}

fn bar_text(kind: BarKind) -> &'static str {
    match kind {
        BarKind::Single | BarKind::Dotted | BarKind::Invisible => "|",
        BarKind::Double => "||",
        BarKind::Final => "|]",
        BarKind::HeavyThin => "[|",
        BarKind::RepeatStart => "|:",
        BarKind::RepeatEnd => ":|",
        BarKind::RepeatBoth => "::",
    }
}

fn tuplet_token(p: u8, q: u8, r: u8) -> String {
    if q == default_tuplet_q(p) && r == p {
        format!("({}", p)
    } else {
        format!("({}:{}:{}", p, q, r)
    }
}

/// Number of sounding groups from `from` to the end of the tuplet run
fn tuplet_run_len(items: &[MeasureItem], from: usize) -> u8 {
    let mut count: u8 = 0;
    for item in &items[from..] {
        if let MeasureItem::Note(n) = item {
            if n.grace || n.chord_member {
                continue;
            }
            match n.tuplet {
                Some(t) => {
                    count = count.saturating_add(1);
                    if t.stop {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    count.max(1)
}

fn decoration_text(name: &str) -> String {
    let shorthand = match name {
        "staccato" => Some('.'),
        "roll" => Some('~'),
        "fermata" => Some('H'),
        "accent" => Some('L'),
        "lowermordent" => Some('M'),
        "coda" => Some('O'),
        "uppermordent" => Some('P'),
        "segno" => Some('S'),
        "trill" => Some('T'),
        "upbow" => Some('u'),
        "downbow" => Some('v'),
        _ => None,
    };
    match shorthand {
        Some(c) => c.to_string(),
        None => format!("!{}!", name),
    }
}

fn needs_space(s: &str) -> bool {
    !matches!(s.chars().last(), None | Some(' ') | Some('{') | Some('}'))
}

/// Index just past the chord members following the carrier at `idx`
fn members_end(items: &[MeasureItem], idx: usize) -> usize {
    let mut j = idx + 1;
    while let Some(MeasureItem::Note(m)) = items.get(j) {
        if !m.chord_member {
            break;
        }
        j += 1;
    }
    j
}

fn uniform_chord(items: &[MeasureItem], idx: usize) -> bool {
    let Some(MeasureItem::Note(carrier)) = items.get(idx) else {
        return true;
    };
    items[idx + 1..members_end(items, idx)].iter().all(|it| match it {
        MeasureItem::Note(m) => m.dur == carrier.dur,
        _ => true,
    })
}

struct BrokenPair {
    marker: &'static str,
    /// The duration both partners write; `>` scales it 3/2 and 1/2 back
    nominal: Dur,
    partner: usize,
}

/// Two adjacent sounding groups whose durations fit a `>`/`<` pattern
fn broken_pair(items: &[MeasureItem], i: usize) -> Option<BrokenPair> {
    let Some(MeasureItem::Note(a)) = items.get(i) else {
        return None;
    };
    if a.grace || a.chord_member || a.tuplet.is_some() || !uniform_chord(items, i) {
        return None;
    }
    let j = members_end(items, i);
    let Some(MeasureItem::Note(b)) = items.get(j) else {
        return None;
    };
    if b.grace || b.tuplet.is_some() || !uniform_chord(items, j) {
        return None;
    }
    if a.dur.is_zero() || b.dur.is_zero() {
        return None;
    }
    let marker = if a.dur == b.dur * Dur::from_int(3) {
        ">"
    } else if b.dur == a.dur * Dur::from_int(3) {
        "<"
    } else if a.dur == b.dur * Dur::from_int(7) {
        ">>"
    } else if b.dur == a.dur * Dur::from_int(7) {
        "<<"
    } else {
        return None;
    };
    let nominal = (a.dur + b.dur) * Dur::new(1, 2);
    Some(BrokenPair { marker, nominal, partner: j })
}

/// Pick the unit note length: the candidate minimizing total suffix
/// length over all voices, with a per-voice override where a voice alone
/// does strictly better. Ties go to the larger unit.
fn choose_units(tune: &Tune) -> (Dur, BTreeMap<String, Dur>) {
    let candidates = [Dur::from_int(1), Dur::new(1, 2), Dur::new(1, 4)];
    let mut global = candidates[1];
    let mut best = usize::MAX;
    for &c in &candidates {
        let total: usize = tune.voices.iter().map(|v| voice_cost(v, c)).sum();
        if total < best {
            best = total;
            global = c;
        }
    }
    let mut overrides = BTreeMap::new();
    for v in &tune.voices {
        let mut vb = global;
        let mut vc = voice_cost(v, global);
        for &c in &candidates {
            let cost = voice_cost(v, c);
            if cost < vc {
                vc = cost;
                vb = c;
            }
        }
        if vb != global {
            overrides.insert(v.id.clone(), vb);
        }
    }
    (global, overrides)
}

/// Total suffix length this voice would write under the given unit,
/// counting broken-rhythm pairs at whichever form is shorter
fn voice_cost(voice: &Voice, unit: Dur) -> usize {
    let mut cur = unit;
    let mut cost = 0usize;
    for m in &voice.measures {
        let items = &m.items;
        let mut i = 0;
        while i < items.len() {
            match &items[i] {
                MeasureItem::InlineField { code: 'L', value } => {
                    if let Some(u) = parse_unit_field(value) {
                        cur = u;
                    }
                    i += 1;
                }
                MeasureItem::Note(n) if !n.chord_member => {
                    if !n.grace && n.tuplet.is_none() {
                        if let Some(bp) = broken_pair(items, i) {
                            if let MeasureItem::Note(partner) = &items[bp.partner] {
                                let plain = dur_suffix(unit_ratio(written_dur(n), cur)).len()
                                    + dur_suffix(unit_ratio(written_dur(partner), cur)).len();
                                let broken = bp.marker.len()
                                    + 2 * dur_suffix(unit_ratio(bp.nominal, cur)).len();
                                cost += plain.min(broken);
                                i = members_end(items, bp.partner);
                                continue;
                            }
                        }
                    }
                    cost += dur_suffix(unit_ratio(written_dur(n), cur)).len();
                    i += 1;
                }
                _ => i += 1,
            }
        }
    }
    cost
}

fn layout_text(node: &ScoreNode) -> String {
    match node {
        ScoreNode::Voice(id) => id.clone(),
        ScoreNode::Overlay(ids) => format!("({})", ids.join(" ")),
        ScoreNode::Brace(children) => {
            let parts: Vec<String> = children.iter().map(layout_text).collect();
            format!("{{{}}}", parts.join(" "))
        }
        ScoreNode::Bracket(children) => {
            let parts: Vec<String> = children.iter().map(layout_text).collect();
            format!("[{}]", parts.join(" "))
        }
    }
}

/// Group measures into output lines per the wrap options
fn line_ranges(chunks: &[MeasureChunk], wrap: WrapOptions) -> Vec<(usize, usize)> {
    let n = chunks.len();
    let mut ranges = Vec::new();
    if n == 0 {
        return ranges;
    }
    if let Some(max) = wrap.max_chars.filter(|&m| m > 0) {
        let mut start = 0;
        let mut width = 0usize;
        for (i, c) in chunks.iter().enumerate() {
            if i > start && width + c.text.len() > max {
                ranges.push((start, i));
                start = i;
                width = 0;
            }
            width += c.text.len();
        }
        ranges.push((start, n));
    } else if let Some(max) = wrap.max_bars.filter(|&m| m > 0) {
        let mut start = 0;
        while start < n {
            let end = (start + max).min(n);
            ranges.push((start, end));
            start = end;
        }
    } else if chunks.iter().any(|c| c.break_after) {
        let mut start = 0;
        for i in 0..n {
            if chunks[i].break_after || i + 1 == n {
                ranges.push((start, i + 1));
                start = i + 1;
            }
        }
    } else {
        let mut start = 0;
        while start < n {
            let end = (start + 4).min(n);
            ranges.push((start, end));
            start = end;
        }
    }
    ranges
}

/// Consume lyric tokens for one music line (`counts` lists each
/// measure's singable notes) and render them as a `w:` value
fn render_lyric_line(
    tokens: &[LyricToken],
    cursor: &mut usize,
    counts: &[usize],
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for &count in counts {
        let mut consumed = 0;
        let mut synced = false;
        while consumed < count && *cursor < tokens.len() {
            let tok = &tokens[*cursor];
            *cursor += 1;
            match tok {
                LyricToken::BarSync => {
                    parts.push("|".to_string());
                    consumed = count;
                    synced = true;
                }
                LyricToken::Syllable { text, hyphen } => {
                    let mut t = escape_syllable(text);
                    if *hyphen {
                        t.push('-');
                    }
                    parts.push(t);
                    consumed += 1;
                }
                LyricToken::Extend => {
                    parts.push("_".to_string());
                    consumed += 1;
                }
                LyricToken::Skip => {
                    parts.push("*".to_string());
                    consumed += 1;
                }
            }
        }
        if !synced && consumed >= count {
            if let Some(LyricToken::BarSync) = tokens.get(*cursor) {
                parts.push("|".to_string());
                *cursor += 1;
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn escape_syllable(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' ' => out.push('~'),
            '-' | '_' | '*' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_tune, PostprocessOptions};

    fn parse(src: &str) -> Tune {
        let mut diags = Diagnostics::new();
        parse_tune(src, 1, PostprocessOptions::default(), &mut diags).expect("parse failed")
    }

    fn render(tune: &Tune) -> String {
        let mut diags = Diagnostics::new();
        render_tune(tune, WrapOptions::default(), &mut diags)
    }

    fn note_seq(tune: &Tune, voice: usize) -> Vec<(Option<Pitch>, Dur, bool)> {
        tune.voices[voice]
            .measures
            .iter()
            .flat_map(|m| m.items.iter())
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some((n.pitch, n.dur, n.tie)),
                _ => None,
            })
            .collect()
    }

    fn round_trip(src: &str) -> (Tune, Tune, String) {
        let first = parse(src);
        let abc = render(&first);
        let second = parse(&abc);
        (first, second, abc)
    }

    #[test]
    fn test_simple_round_trip() {
        let (a, b, abc) = round_trip("X:1\nT:Test\nM:4/4\nL:1/8\nK:D\nABcd efga|b4 a4|]\n");
        assert!(abc.contains("T:Test"));
        assert!(abc.contains("M:4/4"));
        assert!(abc.contains("K:D"));
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
        assert_eq!(
            b.voices[0].measures.last().unwrap().right.kind,
            BarKind::Final
        );
    }

    #[test]
    fn test_unit_selection_prefers_quarters() {
        let tune = parse("X:1\nM:4/4\nL:1/8\nK:C\nC2D2E2F2|G2A2B2c2|\n");
        let abc = render(&tune);
        assert!(abc.contains("L:1/4"), "got: {}", abc);
        assert!(abc.contains("CDEF|"));
        let again = parse(&abc);
        assert_eq!(note_seq(&tune, 0), note_seq(&again, 0));
    }

    #[test]
    fn test_broken_rhythm_reintroduced() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\nA>B A>B|A>B A>B|\n");
        assert!(abc.contains("A>B"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_dotted_note_stays_plain() {
        // C3D is shorter than C2>D2, so no marker
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\nC3D EFGA|C3D EFGA|\n");
        assert!(abc.contains("C3D"), "got: {}", abc);
        assert!(!abc.contains('>'));
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_tuplet_shorthand() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n(3ABA (3ABA|A2 A2|\n");
        assert!(abc.contains("(3ABA"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
        let t = match &b.voices[0].measures[0].items[0] {
            MeasureItem::Note(n) => n.tuplet.unwrap(),
            other => panic!("expected note, got {:?}", other),
        };
        assert!(t.start);
        assert_eq!((t.p, t.q), (3, 2));
    }

    #[test]
    fn test_irregular_tuplet_written_in_full() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n(5:4:5ABCDE z2 z|\n");
        assert!(abc.contains("(5:4:5"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_cross_pitch_tie_written_as_slur() {
        let tune = parse("X:1\nL:1/8\nK:C\nC2-D2 E2F2|\n");
        let mut diags = Diagnostics::new();
        let abc = render_tune(&tune, WrapOptions::default(), &mut diags);
        assert!(abc.contains("(CD)"), "got: {}", abc);
        assert!(diags.entries.iter().any(|d| d.kind == "tie_changed_pitch"));
    }

    #[test]
    fn test_trailing_tie_dropped() {
        let tune = parse("X:1\nL:1/8\nK:C\nC2D2 E2F2-|\n");
        let mut diags = Diagnostics::new();
        let abc = render_tune(&tune, WrapOptions::default(), &mut diags);
        assert!(!abc.contains('-'), "got: {}", abc);
        assert!(diags.entries.iter().any(|d| d.kind == "tie_unresolved"));
    }

    #[test]
    fn test_chord_with_ties() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n[CEG]2-[CEG]2 C2E2|\n");
        assert!(abc.contains("[C-E-G-]"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_repeats_and_voltas() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n|:A2B2|1C2D2:|2E2F2|]\n");
        assert!(abc.contains("|:"), "got: {}", abc);
        let kinds_a: Vec<BarKind> =
            a.voices[0].measures.iter().map(|m| m.right.kind).collect();
        let kinds_b: Vec<BarKind> =
            b.voices[0].measures.iter().map(|m| m.right.kind).collect();
        assert_eq!(kinds_a, kinds_b);
        let voltas_a: Vec<Option<String>> =
            a.voices[0].measures.iter().map(|m| m.volta.clone()).collect();
        let voltas_b: Vec<Option<String>> =
            b.voices[0].measures.iter().map(|m| m.volta.clone()).collect();
        assert_eq!(voltas_a, voltas_b);
    }

    #[test]
    fn test_grace_notes_braced() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n{ag}eg fg|ag eg|\n");
        assert!(abc.contains("{ag}e"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
        assert!(matches!(
            &b.voices[0].measures[0].items[0],
            MeasureItem::Note(n) if n.grace
        ));
    }

    #[test]
    fn test_decorations_round_trip() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n.A2 TB2 !wedge!c2 d2|\n");
        assert!(abc.contains(".A"), "got: {}", abc);
        assert!(abc.contains("TB"));
        assert!(abc.contains("!wedge!c"));
        let decos = |t: &Tune| -> Vec<Vec<String>> {
            t.voices[0]
                .measures
                .iter()
                .flat_map(|m| m.items.iter())
                .filter_map(|i| match i {
                    MeasureItem::Note(n) => Some(n.decorations.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(decos(&a), decos(&b));
    }

    #[test]
    fn test_multivoice_declarations() {
        let src = "X:1\nM:4/4\nK:C\nV:1 name=\"Melody\"\nC2D2E2F2|\nV:2 clef=bass\nC,8|\n";
        let (a, b, abc) = round_trip(src);
        assert!(abc.contains("V:1 clef=treble name=\"Melody\""), "got: {}", abc);
        assert!(abc.contains("V:2 clef=bass"));
        assert_eq!(a.voices.len(), b.voices.len());
        assert_eq!(b.voices[0].name.as_deref(), Some("Melody"));
        assert_eq!(b.voices[1].clef, Clef::Bass);
        assert_eq!(note_seq(&a, 1), note_seq(&b, 1));
    }

    #[test]
    fn test_percussion_header_round_trip() {
        let src = "X:1\n%%percmap ^g d' 42 x\nK:C\nV:1 clef=perc\n^g2 ^g2 ^g2 ^g2|\n";
        let (a, b, abc) = round_trip(src);
        assert!(abc.contains("%%percmap ^g d' 42 x"), "got: {}", abc);
        assert!(abc.contains("clef=perc"));
        assert_eq!(a.percmap, b.percmap);
        assert!(b.voices[0].is_percussion());
    }

    #[test]
    fn test_score_directive_regenerated() {
        let src = "X:1\n%%score {(1 2) 3}\nM:4/4\nK:C\nV:1\nC8|\nV:2\nE8|\nV:3\nG8|\n";
        let (a, b, abc) = round_trip(src);
        assert!(abc.contains("%%score {(1 2) 3}"), "got: {}", abc);
        assert_eq!(a.layout, b.layout);
    }

    #[test]
    fn test_lyrics_round_trip() {
        let src = "X:1\nL:1/4\nK:C\nCDEF|GABc|\nw: one two three four five six se-ven\n";
        let (a, b, abc) = round_trip(src);
        assert!(abc.contains("w: one two three four five six se- ven"), "got: {}", abc);
        assert_eq!(a.voices[0].lyrics, b.voices[0].lyrics);
    }

    #[test]
    fn test_lyric_extend_and_skip() {
        let src = "X:1\nL:1/4\nK:C\nCDEF|\nw: la_ * da\n";
        let (a, b, _) = round_trip(src);
        assert_eq!(a.voices[0].lyrics, b.voices[0].lyrics);
    }

    #[test]
    fn test_leftover_lyrics_warn() {
        let tune = parse("X:1\nL:1/4\nK:C\nCD|\nw: a b c d\n");
        let mut diags = Diagnostics::new();
        render_tune(&tune, WrapOptions::default(), &mut diags);
        assert!(diags.entries.iter().any(|d| d.kind == "lyrics_leftover"));
    }

    #[test]
    fn test_wrap_by_bars() {
        let tune = parse("X:1\nL:1/4\nK:C\nC4|C4|C4|C4|C4|C4|C4|C4|\n");
        let mut diags = Diagnostics::new();
        let abc = render_tune(
            &tune,
            WrapOptions { max_chars: None, max_bars: Some(2) },
            &mut diags,
        );
        let body_lines = abc.lines().filter(|l| l.starts_with('C')).count();
        assert_eq!(body_lines, 4, "got: {}", abc);
    }

    #[test]
    fn test_wrap_chars_beats_bars() {
        let tune = parse("X:1\nL:1/8\nK:C\nC2D2E2F2|C2D2E2F2|C2D2E2F2|C2D2E2F2|\n");
        let mut diags = Diagnostics::new();
        let abc = render_tune(
            &tune,
            WrapOptions { max_chars: Some(12), max_bars: Some(4) },
            &mut diags,
        );
        // Two five-character measures fit in twelve columns, four do not
        let body_lines = abc.lines().filter(|l| l.starts_with('C')).count();
        assert_eq!(body_lines, 2, "got: {}", abc);
    }

    #[test]
    fn test_inline_field_passthrough() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\nA2B2|[M:3/4]c2d2e2|\n");
        assert!(abc.contains("[M:3/4]"), "got: {}", abc);
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_chord_symbol_and_annotation() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n\"Gm7\"A2 \"^dolce\"B2 c2d2|\n");
        assert!(abc.contains("\"Gm7\""), "got: {}", abc);
        assert!(abc.contains("\"^dolce\""));
        let texts = |t: &Tune| -> Vec<String> {
            t.voices[0]
                .measures
                .iter()
                .flat_map(|m| m.items.iter())
                .filter_map(|i| match i {
                    MeasureItem::ChordSymbol(s) | MeasureItem::Annotation(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(texts(&a), texts(&b));
    }

    #[test]
    fn test_invisible_rest() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\nA2x2B2z2|\n");
        assert!(abc.contains('x'), "got: {}", abc);
        assert!(abc.contains('z'));
        let visible = |t: &Tune| -> Vec<bool> {
            t.voices[0]
                .measures
                .iter()
                .flat_map(|m| m.items.iter())
                .filter_map(|i| match i {
                    MeasureItem::Note(n) if n.is_rest() => Some(n.visible),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(visible(&a), visible(&b));
        assert_eq!(note_seq(&a, 0), note_seq(&b, 0));
    }

    #[test]
    fn test_empty_measure_keeps_single_bars() {
        let (a, b, _) = round_trip("X:1\nL:1/8\nK:C\nA2B2| |C2D2|\n");
        assert_eq!(a.voices[0].measures.len(), b.voices[0].measures.len());
        assert!(b.voices[0]
            .measures
            .iter()
            .all(|m| m.right.kind == BarKind::Single));
    }

    #[test]
    fn test_slurs_round_trip() {
        let (a, b, abc) = round_trip("X:1\nL:1/8\nK:C\n(A2B2 (c2d2))|\n");
        assert!(abc.contains('('), "got: {}", abc);
        let slurs = |t: &Tune| -> Vec<(u8, u8)> {
            t.voices[0]
                .measures
                .iter()
                .flat_map(|m| m.items.iter())
                .filter_map(|i| match i {
                    MeasureItem::Note(n) => Some((n.slur_starts, n.slur_ends)),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(slurs(&a), slurs(&b));
    }
}
