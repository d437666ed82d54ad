//! Per-part measure rendering
//!
//! Walks the voices of one part measure by measure. Voices sharing a part
//! (overlays, grand-staff staves) are interleaved with `<backup>` so they
//! overlay in time. Each voice keeps its own running state: the measure
//! accidental table, the open-tie set, the slur stack and the lyric
//! cursors. Slur numbers come from one allocator per part so overlapping
//! slurs across voices never collide.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::builder::{AttrChild, AttrKind, XmlBuilder};
use super::tables::{self, Decoration};
use super::PartPlan;
use crate::diagnostics::Diagnostics;
use crate::models::{
    BarKind, Clef, Dur, Key, LyricToken, Measure, MeasureItem, MeterSymbol, Note,
    PercussionMapping, Pitch, Step, Tempo, TimeSig, Tune, Voice,
};

/// Highest supported divisions-per-quarter. 768 covers every duration the
/// duration engine can represent.
const MAX_DIVISIONS: i64 = 768;

/// Open-string MIDI numbers of a standard-tuned guitar, string 1 (high E)
/// first, matching MusicXML string numbering
const TAB_OPEN_MIDI: [i32; 6] = [64, 59, 55, 50, 45, 40];

/// Tuning per staff line, line 1 = bottom
const TAB_TUNING: [(Step, i8); 6] = [
    (Step::E, 2),
    (Step::A, 2),
    (Step::D, 3),
    (Step::G, 3),
    (Step::B, 3),
    (Step::E, 4),
];

struct PartCtx<'a> {
    divisions: i32,
    staves: u8,
    part_id: &'a str,
    tune: &'a Tune,
}

/// Slur number pool shared by all voices of a part
#[derive(Default)]
struct SlurAlloc {
    in_use: [bool; 16],
}

impl SlurAlloc {
    fn take(&mut self) -> u8 {
        for (i, used) in self.in_use.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return (i + 1) as u8;
            }
        }
        1
    }

    fn release(&mut self, n: u8) {
        if (1..=16).contains(&n) {
            self.in_use[(n - 1) as usize] = false;
        }
    }
}

/// Busy-interval tracking for the greedy tablature string allocator
struct TabState {
    /// Time up to which each string is occupied, string 1 first
    occupied: [Dur; 6],
    /// Start time of the current sounding group
    current: Dur,
    /// Time cursor past the current group
    cursor: Dur,
}

impl Default for TabState {
    fn default() -> Self {
        TabState {
            occupied: [Dur::zero(); 6],
            current: Dur::zero(),
            cursor: Dur::zero(),
        }
    }
}

impl TabState {
    fn reset(&mut self) {
        *self = TabState::default();
    }

    fn advance(&mut self, dur: Dur) {
        self.current = self.cursor;
        self.cursor = self.cursor + dur;
    }

    /// First free string that can reach the pitch within 24 frets
    fn allocate(&mut self, midi: i32) -> Option<(u8, u8)> {
        for (i, open) in TAB_OPEN_MIDI.iter().enumerate() {
            let fret = midi - open;
            if (0..=24).contains(&fret) && self.occupied[i] <= self.current {
                self.occupied[i] = self.cursor;
                return Some(((i + 1) as u8, fret as u8));
            }
        }
        None
    }
}

/// Per-voice emission state, persisted across measures
#[derive(Default)]
struct VoiceState {
    voice_id: String,
    staff: u8,
    number: u8,
    key: Key,
    /// Accidentals in force for the current measure, keyed (step, octave)
    accidentals: HashMap<(Step, i8), i8>,
    /// Ties started on the previous sounding group
    open_ties: HashSet<(Step, i8)>,
    /// Ties arriving at the current group, waiting for their stop
    incoming: HashSet<(Step, i8)>,
    /// Slur numbers from converted ties, closing on the next group
    converted_close: Vec<u8>,
    slur_stack: Vec<u8>,
    /// Pitches of every sounding group of the voice, for tie lookahead.
    /// A rest group is an empty entry.
    groups: Vec<Vec<(Step, i8)>>,
    current: usize,
    next_group: usize,
    lyric_pos: BTreeMap<u8, usize>,
    lyric_hyphen: BTreeMap<u8, bool>,
    tab: Option<TabState>,
}

impl VoiceState {
    fn new(staff: u8, number: u8, voice: &Voice, key: Key) -> Self {
        VoiceState {
            voice_id: voice.id.clone(),
            staff,
            number,
            key,
            groups: carrier_groups(voice),
            tab: (voice.clef == Clef::Tab).then(TabState::default),
            ..Default::default()
        }
    }
}

/// Pitches of each sounding group (carrier plus trailing chord members)
fn carrier_groups(voice: &Voice) -> Vec<Vec<(Step, i8)>> {
    let mut groups: Vec<Vec<(Step, i8)>> = Vec::new();
    for m in &voice.measures {
        for item in &m.items {
            let MeasureItem::Note(n) = item else { continue };
            if n.grace {
                continue;
            }
            if n.chord_member {
                if let (Some(last), Some(p)) = (groups.last_mut(), n.pitch) {
                    last.push((p.step, p.octave));
                }
            } else {
                match n.pitch {
                    Some(p) => groups.push(vec![(p.step, p.octave)]),
                    None => groups.push(Vec::new()),
                }
            }
        }
    }
    groups
}

/// Smallest divisions-per-quarter that expresses every duration of the
/// part exactly
fn part_divisions(staves: &[Vec<&Voice>], diags: &mut Diagnostics) -> i32 {
    let mut div: i64 = 1;
    for staff in staves {
        for voice in staff {
            for m in &voice.measures {
                for item in &m.items {
                    if let MeasureItem::Note(n) = item {
                        if !n.grace {
                            div = lcm_i64(div, n.dur.denom() as i64);
                        }
                    }
                }
            }
        }
    }
    if div > MAX_DIVISIONS {
        diags.warn(
            "divisions_capped",
            format!("durations need {} divisions per quarter; capping at {}", div, MAX_DIVISIONS),
        );
        div = MAX_DIVISIONS;
    }
    div as i32
}

fn lcm_i64(a: i64, b: i64) -> i64 {
    let mut x = a;
    let mut y = b;
    while y != 0 {
        let t = x % y;
        x = y;
        y = t;
    }
    (a / x.abs().max(1)) * b
}

/// Left/right barline plan for one measure, computed up front so volta
/// endings close in the right measure without backtracking
#[derive(Default)]
struct BarPlan {
    left_repeat: bool,
    ending_start: Option<String>,
    /// (number attribute, "stop" or "discontinue")
    ending_stop: Option<(String, &'static str)>,
}

fn plan_barlines(measures: &[Measure]) -> Vec<BarPlan> {
    let mut plans = Vec::with_capacity(measures.len());
    let mut open: Option<String> = None;
    for (i, m) in measures.iter().enumerate() {
        let left_repeat =
            i > 0 && matches!(measures[i - 1].right.kind, BarKind::RepeatStart | BarKind::RepeatBoth);
        let ending_start = m.volta.clone();
        if ending_start.is_some() {
            open = ending_start.clone();
        }
        let mut ending_stop = None;
        if let Some(label) = &open {
            let closes = matches!(m.right.kind, BarKind::RepeatEnd | BarKind::RepeatBoth);
            let next_starts = measures.get(i + 1).map_or(true, |n| n.volta.is_some());
            if closes {
                ending_stop = Some((ending_number(label), "stop"));
            } else if next_starts {
                // Last volta runs out without a repeat: open-ended bracket
                ending_stop = Some((ending_number(label), "discontinue"));
            }
        }
        if ending_stop.is_some() {
            open = None;
        }
        plans.push(BarPlan { left_repeat, ending_start, ending_stop });
    }
    plans
}

/// Expand a volta label ("1", "1,2", "1-3") into the comma list the
/// `ending` number attribute wants
fn ending_number(label: &str) -> String {
    let mut nums: Vec<String> = Vec::new();
    for part in label.split(',') {
        let part = part.trim();
        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<u32>(), b.trim().parse::<u32>()) {
                for n in a..=b {
                    nums.push(n.to_string());
                }
                continue;
            }
        }
        if !part.is_empty() {
            nums.push(part.to_string());
        }
    }
    if nums.is_empty() {
        label.to_string()
    } else {
        nums.join(",")
    }
}

/// Beam begin/continue/end per item index. Runs break on rests, on notes
/// a quarter or longer, and wherever the source had whitespace.
fn beam_states(measure: &Measure) -> HashMap<usize, &'static str> {
    fn flush(run: &mut Vec<usize>, map: &mut HashMap<usize, &'static str>) {
        if run.len() >= 2 {
            let last = run.len() - 1;
            for (k, &idx) in run.iter().enumerate() {
                let state = if k == 0 {
                    "begin"
                } else if k == last {
                    "end"
                } else {
                    "continue"
                };
                map.insert(idx, state);
            }
        }
        run.clear();
    }

    let mut map = HashMap::new();
    let mut run: Vec<usize> = Vec::new();
    for (ii, item) in measure.items.iter().enumerate() {
        let MeasureItem::Note(n) = item else { continue };
        if n.grace || n.chord_member {
            continue;
        }
        let eligible = !n.is_rest() && !n.dur.is_zero() && n.dur < Dur::from_int(1);
        if !eligible {
            flush(&mut run, &mut map);
            continue;
        }
        if n.beam_break {
            flush(&mut run, &mut map);
        }
        run.push(ii);
    }
    flush(&mut run, &mut map);
    map
}

fn frag(f: impl FnOnce(&mut XmlBuilder)) -> String {
    let mut b = XmlBuilder::new();
    f(&mut b);
    b.finish()
}

fn attr_divisions(d: i32) -> AttrChild {
    AttrChild {
        kind: AttrKind::Divisions,
        xml: frag(|b| b.leaf("divisions", &d.to_string())),
    }
}

fn attr_key(key: &Key) -> AttrChild {
    AttrChild {
        kind: AttrKind::Key,
        xml: frag(|b| {
            b.open("key");
            b.leaf("fifths", &key.fifths.to_string());
            b.leaf("mode", key.mode.xml_name());
            b.close("key");
        }),
    }
}

fn attr_time(ts: &TimeSig) -> AttrChild {
    AttrChild {
        kind: AttrKind::Time,
        xml: frag(|b| {
            match ts.symbol {
                Some(MeterSymbol::Common) => b.open_attrs("time", &[("symbol", "common")]),
                Some(MeterSymbol::Cut) => b.open_attrs("time", &[("symbol", "cut")]),
                None => b.open("time"),
            }
            b.leaf("beats", &ts.beats.to_string());
            b.leaf("beat-type", &ts.beat_type.to_string());
            b.close("time");
        }),
    }
}

fn attr_staves(n: u8) -> AttrChild {
    AttrChild {
        kind: AttrKind::Staves,
        xml: frag(|b| b.leaf("staves", &n.to_string())),
    }
}

fn attr_clef(clef: Clef, number: Option<u8>) -> AttrChild {
    let (sign, line, octave) = clef.xml_parts();
    AttrChild {
        kind: AttrKind::Clef,
        xml: frag(|b| {
            match number {
                Some(n) => b.open_attrs("clef", &[("number", &n.to_string())]),
                None => b.open("clef"),
            }
            b.leaf("sign", sign);
            b.leaf("line", &line.to_string());
            if octave != 0 {
                b.leaf("clef-octave-change", &octave.to_string());
            }
            b.close("clef");
        }),
    }
}

fn attr_tab_details(number: Option<u8>) -> AttrChild {
    AttrChild {
        kind: AttrKind::StaffDetails,
        xml: frag(|b| {
            match number {
                Some(n) => b.open_attrs("staff-details", &[("number", &n.to_string())]),
                None => b.open("staff-details"),
            }
            b.leaf("staff-lines", "6");
            for (i, (step, octave)) in TAB_TUNING.iter().enumerate() {
                b.open_attrs("staff-tuning", &[("line", &(i + 1).to_string())]);
                b.leaf("tuning-step", step.as_str());
                b.leaf("tuning-octave", &octave.to_string());
                b.close("staff-tuning");
            }
            b.close("staff-details");
        }),
    }
}

/// Render one `<part>` element, indented for the document root
pub(crate) fn render_part(
    plan: &PartPlan<'_>,
    tune: &Tune,
    first_part: bool,
    diags: &mut Diagnostics,
) -> String {
    let divisions = part_divisions(&plan.staves, diags);
    let staves_count = plan.staves.len() as u8;
    let ctx = PartCtx { divisions, staves: staves_count, part_id: &plan.id, tune };

    let mut voices: Vec<(u8, u8, &Voice)> = Vec::new();
    let mut number = 0u8;
    for (si, staff) in plan.staves.iter().enumerate() {
        for v in staff {
            number += 1;
            voices.push(((si + 1) as u8, number, v));
        }
    }

    let mut states: Vec<VoiceState> = voices
        .iter()
        .map(|&(staff, num, v)| VoiceState::new(staff, num, v, tune.key))
        .collect();
    let mut slurs = SlurAlloc::default();

    let lead: &[Measure] = voices
        .first()
        .map(|&(_, _, v)| v.measures.as_slice())
        .unwrap_or(&[]);
    let bar_plans = plan_barlines(lead);
    let n_measures = voices.iter().map(|&(_, _, v)| v.measures.len()).max().unwrap_or(0);
    // A tune opening with `|:` leaves an empty lead-in measure whose only
    // content is the repeat mark; the repeat lands on the next measure's
    // left barline instead
    let start = usize::from(
        lead.first()
            .is_some_and(|m| m.items.is_empty() && m.right.kind == BarKind::RepeatStart),
    );

    let mut b = XmlBuilder::with_depth(1);
    b.open_attrs("part", &[("id", &plan.id)]);
    let default_plan = BarPlan::default();
    for mi in start..n_measures {
        b.open_attrs("measure", &[("number", &(mi - start + 1).to_string())]);
        let bar_plan = bar_plans.get(mi).unwrap_or(&default_plan);
        emit_left_barline(&mut b, bar_plan);
        if mi == start {
            let mut children = vec![attr_divisions(divisions), attr_key(&tune.key)];
            if let Some(ts) = &tune.meter {
                children.push(attr_time(ts));
            }
            if staves_count > 1 {
                children.push(attr_staves(staves_count));
            }
            for (si, staff) in plan.staves.iter().enumerate() {
                let clef = staff.first().map(|v| v.clef).unwrap_or_default();
                let clef_no = (staves_count > 1).then(|| (si + 1) as u8);
                children.push(attr_clef(clef, clef_no));
                if clef == Clef::Tab {
                    children.push(attr_tab_details(clef_no));
                }
            }
            b.attributes(children);
            if first_part {
                if let Some(t) = &tune.tempo {
                    emit_tempo(&mut b, t);
                }
            }
        }
        let mut prev_dur: Option<i32> = None;
        for (vi, &(_, _, voice)) in voices.iter().enumerate() {
            let Some(measure) = voice.measures.get(mi) else { continue };
            if let Some(d) = prev_dur {
                if d > 0 {
                    b.open("backup");
                    b.leaf("duration", &d.to_string());
                    b.close("backup");
                }
            }
            render_voice_measure(
                &mut b,
                measure,
                voice,
                &mut states[vi],
                &ctx,
                vi == 0,
                &mut slurs,
                diags,
            );
            prev_dur = Some(measure.sounding_dur().in_divisions(divisions));
        }
        if let Some(m) = lead.get(mi) {
            emit_right_barline(&mut b, m, bar_plan, mi + 1 == n_measures);
        }
        b.close("measure");
    }
    b.close("part");

    for st in &states {
        if !st.open_ties.is_empty() || !st.incoming.is_empty() {
            diags.warn(
                "tie_unresolved",
                format!("voice {}: tie still open at the end of the voice", st.voice_id),
            );
        }
    }

    b.finish()
}

fn emit_left_barline(b: &mut XmlBuilder, plan: &BarPlan) {
    if !plan.left_repeat && plan.ending_start.is_none() {
        return;
    }
    b.open_attrs("barline", &[("location", "left")]);
    if plan.left_repeat {
        b.leaf("bar-style", "heavy-light");
    }
    if let Some(label) = &plan.ending_start {
        b.leaf_attrs(
            "ending",
            &[("number", &ending_number(label)), ("type", "start")],
            &format!("{}.", label),
        );
    }
    if plan.left_repeat {
        b.empty("repeat", &[("direction", "forward")]);
    }
    b.close("barline");
}

fn emit_right_barline(b: &mut XmlBuilder, m: &Measure, plan: &BarPlan, is_last: bool) {
    let style = match m.right.kind {
        BarKind::Single => is_last.then_some("light-heavy"),
        BarKind::Double => Some("light-light"),
        BarKind::Final => Some("light-heavy"),
        BarKind::HeavyThin => Some("heavy-light"),
        BarKind::RepeatEnd | BarKind::RepeatBoth => Some("light-heavy"),
        BarKind::RepeatStart => None,
        BarKind::Dotted => Some("dotted"),
        BarKind::Invisible => Some("none"),
    };
    let repeat = matches!(m.right.kind, BarKind::RepeatEnd | BarKind::RepeatBoth);
    if style.is_none() && plan.ending_stop.is_none() && !repeat {
        return;
    }
    b.open_attrs("barline", &[("location", "right")]);
    if let Some(s) = style {
        b.leaf("bar-style", s);
    }
    if let Some((num, kind)) = &plan.ending_stop {
        b.empty("ending", &[("number", num), ("type", kind)]);
    }
    if repeat {
        b.empty("repeat", &[("direction", "backward")]);
    }
    b.close("barline");
}

#[allow(clippy::too_many_arguments)]
fn render_voice_measure(
    b: &mut XmlBuilder,
    measure: &Measure,
    voice: &Voice,
    st: &mut VoiceState,
    ctx: &PartCtx<'_>,
    lead_voice: bool,
    slurs: &mut SlurAlloc,
    diags: &mut Diagnostics,
) {
    st.accidentals.clear();
    if let Some(tab) = st.tab.as_mut() {
        tab.reset();
    }
    sync_lyrics_measure(voice, st);
    let beams = beam_states(measure);

    for (ii, item) in measure.items.iter().enumerate() {
        match item {
            MeasureItem::Note(n) => {
                let mut closes: Vec<u8> = Vec::new();
                if !n.grace && !n.chord_member {
                    st.current = st.next_group;
                    st.next_group += 1;
                    if !st.incoming.is_empty() {
                        diags.warn(
                            "tie_unresolved",
                            format!("voice {}: tie target never matched", st.voice_id),
                        );
                        st.incoming.clear();
                    }
                    st.incoming = std::mem::take(&mut st.open_ties);
                    closes = std::mem::take(&mut st.converted_close);
                    if let Some(tab) = st.tab.as_mut() {
                        tab.advance(n.dur);
                    }
                    emit_note_directions(b, n);
                }
                emit_note(b, n, voice, st, ctx, beams.get(&ii).copied(), &closes, slurs, diags);
            }
            MeasureItem::ChordSymbol(text) => emit_harmony(b, text),
            MeasureItem::Annotation(text) => emit_words(b, text, "above"),
            MeasureItem::InlineField { code, value } => {
                handle_inline_field(b, *code, value, st, ctx, lead_voice, diags);
            }
            // Broken/tuplet/grace markers are resolved by post-processing
            _ => {}
        }
    }
}

fn handle_inline_field(
    b: &mut XmlBuilder,
    code: char,
    value: &str,
    st: &mut VoiceState,
    ctx: &PartCtx<'_>,
    lead_voice: bool,
    diags: &mut Diagnostics,
) {
    match code.to_ascii_uppercase() {
        'K' => {
            let mut children = Vec::new();
            if let Some(k) = Key::parse(value) {
                st.key = k;
                if lead_voice {
                    children.push(attr_key(&k));
                }
            }
            if lead_voice {
                if let Some(clef) = Clef::parse(value) {
                    let clef_no = (ctx.staves > 1).then_some(st.staff);
                    children.push(attr_clef(clef, clef_no));
                }
            }
            if !children.is_empty() {
                b.attributes(children);
            }
        }
        'M' => {
            if lead_voice {
                if let Some(ts) = TimeSig::parse(value) {
                    b.attributes(vec![attr_time(&ts)]);
                }
            }
        }
        'Q' => {
            if lead_voice {
                if let Some(t) = Tempo::parse(value) {
                    emit_tempo(b, &t);
                }
            }
        }
        // L: already folded into durations by the lexer
        'L' => {}
        _ => diags.info(
            "inline_field_skip",
            format!("inline [{}:{}] has no MusicXML counterpart; skipped", code, value),
        ),
    }
}

/// Direction-level decorations (dynamics, segno, coda, words) precede the
/// note element they attach to
fn emit_note_directions(b: &mut XmlBuilder, n: &Note) {
    for d in &n.decorations {
        match tables::lookup(d) {
            Some(Decoration::Dynamic(name)) => emit_dynamic(b, name),
            Some(Decoration::Segno) => emit_glyph(b, "segno"),
            Some(Decoration::Coda) => emit_glyph(b, "coda"),
            Some(Decoration::Words(w)) => emit_words(b, w, "above"),
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_note(
    b: &mut XmlBuilder,
    n: &Note,
    voice: &Voice,
    st: &mut VoiceState,
    ctx: &PartCtx<'_>,
    beam: Option<&'static str>,
    closes: &[u8],
    slurs: &mut SlurAlloc,
    diags: &mut Diagnostics,
) {
    let perc = voice.is_percussion();
    let mut tie_stop = false;
    let mut tie_start = false;
    let mut slur_from_tie: Option<u8> = None;
    let mut perc_map: Option<PercussionMapping> = None;

    if let Some(p) = n.pitch {
        let key = (p.step, p.octave);
        if !n.grace && st.incoming.remove(&key) {
            tie_stop = true;
        }
        if n.tie && !n.grace {
            match st.groups.get(st.current + 1) {
                Some(next) if next.contains(&key) => {
                    tie_start = true;
                    st.open_ties.insert(key);
                }
                Some(_) => {
                    let id = slurs.take();
                    slur_from_tie = Some(id);
                    st.converted_close.push(id);
                    diags.warn(
                        "tie_changed_pitch",
                        format!("tie from {} continues on a different pitch; converted to a slur", p),
                    );
                }
                None => diags.warn(
                    "tie_unresolved",
                    format!("tie from {} has no following note; dropped", p),
                ),
            }
        }
    }

    if n.pitch.is_none() && !n.visible {
        b.open_attrs("note", &[("print-object", "no")]);
    } else {
        b.open("note");
    }
    if n.grace {
        b.empty("grace", &[("slash", "yes")]);
    }
    if n.chord_member {
        b.empty("chord", &[]);
    }

    match n.pitch {
        Some(p) if perc => {
            let mapping = percussion_mapping(p, n.accidental, ctx, diags);
            b.open("unpitched");
            b.leaf("display-step", mapping.display_step.as_str());
            b.leaf("display-octave", &mapping.display_octave.to_string());
            b.close("unpitched");
            perc_map = Some(mapping);
        }
        Some(p) => {
            let alter = resolve_alter(n, p, st);
            b.open("pitch");
            b.leaf("step", p.step.as_str());
            if alter != 0 {
                b.leaf("alter", &alter.to_string());
            }
            b.leaf("octave", &(p.octave + voice.octave_shift).to_string());
            b.close("pitch");
        }
        None => b.empty("rest", &[]),
    }

    if !n.grace {
        b.leaf("duration", &n.dur.in_divisions(ctx.divisions).to_string());
    }
    if tie_stop {
        b.empty("tie", &[("type", "stop")]);
    }
    if tie_start {
        b.empty("tie", &[("type", "start")]);
    }
    if let Some(m) = &perc_map {
        b.empty("instrument", &[("id", &format!("{}-I{}", ctx.part_id, m.midi + 1))]);
    }
    b.leaf("voice", &st.number.to_string());

    // Display type comes from the written duration: inside a tuplet that
    // means undoing the q/p scaling
    let display = match n.tuplet {
        Some(t) => n.dur * Dur::new(t.p as i32, t.q as i32),
        None => n.dur,
    };
    // A rest with no exact type (whole-measure rest in odd meters) is
    // better shown without a type element
    let skip_type = n.is_rest() && display.note_type().is_none();
    if !display.is_zero() && !skip_type {
        let (name, dots, inexact) = display.approx_note_type();
        if inexact {
            diags.warn(
                "display_duration",
                format!("no exact note type for duration {}; showing {}", display, name),
            );
        }
        b.leaf("type", name);
        for _ in 0..dots {
            b.empty("dot", &[]);
        }
    }

    if !perc && n.pitch.is_some() {
        if let Some(w) = n.accidental {
            b.leaf("accidental", accidental_name(w));
        }
    }

    if let Some(t) = n.tuplet {
        b.open("time-modification");
        b.leaf("actual-notes", &t.p.to_string());
        b.leaf("normal-notes", &t.q.to_string());
        // Dotted members need the normal type spelled out
        let (name, dots, _) = display.approx_note_type();
        if dots > 0 {
            b.leaf("normal-type", name);
            for _ in 0..dots {
                b.empty("normal-dot", &[]);
            }
        }
        b.close("time-modification");
    }

    if let Some(m) = &perc_map {
        if let Some(head) = &m.notehead {
            b.leaf("notehead", head);
        }
    }

    if ctx.staves > 1 {
        b.leaf("staff", &st.staff.to_string());
    }
    if let Some(bm) = beam {
        b.leaf_attrs("beam", &[("number", "1")], bm);
    }

    let mut nb = XmlBuilder::new();
    if tie_stop {
        nb.empty("tied", &[("type", "stop")]);
    }
    if tie_start {
        nb.empty("tied", &[("type", "start")]);
    }
    for _ in 0..n.slur_ends {
        match st.slur_stack.pop() {
            Some(id) => {
                slurs.release(id);
                nb.empty("slur", &[("number", &id.to_string()), ("type", "stop")]);
            }
            None => diags.warn("slur_unmatched", "')' without an open slur; ignored"),
        }
    }
    for &id in closes {
        slurs.release(id);
        nb.empty("slur", &[("number", &id.to_string()), ("type", "stop")]);
    }
    for _ in 0..n.slur_starts {
        let id = slurs.take();
        st.slur_stack.push(id);
        nb.empty("slur", &[("number", &id.to_string()), ("type", "start")]);
    }
    if let Some(id) = slur_from_tie {
        nb.empty("slur", &[("number", &id.to_string()), ("type", "start")]);
    }
    if let Some(t) = n.tuplet {
        if t.start {
            nb.empty("tuplet", &[("type", "start")]);
        }
        if t.stop {
            nb.empty("tuplet", &[("type", "stop")]);
        }
    }

    let mut artics: Vec<&'static str> = Vec::new();
    let mut ornaments: Vec<&'static str> = Vec::new();
    let mut technical: Vec<String> = Vec::new();
    let mut fermata = false;
    for d in &n.decorations {
        match tables::lookup(d) {
            Some(Decoration::Articulation(e)) => artics.push(e),
            Some(Decoration::Ornament(e)) => ornaments.push(e),
            Some(Decoration::Technical(e)) => technical.push(format!("<{}/>", e)),
            Some(Decoration::Fermata) => fermata = true,
            // Direction-level decorations were emitted before the note
            Some(_) => {}
            None => diags.info("decoration_skip", format!("unknown decoration '{}'", d)),
        }
    }
    if let (Some(tab), Some(p)) = (st.tab.as_mut(), n.pitch) {
        if !n.grace {
            match tab.allocate(p.midi() + voice.octave_shift as i32 * 12) {
                Some((string, fret)) => {
                    technical.push(format!("<string>{}</string><fret>{}</fret>", string, fret))
                }
                None => diags.warn(
                    "tab_unplayable",
                    format!("{} does not fit on the tablature strings", p),
                ),
            }
        }
    }
    if fermata {
        nb.empty("fermata", &[]);
    }
    if !artics.is_empty() {
        nb.open("articulations");
        for a in artics {
            nb.empty(a, &[]);
        }
        nb.close("articulations");
    }
    if !ornaments.is_empty() {
        nb.open("ornaments");
        for o in ornaments {
            nb.empty(o, &[]);
        }
        nb.close("ornaments");
    }
    if !technical.is_empty() {
        nb.open("technical");
        for t in &technical {
            nb.raw(t);
        }
        nb.close("technical");
    }

    if !nb.is_empty() {
        b.open("notations");
        b.raw(&nb.finish());
        b.close("notations");
    }

    if !n.grace && !n.chord_member && !n.is_rest() {
        emit_lyrics(b, voice, st);
    }

    b.close("note");
}

/// Sounding alteration: an explicit accidental wins and enters the
/// measure table; otherwise earlier accidentals in the measure, then the
/// key signature
fn resolve_alter(n: &Note, p: Pitch, st: &mut VoiceState) -> i8 {
    let key = (p.step, p.octave);
    match n.accidental {
        Some(w) => {
            st.accidentals.insert(key, w);
            w
        }
        None => match st.accidentals.get(&key) {
            Some(&a) => a,
            None => st.key.alter_for(p.step),
        },
    }
}

fn accidental_name(alter: i8) -> &'static str {
    match alter {
        -2 => "flat-flat",
        -1 => "flat",
        1 => "sharp",
        2 => "double-sharp",
        _ => "natural",
    }
}

fn percussion_mapping(
    p: Pitch,
    accidental: Option<i8>,
    ctx: &PartCtx<'_>,
    diags: &mut Diagnostics,
) -> PercussionMapping {
    let key = p.abc_note(accidental);
    if let Some(m) = ctx.tune.percmap.get(&key) {
        return m.clone();
    }
    diags.warn(
        "percmap_missing",
        format!("no %%percmap entry for '{}'; using its written position", key),
    );
    PercussionMapping {
        display_step: p.step,
        display_octave: p.octave,
        midi: p.midi() - 1,
        notehead: None,
    }
}

/// All used percussion sounds of a part, midi number to written-note name,
/// for the part-list instrument declarations
pub(crate) fn percussion_instruments(plan: &PartPlan<'_>, tune: &Tune) -> BTreeMap<i32, String> {
    let mut out = BTreeMap::new();
    for staff in &plan.staves {
        for voice in staff {
            if !voice.is_percussion() {
                continue;
            }
            for m in &voice.measures {
                for item in &m.items {
                    if let MeasureItem::Note(n) = item {
                        if let Some(p) = n.pitch {
                            let key = p.abc_note(n.accidental);
                            let midi = tune
                                .percmap
                                .get(&key)
                                .map(|m| m.midi)
                                .unwrap_or_else(|| p.midi() - 1);
                            out.entry(midi).or_insert(key);
                        }
                    }
                }
            }
        }
    }
    out
}

fn sync_lyrics_measure(voice: &Voice, st: &mut VoiceState) {
    for (&verse, line) in &voice.lyrics {
        let pos = st.lyric_pos.entry(verse).or_insert(0);
        while matches!(line.get(*pos), Some(LyricToken::BarSync)) {
            *pos += 1;
        }
    }
}

fn emit_lyrics(b: &mut XmlBuilder, voice: &Voice, st: &mut VoiceState) {
    for (&verse, line) in &voice.lyrics {
        let pos = st.lyric_pos.entry(verse).or_insert(0);
        let Some(tok) = line.get(*pos) else { continue };
        match tok {
            // Behind on syllables; wait for the measure boundary
            LyricToken::BarSync => {}
            LyricToken::Skip | LyricToken::Extend => {
                *pos += 1;
            }
            LyricToken::Syllable { text, hyphen } => {
                *pos += 1;
                let prev = st.lyric_hyphen.get(&verse).copied().unwrap_or(false);
                let syllabic = match (prev, *hyphen) {
                    (false, false) => "single",
                    (false, true) => "begin",
                    (true, true) => "middle",
                    (true, false) => "end",
                };
                st.lyric_hyphen.insert(verse, *hyphen);
                let melisma = matches!(line.get(*pos), Some(LyricToken::Extend));
                b.open_attrs("lyric", &[("number", &verse.to_string())]);
                b.leaf("syllabic", syllabic);
                b.leaf("text", text);
                if melisma {
                    b.empty("extend", &[]);
                }
                b.close("lyric");
            }
        }
    }
}

fn emit_harmony(b: &mut XmlBuilder, text: &str) {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    let Some(root) = chars.next().and_then(Step::from_char) else {
        emit_words(b, trimmed, "above");
        return;
    };
    let rest: String = chars.collect();
    let (alter, rest) = if let Some(r) = rest.strip_prefix('#') {
        (1, r.to_string())
    } else if let Some(r) = rest.strip_prefix('b') {
        (-1, r.to_string())
    } else {
        (0, rest)
    };
    let (kind_text, bass) = match rest.split_once('/') {
        Some((k, bs)) => (k.to_string(), Some(bs.to_string())),
        None => (rest, None),
    };
    let (kind, keep_text) = chord_kind(&kind_text);

    b.open("harmony");
    b.open("root");
    b.leaf("root-step", root.as_str());
    if alter != 0 {
        b.leaf("root-alter", &alter.to_string());
    }
    b.close("root");
    if keep_text {
        b.leaf_attrs("kind", &[("text", &kind_text)], kind);
    } else {
        b.leaf("kind", kind);
    }
    if let Some(bass) = bass {
        let mut bc = bass.chars();
        if let Some(bstep) = bc.next().and_then(Step::from_char) {
            let balter = match bc.next() {
                Some('#') => 1,
                Some('b') => -1,
                _ => 0,
            };
            b.open("bass");
            b.leaf("bass-step", bstep.as_str());
            if balter != 0 {
                b.leaf("bass-alter", &balter.to_string());
            }
            b.close("bass");
        }
    }
    b.close("harmony");
}

/// Chord quality suffix to MusicXML kind. The bool asks for the original
/// text as the kind's display text.
fn chord_kind(text: &str) -> (&'static str, bool) {
    match text {
        "" => ("major", false),
        "m" | "min" | "-" => ("minor", false),
        "7" => ("dominant", false),
        "m7" | "min7" | "-7" => ("minor-seventh", false),
        "maj7" | "M7" => ("major-seventh", false),
        "6" => ("major-sixth", false),
        "m6" => ("minor-sixth", false),
        "9" => ("dominant-ninth", false),
        "dim" | "o" => ("diminished", false),
        "dim7" => ("diminished-seventh", false),
        "m7b5" => ("half-diminished", false),
        "aug" | "+" => ("augmented", false),
        "sus" | "sus4" => ("suspended-fourth", false),
        "sus2" => ("suspended-second", false),
        _ => ("other", true),
    }
}

fn emit_words(b: &mut XmlBuilder, text: &str, placement: &str) {
    b.open_attrs("direction", &[("placement", placement)]);
    b.open("direction-type");
    b.leaf("words", text);
    b.close("direction-type");
    b.close("direction");
}

fn emit_dynamic(b: &mut XmlBuilder, name: &str) {
    b.open_attrs("direction", &[("placement", "below")]);
    b.open("direction-type");
    b.open("dynamics");
    b.empty(name, &[]);
    b.close("dynamics");
    b.close("direction-type");
    b.close("direction");
}

fn emit_glyph(b: &mut XmlBuilder, tag: &str) {
    b.open("direction");
    b.open("direction-type");
    b.empty(tag, &[]);
    b.close("direction-type");
    b.close("direction");
}

fn emit_tempo(b: &mut XmlBuilder, tempo: &Tempo) {
    b.open_attrs("direction", &[("placement", "above")]);
    b.open("direction-type");
    if let Some(t) = &tempo.text {
        b.leaf("words", t);
    }
    if tempo.bpm > 0 {
        b.open("metronome");
        let (unit, dots, _) = tempo.unit.approx_note_type();
        b.leaf("beat-unit", unit);
        for _ in 0..dots {
            b.empty("beat-unit-dot", &[]);
        }
        b.leaf("per-minute", &tempo.bpm.to_string());
        b.close("metronome");
    }
    b.close("direction-type");
    if tempo.bpm > 0 {
        b.empty("sound", &[("tempo", &tempo.quarter_bpm().to_string())]);
    }
    b.close("direction");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Barline;

    #[test]
    fn test_ending_number_expansion() {
        assert_eq!(ending_number("1"), "1");
        assert_eq!(ending_number("1,2"), "1,2");
        assert_eq!(ending_number("1-3"), "1,2,3");
    }

    fn note(dur: Dur) -> Note {
        Note::new(dur, Some(Pitch::new(Step::C, 0, 4)))
    }

    #[test]
    fn test_beam_states_break_on_rest_and_space() {
        let mut broken = note(Dur::new(1, 2));
        broken.beam_break = true;
        let m = Measure {
            items: vec![
                MeasureItem::Note(note(Dur::new(1, 2))),
                MeasureItem::Note(note(Dur::new(1, 2))),
                MeasureItem::Note(Note::new(Dur::new(1, 2), None)),
                MeasureItem::Note(note(Dur::new(1, 2))),
                MeasureItem::Note(broken),
            ],
            ..Default::default()
        };
        let beams = beam_states(&m);
        assert_eq!(beams.get(&0), Some(&"begin"));
        assert_eq!(beams.get(&1), Some(&"end"));
        // The rest breaks the run; the pair after it is split by the
        // whitespace flag, so neither note beams
        assert_eq!(beams.get(&3), None);
        assert_eq!(beams.get(&4), None);
    }

    #[test]
    fn test_beam_states_quarter_breaks_run() {
        let m = Measure {
            items: vec![
                MeasureItem::Note(note(Dur::new(1, 2))),
                MeasureItem::Note(note(Dur::from_int(1))),
                MeasureItem::Note(note(Dur::new(1, 2))),
            ],
            ..Default::default()
        };
        let beams = beam_states(&m);
        assert!(beams.is_empty());
    }

    #[test]
    fn test_plan_barlines_volta_stop_and_discontinue() {
        let mut m1 = Measure::default();
        m1.volta = Some("1".into());
        m1.right = Barline { kind: BarKind::RepeatEnd, volta: None };
        let mut m2 = Measure::default();
        m2.volta = Some("2".into());
        m2.right = Barline { kind: BarKind::Final, volta: None };
        let plans = plan_barlines(&[m1, m2]);
        assert_eq!(plans[0].ending_stop, Some(("1".to_string(), "stop")));
        assert_eq!(plans[1].ending_start.as_deref(), Some("2"));
        // Last volta is open-ended
        assert_eq!(plans[1].ending_stop, Some(("2".to_string(), "discontinue")));
    }

    #[test]
    fn test_tab_allocator_prefers_high_strings() {
        let mut tab = TabState::default();
        tab.advance(Dur::from_int(1));
        // E4 = open first string
        assert_eq!(tab.allocate(64), Some((1, 0)));
        // Same moment: next E4 falls back to string 2 fret 5
        assert_eq!(tab.allocate(64), Some((2, 5)));
        // Below low E: unplayable
        assert_eq!(tab.allocate(30), None);
    }

    #[test]
    fn test_divisions_lcm() {
        let mut v = Voice::new("1");
        let m = Measure {
            items: vec![
                MeasureItem::Note(note(Dur::new(1, 2))),
                MeasureItem::Note(note(Dur::new(1, 3))),
            ],
            ..Default::default()
        };
        v.measures.push(m);
        let mut diags = Diagnostics::new();
        assert_eq!(part_divisions(&[vec![&v]], &mut diags), 6);
    }
}
