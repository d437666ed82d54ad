//! score-partwise document walker
//!
//! The importer mirrors the grammar's output contract: voices hold
//! measures of post-processed items (chords flattened behind a carrier,
//! grace notes flagged, tuplet membership stamped with sounding
//! durations), so the ABC renderer never needs to know which direction
//! the conversion ran.
//!
//! Voice routing ignores `<backup>`/`<forward>` arithmetic entirely: each
//! note names its `<voice>`, and notes of one voice arrive in time order
//! within it. Per-part state tracks divisions, open ties and pending
//! directions; barline data is collected per measure and applied to every
//! voice when the measure closes, so all voices of a part agree on repeat
//! and volta structure.

use std::collections::{BTreeMap, HashMap, HashSet};

use roxmltree::{Document, Node, ParsingOptions};

use crate::diagnostics::Diagnostics;
use crate::models::{
    BarKind, Barline, Clef, Dur, Key, LyricToken, Measure, MeasureItem, MeterSymbol, Mode, Note,
    PercussionMapping, Pitch, ScoreNode, Step, Tempo, TimeSig, Tune, TupletSpan, Voice,
};
use crate::musicxml::tables;

use super::ImportError;

/// Parse a MusicXML document into a [`Tune`]. Only `score-partwise` is
/// accepted; recoverable problems land in `diags`.
pub fn parse_score(xml: &str, diags: &mut Diagnostics) -> Result<Tune, ImportError> {
    // Published scores routinely carry the partwise DOCTYPE; our own
    // builder writes one too
    let opts = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(xml, opts)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "score-partwise" => {}
        "score-timewise" => {
            return Err(ImportError::Unsupported(
                "score-timewise scores are not supported; convert to score-partwise first".into(),
            ))
        }
        other => {
            return Err(ImportError::Unsupported(format!(
                "unexpected root element <{}>",
                other
            )))
        }
    }

    let mut tune = Tune {
        number: Some(1),
        unit: Dur::new(1, 2),
        ..Default::default()
    };
    tune.title = child_text(root, "movement-title").or_else(|| {
        child(root, "work").and_then(|w| child_text(w, "work-title"))
    });
    if let Some(ident) = child(root, "identification") {
        tune.composer = ident
            .children()
            .find(|c| c.has_tag_name("creator") && c.attribute("type") == Some("composer"))
            .and_then(|c| c.text())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }

    let entries = parse_part_list(root, diags);

    // Parse <part> bodies in document order (the first part fixes the
    // header key/meter), then install them in part-list order so voice
    // ids follow the printed score top to bottom.
    let mut header = HeaderCtx::default();
    let mut parsed: HashMap<String, ParsedPart> = HashMap::new();
    let mut part_order: Vec<String> = Vec::new();
    let fallback_meta = PartMeta::default();
    for part in root.children().filter(|n| n.has_tag_name("part")) {
        let id = part.attribute("id").unwrap_or("").to_string();
        let meta = entries
            .iter()
            .find_map(|e| match e {
                ListEntry::Part(m) if m.id == id => Some(m),
                _ => None,
            })
            .unwrap_or(&fallback_meta);
        let pp = parse_part(part, meta, &mut tune, &mut header, diags);
        part_order.push(id.clone());
        parsed.insert(id, pp);
    }

    let mut next_id = 1u32;
    let mut stack: Vec<Vec<ScoreNode>> = vec![Vec::new()];
    for entry in &entries {
        match entry {
            ListEntry::GroupStart => stack.push(Vec::new()),
            ListEntry::GroupStop => {
                if stack.len() > 1 {
                    if let Some(children) = stack.pop() {
                        if !children.is_empty() {
                            if let Some(top) = stack.last_mut() {
                                top.push(ScoreNode::Bracket(children));
                            }
                        }
                    }
                } else {
                    diags.warn("group_unmatched", "part-group stop without a matching start");
                }
            }
            ListEntry::Part(meta) => {
                let Some(pp) = parsed.remove(&meta.id) else {
                    diags.warn(
                        "part_missing",
                        format!("score-part '{}' has no matching <part>", meta.id),
                    );
                    continue;
                };
                if let Some(node) = install_part(pp, meta, &mut next_id, &mut tune) {
                    if let Some(top) = stack.last_mut() {
                        top.push(node);
                    }
                }
            }
        }
    }
    while stack.len() > 1 {
        diags.warn("group_unclosed", "part-group start without a matching stop");
        if let Some(children) = stack.pop() {
            if let Some(top) = stack.last_mut() {
                top.push(ScoreNode::Bracket(children));
            }
        }
    }
    for id in part_order {
        if let Some(pp) = parsed.remove(&id) {
            diags.warn(
                "part_unlisted",
                format!("<part id=\"{}\"> missing from the part-list", id),
            );
            if let Some(node) = install_part(pp, &fallback_meta, &mut next_id, &mut tune) {
                if let Some(top) = stack.last_mut() {
                    top.push(node);
                }
            }
        }
    }
    tune.layout = stack.pop().unwrap_or_default();

    // A flat list of single-voice parts carries no layout information;
    // dropping it keeps the ABC free of a redundant %%score line.
    let flat = tune.layout.iter().all(|n| matches!(n, ScoreNode::Voice(_)));
    if flat && tune.layout.len() == tune.voices.len() {
        tune.layout.clear();
    }
    Ok(tune)
}

/// Header fields are taken from the first part's first measure; later
/// occurrences become inline fields instead.
#[derive(Default)]
struct HeaderCtx {
    key_set: bool,
}

/// part-list entry, in document order
enum ListEntry {
    GroupStart,
    GroupStop,
    Part(PartMeta),
}

/// What the part-list says about one score-part
#[derive(Default)]
struct PartMeta {
    id: String,
    name: Option<String>,
    abbrev: Option<String>,
    midi_program: Option<u8>,
    midi_channel: Option<u8>,
    /// midi-unpitched per score-instrument id, stored zero-based
    unpitched: BTreeMap<String, i32>,
}

fn parse_part_list(root: Node, diags: &mut Diagnostics) -> Vec<ListEntry> {
    let mut entries = Vec::new();
    let Some(pl) = child(root, "part-list") else {
        diags.warn("part_list_missing", "document has no <part-list>");
        return entries;
    };
    for n in pl.children().filter(|c| c.is_element()) {
        match n.tag_name().name() {
            "part-group" => match n.attribute("type") {
                Some("start") => entries.push(ListEntry::GroupStart),
                Some("stop") => entries.push(ListEntry::GroupStop),
                _ => {}
            },
            "score-part" => {
                let mut meta = PartMeta {
                    id: n.attribute("id").unwrap_or("").to_string(),
                    name: child_text(n, "part-name"),
                    abbrev: child_text(n, "part-abbreviation"),
                    ..Default::default()
                };
                for mi in n.children().filter(|c| c.has_tag_name("midi-instrument")) {
                    let iid = mi.attribute("id").unwrap_or("").to_string();
                    if let Some(p) =
                        child_text(mi, "midi-program").and_then(|t| t.parse::<i32>().ok())
                    {
                        // MusicXML programs are 1-based, %%MIDI's are not
                        meta.midi_program = Some((p - 1).clamp(0, 127) as u8);
                    }
                    if let Some(c) =
                        child_text(mi, "midi-channel").and_then(|t| t.parse::<u8>().ok())
                    {
                        meta.midi_channel = Some(c);
                    }
                    if let Some(u) =
                        child_text(mi, "midi-unpitched").and_then(|t| t.parse::<i32>().ok())
                    {
                        meta.unpitched.insert(iid.clone(), u - 1);
                    }
                }
                entries.push(ListEntry::Part(meta));
            }
            _ => {}
        }
    }
    entries
}

/// One parsed part before voice ids are assigned: voices grouped by
/// staff, staves top to bottom
struct ParsedPart {
    staves: Vec<Vec<Voice>>,
}

/// Accumulator for one `<voice>` stream within a part
#[derive(Default)]
struct VoiceAcc {
    staff: u8,
    measures: Vec<Measure>,
    items: Vec<MeasureItem>,
    lyrics: BTreeMap<u8, Vec<LyricToken>>,
    melisma: BTreeMap<u8, bool>,
    /// Sounding (non-grace, non-member) notes seen, for late-verse prefill
    carriers: usize,
    has_unpitched: bool,
}

struct PartState {
    divisions: i32,
    /// Voice keys in first-seen order
    vorder: Vec<String>,
    voices: HashMap<String, VoiceAcc>,
    staff_clefs: BTreeMap<u8, Clef>,
    /// Measures closed so far
    closed: usize,
    /// (voice, step, octave) of ties started but not yet stopped
    open_ties: HashSet<(String, Step, i8)>,
    /// Dynamics/segno/coda from directions, attached to the next note
    pending_decos: Vec<String>,
    /// Element names already reported as skipped
    reported: HashSet<String>,
}

impl PartState {
    fn new() -> Self {
        PartState {
            divisions: 1,
            vorder: Vec::new(),
            voices: HashMap::new(),
            staff_clefs: BTreeMap::new(),
            closed: 0,
            open_ties: HashSet::new(),
            pending_decos: Vec::new(),
            reported: HashSet::new(),
        }
    }
}

/// Barline facts collected while walking one measure
#[derive(Default)]
struct BarInfo {
    forward: bool,
    backward: bool,
    ending_start: Option<String>,
    style: Option<BarKind>,
}

fn parse_part(
    part: Node,
    meta: &PartMeta,
    tune: &mut Tune,
    header: &mut HeaderCtx,
    diags: &mut Diagnostics,
) -> ParsedPart {
    let mut st = PartState::new();
    for measure in part.children().filter(|n| n.has_tag_name("measure")) {
        let mut bar = BarInfo::default();
        for item in measure.children().filter(|n| n.is_element()) {
            match item.tag_name().name() {
                "attributes" => handle_attributes(item, &mut st, tune, header, diags),
                "note" => handle_note(item, &mut st, meta, tune, diags),
                "backup" => {}
                "forward" => handle_forward(item, &mut st, diags),
                "direction" => handle_direction(item, &mut st, tune, diags),
                "harmony" => {
                    if let Some(text) = harmony_text(item) {
                        push_lead_item(&mut st, MeasureItem::ChordSymbol(text));
                    }
                }
                "barline" => collect_barline(item, &mut bar),
                "sound" => {
                    if let Some(bpm) = item.attribute("tempo").and_then(|t| t.parse::<f32>().ok())
                    {
                        if tune.tempo.is_none() && st.closed == 0 {
                            tune.tempo = Some(Tempo {
                                unit: Dur::from_int(1),
                                bpm: bpm.round() as i32,
                                text: None,
                            });
                        }
                    }
                }
                "print" => {
                    if item.attribute("new-system") == Some("yes") && st.closed > 0 {
                        for key in st.vorder.clone() {
                            if let Some(vb) = st.voices.get_mut(&key) {
                                if let Some(prev) = vb.measures.last_mut() {
                                    prev.line_break_after = true;
                                }
                            }
                        }
                    }
                }
                other => report_once(&mut st, diags, "element_skip", other),
            }
        }
        close_measure(&mut st, bar);
    }
    for (voice, step, octave) in &st.open_ties {
        diags.warn(
            "tie_unresolved",
            format!("voice {}: tie from {}{} never closed", voice, step.as_str(), octave),
        );
    }
    finish_part(st)
}

fn ensure_voice<'s>(st: &'s mut PartState, key: &str, staff: u8) -> &'s mut VoiceAcc {
    if !st.voices.contains_key(key) {
        // Backfill with the lead voice's barline history so all voices
        // of the part stay measure-aligned
        let template: Vec<Measure> = st
            .vorder
            .first()
            .and_then(|k| st.voices.get(k))
            .map(|lead| {
                lead.measures
                    .iter()
                    .map(|m| Measure {
                        right: m.right.clone(),
                        volta: m.volta.clone(),
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        st.vorder.push(key.to_string());
        st.voices.insert(
            key.to_string(),
            VoiceAcc { staff, measures: template, ..Default::default() },
        );
    }
    st.voices.entry(key.to_string()).or_default()
}

fn push_lead_item(st: &mut PartState, item: MeasureItem) {
    let key = st.vorder.first().cloned().unwrap_or_else(|| "1".to_string());
    ensure_voice(st, &key, 1).items.push(item);
}

fn report_once(st: &mut PartState, diags: &mut Diagnostics, kind: &str, name: &str) {
    if st.reported.insert(format!("{}:{}", kind, name)) {
        diags.info(kind.to_string(), format!("<{}> has no ABC equivalent, skipped", name));
    }
}

fn handle_attributes(
    node: Node,
    st: &mut PartState,
    tune: &mut Tune,
    header: &mut HeaderCtx,
    diags: &mut Diagnostics,
) {
    for el in node.children().filter(|c| c.is_element()) {
        match el.tag_name().name() {
            "divisions" => {
                if let Some(d) = el.text().and_then(|t| t.trim().parse::<i32>().ok()) {
                    if d > 0 {
                        st.divisions = d;
                    }
                }
            }
            "key" => {
                let fifths =
                    child_text(el, "fifths").and_then(|t| t.parse::<i8>().ok()).unwrap_or(0);
                let mode =
                    child_text(el, "mode").as_deref().map(mode_from_xml).unwrap_or(Mode::Major);
                let k = Key { fifths, mode };
                if !header.key_set {
                    tune.key = k;
                    header.key_set = true;
                } else if !(st.closed == 0 && k == tune.key) {
                    for key in st.vorder.clone() {
                        if let Some(vb) = st.voices.get_mut(&key) {
                            vb.items.push(MeasureItem::InlineField {
                                code: 'K',
                                value: k.abc_text(),
                            });
                        }
                    }
                }
            }
            "time" => {
                let beats =
                    child_text(el, "beats").and_then(|t| t.parse::<i32>().ok()).unwrap_or(4);
                let beat_type =
                    child_text(el, "beat-type").and_then(|t| t.parse::<i32>().ok()).unwrap_or(4);
                let symbol = match el.attribute("symbol") {
                    Some("common") => Some(MeterSymbol::Common),
                    Some("cut") => Some(MeterSymbol::Cut),
                    _ => None,
                };
                let ts = TimeSig { beats, beat_type, symbol };
                if tune.meter.is_none() && st.closed == 0 {
                    tune.meter = Some(ts);
                } else if !(st.closed == 0 && tune.meter == Some(ts)) {
                    for key in st.vorder.clone() {
                        if let Some(vb) = st.voices.get_mut(&key) {
                            vb.items.push(MeasureItem::InlineField {
                                code: 'M',
                                value: ts.abc_text(),
                            });
                        }
                    }
                }
            }
            "clef" => {
                let staff_no =
                    el.attribute("number").and_then(|t| t.parse::<u8>().ok()).unwrap_or(1);
                let sign = child_text(el, "sign").unwrap_or_else(|| "G".to_string());
                let line = child_text(el, "line")
                    .and_then(|t| t.parse::<i32>().ok())
                    .unwrap_or_else(|| default_clef_line(&sign));
                let oc = child_text(el, "clef-octave-change")
                    .and_then(|t| t.parse::<i8>().ok())
                    .unwrap_or(0);
                let clef = clef_from_xml(&sign, line, oc);
                if st.closed > 0 {
                    for key in st.vorder.clone() {
                        if let Some(vb) = st.voices.get_mut(&key) {
                            if vb.staff == staff_no {
                                vb.items.push(MeasureItem::InlineField {
                                    code: 'K',
                                    value: format!("clef={}", clef.abc_name()),
                                });
                            }
                        }
                    }
                }
                st.staff_clefs.entry(staff_no).or_insert(clef);
            }
            // Staff count is implied by <staff> children on notes
            "staves" | "staff-details" | "transpose" => {}
            other => report_once(st, diags, "attribute_skip", other),
        }
    }
}

fn handle_note(
    node: Node,
    st: &mut PartState,
    meta: &PartMeta,
    tune: &mut Tune,
    diags: &mut Diagnostics,
) {
    let voice_key = child_text(node, "voice").unwrap_or_else(|| "1".to_string());
    let staff = child_text(node, "staff").and_then(|t| t.parse::<u8>().ok()).unwrap_or(1);
    let grace = child(node, "grace").is_some();
    let chord_member = child(node, "chord").is_some();

    let mut pitch: Option<Pitch> = None;
    let mut unpitched = false;
    if let Some(p) = child(node, "pitch") {
        let step = child_text(p, "step")
            .and_then(|t| t.chars().next())
            .and_then(Step::from_char)
            .unwrap_or(Step::C);
        let alter = child_text(p, "alter")
            .and_then(|t| t.parse::<f32>().ok())
            .map(|a| a.round() as i8)
            .unwrap_or(0);
        let octave = child_text(p, "octave").and_then(|t| t.parse::<i8>().ok()).unwrap_or(4);
        pitch = Some(Pitch::new(step, alter, octave));
    } else if let Some(u) = child(node, "unpitched") {
        let step = child_text(u, "display-step")
            .and_then(|t| t.chars().next())
            .and_then(Step::from_char)
            .unwrap_or(Step::G);
        let octave =
            child_text(u, "display-octave").and_then(|t| t.parse::<i8>().ok()).unwrap_or(5);
        pitch = Some(Pitch::new(step, 0, octave));
        unpitched = true;
    } else if child(node, "rest").is_none() {
        diags.warn("note_skip", "note with no pitch, rest or unpitched content skipped");
        return;
    }

    let dur = if grace {
        child_text(node, "type").as_deref().and_then(type_dur).unwrap_or(Dur::new(1, 2))
    } else if let Some(d) = child_text(node, "duration").and_then(|t| t.parse::<i32>().ok()) {
        Dur::new(d, st.divisions)
    } else {
        diags.warn("duration_missing", "note without a duration, using its display type");
        child_text(node, "type").as_deref().and_then(type_dur).unwrap_or(Dur::new(1, 2))
    };

    let mut note = Note::new(dur, pitch);
    note.grace = grace;
    note.chord_member = chord_member;
    if pitch.is_none() && node.attribute("print-object") == Some("no") {
        note.visible = false;
    }
    if let Some(text) = child_text(node, "accidental") {
        note.accidental = accidental_alter(&text);
    }

    for t in node.children().filter(|c| c.has_tag_name("tie")) {
        match t.attribute("type") {
            Some("start") => note.tie = true,
            Some("stop") => {
                if let Some(p) = pitch {
                    st.open_ties.remove(&(voice_key.clone(), p.step, p.octave));
                }
            }
            _ => {}
        }
    }
    if note.tie {
        if let Some(p) = pitch {
            st.open_ties.insert((voice_key.clone(), p.step, p.octave));
        }
    }

    if let Some(notations) = child(node, "notations") {
        for n in notations.children().filter(|c| c.is_element()) {
            match n.tag_name().name() {
                "slur" => match n.attribute("type") {
                    Some("start") => note.slur_starts += 1,
                    Some("stop") => note.slur_ends += 1,
                    _ => {}
                },
                // <tie> and <time-modification> already carry these
                "tied" | "tuplet" => {}
                "fermata" => note.decorations.push("fermata".to_string()),
                "articulations" | "ornaments" | "technical" => {
                    for d in n.children().filter(|c| c.is_element()) {
                        let name = d.tag_name().name();
                        match tables::from_xml(name) {
                            Some(deco) => note.decorations.push(deco.to_string()),
                            None => report_once(st, diags, "notation_skip", name),
                        }
                    }
                }
                "dynamics" => {
                    for d in n.children().filter(|c| c.is_element()) {
                        note.decorations.push(d.tag_name().name().to_string());
                    }
                }
                other => report_once(st, diags, "notation_skip", other),
            }
        }
    }

    // Tuplet membership; start/stop flags are filled in per run once the
    // part is done
    if let Some(tm) = child(node, "time-modification") {
        let p = child_text(tm, "actual-notes").and_then(|t| t.parse::<u8>().ok()).unwrap_or(1);
        let q = child_text(tm, "normal-notes").and_then(|t| t.parse::<u8>().ok()).unwrap_or(1);
        if p > 1 {
            note.tuplet = Some(TupletSpan { p, q, start: false, stop: false });
        }
    }

    if unpitched {
        if let Some(p) = pitch {
            let iid = child(node, "instrument").and_then(|i| i.attribute("id")).unwrap_or("");
            let midi = meta
                .unpitched
                .get(iid)
                .copied()
                .or_else(|| meta.unpitched.values().next().copied())
                .unwrap_or_else(|| {
                    diags.warn(
                        "percmap_missing",
                        format!("no midi-unpitched for instrument '{}', using acoustic snare", iid),
                    );
                    38
                });
            let notehead = child_text(node, "notehead").filter(|t| t != "normal");
            tune.percmap.entry(p.abc_note(None)).or_insert(PercussionMapping {
                display_step: p.step,
                display_octave: p.octave,
                midi,
                notehead,
            });
        }
    }

    // Lyrics align to sounding pitched notes; rests carry no syllable
    let sings = !grace && !chord_member && pitch.is_some();
    let lyrics: Vec<ParsedLyric> = if sings {
        node.children().filter(|c| c.has_tag_name("lyric")).map(parse_lyric).collect()
    } else {
        Vec::new()
    };
    let mut decos = if !grace && !chord_member {
        std::mem::take(&mut st.pending_decos)
    } else {
        Vec::new()
    };

    let vb = ensure_voice(st, &voice_key, staff);
    if unpitched {
        vb.has_unpitched = true;
    }
    if !decos.is_empty() {
        decos.extend(note.decorations);
        note.decorations = decos;
    }
    if chord_member {
        attach_chord_member(&mut vb.items, pitch);
    }
    if sings {
        apply_lyrics(vb, &lyrics);
    }
    vb.items.push(MeasureItem::Note(note));
}

/// Record a chord member's pitch on its carrier (the nearest preceding
/// non-member note)
fn attach_chord_member(items: &mut [MeasureItem], pitch: Option<Pitch>) {
    for item in items.iter_mut().rev() {
        if let MeasureItem::Note(n) = item {
            if !n.chord_member {
                if let (Some(cp), Some(mp)) = (n.pitch, pitch) {
                    if n.chord_pitches.is_empty() {
                        n.chord_pitches.push(cp);
                    }
                    n.chord_pitches.push(mp);
                }
                return;
            }
        }
    }
}

/// (verse, syllable text, hyphen follows, melisma extends)
type ParsedLyric = (u8, Option<String>, bool, bool);

fn parse_lyric(node: Node) -> ParsedLyric {
    let verse = node.attribute("number").and_then(|t| t.parse::<u8>().ok()).unwrap_or(1);
    let mut text: Option<String> = None;
    let mut hyphen = false;
    let mut extend = false;
    for c in node.children().filter(|c| c.is_element()) {
        match c.tag_name().name() {
            "text" => {
                let t = c.text().unwrap_or("").to_string();
                match &mut text {
                    Some(existing) => existing.push_str(&t),
                    None => text = Some(t),
                }
            }
            "syllabic" => hyphen = matches!(c.text().unwrap_or(""), "begin" | "middle"),
            "extend" => extend = true,
            // Two syllables under one note join with ~ in ABC
            "elision" => {
                if let Some(existing) = &mut text {
                    existing.push('~');
                }
            }
            _ => {}
        }
    }
    (verse, text, hyphen, extend)
}

/// Advance every verse of the voice by one sounding note
fn apply_lyrics(vb: &mut VoiceAcc, lyrics: &[ParsedLyric]) {
    for (verse, ..) in lyrics {
        if !vb.lyrics.contains_key(verse) {
            // Verse discovered mid-part: pad what it missed
            vb.lyrics.insert(*verse, vec![LyricToken::Skip; vb.carriers]);
            vb.melisma.insert(*verse, false);
        }
    }
    let verses: Vec<u8> = vb.lyrics.keys().copied().collect();
    for verse in verses {
        let entry = lyrics.iter().find(|(v, ..)| *v == verse);
        let token = match entry {
            Some((_, Some(text), hyphen, extend)) => {
                vb.melisma.insert(verse, *extend);
                LyricToken::Syllable { text: text.clone(), hyphen: *hyphen }
            }
            // A bare <extend/> continues the melisma
            Some((_, None, _, _)) => LyricToken::Extend,
            None => {
                if vb.melisma.get(&verse).copied().unwrap_or(false) {
                    LyricToken::Extend
                } else {
                    LyricToken::Skip
                }
            }
        };
        if let Some(line) = vb.lyrics.get_mut(&verse) {
            line.push(token);
        }
    }
    vb.carriers += 1;
}

fn handle_forward(node: Node, st: &mut PartState, diags: &mut Diagnostics) {
    let Some(d) = child_text(node, "duration").and_then(|t| t.parse::<i32>().ok()) else {
        return;
    };
    match child_text(node, "voice") {
        Some(v) => {
            let divisions = st.divisions;
            let mut rest = Note::new(Dur::new(d, divisions), None);
            rest.visible = false;
            ensure_voice(st, &v, 1).items.push(MeasureItem::Note(rest));
        }
        None => diags.info(
            "forward_skip",
            "voiceless <forward> skipped; positions are taken from voice content",
        ),
    }
}

fn handle_direction(node: Node, st: &mut PartState, tune: &mut Tune, diags: &mut Diagnostics) {
    let mut words: Option<String> = None;
    let mut metronome: Option<(Dur, i32)> = None;
    for dt in node.children().filter(|c| c.has_tag_name("direction-type")) {
        for el in dt.children().filter(|c| c.is_element()) {
            match el.tag_name().name() {
                "dynamics" => {
                    for d in el.children().filter(|c| c.is_element()) {
                        st.pending_decos.push(d.tag_name().name().to_string());
                    }
                }
                "segno" => st.pending_decos.push("segno".to_string()),
                "coda" => st.pending_decos.push("coda".to_string()),
                "words" => {
                    if let Some(t) =
                        el.text().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
                    {
                        words = Some(t);
                    }
                }
                "metronome" => {
                    let unit = child_text(el, "beat-unit")
                        .as_deref()
                        .and_then(type_dur)
                        .unwrap_or(Dur::from_int(1));
                    let unit = if el.children().any(|c| c.has_tag_name("beat-unit-dot")) {
                        unit * Dur::new(3, 2)
                    } else {
                        unit
                    };
                    let bpm = child_text(el, "per-minute")
                        .and_then(|t| t.trim().parse::<i32>().ok())
                        .unwrap_or(0);
                    if bpm > 0 {
                        metronome = Some((unit, bpm));
                    }
                }
                other => report_once(st, diags, "direction_skip", other),
            }
        }
    }
    if let Some((unit, bpm)) = metronome {
        let tempo = Tempo { unit, bpm, text: words.take() };
        if tune.tempo.is_none() && st.closed == 0 {
            tune.tempo = Some(tempo);
        } else {
            push_lead_item(st, MeasureItem::InlineField { code: 'Q', value: tempo.abc_text() });
        }
    } else if let Some(sound) = child(node, "sound") {
        if let Some(bpm) = sound.attribute("tempo").and_then(|t| t.parse::<f32>().ok()) {
            if tune.tempo.is_none() && st.closed == 0 {
                tune.tempo = Some(Tempo {
                    unit: Dur::from_int(1),
                    bpm: bpm.round() as i32,
                    text: words.take(),
                });
            }
        }
    }
    if let Some(text) = words {
        push_lead_item(st, MeasureItem::Annotation(text));
    }
}

/// Rebuild the annotation text of a chord symbol ("Gm7", "F/A")
fn harmony_text(node: Node) -> Option<String> {
    let root = child(node, "root")?;
    let mut text = child_text(root, "root-step")?;
    match child_text(root, "root-alter").and_then(|t| t.parse::<f32>().ok()).map(|a| a.round() as i32)
    {
        Some(a) if a >= 1 => text.push('#'),
        Some(a) if a <= -1 => text.push('b'),
        _ => {}
    }
    if let Some(kind) = child(node, "kind") {
        let value = kind.text().unwrap_or("").trim();
        match kind_suffix(value) {
            Some(s) => text.push_str(s),
            None => {
                if let Some(t) = kind.attribute("text") {
                    text.push_str(t);
                }
            }
        }
    }
    if let Some(bass) = child(node, "bass") {
        if let Some(bs) = child_text(bass, "bass-step") {
            text.push('/');
            text.push_str(&bs);
            match child_text(bass, "bass-alter")
                .and_then(|t| t.parse::<f32>().ok())
                .map(|a| a.round() as i32)
            {
                Some(a) if a >= 1 => text.push('#'),
                Some(a) if a <= -1 => text.push('b'),
                _ => {}
            }
        }
    }
    Some(text)
}

fn collect_barline(node: Node, bar: &mut BarInfo) {
    if let Some(style) = child_text(node, "bar-style") {
        // Left-side styles only matter through their repeat/ending data
        if node.attribute("location").unwrap_or("right") == "right" {
            bar.style = bar_kind_from_style(&style);
        }
    }
    for c in node.children().filter(|c| c.is_element()) {
        match c.tag_name().name() {
            "repeat" => match c.attribute("direction") {
                Some("forward") => bar.forward = true,
                Some("backward") => bar.backward = true,
                _ => {}
            },
            "ending" => {
                if c.attribute("type") == Some("start") {
                    bar.ending_start = c.attribute("number").map(|s| s.to_string());
                }
            }
            _ => {}
        }
    }
}

/// Close the current measure for every voice of the part
fn close_measure(st: &mut PartState, bar: BarInfo) {
    if st.vorder.is_empty() {
        ensure_voice(st, "1", 1);
    }
    if bar.forward {
        // A forward repeat belongs to the previous measure's right bar in
        // ABC terms; with no previous measure an empty lead measure
        // carries it, mirroring how the grammar reads a leading |:
        let lead_empty = st
            .vorder
            .first()
            .and_then(|k| st.voices.get(k))
            .map(|v| v.measures.is_empty())
            .unwrap_or(false);
        for key in st.vorder.clone() {
            if let Some(vb) = st.voices.get_mut(&key) {
                match vb.measures.last_mut() {
                    Some(prev) => {
                        prev.right.kind = match prev.right.kind {
                            BarKind::RepeatEnd => BarKind::RepeatBoth,
                            BarKind::Single => BarKind::RepeatStart,
                            k => k,
                        };
                    }
                    None => vb.measures.push(Measure {
                        right: Barline { kind: BarKind::RepeatStart, volta: None },
                        ..Default::default()
                    }),
                }
            }
        }
        if lead_empty {
            st.closed += 1;
        }
    }
    let kind = if bar.backward { BarKind::RepeatEnd } else { bar.style.unwrap_or_default() };
    for key in st.vorder.clone() {
        if let Some(vb) = st.voices.get_mut(&key) {
            vb.measures.push(Measure {
                items: std::mem::take(&mut vb.items),
                right: Barline { kind, volta: None },
                volta: bar.ending_start.clone(),
                line_break_after: false,
            });
        }
    }
    st.closed += 1;
    // Directions do not carry across barlines
    st.pending_decos.clear();
}

fn finish_part(mut st: PartState) -> ParsedPart {
    for key in st.vorder.clone() {
        if let Some(vb) = st.voices.get_mut(&key) {
            mark_tuplet_runs(&mut vb.measures);
            for line in vb.lyrics.values_mut() {
                while matches!(line.last(), Some(LyricToken::Skip)) {
                    line.pop();
                }
            }
        }
    }
    let mut staves: Vec<(u8, Vec<String>)> = Vec::new();
    for key in &st.vorder {
        let staff = st.voices.get(key).map(|v| v.staff).unwrap_or(1);
        match staves.iter_mut().find(|(s, _)| *s == staff) {
            Some((_, keys)) => keys.push(key.clone()),
            None => staves.push((staff, vec![key.clone()])),
        }
    }
    staves.sort_by_key(|(s, _)| *s);
    let mut out = Vec::new();
    for (staff, keys) in staves {
        let mut group = Vec::new();
        for key in keys {
            let Some(vb) = st.voices.remove(&key) else { continue };
            let mut v = Voice::new("");
            v.clef = st.staff_clefs.get(&staff).copied().unwrap_or(if vb.has_unpitched {
                Clef::Percussion
            } else {
                Clef::Treble
            });
            v.measures = vb.measures;
            v.lyrics = vb.lyrics.into_iter().filter(|(_, l)| !l.is_empty()).collect();
            group.push(v);
        }
        if !group.is_empty() {
            out.push(group);
        }
    }
    ParsedPart { staves: out }
}

/// Stamp tuplet start/stop flags onto runs of equal-ratio notes
fn mark_tuplet_runs(measures: &mut [Measure]) {
    for m in measures {
        let mut run: Vec<usize> = Vec::new();
        let mut run_pq: Option<(u8, u8)> = None;
        for i in 0..m.items.len() {
            let info = match &m.items[i] {
                MeasureItem::Note(n) if !n.chord_member && !n.grace => {
                    Some(n.tuplet.map(|t| (t.p, t.q)))
                }
                _ => None,
            };
            match info {
                Some(Some(pq)) => {
                    if run_pq.is_some() && run_pq != Some(pq) {
                        flag_run(m, &run);
                        run.clear();
                    }
                    run_pq = Some(pq);
                    run.push(i);
                }
                Some(None) => {
                    flag_run(m, &run);
                    run.clear();
                    run_pq = None;
                }
                None => {}
            }
        }
        flag_run(m, &run);
    }
}

fn flag_run(m: &mut Measure, run: &[usize]) {
    let (Some(&first), Some(&last)) = (run.first(), run.last()) else {
        return;
    };
    if let Some(MeasureItem::Note(n)) = m.items.get_mut(first) {
        if let Some(t) = &mut n.tuplet {
            t.start = true;
        }
    }
    if let Some(MeasureItem::Note(n)) = m.items.get_mut(last) {
        if let Some(t) = &mut n.tuplet {
            t.stop = true;
        }
    }
}

/// Assign voice ids, push the voices into the tune and return the part's
/// layout node
fn install_part(
    parsed: ParsedPart,
    meta: &PartMeta,
    next_id: &mut u32,
    tune: &mut Tune,
) -> Option<ScoreNode> {
    let mut staff_nodes = Vec::new();
    let mut first = true;
    for group in parsed.staves {
        let mut ids = Vec::new();
        for mut v in group {
            let id = next_id.to_string();
            *next_id += 1;
            v.id = id.clone();
            if first {
                v.name = meta.name.clone();
                v.subname = meta.abbrev.clone();
                v.midi_program = meta.midi_program;
                v.midi_channel = meta.midi_channel;
                first = false;
            }
            ids.push(id);
            tune.voices.push(v);
        }
        match ids.len() {
            0 => {}
            1 => {
                if let Some(id) = ids.pop() {
                    staff_nodes.push(ScoreNode::Voice(id));
                }
            }
            _ => staff_nodes.push(ScoreNode::Overlay(ids)),
        }
    }
    match staff_nodes.len() {
        0 => None,
        1 => staff_nodes.pop(),
        _ => Some(ScoreNode::Brace(staff_nodes)),
    }
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|c| c.has_tag_name(name))
}

fn child_text(node: Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn accidental_alter(text: &str) -> Option<i8> {
    match text {
        "sharp" | "natural-sharp" => Some(1),
        "flat" | "natural-flat" => Some(-1),
        "natural" => Some(0),
        "double-sharp" | "sharp-sharp" => Some(2),
        "flat-flat" => Some(-2),
        _ => None,
    }
}

/// Quarter-note value of a display type name
fn type_dur(name: &str) -> Option<Dur> {
    let d = match name {
        "breve" => Dur::from_int(8),
        "whole" => Dur::from_int(4),
        "half" => Dur::from_int(2),
        "quarter" => Dur::from_int(1),
        "eighth" => Dur::new(1, 2),
        "16th" => Dur::new(1, 4),
        "32nd" => Dur::new(1, 8),
        "64th" => Dur::new(1, 16),
        "128th" => Dur::new(1, 32),
        "256th" => Dur::new(1, 64),
        _ => return None,
    };
    Some(d)
}

fn mode_from_xml(text: &str) -> Mode {
    match text {
        "minor" => Mode::Minor,
        "dorian" => Mode::Dorian,
        "phrygian" => Mode::Phrygian,
        "lydian" => Mode::Lydian,
        "mixolydian" => Mode::Mixolydian,
        "locrian" => Mode::Locrian,
        _ => Mode::Major,
    }
}

fn default_clef_line(sign: &str) -> i32 {
    match sign {
        "F" => 4,
        "C" => 3,
        _ => 2,
    }
}

fn clef_from_xml(sign: &str, line: i32, octave_change: i8) -> Clef {
    match (sign, octave_change) {
        ("G", -1) => Clef::TrebleDown8,
        ("G", _) => Clef::Treble,
        ("F", -1) => Clef::BassDown8,
        ("F", _) => Clef::Bass,
        ("C", _) if line == 4 => Clef::Tenor,
        ("C", _) => Clef::Alto,
        ("percussion", _) => Clef::Percussion,
        ("TAB", _) => Clef::Tab,
        _ => Clef::Treble,
    }
}

fn kind_suffix(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "major" => "",
        "minor" => "m",
        "dominant" => "7",
        "minor-seventh" => "m7",
        "major-seventh" => "maj7",
        "major-sixth" => "6",
        "minor-sixth" => "m6",
        "dominant-ninth" => "9",
        "diminished" => "dim",
        "diminished-seventh" => "dim7",
        "half-diminished" => "m7b5",
        "augmented" => "aug",
        "suspended-fourth" => "sus4",
        "suspended-second" => "sus2",
        _ => return None,
    })
}

fn bar_kind_from_style(style: &str) -> Option<BarKind> {
    Some(match style {
        "regular" => BarKind::Single,
        "light-light" => BarKind::Double,
        "light-heavy" => BarKind::Final,
        "heavy-light" => BarKind::HeavyThin,
        "dotted" | "dashed" => BarKind::Dotted,
        "none" => BarKind::Invisible,
        _ => return None,
    })
}
