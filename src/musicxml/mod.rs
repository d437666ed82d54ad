//! MusicXML emission
//!
//! Turns a parsed [`Tune`] into a score-partwise 3.1 document. The layout
//! tree decides the part structure: a bare voice or a parenthesized
//! overlay group becomes one part on one staff, a brace becomes a single
//! multi-staff part (grand staff), and a bracket wraps its children in a
//! part-group. Part names come from the first named voice inside the
//! part.

pub mod builder;
mod part;
pub mod tables;

use crate::diagnostics::Diagnostics;
use crate::models::{ScoreNode, Tune, Voice};
use builder::XmlBuilder;

/// One `<part>` to be rendered: its id, display names and staves, each
/// staff holding the voices overlaid on it
pub(crate) struct PartPlan<'a> {
    pub id: String,
    pub name: Option<String>,
    pub abbrev: Option<String>,
    pub staves: Vec<Vec<&'a Voice>>,
}

/// part-list entries in document order
enum ListEntry {
    Part(usize),
    GroupStart(u32),
    GroupStop(u32),
}

/// Build the complete MusicXML document for a tune
pub fn build_score(tune: &Tune, diags: &mut Diagnostics) -> String {
    let (plans, entries) = plan_parts(tune, diags);
    let part_list = render_part_list(&plans, &entries, tune);
    let mut parts = String::new();
    for (i, plan) in plans.iter().enumerate() {
        parts.push_str(&part::render_part(plan, tune, i == 0, diags));
    }
    builder::document(tune.title.as_deref(), tune.composer.as_deref(), &part_list, &parts)
}

fn plan_parts<'a>(tune: &'a Tune, diags: &mut Diagnostics) -> (Vec<PartPlan<'a>>, Vec<ListEntry>) {
    let mut plans = Vec::new();
    let mut entries = Vec::new();
    let mut group_no = 0u32;
    let layout: Vec<ScoreNode> = if tune.layout.is_empty() {
        tune.voices.iter().map(|v| ScoreNode::Voice(v.id.clone())).collect()
    } else {
        tune.layout.clone()
    };
    for node in &layout {
        plan_node(node, tune, &mut plans, &mut entries, &mut group_no, diags);
    }
    if plans.is_empty() {
        // Header-only tune: keep the document well-formed with one part
        let idx = plans.len();
        plans.push(PartPlan {
            id: "P1".into(),
            name: None,
            abbrev: None,
            staves: vec![Vec::new()],
        });
        entries.push(ListEntry::Part(idx));
    }
    (plans, entries)
}

fn plan_node<'a>(
    node: &ScoreNode,
    tune: &'a Tune,
    plans: &mut Vec<PartPlan<'a>>,
    entries: &mut Vec<ListEntry>,
    group_no: &mut u32,
    diags: &mut Diagnostics,
) {
    match node {
        ScoreNode::Voice(id) => {
            if let Some(v) = tune.voice(id) {
                push_part(plans, entries, vec![vec![v]]);
            }
        }
        ScoreNode::Overlay(ids) => {
            let vs: Vec<&Voice> = ids.iter().filter_map(|id| tune.voice(id)).collect();
            if !vs.is_empty() {
                push_part(plans, entries, vec![vs]);
            }
        }
        ScoreNode::Brace(children) => {
            let mut staves: Vec<Vec<&Voice>> = Vec::new();
            collect_staves(children, tune, &mut staves, diags);
            if !staves.is_empty() {
                push_part(plans, entries, staves);
            }
        }
        ScoreNode::Bracket(children) => {
            *group_no += 1;
            let no = *group_no;
            entries.push(ListEntry::GroupStart(no));
            for c in children {
                plan_node(c, tune, plans, entries, group_no, diags);
            }
            entries.push(ListEntry::GroupStop(no));
        }
    }
}

fn collect_staves<'a>(
    children: &[ScoreNode],
    tune: &'a Tune,
    staves: &mut Vec<Vec<&'a Voice>>,
    diags: &mut Diagnostics,
) {
    for c in children {
        match c {
            ScoreNode::Voice(id) => {
                if let Some(v) = tune.voice(id) {
                    staves.push(vec![v]);
                }
            }
            ScoreNode::Overlay(ids) => {
                let vs: Vec<&Voice> = ids.iter().filter_map(|id| tune.voice(id)).collect();
                if !vs.is_empty() {
                    staves.push(vs);
                }
            }
            ScoreNode::Brace(gc) | ScoreNode::Bracket(gc) => {
                diags.warn(
                    "layout_flattened",
                    "group nested inside a brace; flattened onto adjacent staves",
                );
                collect_staves(gc, tune, staves, diags);
            }
        }
    }
}

fn push_part<'a>(
    plans: &mut Vec<PartPlan<'a>>,
    entries: &mut Vec<ListEntry>,
    staves: Vec<Vec<&'a Voice>>,
) {
    let idx = plans.len();
    let name = staves.iter().flatten().find_map(|v| v.name.clone());
    let abbrev = staves.iter().flatten().find_map(|v| v.subname.clone());
    plans.push(PartPlan { id: format!("P{}", idx + 1), name, abbrev, staves });
    entries.push(ListEntry::Part(idx));
}

fn render_part_list(plans: &[PartPlan<'_>], entries: &[ListEntry], tune: &Tune) -> String {
    let mut b = XmlBuilder::with_depth(1);
    b.open("part-list");
    for e in entries {
        match e {
            ListEntry::GroupStart(n) => {
                b.open_attrs("part-group", &[("number", &n.to_string()), ("type", "start")]);
                b.leaf("group-symbol", "bracket");
                b.leaf("group-barline", "yes");
                b.close("part-group");
            }
            ListEntry::GroupStop(n) => {
                b.empty("part-group", &[("number", &n.to_string()), ("type", "stop")]);
            }
            ListEntry::Part(i) => {
                let plan = &plans[*i];
                b.open_attrs("score-part", &[("id", &plan.id)]);
                b.leaf("part-name", plan.name.as_deref().unwrap_or(""));
                if let Some(a) = &plan.abbrev {
                    b.leaf("part-abbreviation", a);
                }
                let perc = part::percussion_instruments(plan, tune);
                if !perc.is_empty() {
                    for (midi, name) in &perc {
                        let iid = format!("{}-I{}", plan.id, midi + 1);
                        b.open_attrs("score-instrument", &[("id", &iid)]);
                        b.leaf("instrument-name", name);
                        b.close("score-instrument");
                    }
                    for midi in perc.keys() {
                        let iid = format!("{}-I{}", plan.id, midi + 1);
                        b.open_attrs("midi-instrument", &[("id", &iid)]);
                        b.leaf("midi-channel", "10");
                        b.leaf("midi-unpitched", &(midi + 1).to_string());
                        b.close("midi-instrument");
                    }
                } else if let Some(program) =
                    plan.staves.iter().flatten().find_map(|v| v.midi_program)
                {
                    let iid = format!("{}-I1", plan.id);
                    b.open_attrs("score-instrument", &[("id", &iid)]);
                    b.leaf("instrument-name", plan.name.as_deref().unwrap_or("Voice"));
                    b.close("score-instrument");
                    b.open_attrs("midi-instrument", &[("id", &iid)]);
                    if let Some(ch) = plan.staves.iter().flatten().find_map(|v| v.midi_channel) {
                        b.leaf("midi-channel", &ch.to_string());
                    }
                    // %%MIDI programs are zero-based, MusicXML's are 1-based
                    b.leaf("midi-program", &(program as i32 + 1).to_string());
                    b.close("midi-instrument");
                }
                b.close("score-part");
            }
        }
    }
    b.close("part-list");
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_tune, PostprocessOptions};

    fn convert(src: &str) -> (String, Diagnostics) {
        let mut diags = Diagnostics::new();
        let tune = parse_tune(src, 1, PostprocessOptions::default(), &mut diags)
            .expect("tune should parse");
        let xml = build_score(&tune, &mut diags);
        (xml, diags)
    }

    #[test]
    fn test_simple_tune_structure() {
        let (xml, _) = convert("X:1\nT:Test\nM:4/4\nL:1/4\nK:C\nCDEF|GABc|]\n");
        assert!(xml.contains("<movement-title>Test</movement-title>"));
        assert!(xml.contains("<divisions>1</divisions>"));
        assert!(xml.contains("<fifths>0</fifths>"));
        assert!(xml.contains("<beats>4</beats>"));
        assert!(xml.contains("<sign>G</sign>"));
        assert!(xml.contains("<step>C</step>"));
        assert!(xml.contains("<type>quarter</type>"));
        assert!(xml.contains("<bar-style>light-heavy</bar-style>"));
    }

    #[test]
    fn test_key_signature_implies_alter() {
        // F in D major sounds F#, with no accidental element
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:D\nFFFF|]\n");
        assert!(xml.contains("<alter>1</alter>"));
        assert!(!xml.contains("<accidental>"));
    }

    #[test]
    fn test_explicit_accidental_carries_through_measure() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n^FFFF|]\n");
        // One written sharp, four sounding sharps
        assert_eq!(xml.matches("<accidental>sharp</accidental>").count(), 1);
        assert_eq!(xml.matches("<alter>1</alter>").count(), 4);
    }

    #[test]
    fn test_tie_same_pitch() {
        let (xml, diags) = convert("X:1\nM:4/4\nL:1/4\nK:C\nC2-C2|]\n");
        assert!(xml.contains("<tie type=\"start\"/>"));
        assert!(xml.contains("<tie type=\"stop\"/>"));
        assert!(!diags.entries.iter().any(|d| d.kind == "tie_unresolved"));
    }

    #[test]
    fn test_cross_pitch_tie_becomes_slur() {
        let (xml, diags) = convert("X:1\nM:4/4\nL:1/4\nK:C\nC2-D2|]\n");
        assert!(!xml.contains("<tie type=\"start\"/>"));
        assert!(xml.contains("<slur number=\"1\" type=\"start\"/>"));
        assert!(xml.contains("<slur number=\"1\" type=\"stop\"/>"));
        assert!(diags.entries.iter().any(|d| d.kind == "tie_changed_pitch"));
    }

    #[test]
    fn test_tuplet_time_modification() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/8\nK:C\n(3ABC A4z2|]\n");
        assert!(xml.contains("<actual-notes>3</actual-notes>"));
        assert!(xml.contains("<normal-notes>2</normal-notes>"));
        assert!(xml.contains("<tuplet type=\"start\"/>"));
        assert!(xml.contains("<tuplet type=\"stop\"/>"));
    }

    #[test]
    fn test_chord_members_share_stem() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n[CEG]4|]\n");
        assert_eq!(xml.matches("<chord/>").count(), 2);
        assert!(xml.contains("<step>E</step>"));
        assert!(xml.contains("<step>G</step>"));
    }

    #[test]
    fn test_volta_brackets() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n|:C4|1D4:|2E4|]\n");
        assert!(xml.contains("<ending number=\"1\" type=\"start\">1.</ending>"));
        assert!(xml.contains("<ending number=\"1\" type=\"stop\"/>"));
        assert!(xml.contains("<ending number=\"2\" type=\"start\">2.</ending>"));
        assert!(xml.contains("<repeat direction=\"backward\"/>"));
        assert!(xml.contains("<repeat direction=\"forward\"/>"));
    }

    #[test]
    fn test_overlay_voices_merge_with_backup() {
        let src = "X:1\nM:4/4\nL:1/4\n%%score (1 2)\nK:C\nV:1\nC4|]\nV:2\nE4|]\n";
        let (xml, _) = convert(src);
        // One part, two voices, rewound with backup
        assert_eq!(xml.matches("<part id=").count(), 1);
        assert!(xml.contains("<backup>"));
        assert!(xml.contains("<voice>1</voice>"));
        assert!(xml.contains("<voice>2</voice>"));
    }

    #[test]
    fn test_grand_staff_brace() {
        let src = "X:1\nM:4/4\nL:1/4\n%%score {RH LH}\nK:C\nV:RH\nc4|]\nV:LH clef=bass\nC,4|]\n";
        let (xml, _) = convert(src);
        assert_eq!(xml.matches("<score-part id=").count(), 1);
        assert!(xml.contains("<staves>2</staves>"));
        assert!(xml.contains("<clef number=\"1\">"));
        assert!(xml.contains("<clef number=\"2\">"));
        assert!(xml.contains("<sign>F</sign>"));
        assert!(xml.contains("<staff>2</staff>"));
    }

    #[test]
    fn test_bracket_part_group_named_from_first_voice() {
        let src = "X:1\nM:4/4\nL:1/4\n%%score [S A]\nK:C\nV:S name=\"Soprano\"\nc4|]\nV:A\ne4|]\n";
        let (xml, _) = convert(src);
        assert!(xml.contains("<part-group number=\"1\" type=\"start\">"));
        assert!(xml.contains("<group-symbol>bracket</group-symbol>"));
        assert!(xml.contains("<part-name>Soprano</part-name>"));
        assert!(xml.contains("<part-group number=\"1\" type=\"stop\"/>"));
    }

    #[test]
    fn test_lyrics_with_melisma() {
        let src = "X:1\nM:4/4\nL:1/4\nK:C\nCDEF|\nw:hel-lo world _\n";
        let (xml, _) = convert(src);
        assert!(xml.contains("<syllabic>begin</syllabic>"));
        assert!(xml.contains("<syllabic>end</syllabic>"));
        assert!(xml.contains("<text>world</text>"));
        assert!(xml.contains("<extend/>"));
    }

    #[test]
    fn test_grace_notes_slashed_without_duration() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n{ag}A4|]\n");
        assert_eq!(xml.matches("<grace slash=\"yes\"/>").count(), 2);
        let grace_at = xml.find("<grace").unwrap();
        let dur_at = xml.find("<duration>").unwrap();
        assert!(grace_at < dur_at);
    }

    #[test]
    fn test_percussion_unpitched() {
        let src = "X:1\nM:4/4\nL:1/4\n%%percmap ^g 42 x\nK:C\nV:1 clef=perc\n^g4|]\n";
        let (xml, _) = convert(src);
        assert!(xml.contains("<unpitched>"));
        assert!(xml.contains("<notehead>x</notehead>"));
        assert!(xml.contains("<midi-channel>10</midi-channel>"));
        assert!(xml.contains("<midi-unpitched>42</midi-unpitched>"));
    }

    #[test]
    fn test_chord_symbol_harmony() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n\"Gm7\"G2 \"F/A\"A2|]\n");
        assert!(xml.contains("<root-step>G</root-step>"));
        assert!(xml.contains("<kind>minor-seventh</kind>"));
        assert!(xml.contains("<bass-step>A</bass-step>"));
    }

    #[test]
    fn test_broken_rhythm_dotted_pair() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/8\nK:C\nA>B A>B A>B A>B|]\n");
        assert!(xml.contains("<type>eighth</type>\n"));
        assert!(xml.contains("<dot/>"));
        assert!(xml.contains("<type>16th</type>"));
    }

    #[test]
    fn test_decorations_split_into_buckets() {
        let (xml, _) = convert("X:1\nM:4/4\nL:1/4\nK:C\n!trill!C2 !mf!.D2|]\n");
        assert!(xml.contains("<trill-mark/>"));
        assert!(xml.contains("<staccato/>"));
        assert!(xml.contains("<mf/>"));
        // Dynamics precede the note they mark
        let dyn_at = xml.find("<mf/>").unwrap();
        let d_at = xml.find("<step>D</step>").unwrap();
        assert!(dyn_at < d_at);
    }
}
