//! Properties the conversion pipeline must preserve.

use abcxml::models::{Dur, MeasureItem, Pitch, Tune};
use abcxml::parse::{parse_tune, PostprocessOptions};
use abcxml::{abc_to_musicxml, musicxml_to_abc, Diagnostics, Options};

fn parse(src: &str) -> Tune {
    let mut diags = Diagnostics::new();
    parse_tune(src, 1, PostprocessOptions::default(), &mut diags).expect("parse failed")
}

/// Sounding pitch and duration of every non-grace note of a voice
fn notes(tune: &Tune, voice: usize) -> Vec<(Option<Pitch>, Dur)> {
    tune.voices[voice]
        .measures
        .iter()
        .flat_map(|m| m.items.iter())
        .filter_map(|i| match i {
            MeasureItem::Note(n) if !n.grace => Some((n.pitch, n.dur)),
            _ => None,
        })
        .collect()
}

fn durs(tune: &Tune) -> Vec<Dur> {
    notes(tune, 0).into_iter().map(|(_, d)| d).collect()
}

#[test]
fn round_trip_preserves_pitches_and_durations() {
    let sources = [
        "X:1\nT:Reel\nM:4/4\nL:1/8\nK:D\n|:A2fA eAfA|A2fA e2de:|\n",
        "X:1\nM:6/8\nL:1/8\nK:G\nGAG BAB|g3 e2d|]\n",
        "X:1\nL:1/8\nK:C\n(3CDE F>G [ce]2|z4 x2 C2|\n",
        "X:1\nM:2/4\nL:1/16\nK:A\ncBcd e2a2|^gaba e4|]\n",
    ];
    for src in sources {
        let xml = abc_to_musicxml(src, &Options::default()).unwrap().output;
        let abc = musicxml_to_abc(&xml, &Options::default()).unwrap().output;
        let a = parse(src);
        let b = parse(&abc);
        assert_eq!(notes(&a, 0), notes(&b, 0), "source: {:?}\nrendered: {}", src, abc);
    }
}

#[test]
fn chord_flattening_conserves_durations() {
    // Per-member lengths scale by the outer multiplier; the measure's
    // sounding length counts the carrier only
    let t = parse("X:1\nL:1/8\nK:C\n[C2E2G]2|\n");
    assert_eq!(
        durs(&t),
        vec![Dur::from_int(2), Dur::from_int(2), Dur::from_int(1)]
    );
    assert_eq!(t.voices[0].measures[0].sounding_dur(), Dur::from_int(2));
}

#[test]
fn broken_rhythm_resolution_without_marker_is_a_noop() {
    let t = parse("X:1\nL:1/8\nK:C\nC2D2 EF|\n");
    assert_eq!(
        durs(&t),
        vec![
            Dur::from_int(1),
            Dur::from_int(1),
            Dur::new(1, 2),
            Dur::new(1, 2)
        ]
    );
}

#[test]
fn tuplet_members_scale_by_q_over_p() {
    // 5 in the time of 4: each written eighth sounds 2/5 of a quarter
    let t = parse("X:1\nL:1/8\nK:C\n(5:4:5CDEFG C2|\n");
    let all = durs(&t);
    assert_eq!(&all[..5], &[Dur::new(2, 5); 5]);
    let sum = all[..5].iter().fold(Dur::zero(), |acc, &d| acc + d);
    assert_eq!(sum, Dur::from_int(2));
}

#[test]
fn matched_ties_leave_no_residue() {
    let conv = abc_to_musicxml(
        "X:1\nM:4/4\nL:1/4\nK:C\nC4-|C4-|C2D2|]\n",
        &Options::default(),
    )
    .unwrap();
    assert!(
        !conv.diagnostics.entries.iter().any(|d| d.kind == "tie_unresolved"),
        "diagnostics: {:?}",
        conv.diagnostics.entries
    );
    assert_eq!(conv.output.matches("<tie type=\"start\"/>").count(), 2);
    assert_eq!(conv.output.matches("<tie type=\"stop\"/>").count(), 2);
}

#[test]
fn unit_length_tracks_dominant_note_value() {
    let cases = [
        ("X:1\nM:4/4\nL:1/4\nK:C\nCDEF|GABc|]\n", "L:1/4"),
        ("X:1\nM:4/4\nL:1/8\nK:C\nCDEF GABc|cBAG FEDC|]\n", "L:1/8"),
        ("X:1\nM:2/4\nL:1/16\nK:C\nCDEF GABc|cBAG FEDC|]\n", "L:1/16"),
    ];
    for (src, expect) in cases {
        let xml = abc_to_musicxml(src, &Options::default()).unwrap().output;
        let abc = musicxml_to_abc(&xml, &Options::default()).unwrap().output;
        assert!(abc.contains(expect), "expected {} in: {}", expect, abc);
    }
}
