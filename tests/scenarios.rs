//! End-to-end conversions checked against known scores.

use abcxml::{abc_to_musicxml, musicxml_to_abc, Options};

fn to_xml(src: &str) -> String {
    abc_to_musicxml(src, &Options::default())
        .expect("conversion failed")
        .output
}

#[test]
fn doubled_eighths_become_quarters() {
    let xml = to_xml("X:1\nL:1/8\nK:C\nC2 D2 E2 F2|]\n");
    for step in ["C", "D", "E", "F"] {
        assert!(xml.contains(&format!("<step>{}</step>", step)), "missing {}", step);
    }
    assert_eq!(xml.matches("<type>quarter</type>").count(), 4);
    assert_eq!(xml.matches("<octave>4</octave>").count(), 4);
    assert!(!xml.contains("<tie"));
    assert!(!xml.contains("<slur"));
}

#[test]
fn broken_rhythm_splits_three_to_one() {
    let xml = to_xml("X:1\nL:1/8\nK:C\nA>B|]\n");
    assert!(xml.contains("<divisions>4</divisions>"));
    let long = xml.find("<duration>3</duration>").expect("dotted note missing");
    let short = xml.find("<duration>1</duration>").expect("clipped note missing");
    assert!(long < short);
    assert!(xml.contains("<step>A</step>"));
    assert!(xml.contains("<step>B</step>"));
    assert!(xml.contains("<dot/>"));
    assert!(xml.contains("<type>16th</type>"));
}

#[test]
fn triplet_occupies_two_eighths() {
    let xml = to_xml("X:1\nK:C\n(3ABC|]\n");
    assert!(xml.contains("<actual-notes>3</actual-notes>"));
    assert!(xml.contains("<normal-notes>2</normal-notes>"));
    assert!(xml.contains("<tuplet type=\"start\"/>"));
    assert!(xml.contains("<tuplet type=\"stop\"/>"));
    // thirds of a quarter at divisions=3
    assert!(xml.contains("<divisions>3</divisions>"));
    assert_eq!(xml.matches("<duration>1</duration>").count(), 3);
}

#[test]
fn chord_flattens_behind_carrier() {
    let xml = to_xml("X:1\nL:1/8\nK:C\n[CEG]2|]\n");
    assert_eq!(xml.matches("<chord/>").count(), 2);
    assert_eq!(xml.matches("<duration>1</duration>").count(), 3);
    for step in ["C", "E", "G"] {
        assert!(xml.contains(&format!("<step>{}</step>", step)));
    }
}

#[test]
fn chord_members_reordered_by_pitch() {
    let opts = Options {
        order_chords_by_pitch: true,
        ..Default::default()
    };
    let xml = abc_to_musicxml("X:1\nL:1/8\nK:C\n[GEC]2|]\n", &opts)
        .unwrap()
        .output;
    let c = xml.find("<step>C</step>").unwrap();
    let g = xml.find("<step>G</step>").unwrap();
    assert!(c < g, "lowest pitch should lead the chord");

    // Without the option the source order survives
    let xml = to_xml("X:1\nL:1/8\nK:C\n[GEC]2|]\n");
    let c = xml.find("<step>C</step>").unwrap();
    let g = xml.find("<step>G</step>").unwrap();
    assert!(g < c);
}

#[test]
fn colliding_tie_degrades_to_slur() {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="3.1">
  <part-list>
    <score-part id="P1"><part-name>Music</part-name></score-part>
  </part-list>
  <part id="P1">
    <measure number="1">
      <attributes>
        <divisions>1</divisions>
        <key><fifths>0</fifths></key>
        <time><beats>4</beats><beat-type>4</beat-type></time>
        <clef><sign>G</sign><line>2</line></clef>
      </attributes>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>1</duration><tie type="start"/><voice>1</voice><type>quarter</type></note>
      <note><pitch><step>D</step><octave>4</octave></pitch><duration>1</duration><tie type="start"/><voice>1</voice><type>quarter</type></note>
      <note><pitch><step>D</step><octave>4</octave></pitch><duration>1</duration><tie type="stop"/><voice>1</voice><type>quarter</type></note>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>1</duration><voice>1</voice><type>quarter</type></note>
    </measure>
  </part>
</score-partwise>
"#;
    let conv = musicxml_to_abc(xml, &Options::default()).unwrap();
    assert!(
        conv.diagnostics.entries.iter().any(|d| d.kind == "tie_changed_pitch"),
        "diagnostics: {:?}",
        conv.diagnostics.entries
    );
    // The C tie becomes a slur; the D-D tie survives
    assert!(conv.output.contains("(C"), "got: {}", conv.output);
    assert!(conv.output.contains("D-"), "got: {}", conv.output);
}

#[test]
fn merged_staff_named_from_first_named_voice() {
    let src = "X:1\nM:4/4\nL:1/4\n%%score (1 2)\nV:1 name=\"Flute\"\nV:2\nK:C\nV:1\nC4|]\nV:2\nE4|]\n";
    let xml = to_xml(src);
    assert_eq!(xml.matches("<score-part id=").count(), 1);
    assert!(xml.contains("<part-name>Flute</part-name>"));
    assert!(xml.contains("<backup>"));
    assert!(xml.contains("<voice>1</voice>"));
    assert!(xml.contains("<voice>2</voice>"));
}
