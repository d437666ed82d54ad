//! Musical AST
//!
//! Closed tagged variants for everything the grammar can produce. The
//! post-processing pass (`parse::postprocess`) rewrites measures into the
//! canonical form the MusicXML builder consumes: chords flattened into
//! runs of chord-member notes behind a carrier, broken-rhythm markers
//! resolved away, grace groups reduced to per-note flags.

use super::duration::Dur;
use super::key::{Clef, Key, Tempo, TimeSig};
use super::pitch::{PercussionMapping, Pitch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source position of a token (1-indexed line/column)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub col: usize,
    /// Byte offset of the token start within its line
    pub offset: usize,
    /// Byte offset just past the token
    pub end: usize,
}

/// Tuplet membership, stamped onto notes by post-processing. `p` notes
/// sound in the time of `q`; durations are already scaled by q/p.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TupletSpan {
    pub p: u8,
    pub q: u8,
    pub start: bool,
    pub stop: bool,
}

/// A note or rest. `pitch == None` means rest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Note {
    pub dur: Dur,
    pub pitch: Option<Pitch>,
    /// Written accidental, when one appeared in the source. `Some(0)` is an
    /// explicit natural; `None` inherits from the key and earlier notes in
    /// the measure.
    pub accidental: Option<i8>,
    /// False for the invisible rest `x`
    pub visible: bool,
    /// Tie to the next note of the same pitch
    pub tie: bool,
    /// Number of slurs opening on this note
    pub slur_starts: u8,
    /// Number of slurs closing on this note
    pub slur_ends: u8,
    /// Decoration tokens in source order (`!trill!`, `.`, `~`, ...)
    pub decorations: Vec<String>,
    pub grace: bool,
    /// True for the 2nd..nth member of a flattened chord
    pub chord_member: bool,
    /// All pitches of the chord, recorded on the carrier (first member)
    pub chord_pitches: Vec<Pitch>,
    /// Whitespace preceded this note in the source (beam break)
    pub beam_break: bool,
    pub tuplet: Option<TupletSpan>,
    pub span: Span,
}

impl Note {
    pub fn new(dur: Dur, pitch: Option<Pitch>) -> Self {
        Note {
            dur,
            pitch,
            accidental: None,
            visible: true,
            tie: false,
            slur_starts: 0,
            slur_ends: 0,
            decorations: Vec::new(),
            grace: false,
            chord_member: false,
            chord_pitches: Vec::new(),
            beam_break: false,
            tuplet: None,
            span: Span::default(),
        }
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// A chord as parsed: members share the group duration/tie/slur annotation,
/// which by convention the first member carries after flattening
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chord {
    pub notes: Vec<Note>,
    /// Length multiplier written after the closing bracket
    pub dur_mult: Dur,
    pub tie: bool,
    pub slur_starts: u8,
    pub slur_ends: u8,
    pub decorations: Vec<String>,
    pub beam_break: bool,
    pub span: Span,
}

/// Broken-rhythm marker between two adjacent notes/chords/rests
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Broken {
    /// `>`: left gets 3/2, right gets 1/2
    RightSingle,
    /// `>>`: left gets 7/4, right gets 1/4
    RightDouble,
    /// `<`: left gets 1/2, right gets 3/2
    LeftSingle,
    /// `<<`: left gets 1/4, right gets 7/4
    LeftDouble,
}

impl Broken {
    /// (left multiplier, right multiplier)
    pub fn ratios(&self) -> (Dur, Dur) {
        match self {
            Broken::RightSingle => (Dur::new(3, 2), Dur::new(1, 2)),
            Broken::RightDouble => (Dur::new(7, 4), Dur::new(1, 4)),
            Broken::LeftSingle => (Dur::new(1, 2), Dur::new(3, 2)),
            Broken::LeftDouble => (Dur::new(1, 4), Dur::new(7, 4)),
        }
    }

    pub fn abc_text(&self) -> &'static str {
        match self {
            Broken::RightSingle => ">",
            Broken::RightDouble => ">>",
            Broken::LeftSingle => "<",
            Broken::LeftDouble => "<<",
        }
    }
}

/// One element of a measure, in source order
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum MeasureItem {
    Note(Note),
    Chord(Chord),
    Broken(Broken),
    /// `(p:q:r`: p notes in the time of q over the next r notes
    TupletStart { p: u8, q: u8, r: u8 },
    GraceOpen,
    GraceClose,
    /// Inline `[K:...]`-style field
    InlineField { code: char, value: String },
    /// Chord symbol from a `"Gm7"` annotation
    ChordSymbol(String),
    /// Free text annotation (`"^above"`, `"_below"`, ...)
    Annotation(String),
}

/// Barline styles recognized by the grammar
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BarKind {
    #[default]
    Single,
    Double,
    /// `|]` thin-thick final bar
    Final,
    /// `[|` thick-thin bar
    HeavyThin,
    RepeatStart,
    RepeatEnd,
    /// `::` closes one repeat and opens the next
    RepeatBoth,
    Dotted,
    Invisible,
}

/// A measure's right barline plus any repeat/volta data attached to it
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Barline {
    pub kind: BarKind,
    /// Volta text starting right after this bar ("1", "2", "1,2")
    pub volta: Option<String>,
}

/// A measure: ordered items plus the barline closing it
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Measure {
    pub items: Vec<MeasureItem>,
    pub right: Barline,
    /// Volta label opening at the start of this measure (`[1`, `|2`)
    pub volta: Option<String>,
    /// True when the source put a line break after this measure
    pub line_break_after: bool,
}

impl Measure {
    /// Sum of sounding durations (excludes grace notes and chord members,
    /// whose time is carried by the chord's first member)
    pub fn sounding_dur(&self) -> Dur {
        let mut total = Dur::zero();
        for item in &self.items {
            if let MeasureItem::Note(n) = item {
                if !n.grace && !n.chord_member {
                    total = total + n.dur;
                }
            }
        }
        total
    }
}

/// Lyric token, aligned 1:1 against non-chord-member, non-grace notes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LyricToken {
    /// Syllable text; `hyphen` marks continuation into the next syllable
    Syllable { text: String, hyphen: bool },
    /// `_` melisma: previous syllable extends under this note
    Extend,
    /// `*` skip: no lyric under this note
    Skip,
    /// `|` advance to the next measure boundary
    BarSync,
}

/// One verse worth of lyric tokens for a voice
pub type LyricLine = Vec<LyricToken>;

/// A voice: ordered measures plus identity and current attributes
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Voice {
    pub id: String,
    pub name: Option<String>,
    pub subname: Option<String>,
    pub clef: Clef,
    pub measures: Vec<Measure>,
    /// Lyric lines keyed by verse number (1-based)
    pub lyrics: BTreeMap<u8, LyricLine>,
    /// MIDI program from `%%MIDI program`
    pub midi_program: Option<u8>,
    pub midi_channel: Option<u8>,
    /// Octave shift applied to all notes (from `octave=` modifier)
    pub octave_shift: i8,
}

impl Voice {
    pub fn new(id: impl Into<String>) -> Self {
        Voice { id: id.into(), ..Default::default() }
    }

    pub fn is_percussion(&self) -> bool {
        self.clef == Clef::Percussion
    }
}

/// Staff-layout tree from the `%%score` / `%%staves` mini-language
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ScoreNode {
    /// A single voice on its own staff
    Voice(String),
    /// Parenthesized overlay group: all voices share one staff
    Overlay(Vec<String>),
    /// Brace group (grand staff)
    Brace(Vec<ScoreNode>),
    /// Bracket part-group
    Bracket(Vec<ScoreNode>),
}

impl ScoreNode {
    /// All voice ids mentioned under this node, in order
    pub fn voice_ids(&self) -> Vec<&str> {
        match self {
            ScoreNode::Voice(id) => vec![id.as_str()],
            ScoreNode::Overlay(ids) => ids.iter().map(String::as_str).collect(),
            ScoreNode::Brace(children) | ScoreNode::Bracket(children) => {
                children.iter().flat_map(|c| c.voice_ids()).collect()
            }
        }
    }
}

/// A parsed tune: header data plus voices
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Tune {
    /// `X:` reference number
    pub number: Option<i32>,
    pub title: Option<String>,
    pub composer: Option<String>,
    pub origin: Option<String>,
    /// Remaining header fields in source order (code, value)
    pub other_fields: Vec<(char, String)>,
    pub key: Key,
    /// Unit note length from `L:` in quarter notes
    pub unit: Dur,
    pub meter: Option<TimeSig>,
    pub tempo: Option<Tempo>,
    pub voices: Vec<Voice>,
    /// Layout directive tree, when a `%%score`/`%%staves` line was present
    pub layout: Vec<ScoreNode>,
    /// `%%percmap` entries keyed by the written note text (e.g. "^g")
    pub percmap: BTreeMap<String, PercussionMapping>,
}

impl Tune {
    pub fn voice(&self, id: &str) -> Option<&Voice> {
        self.voices.iter().find(|v| v.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pitch::Step;

    #[test]
    fn test_broken_ratios_sum_to_two() {
        for broken in [
            Broken::RightSingle,
            Broken::RightDouble,
            Broken::LeftSingle,
            Broken::LeftDouble,
        ] {
            let (l, r) = broken.ratios();
            assert_eq!(l + r, Dur::from_int(2));
        }
    }

    #[test]
    fn test_sounding_dur_skips_chord_members() {
        let mut m = Measure::default();
        let mut carrier = Note::new(Dur::from_int(1), Some(Pitch::new(Step::C, 0, 4)));
        carrier.chord_pitches = vec![Pitch::new(Step::C, 0, 4), Pitch::new(Step::E, 0, 4)];
        let mut member = Note::new(Dur::from_int(1), Some(Pitch::new(Step::E, 0, 4)));
        member.chord_member = true;
        m.items.push(MeasureItem::Note(carrier));
        m.items.push(MeasureItem::Note(member));
        assert_eq!(m.sounding_dur(), Dur::from_int(1));
    }

    #[test]
    fn test_score_node_voice_ids() {
        let node = ScoreNode::Brace(vec![
            ScoreNode::Overlay(vec!["1".into(), "2".into()]),
            ScoreNode::Voice("3".into()),
        ]);
        assert_eq!(node.voice_ids(), vec!["1", "2", "3"]);
    }
}
