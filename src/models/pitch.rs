//! Pitch representation
//!
//! A pitch is a diatonic step A-G, a chromatic alteration (-2 double flat
//! to +2 double sharp) and a MusicXML octave number (middle C = C4).
//! Percussion notes additionally carry an unpitched display position and a
//! MIDI note number, resolved through the `%%percmap` table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diatonic step A-G
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    C,
    D,
    E,
    F,
    G,
    A,
    B,
}

impl Step {
    pub fn from_char(c: char) -> Option<Step> {
        match c.to_ascii_uppercase() {
            'C' => Some(Step::C),
            'D' => Some(Step::D),
            'E' => Some(Step::E),
            'F' => Some(Step::F),
            'G' => Some(Step::G),
            'A' => Some(Step::A),
            'B' => Some(Step::B),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::C => "C",
            Step::D => "D",
            Step::E => "E",
            Step::F => "F",
            Step::G => "G",
            Step::A => "A",
            Step::B => "B",
        }
    }

    /// Diatonic index with C = 0
    pub fn index(&self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 1,
            Step::E => 2,
            Step::F => 3,
            Step::G => 4,
            Step::A => 5,
            Step::B => 6,
        }
    }

    pub fn from_index(i: i32) -> Step {
        match i.rem_euclid(7) {
            0 => Step::C,
            1 => Step::D,
            2 => Step::E,
            3 => Step::F,
            4 => Step::G,
            5 => Step::A,
            _ => Step::B,
        }
    }

    /// Semitone offset of the natural step within an octave
    pub fn semitone(&self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 2,
            Step::E => 4,
            Step::F => 5,
            Step::G => 7,
            Step::A => 9,
            Step::B => 11,
        }
    }
}

/// A concrete pitch. `octave` follows MusicXML numbering: middle C is C4.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pitch {
    pub step: Step,
    /// -2 (double flat) ..= +2 (double sharp)
    pub alter: i8,
    pub octave: i8,
}

impl Pitch {
    pub fn new(step: Step, alter: i8, octave: i8) -> Self {
        Pitch { step, alter, octave }
    }

    /// MIDI note number (C4 = 60)
    pub fn midi(&self) -> i32 {
        (self.octave as i32 + 1) * 12 + self.step.semitone() + self.alter as i32
    }

    /// Ordering key for chord sorting: diatonic position first, then alter
    pub fn sort_key(&self) -> (i32, i32, i8) {
        (self.octave as i32, self.step.index(), self.alter)
    }

    /// ABC note text for this written position: accidental marks (when
    /// given), the letter in octave case, then `,`/`'` octave marks.
    /// Octave 4 is the uppercase octave, 5 the lowercase one.
    pub fn abc_note(&self, accidental: Option<i8>) -> String {
        let mut s = String::new();
        if let Some(a) = accidental {
            match a {
                1 => s.push('^'),
                2 => s.push_str("^^"),
                -1 => s.push('_'),
                -2 => s.push_str("__"),
                _ => s.push('='),
            }
        }
        let letter = self.step.as_str();
        if self.octave >= 5 {
            s.push_str(&letter.to_ascii_lowercase());
            for _ in 5..self.octave {
                s.push('\'');
            }
        } else {
            s.push_str(letter);
            for _ in self.octave..4 {
                s.push(',');
            }
        }
        s
    }
}

impl PartialOrd for Pitch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pitch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let acc = match self.alter {
            -2 => "bb",
            -1 => "b",
            1 => "#",
            2 => "##",
            _ => "",
        };
        write!(f, "{}{}{}", self.step.as_str(), acc, self.octave)
    }
}

/// Display position and playback mapping for an unpitched (percussion) note
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PercussionMapping {
    /// Staff position: written as a display-step/display-octave pair
    pub display_step: Step,
    pub display_octave: i8,
    /// General MIDI percussion note number (zero-based as MusicXML wants it)
    pub midi: i32,
    /// Optional notehead style ("x", "diamond", "triangle", "normal")
    pub notehead: Option<String>,
}

/// Resolve a General MIDI percussion sound name to its note number.
/// Returns `None` for unknown names; callers fall back to a default mapping.
pub fn percussion_sound_midi(name: &str) -> Option<i32> {
    let normalized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let midi = match normalized.as_str() {
        "acousticbassdrum" => 35,
        "bassdrum1" | "bassdrum" => 36,
        "sidestick" => 37,
        "acousticsnare" | "snaredrum" => 38,
        "handclap" => 39,
        "electricsnare" => 40,
        "lowfloortom" => 41,
        "closedhihat" => 42,
        "highfloortom" => 43,
        "pedalhihat" => 44,
        "lowtom" => 45,
        "openhihat" => 46,
        "lowmidtom" => 47,
        "himidtom" | "highmidtom" => 48,
        "crashcymbal1" | "crashcymbal" => 49,
        "hightom" => 50,
        "ridecymbal1" | "ridecymbal" => 51,
        "chinesecymbal" => 52,
        "ridebell" => 53,
        "tambourine" => 54,
        "splashcymbal" => 55,
        "cowbell" => 56,
        "crashcymbal2" => 57,
        "vibraslap" => 58,
        "ridecymbal2" => 59,
        "hibongo" | "highbongo" => 60,
        "lowbongo" => 61,
        "mutehiconga" => 62,
        "openhiconga" => 63,
        "lowconga" => 64,
        "hightimbale" => 65,
        "lowtimbale" => 66,
        "highagogo" => 67,
        "lowagogo" => 68,
        "cabasa" => 69,
        "maracas" => 70,
        "shortwhistle" => 71,
        "longwhistle" => 72,
        "shortguiro" => 73,
        "longguiro" => 74,
        "claves" => 75,
        "hiwoodblock" | "highwoodblock" => 76,
        "lowwoodblock" => 77,
        "mutecuica" => 78,
        "opencuica" => 79,
        "mutetriangle" => 80,
        "opentriangle" => 81,
        _ => return None,
    };
    Some(midi)
}
