//! Key, clef, time signature and tempo
//!
//! These are the per-voice mutable attributes. Each one parses from its ABC
//! header-field text and knows how to describe itself for the MusicXML
//! attribute block.

use super::duration::Dur;
use super::pitch::Step;
use serde::{Deserialize, Serialize};

/// Mode of a key signature
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Major,
    Minor,
    Dorian,
    Phrygian,
    Lydian,
    Mixolydian,
    Locrian,
}

impl Mode {
    /// Fifths offset of the mode relative to major on the same tonic
    pub(crate) fn fifths_offset(&self) -> i8 {
        match self {
            Mode::Major => 0,
            Mode::Minor => -3,
            Mode::Dorian => -2,
            Mode::Phrygian => -4,
            Mode::Lydian => 1,
            Mode::Mixolydian => -1,
            Mode::Locrian => -5,
        }
    }

    pub fn xml_name(&self) -> &'static str {
        match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
            Mode::Dorian => "dorian",
            Mode::Phrygian => "phrygian",
            Mode::Lydian => "lydian",
            Mode::Mixolydian => "mixolydian",
            Mode::Locrian => "locrian",
        }
    }
}

/// Key signature as a circle-of-fifths position plus mode
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Key {
    pub fifths: i8,
    pub mode: Mode,
}

impl Default for Key {
    fn default() -> Self {
        Key { fifths: 0, mode: Mode::Major }
    }
}

/// Order in which sharps are added to a key signature
const SHARP_ORDER: [Step; 7] = [
    Step::F,
    Step::C,
    Step::G,
    Step::D,
    Step::A,
    Step::E,
    Step::B,
];

impl Key {
    /// Parse the tonic/mode part of a `K:` field value. Clef words are
    /// handled separately by [`Clef::parse`]. Returns `None` for values
    /// with no recognizable tonic (e.g. "none", "HP").
    pub fn parse(text: &str) -> Option<Key> {
        let text = text.trim();
        let mut chars = text.chars();
        let tonic_step = Step::from_char(chars.next()?)?;
        let rest: String = chars.collect();
        let rest = rest.trim();

        let (alter, mode_text) = if let Some(r) = rest.strip_prefix('#') {
            (1i8, r)
        } else if let Some(r) = rest.strip_prefix('b') {
            // "b" could start a mode word; only treat as flat if what
            // follows is not a letter run forming a known mode on its own
            (-1i8, r)
        } else {
            (0i8, rest)
        };

        let mode = parse_mode(mode_text);

        // Fifths of the major key on this tonic: C=0, moving +1 per fifth
        // upward (G, D, ...) and -1 downward (F, Bb, ...).
        let natural_fifths: i8 = match tonic_step {
            Step::C => 0,
            Step::G => 1,
            Step::D => 2,
            Step::A => 3,
            Step::E => 4,
            Step::B => 5,
            Step::F => -1,
        };
        let fifths = natural_fifths + 7 * alter + mode.fifths_offset();
        if !(-7..=7).contains(&fifths) {
            return None;
        }
        Some(Key { fifths, mode })
    }

    /// ABC `K:` field text for this key ("D", "Gm", "Ador")
    pub fn abc_text(&self) -> String {
        let major_fifths = self.fifths - self.mode.fifths_offset();
        let tonic = match major_fifths {
            -7 => "Cb",
            -6 => "Gb",
            -5 => "Db",
            -4 => "Ab",
            -3 => "Eb",
            -2 => "Bb",
            -1 => "F",
            0 => "C",
            1 => "G",
            2 => "D",
            3 => "A",
            4 => "E",
            5 => "B",
            6 => "F#",
            _ => "C#",
        };
        let suffix = match self.mode {
            Mode::Major => "",
            Mode::Minor => "m",
            Mode::Dorian => "dor",
            Mode::Phrygian => "phr",
            Mode::Lydian => "lyd",
            Mode::Mixolydian => "mix",
            Mode::Locrian => "loc",
        };
        format!("{}{}", tonic, suffix)
    }

    /// Implied alteration for a step under this key signature
    pub fn alter_for(&self, step: Step) -> i8 {
        if self.fifths > 0 {
            if SHARP_ORDER[..self.fifths as usize].contains(&step) {
                return 1;
            }
        } else if self.fifths < 0 {
            let flats = (-self.fifths) as usize;
            // Flats are added in the reverse of the sharp order
            if SHARP_ORDER[7 - flats..].contains(&step) {
                return -1;
            }
        }
        0
    }
}

fn parse_mode(text: &str) -> Mode {
    let lower = text.trim().to_ascii_lowercase();
    let word = lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    if word.starts_with("maj") || word == "ionian" {
        Mode::Major
    } else if word.starts_with("min") || word == "m" || word == "aeo" || word.starts_with("aeol") {
        Mode::Minor
    } else if word.starts_with("dor") {
        Mode::Dorian
    } else if word.starts_with("phr") {
        Mode::Phrygian
    } else if word.starts_with("lyd") {
        Mode::Lydian
    } else if word.starts_with("mix") {
        Mode::Mixolydian
    } else if word.starts_with("loc") {
        Mode::Locrian
    } else {
        Mode::Major
    }
}

/// Clef of a voice or staff
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Clef {
    #[default]
    Treble,
    Bass,
    Alto,
    Tenor,
    /// Treble sounding an octave lower (guitar, tenor voice)
    TrebleDown8,
    /// Bass sounding an octave lower
    BassDown8,
    Percussion,
    Tab,
}

impl Clef {
    /// Find a clef word inside a `K:` or `V:` field value
    pub fn parse(text: &str) -> Option<Clef> {
        let lower = text.to_ascii_lowercase();
        // Explicit clef=... wins over bare words
        let target = if let Some(pos) = lower.find("clef=") {
            lower[pos + 5..]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string()
        } else {
            lower
        };
        for word in target.split_whitespace() {
            let clef = match word {
                "treble" | "g2" => Some(Clef::Treble),
                "treble-8" | "treble8vb" => Some(Clef::TrebleDown8),
                "bass" | "f4" => Some(Clef::Bass),
                "bass-8" => Some(Clef::BassDown8),
                "alto" | "c3" => Some(Clef::Alto),
                "tenor" | "c4" => Some(Clef::Tenor),
                "perc" | "percussion" => Some(Clef::Percussion),
                "tab" | "tablature" => Some(Clef::Tab),
                _ => None,
            };
            if clef.is_some() {
                return clef;
            }
        }
        None
    }

    /// MusicXML (sign, line, octave-change)
    pub fn xml_parts(&self) -> (&'static str, i32, i8) {
        match self {
            Clef::Treble => ("G", 2, 0),
            Clef::TrebleDown8 => ("G", 2, -1),
            Clef::Bass => ("F", 4, 0),
            Clef::BassDown8 => ("F", 4, -1),
            Clef::Alto => ("C", 3, 0),
            Clef::Tenor => ("C", 4, 0),
            Clef::Percussion => ("percussion", 2, 0),
            Clef::Tab => ("TAB", 5, 0),
        }
    }

    /// ABC clef word for a `V:` field
    pub fn abc_name(&self) -> &'static str {
        match self {
            Clef::Treble => "treble",
            Clef::TrebleDown8 => "treble-8",
            Clef::Bass => "bass",
            Clef::BassDown8 => "bass-8",
            Clef::Alto => "alto",
            Clef::Tenor => "tenor",
            Clef::Percussion => "perc",
            Clef::Tab => "tab",
        }
    }
}

/// Time signature
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSig {
    pub beats: i32,
    pub beat_type: i32,
    /// "common"/"cut" display symbol, if the source used one
    pub symbol: Option<MeterSymbol>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterSymbol {
    Common,
    Cut,
}

impl Default for TimeSig {
    fn default() -> Self {
        TimeSig { beats: 4, beat_type: 4, symbol: None }
    }
}

impl TimeSig {
    /// Parse an `M:` field value ("4/4", "C", "C|", "6/8", "none")
    pub fn parse(text: &str) -> Option<TimeSig> {
        let t = text.trim();
        match t {
            "C" => {
                return Some(TimeSig { beats: 4, beat_type: 4, symbol: Some(MeterSymbol::Common) })
            }
            "C|" => {
                return Some(TimeSig { beats: 2, beat_type: 2, symbol: Some(MeterSymbol::Cut) })
            }
            "none" | "" => return None,
            _ => {}
        }
        // "a+b+c/d" numerators are summed
        let (num_text, den_text) = t.split_once('/')?;
        let beats: i32 = num_text
            .split('+')
            .map(|p| p.trim().parse::<i32>().unwrap_or(0))
            .sum();
        let beat_type: i32 = den_text.trim().parse().ok()?;
        if beats <= 0 || beat_type <= 0 {
            return None;
        }
        Some(TimeSig { beats, beat_type, symbol: None })
    }

    /// Nominal measure duration in quarter notes
    pub fn measure_dur(&self) -> Dur {
        Dur::new(self.beats * 4, self.beat_type)
    }

    /// Default unit note length implied by this meter when no `L:` is
    /// given: 1/16 below 3/4, otherwise 1/8
    pub fn default_unit(&self) -> Dur {
        if self.beats * 4 < self.beat_type * 3 {
            Dur::new(1, 4) // 1/16 note = quarter/4
        } else {
            Dur::new(1, 2) // 1/8 note = quarter/2
        }
    }

    pub fn abc_text(&self) -> String {
        match self.symbol {
            Some(MeterSymbol::Common) => "C".to_string(),
            Some(MeterSymbol::Cut) => "C|".to_string(),
            None => format!("{}/{}", self.beats, self.beat_type),
        }
    }
}

/// Tempo marking from a `Q:` field
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tempo {
    /// Beat unit in quarter notes (e.g. 1/8 note = Dur 1/2)
    pub unit: Dur,
    pub bpm: i32,
    pub text: Option<String>,
}

impl Tempo {
    /// Parse a `Q:` field value: `1/4=120`, `120`, `"Allegro" 1/4=120`
    pub fn parse(text: &str) -> Option<Tempo> {
        let mut label = None;
        let mut rest = text.trim();
        if let Some(stripped) = rest.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                label = Some(stripped[..end].to_string());
                rest = stripped[end + 1..].trim();
            }
        }
        if rest.is_empty() {
            return label.map(|t| Tempo { unit: Dur::from_int(1), bpm: 0, text: Some(t) });
        }
        if let Some((unit_text, bpm_text)) = rest.split_once('=') {
            let (n, d) = unit_text
                .trim()
                .split_once('/')
                .and_then(|(a, b)| Some((a.trim().parse::<i32>().ok()?, b.trim().parse::<i32>().ok()?)))
                .unwrap_or((1, 4));
            let bpm = bpm_text.trim().parse().ok()?;
            // n/d of a whole note, expressed in quarters
            Some(Tempo { unit: Dur::new(n * 4, d), bpm, text: label })
        } else {
            // Bare number: quarter = N
            let bpm = rest.parse().ok()?;
            Some(Tempo { unit: Dur::from_int(1), bpm, text: label })
        }
    }

    /// ABC `Q:` field text; the unit converts from quarter multiples back
    /// to a fraction of a whole note
    pub fn abc_text(&self) -> String {
        let mut s = String::new();
        if let Some(text) = &self.text {
            s.push_str(&format!("\"{}\"", text));
            if self.bpm > 0 {
                s.push(' ');
            }
        }
        if self.bpm > 0 {
            let whole = self.unit * Dur::new(1, 4);
            s.push_str(&format!("{}/{}={}", whole.numer(), whole.denom(), self.bpm));
        }
        s
    }

    /// Tempo in quarter notes per minute, for the MusicXML `<sound>` element
    pub fn quarter_bpm(&self) -> i32 {
        let (q, _) = self.unit.checked_mul(Dur::from_int(self.bpm));
        q.in_divisions(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse_major_minor() {
        assert_eq!(Key::parse("G").unwrap().fifths, 1);
        assert_eq!(Key::parse("Gm").unwrap(), Key { fifths: -2, mode: Mode::Minor });
        assert_eq!(Key::parse("F#").unwrap().fifths, 6);
        assert_eq!(Key::parse("Bb").unwrap().fifths, -2);
        assert_eq!(Key::parse("Ador").unwrap(), Key { fifths: 1, mode: Mode::Dorian });
        assert_eq!(Key::parse("Dmix").unwrap(), Key { fifths: 1, mode: Mode::Mixolydian });
    }

    #[test]
    fn test_key_implied_alterations() {
        let d_major = Key::parse("D").unwrap();
        assert_eq!(d_major.alter_for(Step::F), 1);
        assert_eq!(d_major.alter_for(Step::C), 1);
        assert_eq!(d_major.alter_for(Step::G), 0);
        let f_major = Key::parse("F").unwrap();
        assert_eq!(f_major.alter_for(Step::B), -1);
        assert_eq!(f_major.alter_for(Step::E), 0);
    }

    #[test]
    fn test_key_abc_round_trip() {
        for text in ["C", "G", "D", "Bb", "F#", "Gm", "Ador", "Dmix"] {
            let key = Key::parse(text).unwrap();
            assert_eq!(key.abc_text(), text);
        }
    }

    #[test]
    fn test_clef_parse() {
        assert_eq!(Clef::parse("C clef=bass"), Some(Clef::Bass));
        assert_eq!(Clef::parse("treble-8"), Some(Clef::TrebleDown8));
        assert_eq!(Clef::parse("G"), None);
        assert_eq!(Clef::parse("perc"), Some(Clef::Percussion));
    }

    #[test]
    fn test_meter_parse() {
        assert_eq!(TimeSig::parse("6/8").unwrap().measure_dur(), Dur::from_int(3));
        assert_eq!(TimeSig::parse("C").unwrap().symbol, Some(MeterSymbol::Common));
        assert!(TimeSig::parse("none").is_none());
        assert_eq!(TimeSig::parse("2+3/8").unwrap().beats, 5);
    }

    #[test]
    fn test_default_unit() {
        // 2/4 < 3/4 so sixteenths; 4/4 gets eighths
        assert_eq!(TimeSig::parse("2/4").unwrap().default_unit(), Dur::new(1, 4));
        assert_eq!(TimeSig::parse("4/4").unwrap().default_unit(), Dur::new(1, 2));
    }

    #[test]
    fn test_tempo_parse() {
        let q = Tempo::parse("1/4=120").unwrap();
        assert_eq!(q.bpm, 120);
        assert_eq!(q.quarter_bpm(), 120);
        let q = Tempo::parse("1/8=90").unwrap();
        assert_eq!(q.quarter_bpm(), 45);
        let q = Tempo::parse("\"Allegro\" 1/2=60").unwrap();
        assert_eq!(q.text.as_deref(), Some("Allegro"));
        assert_eq!(q.quarter_bpm(), 120);
        assert_eq!(q.abc_text(), "\"Allegro\" 1/2=60");
        assert_eq!(Tempo::parse("1/4=120").unwrap().abc_text(), "1/4=120");
    }
}
