//! Core data model: durations, pitches, AST, per-voice attributes

pub mod duration;
pub mod elements;
pub mod key;
pub mod pitch;

pub use duration::Dur;
pub use elements::{
    BarKind, Barline, Broken, Chord, LyricLine, LyricToken, Measure, MeasureItem, Note, ScoreNode,
    Span, Tune, TupletSpan, Voice,
};
pub use key::{Clef, Key, MeterSymbol, Mode, Tempo, TimeSig};
pub use pitch::{PercussionMapping, Pitch, Step};
