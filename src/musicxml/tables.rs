//! Decoration lookup tables
//!
//! Maps ABC decoration names (the text between `!...!`, or the expansion
//! of a shorthand like `.`) onto MusicXML notation elements. A decoration
//! lands in exactly one of four buckets: articulations, ornaments,
//! technical marks, or dynamics directions.

/// Where a decoration is emitted and as which element
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoration {
    /// `<articulations>` child
    Articulation(&'static str),
    /// `<ornaments>` child
    Ornament(&'static str),
    /// `<technical>` child
    Technical(&'static str),
    /// `<fermata/>` sits directly under `<notations>`
    Fermata,
    /// `<direction><dynamics>` before the note
    Dynamic(&'static str),
    /// `<direction><words>` (segno/coda get their own glyph elements)
    Segno,
    Coda,
    Words(&'static str),
}

/// Look up a decoration name. Unknown names return `None`; callers decide
/// whether to drop them silently or report.
pub fn lookup(name: &str) -> Option<Decoration> {
    use Decoration::*;
    let deco = match name {
        "staccato" | "." => Articulation("staccato"),
        "accent" | ">" | "emphasis" | "L" => Articulation("accent"),
        "tenuto" => Articulation("tenuto"),
        "marcato" | "^" => Articulation("strong-accent"),
        "breath" => Articulation("breath-mark"),

        "trill" | "T" => Ornament("trill-mark"),
        "mordent" | "lowermordent" => Ornament("mordent"),
        "pralltriller" | "uppermordent" => Ornament("inverted-mordent"),
        "turn" => Ornament("turn"),
        "invertedturn" => Ornament("inverted-turn"),
        "roll" => Ornament("turn"),

        "upbow" | "u" => Technical("up-bow"),
        "downbow" | "v" => Technical("down-bow"),
        "open" => Technical("open-string"),
        "snap" => Technical("snap-pizzicato"),
        "+" | "plus" => Technical("stopped"),

        "fermata" | "H" => Fermata,

        "p" | "pp" | "ppp" | "pppp" | "f" | "ff" | "fff" | "ffff" | "mp" | "mf" | "sfz"
        | "fp" => {
            return Some(Dynamic(match name {
                "p" => "p",
                "pp" => "pp",
                "ppp" => "ppp",
                "pppp" => "pppp",
                "f" => "f",
                "ff" => "ff",
                "fff" => "fff",
                "ffff" => "ffff",
                "mp" => "mp",
                "mf" => "mf",
                "sfz" => "sfz",
                _ => "fp",
            }))
        }

        "segno" | "S" => Segno,
        "coda" | "O" => Coda,
        "fine" => Words("Fine"),
        "D.C." | "dacapo" => Words("D.C."),
        "D.S." | "dalsegno" => Words("D.S."),
        "crescendo(" | "<(" => Words("cresc."),
        "diminuendo(" | ">(" => Words("dim."),

        _ => return None,
    };
    Some(deco)
}

/// Reverse direction: a MusicXML notation element name back to the ABC
/// decoration it came from. Dynamics map through unchanged ("mf" is both
/// the element and the decoration name).
pub fn from_xml(element: &str) -> Option<&'static str> {
    let name = match element {
        "staccato" => "staccato",
        "accent" => "accent",
        "strong-accent" => "marcato",
        "tenuto" => "tenuto",
        "breath-mark" => "breath",
        "trill-mark" => "trill",
        "mordent" => "lowermordent",
        "inverted-mordent" => "uppermordent",
        "turn" => "turn",
        "inverted-turn" => "invertedturn",
        "up-bow" => "upbow",
        "down-bow" => "downbow",
        "open-string" => "open",
        "snap-pizzicato" => "snap",
        "stopped" => "plus",
        "fermata" => "fermata",
        "p" | "pp" | "ppp" | "pppp" | "f" | "ff" | "fff" | "ffff" | "mp" | "mf" | "sfz" | "fp" => {
            return lookup(element).map(|_| match element {
                "p" => "p",
                "pp" => "pp",
                "ppp" => "ppp",
                "pppp" => "pppp",
                "f" => "f",
                "ff" => "ff",
                "fff" => "fff",
                "ffff" => "ffff",
                "mp" => "mp",
                "mf" => "mf",
                "sfz" => "sfz",
                _ => "fp",
            })
        }
        _ => return None,
    };
    Some(name)
}
