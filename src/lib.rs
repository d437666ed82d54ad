//! Two-way converter between ABC music notation and MusicXML.
//!
//! Both directions go through one internal model: the ABC grammar (or the
//! MusicXML importer) builds a [`models::Tune`], post-processing puts it
//! into canonical form, and the opposite renderer writes it back out.
//! Conversions collect [`diagnostics::Diagnostics`] for everything that
//! had to be approximated; only unparseable input is an error.
//!
//! ```no_run
//! use abcxml::{abc_to_musicxml, Options};
//!
//! let abc = "X:1\nT:Air\nM:4/4\nL:1/4\nK:G\nGABc|d4|]\n";
//! let conv = abc_to_musicxml(abc, &Options::default())?;
//! println!("{}", conv.output);
//! # Ok::<(), abcxml::ConvertError>(())
//! ```

pub mod abc_out;
pub mod diagnostics;
pub mod models;
pub mod musicxml;
pub mod musicxml_import;
pub mod parse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use diagnostics::{Diagnostic, Diagnostics, Severity};

use abc_out::WrapOptions;
use musicxml_import::ImportError;
use parse::{PostprocessOptions, SyntaxError};

/// Conversion settings shared by both directions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
#[serde(default)]
pub struct Options {
    /// Which tune of a multi-tune ABC file to convert (zero-based)
    pub tune_index: usize,
    /// Reorder chord members lowest pitch first
    pub order_chords_by_pitch: bool,
    /// Wrap ABC output lines at this many characters
    pub max_line_chars: Option<usize>,
    /// Wrap ABC output lines after this many bars (characters win when
    /// both are set)
    pub max_line_bars: Option<usize>,
}

/// A successful conversion: the output document plus everything the
/// converter had to approximate along the way
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversion {
    pub output: String,
    pub diagnostics: Diagnostics,
}

/// Errors that abort a conversion
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("syntax error at line {line}, column {col}: {message}\n  {context}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
        context: String,
    },
    #[error("malformed MusicXML: {0}")]
    XmlMalformed(String),
    #[error("no tune at index {0}")]
    NoSuchTune(usize),
}

impl From<SyntaxError> for ConvertError {
    fn from(e: SyntaxError) -> Self {
        ConvertError::Syntax {
            line: e.line,
            col: e.col,
            message: e.message,
            context: e.context,
        }
    }
}

impl From<ImportError> for ConvertError {
    fn from(e: ImportError) -> Self {
        ConvertError::XmlMalformed(e.to_string())
    }
}

/// Number of tunes in an ABC file
pub fn tune_count(src: &str) -> usize {
    parse::split_tunes(src).len()
}

/// Convert one tune of an ABC file to a MusicXML score-partwise document
pub fn abc_to_musicxml(src: &str, opts: &Options) -> Result<Conversion, ConvertError> {
    let tunes = parse::split_tunes(src);
    let (first_line, text) = tunes
        .get(opts.tune_index)
        .ok_or(ConvertError::NoSuchTune(opts.tune_index))?;
    let mut diags = Diagnostics::new();
    let post = PostprocessOptions {
        order_chords_by_pitch: opts.order_chords_by_pitch,
    };
    let tune = parse::parse_tune(text, *first_line, post, &mut diags)?;
    let output = musicxml::build_score(&tune, &mut diags);
    Ok(Conversion { output, diagnostics: diags })
}

/// Convert a MusicXML score-partwise document to ABC
pub fn musicxml_to_abc(xml: &str, opts: &Options) -> Result<Conversion, ConvertError> {
    let mut diags = Diagnostics::new();
    let tune = musicxml_import::parse_score(xml, &mut diags)?;
    let wrap = WrapOptions {
        max_chars: opts.max_line_chars,
        max_bars: opts.max_line_bars,
    };
    let output = abc_out::render_tune(&tune, wrap, &mut diags);
    Ok(Conversion { output, diagnostics: diags })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abc_to_musicxml() {
        let conv = abc_to_musicxml(
            "X:1\nT:Air\nM:4/4\nL:1/4\nK:G\nGABc|d4|]\n",
            &Options::default(),
        )
        .unwrap();
        assert!(conv.output.contains("<score-partwise"));
        assert!(conv.output.contains("<movement-title>Air</movement-title>"));
        assert!(conv.output.contains("<fifths>1</fifths>"));
    }

    #[test]
    fn test_tune_index_selects_tune() {
        let src = "X:1\nK:C\nC4|]\n\nX:2\nT:Second\nK:D\nD4|]\n";
        assert_eq!(tune_count(src), 2);
        let conv = abc_to_musicxml(src, &Options { tune_index: 1, ..Default::default() }).unwrap();
        assert!(conv.output.contains("Second"));
        assert!(matches!(
            abc_to_musicxml(src, &Options { tune_index: 5, ..Default::default() }),
            Err(ConvertError::NoSuchTune(5))
        ));
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let err = abc_to_musicxml("X:1\nK:C\n[CE\n", &Options::default()).unwrap_err();
        match err {
            ConvertError::Syntax { line, context, .. } => {
                assert_eq!(line, 3);
                assert_eq!(context, "[CE");
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_musicxml_to_abc() {
        let xml = abc_to_musicxml(
            "X:1\nT:Air\nM:4/4\nL:1/4\nK:G\nGABc|d4|]\n",
            &Options::default(),
        )
        .unwrap()
        .output;
        let conv = musicxml_to_abc(&xml, &Options::default()).unwrap();
        assert!(conv.output.starts_with("X:1\n"));
        assert!(conv.output.contains("T:Air"));
        assert!(conv.output.contains("K:G"));
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(matches!(
            musicxml_to_abc("<score-partwise>", &Options::default()),
            Err(ConvertError::XmlMalformed(_))
        ));
    }
}
