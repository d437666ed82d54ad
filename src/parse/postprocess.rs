//! AST post-processing
//!
//! Rewrites each measure into the canonical form the MusicXML builder
//! consumes. Every transform builds a new item list from the old one
//! rather than splicing in place.
//!
//! Order matters: broken rhythm first (it pairs adjacent notes/chords),
//! then chord flattening (it multiplies the resolved durations through
//! the members), then grace grouping, then tuplet resolution (it counts
//! sounding groups, so graces and chord members must be flagged first).

use crate::diagnostics::Diagnostics;
use crate::models::{Dur, Measure, MeasureItem, Note, TupletSpan};

/// Options controlling post-processing
#[derive(Clone, Copy, Debug, Default)]
pub struct PostprocessOptions {
    /// Reorder chord members lowest-pitch-first before flattening
    pub order_chords_by_pitch: bool,
}

/// Run all per-measure transforms over a voice's measures
pub fn postprocess_measures(
    measures: Vec<Measure>,
    opts: PostprocessOptions,
    diags: &mut Diagnostics,
) -> Vec<Measure> {
    measures
        .into_iter()
        .map(|m| {
            let m = resolve_broken_rhythm(m, diags);
            let m = flatten_chords(m, opts, diags);
            let m = group_grace_notes(m, diags);
            resolve_tuplets(m, diags)
        })
        .collect()
}

/// Is this item a duration carrier a broken-rhythm marker can pair with?
fn carries_duration(item: &MeasureItem) -> bool {
    matches!(item, MeasureItem::Note(_) | MeasureItem::Chord(_))
}

fn scale_item(item: &mut MeasureItem, ratio: Dur, diags: &mut Diagnostics) {
    let (dur, rounded) = match item {
        MeasureItem::Note(n) => {
            let r = n.dur.checked_mul(ratio);
            n.dur = r.0;
            r
        }
        MeasureItem::Chord(ch) => {
            let r = ch.dur_mult.checked_mul(ratio);
            ch.dur_mult = r.0;
            r
        }
        _ => return,
    };
    if rounded {
        diags.warn(
            "duration_rounded",
            format!("broken rhythm produced an unrepresentable duration, rounded to {}", dur),
        );
    }
}

/// Resolve `>`/`<` markers by rescaling the two neighbours and dropping
/// the marker. A measure without markers passes through unchanged.
fn resolve_broken_rhythm(measure: Measure, diags: &mut Diagnostics) -> Measure {
    if !measure.items.iter().any(|i| matches!(i, MeasureItem::Broken(_))) {
        return measure;
    }

    let Measure { items, right, volta, line_break_after } = measure;
    let mut out: Vec<MeasureItem> = Vec::with_capacity(items.len());
    let mut iter = items.into_iter().peekable();

    while let Some(item) = iter.next() {
        let MeasureItem::Broken(broken) = item else {
            out.push(item);
            continue;
        };
        let left_idx = out.iter().rposition(carries_duration);
        // Skip non-carrier items (decoration fields etc.) to find the
        // right-hand partner
        let mut passed: Vec<MeasureItem> = Vec::new();
        let right_item = loop {
            match iter.next() {
                Some(next) if carries_duration(&next) => break Some(next),
                Some(next) => passed.push(next),
                None => break None,
            }
        };
        match (left_idx, right_item) {
            (Some(li), Some(mut ri)) => {
                let (l_ratio, r_ratio) = broken.ratios();
                scale_item(&mut out[li], l_ratio, diags);
                scale_item(&mut ri, r_ratio, diags);
                out.append(&mut passed);
                out.push(ri);
            }
            (_, right_item) => {
                diags.warn(
                    "broken_rhythm_unpaired",
                    format!("'{}' marker has no note on both sides; ignored", broken.abc_text()),
                );
                out.append(&mut passed);
                if let Some(ri) = right_item {
                    out.push(ri);
                }
            }
        }
    }

    Measure { items: out, right, volta, line_break_after }
}

/// Flatten each chord into a carrier note followed by chord-member notes
fn flatten_chords(measure: Measure, opts: PostprocessOptions, diags: &mut Diagnostics) -> Measure {
    if !measure.items.iter().any(|i| matches!(i, MeasureItem::Chord(_))) {
        return measure;
    }

    let Measure { items, right, volta, line_break_after } = measure;
    let mut out: Vec<MeasureItem> = Vec::with_capacity(items.len());

    for item in items {
        let MeasureItem::Chord(chord) = item else {
            out.push(item);
            continue;
        };
        let mut members: Vec<Note> = chord.notes;
        if opts.order_chords_by_pitch {
            members.sort_by_key(|n| n.pitch.map(|p| p.sort_key()));
        }
        let chord_pitches: Vec<_> = members.iter().filter_map(|n| n.pitch).collect();
        for (i, note) in members.iter_mut().enumerate() {
            let (dur, rounded) = note.dur.checked_mul(chord.dur_mult);
            note.dur = dur;
            if rounded {
                diags.warn(
                    "duration_rounded",
                    "chord member duration rounded to nearest representable value",
                );
            }
            // Tie transfers to every member; slur/decoration annotations
            // only to the carrier
            note.tie = note.tie || chord.tie;
            if i == 0 {
                note.slur_starts += chord.slur_starts;
                note.slur_ends += chord.slur_ends;
                note.decorations.extend(chord.decorations.iter().cloned());
                note.beam_break = chord.beam_break;
                note.chord_pitches = chord_pitches.clone();
                note.span = chord.span;
            } else {
                note.chord_member = true;
            }
        }
        out.extend(members.into_iter().map(MeasureItem::Note));
    }

    Measure { items: out, right, volta, line_break_after }
}

/// Flag every note between GraceOpen/GraceClose as a grace note and drop
/// the markers
fn group_grace_notes(measure: Measure, diags: &mut Diagnostics) -> Measure {
    if !measure.items.iter().any(|i| matches!(i, MeasureItem::GraceOpen)) {
        // A stray close without an open still needs removing
        if measure.items.iter().any(|i| matches!(i, MeasureItem::GraceClose)) {
            diags.warn("grace_unmatched", "'}' without matching '{'; ignored");
            let mut m = measure;
            m.items.retain(|i| !matches!(i, MeasureItem::GraceClose));
            return m;
        }
        return measure;
    }

    let Measure { items, right, volta, line_break_after } = measure;
    let mut out = Vec::with_capacity(items.len());
    let mut in_grace = false;

    for item in items {
        match item {
            MeasureItem::GraceOpen => {
                if in_grace {
                    diags.warn("grace_unmatched", "nested '{' in grace group; ignored");
                }
                in_grace = true;
            }
            MeasureItem::GraceClose => {
                if !in_grace {
                    diags.warn("grace_unmatched", "'}' without matching '{'; ignored");
                }
                in_grace = false;
            }
            MeasureItem::Note(mut n) => {
                if in_grace {
                    n.grace = true;
                }
                out.push(MeasureItem::Note(n));
            }
            other => out.push(other),
        }
    }
    if in_grace {
        diags.warn("grace_unmatched", "grace group never closed before the barline");
    }

    Measure { items: out, right, volta, line_break_after }
}

/// Resolve `(p:q:r` markers: scale the next `r` sounding groups by q/p and
/// stamp them with their tuplet span, then drop the marker. After this
/// pass every note's `dur` is its true sounding duration.
fn resolve_tuplets(measure: Measure, diags: &mut Diagnostics) -> Measure {
    if !measure.items.iter().any(|i| matches!(i, MeasureItem::TupletStart { .. })) {
        return measure;
    }

    let Measure { items, right, volta, line_break_after } = measure;
    let mut out: Vec<MeasureItem> = Vec::with_capacity(items.len());
    // (p, q, groups remaining, whether the start flag is still unplaced)
    let mut active: Option<(u8, u8, u8, bool)> = None;
    // Ratio applying to chord members trailing a scaled carrier
    let mut member_scale: Option<(u8, u8)> = None;
    let mut last_stamped: Option<usize> = None;

    for item in items {
        match item {
            MeasureItem::TupletStart { p, q, r } => {
                if active.is_some() {
                    diags.warn("tuplet_nested", "tuplet inside an open tuplet; outer one closed early");
                }
                active = Some((p, q, r, true));
            }
            MeasureItem::Note(mut n) => {
                if n.grace {
                    out.push(MeasureItem::Note(n));
                } else if n.chord_member {
                    if let Some((p, q)) = member_scale {
                        scale_tuplet_note(&mut n, p, q, diags);
                        n.tuplet = Some(TupletSpan { p, q, start: false, stop: false });
                    }
                    out.push(MeasureItem::Note(n));
                } else {
                    match active {
                        Some((p, q, remaining, first)) if remaining > 0 => {
                            scale_tuplet_note(&mut n, p, q, diags);
                            n.tuplet = Some(TupletSpan {
                                p,
                                q,
                                start: first,
                                stop: remaining == 1,
                            });
                            member_scale = Some((p, q));
                            last_stamped = Some(out.len());
                            active = if remaining == 1 {
                                None
                            } else {
                                Some((p, q, remaining - 1, false))
                            };
                        }
                        _ => {
                            member_scale = None;
                            active = None;
                        }
                    }
                    out.push(MeasureItem::Note(n));
                }
            }
            other => out.push(other),
        }
    }

    // A tuplet cut short by the barline still needs its stop flag
    if active.is_some() {
        diags.warn("tuplet_short", "tuplet spans fewer notes than declared");
        if let Some(idx) = last_stamped {
            if let MeasureItem::Note(n) = &mut out[idx] {
                if let Some(t) = &mut n.tuplet {
                    t.stop = true;
                }
            }
        }
    }

    Measure { items: out, right, volta, line_break_after }
}

fn scale_tuplet_note(n: &mut Note, p: u8, q: u8, diags: &mut Diagnostics) {
    let (dur, rounded) = n.dur.checked_mul(Dur::new(q as i32, p as i32));
    n.dur = dur;
    if rounded {
        diags.warn(
            "duration_rounded",
            "tuplet produced an unrepresentable duration, rounded",
        );
    }
}

/// Check each measure's sounding duration against the nominal duration.
/// Mismatches are reported, never fatal. The first measure is allowed to
/// be short (anacrusis).
pub fn check_measure_durations(
    measures: &[Measure],
    nominal: Dur,
    voice_id: &str,
    diags: &mut Diagnostics,
) {
    for (i, m) in measures.iter().enumerate() {
        if m.items.is_empty() {
            continue;
        }
        let total = m.sounding_dur();
        if total == nominal || total.is_zero() {
            continue;
        }
        let anacrusis = i == 0 && total < nominal;
        let final_partial = i + 1 == measures.len() && total < nominal;
        if !anacrusis && !final_partial {
            diags.warn(
                "measure_duration",
                format!(
                    "voice {}: measure {} sums to {} quarter notes, expected {}",
                    voice_id,
                    i + 1,
                    total,
                    nominal
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Broken, Chord, Pitch, Span, Step};

    fn note(dur: Dur, step: Step) -> Note {
        Note::new(dur, Some(Pitch::new(step, 0, 4)))
    }

    fn measure(items: Vec<MeasureItem>) -> Measure {
        Measure { items, ..Default::default() }
    }

    fn run(m: Measure) -> (Measure, Diagnostics) {
        let mut diags = Diagnostics::new();
        let out = postprocess_measures(vec![m], PostprocessOptions::default(), &mut diags);
        (out.into_iter().next().unwrap(), diags)
    }

    #[test]
    fn test_broken_rhythm_single() {
        // A>B with L:1/8: A gets 3/16 of a whole = 3/4 quarter, B gets 1/4
        let m = measure(vec![
            MeasureItem::Note(note(Dur::new(1, 2), Step::A)),
            MeasureItem::Broken(Broken::RightSingle),
            MeasureItem::Note(note(Dur::new(1, 2), Step::B)),
        ]);
        let (out, _) = run(m);
        let durs: Vec<Dur> = out
            .items
            .iter()
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some(n.dur),
                _ => None,
            })
            .collect();
        assert_eq!(durs, vec![Dur::new(3, 4), Dur::new(1, 4)]);
        assert!(!out.items.iter().any(|i| matches!(i, MeasureItem::Broken(_))));
    }

    #[test]
    fn test_broken_rhythm_double_left() {
        let m = measure(vec![
            MeasureItem::Note(note(Dur::from_int(1), Step::A)),
            MeasureItem::Broken(Broken::LeftDouble),
            MeasureItem::Note(note(Dur::from_int(1), Step::B)),
        ]);
        let (out, _) = run(m);
        let durs: Vec<Dur> = out
            .items
            .iter()
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some(n.dur),
                _ => None,
            })
            .collect();
        assert_eq!(durs, vec![Dur::new(1, 4), Dur::new(7, 4)]);
    }

    #[test]
    fn test_broken_rhythm_noop_without_marker() {
        let m = measure(vec![MeasureItem::Note(note(Dur::from_int(1), Step::A))]);
        let before = m.clone();
        let (out, diags) = run(m);
        assert_eq!(out, before);
        assert!(diags.is_empty());
    }

    #[test]
    fn test_chord_flattening_durations_and_flags() {
        let chord = Chord {
            notes: vec![
                note(Dur::new(1, 2), Step::C),
                note(Dur::new(1, 2), Step::E),
                note(Dur::new(1, 2), Step::G),
            ],
            dur_mult: Dur::from_int(2),
            tie: true,
            slur_starts: 0,
            slur_ends: 1,
            decorations: vec![],
            beam_break: false,
            span: Span::default(),
        };
        let (out, _) = run(measure(vec![MeasureItem::Chord(chord)]));
        let notes: Vec<&Note> = out
            .items
            .iter()
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notes.len(), 3);
        // Duration multiplied into every member
        assert!(notes.iter().all(|n| n.dur == Dur::from_int(1)));
        // Tie on all, slur end only on the carrier
        assert!(notes.iter().all(|n| n.tie));
        assert_eq!(notes[0].slur_ends, 1);
        assert_eq!(notes[1].slur_ends, 0);
        // Carrier keeps all pitches, members are flagged
        assert_eq!(notes[0].chord_pitches.len(), 3);
        assert!(!notes[0].chord_member);
        assert!(notes[1].chord_member && notes[2].chord_member);
        // Measure total unchanged by flattening
        assert_eq!(out.sounding_dur(), Dur::from_int(1));
    }

    #[test]
    fn test_chord_order_by_pitch() {
        let chord = Chord {
            notes: vec![note(Dur::from_int(1), Step::G), note(Dur::from_int(1), Step::C)],
            dur_mult: Dur::from_int(1),
            tie: false,
            slur_starts: 0,
            slur_ends: 0,
            decorations: vec![],
            beam_break: false,
            span: Span::default(),
        };
        let mut diags = Diagnostics::new();
        let out = postprocess_measures(
            vec![measure(vec![MeasureItem::Chord(chord)])],
            PostprocessOptions { order_chords_by_pitch: true },
            &mut diags,
        );
        let first = match &out[0].items[0] {
            MeasureItem::Note(n) => n.pitch.unwrap().step,
            _ => panic!(),
        };
        assert_eq!(first, Step::C);
    }

    #[test]
    fn test_grace_grouping() {
        let m = measure(vec![
            MeasureItem::GraceOpen,
            MeasureItem::Note(note(Dur::new(1, 2), Step::D)),
            MeasureItem::GraceClose,
            MeasureItem::Note(note(Dur::from_int(1), Step::C)),
        ]);
        let (out, _) = run(m);
        let notes: Vec<&Note> = out
            .items
            .iter()
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some(n),
                _ => None,
            })
            .collect();
        assert!(notes[0].grace);
        assert!(!notes[1].grace);
        assert!(!out.items.iter().any(|i| matches!(i, MeasureItem::GraceOpen)));
    }

    #[test]
    fn test_tuplet_scaling_and_flags() {
        // (3 over three eighths: each sounds 1/3 quarter, total one quarter
        let m = measure(vec![
            MeasureItem::TupletStart { p: 3, q: 2, r: 3 },
            MeasureItem::Note(note(Dur::new(1, 2), Step::A)),
            MeasureItem::Note(note(Dur::new(1, 2), Step::B)),
            MeasureItem::Note(note(Dur::new(1, 2), Step::C)),
        ]);
        let (out, diags) = run(m);
        assert!(diags.is_empty());
        let notes: Vec<&Note> = out
            .items
            .iter()
            .filter_map(|i| match i {
                MeasureItem::Note(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notes.len(), 3);
        assert!(notes.iter().all(|n| n.dur == Dur::new(1, 3)));
        let t0 = notes[0].tuplet.unwrap();
        let t2 = notes[2].tuplet.unwrap();
        assert!(t0.start && !t0.stop);
        assert!(!t2.start && t2.stop);
        assert_eq!(out.sounding_dur(), Dur::from_int(1));
        assert!(!out.items.iter().any(|i| matches!(i, MeasureItem::TupletStart { .. })));
    }

    #[test]
    fn test_tuplet_cut_short_warns() {
        let m = measure(vec![
            MeasureItem::TupletStart { p: 3, q: 2, r: 3 },
            MeasureItem::Note(note(Dur::new(1, 2), Step::A)),
            MeasureItem::Note(note(Dur::new(1, 2), Step::B)),
        ]);
        let (out, diags) = run(m);
        assert!(diags.entries.iter().any(|d| d.kind == "tuplet_short"));
        let last = match &out.items[1] {
            MeasureItem::Note(n) => n,
            _ => panic!(),
        };
        assert!(last.tuplet.unwrap().stop);
    }

    #[test]
    fn test_measure_duration_check() {
        let mut diags = Diagnostics::new();
        let short = measure(vec![MeasureItem::Note(note(Dur::from_int(1), Step::C))]);
        let full = measure(vec![MeasureItem::Note(note(Dur::from_int(4), Step::C))]);
        // Anacrusis (first, short) passes; middle short measure warns
        check_measure_durations(
            &[short.clone(), short, full],
            Dur::from_int(4),
            "1",
            &mut diags,
        );
        let count = diags
            .entries
            .iter()
            .filter(|d| d.kind == "measure_duration")
            .count();
        assert_eq!(count, 1);
    }
}
