//! Command-line front end: converts each input file in the direction
//! implied by its extension and keeps going when one file fails.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use abcxml::{abc_to_musicxml, musicxml_to_abc, tune_count, Options};

#[derive(Parser, Debug)]
#[command(
    name = "abcxml",
    version,
    about = "Convert between ABC notation and MusicXML",
    long_about = "Converts each input file in the direction implied by its \
extension: .abc and .txt become MusicXML, .xml and .musicxml become ABC. \
Output goes to stdout unless -o names a directory."
)]
struct Cli {
    /// Input files (.abc/.txt or .xml/.musicxml)
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Write output files into this directory instead of stdout
    #[arg(short, long, value_name = "OUTDIR")]
    outdir: Option<PathBuf>,

    /// For multi-tune ABC files: skip SKIP tunes, then convert NUM tunes
    #[arg(short = 'm', value_name = "SKIP,NUM", value_parser = parse_selection)]
    tunes: Option<(usize, usize)>,

    /// Order chord members lowest pitch first
    #[arg(short = 'u', long = "ordered-chords")]
    ordered_chords: bool,

    /// Wrap ABC output after this many bars per line
    #[arg(short = 'b', value_name = "BARS")]
    bars: Option<usize>,

    /// Wrap ABC output lines at this many characters (wins over -b)
    #[arg(short = 'n', value_name = "CHARS")]
    chars: Option<usize>,

    /// Verbosity: 0 errors only, 1 adds warnings, 2 adds info
    #[arg(short = 'v', value_name = "LEVEL", default_value_t = 1)]
    verbose: u8,
}

fn parse_selection(s: &str) -> Result<(usize, usize), String> {
    let (skip, num) = s
        .split_once(',')
        .ok_or_else(|| format!("expected SKIP,NUM, got '{}'", s))?;
    let skip = skip
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("bad SKIP value '{}': {}", skip, e))?;
    let num = num
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("bad NUM value '{}': {}", num, e))?;
    if num == 0 {
        return Err("NUM must be at least 1".into());
    }
    Ok((skip, num))
}

enum Direction {
    ToMusicXml,
    ToAbc,
}

fn direction_of(path: &Path) -> Option<Direction> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "abc" | "txt" => Some(Direction::ToMusicXml),
        "xml" | "musicxml" => Some(Direction::ToAbc),
        _ => None,
    }
}

/// Output file name for tune `index`; multi-tune selections get a numbered
/// suffix so they don't overwrite each other.
fn output_name(input: &Path, index: usize, multiple: bool, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    if multiple {
        PathBuf::from(format!("{}{:02}.{}", stem, index + 1, ext))
    } else {
        PathBuf::from(format!("{}.{}", stem, ext))
    }
}

fn emit(outdir: Option<&Path>, name: &Path, text: &str) -> std::io::Result<()> {
    match outdir {
        Some(dir) => fs::write(dir.join(name), text),
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}

/// Convert one input file; returns false if any tune in it failed.
fn convert_file(path: &Path, cli: &Cli, opts: &Options) -> bool {
    let dir = match direction_of(path) {
        Some(d) => d,
        None => {
            log::error!("{}: unrecognized extension, skipped", path.display());
            return false;
        }
    };
    let src = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{}: {}", path.display(), e);
            return false;
        }
    };
    let mut ok = true;
    match dir {
        Direction::ToMusicXml => {
            let count = tune_count(&src);
            let (skip, num) = cli.tunes.unwrap_or((0, 1));
            let last = (skip + num).min(count);
            if skip >= count {
                log::error!(
                    "{}: has {} tune(s), cannot skip {}",
                    path.display(),
                    count,
                    skip
                );
                return false;
            }
            let multiple = last - skip > 1;
            for index in skip..last {
                let tune_opts = Options {
                    tune_index: index,
                    ..*opts
                };
                match abc_to_musicxml(&src, &tune_opts) {
                    Ok(conv) => {
                        let name = output_name(path, index, multiple, "xml");
                        if let Err(e) = emit(cli.outdir.as_deref(), &name, &conv.output) {
                            log::error!("{}: {}", name.display(), e);
                            ok = false;
                        }
                    }
                    Err(e) => {
                        log::error!("{} (tune {}): {}", path.display(), index + 1, e);
                        ok = false;
                    }
                }
            }
        }
        Direction::ToAbc => match musicxml_to_abc(&src, opts) {
            Ok(conv) => {
                let name = output_name(path, 0, false, "abc");
                if let Err(e) = emit(cli.outdir.as_deref(), &name, &conv.output) {
                    log::error!("{}: {}", name.display(), e);
                    ok = false;
                }
            }
            Err(e) => {
                log::error!("{}: {}", path.display(), e);
                ok = false;
            }
        },
    }
    ok
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "error",
        1 => "warn",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Some(dir) = &cli.outdir {
        if let Err(e) = fs::create_dir_all(dir) {
            log::error!("{}: {}", dir.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let opts = Options {
        tune_index: 0,
        order_chords_by_pitch: cli.ordered_chords,
        max_line_chars: cli.chars,
        max_line_bars: cli.bars,
    };

    let mut all_ok = true;
    for path in &cli.files {
        if !convert_file(path, &cli, &opts) {
            all_ok = false;
        }
    }
    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_parsing() {
        assert_eq!(parse_selection("0,1").unwrap(), (0, 1));
        assert_eq!(parse_selection("2, 3").unwrap(), (2, 3));
        assert!(parse_selection("2").is_err());
        assert!(parse_selection("0,0").is_err());
    }

    #[test]
    fn test_direction_by_extension() {
        assert!(matches!(
            direction_of(Path::new("air.abc")),
            Some(Direction::ToMusicXml)
        ));
        assert!(matches!(
            direction_of(Path::new("air.MusicXML")),
            Some(Direction::ToAbc)
        ));
        assert!(direction_of(Path::new("air.pdf")).is_none());
    }

    #[test]
    fn test_output_naming() {
        assert_eq!(
            output_name(Path::new("dir/air.abc"), 0, false, "xml"),
            PathBuf::from("air.xml")
        );
        assert_eq!(
            output_name(Path::new("air.abc"), 2, true, "xml"),
            PathBuf::from("air03.xml")
        );
    }
}
