use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use org_archive::archive::{FileArchive, archive_to_file, check_source, check_target, plan};
use org_archive::config::Settings;
use org_archive::document::OrgDocument;
use org_archive::format_outline;
use org_archive::parser::NomOutlineParser;
use org_archive::storage::{LiveDocument, OutlineParser, write_atomically};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "org-archive",
    about = "Archive Org subtrees into an outline that mirrors their ancestors",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Move a heading and its subtree into the archive, keeping its ancestor chain.
    Archive(ArchiveArgs),

    /// Parse an Org file and print its outline tree.
    Parse(ParseArgs),

    /// Re-serialize an Org file through the outline tree.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("cursor").required(true).args(["line", "olp"])))]
struct ArchiveArgs {
    /// Org file holding the heading to archive.
    source: PathBuf,
    /// 1-based line inside the heading to archive (headline or body).
    #[arg(long)]
    line: Option<usize>,
    /// Outline path of the heading to archive, e.g. `Projects/Garden/Fence`.
    #[arg(long)]
    olp: Option<String>,
    /// Archive file; `%s` expands to the source file name.
    #[arg(long, env = "ORG_ARCHIVE_FILE")]
    archive_file: Option<PathBuf>,
    /// TOML config with `archive_file` and `recognized_sources`.
    #[arg(long, env = "ORG_ARCHIVE_CONFIG")]
    config: Option<PathBuf>,
    /// Print the merged archive instead of writing anything.
    #[arg(long)]
    dry_run: bool,
    /// Emit the archive report as JSON (with --dry-run, in place of the merged text).
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org file to parse.
    input: PathBuf,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org file to format.
    input: PathBuf,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Archive(args) => handle_archive(args),
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_archive(args: ArchiveArgs) -> Result<()> {
    let ArchiveArgs {
        source,
        line,
        olp,
        archive_file,
        config,
        dry_run,
        json,
    } = args;

    let settings = load_settings(config.as_deref())?.with_archive_file(archive_file);
    let source =
        fs::canonicalize(&source).with_context(|| format!("resolving path {:?}", source))?;

    // Configuration and source checks come before the source is parsed.
    let target = settings.archive_target(&source)?;
    check_source(&settings, &source)?;
    check_target(&target, &source)?;
    debug!(?source, ?target, "archiving");

    let mut document = match (line, olp) {
        (Some(line), _) => OrgDocument::at_line(&source, line)?,
        (None, Some(olp)) => OrgDocument::at_outline_path(&source, &split_olp(&olp))?,
        (None, None) => anyhow::bail!("either --line or --olp is required"),
    };

    if dry_run {
        let (text, report) = plan(&document, &FileArchive::new(&target))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        eprintln!(
            "Would archive {:?} from {:?} to {:?}",
            report.heading,
            document.location(),
            report.archive
        );
        print!("{text}");
        if !text.is_empty() && !text.ends_with('\n') {
            println!();
        }
        return Ok(());
    }

    let report = archive_to_file(&settings, &mut document)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "Archived {:?} to {:?}{}",
        report.heading,
        report.archive,
        if report.reused_branch {
            " (existing branch)"
        } else {
            ""
        }
    );
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { input, json } = args;
    debug!(?input, "parsing");
    let root = NomOutlineParser.parse_file(&input)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&root)?);
    } else {
        println!("{:#?}", root);
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { input, in_place } = args;
    debug!(?input, "formatting");
    let root = NomOutlineParser.parse_file(&input)?;
    let formatted = format_outline(&root);

    if in_place {
        write_atomically(&input, &formatted).with_context(|| format!("writing {:?}", input))?;
    } else {
        print!("{formatted}");
        if !formatted.is_empty() && !formatted.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

/// Config file settings, with recognized sources canonicalized so they compare
/// against the canonical source path.
fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let Some(path) = config else {
        return Ok(Settings::default());
    };
    let mut settings = Settings::load(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    settings.recognized_sources = settings
        .recognized_sources
        .into_iter()
        .map(|known| {
            let joined = base.join(&known);
            fs::canonicalize(&joined).unwrap_or(joined)
        })
        .collect();
    Ok(settings)
}

fn split_olp(olp: &str) -> Vec<&str> {
    olp.split('/').filter(|segment| !segment.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use org_archive::ArchiveError;

    #[test]
    fn split_olp_ignores_empty_segments() {
        assert_eq!(split_olp("/Projects//Garden/"), ["Projects", "Garden"]);
        assert!(split_olp("").is_empty());
    }

    #[test]
    fn load_settings_without_config_is_default() {
        assert_eq!(load_settings(None).expect("settings"), Settings::default());
    }

    #[test]
    fn load_settings_resolves_sources_against_config_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let notes = tmp.path().join("notes");
        fs::create_dir_all(&notes).expect("mkdir notes");
        let config = tmp.path().join("archive.toml");
        fs::write(
            &config,
            "archive_file = \"/archive.org\"\nrecognized_sources = [\"notes\"]\n",
        )
        .expect("write config");

        let settings = load_settings(Some(&config)).expect("settings");

        assert_eq!(settings.archive_file, Some(PathBuf::from("/archive.org")));
        assert_eq!(
            settings.recognized_sources,
            vec![fs::canonicalize(&notes).expect("canonical notes")]
        );
    }

    #[test]
    fn archive_command_moves_subtree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let source = tmp.path().join("todo.org");
        fs::write(&source, "* Work\n** Report\ndraft\n* Home\n").expect("write source");

        handle_archive(ArchiveArgs {
            source: source.clone(),
            line: None,
            olp: Some("Work/Report".into()),
            archive_file: Some(PathBuf::from("%s_archive")),
            config: None,
            dry_run: false,
            json: false,
        })
        .expect("archive");

        let archive = tmp.path().join("todo.org_archive");
        assert_eq!(
            fs::read_to_string(&archive).expect("read archive"),
            "* Work\n** Report\ndraft\n"
        );
        assert_eq!(
            fs::read_to_string(&source).expect("read source"),
            "* Work\n* Home\n"
        );
    }

    #[test]
    fn dry_run_leaves_both_files_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let source = tmp.path().join("todo.org");
        let archive = tmp.path().join("archive.org");
        fs::write(&source, "* Work\n** Report\n").expect("write source");

        handle_archive(ArchiveArgs {
            source: source.clone(),
            line: Some(2),
            olp: None,
            archive_file: Some(archive.clone()),
            config: None,
            dry_run: true,
            json: false,
        })
        .expect("dry run");

        assert!(!archive.exists());
        assert_eq!(
            fs::read_to_string(&source).expect("read source"),
            "* Work\n** Report\n"
        );
    }

    #[test]
    fn archive_command_requires_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let source = tmp.path().join("todo.org");
        fs::write(&source, "* Work\n").expect("write source");

        let err = handle_archive(ArchiveArgs {
            source,
            line: Some(1),
            olp: None,
            archive_file: None,
            config: None,
            dry_run: false,
            json: false,
        })
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::MissingArchiveTarget)
        ));
    }

    #[test]
    fn archive_into_source_is_refused_even_on_dry_run() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let source = tmp.path().join("todo.org");
        fs::write(&source, "* Work\n** Report\n").expect("write source");

        for dry_run in [false, true] {
            let err = handle_archive(ArchiveArgs {
                source: source.clone(),
                line: Some(2),
                olp: None,
                archive_file: Some(PathBuf::from("%s")),
                config: None,
                dry_run,
                json: false,
            })
            .unwrap_err();

            assert!(matches!(
                err.downcast_ref::<ArchiveError>(),
                Some(ArchiveError::ArchiveIsSource(_))
            ));
        }
        assert_eq!(
            fs::read_to_string(&source).expect("read source"),
            "* Work\n** Report\n"
        );
    }

    #[test]
    fn archive_json_report_still_archives() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let source = tmp.path().join("todo.org");
        let archive = tmp.path().join("archive.org");
        fs::write(&source, "* Work\n** Report\n").expect("write source");

        handle_archive(ArchiveArgs {
            source: source.clone(),
            line: None,
            olp: Some("Work/Report".into()),
            archive_file: Some(archive.clone()),
            config: None,
            dry_run: false,
            json: true,
        })
        .expect("archive");

        assert_eq!(
            fs::read_to_string(&archive).expect("read archive"),
            "* Work\n** Report\n"
        );
        assert_eq!(fs::read_to_string(&source).expect("read source"), "* Work\n");
    }

    #[test]
    fn parse_json_reads_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("notes.org");
        fs::write(&input, "* A\nbody\n** B\n").expect("write input");

        handle_parse(ParseArgs { input, json: true }).expect("parse");
    }

    #[test]
    fn parse_reports_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("missing.org");

        assert!(handle_parse(ParseArgs { input, json: true }).is_err());
    }

    #[test]
    fn format_in_place_keeps_well_formed_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("notes.org");
        let text = "#+TITLE: Notes\n* A\nbody\n** B\n* C\n";
        fs::write(&input, text).expect("write input");

        handle_format(FormatArgs {
            input: input.clone(),
            in_place: true,
        })
        .expect("format");

        assert_eq!(fs::read_to_string(&input).expect("read input"), text);
    }

    #[test]
    fn format_in_place_normalizes_skipped_depths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("notes.org");
        fs::write(&input, "* A\n*** C\n").expect("write input");

        handle_format(FormatArgs {
            input: input.clone(),
            in_place: true,
        })
        .expect("format");

        assert_eq!(
            fs::read_to_string(&input).expect("read input"),
            "* A\n** C\n"
        );
    }
}
