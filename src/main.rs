use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use dexopt::rules::parser::{
    identify_blanket_native_rules, parse_file, remove_default_blocklisted_rules,
};
use dexopt::rules::{RuleDatabase, Stats};

/// CLI arguments for dexopt keep-rule processing.
#[derive(Parser, Debug)]
#[command(
    name = "dexopt",
    about = "Parse and post-process Android shrinker keep-rule configurations.",
    version
)]
struct Cli {
    /// Keep-rule configuration file(s), parsed in order.
    #[arg(long = "config", value_name = "PATH", required = true)]
    config: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

#[derive(Serialize)]
struct RunSummary {
    ok: bool,
    unknown_tokens: usize,
    unknown_commands: usize,
    parse_errors: usize,
    unimplemented: usize,
    keep_rules: usize,
    assume_no_side_effects_rules: usize,
    assume_values_rules: usize,
    why_are_you_keeping_rules: usize,
    includes: usize,
    blocklisted_rules_removed: usize,
    blanket_native_rules: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    for path in &cli.config {
        if !path.exists() {
            anyhow::bail!("config not found: {}", path.display());
        }
    }

    let started_at = Instant::now();
    let mut db = RuleDatabase::new();
    let mut stats = Stats::default();
    for path in &cli.config {
        stats += parse_file(path, &mut db);
    }
    let blocklisted_rules_removed = remove_default_blocklisted_rules(&mut db);
    let blanket_native_rules = identify_blanket_native_rules(&mut db);

    let summary = build_summary(&db, stats, blocklisted_rules_removed, blanket_native_rules);
    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &summary)
        .context("failed to serialize run summary")?;
    writer
        .write_all(b"\n")
        .context("failed to write run summary")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} files={} keep_rules={}",
            started_at.elapsed().as_millis(),
            cli.config.len(),
            summary.keep_rules
        );
    }

    Ok(())
}

fn build_summary(
    db: &RuleDatabase,
    stats: Stats,
    blocklisted_rules_removed: usize,
    blanket_native_rules: usize,
) -> RunSummary {
    RunSummary {
        ok: db.ok,
        unknown_tokens: stats.unknown_tokens,
        unknown_commands: stats.unknown_commands,
        parse_errors: stats.parse_errors,
        unimplemented: stats.unimplemented,
        keep_rules: db.keep_rules.len(),
        assume_no_side_effects_rules: db.assume_no_side_effects_rules.len(),
        assume_values_rules: db.assume_values_rules.len(),
        why_are_you_keeping_rules: db.why_are_you_keeping_rules.len(),
        includes: db.includes.len(),
        blocklisted_rules_removed,
        blanket_native_rules,
    }
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn run_writes_summary_for_a_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = dir.path().join("rules.pro");
        fs::write(
            &config,
            "-keep class com.Foo { public <init>(); }\n-keepnames class *\n",
        )
        .expect("write config");
        let output = dir.path().join("summary.json");

        let cli = Cli {
            config: vec![config],
            output: Some(output.clone()),
            quiet: true,
            timing: false,
        };
        run(cli).expect("run");

        let summary = fs::read_to_string(&output).expect("read summary");
        let value: serde_json::Value = serde_json::from_str(&summary).expect("valid json");
        assert_eq!(value["ok"], true);
        // The catch-all keepnames rule is on the internal blocklist.
        assert_eq!(value["keep_rules"], 1);
        assert_eq!(value["blocklisted_rules_removed"], 1);
    }

    #[test]
    fn run_fails_for_missing_config() {
        let cli = Cli {
            config: vec![PathBuf::from("/nonexistent/rules.pro")],
            output: None,
            quiet: true,
            timing: false,
        };
        assert!(run(cli).is_err());
    }
}
