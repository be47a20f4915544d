#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use snap_dict::demo::run_snapshot_isolation_demo;
use snap_harness::{StressConfig, run_stress};
use std::env;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("stress") => run_stress_cmd(&args[1..]),
        Some("demo") => {
            let result = run_snapshot_isolation_demo().context("demo run failed")?;
            for line in result.output_lines() {
                println!("{line}");
            }
            if !result.isolated {
                bail!("snapshot isolation demo failed");
            }
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_stress_cmd(args: &[String]) -> Result<()> {
    let mut config = StressConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = args
            .get(index + 1)
            .with_context(|| format!("{flag} requires a value"))?;
        match flag {
            "--seed" => config.seed = raw.parse().context("invalid --seed value")?,
            "--rounds" => config.rounds = raw.parse().context("invalid --rounds value")?,
            "--readers" => {
                config.reader_threads = raw.parse().context("invalid --readers value")?;
            }
            "--keys" => config.keys = raw.parse().context("invalid --keys value")?,
            "--abort-every" => {
                config.abort_every = raw.parse().context("invalid --abort-every value")?;
            }
            "--collect-delta" => {
                config.collect_min_gen_delta =
                    raw.parse().context("invalid --collect-delta value")?;
            }
            other => bail!("unknown stress option: {other}"),
        }
        index += 2;
    }

    let report = run_stress(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!(
            "stress run found {} violation(s) with seed {}",
            report.violations.len(),
            report.seed
        );
    }
    Ok(())
}

fn print_usage() {
    println!("snap-harness: stress runs and demos for the snapshot dictionary");
    println!();
    println!("USAGE:");
    println!(
        "  snap-harness stress [--seed S] [--rounds N] [--readers N] [--keys N] [--abort-every N] [--collect-delta N]"
    );
    println!("  snap-harness demo");
}
