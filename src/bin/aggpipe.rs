//! CLI front end (A4): a thin adapter over the library surface in
//! [`aggpipe::collection`]. Reads newline-delimited JSON documents, runs a
//! pipeline against them once, and writes the result back out as JSONL (or
//! pretty-printed JSON with `--pretty`). No pipeline semantics live here —
//! only argument parsing, I/O, and formatting.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use aggpipe::collection::{aggregate, AggregateOptions};
use aggpipe::planner::{self, Route, StageSpec};
use aggpipe::value::Value;

/// Run a MongoDB-pipeline-shaped aggregation over a JSONL document stream.
#[derive(Parser, Debug)]
#[command(name = "aggpipe", version, about)]
struct Cli {
    /// Pipeline as a JSON array, e.g. '[{"$match": {"a": 1}}]'. Mutually
    /// exclusive with `--pipeline-file`.
    pipeline: Option<String>,

    /// Read the pipeline JSON array from a file instead of the positional
    /// argument.
    #[arg(long)]
    pipeline_file: Option<String>,

    /// Read input documents from this file instead of stdin. One JSON
    /// document per line.
    #[arg(long)]
    file: Option<String>,

    /// Pretty-print the output as a single indented JSON array instead of
    /// JSONL.
    #[arg(long)]
    pretty: bool,

    /// Print input size, compiled route, and elapsed time to stderr.
    #[arg(long)]
    stats: bool,

    /// Print the compiled plan's stage sequence and route decision to
    /// stderr before running.
    #[arg(long)]
    explain: bool,
}

fn read_input(file: Option<&str>) -> Result<Vec<Value>> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open input file '{path}'"))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut docs = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let json: serde_json::Value = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", line_no + 1))?;
        docs.push(Value::from_json(json));
    }
    Ok(docs)
}

fn read_pipeline(positional: Option<&str>, file: Option<&str>) -> Result<Vec<serde_json::Value>> {
    let raw = match (positional, file) {
        (Some(p), None) => p.to_string(),
        (None, Some(path)) => {
            let mut contents = String::new();
            File::open(path)
                .with_context(|| format!("failed to open pipeline file '{path}'"))?
                .read_to_string(&mut contents)
                .with_context(|| format!("failed to read pipeline file '{path}'"))?;
            contents
        }
        (Some(_), Some(_)) => {
            anyhow::bail!("pass the pipeline either positionally or via --pipeline-file, not both")
        }
        (None, None) => anyhow::bail!("a pipeline is required: pass it positionally or via --pipeline-file"),
    };
    let parsed: serde_json::Value =
        serde_json::from_str(&raw).context("pipeline argument is not valid JSON")?;
    let stages = parsed
        .as_array()
        .context("pipeline must be a JSON array of stage objects")?
        .clone();
    Ok(stages)
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    aggpipe::logging::init();

    let started = Instant::now();
    let docs = read_input(cli.file.as_deref())?;
    let pipeline = read_pipeline(cli.pipeline.as_deref(), cli.pipeline_file.as_deref())?;

    if cli.explain {
        let cache = aggpipe::expr::ExprCache::new();
        let sample: Vec<Value> = docs.iter().take(10).cloned().collect();
        let config = aggpipe::config::Config::load().unwrap_or_else(|_| aggpipe::config::Config::default_config());
        match planner::compile_plan(&pipeline, &cache, &sample, &config, &Default::default()) {
            Ok(plan) => {
                eprintln!("route: {}", describe_route(&plan.route));
                eprintln!("stages: {}", plan.stages.len());
                for (i, stage) in plan.stages.iter().enumerate() {
                    eprintln!("  [{i}] {}", describe_stage(stage));
                }
            }
            Err(e) => eprintln!("explain: failed to compile plan: {e}"),
        }
    }

    let input_count = docs.len();
    let out = aggregate(&docs, &pipeline, Some(AggregateOptions::default()))
        .context("pipeline evaluation failed")?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if cli.pretty {
        let json_docs: Vec<serde_json::Value> = out.iter().map(Value::to_json).collect();
        let rendered = serde_json::to_string_pretty(&json_docs)?;
        writeln!(handle, "{rendered}")?;
    } else {
        for doc in &out {
            writeln!(handle, "{}", serde_json::to_string(&doc.to_json())?)?;
        }
    }

    if cli.stats {
        eprintln!(
            "input: {input_count} docs, output: {} docs, elapsed: {:?}",
            out.len(),
            started.elapsed()
        );
    }

    Ok(())
}

fn describe_route(route: &Route) -> String {
    match route {
        Route::HotPath => "hot-path".to_string(),
        Route::Shim(reason) => format!("shim ({reason})"),
    }
}

fn describe_stage(stage: &StageSpec) -> &'static str {
    match stage {
        StageSpec::Fused(_) => "fused(match/project/addFields/unset)",
        StageSpec::Unwind(_) => "unwind",
        StageSpec::Lookup(..) => "lookup",
        StageSpec::Group(..) => "group",
        StageSpec::Sort(_) => "sort",
        StageSpec::TopK(..) => "topk(sort+limit)",
        StageSpec::Limit(_) => "limit",
        StageSpec::Skip(_) => "skip",
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
