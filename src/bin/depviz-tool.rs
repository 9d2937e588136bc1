//! Command-line front end: read a raw dependency graph document, build
//! the hierarchy, and print the render graph as JSON.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use depviz_graph::errors::GraphError;
use depviz_graph::graph::{BuildParams, RawGraph, SeriesGrouping};
use depviz_graph::hierarchy::HierarchyParams;
use depviz_graph::progress::LogTracker;
use depviz_graph::render::{RenderGraphInfo, RenderParams};
use ustr::ustr;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the raw graph JSON document, or `-` for stdin
    graph: PathBuf,

    /// Write the render graph here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Minimum members before a detected series is grouped
    #[arg(long, default_value_t = 5)]
    series_min_size: usize,

    /// Detect numeric runs anywhere in the name, not just `_N` suffixes
    #[arg(long)]
    generalized_series: bool,

    /// Series group names to force open, repeatable
    #[arg(long = "ungroup-series")]
    ungroup_series: Vec<String>,

    /// `op:index` pairs whose inputs pass data by reference, repeatable
    #[arg(long = "ref-edge", value_parser = parse_ref_edge)]
    ref_edges: Vec<(String, usize)>,

    /// Skip clutter extraction and keep every edge in the core graphs
    #[arg(long)]
    no_extraction: bool,

    /// Minimum group size before statistical degree extraction applies
    #[arg(long, default_value_t = 15)]
    min_node_count: usize,

    /// Minimum degree before the quartile rule may extract a node
    #[arg(long, default_value_t = 40)]
    min_degree: usize,

    /// Control edges per node beyond this become annotations
    #[arg(long, default_value_t = 4)]
    max_control_degree: usize,

    /// Annotations per node side before an ellipsis stands in
    #[arg(long, default_value_t = 5)]
    max_annotations: usize,

    /// Sink-like op types always extracted, repeatable
    #[arg(long = "out-extract-type", default_values_t = vec![String::from("NoOp")])]
    out_extract_types: Vec<String>,

    /// Source-like op types always extracted, repeatable
    #[arg(long = "in-extract-type")]
    in_extract_types: Vec<String>,

    /// Only build the root group instead of expanding everything
    #[arg(long)]
    root_only: bool,
}

fn parse_ref_edge(s: &str) -> Result<(String, usize), String> {
    match s.rsplit_once(':') {
        Some((op, index)) => {
            let index: usize = index
                .parse()
                .map_err(|_| format!("bad input index in ref edge '{}'", s))?;
            Ok((op.to_string(), index))
        }
        None => Err(format!("expected op:index, got '{}'", s)),
    }
}

fn init_logging() {
    // RUST_LOG is often exported empty by wrapper scripts; treat that the
    // same as unset.
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.is_empty() => EnvFilter::new(v),
        _ => EnvFilter::new("info"),
    };
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn read_raw_graph(path: &PathBuf) -> Result<RawGraph, GraphError> {
    let mut text = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        BufReader::new(File::open(path)?).read_to_string(&mut text)?;
    }
    let raw: RawGraph = serde_json::from_str(&text)?;
    Ok(raw)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    let raw = read_raw_graph(&args.graph)?;

    let build_params = BuildParams {
        ref_edges: args.ref_edges.iter().cloned().collect::<HashSet<_>>(),
    };
    let tracker = LogTracker;
    let graph = depviz_graph::graph::build(raw.node, &build_params, &tracker)?;

    let hierarchy_params = HierarchyParams {
        series_node_min_size: args.series_min_size,
        series_map: args
            .ungroup_series
            .iter()
            .map(|name| (ustr(name), SeriesGrouping::Ungroup))
            .collect(),
        use_generalized_series_patterns: args.generalized_series,
    };
    let hierarchy = depviz_graph::hierarchy::build(graph, &hierarchy_params, &tracker)?;

    let render_params = RenderParams {
        enable_extraction: !args.no_extraction,
        min_node_count_for_extraction: args.min_node_count,
        min_degree_for_extraction: args.min_degree,
        max_control_degree: args.max_control_degree,
        out_extract_types: args.out_extract_types,
        in_extract_types: args.in_extract_types,
        max_annotations: args.max_annotations,
        ..RenderParams::default()
    };
    let mut render = RenderGraphInfo::new(hierarchy, render_params)?;
    if !args.root_only {
        render.expand_all()?;
    }

    let value = render.to_json()?;
    match args.output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, &value)?;
            writer.write_all(b"\n")?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            serde_json::to_writer_pretty(&mut writer, &value)?;
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}
