use std::path::Path;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use graphport_export::{ExportOptions, ExportedGraph, PaddingPolicy, QuantizationTarget, export_model};
use log::{error, info};

/// Define the export subcommand.
fn export_subcommand() -> Command {
    Command::new("export")
        .about("Export a HuggingFace encoder model to a static graph bundled with its tokenizer")
        .arg(Arg::new("MODEL_DIR")
            .help("Path to the HuggingFace model directory (containing config.json, *.safetensors, tokenizer.json)")
            .required(true)
            .index(1))
        .arg(Arg::new("OUTPUT_DIR")
            .help("Directory receiving the graph file and tokenizer files")
            .required(true)
            .index(2))
        .arg(Arg::new("opset")
            .long("opset")
            .short('o')
            .help("Target operator set version")
            .value_name("N")
            .value_parser(clap::value_parser!(u32)))
        .arg(Arg::new("padding")
            .long("padding")
            .short('p')
            .help("Padding policy: none|longest-in-batch|fixed-length [default: longest-in-batch]")
            .value_name("POLICY"))
        .arg(Arg::new("max-length")
            .long("max-length")
            .short('l')
            .help("Sample length; required by fixed-length padding")
            .value_name("N")
            .value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("quantize")
            .long("quantize")
            .short('q')
            .help("Quantization target: disabled|int8 [default: disabled]")
            .value_name("TARGET"))
        .arg(Arg::new("strict")
            .long("strict")
            .help("Fail when a targeted layer cannot be quantized")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("sample")
            .long("sample")
            .short('s')
            .help("Sample text traced through the model; may be repeated")
            .value_name("TEXT")
            .action(ArgAction::Append))
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print the inputs, outputs and operators of a graph file")
        .arg(Arg::new("GRAPH_FILE")
            .help("Graph file written by the export command")
            .required(true)
            .index(1))
}

/// Run the export command with the provided arguments
fn run_export_command(matches: &ArgMatches) -> Result<()> {
    let model_dir = matches.get_one::<String>("MODEL_DIR").map(String::as_str).unwrap_or_default();
    let output_dir = matches.get_one::<String>("OUTPUT_DIR").map(String::as_str).unwrap_or_default();

    if !Path::new(model_dir).is_dir() {
        anyhow::bail!("Model directory does not exist: {model_dir}");
    }

    let max_length = matches.get_one::<usize>("max-length").copied();
    let padding = matches
        .get_one::<String>("padding")
        .map(|policy| PaddingPolicy::parse(policy, max_length))
        .transpose()?;
    let quantization = matches.get_one::<String>("quantize").map(|target| target.parse::<QuantizationTarget>()).transpose()?;

    let mut builder = ExportOptions::builder()
        .opset_version(matches.get_one::<u32>("opset").copied())
        .padding_policy(padding)
        .max_length(max_length)
        .quantization(quantization)
        .strict_quantization(Some(matches.get_flag("strict")));
    for text in matches.get_many::<String>("sample").into_iter().flatten() {
        builder = builder.sample_text(text);
    }
    let options = builder.build()?;

    info!("");
    info!("🚀 graphport exporter");
    info!("🔢 Opset: {}", options.opset_version);
    info!("🧮 Quantization: {}\n", options.quantization.target);

    let report = export_model(model_dir, output_dir, &options)?;
    info!("   • Inputs: {:?}", report.input_names);
    info!("   • Outputs: {:?}", report.output_names);

    Ok(())
}

/// Run the inspect command with the provided arguments
fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let graph_file = matches.get_one::<String>("GRAPH_FILE").map(String::as_str).unwrap_or_default();
    let metadata = ExportedGraph::read_metadata(Path::new(graph_file))?;

    info!("📄 {graph_file}");
    info!("   • Producer: {}", metadata.producer);
    info!("   • Opset: {}", metadata.opset);
    for input in &metadata.inputs {
        info!("   • Input {} {:?} {:?}", input.name, input.dtype, input.dims);
    }
    for output in &metadata.outputs {
        info!("   • Output {} {:?} {:?}", output.name, output.dtype, output.dims);
    }
    info!("   • Nodes: {}", metadata.nodes.len());
    info!("   • Initializers: {} ({} bytes)", metadata.initializers.len(), metadata.data_size());

    for (op_type, count) in metadata.op_histogram() {
        info!("     {op_type}: {count}");
    }

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("graphport")
        .about("graphport CLI: export transformer encoders to portable static graphs")
        .subcommand(export_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("export", matches)) => run_export_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
