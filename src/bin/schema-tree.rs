//! Schema Tree CLI
//!
//! Command-line interface for resolving schemas, inspecting built trees and
//! validating values.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use schema_tree::{compile, load_schema, load_schema_auto, NodeRef, SchemaTree};
use serde_json::{json, Value};
use tracing::Level;

#[derive(Parser)]
#[command(name = "schema-tree")]
#[command(about = "Build and inspect schema-driven node trees")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the schema with refs inlined and allOf resolved
    Merge {
        /// Schema source: file path, URL (http:// or https://), or - for stdin
        schema: String,

        /// Print the schema handed to the validator instead
        #[arg(long)]
        validation: bool,

        /// Output file (stdout if not specified)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Build a tree and print its projected value
    Inspect {
        /// Schema source: file path, URL (http:// or https://), or - for stdin
        schema: String,

        /// Initial value (schema defaults if not specified)
        #[arg(long)]
        value: Option<PathBuf>,

        /// List every node with its flags instead of the value
        #[arg(long)]
        nodes: bool,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Validate a value and print errors per node
    Validate {
        /// Schema source: file path, URL (http:// or https://), or - for stdin
        schema: String,

        /// Value file to validate
        value: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Merge {
            schema,
            validation,
            output,
            pretty,
        } => run_merge(&schema, validation, output, pretty),
        Commands::Inspect {
            schema,
            value,
            nodes,
            pretty,
        } => run_inspect(&schema, value, nodes, pretty),
        Commands::Validate {
            schema,
            value,
            json,
        } => run_validate(&schema, value, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_merge(
    schema_source: &str,
    validation: bool,
    output: Option<PathBuf>,
    pretty: bool,
) -> Result<(), u8> {
    let schema = load_schema_auto(schema_source).map_err(|e| {
        eprintln!("Error: {}", e);
        e.exit_code() as u8
    })?;

    let compiled = compile(&schema).map_err(|e| {
        eprintln!("Error [{}]: {}", e.code(), e);
        2u8
    })?;

    let out = if validation {
        &compiled.validation_schema
    } else {
        &compiled.resolved
    };
    let rendered = render(out, pretty)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &rendered).map_err(|e| {
                eprintln!("Error writing to {}: {}", path.display(), e);
                3u8
            })?;
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn run_inspect(
    schema_source: &str,
    value: Option<PathBuf>,
    nodes: bool,
    pretty: bool,
) -> Result<(), u8> {
    let tree = build_tree(schema_source, value.as_ref(), false)?;

    let out = if nodes {
        let mut listing = Vec::new();
        describe(&tree.root(), &mut listing);
        Value::Array(listing)
    } else {
        tree.value().unwrap_or(Value::Null)
    };
    println!("{}", render(&out, pretty)?);
    Ok(())
}

fn run_validate(schema_source: &str, value: PathBuf, json_output: bool) -> Result<(), u8> {
    let tree = build_tree(schema_source, Some(&value), json_output)?;

    let errors = tree.validate().map_err(|e| {
        report_error(json_output, &e.to_string());
        e.exit_code() as u8
    })?;

    if errors.is_empty() {
        if json_output {
            println!("{}", json!({ "valid": true }));
        } else {
            println!("Valid");
        }
        return Ok(());
    }

    if json_output {
        println!("{}", json!({ "valid": false, "errors": errors }));
    } else {
        eprintln!("Validation failed:");
        for error in &errors {
            eprintln!("  {}", error);
        }
    }
    Err(1)
}

/// Load schema and value, build the tree and drain its scheduler.
fn build_tree(
    schema_source: &str,
    value: Option<&PathBuf>,
    json_output: bool,
) -> Result<SchemaTree, u8> {
    let schema = load_schema_auto(schema_source).map_err(|e| {
        report_error(json_output, &format!("loading schema: {}", e));
        e.exit_code() as u8
    })?;

    let initial = match value {
        Some(path) => Some(load_schema(path).map_err(|e| {
            report_error(json_output, &format!("loading value: {}", e));
            e.exit_code() as u8
        })?),
        None => None,
    };

    let tree = SchemaTree::new(&schema, initial).map_err(|e| {
        report_error(json_output, &e.to_string());
        e.exit_code() as u8
    })?;

    tree.run_until_idle().map_err(|e| {
        report_error(json_output, &e.to_string());
        2u8
    })?;
    Ok(tree)
}

fn describe(node: &NodeRef, out: &mut Vec<Value>) {
    out.push(json!({
        "path": node.path().unwrap_or_default(),
        "variant": node.variant(),
        "type": node.schema_type().map(|t| t.as_str()),
        "active": node.is_active(),
        "visible": node.is_visible(),
        "readOnly": node.is_read_only(),
        "disabled": node.is_disabled(),
    }));
    for child in node.children() {
        describe(&child, out);
    }
}

fn render(value: &Value, pretty: bool) -> Result<String, u8> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| {
        eprintln!("Error serializing output: {}", e);
        2u8
    })
}

/// Output an error message in plain text or JSON format.
fn report_error(json_output: bool, msg: &str) {
    if json_output {
        println!("{}", json!({ "valid": false, "error": msg }));
    } else {
        eprintln!("Error: {}", msg);
    }
}
