//! # Graph-ΔSync CLI
//!
//! Command-line utilities for hashing, compressing, and debugging payloads.

use anyhow::{bail, Context, Result};
use graph_deltasync_core::GraphDelta;
use graph_deltasync_engine::compression::{decode_fresh, encode_fresh};
use graph_deltasync_engine::{CompressionConfig, DeltaCompressor};
use graph_deltasync_proto::{CompressedDelta, Encoding};
use serde_json::Value;
use std::env;
use std::io::Read;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "hash" => {
            let path = required(&args, 2, "graph-deltasync hash <delta.json|->")?;
            let delta = GraphDelta::from_json(&read_input(path)?).context("Failed to parse delta")?;
            println!("{}", delta.content_hash());
        }
        "compress" => {
            let binary = args.iter().any(|a| a == "--binary");
            let path = args
                .iter()
                .skip(2)
                .find(|a| *a != "--binary")
                .map_or("-", String::as_str);
            let value: Value = serde_json::from_str(&read_input(path)?).context("Failed to parse JSON")?;
            let encoding = if binary { Encoding::Binary } else { Encoding::Minified };
            let compressed = encode_fresh(encoding, &value)?;
            eprintln!(
                "{} -> {} bytes ({:?})",
                compressed.original_size, compressed.compressed_size, compressed.encoding
            );
            println!("{}", serde_json::to_string(&compressed)?);
        }
        "decompress" => {
            let path = required(&args, 2, "graph-deltasync decompress <compressed.json|->")?;
            let compressed: CompressedDelta =
                serde_json::from_str(&read_input(path)?).context("Failed to parse compressed payload")?;
            let value = decode_fresh(&compressed).context("Failed to decompress")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        "diff" => {
            let base_path = required(&args, 2, "graph-deltasync diff <base.json> <next.json>")?;
            let next_path = required(&args, 3, "graph-deltasync diff <base.json> <next.json>")?;
            let base: Value = serde_json::from_str(&read_input(base_path)?).context("Failed to parse base")?;
            let next: Value = serde_json::from_str(&read_input(next_path)?).context("Failed to parse next")?;

            let mut sender = DeltaCompressor::new(CompressionConfig::default());
            let mut receiver = DeltaCompressor::new(CompressionConfig::default());
            let first = sender.compress_value("cli", base)?;
            let second = sender.compress_value("cli", next.clone())?;

            receiver.decompress_value("cli", &first)?;
            let restored = receiver.decompress_value("cli", &second)?;
            if restored != next {
                bail!("Round trip through {:?} did not restore the input", second.encoding);
            }

            eprintln!(
                "{} -> {} bytes ({:?})",
                second.original_size, second.compressed_size, second.encoding
            );
            println!("{}", serde_json::to_string(&second)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(arg) => Ok(arg),
        None => bail!("Usage: {usage}"),
    }
}

/// Read a file, or stdin for `-`.
fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read stdin")?;
        return Ok(input);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))
}

fn print_help() {
    println!(
        r#"Graph-ΔSync CLI

USAGE:
    graph-deltasync <COMMAND> [OPTIONS]

COMMANDS:
    hash <delta>                 Print the content hash of a delta
    compress [--binary] <json>   Encode a JSON value (minified, or CBOR+base64)
    decompress <compressed>      Decode a compressed payload
    diff <base> <next>           Encode <next> against <base> and verify the round trip
    help                         Show this help message

Paths may be '-' to read from stdin.

EXAMPLES:
    graph-deltasync hash delta.json
    graph-deltasync compress --binary state.json > state.cmp
    graph-deltasync decompress state.cmp
"#
    );
}
