//! # coedit CLI
//!
//! Command-line utilities for inspecting encoded updates and snapshots.

use anyhow::{bail, Context, Result};
use coedit_core::update::Operation;
use coedit_core::{ApplyOutcome, DocId, Document, Origin, ReplicaId, TypeKind, Update};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: coedit inspect <file>");
                std::process::exit(1);
            }
            let update = read_update(Path::new(&args[2]))?;
            inspect(&update)?;
        }
        "text" => {
            if args.len() < 3 {
                eprintln!("Usage: coedit text <file> [type]");
                std::process::exit(1);
            }
            let name = args.get(3).map_or("content", String::as_str);
            let doc = materialize(&read_update(Path::new(&args[2]))?)?;
            println!("{}", doc.text(name).context("Failed to read text type")?);
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

fn read_update(path: &Path) -> Result<Update> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Update::decode(&bytes).context("Failed to decode update")
}

fn materialize(update: &Update) -> Result<Document> {
    let mut doc = Document::new(DocId::new("inspect"), ReplicaId::from_u128(0));
    if let ApplyOutcome::Deferred { missing } = doc.apply_update(update, Origin::Remote)? {
        bail!(
            "update depends on {} operations it does not contain (first: {})",
            missing.len(),
            missing[0]
        );
    }
    Ok(doc)
}

fn inspect(update: &Update) -> Result<()> {
    let mut per_type: BTreeMap<&str, [usize; 3]> = BTreeMap::new();
    for record in update.records() {
        let counts = per_type.entry(record.parent.as_str()).or_default();
        match record.op {
            Operation::Insert { .. } => counts[0] += 1,
            Operation::Delete { .. } => counts[1] += 1,
            Operation::MapSet { .. } => counts[2] += 1,
        }
    }

    println!("records: {}", update.len());
    println!("state vector:");
    for (replica, clock) in update.state_vector().iter() {
        println!("    {replica}  {clock}");
    }
    println!("operations:");
    for (name, [inserts, deletes, writes]) in &per_type {
        println!("    {name:<16} inserts={inserts} deletes={deletes} map-writes={writes}");
    }

    let Ok(doc) = materialize(update) else {
        println!("(incremental update: dependencies missing, contents not shown)");
        return Ok(());
    };
    println!("types:");
    for name in doc.type_names() {
        match doc.kind_of(name) {
            Some(TypeKind::Text) => println!("    {name} (text): {:?}", doc.text(name)?),
            Some(TypeKind::Array) => println!(
                "    {name} (array): {}",
                serde_json::Value::Array(doc.array(name)?)
            ),
            Some(TypeKind::Map) => println!(
                "    {name} (map): {}",
                serde_json::Value::Object(doc.map_entries(name)?.into_iter().collect())
            ),
            None => {}
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"coedit CLI

USAGE:
    coedit <COMMAND> [OPTIONS]

COMMANDS:
    inspect <file>       Summarize an encoded update or snapshot
    text <file> [type]   Print a text type of a snapshot (default: content)
    help                 Show this help message

EXAMPLES:
    coedit inspect notes.snapshot
    coedit text notes.snapshot content
"#
    );
}
