//! WIREDKV - Segment-based Key-Value Storage Engine
//! Interactive shell over a segment store.
//!
//! Usage: `wiredkv [config.json]`

use std::io::{self, BufRead, Write};

use wiredkv::config::Config;
use wiredkv::engine::envelope::EncryptionKey;
use wiredkv::engine::SegmentStore;
use wiredkv::types::Tables;

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║          WIREDKV Storage Engine           ║");
    println!("  ║     Segment Key-Value Store v0.1.0        ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    put <segment> <json>  - Append tables, e.g. {{\"cart\":{{\"user-01\":\"3 items\"}}}}");
    println!("    get <segment>         - Print all tables of a segment");
    println!("    del <segment>         - Delete a segment");
    println!("    list                  - List segment keys");
    println!("    info                  - Show store statistics");
    println!("    keygen                - Print a fresh base64 encryption key");
    println!("    exit                  - Shutdown store");
    println!();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::from_json_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("[ERROR] {}", err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let store = match SegmentStore::open(config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("[ERROR] Failed to open store: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("wiredkv> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(err) => {
                eprintln!("[ERROR] {}", err);
                break;
            }
        }

        let line = line.trim();
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        if command.is_empty() {
            continue;
        }

        match command.to_lowercase().as_str() {
            "put" | "set" => {
                let (key, json) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if key.is_empty() || json.trim().is_empty() {
                    println!("  Usage: put <segment> <json>");
                    continue;
                }
                let result = Tables::from_json(json.trim())
                    .and_then(|tables| store.new_segment(key, tables, 0))
                    .and_then(|segment| store.put_segment(key, &segment));
                match result {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if rest.is_empty() {
                    println!("  Usage: get <segment>");
                    continue;
                }
                match store.fetch_segment(rest).and_then(|s| s.into_tables().to_json()) {
                    Ok(json) => println!("  {}", json),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if rest.is_empty() {
                    println!("  Usage: del <segment>");
                    continue;
                }
                match store.delete_segment(rest) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "list" | "scan" => {
                let keys = store.segment_keys();
                if keys.is_empty() {
                    println!("  (empty)");
                } else {
                    for key in &keys {
                        let len = store.segment_len(key).unwrap_or(0);
                        println!("  {} ({} bytes)", key, len);
                    }
                    println!("  ({} segments)", keys.len());
                }
            }
            "info" | "stats" => {
                println!("  Segments:  {}", store.len());
                println!("  Envelope:  {}", store.envelope_name());
                println!("  Data dir:  {:?}", store.config().data_dir);
                println!("{}", store.metrics().report());
            }
            "keygen" => {
                println!("  {}", EncryptionKey::generate().to_base64());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down WIREDKV...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", command);
            }
        }
    }
}
