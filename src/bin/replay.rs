//! colab-replay: print the buffer tree stored for a workspace.
//!
//! Usage:
//!   colab-replay 42                        # Paths, ids and fingerprints
//!   colab-replay --data-dir /srv/ws 42     # Non-default data directory
//!   colab-replay --content 42              # Also dump utf8 contents

use clap::Parser;
use colab_sync::buffer::Encoding;
use colab_sync::cli::{init_tracing, ReplayArgs};
use colab_sync::fingerprint::Fingerprint;
use colab_sync::storage::{RedbStore, RedbStoreOpener, WorkspaceStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ReplayArgs::parse();
    init_tracing(args.log.as_deref());

    let path = RedbStoreOpener::new(&args.data_dir).path_for(args.workspace);
    if !path.exists() {
        return Err(format!("no database for workspace {} at {}", args.workspace, path.display()).into());
    }
    let store = RedbStore::open(&path)?;

    let version = store.get_meta("version").await?.unwrap_or_else(|| "0".into());
    println!("workspace {} (version {})", args.workspace, version);

    let mut records = store.records().await?;
    records.sort_by(|a, b| a.path.cmp(&b.path));

    let mut mismatches = 0;
    for record in &records {
        let content = match store.load(record.id).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                println!("{:>6}  {}  <load failed: {}>", record.id, record.path, e);
                mismatches += 1;
                continue;
            }
        };
        let actual = Fingerprint::of(&content);
        let mark = if actual == record.md5 { "" } else { "  MISMATCH" };
        if actual != record.md5 {
            mismatches += 1;
            tracing::warn!(
                "Buffer {} ({}) stored md5 {} but content hashes to {}",
                record.id,
                record.path,
                record.md5,
                actual
            );
        }
        println!(
            "{:>6}  {}  {}  {} bytes  {}{}",
            record.id,
            record.md5,
            record.encoding,
            content.len(),
            record.path,
            mark
        );
        if args.content && record.encoding == Encoding::Utf8 {
            println!("{}", String::from_utf8_lossy(&content));
        }
    }

    println!("{} buffers, {} mismatched", records.len(), mismatches);
    if mismatches > 0 {
        std::process::exit(2);
    }
    Ok(())
}
