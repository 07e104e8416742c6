//! Index statistics.
//!
//! Summarises what is stored: corpus chunk count, turn count of the
//! configured conversation, and the embedding model each index is bound to.
//! Used by `docchat stats`.

use crate::engine::Engine;
use crate::error::Result;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(engine: &Engine) -> Result<()> {
    let config = engine.config();
    let db_path = config.db_path();
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let corpus = engine.corpus().await?;
    let memory = engine.memory(None).await?;
    let bindings = engine.store().bindings().await?;

    println!("docchat index stats");
    println!("===================");
    println!();
    println!("  Database:      {}", db_path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Corpus chunks: {}", corpus.count().await?);
    println!(
        "  Conversation:  {} ({} turns)",
        memory.conversation(),
        memory.turn_count().await?
    );

    if !bindings.is_empty() {
        println!();
        println!("  {:<16} {:<28} {:>6}   {}", "INDEX", "MODEL", "DIMS", "FINGERPRINT");
        println!("  {}", "-".repeat(68));
        for (name, binding) in &bindings {
            let fingerprint = binding
                .fingerprint
                .as_deref()
                .map(|f| f.chars().take(12).collect::<String>())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<16} {:<28} {:>6}   {}",
                name, binding.model, binding.dims, fingerprint
            );
        }
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1_048_576), "5.0 MB");
    }
}
