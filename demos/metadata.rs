use std::env;
use tivodec::config;
use tivodec::decode_metadata;
use tokio::fs::File as AsyncFile;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let input_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "./show.TiVo".to_string());
    let Some(mak) = config::resolve_mak() else {
        eprintln!("no MAK configured: set TIVODEC_MAK or add mak = \"...\" to config.toml");
        std::process::exit(1);
    };

    let input_file = AsyncFile::open(&input_path).await?;
    let documents = decode_metadata(input_file, &mak).await?;

    println!("{} metadata chunks", documents.len());
    for (index, document) in documents.iter().enumerate() {
        println!("--- chunk {} ({} bytes) ---", index, document.len());
        println!("{}", String::from_utf8_lossy(document));
    }
    Ok(())
}
