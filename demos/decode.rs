use std::env;
use tivodec::config;
use tivodec::utils::PrefetchReader;
use tivodec::{decode, DecodeOptions};
use tokio::fs::File as AsyncFile;
use tokio::io::BufWriter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let mut args = env::args().skip(1);
    let input_path = args.next().unwrap_or_else(|| "./show.TiVo".to_string());
    let output_path = args.next().unwrap_or_else(|| "./show.mpg".to_string());
    let compatibility_mode = args.next().as_deref() == Some("--compat");

    let Some(mak) = config::resolve_mak() else {
        eprintln!("no MAK configured: set TIVODEC_MAK or add mak = \"...\" to config.toml");
        std::process::exit(1);
    };
    println!("Decoding {} -> {}", input_path, output_path);

    let input_file = AsyncFile::open(&input_path).await?;
    let reader = PrefetchReader::spawn(input_file);

    let output_file = AsyncFile::create(&output_path).await?;
    let writer = BufWriter::with_capacity(64 * 1024, output_file);

    decode(
        reader,
        writer,
        &mak,
        DecodeOptions { compatibility_mode },
    )
    .await?;

    println!("Done.");
    Ok(())
}
